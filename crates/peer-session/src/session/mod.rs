//! Peer session lifecycle
//!
//! `PeerSessionManager` owns the relay connection, the local peer identity
//! and the reconnect schedule. Two counters guard asynchronous work:
//!
//! - the session epoch changes on `initialize` and `disconnect`; completions
//!   from an older epoch are discarded and their resources closed
//! - the link generation changes whenever the relay connection is replaced;
//!   events and timers from an older link are ignored

pub mod reconnect;

pub use reconnect::{ReconnectPolicy, ReconnectState};

use crate::config::SessionConfig;
use crate::device::DeviceManager;
use crate::events::{EventChannel, SessionEvent};
use crate::relay::{
    CallEvent, CallLink, MediaCall, RelayConnection, RelayErrorKind, RelayEvent, RelayLink,
    RelayTransport,
};
use crate::{Error, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

/// Relay connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionStatus {
    /// No relay connection
    Disconnected,
    /// Initial connection in progress
    Connecting,
    /// Relay open; calls may be placed
    Connected,
    /// Connection lost; a reconnect is scheduled or running
    Reconnecting,
    /// Reconnection gave up or the relay rejected us
    Failed,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionStatus::Disconnected => "DISCONNECTED",
            ConnectionStatus::Connecting => "CONNECTING",
            ConnectionStatus::Connected => "CONNECTED",
            ConnectionStatus::Reconnecting => "RECONNECTING",
            ConnectionStatus::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Local peer identity and its connection status
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerIdentity {
    /// Id registered with the relay
    pub local_id: String,
    /// Connection status
    pub connection_status: ConnectionStatus,
}

struct ActiveCall {
    call: Arc<dyn MediaCall>,
    token: u64,
    established: bool,
}

struct ManagerState {
    local_id: Option<String>,
    status: ConnectionStatus,
    link_gen: u64,
    connection: Option<Arc<dyn RelayConnection>>,
    event_loop: Option<JoinHandle<()>>,
    reconnect: ReconnectState,
    call: Option<ActiveCall>,
    call_seq: u64,
}

impl ManagerState {
    /// Set the status; returns it if it changed
    fn set_status(&mut self, status: ConnectionStatus) -> Option<ConnectionStatus> {
        if self.status == status {
            return None;
        }
        self.status = status;
        Some(status)
    }

    fn is_current_call(&self, token: u64) -> bool {
        self.call.as_ref().is_some_and(|c| c.token == token)
    }
}

struct Inner {
    transport: Arc<dyn RelayTransport>,
    devices: Arc<DeviceManager>,
    events: EventChannel,
    policy: ReconnectPolicy,
    epoch: AtomicU64,
    state: Mutex<ManagerState>,
    status_tx: watch::Sender<ConnectionStatus>,
}

/// Relay connection, peer identity and reconnection policy
///
/// Cloning shares the same session.
#[derive(Clone)]
pub struct PeerSessionManager {
    inner: Arc<Inner>,
}

impl PeerSessionManager {
    /// Create a session manager
    pub fn new(
        transport: Arc<dyn RelayTransport>,
        devices: Arc<DeviceManager>,
        config: &SessionConfig,
        events: EventChannel,
    ) -> Self {
        let (status_tx, _) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            inner: Arc::new(Inner {
                transport,
                devices,
                events,
                policy: ReconnectPolicy::from_config(config),
                epoch: AtomicU64::new(0),
                state: Mutex::new(ManagerState {
                    local_id: None,
                    status: ConnectionStatus::Disconnected,
                    link_gen: 0,
                    connection: None,
                    event_loop: None,
                    reconnect: ReconnectState::default(),
                    call: None,
                    call_seq: 0,
                }),
                status_tx,
            }),
        }
    }

    fn from_inner(inner: Arc<Inner>) -> Self {
        Self { inner }
    }

    fn weak(&self) -> Weak<Inner> {
        Arc::downgrade(&self.inner)
    }

    /// Event channel shared with the rest of the session
    pub fn events(&self) -> &EventChannel {
        &self.inner.events
    }

    /// Device manager used for local media
    pub fn devices(&self) -> &Arc<DeviceManager> {
        &self.inner.devices
    }

    /// Current relay connection status
    pub fn connection_status(&self) -> ConnectionStatus {
        self.inner.state.lock().status
    }

    /// Watch the relay connection status
    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Local identity, once `initialize` has been called
    pub fn identity(&self) -> Option<PeerIdentity> {
        let state = self.inner.state.lock();
        state.local_id.as_ref().map(|id| PeerIdentity {
            local_id: id.clone(),
            connection_status: state.status,
        })
    }

    /// Reconnect attempts since the last successful open
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.state.lock().reconnect.attempts
    }

    /// Whether a reconnect timer is pending
    pub fn has_pending_reconnect(&self) -> bool {
        self.inner.state.lock().reconnect.has_pending_timer()
    }

    /// Whether a call is active
    pub fn has_active_call(&self) -> bool {
        self.inner.state.lock().call.is_some()
    }

    fn current_epoch(&self) -> u64 {
        self.inner.epoch.load(Ordering::SeqCst)
    }

    fn is_current(&self, epoch: u64) -> bool {
        self.current_epoch() == epoch
    }

    fn publish_status(&self, changed: Option<ConnectionStatus>) {
        if let Some(status) = changed {
            debug!(%status, "Relay connection status changed");
            self.inner.status_tx.send_replace(status);
            self.inner
                .events
                .emit(SessionEvent::ConnectionStatusChanged(status));
        }
    }

    /// Connect to the relay as `local_id`
    ///
    /// Resolves once the relay confirms the id. Events the relay queued
    /// behind the confirmation are handled before returning.
    #[instrument(skip(self))]
    pub async fn initialize(&self, local_id: &str) -> Result<()> {
        let running = {
            let state = self.inner.state.lock();
            state.connection.is_some()
                || state.status != ConnectionStatus::Disconnected
                || state.call.is_some()
        };
        if running {
            self.disconnect().await;
        }

        self.inner.devices.ensure_initialized().await?;

        let epoch = self.inner.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let (gen, changed) = {
            let mut state = self.inner.state.lock();
            state.local_id = Some(local_id.to_string());
            state.reconnect.reset();
            state.link_gen += 1;
            (state.link_gen, state.set_status(ConnectionStatus::Connecting))
        };
        self.publish_status(changed);

        let RelayLink {
            connection,
            mut events,
        } = match self.inner.transport.connect(local_id).await {
            Ok(link) => link,
            Err(e) => {
                self.abort_connect(epoch);
                return Err(Error::RelayConnectFailed(e.to_string()));
            }
        };

        let mut early_calls = Vec::new();
        let opened = loop {
            match events.recv().await {
                Some(RelayEvent::Open(id)) => break Ok(id),
                Some(RelayEvent::Error(e)) => break Err(e.to_string()),
                Some(RelayEvent::Disconnected) | None => {
                    break Err("relay disconnected before open".to_string())
                }
                Some(RelayEvent::Call(link)) => early_calls.push(link),
            }
        };

        let id = match opened {
            Ok(id) => id,
            Err(message) => {
                for link in early_calls {
                    link.call.close().await;
                }
                connection.close().await;
                self.abort_connect(epoch);
                warn!(peer_id = local_id, "Relay connection failed: {}", message);
                return Err(Error::RelayConnectFailed(message));
            }
        };

        let accepted = {
            let mut state = self.inner.state.lock();
            let current = self.is_current(epoch) && state.link_gen == gen;
            if current {
                state.connection = Some(Arc::clone(&connection));
            }
            current
        };
        if !accepted {
            for link in early_calls {
                link.call.close().await;
            }
            connection.close().await;
            return Err(Error::SessionClosed);
        }
        info!(peer_id = %id, "Relay connection open");
        self.on_open(gen);

        for link in early_calls {
            self.on_relay_event(epoch, gen, RelayEvent::Call(link)).await;
        }
        while let Ok(event) = events.try_recv() {
            self.on_relay_event(epoch, gen, event).await;
        }

        self.spawn_event_loop(epoch, gen, events);
        Ok(())
    }

    fn abort_connect(&self, epoch: u64) {
        if !self.is_current(epoch) {
            return;
        }
        let changed = self
            .inner
            .state
            .lock()
            .set_status(ConnectionStatus::Disconnected);
        self.publish_status(changed);
    }

    fn spawn_event_loop(
        &self,
        epoch: u64,
        gen: u64,
        events: mpsc::UnboundedReceiver<RelayEvent>,
    ) {
        let handle = tokio::spawn(Self::run_event_loop(self.weak(), epoch, gen, events));
        let mut state = self.inner.state.lock();
        if state.link_gen == gen {
            if let Some(previous) = state.event_loop.replace(handle) {
                previous.abort();
            }
        } else {
            handle.abort();
        }
    }

    /// Relay event task: one per link, handles events in emission order
    async fn run_event_loop(
        weak: Weak<Inner>,
        epoch: u64,
        gen: u64,
        mut events: mpsc::UnboundedReceiver<RelayEvent>,
    ) {
        while let Some(event) = events.recv().await {
            let Some(inner) = weak.upgrade() else {
                break;
            };
            let manager = Self::from_inner(inner);
            if !manager.is_link_current(epoch, gen) {
                debug!(gen, "Dropping event from stale relay link");
                break;
            }
            manager.on_relay_event(epoch, gen, event).await;
        }
        debug!(gen, "Relay event loop ended");
    }

    fn is_link_current(&self, epoch: u64, gen: u64) -> bool {
        self.is_current(epoch) && self.inner.state.lock().link_gen == gen
    }

    async fn on_relay_event(&self, epoch: u64, gen: u64, event: RelayEvent) {
        if !self.is_link_current(epoch, gen) {
            if let RelayEvent::Call(link) = event {
                link.call.close().await;
            }
            return;
        }

        match event {
            RelayEvent::Open(_) => self.on_open(gen),
            RelayEvent::Disconnected => {
                warn!(gen, "Relay connection lost");
                self.on_connection_lost(epoch, gen).await;
            }
            RelayEvent::Error(e) if e.kind.is_retryable() => {
                warn!(kind = %e.kind, "Relay error: {}", e.message);
                self.on_connection_lost(epoch, gen).await;
            }
            RelayEvent::Error(e) if e.kind.is_fatal() => {
                error!(kind = %e.kind, "Fatal relay error: {}", e.message);
                self.fail(gen, e.message).await;
            }
            RelayEvent::Error(e) if e.kind == RelayErrorKind::PeerUnavailable => {
                warn!("Remote peer unavailable: {}", e.message);
                let call = self.take_call();
                if let Some(call) = call {
                    call.close().await;
                }
                self.inner.events.emit(SessionEvent::CallError(e.message));
            }
            RelayEvent::Error(e) => {
                warn!(kind = %e.kind, "Relay error: {}", e.message);
                self.inner.events.emit(SessionEvent::RelayError(e.to_string()));
            }
            RelayEvent::Call(link) => {
                info!(remote_id = link.call.remote_id(), "Answering incoming call");
                self.adopt_call(epoch, link, true).await;
            }
        }
    }

    fn on_open(&self, gen: u64) {
        let changed = {
            let mut state = self.inner.state.lock();
            if state.link_gen != gen {
                return;
            }
            state.reconnect.reset();
            state.set_status(ConnectionStatus::Connected)
        };
        self.publish_status(changed);
    }

    /// The link `gen` is gone: schedule a reconnect or give up
    async fn on_connection_lost(&self, epoch: u64, gen: u64) {
        let max = self.inner.policy.max_attempts;
        let (connection, outcome) = {
            let mut state = self.inner.state.lock();
            if state.link_gen != gen {
                return;
            }
            state.link_gen += 1;
            let connection = state.connection.take();

            if !self.inner.policy.should_retry(state.reconnect.attempts) {
                state.reconnect.cancel_timer();
                (connection, Err(state.set_status(ConnectionStatus::Failed)))
            } else {
                state.reconnect.attempts += 1;
                let attempt = state.reconnect.attempts;
                let delay = self.inner.policy.calculate_backoff(attempt);
                let next_gen = state.link_gen;

                state.reconnect.cancel_timer();
                let weak = self.weak();
                state.reconnect.pending_timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(inner) = weak.upgrade() {
                        Self::from_inner(inner).reconnect(epoch, next_gen).await;
                    }
                }));

                let changed = state.set_status(ConnectionStatus::Reconnecting);
                (connection, Ok((attempt, delay, changed)))
            }
        };

        match outcome {
            Ok((attempt, delay, changed)) => {
                // Dropped, not closed: the active call outlives the relay link.
                drop(connection);
                info!(
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Scheduling relay reconnect"
                );
                self.publish_status(changed);
                self.inner
                    .events
                    .emit(SessionEvent::Reconnecting { attempt, delay });
            }
            Err(changed) => {
                if let Some(connection) = connection {
                    connection.close().await;
                }
                error!(attempts = max, "Relay reconnection exhausted");
                self.publish_status(changed);
                self.inner.events.emit(SessionEvent::ConnectivityError(format!(
                    "Lost connection to the relay after {} reconnect attempts",
                    max
                )));
            }
        }
    }

    /// Terminal relay failure
    async fn fail(&self, gen: u64, message: String) {
        let (connection, changed) = {
            let mut state = self.inner.state.lock();
            if state.link_gen != gen {
                return;
            }
            state.link_gen += 1;
            state.reconnect.cancel_timer();
            (
                state.connection.take(),
                state.set_status(ConnectionStatus::Failed),
            )
        };
        if let Some(connection) = connection {
            connection.close().await;
        }
        self.publish_status(changed);
        self.inner
            .events
            .emit(SessionEvent::ConnectivityError(message));
    }

    /// Reconnect timer body
    fn reconnect(&self, epoch: u64, gen: u64) -> BoxFuture<'static, ()> {
        let manager = self.clone();
        async move {
            let local_id = {
                let mut state = manager.inner.state.lock();
                if !manager.is_current(epoch) || state.link_gen != gen {
                    return;
                }
                // This task is the pending timer; detach it before any reschedule.
                state.reconnect.pending_timer = None;
                match state.local_id.clone() {
                    Some(id) => id,
                    None => return,
                }
            };

            debug!(peer_id = %local_id, gen, "Reconnecting to relay");
            match manager.inner.transport.connect(&local_id).await {
                Ok(RelayLink { connection, events }) => {
                    let accepted = {
                        let mut state = manager.inner.state.lock();
                        let current = manager.is_current(epoch) && state.link_gen == gen;
                        if current {
                            state.connection = Some(Arc::clone(&connection));
                        }
                        current
                    };
                    if !accepted {
                        connection.close().await;
                        return;
                    }
                    manager.spawn_event_loop(epoch, gen, events);
                }
                Err(e) => {
                    warn!(peer_id = %local_id, "Relay reconnect failed: {}", e);
                    manager.on_connection_lost(epoch, gen).await;
                }
            }
        }
        .boxed()
    }

    /// Call `remote_id` with the local stream
    #[instrument(skip(self))]
    pub async fn make_call(&self, remote_id: &str) -> Result<()> {
        let epoch = self.current_epoch();
        let connection = {
            let state = self.inner.state.lock();
            if state.status != ConnectionStatus::Connected {
                return Err(Error::NotConnected);
            }
            state.connection.clone().ok_or(Error::NotConnected)?
        };

        let stream = self.inner.devices.get_local_stream().await?;
        let link = connection.call(remote_id, &stream).await?;

        if !self.is_current(epoch) {
            link.call.close().await;
            return Err(Error::SessionClosed);
        }
        info!(remote_id, call_id = link.call.id(), "Outbound call placed");
        self.adopt_call(epoch, link, false).await;
        Ok(())
    }

    /// Make `link` the active call and start its event task
    async fn adopt_call(&self, epoch: u64, link: CallLink, answer: bool) {
        let CallLink { call, events } = link;

        let (token, replaced) = {
            let mut state = self.inner.state.lock();
            state.call_seq += 1;
            let token = state.call_seq;
            let replaced = state.call.replace(ActiveCall {
                call: Arc::clone(&call),
                token,
                established: false,
            });
            (token, replaced)
        };
        if let Some(previous) = replaced {
            debug!(call_id = previous.call.id(), "Replacing active call");
            previous.call.close().await;
        }
        self.inner.devices.attach_call(Arc::clone(&call));

        tokio::spawn(Self::run_call(self.weak(), epoch, token, call, events, answer));
    }

    /// Call event task
    async fn run_call(
        weak: Weak<Inner>,
        epoch: u64,
        token: u64,
        call: Arc<dyn MediaCall>,
        mut events: mpsc::UnboundedReceiver<CallEvent>,
        answer: bool,
    ) {
        if answer {
            let Some(manager) = weak.upgrade().map(Self::from_inner) else {
                call.close().await;
                return;
            };
            let answered = match manager.inner.devices.get_local_stream().await {
                Ok(stream) => call.answer(&stream).await,
                Err(e) => Err(e),
            };
            if !manager.is_current(epoch) {
                debug!(call_id = call.id(), "Discarding call answered after disconnect");
                call.close().await;
                return;
            }
            if let Err(e) = answered {
                warn!(call_id = call.id(), "Failed to answer call: {}", e);
                manager.end_call_with_error(token, &call, e.to_string()).await;
                return;
            }
        }

        while let Some(event) = events.recv().await {
            let Some(manager) = weak.upgrade().map(Self::from_inner) else {
                break;
            };
            if !manager.is_current(epoch) {
                break;
            }

            match event {
                CallEvent::Stream(stream) => {
                    let first = {
                        let mut state = manager.inner.state.lock();
                        match state.call.as_mut().filter(|c| c.token == token) {
                            Some(active) if !active.established => {
                                active.established = true;
                                true
                            }
                            _ => false,
                        }
                    };
                    if first {
                        info!(call_id = call.id(), remote_id = stream.peer_id(), "Remote stream available");
                        manager
                            .inner
                            .events
                            .emit(SessionEvent::RemoteStreamAvailable(stream));
                    }
                }
                CallEvent::Close => {
                    if manager.clear_call(token) {
                        info!(call_id = call.id(), "Call ended");
                        manager.inner.events.emit(SessionEvent::CallEnded);
                    }
                    return;
                }
                CallEvent::Error(message) => {
                    warn!(call_id = call.id(), "Call error: {}", message);
                    manager.end_call_with_error(token, &call, message).await;
                    return;
                }
            }
        }

        if let Some(manager) = weak.upgrade().map(Self::from_inner) {
            if manager.is_current(epoch) && manager.clear_call(token) {
                manager.inner.events.emit(SessionEvent::CallEnded);
            }
        }
    }

    async fn end_call_with_error(&self, token: u64, call: &Arc<dyn MediaCall>, message: String) {
        let cleared = self.clear_call(token);
        call.close().await;
        if cleared {
            self.inner.events.emit(SessionEvent::CallError(message));
        }
    }

    /// Forget call `token` if it is still the active one
    fn clear_call(&self, token: u64) -> bool {
        let mut state = self.inner.state.lock();
        if !state.is_current_call(token) {
            return false;
        }
        if let Some(active) = state.call.take() {
            self.inner.devices.detach_call(active.call.id());
        }
        true
    }

    fn take_call(&self) -> Option<Arc<dyn MediaCall>> {
        let active = self.inner.state.lock().call.take()?;
        self.inner.devices.detach_call(active.call.id());
        Some(active.call)
    }

    /// Tear the session down
    ///
    /// Cancels the reconnect timer, invalidates in-flight completions, closes
    /// the call and the relay connection and stops local media. Safe to call
    /// repeatedly.
    #[instrument(skip(self))]
    pub async fn disconnect(&self) {
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);

        let (connection, call, changed) = {
            let mut state = self.inner.state.lock();
            state.reconnect.reset();
            state.link_gen += 1;
            if let Some(event_loop) = state.event_loop.take() {
                event_loop.abort();
            }
            (
                state.connection.take(),
                state.call.take(),
                state.set_status(ConnectionStatus::Disconnected),
            )
        };

        self.inner.devices.clear_call();
        if let Some(active) = call {
            active.call.close().await;
        }
        self.inner.devices.release().await;
        if let Some(connection) = connection {
            connection.close().await;
        }

        if changed.is_some() {
            info!("Peer session disconnected");
        }
        self.publish_status(changed);
    }
}
