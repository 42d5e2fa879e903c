//! Peer session test harness
//!
//! Provides a scripted in-memory relay for integration tests:
//! - `MockRelay`: counts connects, can fail them or pre-queue events
//! - `MockConnection`: emits relay events on demand
//! - `MockCall`: records answers and video replacements
//!
//! Basic usage pattern:
//!
//! 1. Create a `Harness` (optionally around a configured `MockRelay`)
//! 2. Drive the session or a `CallController` built from it
//! 3. Inject relay and call events through the mock handles
//! 4. Assert on session events, statuses and recorded calls

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use peer_session::media::{LocalTrack, MediaStream, RemoteStream};
use peer_session::relay::{
    CallEvent, CallLink, MediaCall, RelayConnection, RelayError, RelayErrorKind, RelayEvent,
    RelayLink, RelayTransport,
};
use peer_session::{
    CallController, CallStatus, ConnectionStatus, DeviceManager, Error, EventChannel,
    PeerSessionManager, Result, SessionConfig, SessionEvent, SyntheticBackend,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tracing_subscriber::EnvFilter;

/// Default wait for harness assertions
pub const WAIT: Duration = Duration::from_secs(120);

/// Event queued on a connection before `connect` returns
#[derive(Debug, Clone)]
pub enum Scripted {
    Open,
    Disconnected,
    Error(RelayErrorKind, &'static str),
}

/// Per-call behavior of mock calls
#[derive(Debug, Clone, Copy)]
pub struct MockCallOptions {
    /// Deliver a remote stream once the call is answered (inbound) or placed (outbound)
    pub stream_on_connect: bool,
    /// The call exposes an outbound video sender
    pub video_sender: bool,
}

impl Default for MockCallOptions {
    fn default() -> Self {
        Self {
            stream_on_connect: true,
            video_sender: true,
        }
    }
}

impl MockCallOptions {
    pub fn silent() -> Self {
        Self {
            stream_on_connect: false,
            ..Self::default()
        }
    }

    pub fn without_video_sender() -> Self {
        Self {
            video_sender: false,
            ..Self::default()
        }
    }
}

/// Recording media call
pub struct MockCall {
    id: String,
    remote_id: String,
    options: MockCallOptions,
    events: mpsc::UnboundedSender<CallEvent>,
    answered_with: Mutex<Option<String>>,
    outbound_video: Mutex<Option<String>>,
    replaced: Mutex<Vec<String>>,
    closed: AtomicBool,
}

impl MockCall {
    fn create(remote_id: &str, options: MockCallOptions) -> (Arc<Self>, CallLink) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let call = Arc::new(Self {
            id: format!("mc_{}", uuid::Uuid::new_v4().simple()),
            remote_id: remote_id.to_string(),
            options,
            events,
            answered_with: Mutex::new(None),
            outbound_video: Mutex::new(None),
            replaced: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        let link = CallLink {
            call: Arc::clone(&call) as Arc<dyn MediaCall>,
            events: events_rx,
        };
        (call, link)
    }

    fn bind_stream(&self, stream: &MediaStream) {
        if self.options.video_sender {
            *self.outbound_video.lock() = stream.video_track().map(|t| t.id().to_string());
        }
    }

    /// Deliver a remote stream
    pub fn send_stream(&self) {
        let stream = RemoteStream::new(format!("remote-{}", self.id), self.remote_id.clone());
        let _ = self.events.send(CallEvent::Stream(stream));
    }

    /// Remote side hangs up
    pub fn remote_hangup(&self) {
        let _ = self.events.send(CallEvent::Close);
    }

    /// Media transport failure
    pub fn fail(&self, message: &str) {
        let _ = self.events.send(CallEvent::Error(message.to_string()));
    }

    /// Stream id the call was answered with
    pub fn answered_with(&self) -> Option<String> {
        self.answered_with.lock().clone()
    }

    /// Video track ids passed to `replace_video_track`
    pub fn replaced(&self) -> Vec<String> {
        self.replaced.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MediaCall for MockCall {
    fn id(&self) -> &str {
        &self.id
    }

    fn remote_id(&self) -> &str {
        &self.remote_id
    }

    async fn answer(&self, stream: &MediaStream) -> Result<()> {
        *self.answered_with.lock() = Some(stream.id().to_string());
        self.bind_stream(stream);
        if self.options.stream_on_connect {
            self.send_stream();
        }
        Ok(())
    }

    async fn replace_video_track(&self, track: &LocalTrack) -> Result<()> {
        if !self.options.video_sender {
            return Err(Error::NoActiveCallTrack);
        }
        *self.outbound_video.lock() = Some(track.id().to_string());
        self.replaced.lock().push(track.id().to_string());
        Ok(())
    }

    fn outbound_video_track_id(&self) -> Option<String> {
        self.outbound_video.lock().clone()
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.events.send(CallEvent::Close);
        }
    }
}

/// Scripted relay connection
pub struct MockConnection {
    local_id: String,
    events: mpsc::UnboundedSender<RelayEvent>,
    calls: Mutex<Vec<Arc<MockCall>>>,
    outbound: MockCallOptions,
    call_delay: Option<Duration>,
    closed: AtomicBool,
}

impl MockConnection {
    pub fn local_id(&self) -> &str {
        &self.local_id
    }

    pub fn emit(&self, event: RelayEvent) {
        let _ = self.events.send(event);
    }

    pub fn open(&self) {
        self.emit(RelayEvent::Open(self.local_id.clone()));
    }

    /// The relay socket drops
    pub fn drop_connection(&self) {
        self.emit(RelayEvent::Disconnected);
    }

    pub fn error(&self, kind: RelayErrorKind, message: &str) {
        self.emit(RelayEvent::Error(RelayError::new(kind, message)));
    }

    /// A remote peer calls us
    pub fn incoming_call(&self, remote_id: &str, options: MockCallOptions) -> Arc<MockCall> {
        let (call, link) = MockCall::create(remote_id, options);
        self.calls.lock().push(Arc::clone(&call));
        self.emit(RelayEvent::Call(link));
        call
    }

    /// Calls placed or received on this connection
    pub fn calls(&self) -> Vec<Arc<MockCall>> {
        self.calls.lock().clone()
    }

    pub fn last_call(&self) -> Option<Arc<MockCall>> {
        self.calls.lock().last().cloned()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RelayConnection for MockConnection {
    async fn call(&self, remote_id: &str, stream: &MediaStream) -> Result<CallLink> {
        if self.is_closed() {
            return Err(Error::NotConnected);
        }
        if let Some(delay) = self.call_delay {
            tokio::time::sleep(delay).await;
        }
        let (call, link) = MockCall::create(remote_id, self.outbound);
        call.bind_stream(stream);
        if self.outbound.stream_on_connect {
            call.send_stream();
        }
        self.calls.lock().push(call);
        Ok(link)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let calls = self.calls.lock().clone();
        for call in calls {
            call.close().await;
        }
    }
}

struct MockRelayState {
    auto_open: bool,
    scripts: VecDeque<Vec<Scripted>>,
    fail_next: usize,
    fail_all: bool,
    connect_delay: Option<Duration>,
    call_delay: Option<Duration>,
    outbound: MockCallOptions,
    connections: Vec<Arc<MockConnection>>,
}

/// Scripted relay transport
pub struct MockRelay {
    state: Mutex<MockRelayState>,
    connects: watch::Sender<usize>,
    attempts: AtomicUsize,
}

impl MockRelay {
    /// Relay that confirms every connection immediately
    pub fn new() -> Self {
        let (connects, _) = watch::channel(0);
        Self {
            state: Mutex::new(MockRelayState {
                auto_open: true,
                scripts: VecDeque::new(),
                fail_next: 0,
                fail_all: false,
                connect_delay: None,
                call_delay: None,
                outbound: MockCallOptions::default(),
                connections: Vec::new(),
            }),
            connects,
            attempts: AtomicUsize::new(0),
        }
    }

    /// Relay that never confirms on its own
    pub fn manual() -> Self {
        let relay = Self::new();
        relay.state.lock().auto_open = false;
        relay
    }

    /// Queue `events` on the next connection instead of the automatic open
    pub fn script_next(&self, events: Vec<Scripted>) {
        self.state.lock().scripts.push_back(events);
    }

    /// Fail the next `n` connects
    pub fn fail_next_connects(&self, n: usize) {
        self.state.lock().fail_next = n;
    }

    /// Fail every connect from now on
    pub fn fail_all_connects(&self) {
        self.state.lock().fail_all = true;
    }

    /// Stop failing connects
    pub fn accept_connects(&self) {
        let mut state = self.state.lock();
        state.fail_all = false;
        state.fail_next = 0;
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        self.state.lock().connect_delay = Some(delay);
    }

    pub fn set_call_delay(&self, delay: Duration) {
        self.state.lock().call_delay = Some(delay);
    }

    pub fn set_outbound_calls(&self, options: MockCallOptions) {
        self.state.lock().outbound = options;
    }

    /// Connect attempts, failed ones included
    pub fn connect_count(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Wait until at least `n` connect attempts were made
    pub async fn wait_for_connects(&self, n: usize) {
        let mut rx = self.connects.subscribe();
        tokio::time::timeout(WAIT, rx.wait_for(|count| *count >= n))
            .await
            .expect("timed out waiting for relay connects")
            .expect("relay dropped");
    }

    pub fn connections(&self) -> Vec<Arc<MockConnection>> {
        self.state.lock().connections.clone()
    }

    pub fn last_connection(&self) -> Arc<MockConnection> {
        self.state
            .lock()
            .connections
            .last()
            .cloned()
            .expect("no relay connection yet")
    }
}

#[async_trait]
impl RelayTransport for MockRelay {
    async fn connect(&self, local_id: &str) -> Result<RelayLink> {
        let delay = self.state.lock().connect_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let count = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        let result = {
            let mut state = self.state.lock();
            if state.fail_all || state.fail_next > 0 {
                state.fail_next = state.fail_next.saturating_sub(1);
                Err(Error::WebSocketError("connection refused".to_string()))
            } else {
                let (events, events_rx) = mpsc::unbounded_channel();
                let connection = Arc::new(MockConnection {
                    local_id: local_id.to_string(),
                    events,
                    calls: Mutex::new(Vec::new()),
                    outbound: state.outbound,
                    call_delay: state.call_delay,
                    closed: AtomicBool::new(false),
                });

                match state.scripts.pop_front() {
                    Some(script) => {
                        for event in script {
                            match event {
                                Scripted::Open => connection.open(),
                                Scripted::Disconnected => connection.drop_connection(),
                                Scripted::Error(kind, message) => connection.error(kind, message),
                            }
                        }
                    }
                    None if state.auto_open => connection.open(),
                    None => {}
                }

                state.connections.push(Arc::clone(&connection));
                Ok(RelayLink {
                    connection: connection as Arc<dyn RelayConnection>,
                    events: events_rx,
                })
            }
        };

        self.connects.send_replace(count);
        result
    }
}

/// Session components wired to a synthetic backend and a mock relay
pub struct Harness {
    pub config: SessionConfig,
    pub backend: Arc<SyntheticBackend>,
    pub relay: Arc<MockRelay>,
    pub events: EventChannel,
    pub devices: Arc<DeviceManager>,
    pub session: PeerSessionManager,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_relay(MockRelay::new())
    }

    pub fn with_relay(relay: MockRelay) -> Self {
        Self::build(
            SessionConfig::default(),
            Arc::new(SyntheticBackend::default()),
            relay,
        )
    }

    pub fn build(config: SessionConfig, backend: Arc<SyntheticBackend>, relay: MockRelay) -> Self {
        init_tracing();
        let events = EventChannel::default();
        let relay = Arc::new(relay);
        let devices = Arc::new(DeviceManager::new(
            Arc::clone(&backend) as Arc<dyn peer_session::MediaBackend>,
            &config,
            events.clone(),
        ));
        let session = PeerSessionManager::new(
            Arc::clone(&relay) as Arc<dyn RelayTransport>,
            Arc::clone(&devices),
            &config,
            events.clone(),
        );
        Self {
            config,
            backend,
            relay,
            events,
            devices,
            session,
        }
    }

    pub fn controller(&self) -> CallController {
        CallController::new(self.session.clone())
    }
}

/// Install a test-writer subscriber once; `RUST_LOG` overrides the filter
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Next session event, failing the test after `WAIT`
pub async fn next_event(rx: &mut broadcast::Receiver<SessionEvent>) -> SessionEvent {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for a session event")
        .expect("event channel closed")
}

/// Skip events until `pred` matches
pub async fn wait_for_event<F>(rx: &mut broadcast::Receiver<SessionEvent>, mut pred: F) -> SessionEvent
where
    F: FnMut(&SessionEvent) -> bool,
{
    loop {
        let event = next_event(rx).await;
        if pred(&event) {
            return event;
        }
    }
}

/// Events already delivered to `rx`
pub fn drain_events(rx: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Wait until the controller reaches `status`
pub async fn wait_for_status(controller: &CallController, status: CallStatus) {
    let mut rx = controller.subscribe();
    tokio::time::timeout(WAIT, rx.wait_for(|call| call.status == status))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for call status {status}"))
        .expect("call controller dropped");
}

/// Wait until the relay connection reaches `status`
pub async fn wait_for_connection(session: &PeerSessionManager, status: ConnectionStatus) {
    let mut rx = session.subscribe_status();
    tokio::time::timeout(WAIT, rx.wait_for(|s| *s == status))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for connection status {status}"))
        .expect("session dropped");
}

/// Let spawned tasks run
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}
