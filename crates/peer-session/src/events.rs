//! Session events delivered to the UI layer
//!
//! Events fan out over a `tokio::sync::broadcast` channel. Every subscriber
//! sees every event emitted after it subscribed, in emission order.

use crate::media::{Device, RemoteStream};
use crate::session::ConnectionStatus;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::trace;

/// Default capacity of the event channel
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Notification emitted by the session core
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A remote peer's media stream is ready to render (once per call)
    RemoteStreamAvailable(RemoteStream),
    /// The active call was closed
    CallEnded,
    /// The active call failed; the relay connection is unaffected
    CallError(String),
    /// The relay connection failed terminally; no more automatic retries
    ConnectivityError(String),
    /// Non-fatal relay error republished for display
    RelayError(String),
    /// Relay connection status changed
    ConnectionStatusChanged(ConnectionStatus),
    /// A reconnect attempt was scheduled
    Reconnecting {
        /// Attempt number, starting at 1
        attempt: u32,
        /// Delay before the attempt
        delay: Duration,
    },
    /// The cached device list was refreshed
    DevicesChanged(Vec<Device>),
}

impl SessionEvent {
    /// Short event name for logging
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::RemoteStreamAvailable(_) => "remoteStreamAvailable",
            SessionEvent::CallEnded => "callEnded",
            SessionEvent::CallError(_) => "callError",
            SessionEvent::ConnectivityError(_) => "connectivityError",
            SessionEvent::RelayError(_) => "relayError",
            SessionEvent::ConnectionStatusChanged(_) => "connectionStatusChanged",
            SessionEvent::Reconnecting { .. } => "reconnecting",
            SessionEvent::DevicesChanged(_) => "devicesChanged",
        }
    }
}

/// Typed event bus shared by the session components
#[derive(Debug, Clone)]
pub struct EventChannel {
    tx: broadcast::Sender<SessionEvent>,
}

impl Default for EventChannel {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventChannel {
    /// Create a channel buffering up to `capacity` events per subscriber
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to events emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.tx.subscribe()
    }

    /// Emit an event; returns how many subscribers received it
    pub fn emit(&self, event: SessionEvent) -> usize {
        trace!(event = event.name(), "Emitting session event");
        self.tx.send(event).unwrap_or(0)
    }

    /// Number of live subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
