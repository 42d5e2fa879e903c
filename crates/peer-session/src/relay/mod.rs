//! Signaling relay and media call abstraction
//!
//! The session manager drives calls through these traits. A relay connection
//! delivers its events on a single ordered channel; each call delivers its
//! own events on a second one.

pub mod protocol;
pub mod rtc;
pub mod websocket;

pub use websocket::WebSocketRelay;

use crate::media::{LocalTrack, MediaStream, RemoteStream};
use crate::Result;
use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Kind of error reported by the relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelayErrorKind {
    /// Lost or failed connection to the relay server
    Network,
    /// The relay server reported an internal error
    ServerError,
    /// The requested peer id is already in use
    UnavailableId,
    /// The requested peer id is malformed
    InvalidId,
    /// The relay key was rejected
    InvalidKey,
    /// TLS is required but unavailable
    SslUnavailable,
    /// The remote peer is not connected to the relay
    PeerUnavailable,
    /// Socket-level failure
    SocketError,
    /// The socket was closed unexpectedly
    SocketClosed,
    /// Anything else
    Other,
}

impl RelayErrorKind {
    /// Wire name of this kind
    pub fn as_str(&self) -> &'static str {
        match self {
            RelayErrorKind::Network => "network",
            RelayErrorKind::ServerError => "server-error",
            RelayErrorKind::UnavailableId => "unavailable-id",
            RelayErrorKind::InvalidId => "invalid-id",
            RelayErrorKind::InvalidKey => "invalid-key",
            RelayErrorKind::SslUnavailable => "ssl-unavailable",
            RelayErrorKind::PeerUnavailable => "peer-unavailable",
            RelayErrorKind::SocketError => "socket-error",
            RelayErrorKind::SocketClosed => "socket-closed",
            RelayErrorKind::Other => "other",
        }
    }

    /// Errors that trigger the reconnect schedule
    pub fn is_retryable(&self) -> bool {
        matches!(self, RelayErrorKind::Network | RelayErrorKind::ServerError)
    }

    /// Errors that end the session without retrying
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RelayErrorKind::UnavailableId
                | RelayErrorKind::InvalidId
                | RelayErrorKind::InvalidKey
                | RelayErrorKind::SslUnavailable
        )
    }
}

impl fmt::Display for RelayErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RelayErrorKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s {
            "network" => RelayErrorKind::Network,
            "server-error" => RelayErrorKind::ServerError,
            "unavailable-id" => RelayErrorKind::UnavailableId,
            "invalid-id" => RelayErrorKind::InvalidId,
            "invalid-key" => RelayErrorKind::InvalidKey,
            "ssl-unavailable" => RelayErrorKind::SslUnavailable,
            "peer-unavailable" => RelayErrorKind::PeerUnavailable,
            "socket-error" => RelayErrorKind::SocketError,
            "socket-closed" => RelayErrorKind::SocketClosed,
            _ => RelayErrorKind::Other,
        })
    }
}

/// Error reported by the relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayError {
    /// Error kind
    pub kind: RelayErrorKind,
    /// Human readable message
    pub message: String,
}

impl RelayError {
    /// Create a relay error
    pub fn new(kind: RelayErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.kind)
    }
}

/// Event on a relay connection
pub enum RelayEvent {
    /// The relay accepted our id
    Open(String),
    /// The relay connection dropped
    Disconnected,
    /// The relay reported an error
    Error(RelayError),
    /// A remote peer is calling us
    Call(CallLink),
}

impl fmt::Debug for RelayEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayEvent::Open(id) => f.debug_tuple("Open").field(id).finish(),
            RelayEvent::Disconnected => f.write_str("Disconnected"),
            RelayEvent::Error(e) => f.debug_tuple("Error").field(e).finish(),
            RelayEvent::Call(link) => f
                .debug_tuple("Call")
                .field(&link.call.remote_id())
                .finish(),
        }
    }
}

/// Event on a single media call
#[derive(Debug, Clone)]
pub enum CallEvent {
    /// Remote media arrived
    Stream(RemoteStream),
    /// The call was closed
    Close,
    /// The call failed
    Error(String),
}

/// Open relay connection with its ordered event stream
pub struct RelayLink {
    /// Connection handle
    pub connection: Arc<dyn RelayConnection>,
    /// Connection events, in emission order
    pub events: mpsc::UnboundedReceiver<RelayEvent>,
}

/// Media call with its event stream
pub struct CallLink {
    /// Call handle
    pub call: Arc<dyn MediaCall>,
    /// Call events, in emission order
    pub events: mpsc::UnboundedReceiver<CallEvent>,
}

/// Factory for relay connections
#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// Open a relay connection registered as `local_id`
    ///
    /// Resolving only means the socket is up; the relay confirms the id with
    /// [`RelayEvent::Open`].
    async fn connect(&self, local_id: &str) -> Result<RelayLink>;
}

/// Live relay connection
#[async_trait]
pub trait RelayConnection: Send + Sync {
    /// Place an outbound call sending `stream`
    async fn call(&self, remote_id: &str, stream: &MediaStream) -> Result<CallLink>;

    /// Close the connection and every call on it
    async fn close(&self);
}

/// Two-party media call
#[async_trait]
pub trait MediaCall: Send + Sync {
    /// Call id
    fn id(&self) -> &str;

    /// Id of the remote peer
    fn remote_id(&self) -> &str;

    /// Answer an inbound call sending `stream`
    async fn answer(&self, stream: &MediaStream) -> Result<()>;

    /// Replace the outbound video track on the existing sender
    ///
    /// Fails with `NoActiveCallTrack` when the call has no video sender.
    async fn replace_video_track(&self, track: &LocalTrack) -> Result<()>;

    /// Id of the local track currently sent as video
    fn outbound_video_track_id(&self) -> Option<String>;

    /// Close the call
    async fn close(&self);
}
