//! Peer session lifecycle for two-party interviews
//!
//! Manages capture devices, a signaling relay connection with bounded
//! reconnection, and the state of one interviewer/interviewee call.
//!
//! # Features
//!
//! - **Device management**: permission pre-check, camera enumeration, one
//!   live capture stream, camera hot-swap during a call
//! - **Relay session**: PeerJS-compatible WebSocket signaling with
//!   exponential-backoff reconnection
//! - **Media calls**: WebRTC peer connections (Opus audio, VP8 video) with
//!   video track replacement on the existing sender
//! - **Typed events**: one broadcast channel for everything the UI needs
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │  UI layer                                            │
//! │  ↑ SessionEvent (broadcast)     ↓ start/end/retry    │
//! │  CallController (call state machine)                 │
//! │  ├─ PeerSessionManager (relay, identity, reconnect)  │
//! │  │   └─ RelayTransport → RelayConnection → MediaCall │
//! │  └─ DeviceManager (devices, local stream)            │
//! │      └─ MediaBackend (platform capture)              │
//! └──────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```
//! use peer_session::SessionConfig;
//!
//! let config = SessionConfig::default().with_reconnect(1000, 10000, 5);
//! assert!(config.validate().is_ok());
//! assert_eq!(config.max_reconnect_attempts, 5);
//! ```
//!
//! ## Async Usage
//!
//! ```no_run
//! use peer_session::{
//!     CallController, DeviceManager, EventChannel, PeerSessionManager, Role, SessionConfig,
//!     SyntheticBackend, WebSocketRelay,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> peer_session::Result<()> {
//! let config = SessionConfig::from_env()?;
//! let events = EventChannel::default();
//! let devices = Arc::new(DeviceManager::new(
//!     Arc::new(SyntheticBackend::default()),
//!     &config,
//!     events.clone(),
//! ));
//! let relay = Arc::new(WebSocketRelay::new(config.clone()));
//! let session = PeerSessionManager::new(relay, devices, &config, events);
//!
//! let controller = CallController::new(session);
//! controller.start_session(Role::Interviewer, "room-42", "room-42").await?;
//! # Ok(())
//! # }
//! ```

#![warn(clippy::all)]

pub mod call;
pub mod config;
pub mod device;
pub mod error;
pub mod events;
pub mod media;
pub mod relay;
pub mod session;

// Re-exports for public API
pub use call::{CallController, CallSession, CallStatus, Role};
pub use config::{IceServerConfig, SessionConfig};
pub use device::{DeviceList, DeviceManager, LocalMediaSession};
pub use error::{Error, Result};
pub use events::{EventChannel, SessionEvent};
pub use media::{
    Device, DeviceKind, LocalTrack, MediaBackend, MediaStream, PermissionState, RemoteStream,
    SyntheticBackend, TrackKind,
};
pub use relay::{RelayErrorKind, RelayTransport, WebSocketRelay};
pub use session::{ConnectionStatus, PeerIdentity, PeerSessionManager, ReconnectPolicy};

/// Get the version of this crate
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
