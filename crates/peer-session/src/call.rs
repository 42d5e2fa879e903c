//! Per-call state machine
//!
//! `CallController` drives one interview call on top of a
//! [`PeerSessionManager`]. The interviewer registers under the room id and
//! waits for the inbound call; the interviewee calls the room.
//!
//! ```text
//! IDLE -> WAITING | CONNECTING -> CONNECTED -> ENDED
//! any -> ERROR, ERROR -> CONNECTING (retry)
//! ```

use crate::events::SessionEvent;
use crate::media::RemoteStream;
use crate::session::{ConnectionStatus, PeerSessionManager};
use crate::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

/// Participant role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Hosts the room and waits for the call
    Interviewer,
    /// Calls the room
    Interviewee,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Interviewer => f.write_str("interviewer"),
            Role::Interviewee => f.write_str("interviewee"),
        }
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "interviewer" => Ok(Role::Interviewer),
            "interviewee" => Ok(Role::Interviewee),
            other => Err(Error::InvalidConfig(format!("Unknown role: {}", other))),
        }
    }
}

/// Call status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallStatus {
    /// Nothing started
    Idle,
    /// Interviewer is registered and waiting for the call
    Waiting,
    /// Call is being set up (or the relay is reconnecting)
    Connecting,
    /// Remote media is flowing
    Connected,
    /// Call finished; terminal
    Ended,
    /// Call failed; `retry` is available
    Error,
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CallStatus::Idle => "IDLE",
            CallStatus::Waiting => "WAITING",
            CallStatus::Connecting => "CONNECTING",
            CallStatus::Connected => "CONNECTED",
            CallStatus::Ended => "ENDED",
            CallStatus::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// Snapshot of the call
#[derive(Debug, Clone)]
pub struct CallSession {
    /// Room the call belongs to
    pub room_id: Option<String>,
    /// Local role
    pub role: Option<Role>,
    /// Status
    pub status: CallStatus,
    /// Remote media, while connected
    pub remote_stream: Option<RemoteStream>,
    /// Last error message, in `Error` status
    pub error_message: Option<String>,
}

impl Default for CallSession {
    fn default() -> Self {
        Self {
            room_id: None,
            role: None,
            status: CallStatus::Idle,
            remote_stream: None,
            error_message: None,
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    role: Role,
    room_id: String,
    identity: String,
}

struct ControllerInner {
    session: PeerSessionManager,
    call: watch::Sender<CallSession>,
    entry: Mutex<Option<Entry>>,
    ended: AtomicBool,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl ControllerInner {
    /// Apply `f` to the call snapshot unless the call has ended
    fn update(&self, f: impl FnOnce(&mut CallSession)) {
        self.call.send_if_modified(|call| {
            if call.status == CallStatus::Ended {
                return false;
            }
            let before = call.status;
            f(call);
            if call.status != before {
                debug!(from = %before, to = %call.status, "Call status changed");
            }
            true
        });
    }

    fn set_error(&self, message: String) {
        warn!("Call error: {}", message);
        self.update(|call| {
            call.status = CallStatus::Error;
            call.remote_stream = None;
            call.error_message = Some(message);
        });
    }

    fn handle_event(&self, event: SessionEvent) -> bool {
        match event {
            SessionEvent::RemoteStreamAvailable(stream) => {
                let relay_open = self.session.connection_status() == ConnectionStatus::Connected;
                self.update(|call| {
                    if call.status == CallStatus::Error {
                        return;
                    }
                    call.remote_stream = Some(stream);
                    call.status = if relay_open {
                        CallStatus::Connected
                    } else {
                        CallStatus::Connecting
                    };
                });
            }
            SessionEvent::ConnectionStatusChanged(ConnectionStatus::Reconnecting) => {
                self.update(|call| {
                    if call.status == CallStatus::Connected {
                        call.status = CallStatus::Connecting;
                    }
                });
            }
            SessionEvent::ConnectionStatusChanged(ConnectionStatus::Connected) => {
                self.update(|call| {
                    if call.status == CallStatus::Connecting && call.remote_stream.is_some() {
                        call.status = CallStatus::Connected;
                    }
                });
            }
            SessionEvent::CallEnded => {
                let status = self.call.borrow().status;
                if matches!(status, CallStatus::Connected | CallStatus::Connecting) {
                    info!("Remote peer ended the call");
                    self.ended.store(true, Ordering::SeqCst);
                    self.call.send_modify(|call| {
                        call.status = CallStatus::Ended;
                        call.remote_stream = None;
                    });
                    return true;
                }
            }
            SessionEvent::CallError(message) | SessionEvent::ConnectivityError(message) => {
                self.set_error(message);
            }
            _ => {}
        }
        false
    }
}

/// Interview call controller
pub struct CallController {
    inner: Arc<ControllerInner>,
}

impl CallController {
    /// Controller for calls over `session`
    pub fn new(session: PeerSessionManager) -> Self {
        let (call, _) = watch::channel(CallSession::default());
        Self {
            inner: Arc::new(ControllerInner {
                session,
                call,
                entry: Mutex::new(None),
                ended: AtomicBool::new(false),
                listener: Mutex::new(None),
            }),
        }
    }

    /// Session manager behind this controller
    pub fn session(&self) -> &PeerSessionManager {
        &self.inner.session
    }

    /// Current call snapshot
    pub fn snapshot(&self) -> CallSession {
        self.inner.call.borrow().clone()
    }

    /// Current status
    pub fn status(&self) -> CallStatus {
        self.inner.call.borrow().status
    }

    /// Watch the call snapshot
    pub fn subscribe(&self) -> watch::Receiver<CallSession> {
        self.inner.call.subscribe()
    }

    fn ensure_listener(&self) {
        let mut listener = self.inner.listener.lock();
        if listener.is_some() {
            return;
        }
        let events = self.inner.session.events().subscribe();
        *listener = Some(tokio::spawn(Self::listen(Arc::downgrade(&self.inner), events)));
    }

    async fn listen(weak: Weak<ControllerInner>, mut events: broadcast::Receiver<SessionEvent>) {
        loop {
            let event = match events.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Call controller lagged behind session events");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            let Some(inner) = weak.upgrade() else {
                break;
            };
            if inner.handle_event(event) {
                inner.session.disconnect().await;
            }
        }
        debug!("Call event listener stopped");
    }

    /// Start the call as `role` in `room_id`, registering as `local_identity`
    #[instrument(skip(self))]
    pub async fn start_session(&self, role: Role, room_id: &str, local_identity: &str) -> Result<()> {
        if self.inner.ended.load(Ordering::SeqCst) {
            return Err(Error::SessionEnded);
        }
        let entry = {
            let mut slot = self.inner.entry.lock();
            if slot.is_some() {
                return Err(Error::CallInProgress);
            }
            let entry = Entry {
                role,
                room_id: room_id.to_string(),
                identity: local_identity.to_string(),
            };
            *slot = Some(entry.clone());
            entry
        };

        self.ensure_listener();
        self.inner.update(|call| {
            call.room_id = Some(entry.room_id.clone());
            call.role = Some(entry.role);
            call.error_message = None;
        });

        info!(%role, room_id, "Starting call session");
        self.run_entry(&entry).await
    }

    async fn run_entry(&self, entry: &Entry) -> Result<()> {
        let result = self.enter(entry).await;
        if let Err(e) = &result {
            if !self.inner.ended.load(Ordering::SeqCst) {
                self.inner.set_error(e.to_string());
            }
        }
        result
    }

    async fn enter(&self, entry: &Entry) -> Result<()> {
        self.inner.session.initialize(&entry.identity).await?;

        match entry.role {
            Role::Interviewer => {
                self.inner.update(|call| {
                    if matches!(call.status, CallStatus::Idle | CallStatus::Connecting)
                        && call.remote_stream.is_none()
                    {
                        call.status = CallStatus::Waiting;
                    }
                });
                Ok(())
            }
            Role::Interviewee => {
                self.inner.update(|call| {
                    if call.status != CallStatus::Connected {
                        call.status = CallStatus::Connecting;
                    }
                });
                self.inner.session.make_call(&entry.room_id).await
            }
        }
    }

    /// Tear down and run the entry point again
    #[instrument(skip(self))]
    pub async fn retry(&self) -> Result<()> {
        if self.inner.ended.load(Ordering::SeqCst) {
            return Err(Error::SessionEnded);
        }
        let Some(entry) = self.inner.entry.lock().clone() else {
            warn!("Retry requested before a session was started");
            return Ok(());
        };

        self.inner.session.disconnect().await;
        self.inner.update(|call| {
            call.status = CallStatus::Connecting;
            call.remote_stream = None;
            call.error_message = None;
        });

        info!(role = %entry.role, room_id = %entry.room_id, "Retrying call session");
        self.run_entry(&entry).await
    }

    /// End the call; the controller cannot be restarted afterwards
    #[instrument(skip(self))]
    pub async fn end_call(&self) -> Result<()> {
        self.inner.ended.store(true, Ordering::SeqCst);
        self.inner.call.send_modify(|call| {
            call.status = CallStatus::Ended;
            call.remote_stream = None;
        });
        self.inner.session.disconnect().await;
        info!("Call ended locally");
        Ok(())
    }

    /// Switch the camera, mid-call included
    pub async fn select_device(&self, device_id: &str) -> Result<()> {
        if self.inner.ended.load(Ordering::SeqCst) {
            return Err(Error::SessionEnded);
        }
        self.inner
            .session
            .devices()
            .set_video_device(device_id)
            .await
            .map(|_| ())
    }
}

impl Drop for CallController {
    fn drop(&mut self) {
        if let Some(listener) = self.inner.listener.lock().take() {
            listener.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_parsing() {
        assert_eq!("Interviewer".parse::<Role>().unwrap(), Role::Interviewer);
        assert_eq!("interviewee".parse::<Role>().unwrap(), Role::Interviewee);
        assert!(matches!(
            "observer".parse::<Role>(),
            Err(Error::InvalidConfig(_))
        ));
        assert_eq!(Role::Interviewee.to_string(), "interviewee");
    }

    #[test]
    fn test_status_wire_names() {
        assert_eq!(
            serde_json::to_string(&CallStatus::Connecting).unwrap(),
            "\"CONNECTING\""
        );
        assert_eq!(CallStatus::Waiting.to_string(), "WAITING");
    }

    #[test]
    fn test_default_session_is_idle() {
        let session = CallSession::default();
        assert_eq!(session.status, CallStatus::Idle);
        assert!(session.remote_stream.is_none());
    }
}
