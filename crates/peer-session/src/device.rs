//! Capture device management
//!
//! `DeviceManager` owns the single local media session. Every acquisition
//! runs under one async mutex, and the current video track is stopped before
//! a replacement is requested, so at most one camera handle is open at a
//! time.
//!
//! ```
//! use peer_session::{DeviceManager, EventChannel, SessionConfig, SyntheticBackend};
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let devices = DeviceManager::new(
//!     Arc::new(SyntheticBackend::default()),
//!     &SessionConfig::default(),
//!     EventChannel::default(),
//! );
//! let list = devices.initialize_devices().await.unwrap();
//! assert_eq!(list.active_device_id.as_deref(), Some("cam-1"));
//! # });
//! ```

use crate::config::SessionConfig;
use crate::events::{EventChannel, SessionEvent};
use crate::media::{
    Device, MediaBackend, MediaConstraints, MediaStream, PermissionState,
};
use crate::relay::MediaCall;
use crate::{Error, Result};
use anyhow::anyhow;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, instrument, warn};

/// Cached camera list with the device currently in use
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceList {
    /// Video input devices
    pub devices: Vec<Device>,
    /// Camera backing the local stream
    pub active_device_id: Option<String>,
}

/// The local capture stream and the camera it uses
#[derive(Debug, Clone)]
pub struct LocalMediaSession {
    /// Capture stream
    pub stream: MediaStream,
    /// Camera feeding the video track
    pub active_device_id: Option<String>,
}

impl LocalMediaSession {
    fn is_live(&self) -> bool {
        self.stream.tracks().iter().all(|t| t.is_live())
    }
}

struct DeviceState {
    session: Option<LocalMediaSession>,
    devices: Vec<Device>,
    selected_device_id: Option<String>,
    changes: broadcast::Receiver<()>,
    /// Set once a full initialization succeeded; an empty list does not
    /// mean uninitialized
    initialized: bool,
}

impl DeviceState {
    fn active_device_id(&self) -> Option<String> {
        self.session
            .as_ref()
            .and_then(|s| s.active_device_id.clone())
            .or_else(|| self.selected_device_id.clone())
    }

    fn list(&self) -> DeviceList {
        DeviceList {
            devices: self.devices.clone(),
            active_device_id: self.active_device_id(),
        }
    }

    /// Consume pending device-change notifications
    fn take_changes(&mut self) -> bool {
        let mut changed = false;
        loop {
            match self.changes.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Lagged(_)) => changed = true,
                Err(_) => return changed,
            }
        }
    }

    /// Drop camera ids that are no longer enumerated. Tracks stay open.
    fn forget_missing_camera(&mut self) {
        let present = |id: &String| self.devices.iter().any(|d| &d.id == id);
        if self.selected_device_id.as_ref().is_some_and(|id| !present(id)) {
            self.selected_device_id = None;
        }
        let gone = self
            .session
            .as_ref()
            .and_then(|s| s.active_device_id.as_ref())
            .is_some_and(|id| !present(id));
        if gone {
            if let Some(session) = self.session.as_mut() {
                warn!(device_id = ?session.active_device_id, "Active camera disappeared");
                session.active_device_id = None;
            }
        }
    }

    fn release(&mut self) {
        if let Some(session) = self.session.take() {
            session.stream.stop();
        }
    }
}

/// Pick the default camera: first label containing `preferred`
/// (case-insensitive), otherwise the first device
pub fn select_default_device<'a>(devices: &'a [Device], preferred: Option<&str>) -> Option<&'a Device> {
    preferred
        .map(str::to_lowercase)
        .filter(|p| !p.is_empty())
        .and_then(|p| devices.iter().find(|d| d.label.to_lowercase().contains(&p)))
        .or_else(|| devices.first())
}

fn cameras(devices: Vec<Device>) -> Vec<Device> {
    devices.into_iter().filter(Device::is_video_input).collect()
}

/// Capture device enumeration, permission handling and the local stream
pub struct DeviceManager {
    backend: Arc<dyn MediaBackend>,
    preferred_camera_label: Option<String>,
    events: EventChannel,
    state: Mutex<DeviceState>,
    active_call: parking_lot::Mutex<Option<Arc<dyn MediaCall>>>,
}

impl DeviceManager {
    /// Create a device manager on top of `backend`
    pub fn new(backend: Arc<dyn MediaBackend>, config: &SessionConfig, events: EventChannel) -> Self {
        let changes = backend.subscribe_device_changes();
        Self {
            backend,
            preferred_camera_label: config.preferred_camera_label.clone(),
            events,
            state: Mutex::new(DeviceState {
                session: None,
                devices: Vec::new(),
                selected_device_id: None,
                changes,
                initialized: false,
            }),
            active_call: parking_lot::Mutex::new(None),
        }
    }

    /// Check permission, acquire the default stream, enumerate cameras and
    /// pick the default one
    #[instrument(skip(self))]
    pub async fn initialize_devices(&self) -> Result<DeviceList> {
        let mut state = self.state.lock().await;
        self.initialize_locked(&mut state).await
    }

    async fn initialize_locked(&self, state: &mut DeviceState) -> Result<DeviceList> {
        if self.backend.permission_state().await == PermissionState::Denied {
            warn!("Camera permission denied; not attempting capture");
            return Err(Error::PermissionDenied);
        }

        state.release();
        let stream = self
            .backend
            .get_user_media(&MediaConstraints::default_devices())
            .await
            .map_err(Error::media_access)?;

        let devices = match self.backend.enumerate_devices().await {
            Ok(devices) => cameras(devices),
            Err(e) => {
                stream.stop();
                return Err(Error::media_access(e));
            }
        };
        if devices.is_empty() {
            stream.stop();
            return Err(Error::NoDeviceFound);
        }

        // A camera picked earlier survives re-initialization while it exists
        let selected = state
            .selected_device_id
            .clone()
            .filter(|id| devices.iter().any(|d| &d.id == id))
            .or_else(|| {
                select_default_device(&devices, self.preferred_camera_label.as_deref())
                    .map(|d| d.id.clone())
            });
        let current = stream
            .video_track()
            .and_then(|t| t.device_id())
            .map(str::to_string);

        let stream = match (&selected, &current) {
            (Some(wanted), Some(open)) if wanted != open => {
                debug!(from = %open, to = %wanted, "Switching to preferred camera");
                stream.stop_video();
                match self
                    .backend
                    .get_user_media(&MediaConstraints::video_only(wanted))
                    .await
                {
                    Ok(video) => match video.video_track() {
                        Some(track) => stream.with_video(track.clone()),
                        None => stream,
                    },
                    Err(e) => {
                        stream.stop();
                        return Err(Error::media_access(e));
                    }
                }
            }
            _ => stream,
        };

        state.take_changes();
        state.devices = devices;
        state.selected_device_id = selected.clone();
        state.session = Some(LocalMediaSession {
            stream,
            active_device_id: selected,
        });
        state.initialized = true;

        info!(
            cameras = state.devices.len(),
            active = ?state.active_device_id(),
            "Capture devices initialized"
        );
        self.events
            .emit(SessionEvent::DevicesChanged(state.devices.clone()));
        Ok(state.list())
    }

    /// Cached camera list and active camera
    ///
    /// Initializes on first use and re-enumerates after the platform
    /// reported a device change. A refresh never touches the local stream;
    /// an empty camera list is reported as `NoDeviceFound`.
    pub async fn get_available_devices(&self) -> Result<DeviceList> {
        let mut state = self.state.lock().await;

        if !state.initialized {
            return self.initialize_locked(&mut state).await;
        }

        if state.take_changes() {
            let devices = cameras(
                self.backend
                    .enumerate_devices()
                    .await
                    .map_err(Error::media_access)?,
            );
            debug!(cameras = devices.len(), "Device list refreshed");
            state.devices = devices;
            state.forget_missing_camera();
            self.events
                .emit(SessionEvent::DevicesChanged(state.devices.clone()));
        }

        if state.devices.is_empty() {
            return Err(Error::NoDeviceFound);
        }
        Ok(state.list())
    }

    /// The local stream, acquiring it on first use
    pub async fn get_local_stream(&self) -> Result<MediaStream> {
        let mut state = self.state.lock().await;

        if let Some(session) = state.session.as_ref().filter(|s| s.is_live()) {
            return Ok(session.stream.clone());
        }
        state.release();

        let constraints = MediaConstraints::for_device(state.selected_device_id.as_deref());
        let stream = self
            .backend
            .get_user_media(&constraints)
            .await
            .map_err(Error::media_access)?;

        let active_device_id = stream
            .video_track()
            .and_then(|t| t.device_id())
            .map(str::to_string)
            .or_else(|| state.selected_device_id.clone());
        state.session = Some(LocalMediaSession {
            stream: stream.clone(),
            active_device_id,
        });
        Ok(stream)
    }

    /// Initialize devices unless already done
    pub async fn ensure_initialized(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if !state.initialized || state.session.is_none() {
            self.initialize_locked(&mut state).await?;
        }
        Ok(())
    }

    /// Switch the camera, replacing the outbound video of an active call
    #[instrument(skip(self))]
    pub async fn set_video_device(&self, device_id: &str) -> Result<MediaStream> {
        let mut state = self.state.lock().await;

        let devices = cameras(
            self.backend
                .enumerate_devices()
                .await
                .map_err(Error::media_access)?,
        );
        if !devices.iter().any(|d| d.id == device_id) {
            return Err(Error::DeviceNotFound(device_id.to_string()));
        }
        state.devices = devices;

        let current = state
            .session
            .as_ref()
            .filter(|s| s.stream.tracks().iter().any(|t| t.is_live()));
        let stream = match current {
            Some(session) => {
                session.stream.stop_video();
                let captured = self
                    .backend
                    .get_user_media(&MediaConstraints::video_only(device_id))
                    .await
                    .map_err(Error::media_access)?;
                let video = captured.video_track().cloned().ok_or_else(|| {
                    Error::media_access(anyhow!("capture returned no video track"))
                })?;
                session.stream.with_video(video)
            }
            None => {
                state.release();
                self.backend
                    .get_user_media(&MediaConstraints::for_device(Some(device_id)))
                    .await
                    .map_err(Error::media_access)?
            }
        };

        state.selected_device_id = Some(device_id.to_string());
        state.session = Some(LocalMediaSession {
            stream: stream.clone(),
            active_device_id: Some(device_id.to_string()),
        });
        info!(device_id, "Active camera changed");

        let call = self.active_call.lock().clone();
        if let (Some(call), Some(video)) = (call, stream.video_track()) {
            call.replace_video_track(video).await?;
            debug!(call_id = call.id(), track_id = video.id(), "Outbound video replaced");
        }

        Ok(stream)
    }

    /// Camera currently in use
    pub async fn active_device_id(&self) -> Option<String> {
        self.state.lock().await.active_device_id()
    }

    /// Stop every local track and drop the session
    pub async fn release(&self) {
        let mut state = self.state.lock().await;
        state.release();
        debug!("Local media released");
    }

    /// Register the call whose sender receives video replacements
    pub fn attach_call(&self, call: Arc<dyn MediaCall>) {
        *self.active_call.lock() = Some(call);
    }

    /// Forget `call_id` if it is the attached call
    pub fn detach_call(&self, call_id: &str) {
        let mut active = self.active_call.lock();
        if active.as_ref().is_some_and(|c| c.id() == call_id) {
            *active = None;
        }
    }

    /// Forget any attached call
    pub fn clear_call(&self) {
        *self.active_call.lock() = None;
    }
}
