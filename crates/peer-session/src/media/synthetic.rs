//! In-process capture backend
//!
//! Serves a configurable device list without touching hardware. Every video
//! acquisition counts as one open hardware handle until its track is
//! released, so callers can check that no two camera handles are ever live
//! at the same time.

use super::backend::{MediaBackend, PermissionState};
use super::{Device, LocalTrack, MediaConstraints, MediaStream, TrackKind, VideoConstraint};
use anyhow::{anyhow, bail};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;

#[derive(Default)]
struct Counters {
    open_video: AtomicUsize,
    peak_open_video: AtomicUsize,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    acquisitions: AtomicUsize,
    enumerations: AtomicUsize,
}

impl Counters {
    fn raise(current: &AtomicUsize, peak: &AtomicUsize) {
        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
        peak.fetch_max(now, Ordering::SeqCst);
    }
}

struct SyntheticState {
    devices: Vec<Device>,
    permission: PermissionState,
    fail_next_acquisition: Option<String>,
    acquire_delay: Option<Duration>,
}

/// Capture backend backed by an in-memory device list
pub struct SyntheticBackend {
    state: Mutex<SyntheticState>,
    counters: Arc<Counters>,
    changes: broadcast::Sender<()>,
}

impl Default for SyntheticBackend {
    fn default() -> Self {
        Self::new(vec![
            Device::camera("cam-1", "FaceTime HD Camera (Built-in)"),
            Device::camera("cam-2", "USB Video Camera"),
            Device::microphone("mic-1", "Built-in Microphone"),
        ])
    }
}

impl SyntheticBackend {
    /// Backend serving `devices` with permission granted
    pub fn new(devices: Vec<Device>) -> Self {
        let (changes, _) = broadcast::channel(16);
        Self {
            state: Mutex::new(SyntheticState {
                devices,
                permission: PermissionState::Granted,
                fail_next_acquisition: None,
                acquire_delay: None,
            }),
            counters: Arc::new(Counters::default()),
            changes,
        }
    }

    /// Set the permission state
    pub fn with_permission(self, permission: PermissionState) -> Self {
        self.state.lock().permission = permission;
        self
    }

    /// Delay every acquisition by `delay`
    pub fn with_acquire_delay(self, delay: Duration) -> Self {
        self.state.lock().acquire_delay = Some(delay);
        self
    }

    /// Replace the device list and raise a device-change notification
    pub fn set_devices(&self, devices: Vec<Device>) {
        self.state.lock().devices = devices;
        let _ = self.changes.send(());
    }

    /// Change the permission state
    pub fn set_permission(&self, permission: PermissionState) {
        self.state.lock().permission = permission;
    }

    /// Make the next acquisition fail with `reason`
    pub fn fail_next_acquisition(&self, reason: &str) {
        self.state.lock().fail_next_acquisition = Some(reason.to_string());
    }

    /// Camera handles currently open
    pub fn open_video_tracks(&self) -> usize {
        self.counters.open_video.load(Ordering::SeqCst)
    }

    /// Highest number of camera handles open at once
    pub fn peak_open_video_tracks(&self) -> usize {
        self.counters.peak_open_video.load(Ordering::SeqCst)
    }

    /// Highest number of concurrent acquisitions
    pub fn peak_in_flight_acquisitions(&self) -> usize {
        self.counters.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Successful acquisitions so far
    pub fn acquisitions(&self) -> usize {
        self.counters.acquisitions.load(Ordering::SeqCst)
    }

    /// Enumerations so far
    pub fn enumerations(&self) -> usize {
        self.counters.enumerations.load(Ordering::SeqCst)
    }

    fn open_camera(&self, device: &Device) -> LocalTrack {
        Counters::raise(&self.counters.open_video, &self.counters.peak_open_video);
        let counters = Arc::clone(&self.counters);
        LocalTrack::with_release(
            TrackKind::Video,
            device.label.clone(),
            Some(device.id.clone()),
            move || {
                counters.open_video.fetch_sub(1, Ordering::SeqCst);
            },
        )
    }

    fn acquire(&self, constraints: &MediaConstraints) -> anyhow::Result<MediaStream> {
        let (camera, microphone) = {
            let mut state = self.state.lock();

            if state.permission == PermissionState::Denied {
                bail!("NotAllowedError: permission denied");
            }
            if let Some(reason) = state.fail_next_acquisition.take() {
                bail!("{}", reason);
            }

            let cameras = state.devices.iter().filter(|d| d.is_video_input());
            let camera = match &constraints.video {
                VideoConstraint::Disabled => None,
                VideoConstraint::Default => Some(
                    cameras
                        .clone()
                        .next()
                        .cloned()
                        .ok_or_else(|| anyhow!("NotFoundError: no camera available"))?,
                ),
                VideoConstraint::Exact(id) => Some(
                    cameras
                        .clone()
                        .find(|d| &d.id == id)
                        .cloned()
                        .ok_or_else(|| anyhow!("OverconstrainedError: no camera with id {}", id))?,
                ),
            };
            let microphone = constraints
                .audio
                .then(|| state.devices.iter().find(|d| d.kind == super::DeviceKind::AudioInput).cloned())
                .flatten();

            (camera, microphone)
        };

        let mut tracks = Vec::new();
        if constraints.audio {
            let label = microphone
                .as_ref()
                .map(|m| m.label.clone())
                .unwrap_or_else(|| "Default Microphone".to_string());
            tracks.push(LocalTrack::new(
                TrackKind::Audio,
                label,
                microphone.map(|m| m.id),
            ));
        }
        if let Some(camera) = camera {
            tracks.push(self.open_camera(&camera));
        }

        Ok(MediaStream::new(tracks))
    }
}

#[async_trait]
impl MediaBackend for SyntheticBackend {
    async fn permission_state(&self) -> PermissionState {
        self.state.lock().permission
    }

    async fn get_user_media(&self, constraints: &MediaConstraints) -> anyhow::Result<MediaStream> {
        Counters::raise(&self.counters.in_flight, &self.counters.peak_in_flight);

        let delay = self.state.lock().acquire_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let result = self.acquire(constraints);
        self.counters.in_flight.fetch_sub(1, Ordering::SeqCst);

        if result.is_ok() {
            self.counters.acquisitions.fetch_add(1, Ordering::SeqCst);
        }
        debug!(?constraints, ok = result.is_ok(), "Synthetic capture request");
        result
    }

    async fn enumerate_devices(&self) -> anyhow::Result<Vec<Device>> {
        self.counters.enumerations.fetch_add(1, Ordering::SeqCst);
        Ok(self.state.lock().devices.clone())
    }

    fn subscribe_device_changes(&self) -> broadcast::Receiver<()> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_default_acquisition_opens_one_camera() {
        let backend = SyntheticBackend::default();
        let stream = backend
            .get_user_media(&MediaConstraints::default_devices())
            .await
            .unwrap();

        assert_eq!(stream.video_track().unwrap().device_id(), Some("cam-1"));
        assert!(stream.audio_track().is_some());
        assert_eq!(backend.open_video_tracks(), 1);

        stream.stop();
        assert_eq!(backend.open_video_tracks(), 0);
    }

    #[tokio::test]
    async fn test_exact_device_must_exist() {
        let backend = SyntheticBackend::default();
        let err = backend
            .get_user_media(&MediaConstraints::video_only("cam-9"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("OverconstrainedError"));
        assert_eq!(backend.open_video_tracks(), 0);
    }

    #[tokio::test]
    async fn test_denied_permission_blocks_capture() {
        let backend = SyntheticBackend::default().with_permission(PermissionState::Denied);
        assert_eq!(backend.permission_state().await, PermissionState::Denied);
        assert!(backend
            .get_user_media(&MediaConstraints::default_devices())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_injected_failure_is_one_shot() {
        let backend = SyntheticBackend::default();
        backend.fail_next_acquisition("NotReadableError: busy");

        let err = backend
            .get_user_media(&MediaConstraints::default_devices())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("busy"));
        assert!(backend
            .get_user_media(&MediaConstraints::default_devices())
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_set_devices_notifies() {
        let backend = SyntheticBackend::default();
        let mut changes = backend.subscribe_device_changes();
        backend.set_devices(vec![Device::camera("cam-3", "Desk Camera")]);

        assert!(changes.try_recv().is_ok());
        assert_eq!(backend.enumerate_devices().await.unwrap().len(), 1);
    }
}
