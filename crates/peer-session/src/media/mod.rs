//! Local capture media: devices, tracks and streams
//!
//! Tracks own a hardware handle. A track is released exactly once, either by
//! an explicit [`LocalTrack::stop`] or when the last clone of it is dropped.

pub mod backend;
pub mod synthetic;

pub use backend::{MediaBackend, PermissionState};
pub use synthetic::SyntheticBackend;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Capacity of the per-track sample fan-out
const SAMPLE_CHANNEL_CAPACITY: usize = 64;

/// Kind of media device reported by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    /// Camera
    #[serde(rename = "videoinput")]
    VideoInput,
    /// Microphone
    #[serde(rename = "audioinput")]
    AudioInput,
    /// Speaker / headset
    #[serde(rename = "audiooutput")]
    AudioOutput,
}

/// Immutable device snapshot from the platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Platform device id
    pub id: String,
    /// Device kind
    pub kind: DeviceKind,
    /// Human readable label
    pub label: String,
}

impl Device {
    /// Camera device
    pub fn camera(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: DeviceKind::VideoInput,
            label: label.into(),
        }
    }

    /// Microphone device
    pub fn microphone(id: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: DeviceKind::AudioInput,
            label: label.into(),
        }
    }

    /// Whether this is a video input
    pub fn is_video_input(&self) -> bool {
        self.kind == DeviceKind::VideoInput
    }
}

/// Video constraint for a capture request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VideoConstraint {
    /// No video
    Disabled,
    /// Platform default camera
    Default,
    /// Exactly this device id
    Exact(String),
}

/// Capture request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaConstraints {
    /// Video constraint
    pub video: VideoConstraint,
    /// Capture audio as well
    pub audio: bool,
}

impl MediaConstraints {
    /// Default camera and microphone
    pub fn default_devices() -> Self {
        Self {
            video: VideoConstraint::Default,
            audio: true,
        }
    }

    /// Camera and microphone, camera pinned to `device_id` when given
    pub fn for_device(device_id: Option<&str>) -> Self {
        Self {
            video: match device_id {
                Some(id) => VideoConstraint::Exact(id.to_string()),
                None => VideoConstraint::Default,
            },
            audio: true,
        }
    }

    /// Camera only, pinned to `device_id`
    pub fn video_only(device_id: &str) -> Self {
        Self {
            video: VideoConstraint::Exact(device_id.to_string()),
            audio: false,
        }
    }
}

/// Media kind of a track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    /// Audio track
    Audio,
    /// Video track
    Video,
}

impl fmt::Display for TrackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrackKind::Audio => write!(f, "audio"),
            TrackKind::Video => write!(f, "video"),
        }
    }
}

/// Encoded media sample produced by a capture source
#[derive(Debug, Clone)]
pub struct MediaSample {
    /// Encoded payload (Opus or VP8)
    pub data: Bytes,
    /// Playback duration of this sample
    pub duration: Duration,
}

type ReleaseFn = Box<dyn FnOnce() + Send>;

struct TrackInner {
    id: String,
    kind: TrackKind,
    label: String,
    device_id: Option<String>,
    stopped: AtomicBool,
    release: Mutex<Option<ReleaseFn>>,
    samples: broadcast::Sender<MediaSample>,
}

impl TrackInner {
    fn stop(&self) -> bool {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return false;
        }
        if let Some(release) = self.release.lock().take() {
            release();
        }
        true
    }
}

impl Drop for TrackInner {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Local capture track
///
/// Cloning shares the same underlying handle.
#[derive(Clone)]
pub struct LocalTrack {
    inner: Arc<TrackInner>,
}

impl LocalTrack {
    /// Create a live track with a fresh id
    pub fn new(kind: TrackKind, label: impl Into<String>, device_id: Option<String>) -> Self {
        let (samples, _) = broadcast::channel(SAMPLE_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(TrackInner {
                id: format!("{}-{}", kind, uuid::Uuid::new_v4().simple()),
                kind,
                label: label.into(),
                device_id,
                stopped: AtomicBool::new(false),
                release: Mutex::new(None),
                samples,
            }),
        }
    }

    /// Create a track whose hardware handle is released by `release`
    pub fn with_release<F>(
        kind: TrackKind,
        label: impl Into<String>,
        device_id: Option<String>,
        release: F,
    ) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let track = Self::new(kind, label, device_id);
        *track.inner.release.lock() = Some(Box::new(release));
        track
    }

    /// Track id (changes on every acquisition)
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Media kind
    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    /// Source label
    pub fn label(&self) -> &str {
        &self.inner.label
    }

    /// Source device id, if known
    pub fn device_id(&self) -> Option<&str> {
        self.inner.device_id.as_deref()
    }

    /// Whether the track has not been stopped
    pub fn is_live(&self) -> bool {
        !self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Stop the track and release its hardware handle
    ///
    /// Returns `false` if the track was already stopped.
    pub fn stop(&self) -> bool {
        self.inner.stop()
    }

    /// Subscribe to encoded samples from this track
    pub fn subscribe(&self) -> broadcast::Receiver<MediaSample> {
        self.inner.samples.subscribe()
    }

    /// Publish an encoded sample; returns the number of receivers
    pub fn push_sample(&self, sample: MediaSample) -> usize {
        if !self.is_live() {
            return 0;
        }
        self.inner.samples.send(sample).unwrap_or(0)
    }

    /// Whether two handles refer to the same track
    pub fn same_track(&self, other: &LocalTrack) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("device_id", &self.inner.device_id)
            .field("live", &self.is_live())
            .finish()
    }
}

/// Local capture stream handle
#[derive(Debug, Clone)]
pub struct MediaStream {
    id: String,
    tracks: Vec<LocalTrack>,
}

impl MediaStream {
    /// Build a stream from tracks
    pub fn new(tracks: Vec<LocalTrack>) -> Self {
        Self {
            id: format!("stream-{}", uuid::Uuid::new_v4().simple()),
            tracks,
        }
    }

    /// Stream id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// All tracks
    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    /// First audio track
    pub fn audio_track(&self) -> Option<&LocalTrack> {
        self.tracks.iter().find(|t| t.kind() == TrackKind::Audio)
    }

    /// First video track
    pub fn video_track(&self) -> Option<&LocalTrack> {
        self.tracks.iter().find(|t| t.kind() == TrackKind::Video)
    }

    /// Stop every track
    pub fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }

    /// Stop only the video tracks
    pub fn stop_video(&self) {
        for track in self.tracks.iter().filter(|t| t.kind() == TrackKind::Video) {
            track.stop();
        }
    }

    /// Same stream id with the video tracks replaced by `video`
    pub fn with_video(&self, video: LocalTrack) -> Self {
        let mut tracks: Vec<LocalTrack> = self
            .tracks
            .iter()
            .filter(|t| t.kind() != TrackKind::Video)
            .cloned()
            .collect();
        tracks.push(video);
        Self {
            id: self.id.clone(),
            tracks,
        }
    }
}

/// Remote track announced by the media transport
#[derive(Debug, Clone)]
pub struct RemoteTrack {
    /// Track id assigned by the remote peer
    pub id: String,
    /// Media kind
    pub kind: TrackKind,
    /// Received payloads
    pub media: broadcast::Sender<MediaSample>,
}

impl RemoteTrack {
    /// Remote track with its own payload fan-out
    pub fn new(id: impl Into<String>, kind: TrackKind) -> Self {
        let (media, _) = broadcast::channel(SAMPLE_CHANNEL_CAPACITY);
        Self {
            id: id.into(),
            kind,
            media,
        }
    }
}

/// Remote media stream handle
///
/// Tracks that arrive after the stream was first announced are appended to
/// the same handle.
#[derive(Debug, Clone)]
pub struct RemoteStream {
    id: String,
    peer_id: String,
    tracks: Arc<RwLock<Vec<RemoteTrack>>>,
}

impl RemoteStream {
    /// Remote stream of `peer_id`
    pub fn new(id: impl Into<String>, peer_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            peer_id: peer_id.into(),
            tracks: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Stream id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Remote peer id
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    /// Add a track to the stream
    pub fn add_track(&self, track: RemoteTrack) {
        self.tracks.write().push(track);
    }

    /// Snapshot of the current tracks
    pub fn tracks(&self) -> Vec<RemoteTrack> {
        self.tracks.read().clone()
    }
}
