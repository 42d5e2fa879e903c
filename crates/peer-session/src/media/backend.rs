//! Platform media backend abstraction

use super::{Device, MediaConstraints, MediaStream};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Camera permission state as reported by the platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionState {
    /// Permission granted
    Granted,
    /// Permission withheld; capture must not be attempted
    Denied,
    /// The platform will ask the user on the next capture request
    Prompt,
}

/// Capture device access provided by the host platform
///
/// Implementations must hand out tracks whose release hook frees the
/// underlying hardware handle.
#[async_trait]
pub trait MediaBackend: Send + Sync {
    /// Current camera permission state
    async fn permission_state(&self) -> PermissionState;

    /// Acquire a capture stream matching `constraints`
    async fn get_user_media(&self, constraints: &MediaConstraints) -> anyhow::Result<MediaStream>;

    /// Enumerate every media device (all kinds)
    async fn enumerate_devices(&self) -> anyhow::Result<Vec<Device>>;

    /// Subscribe to device-change notifications
    fn subscribe_device_changes(&self) -> broadcast::Receiver<()>;
}
