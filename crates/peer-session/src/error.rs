//! Error types for the peer session core

/// Result type alias using the session Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in device, relay and call operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Camera permission withheld; needs user action before retrying
    #[error("Camera permission denied")]
    PermissionDenied,

    /// Enumeration returned no video inputs
    #[error("No video input device found")]
    NoDeviceFound,

    /// Requested device id is not present in a fresh enumeration
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Capture failed for a reason other than the permission pre-check
    #[error("Media access denied: {source}")]
    MediaAccessDenied {
        /// Underlying platform failure
        #[source]
        source: anyhow::Error,
    },

    /// Initial relay handshake failed
    #[error("Relay connection failed: {0}")]
    RelayConnectFailed(String),

    /// Outbound call attempted while the relay connection is not open
    #[error("Relay connection is not open")]
    NotConnected,

    /// A call is active but exposes no outbound video sender
    #[error("Active call has no outbound video track")]
    NoActiveCallTrack,

    /// An async completion arrived after the session was torn down
    #[error("Session closed before the operation completed")]
    SessionClosed,

    /// Operation on a call controller whose call has ended
    #[error("Call session has ended")]
    SessionEnded,

    /// A second call session was started while one is active
    #[error("A call session is already in progress")]
    CallInProgress,

    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    /// WebRTC peer connection error
    #[error("Peer connection error: {0}")]
    PeerConnectionError(String),

    /// SDP negotiation error
    #[error("SDP negotiation error: {0}")]
    SdpError(String),

    /// ICE candidate error
    #[error("ICE candidate error: {0}")]
    IceCandidateError(String),

    /// Media track error
    #[error("Media track error: {0}")]
    MediaTrackError(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Wrap a platform capture failure
    pub fn media_access(source: impl Into<anyhow::Error>) -> Self {
        Error::MediaAccessDenied {
            source: source.into(),
        }
    }

    /// Check if this error is retryable without user action
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::RelayConnectFailed(_)
                | Error::NotConnected
                | Error::WebSocketError(_)
                | Error::PeerConnectionError(_)
        )
    }

    /// Check if this error comes from capture devices
    pub fn is_device_error(&self) -> bool {
        matches!(
            self,
            Error::PermissionDenied
                | Error::NoDeviceFound
                | Error::DeviceNotFound(_)
                | Error::MediaAccessDenied { .. }
        )
    }

    /// Check if this error comes from the relay connection
    pub fn is_relay_error(&self) -> bool {
        matches!(
            self,
            Error::RelayConnectFailed(_) | Error::NotConnected | Error::WebSocketError(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::SerializationError(e.to_string())
    }
}

impl From<webrtc::Error> for Error {
    fn from(e: webrtc::Error) -> Self {
        Error::PeerConnectionError(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::DeviceNotFound("cam-9".to_string());
        assert_eq!(err.to_string(), "Device not found: cam-9");
        assert_eq!(
            Error::NotConnected.to_string(),
            "Relay connection is not open"
        );
    }

    #[test]
    fn test_media_access_keeps_cause() {
        let err = Error::media_access(anyhow::anyhow!("NotReadableError: device busy"));
        assert!(err.to_string().contains("device busy"));
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("NotReadableError: device busy"));
    }

    #[test]
    fn test_error_is_retryable() {
        assert!(Error::RelayConnectFailed("test".to_string()).is_retryable());
        assert!(Error::NotConnected.is_retryable());
        assert!(!Error::PermissionDenied.is_retryable());
        assert!(!Error::InvalidConfig("test".to_string()).is_retryable());
    }

    #[test]
    fn test_error_classes() {
        assert!(Error::NoDeviceFound.is_device_error());
        assert!(Error::PermissionDenied.is_device_error());
        assert!(!Error::NotConnected.is_device_error());
        assert!(Error::NotConnected.is_relay_error());
        assert!(!Error::NoActiveCallTrack.is_relay_error());
    }

    #[test]
    fn test_json_error_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err = Error::from(json_err);
        assert!(matches!(err, Error::SerializationError(_)));
    }
}
