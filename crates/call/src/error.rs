//! Error types for call negotiation

/// Result type alias using call Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while setting up or running a call
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid configuration parameter
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Capture permission denied or hardware unavailable
    #[error("Media access error: {0}")]
    MediaAccess(String),

    /// Signaling relay could not be reached
    #[error("Signaling unavailable: {0}")]
    SignalingUnavailable(String),

    /// Signaling channel error after connect
    #[error("Signaling error: {0}")]
    Signaling(String),

    /// Offer/answer negotiation failed for the current call attempt
    #[error("Negotiation error: {0}")]
    Negotiation(String),

    /// ICE candidate could not be parsed or applied
    #[error("ICE candidate error: {0}")]
    IceCandidate(String),

    /// No connection established within the watchdog window
    #[error("Connection timeout after {0:?}")]
    ConnectionTimeout(std::time::Duration),

    /// Media track error
    #[error("Media track error: {0}")]
    MediaTrack(String),

    /// Underlying WebRTC library error
    #[error("WebRTC error: {0}")]
    WebRtc(String),

    /// WebSocket transport error
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Any other error
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error terminates the current call attempt.
    ///
    /// Fatal errors always route through the coordinator's single
    /// `end(reason)` path; non-fatal ones are logged and leave the
    /// negotiation phase untouched.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::IceCandidate(_))
    }

    /// Check if this error is a configuration error
    pub fn is_config_error(&self) -> bool {
        matches!(self, Error::InvalidConfig(_))
    }

    /// Check if this error occurred before signaling was established
    pub fn is_pre_signaling(&self) -> bool {
        matches!(
            self,
            Error::MediaAccess(_) | Error::SignalingUnavailable(_) | Error::InvalidConfig(_)
        )
    }
}
