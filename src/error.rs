//! Error taxonomy surfaced by the streaming engine.

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, StreamError>;

/// Failures observable through the player's state and event streams.
///
/// Payloads are plain strings so the error can be cloned into
/// `PlaybackState::Error` and broadcast to every subscriber.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StreamError {
    /// DNS/TCP/HTTP failure before or during streaming
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Malformed or format-mismatched compressed data
    #[error("decoding failed: {0}")]
    DecodingFailed(String),

    /// The platform output device could not be configured
    #[error("audio output setup failed: {0}")]
    AudioOutputSetupFailed(String),

    /// Reconnect backoff gave up
    #[error("gave up after {attempts} reconnect attempts")]
    MaxReconnectAttemptsExceeded { attempts: u32 },
}

impl StreamError {
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::ConnectionFailed(msg.into())
    }

    pub fn decoding(msg: impl Into<String>) -> Self {
        Self::DecodingFailed(msg.into())
    }

    /// Terminal errors move the player to `error` and are never retried.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::AudioOutputSetupFailed(_) | Self::MaxReconnectAttemptsExceeded { .. }
        )
    }
}

impl From<reqwest::Error> for StreamError {
    fn from(e: reqwest::Error) -> Self {
        Self::ConnectionFailed(e.to_string())
    }
}

/// Outcome of handing a single compressed frame to a codec backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// The frame was damaged; dropping it and continuing is safe.
    #[error("corrupt frame: {0}")]
    Corrupt(String),

    /// The codec cannot continue with this stream.
    #[error("codec failure: {0}")]
    Fatal(String),
}
