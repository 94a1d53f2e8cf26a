//! Error taxonomy for the capture → encode → distribute pipeline.
//!
//! Per-frame errors (`Capture`, `Encode`, `RateLimited`) are absorbed by the
//! capture loop. `Transport` is the only variant that tears anything down.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StreamError {
    /// Display unavailable or the capture device failed. Retried next tick.
    #[error("capture failed: {0}")]
    Capture(String),

    /// Bad input or encoder failure. The frame is skipped.
    #[error("encode failed: {0}")]
    Encode(String),

    /// Out-of-range quality / fps / display. The previous value is kept.
    #[error("invalid config: {0}")]
    Config(String),

    /// Admission denied by the capture throttle's token bucket.
    #[error("rate limited")]
    RateLimited,

    /// Read/write failure on a subscriber or upstream connection.
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed or unknown message. Logged, the connection continues.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A shutdown signal was observed while waiting.
    #[error("cancelled")]
    Cancelled,
}

impl StreamError {
    /// Whether this error should end the connection or subscriber it
    /// happened on.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::Cancelled)
    }
}

pub type StreamResult<T> = std::result::Result<T, StreamError>;

impl From<tokio_tungstenite::tungstenite::Error> for StreamError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Transport(e.to_string())
    }
}

impl From<serde_json::Error> for StreamError {
    fn from(e: serde_json::Error) -> Self {
        Self::Protocol(e.to_string())
    }
}

impl From<image::ImageError> for StreamError {
    fn from(e: image::ImageError) -> Self {
        Self::Encode(e.to_string())
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for StreamError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Self::Transport("outbound channel closed".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transport_and_cancel_are_fatal() {
        assert!(StreamError::Transport("pipe".into()).is_fatal());
        assert!(StreamError::Cancelled.is_fatal());
        assert!(!StreamError::RateLimited.is_fatal());
        assert!(!StreamError::Capture("gone".into()).is_fatal());
        assert!(!StreamError::Protocol("junk".into()).is_fatal());
    }

    #[test]
    fn json_errors_become_protocol_errors() {
        let err = serde_json::from_str::<serde_json::Value>("{nope").unwrap_err();
        let e: StreamError = err.into();
        assert!(matches!(e, StreamError::Protocol(_)));
    }
}
