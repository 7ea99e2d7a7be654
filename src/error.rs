//! Error types for the voice pipeline

use std::time::Duration;

use thiserror::Error;

/// Result type alias for voice pipeline operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the voice pipeline
///
/// None of these are process-fatal: sessions recover or degrade locally.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Audio processing error (resampler construction, WAV I/O)
    #[error("audio error: {0}")]
    Audio(String),

    /// Audio frame does not match the expected format
    #[error("invalid audio format: {0}")]
    InvalidAudioFormat(String),

    /// Network failure on a streaming STT/TTS connection
    #[error("transport error: {0}")]
    Transport(String),

    /// Speech-to-text provider error
    #[error("STT error: {0}")]
    Stt(String),

    /// Text-to-speech provider error
    #[error("TTS error: {0}")]
    Tts(String),

    /// Synthesis for one generation failed upstream
    #[error("synthesis failed: {0}")]
    SynthesisFailed(String),

    /// Generation was cancelled by barge-in; control flow, not a failure
    #[error("generation {0} cancelled")]
    GenerationCancelled(u64),

    /// Text generation error
    #[error("LLM error: {0}")]
    Llm(String),

    /// A bounded operation ran out of time
    #[error("{operation} timed out after {}ms", .after.as_millis())]
    Timeout {
        /// What was being waited on
        operation: &'static str,
        /// The configured bound
        after: Duration,
    },

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// WebSocket error
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Create a timeout error for the named operation
    #[must_use]
    pub const fn timeout(operation: &'static str, after: Duration) -> Self {
        Self::Timeout { operation, after }
    }

    /// Whether this error came from the network underneath a streaming connection
    #[must_use]
    pub const fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::Transport(_) | Self::WebSocket(_) | Self::Http(_) | Self::Io(_)
        )
    }

    /// Whether this error is the barge-in cancellation signal
    #[must_use]
    pub const fn is_cancellation(&self) -> bool {
        matches!(self, Self::GenerationCancelled(_))
    }

    /// Whether this error is a timeout
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancellation_is_not_a_failure() {
        let err = Error::GenerationCancelled(3);
        assert!(err.is_cancellation());
        assert!(!err.is_transport());
        assert_eq!(err.to_string(), "generation 3 cancelled");
    }

    #[test]
    fn timeout_message_names_operation() {
        let err = Error::timeout("TTS open", Duration::from_millis(1500));
        assert!(err.is_timeout());
        assert_eq!(err.to_string(), "TTS open timed out after 1500ms");
    }

    #[test]
    fn transport_classification() {
        assert!(Error::Transport("reset".to_string()).is_transport());
        assert!(!Error::SynthesisFailed("500".to_string()).is_transport());
    }
}
