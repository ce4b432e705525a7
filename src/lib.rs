//! Talkback - backend response coordinator for a voice front end
//!
//! Sends user utterances to one of several remote AI backends, reconciles
//! their streaming, two-phase, or RPC replies against conversational turns,
//! and guarantees that superseded or interrupted responses never reach the
//! speaker output.

pub mod backend;
pub mod coordinator;
pub mod messages;
pub mod prompts;

use thiserror::Error;

pub use backend::{Backend, BackendConfig, BackendInfo, BackendKind};
pub use coordinator::{
    Coordinator, CoordinatorConfig, CoordinatorEvent, DiscardReason, SessionInfo, SessionState,
    TurnHandle, TurnState,
};
pub use messages::{CorrelationId, Normalized, ResponseEvent, ToolNotification};

#[derive(Error, Debug, Clone)]
pub enum TalkbackError {
    /// Handshake rejected, timed out, or the binary/credentials are missing
    #[error("Connection error: {0}")]
    Connection(String),

    /// Outbound write failed or the channel is not connected
    #[error("Send error: {0}")]
    Send(String),

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// Reconnect attempts exhausted
    #[error("Backend unavailable after {attempts} reconnect attempts: {reason}")]
    BackendUnavailable { attempts: u32, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Coordinator error: {0}")]
    Coordinator(String),
}

impl From<std::io::Error> for TalkbackError {
    fn from(e: std::io::Error) -> Self {
        TalkbackError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for TalkbackError {
    fn from(e: serde_json::Error) -> Self {
        TalkbackError::MalformedMessage(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for TalkbackError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        TalkbackError::Connection(e.to_string())
    }
}

impl TalkbackError {
    /// Check if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            // Reconnect policy handles these
            TalkbackError::Connection(_) => true,
            // Retried once by the session
            TalkbackError::Send(_) => true,
            // Dropped and logged
            TalkbackError::MalformedMessage(_) => true,
            TalkbackError::BackendUnavailable { .. } => false,
            TalkbackError::Config(_) => false,
            TalkbackError::Io(_) => false,
            TalkbackError::Channel(_) => false,
            TalkbackError::Coordinator(_) => false,
        }
    }

    /// Get the spoken fallback for this condition
    ///
    /// Never contains protocol details; safe to hand to text-to-speech.
    pub fn user_message(&self) -> String {
        match self {
            TalkbackError::Connection(_) | TalkbackError::Send(_) => {
                "Sorry, I'm having trouble connecting right now.".to_string()
            }
            TalkbackError::BackendUnavailable { .. } => {
                "Sorry, the assistant is unavailable right now. Please try again later."
                    .to_string()
            }
            TalkbackError::MalformedMessage(_) => {
                "Sorry, I didn't catch that response.".to_string()
            }
            TalkbackError::Config(_) => {
                "Configuration error. Please check settings.".to_string()
            }
            TalkbackError::Io(_) | TalkbackError::Channel(_) | TalkbackError::Coordinator(_) => {
                "Something went wrong. Please try again.".to_string()
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, TalkbackError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(TalkbackError::Connection("refused".into()).is_recoverable());
        assert!(TalkbackError::Send("closed".into()).is_recoverable());
        assert!(!TalkbackError::BackendUnavailable {
            attempts: 3,
            reason: "refused".into()
        }
        .is_recoverable());
        assert!(!TalkbackError::Config("bad".into()).is_recoverable());
    }

    #[test]
    fn test_user_message_hides_protocol_details() {
        let err = TalkbackError::Connection("{\"type\":\"res\",\"ok\":false}".into());
        let spoken = err.user_message();
        assert!(!spoken.contains("res"));
        assert!(spoken.contains("trouble connecting"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "pi not found");
        let err: TalkbackError = io.into();
        assert!(matches!(err, TalkbackError::Io(_)));
    }
}
