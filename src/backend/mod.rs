//! Backend adapters
//!
//! The set of backends is closed: [`Backend`] dispatches by exhaustive match,
//! so the coordinator never sees backend-specific wire shapes, only
//! [`Normalized`] events.

pub mod auth;
pub mod pending;
pub mod process;
pub mod protocol;
pub mod socket;
pub mod streaming;
pub mod subprocess;
pub mod two_phase;

pub use auth::DeviceIdentity;
pub use streaming::{SessionStrategy, StreamingBackend, StreamingConfig};
pub use subprocess::{SubprocessBackend, SubprocessConfig};
pub use two_phase::{TwoPhaseBackend, TwoPhaseConfig};

use crate::messages::{CorrelationId, Normalized, TransportEvent};
use crate::{Result, TalkbackError};
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;

/// Backend family
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Immediate ack, optional later content event
    TwoPhase,
    /// Delta events then a terminal event
    Streaming,
    /// Line-delimited RPC with a child process
    Subprocess,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::TwoPhase => "two_phase",
            BackendKind::Streaming => "streaming",
            BackendKind::Subprocess => "subprocess",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = TalkbackError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "two_phase" | "two-phase" | "openclaw" => Ok(BackendKind::TwoPhase),
            "streaming" | "moltis" => Ok(BackendKind::Streaming),
            "subprocess" | "pi" => Ok(BackendKind::Subprocess),
            other => Err(TalkbackError::Config(format!(
                "unknown backend kind '{}'",
                other
            ))),
        }
    }
}

/// Backend selection plus its settings, tagged by `kind`
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    #[serde(alias = "openclaw")]
    TwoPhase(TwoPhaseConfig),
    #[serde(alias = "moltis")]
    Streaming(StreamingConfig),
    #[serde(alias = "pi")]
    Subprocess(SubprocessConfig),
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::TwoPhase(TwoPhaseConfig::default())
    }
}

impl BackendConfig {
    /// Default settings for `kind`
    pub fn for_kind(kind: BackendKind) -> Self {
        match kind {
            BackendKind::TwoPhase => BackendConfig::TwoPhase(TwoPhaseConfig::default()),
            BackendKind::Streaming => BackendConfig::Streaming(StreamingConfig::default()),
            BackendKind::Subprocess => BackendConfig::Subprocess(SubprocessConfig::default()),
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            BackendConfig::TwoPhase(_) => BackendKind::TwoPhase,
            BackendConfig::Streaming(_) => BackendKind::Streaming,
            BackendConfig::Subprocess(_) => BackendKind::Subprocess,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            BackendConfig::TwoPhase(config) => {
                validate_url(&config.gateway_url)?;
                if config.session_key.trim().is_empty() {
                    return Err(TalkbackError::Config("session_key must not be empty".into()));
                }
                if config.connect_timeout_ms == 0 {
                    return Err(TalkbackError::Config("connect_timeout_ms must be > 0".into()));
                }
            }
            BackendConfig::Streaming(config) => {
                validate_url(&config.gateway_url)?;
                if config.agent_id.trim().is_empty() {
                    return Err(TalkbackError::Config("agent_id must not be empty".into()));
                }
                if config.connect_timeout_ms == 0 {
                    return Err(TalkbackError::Config("connect_timeout_ms must be > 0".into()));
                }
            }
            BackendConfig::Subprocess(config) => {
                if config.binary.trim().is_empty() {
                    return Err(TalkbackError::Config("binary must not be empty".into()));
                }
            }
        }
        Ok(())
    }
}

fn validate_url(url: &str) -> Result<()> {
    if url.starts_with("ws://") || url.starts_with("wss://") {
        Ok(())
    } else {
        Err(TalkbackError::Config(format!(
            "gateway_url must be a ws:// or wss:// URL, got '{}'",
            url
        )))
    }
}

/// What a session is talking to, for logs and status output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendInfo {
    pub kind: BackendKind,
    /// Gateway URL or binary path
    pub endpoint: String,
    /// Gateway session key; the working directory for subprocess backends
    pub session_key: String,
}

impl fmt::Display for BackendInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {} ({})", self.kind, self.endpoint, self.session_key)
    }
}

/// One active backend adapter
pub enum Backend {
    TwoPhase(TwoPhaseBackend),
    Streaming(StreamingBackend),
    Subprocess(SubprocessBackend),
}

impl Backend {
    /// Build the adapter selected by `config`
    ///
    /// `system_prompt` is used by backends that carry one in their requests.
    pub fn from_config(config: &BackendConfig, system_prompt: &str) -> Self {
        match config {
            BackendConfig::TwoPhase(c) => Backend::TwoPhase(TwoPhaseBackend::new(c.clone())),
            BackendConfig::Streaming(c) => Backend::Streaming(StreamingBackend::new(c.clone())),
            BackendConfig::Subprocess(c) => {
                Backend::Subprocess(SubprocessBackend::new(c.clone(), system_prompt))
            }
        }
    }

    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::TwoPhase(_) => BackendKind::TwoPhase,
            Backend::Streaming(_) => BackendKind::Streaming,
            Backend::Subprocess(_) => BackendKind::Subprocess,
        }
    }

    pub fn info(&self) -> BackendInfo {
        let (endpoint, session_key) = match self {
            Backend::TwoPhase(b) => (b.config().gateway_url.clone(), b.session_key().to_string()),
            Backend::Streaming(b) => (b.config().gateway_url.clone(), b.session_key().to_string()),
            Backend::Subprocess(b) => (
                b.config().binary.clone(),
                b.config().working_dir.display().to_string(),
            ),
        };
        BackendInfo {
            kind: self.kind(),
            endpoint,
            session_key,
        }
    }

    pub fn is_connected(&self) -> bool {
        match self {
            Backend::TwoPhase(b) => b.is_connected(),
            Backend::Streaming(b) => b.is_connected(),
            Backend::Subprocess(b) => b.is_connected(),
        }
    }

    /// Establish the channel; raw inbound traffic goes to `inbound`
    pub async fn connect(&mut self, inbound: UnboundedSender<TransportEvent>) -> Result<()> {
        match self {
            Backend::TwoPhase(b) => b.connect(inbound).await,
            Backend::Streaming(b) => b.connect(inbound).await,
            Backend::Subprocess(b) => b.connect(inbound).await,
        }
    }

    /// Send one request and register it as pending
    pub async fn send(&mut self, correlation: &CorrelationId, message: &str) -> Result<()> {
        match self {
            Backend::TwoPhase(b) => b.send(correlation, message).await,
            Backend::Streaming(b) => b.send(correlation, message).await,
            Backend::Subprocess(b) => b.send(correlation, message).await,
        }
    }

    /// Classify one raw inbound message
    pub fn normalize(&mut self, raw: &str) -> Vec<Normalized> {
        match self {
            Backend::TwoPhase(b) => b.normalize(raw),
            Backend::Streaming(b) => b.normalize(raw),
            Backend::Subprocess(b) => b.normalize(raw),
        }
    }

    /// Finalize requests that stayed silent past `bound` as empty
    pub fn expire_silent(&mut self, bound: Duration) -> Vec<Normalized> {
        match self {
            Backend::TwoPhase(b) => b.expire_silent(bound),
            Backend::Streaming(b) => b.expire_silent(bound),
            Backend::Subprocess(b) => b.expire_silent(bound),
        }
    }

    /// Keep-alive; an error means the connection is gone
    pub async fn probe(&mut self, timeout: Duration) -> Result<()> {
        match self {
            Backend::TwoPhase(b) => b.probe(timeout).await,
            Backend::Streaming(b) => b.probe(timeout).await,
            Backend::Subprocess(b) => b.probe(),
        }
    }

    /// Forget the transport and all pending requests after a failure
    pub fn reset(&mut self) -> Vec<CorrelationId> {
        match self {
            Backend::TwoPhase(b) => b.reset(),
            Backend::Streaming(b) => b.reset(),
            Backend::Subprocess(b) => b.reset(),
        }
    }

    pub async fn close(&mut self) {
        match self {
            Backend::TwoPhase(b) => b.close().await,
            Backend::Streaming(b) => b.close().await,
            Backend::Subprocess(b) => b.close().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_aliases() {
        assert_eq!("openclaw".parse::<BackendKind>().unwrap(), BackendKind::TwoPhase);
        assert_eq!("Moltis".parse::<BackendKind>().unwrap(), BackendKind::Streaming);
        assert_eq!("pi".parse::<BackendKind>().unwrap(), BackendKind::Subprocess);
        assert!("carrier-pigeon".parse::<BackendKind>().is_err());
        assert_eq!(BackendKind::TwoPhase.to_string(), "two_phase");
    }

    #[test]
    fn test_config_tagged_by_kind() {
        let config: BackendConfig = toml::from_str(
            r#"
            kind = "streaming"
            gateway_url = "ws://127.0.0.1:9000/ws"
            session_strategy = "daily"
            "#,
        )
        .unwrap();
        match &config {
            BackendConfig::Streaming(c) => {
                assert_eq!(c.session_strategy, SessionStrategy::Daily);
                assert_eq!(c.agent_id, "main");
            }
            other => panic!("unexpected config: {:?}", other),
        }
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_url() {
        let config = BackendConfig::TwoPhase(TwoPhaseConfig::new("http://localhost"));
        assert!(matches!(config.validate(), Err(TalkbackError::Config(_))));
    }

    #[test]
    fn test_info_reports_endpoint() {
        let backend = Backend::from_config(&BackendConfig::default(), "");
        let info = backend.info();
        assert_eq!(info.kind, BackendKind::TwoPhase);
        assert_eq!(info.endpoint, two_phase::DEFAULT_GATEWAY_URL);
        assert_eq!(info.session_key, two_phase::DEFAULT_SESSION_KEY);
        assert!(!backend.is_connected());
    }
}
