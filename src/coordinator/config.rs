//! Coordinator configuration
//!
//! Loaded from TOML; every section has defaults so a file naming only the
//! backend is valid.

use crate::backend::BackendConfig;
use crate::prompts::VoicePrompt;
use crate::{Result, TalkbackError};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Configuration for one coordinator session
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Backend selection and its settings
    pub backend: BackendConfig,

    /// Transport keep-alive
    pub keepalive: KeepaliveConfig,

    /// Reconnect-with-backoff policy
    pub reconnect: ReconnectPolicy,

    /// Upper bound on waiting for a reply; `None` waits forever
    pub silence_timeout_ms: Option<u64>,

    /// Spoken phrases for failure conditions
    pub fallback: FallbackPhrases,

    /// Utterance tagging and system prompt
    pub voice_prompt: VoicePrompt,

    /// Capacity of the observability event channel
    pub event_buffer_size: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig::default(),
            keepalive: KeepaliveConfig::default(),
            reconnect: ReconnectPolicy::default(),
            silence_timeout_ms: None,
            fallback: FallbackPhrases::default(),
            voice_prompt: VoicePrompt::default(),
            event_buffer_size: 256,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct KeepaliveConfig {
    /// Probe period
    pub interval_ms: u64,
    /// Probe answer deadline before the session counts as disconnected
    pub timeout_ms: u64,
}

impl Default for KeepaliveConfig {
    fn default() -> Self {
        Self {
            interval_ms: 20_000,
            timeout_ms: 10_000,
        }
    }
}

impl KeepaliveConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub multiplier: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1000,
            multiplier: 2,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = u64::from(self.multiplier).saturating_pow(exponent);
        Duration::from_millis(self.initial_delay_ms.saturating_mul(factor))
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FallbackPhrases {
    /// Queued in place of a turn lost to a dropped connection
    pub connection_lost: String,
    /// Spoken when reconnect attempts are exhausted
    pub unavailable: String,
}

impl Default for FallbackPhrases {
    fn default() -> Self {
        Self {
            connection_lost: TalkbackError::Connection(String::new()).user_message(),
            unavailable: TalkbackError::BackendUnavailable {
                attempts: 0,
                reason: String::new(),
            }
            .user_message(),
        }
    }
}

impl CoordinatorConfig {
    pub fn new(backend: BackendConfig) -> Self {
        Self {
            backend,
            ..Default::default()
        }
    }

    /// Load and validate a TOML configuration file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            TalkbackError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content).map_err(|e| match e {
            TalkbackError::Config(msg) => {
                TalkbackError::Config(format!("{}: {}", path.display(), msg))
            }
            other => other,
        })
    }

    /// Parse and validate TOML text
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: CoordinatorConfig =
            toml::from_str(content).map_err(|e| TalkbackError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_keepalive(mut self, interval_ms: u64, timeout_ms: u64) -> Self {
        self.keepalive = KeepaliveConfig {
            interval_ms,
            timeout_ms,
        };
        self
    }

    pub fn with_reconnect(mut self, max_attempts: u32, initial_delay_ms: u64) -> Self {
        self.reconnect.max_attempts = max_attempts;
        self.reconnect.initial_delay_ms = initial_delay_ms;
        self
    }

    pub fn with_silence_timeout(mut self, timeout_ms: u64) -> Self {
        self.silence_timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_voice_prompt(mut self, prompt: VoicePrompt) -> Self {
        self.voice_prompt = prompt;
        self
    }

    pub fn silence_timeout(&self) -> Option<Duration> {
        self.silence_timeout_ms.map(Duration::from_millis)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.backend.validate()?;

        if self.keepalive.interval_ms == 0 {
            return Err(TalkbackError::Config(
                "keepalive.interval_ms must be > 0".to_string(),
            ));
        }
        if self.keepalive.timeout_ms == 0 {
            return Err(TalkbackError::Config(
                "keepalive.timeout_ms must be > 0".to_string(),
            ));
        }
        if self.reconnect.multiplier == 0 {
            return Err(TalkbackError::Config(
                "reconnect.multiplier must be > 0".to_string(),
            ));
        }
        if self.silence_timeout_ms == Some(0) {
            return Err(TalkbackError::Config(
                "silence_timeout_ms must be > 0 when set".to_string(),
            ));
        }
        if self.event_buffer_size == 0 {
            return Err(TalkbackError::Config(
                "event_buffer_size must be > 0".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendKind, SubprocessConfig};
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = CoordinatorConfig::default();
        assert_eq!(config.backend.kind(), BackendKind::TwoPhase);
        assert_eq!(config.reconnect.max_attempts, 3);
        assert_eq!(config.silence_timeout_ms, None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = ReconnectPolicy::default();
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
silence_timeout_ms = 30000

[backend]
kind = "pi"
binary = "/usr/local/bin/pi"
working_dir = "/tmp"

[reconnect]
initial_delay_ms = 250

[voice_prompt]
tag = ""
"#
        )
        .unwrap();

        let config = CoordinatorConfig::load(file.path()).unwrap();
        assert_eq!(
            config.backend,
            BackendConfig::Subprocess(
                SubprocessConfig::new("/usr/local/bin/pi").with_working_dir("/tmp")
            )
        );
        assert_eq!(config.reconnect.initial_delay_ms, 250);
        assert_eq!(config.reconnect.max_attempts, 3);
        assert_eq!(config.silence_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(config.voice_prompt.format(" hi "), "hi");
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = CoordinatorConfig::from_toml("silence_timeout_ms = 0").unwrap_err();
        assert!(matches!(err, TalkbackError::Config(_)));

        let err = CoordinatorConfig::from_toml("[backend]\nkind = \"telepathy\"").unwrap_err();
        assert!(matches!(err, TalkbackError::Config(_)));
    }

    #[test]
    fn test_missing_file() {
        let err = CoordinatorConfig::load("/nonexistent/talkback.toml").unwrap_err();
        assert!(matches!(err, TalkbackError::Config(_)));
    }
}
