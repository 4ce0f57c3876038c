//! Orchestrator configuration, loaded from TOML.
//!
//! Lookup order: an explicit `--config` path, then
//! `<config_dir>/fleetbid/orchestrator.toml`, then built-in defaults. Every
//! section is optional and missing keys take their defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use fleetbid_auction::BidConfig;
use fleetbid_protocol::{
    DEFAULT_BID_DEADLINE_MS, DEFAULT_BIND_ADDR, DEFAULT_CAPABILITY, DEFAULT_RESULT_TIMEOUT_MS, MAX_FRAME_BYTES,
    OUTBOUND_QUEUE_DEPTH, SCORE_HISTORY_LEN,
};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub server: ServerConfig,
    pub bidding: BiddingConfig,
    pub ledger: LedgerConfig,
    pub status: StatusConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address devices connect to.
    pub bind_addr: String,
    /// Bytes a connection may buffer without completing a message.
    pub max_frame_bytes: usize,
    /// Outbound messages queued per connection before sends fail.
    pub outbound_queue_depth: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            max_frame_bytes: MAX_FRAME_BYTES,
            outbound_queue_depth: OUTBOUND_QUEUE_DEPTH,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BiddingConfig {
    pub deadline_ms: u64,
    pub default_capability: String,
    pub skip_overloaded: bool,
    pub reassign_on_send_failure: bool,
    pub notify_source_on_failure: bool,
    /// How long an assigned task waits for the winner's result.
    pub result_timeout_ms: u64,
}

impl Default for BiddingConfig {
    fn default() -> Self {
        Self {
            deadline_ms: DEFAULT_BID_DEADLINE_MS,
            default_capability: DEFAULT_CAPABILITY.to_string(),
            skip_overloaded: false,
            reassign_on_send_failure: false,
            notify_source_on_failure: true,
            result_timeout_ms: DEFAULT_RESULT_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Observations kept in the scoring history (shared by all keys).
    pub history_len: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            history_len: SCORE_HISTORY_LEN,
        }
    }
}

/// HTTP status API. An empty `bind_addr` disables it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusConfig {
    pub bind_addr: String,
}

impl StatusConfig {
    pub fn enabled(&self) -> bool {
        !self.bind_addr.trim().is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
        }
    }
}

impl OrchestratorConfig {
    /// `<config_dir>/fleetbid/orchestrator.toml`, if the platform has a
    /// config directory.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("fleetbid").join("orchestrator.toml"))
    }

    /// Load from `path`, or the default location, or fall back to defaults.
    ///
    /// An explicit path that cannot be read is an error; a missing default
    /// file is not.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path().filter(|p| p.is_file()) {
                Some(path) => Self::from_file(&path)?,
                None => Self::default(),
            },
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::from_toml_str(&text).with_context(|| format!("parsing config file {}", path.display()))
    }

    pub fn from_toml_str(text: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Command-line flags win over file values.
    pub fn apply_overrides(&mut self, listen: Option<String>, deadline_ms: Option<u64>) {
        if let Some(addr) = listen {
            self.server.bind_addr = addr;
        }
        if let Some(ms) = deadline_ms {
            self.bidding.deadline_ms = ms;
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.bidding.deadline_ms == 0 {
            bail!("bidding.deadline_ms must be greater than zero");
        }
        if self.bidding.result_timeout_ms == 0 {
            bail!("bidding.result_timeout_ms must be greater than zero");
        }
        if self.ledger.history_len == 0 {
            bail!("ledger.history_len must be greater than zero");
        }
        if self.server.outbound_queue_depth == 0 {
            bail!("server.outbound_queue_depth must be greater than zero");
        }
        if self.server.max_frame_bytes == 0 {
            bail!("server.max_frame_bytes must be greater than zero");
        }
        if self.bidding.default_capability.trim().is_empty() {
            bail!("bidding.default_capability must not be empty");
        }
        Ok(())
    }

    pub fn bid_config(&self) -> BidConfig {
        BidConfig {
            deadline: Duration::from_millis(self.bidding.deadline_ms),
            default_capability: self.bidding.default_capability.clone(),
            skip_overloaded: self.bidding.skip_overloaded,
            reassign_on_send_failure: self.bidding.reassign_on_send_failure,
            notify_source_on_failure: self.bidding.notify_source_on_failure,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.server.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.bidding.deadline_ms, 5000);
        assert_eq!(config.bidding.default_capability, "classify");
        assert!(config.bidding.notify_source_on_failure);
        assert!(!config.bidding.reassign_on_send_failure);
        assert_eq!(config.bidding.result_timeout_ms, 300_000);
        assert_eq!(config.ledger.history_len, 10);
        assert!(!config.status.enabled());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let config = OrchestratorConfig::from_toml_str(
            r#"
            [bidding]
            deadline_ms = 10000
            skip_overloaded = true

            [status]
            bind_addr = "127.0.0.1:9090"
            "#,
        )
        .unwrap();
        assert_eq!(config.bidding.deadline_ms, 10_000);
        assert!(config.bidding.skip_overloaded);
        assert_eq!(config.bidding.default_capability, "classify");
        assert_eq!(config.server, ServerConfig::default());
        assert!(config.status.enabled());
    }

    #[test]
    fn overrides_win() {
        let mut config = OrchestratorConfig::default();
        config.apply_overrides(Some("127.0.0.1:7000".into()), Some(250));
        assert_eq!(config.server.bind_addr, "127.0.0.1:7000");
        assert_eq!(config.bid_config().deadline, Duration::from_millis(250));
    }

    #[test]
    fn rejects_zero_deadline() {
        let mut config = OrchestratorConfig::default();
        config.bidding.deadline_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_result_timeout() {
        let config = OrchestratorConfig::from_toml_str("[bidding]\nresult_timeout_ms = 0").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_unknown_value_types() {
        assert!(OrchestratorConfig::from_toml_str("[bidding]\ndeadline_ms = \"soon\"").is_err());
    }

    #[test]
    fn load_explicit_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orchestrator.toml");
        std::fs::write(&path, "[ledger]\nhistory_len = 25\n[logging]\nfilter = \"debug\"\n").unwrap();

        let config = OrchestratorConfig::load(Some(&path)).unwrap();
        assert_eq!(config.ledger.history_len, 25);
        assert_eq!(config.logging.filter, "debug");
    }

    #[test]
    fn load_missing_explicit_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(OrchestratorConfig::load(Some(&dir.path().join("absent.toml"))).is_err());
    }

    #[test]
    fn load_rejects_invalid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orchestrator.toml");
        std::fs::write(&path, "[ledger]\nhistory_len = 0\n").unwrap();
        assert!(OrchestratorConfig::load(Some(&path)).is_err());
    }
}
