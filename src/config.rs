//! Configuration file support
//!
//! Loaded from TOML; every section is optional and falls back to defaults.
//! Environment variables override file values.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::deframe::{DeframerConfig, KeyLog};
use crate::error::{FlowError, Result};
use crate::flow::{FlowConfig, FlowManager, FlowStore};
use crate::types::LinkType;

/// Root configuration structure
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Packet source settings
    pub capture: CaptureSettings,

    /// Flow store limits
    pub flow: FlowConfig,

    /// Initial deframing strategy
    pub deframer: DeframerConfig,

    pub logging: LoggingSettings,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    /// Capture file to replay
    pub pcap_file: Option<PathBuf>,

    /// Only track flows touching this port
    pub target_port: Option<u16>,

    /// Link type to assume when the capture header is not trusted
    pub link_type: Option<LinkType>,

    /// NSS key log for TLS flows
    pub key_log_file: Option<PathBuf>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default tracing filter when RUST_LOG is unset
    pub level: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

const DEFAULT_CONFIG: &str = r#"# flowscribe configuration

[capture]
# pcap_file = "capture.pcap"
# target_port = 443
# key_log_file = "/tmp/sslkeys.log"

[flow]
max_flows = 100000
max_stream_bytes = 16777216

[deframer]
# raw | http | https_with_key_log | length_prefixed
kind = "raw"

# kind = "length_prefixed"
# length_offset = 0
# length_width = 2
# endian = "little"
# max_length = 16777216
# length_includes_header = false
# type_field = { offset = 2, width = 1 }

[logging]
level = "info"
"#;

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            FlowError::Config(format!(
                "Failed to read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        let mut config = Self::from_str(&content)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self> {
        toml::from_str(content)
            .map_err(|e| FlowError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Serialize configuration to a TOML string
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| FlowError::Config(format!("Failed to serialize config: {}", e)))
    }

    /// Default config file content with comments
    pub fn default_with_comments() -> &'static str {
        DEFAULT_CONFIG
    }

    pub fn validate(&self) -> Result<()> {
        self.deframer.validate()?;
        if self.flow.max_flows == 0 {
            return Err(FlowError::Config("flow.max_flows must be non-zero".into()));
        }
        Ok(())
    }

    /// Apply environment variable overrides.
    ///
    /// Supported environment variables:
    /// - SSLKEYLOGFILE
    /// - FLOWSCRIBE_TARGET_PORT (empty or "any" clears the filter)
    /// - FLOWSCRIBE_LOG_LEVEL
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("SSLKEYLOGFILE") {
            if !v.is_empty() {
                self.capture.key_log_file = Some(PathBuf::from(v));
            }
        }
        if let Ok(v) = std::env::var("FLOWSCRIBE_TARGET_PORT") {
            let v = v.trim();
            if v.is_empty() || v.eq_ignore_ascii_case("any") {
                self.capture.target_port = None;
            } else if let Ok(port) = v.parse() {
                self.capture.target_port = Some(port);
            }
        }
        if let Ok(v) = std::env::var("FLOWSCRIBE_LOG_LEVEL") {
            self.logging.level = v;
        }
    }

    /// Build a manager over a fresh store with this configuration applied
    pub fn build_manager(&self) -> anyhow::Result<FlowManager> {
        let manager = FlowManager::new(FlowStore::new(self.flow.clone()))
            .with_target_port(self.capture.target_port);
        if let Some(path) = &self.capture.key_log_file {
            let log = KeyLog::from_file(path)?;
            manager.set_key_log(Some(Arc::new(log)));
        }
        manager.set_deframer(self.deframer.clone())?;
        Ok(manager)
    }
}
