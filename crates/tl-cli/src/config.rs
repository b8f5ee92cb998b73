//! Configuration loading and management.

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use tl_sync::{EngineConfig, LiveRequest, PipelineConfig};

/// Application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Path to the database file.
    pub database_path: PathBuf,
    /// Directory holding `<project>/<session_id>.jsonl` logs.
    pub log_root: PathBuf,
    pub debounce_ms: u64,
    pub lock_timeout_ms: u64,
    pub pass_timeout_ms: u64,
    /// Rescan period when file watching is unavailable.
    pub rescan_interval_secs: u64,
    /// Agent CLI used by `tl live`.
    pub claude_binary: String,
    pub live_line_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs_data_path().unwrap_or_else(|| PathBuf::from("."));
        Self {
            database_path: data_dir.join("threadline.db"),
            log_root: default_log_root().unwrap_or_else(|| PathBuf::from(".claude/projects")),
            debounce_ms: 250,
            lock_timeout_ms: 5_000,
            pass_timeout_ms: 30_000,
            rescan_interval_secs: 60,
            claude_binary: "claude".to_string(),
            live_line_timeout_secs: 300,
        }
    }
}

impl Config {
    /// Loads configuration, optionally from a specific file.
    #[expect(
        clippy::result_large_err,
        reason = "figment::Error is large but only returned at startup"
    )]
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, figment::Error> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        // Load from default config location
        if let Some(config_dir) = dirs_config_path() {
            figment = figment.merge(Toml::file(config_dir.join("config.toml")));
        }

        // Load from specified config file
        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        // Load from environment variables (TL_*)
        figment = figment.merge(Env::prefixed("TL_"));

        figment.extract()
    }

    pub const fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            lock_timeout: Duration::from_millis(self.lock_timeout_ms),
            pass_timeout: Duration::from_millis(self.pass_timeout_ms),
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            root: self.log_root.clone(),
            debounce: Duration::from_millis(self.debounce_ms),
            rescan_interval: Duration::from_secs(self.rescan_interval_secs),
        }
    }

    pub fn live_request(&self, prompt: impl Into<String>) -> LiveRequest {
        LiveRequest {
            binary: self.claude_binary.clone(),
            line_timeout: Duration::from_secs(self.live_line_timeout_secs),
            ..LiveRequest::new(prompt)
        }
    }
}

/// Returns the platform-specific config directory for threadline.
fn dirs_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("threadline"))
}

/// Returns the platform-specific data directory for threadline.
///
/// On Linux: `~/.local/share/threadline`
pub fn dirs_data_path() -> Option<PathBuf> {
    dirs::data_dir().map(|p| p.join("threadline"))
}

/// Where the agent CLI writes its session logs: `~/.claude/projects`.
fn default_log_root() -> Option<PathBuf> {
    dirs::home_dir().map(|p| p.join(".claude").join("projects"))
}
