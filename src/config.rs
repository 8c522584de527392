//! Configuration loaded from `~/.config/channelkit/config.toml`.
//!
//! Every section is optional; a missing file yields [`Config::default`].
//!
//! ```toml
//! [fetch]
//! timeout_secs = 30
//! retry = true
//!
//! [hls]
//! url_join = "legacy"
//!
//! [adaptive]
//! engine = "inputstream.adaptive"
//! hls = true
//! dash = true
//! drm = true
//!
//! [orchestrator]
//! workers = 4
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::stream::hls::UrlJoin;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub fetch: FetchConfig,
    pub hls: HlsConfig,
    pub adaptive: AdaptiveConfig,
    pub orchestrator: OrchestratorConfig,
}

/// Network settings for [`HttpFetcher`](crate::fetch::HttpFetcher).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub user_agent: String,
    pub connect_timeout_secs: u64,
    /// Per-request timeout.
    pub timeout_secs: u64,
    /// Retry once on connection-level failures.
    pub retry: bool,
    /// Maximum cached responses; 0 disables the cache.
    pub cache_capacity: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            user_agent: format!("channelkit/{}", env!("CARGO_PKG_VERSION")),
            connect_timeout_secs: 10,
            timeout_secs: 30,
            retry: true,
            cache_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HlsConfig {
    pub url_join: UrlJoin,
}

/// Capabilities of the external native adaptive engine, if any.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AdaptiveConfig {
    /// Engine identifier; `None` means no engine is installed.
    pub engine: Option<String>,
    pub hls: bool,
    pub dash: bool,
    pub drm: bool,
    /// Hand unencrypted HLS to the engine instead of expanding the manifest.
    pub prefer_native: bool,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            engine: None,
            hls: true,
            dash: true,
            drm: false,
            prefer_native: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Concurrent leaf resolutions in `complete_all`.
    pub workers: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self { workers: 4 }
    }
}

impl Config {
    /// Load from the default location.
    ///
    /// Returns defaults if the file doesn't exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        Self::load_from(&config_path())
    }

    /// Load from an explicit path, falling back to defaults if it is absent.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;

        let config: Config =
            toml::from_str(&content).with_context(|| format!("invalid TOML in {}", path.display()))?;

        Ok(config.normalized())
    }

    fn normalized(mut self) -> Self {
        self.orchestrator.workers = self.orchestrator.workers.max(1);
        self
    }
}

/// Return the path to the config file.
pub fn config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("channelkit")
        .join("config.toml")
}
