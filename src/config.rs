//! Configuration for the snapshot orchestrator.
//!
//! All options are serde-deserializable so they can come from a JSON config
//! file, from an embedding application, or from test fixtures. Upload-mode
//! flags imply one another (`dry_run` ⇒ `skip_uploads` ⇒ `defer_uploads`)
//! and are resolved by [`Config::normalize`].

use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::logger::LogLevel;

/// Default port for the local control server handle.
pub const DEFAULT_PORT: u16 = 5338;

/// Default concurrency for both task queues when discovery does not set one.
pub const DEFAULT_CONCURRENCY: usize = 10;

/// Main configuration for a [`crate::Percy`](crate::percy::Percy) run.
///
/// # Examples
///
/// ```rust
/// use percy_core::Config;
///
/// let mut config = Config {
///     dry_run: true,
///     ..Default::default()
/// };
/// config.normalize();
/// assert!(config.skip_uploads && config.defer_uploads);
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    /// Minimum level for emitted log lines. `PERCY_LOGLEVEL` / `PERCY_DEBUG`
    /// take precedence when set.
    pub loglevel: Option<LogLevel>,

    /// Keep the uploads queue stopped until an explicit flush or stop.
    pub defer_uploads: bool,

    /// Never transmit uploads. Implies `defer_uploads`.
    pub skip_uploads: bool,

    /// Skip browser launch and resource discovery entirely and only report
    /// snapshot counts. Implies `skip_uploads`.
    pub dry_run: bool,

    /// API token. Falls back to the `PERCY_TOKEN` environment variable.
    pub token: Option<String>,

    /// Client identifier folded into the API user agent, e.g. `sdk/1.2.3`.
    pub client_info: Option<String>,

    /// Environment identifier folded into the API user agent.
    pub environment_info: Option<String>,

    /// Whether a local control server handle should be attached (default
    /// true). The server itself is provided by the embedder.
    pub server: bool,

    /// Port for the local control server handle (default 5338).
    pub port: u16,

    /// Whether to launch the headless browser on start (default true).
    /// Dry runs never launch a browser regardless of this flag.
    pub browser: bool,

    /// Defaults merged into every snapshot request.
    pub snapshot: SnapshotConfig,

    /// Resource discovery settings, including queue concurrency.
    pub discovery: DiscoveryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            loglevel: None,
            defer_uploads: false,
            skip_uploads: false,
            dry_run: false,
            token: None,
            client_info: None,
            environment_info: None,
            server: true,
            port: DEFAULT_PORT,
            browser: true,
            snapshot: SnapshotConfig::default(),
            discovery: DiscoveryConfig::default(),
        }
    }
}

impl Config {
    /// Resolve mode implications: a dry run never uploads, and skipping
    /// uploads means the uploads queue never runs on its own.
    pub fn normalize(&mut self) {
        if self.dry_run {
            self.skip_uploads = true;
        }
        if self.skip_uploads {
            self.defer_uploads = true;
        }
    }

    /// Effective concurrency for both task queues.
    pub fn concurrency(&self) -> usize {
        self.discovery.concurrency.unwrap_or(DEFAULT_CONCURRENCY).max(1)
    }

    /// Effective API token, falling back to `PERCY_TOKEN`.
    pub fn resolve_token(&self) -> Option<String> {
        self.token
            .clone()
            .or_else(|| std::env::var("PERCY_TOKEN").ok().filter(|t| !t.is_empty()))
    }

    /// Load configuration from a JSON file and normalize it.
    pub async fn load(path: &std::path::Path) -> Result<Self, Error> {
        let content = tokio::fs::read_to_string(path).await?;
        let mut config: Config = serde_json::from_str(&content)?;
        config.normalize();
        Ok(config)
    }
}

/// Defaults applied to every snapshot request.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SnapshotConfig {
    /// Render widths in pixels requested for each snapshot.
    pub widths: Vec<u32>,

    /// Minimum page height in pixels.
    pub min_height: Option<u32>,

    /// Whether JavaScript is enabled during capture.
    pub enable_javascript: Option<bool>,
}

/// Resource discovery settings.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct DiscoveryConfig {
    /// Concurrency shared by the snapshots and uploads queues.
    pub concurrency: Option<usize>,

    /// Extra time in milliseconds to wait after navigation before capture.
    pub network_idle_timeout: Option<u64>,

    /// Hostnames (beyond the page's own) whose resources are captured.
    pub allowed_hostnames: Vec<String>,

    /// Disable the browser cache between snapshots.
    pub disable_cache: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.port, DEFAULT_PORT);
        assert!(config.server);
        assert!(config.browser);
        assert!(!config.defer_uploads);
        assert_eq!(config.concurrency(), DEFAULT_CONCURRENCY);
    }

    #[test]
    fn normalize_implications() {
        let mut config = Config {
            dry_run: true,
            ..Default::default()
        };
        config.normalize();
        assert!(config.skip_uploads);
        assert!(config.defer_uploads);

        let mut config = Config {
            skip_uploads: true,
            ..Default::default()
        };
        config.normalize();
        assert!(config.defer_uploads);
        assert!(!config.dry_run);
    }

    #[test]
    fn concurrency_floor_is_one() {
        let config = Config {
            discovery: DiscoveryConfig {
                concurrency: Some(0),
                ..Default::default()
            },
            ..Default::default()
        };
        assert_eq!(config.concurrency(), 1);
    }

    #[test]
    fn deserializes_kebab_case() {
        let config: Config = serde_json::from_str(
            r#"{"defer-uploads": true, "port": 5399, "discovery": {"concurrency": 2}}"#,
        )
        .unwrap();
        assert!(config.defer_uploads);
        assert_eq!(config.port, 5399);
        assert_eq!(config.concurrency(), 2);
    }
}
