//! Configuration management for Manifold.
//!
//! Provides structured configuration with validation for governance, pipeline and RPC settings.
//!
//! # Configuration Sources
//!
//! Configuration can be loaded from:
//! - Environment variables (prefixed with `MANIFOLD_`)
//! - Configuration files (JSON)
//! - Programmatic defaults
//!
//! # Example
//!
//! ```rust,ignore
//! use manifold_core::config::ManifoldConfig;
//!
//! let config = ManifoldConfig::builder()
//!     .activation_delay_secs(3600)
//!     .rpc_url("http://127.0.0.1:8545")
//!     .build()?;
//! ```

use crate::{Hash32, ManifoldError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Complete Manifold configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ManifoldConfig {
    /// Governance state machine configuration.
    pub governance: GovernanceConfig,

    /// Reconciliation pipeline configuration.
    pub pipeline: PipelineConfig,

    /// JSON-RPC code source configuration.
    pub rpc: RpcConfig,

    /// Diff report configuration.
    pub report: ReportConfig,

    /// Logging configuration.
    pub logging: LoggingConfig,
}

impl ManifoldConfig {
    /// Create a new configuration builder.
    pub fn builder() -> ManifoldConfigBuilder {
        ManifoldConfigBuilder::default()
    }

    /// Load configuration from environment variables.
    ///
    /// Looks for variables prefixed with `MANIFOLD_`:
    /// - `MANIFOLD_ACTIVATION_DELAY_SECS` - Delay between commit and activation
    /// - `MANIFOLD_OUTPUT_DIR` - Pipeline output directory
    /// - `MANIFOLD_ARTIFACTS_DIR` - Compiler artifacts directory
    /// - `MANIFOLD_BUILD_ID` - Build or chain identifier stamped into snapshots
    /// - `MANIFOLD_EXPECTED_ROOT` - Root the predictive build must reproduce
    /// - `MANIFOLD_RPC_URL` - JSON-RPC endpoint
    /// - `MANIFOLD_RPC_TIMEOUT_MS` - Per-request timeout
    /// - `MANIFOLD_LOG_LEVEL` - Logging level (trace, debug, info, warn, error)
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as `from_env`, reading variables through `lookup`.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(delay) = lookup("MANIFOLD_ACTIVATION_DELAY_SECS") {
            config.governance.activation_delay_secs = delay.parse().map_err(|e| {
                ManifoldError::ConfigError(format!("Invalid MANIFOLD_ACTIVATION_DELAY_SECS: {}", e))
            })?;
        }

        if let Some(dir) = lookup("MANIFOLD_OUTPUT_DIR") {
            config.pipeline.output_dir = PathBuf::from(dir);
        }

        if let Some(dir) = lookup("MANIFOLD_ARTIFACTS_DIR") {
            config.pipeline.artifacts_dir = PathBuf::from(dir);
        }

        if let Some(id) = lookup("MANIFOLD_BUILD_ID") {
            config.pipeline.build_or_chain_id = id;
        }

        if let Some(root) = lookup("MANIFOLD_EXPECTED_ROOT") {
            let root: Hash32 = root.parse().map_err(|e| {
                ManifoldError::ConfigError(format!("Invalid MANIFOLD_EXPECTED_ROOT: {}", e))
            })?;
            config.pipeline.expected_root = Some(root);
        }

        if let Some(url) = lookup("MANIFOLD_RPC_URL") {
            config.rpc.url = Some(url);
        }

        if let Some(timeout) = lookup("MANIFOLD_RPC_TIMEOUT_MS") {
            config.rpc.timeout_ms = timeout.parse().map_err(|e| {
                ManifoldError::ConfigError(format!("Invalid MANIFOLD_RPC_TIMEOUT_MS: {}", e))
            })?;
        }

        if let Some(level) = lookup("MANIFOLD_LOG_LEVEL") {
            config.logging.level = level;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a JSON file. Missing sections take their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ManifoldError::io(format!("reading config {}", path.display()), e))?;
        let config: Self = serde_json::from_str(&raw).map_err(|e| {
            ManifoldError::ConfigError(format!("Invalid config {}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<()> {
        if self.governance.activation_delay_secs > self.governance.max_activation_delay_secs {
            return Err(ManifoldError::ConfigError(format!(
                "activation_delay_secs {} exceeds max_activation_delay_secs {}",
                self.governance.activation_delay_secs, self.governance.max_activation_delay_secs
            )));
        }

        if self.pipeline.facet_suffix.is_empty() {
            return Err(ManifoldError::ConfigError(
                "facet_suffix must not be empty".into(),
            ));
        }

        if self.pipeline.build_or_chain_id.trim().is_empty() {
            return Err(ManifoldError::ConfigError(
                "build_or_chain_id must not be empty".into(),
            ));
        }

        if let Some(ref url) = self.rpc.url {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(ManifoldError::ConfigError(
                    "rpc.url must use http or https".into(),
                ));
            }
        }

        if self.rpc.timeout_ms == 0 {
            return Err(ManifoldError::ConfigError(
                "rpc.timeout_ms must be greater than 0".into(),
            ));
        }

        if self.rpc.retry_count > MAX_RPC_RETRIES {
            return Err(ManifoldError::ConfigError(format!(
                "rpc.retry_count must be at most {MAX_RPC_RETRIES}"
            )));
        }

        if self.report.preview_limit == 0 {
            return Err(ManifoldError::ConfigError(
                "report.preview_limit must be greater than 0".into(),
            ));
        }

        Ok(())
    }
}

/// Hard ceiling on JSON-RPC retries.
pub const MAX_RPC_RETRIES: u32 = 3;

/// Governance configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernanceConfig {
    /// Seconds a committed root must wait before it may activate.
    pub activation_delay_secs: u64,

    /// Upper bound accepted by `set_activation_delay`.
    pub max_activation_delay_secs: u64,
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        Self {
            activation_delay_secs: 86_400,          // 1 day
            max_activation_delay_secs: 2_592_000, // 30 days
        }
    }
}

/// Reconciliation pipeline configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Directory receiving root/merkle/proof artifacts, snapshots and SHA256SUMS.
    pub output_dir: PathBuf,

    /// Compiler output directory scanned for facet artifacts.
    pub artifacts_dir: PathBuf,

    /// Artifact file stem suffix identifying facets (`<Name><suffix>.json`).
    pub facet_suffix: String,

    /// Stamped into every snapshot.
    pub build_or_chain_id: String,

    /// Root the predictive build must reproduce, if pinned.
    pub expected_root: Option<Hash32>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("split-output"),
            artifacts_dir: PathBuf::from("artifacts"),
            facet_suffix: "Facet".into(),
            build_or_chain_id: "local".into(),
            expected_root: None,
        }
    }
}

/// JSON-RPC configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Endpoint URL; required only by the observed flow.
    pub url: Option<String>,

    /// Per-request timeout in milliseconds.
    pub timeout_ms: u64,

    /// Retries on transient failures (at most `MAX_RPC_RETRIES`).
    pub retry_count: u32,

    /// Block tag passed to `eth_getCode`.
    pub block_tag: String,
}

impl RpcConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_ms: 10_000,
            retry_count: MAX_RPC_RETRIES,
            block_tag: "latest".into(),
        }
    }
}

/// Diff report configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    /// Entries shown per list in human-readable previews.
    pub preview_limit: usize,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self { preview_limit: 20 }
    }
}

/// Logging configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    pub level: String,

    /// JSON output format.
    pub json_output: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            json_output: false,
        }
    }
}

/// Builder for ManifoldConfig.
#[derive(Default)]
pub struct ManifoldConfigBuilder {
    config: ManifoldConfig,
}

impl ManifoldConfigBuilder {
    /// Set the activation delay.
    pub fn activation_delay_secs(mut self, secs: u64) -> Self {
        self.config.governance.activation_delay_secs = secs;
        self
    }

    /// Set the activation delay ceiling.
    pub fn max_activation_delay_secs(mut self, secs: u64) -> Self {
        self.config.governance.max_activation_delay_secs = secs;
        self
    }

    /// Set the output directory.
    pub fn output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.pipeline.output_dir = dir.into();
        self
    }

    /// Set the compiler artifacts directory.
    pub fn artifacts_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.pipeline.artifacts_dir = dir.into();
        self
    }

    /// Set the build or chain identifier.
    pub fn build_or_chain_id(mut self, id: impl Into<String>) -> Self {
        self.config.pipeline.build_or_chain_id = id.into();
        self
    }

    /// Pin the root the predictive build must reproduce.
    pub fn expected_root(mut self, root: Hash32) -> Self {
        self.config.pipeline.expected_root = Some(root);
        self
    }

    /// Set the JSON-RPC endpoint.
    pub fn rpc_url(mut self, url: impl Into<String>) -> Self {
        self.config.rpc.url = Some(url.into());
        self
    }

    /// Set the per-request RPC timeout.
    pub fn rpc_timeout(mut self, timeout: Duration) -> Self {
        self.config.rpc.timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the RPC retry count.
    pub fn rpc_retry_count(mut self, retries: u32) -> Self {
        self.config.rpc.retry_count = retries;
        self
    }

    /// Set the diff preview limit.
    pub fn preview_limit(mut self, limit: usize) -> Self {
        self.config.report.preview_limit = limit;
        self
    }

    /// Set log level.
    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    /// Enable JSON log output.
    pub fn json_logs(mut self, enabled: bool) -> Self {
        self.config.logging.json_output = enabled;
        self
    }

    /// Build and validate the configuration.
    pub fn build(self) -> Result<ManifoldConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_config_is_valid() {
        let config = ManifoldConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn builder_creates_valid_config() {
        let config = ManifoldConfig::builder()
            .activation_delay_secs(60)
            .rpc_url("https://rpc.example.org")
            .preview_limit(5)
            .log_level("debug")
            .build()
            .expect("should build");

        assert_eq!(config.governance.activation_delay_secs, 60);
        assert_eq!(config.rpc.url.as_deref(), Some("https://rpc.example.org"));
        assert_eq!(config.report.preview_limit, 5);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn delay_above_ceiling_rejected() {
        let result = ManifoldConfig::builder()
            .max_activation_delay_secs(10)
            .activation_delay_secs(11)
            .build();

        assert!(result.is_err());
    }

    #[test]
    fn non_http_rpc_url_rejected() {
        let result = ManifoldConfig::builder().rpc_url("ws://node:8546").build();

        assert!(result.is_err());
    }

    #[test]
    fn too_many_retries_rejected() {
        let result = ManifoldConfig::builder().rpc_retry_count(10).build();

        assert!(result.is_err());
    }

    #[test]
    fn lookup_overrides_defaults() {
        let vars: HashMap<&str, String> = [
            ("MANIFOLD_ACTIVATION_DELAY_SECS", "120".to_string()),
            ("MANIFOLD_BUILD_ID", "31337".to_string()),
            ("MANIFOLD_EXPECTED_ROOT", format!("0x{}", "11".repeat(32))),
        ]
        .into_iter()
        .collect();

        let config = ManifoldConfig::from_lookup(|k| vars.get(k).cloned()).unwrap();

        assert_eq!(config.governance.activation_delay_secs, 120);
        assert_eq!(config.pipeline.build_or_chain_id, "31337");
        assert_eq!(config.pipeline.expected_root, Some(Hash32([0x11; 32])));
    }

    #[test]
    fn lookup_rejects_unparseable_delay() {
        let result = ManifoldConfig::from_lookup(|k| {
            (k == "MANIFOLD_ACTIVATION_DELAY_SECS").then(|| "soon".to_string())
        });

        assert!(matches!(result, Err(ManifoldError::ConfigError(_))));
    }

    #[test]
    fn file_with_partial_sections_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manifold.json");
        std::fs::write(&path, r#"{"rpc":{"url":"http://localhost:8545"}}"#).unwrap();

        let config = ManifoldConfig::from_file(&path).unwrap();

        assert_eq!(config.rpc.url.as_deref(), Some("http://localhost:8545"));
        assert_eq!(config.rpc.block_tag, "latest");
        assert_eq!(config.report.preview_limit, 20);
    }
}
