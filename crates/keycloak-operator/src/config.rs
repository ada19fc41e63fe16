//! # Operator Configuration
//!
//! Settings are layered: built-in defaults, then an optional YAML file, then
//! command line flags and environment variables.

use crate::descriptors::DEFAULT_IMAGE;
use crate::error::OperatorError;
use clap::{Args, ValueEnum};
use keycloak_reconciler::{Backoff, ConfigError, ControllerConfig, EngineConfig, DEFAULT_FINALIZER};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Operator configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case", deny_unknown_fields)]
pub struct OperatorConfig {
    /// Namespace to watch; all namespaces when unset
    pub watch_namespace: Option<String>,
    pub concurrency: usize,
    pub pass_timeout_secs: u64,
    pub resync_secs: u64,
    pub settle_secs: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_secs: u64,
    pub backoff_jitter: f64,
    pub degraded_after_failures: u32,
    pub rejected_retry_secs: u64,
    pub max_conflict_retries: u32,
    pub max_status_attempts: u32,
    pub finalizer: String,
    /// Image used when a resource does not name one
    pub default_image: String,
    pub health_addr: SocketAddr,
    pub log_level: String,
    pub log_format: LogFormat,
    /// Create the CRD at startup when it is missing
    pub install_crd: bool,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            watch_namespace: None,
            concurrency: 4,
            pass_timeout_secs: 60,
            resync_secs: 600,
            settle_secs: 5,
            backoff_base_ms: 500,
            backoff_max_secs: 300,
            backoff_jitter: 0.2,
            degraded_after_failures: 3,
            rejected_retry_secs: 300,
            max_conflict_retries: 3,
            max_status_attempts: 3,
            finalizer: DEFAULT_FINALIZER.to_string(),
            default_image: DEFAULT_IMAGE.to_string(),
            health_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
            install_crd: false,
        }
    }
}

impl OperatorConfig {
    /// Defaults overlaid with the YAML file at `path`
    pub fn from_file(path: &Path) -> Result<Self, OperatorError> {
        let raw = std::fs::read_to_string(path).map_err(|source| OperatorError::ConfigFile {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, OperatorError> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(raw)?)
    }

    /// Resolve the final configuration from flags, env and the optional file
    pub fn load(args: &ConfigArgs) -> Result<Self, OperatorError> {
        let mut config = match &args.config {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        args.apply(&mut config);
        config.validate()?;
        Ok(config)
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            finalizer: self.finalizer.clone(),
            backoff: Backoff::new(
                Duration::from_millis(self.backoff_base_ms),
                Duration::from_secs(self.backoff_max_secs),
                self.backoff_jitter,
            ),
            degraded_after_failures: self.degraded_after_failures,
            rejected_retry_delay: Duration::from_secs(self.rejected_retry_secs),
            settle_interval: Duration::from_secs(self.settle_secs),
            max_conflict_retries: self.max_conflict_retries,
            max_status_attempts: self.max_status_attempts,
        }
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            concurrency: self.concurrency,
            pass_timeout: Duration::from_secs(self.pass_timeout_secs),
        }
    }

    pub fn resync_interval(&self) -> Duration {
        Duration::from_secs(self.resync_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.engine_config().validate()?;
        self.controller_config().validate()?;
        for (field, secs) in [
            ("resync_secs", self.resync_secs),
            ("settle_secs", self.settle_secs),
            ("rejected_retry_secs", self.rejected_retry_secs),
            ("backoff_max_secs", self.backoff_max_secs),
            ("pass_timeout_secs", self.pass_timeout_secs),
        ] {
            if secs > MAX_INTERVAL_SECS {
                return Err(ConfigError::invalid(field, "must not exceed one day"));
            }
        }
        if self.resync_secs == 0 {
            return Err(ConfigError::invalid("resync_secs", "must be greater than zero"));
        }
        if self.settle_secs == 0 {
            return Err(ConfigError::invalid("settle_secs", "must be greater than zero"));
        }
        if self.default_image.trim().is_empty() {
            return Err(ConfigError::invalid("default_image", "must not be empty"));
        }
        if self.watch_namespace.as_deref().is_some_and(|ns| ns.trim().is_empty()) {
            return Err(ConfigError::invalid("watch_namespace", "must not be blank when set"));
        }
        Ok(())
    }
}

/// Upper bound for every interval in the configuration
pub const MAX_INTERVAL_SECS: u64 = 24 * 60 * 60;

/// Command line and environment overrides
#[derive(Debug, Clone, Default, Args)]
pub struct ConfigArgs {
    /// YAML configuration file
    #[arg(short, long, env = "KEYCLOAK_OPERATOR_CONFIG")]
    pub config: Option<PathBuf>,

    /// Namespace to watch (all namespaces when unset)
    #[arg(long, env = "WATCH_NAMESPACE")]
    pub watch_namespace: Option<String>,

    /// Number of concurrent reconcile workers
    #[arg(long, env = "KEYCLOAK_OPERATOR_CONCURRENCY")]
    pub concurrency: Option<usize>,

    /// Seconds between full resyncs
    #[arg(long, env = "KEYCLOAK_OPERATOR_RESYNC_SECS")]
    pub resync_secs: Option<u64>,

    /// Default Keycloak image
    #[arg(long, env = "KEYCLOAK_OPERATOR_IMAGE")]
    pub default_image: Option<String>,

    /// Health and metrics listen address
    #[arg(long, env = "KEYCLOAK_OPERATOR_HEALTH_ADDR")]
    pub health_addr: Option<SocketAddr>,

    /// Log level filter
    #[arg(long, env = "KEYCLOAK_OPERATOR_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Log output format
    #[arg(long, value_enum, env = "KEYCLOAK_OPERATOR_LOG_FORMAT")]
    pub log_format: Option<LogFormat>,

    /// Install the CRD at startup
    #[arg(long)]
    pub install_crd: bool,
}

impl ConfigArgs {
    fn apply(&self, config: &mut OperatorConfig) {
        if let Some(ns) = &self.watch_namespace {
            config.watch_namespace = Some(ns.clone());
        }
        if let Some(n) = self.concurrency {
            config.concurrency = n;
        }
        if let Some(secs) = self.resync_secs {
            config.resync_secs = secs;
        }
        if let Some(image) = &self.default_image {
            config.default_image = image.clone();
        }
        if let Some(addr) = self.health_addr {
            config.health_addr = addr;
        }
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
        if let Some(format) = self.log_format {
            config.log_format = format;
        }
        config.install_crd |= self.install_crd;
    }
}
