//! Configuration management for promhook
//!
//! Parses TOML configuration files and provides typed access to settings.
//! Every section is optional; an empty file yields a working configuration
//! that serves `/metrics` from the host router only.

use crate::metrics::DEFAULT_LATENCY_BUCKETS;
use crate::pushgateway::DEFAULT_GATEWAY_URL;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub export: ExportConfig,
    #[serde(default)]
    pub models: Vec<ModelConfig>,
    #[serde(default)]
    pub databases: Vec<DatabaseConfig>,
    #[serde(default)]
    pub caches: Vec<CacheConfig>,
    #[serde(default)]
    pub multiprocess: Option<MultiprocessConfig>,
    #[serde(default)]
    pub migrations: MigrationsConfig,
    #[serde(default)]
    pub tasks: TasksConfig,
    #[serde(default)]
    pub pushgateway: PushGatewayConfig,
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// Metric naming and histogram layout
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricsConfig {
    /// Prefix joined to every metric name with `_`
    #[serde(default)]
    pub namespace: String,
    /// Buckets of the per-view request latency histogram, in seconds
    #[serde(default = "default_latency_buckets")]
    pub latency_buckets: Vec<f64>,
    /// Classify requests as https from `X-Forwarded-Proto`
    ///
    /// Only enable behind a proxy that overwrites the header.
    #[serde(default)]
    pub trust_forwarded_proto: bool,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            namespace: String::new(),
            latency_buckets: default_latency_buckets(),
            trust_forwarded_proto: false,
        }
    }
}

fn default_latency_buckets() -> Vec<f64> {
    DEFAULT_LATENCY_BUCKETS.to_vec()
}

/// Metrics endpoint and standalone exporter settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ExportConfig {
    #[serde(default = "default_export_path")]
    pub path: String,
    #[serde(default = "default_export_address")]
    pub address: String,
    /// Fixed standalone exporter port
    #[serde(default)]
    pub port: Option<u16>,
    /// Inclusive port range; the first bindable port wins. Takes precedence
    /// over `port`.
    #[serde(default)]
    pub port_range: Option<PortRange>,
    #[serde(default = "default_export_timeout")]
    pub timeout_seconds: u64,
    #[serde(default)]
    pub auth: Option<AuthConfig>,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            path: default_export_path(),
            address: default_export_address(),
            port: None,
            port_range: None,
            timeout_seconds: default_export_timeout(),
            auth: None,
        }
    }
}

impl ExportConfig {
    /// Whether a standalone exporter should be started
    pub fn standalone_enabled(&self) -> bool {
        self.port.is_some() || self.port_range.is_some()
    }

    /// Ports to try in order
    pub fn candidate_ports(&self) -> Vec<u16> {
        match (self.port_range, self.port) {
            (Some(range), _) => range.ports().collect(),
            (None, Some(port)) => vec![port],
            (None, None) => Vec::new(),
        }
    }
}

fn default_export_path() -> String {
    "/metrics".to_string()
}

fn default_export_address() -> String {
    "0.0.0.0".to_string()
}

fn default_export_timeout() -> u64 {
    10
}

/// Inclusive, non-empty port range
///
/// Deserialized from `[start, end]` through the validated constructor, so an
/// invalid range never exists as a value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(try_from = "[u16; 2]", into = "[u16; 2]")]
pub struct PortRange {
    start: u16,
    end: u16,
}

impl PortRange {
    /// Create a validated range
    ///
    /// # Errors
    ///
    /// Returns an error if `start` is 0 or greater than `end`.
    pub fn new(start: u16, end: u16) -> crate::error::AppResult<Self> {
        if start == 0 {
            return Err(crate::error::AppError::Config(
                "export.port_range must start at 1 or above".to_string(),
            ));
        }
        if start > end {
            return Err(crate::error::AppError::Config(format!(
                "export.port_range is empty: start {} is greater than end {}",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> u16 {
        self.start
    }

    pub fn end(&self) -> u16 {
        self.end
    }

    pub fn ports(&self) -> impl Iterator<Item = u16> {
        self.start..=self.end
    }
}

impl TryFrom<[u16; 2]> for PortRange {
    type Error = String;

    fn try_from([start, end]: [u16; 2]) -> Result<Self, Self::Error> {
        PortRange::new(start, end).map_err(|e| e.to_string())
    }
}

impl From<PortRange> for [u16; 2] {
    fn from(range: PortRange) -> Self {
        [range.start, range.end]
    }
}

/// Metrics endpoint credentials
///
/// Either `bearer_token`, or `username` together with `password`.
#[derive(Clone, Default, Deserialize, Serialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub bearer_token: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("bearer_token", &self.bearer_token.as_ref().map(|_| "<redacted>"))
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// A model whose insert/update/delete counters are pre-created
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ModelConfig {
    pub name: String,
}

/// A database connection's metric labels
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    pub alias: String,
    pub vendor: String,
}

/// An instrumented cache
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    pub name: String,
    /// `backend` label value, defaults to the cache name
    #[serde(default)]
    pub backend: Option<String>,
    #[serde(default)]
    pub ignore_exceptions: bool,
    #[serde(default)]
    pub log_ignored_exceptions: bool,
}

impl CacheConfig {
    pub fn backend_label(&self) -> &str {
        self.backend.as_deref().unwrap_or(&self.name)
    }
}

/// Per-worker shard files for multi-process servers
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MultiprocessConfig {
    pub dir: PathBuf,
    /// Worker identity; falls back to `PROMHOOK_WORKER_ID`, then the pid
    #[serde(default)]
    pub worker_id: Option<String>,
    /// How often the worker rewrites its shard
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
}

fn default_flush_interval_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MigrationsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl Default for MigrationsConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

fn default_true() -> bool {
    true
}

/// Task-queue metrics
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TasksConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Push gateway job name for task metrics
    #[serde(default = "default_tasks_job")]
    pub job: String,
}

impl Default for TasksConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            job: default_tasks_job(),
        }
    }
}

fn default_tasks_job() -> String {
    "tasks".to_string()
}

#[derive(Clone, Deserialize, Serialize)]
pub struct PushGatewayConfig {
    #[serde(default = "default_gateway_url")]
    pub url: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_export_timeout")]
    pub timeout_seconds: u64,
}

impl Default for PushGatewayConfig {
    fn default() -> Self {
        Self {
            url: default_gateway_url(),
            username: None,
            password: None,
            timeout_seconds: default_export_timeout(),
        }
    }
}

impl std::fmt::Debug for PushGatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushGatewayConfig")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("timeout_seconds", &self.timeout_seconds)
            .finish()
    }
}

fn default_gateway_url() -> String {
    DEFAULT_GATEWAY_URL.to_string()
}

/// Observability configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn check_timeout(field: &str, seconds: u64) -> crate::error::AppResult<()> {
    if seconds == 0 {
        return Err(crate::error::AppError::Config(format!(
            "{} must be greater than 0, got {}",
            field, seconds
        )));
    }
    if seconds > 300 {
        return Err(crate::error::AppError::Config(format!(
            "{} cannot exceed 300 seconds (5 minutes), got {}",
            field, seconds
        )));
    }
    Ok(())
}

fn check_unique<'a>(
    section: &str,
    field: &str,
    names: impl Iterator<Item = &'a str>,
) -> crate::error::AppResult<()> {
    let mut seen = HashSet::new();
    for name in names {
        if name.is_empty() {
            return Err(crate::error::AppError::Config(format!(
                "[[{}]] {} must not be empty",
                section, field
            )));
        }
        if !seen.insert(name) {
            return Err(crate::error::AppError::Config(format!(
                "Duplicate [[{}]] {} '{}'",
                section, field, name
            )));
        }
    }
    Ok(())
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> crate::error::AppResult<Self> {
        let path_display = path.as_ref().display().to_string();

        // Phase 1: Read file (preserves io::Error context)
        let content = std::fs::read_to_string(path.as_ref()).map_err(|source| {
            crate::error::AppError::ConfigFileRead {
                path: path_display.clone(),
                source,
            }
        })?;

        // Phase 2: Parse TOML (preserves toml::de::Error context)
        let config: Self = toml::from_str(&content).map_err(|source| {
            crate::error::AppError::ConfigParseFailed {
                path: path_display.clone(),
                source,
            }
        })?;

        // Phase 3: Validate parsed config (provides contextual reason)
        config
            .validate()
            .map_err(|e| crate::error::AppError::ConfigValidationFailed {
                path: path_display,
                reason: e.to_string(),
            })?;

        Ok(config)
    }

    /// Settings of the cache named `name`, if configured
    pub fn cache(&self, name: &str) -> Option<&CacheConfig> {
        self.caches.iter().find(|c| c.name == name)
    }

    /// Settings of the database aliased `alias`, if configured
    pub fn database(&self, alias: &str) -> Option<&DatabaseConfig> {
        self.databases.iter().find(|d| d.alias == alias)
    }

    /// Validate configuration after parsing
    ///
    /// This is called automatically by `from_file()` and `from_str()`, but
    /// can also be called explicitly on a hand-built `Config`.
    pub fn validate(&self) -> crate::error::AppResult<()> {
        // Histogram buckets: the client rejects unsorted buckets at
        // registration time, catch it at startup with a clearer message
        let buckets = &self.metrics.latency_buckets;
        if buckets.is_empty() {
            return Err(crate::error::AppError::Config(
                "metrics.latency_buckets must contain at least one bucket".to_string(),
            ));
        }
        if let Some(bad) = buckets.iter().find(|b| !b.is_finite()) {
            return Err(crate::error::AppError::Config(format!(
                "metrics.latency_buckets must be finite (+Inf is implied), got {}",
                bad
            )));
        }
        if buckets.windows(2).any(|w| w[0] >= w[1]) {
            return Err(crate::error::AppError::Config(format!(
                "metrics.latency_buckets must be strictly increasing, got {:?}",
                buckets
            )));
        }

        if !self
            .metrics
            .namespace
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(crate::error::AppError::Config(format!(
                "metrics.namespace '{}' may only contain ASCII letters, digits and '_'",
                self.metrics.namespace
            )));
        }

        if !self.export.path.starts_with('/') {
            return Err(crate::error::AppError::Config(format!(
                "export.path must start with '/', got '{}'",
                self.export.path
            )));
        }
        if self.export.port == Some(0) {
            return Err(crate::error::AppError::Config(
                "export.port must be between 1 and 65535".to_string(),
            ));
        }
        check_timeout("export.timeout_seconds", self.export.timeout_seconds)?;

        if let Some(auth) = &self.export.auth {
            let bearer = auth.bearer_token.is_some();
            let basic = auth.username.is_some() || auth.password.is_some();
            if bearer && basic {
                return Err(crate::error::AppError::Config(
                    "export.auth: configure either bearer_token or username/password, not both"
                        .to_string(),
                ));
            }
            if bearer && auth.bearer_token.as_deref() == Some("") {
                return Err(crate::error::AppError::Config(
                    "export.auth.bearer_token must not be empty".to_string(),
                ));
            }
            if basic {
                match (auth.username.as_deref(), auth.password.as_deref()) {
                    (Some(user), Some(password)) if !user.is_empty() && !password.is_empty() => {
                        if user.contains(':') {
                            return Err(crate::error::AppError::Config(
                                "export.auth.username must not contain ':'".to_string(),
                            ));
                        }
                    }
                    _ => {
                        return Err(crate::error::AppError::Config(
                            "export.auth: username and password must both be set and non-empty"
                                .to_string(),
                        ));
                    }
                }
            }
            if !bearer && !basic {
                return Err(crate::error::AppError::Config(
                    "export.auth is present but configures no credentials".to_string(),
                ));
            }
        }

        check_unique("models", "name", self.models.iter().map(|m| m.name.as_str()))?;
        check_unique(
            "databases",
            "alias",
            self.databases.iter().map(|d| d.alias.as_str()),
        )?;
        check_unique("caches", "name", self.caches.iter().map(|c| c.name.as_str()))?;

        if let Some(mp) = &self.multiprocess {
            if mp.dir.as_os_str().is_empty() {
                return Err(crate::error::AppError::Config(
                    "multiprocess.dir must not be empty".to_string(),
                ));
            }
            if mp.worker_id.as_deref() == Some("") {
                return Err(crate::error::AppError::Config(
                    "multiprocess.worker_id must not be empty when set".to_string(),
                ));
            }
            if mp.flush_interval_ms == 0 {
                return Err(crate::error::AppError::Config(
                    "multiprocess.flush_interval_ms must be greater than 0".to_string(),
                ));
            }
        }

        if self.tasks.enabled && self.tasks.job.is_empty() {
            return Err(crate::error::AppError::Config(
                "tasks.job must not be empty".to_string(),
            ));
        }

        if !self.pushgateway.url.starts_with("http://")
            && !self.pushgateway.url.starts_with("https://")
        {
            return Err(crate::error::AppError::Config(format!(
                "pushgateway.url must start with 'http://' or 'https://', got '{}'",
                self.pushgateway.url
            )));
        }
        check_timeout("pushgateway.timeout_seconds", self.pushgateway.timeout_seconds)?;

        Ok(())
    }
}

impl FromStr for Config {
    type Err = crate::error::AppError;

    fn from_str(toml_str: &str) -> Result<Self, Self::Err> {
        let config: Config = toml::from_str(toml_str).map_err(|source| {
            crate::error::AppError::ConfigParseFailed {
                path: "<string>".to_string(),
                source,
            }
        })?;

        // Validate config before returning
        config.validate()?;
        Ok(config)
    }
}
