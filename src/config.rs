//! Engine configuration.
//!
//! [`SrmConfig`] carries one [`SchedulerConfig`] per job type plus the
//! storage, backend and shutdown settings. Configuration can be built in
//! code with the `with_*` builders, read from `SRM_*` environment variables,
//! or loaded from a YAML file.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::job::JobType;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Limits and timers of one scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Maximum number of jobs held by workers at once.
    pub max_active_jobs: usize,
    /// Maximum number of non-terminal jobs the scheduler tracks. Jobs above
    /// the cap are failed on admission.
    pub max_requests: usize,
    /// Retries granted after transient failures.
    pub max_retries: u32,
    /// Delay before a job in `RetryWait` is queued again.
    #[serde(rename = "retry_timeout_ms", with = "millis")]
    pub retry_timeout: Duration,
    /// Lifetime given to requests that do not ask for one.
    #[serde(rename = "default_lifetime_ms", with = "millis")]
    pub default_lifetime: Duration,
    /// Period of the expiration sweep.
    #[serde(rename = "expiration_interval_ms", with = "millis")]
    pub expiration_interval: Duration,
    /// Period of the dispatch wake-up.
    #[serde(rename = "queue_wake_interval_ms", with = "millis")]
    pub queue_wake_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_active_jobs: 10,
            max_requests: 10_000,
            max_retries: 3,
            retry_timeout: Duration::from_secs(60),
            default_lifetime: Duration::from_secs(4 * 3600),
            expiration_interval: Duration::from_secs(60),
            queue_wake_interval: Duration::from_secs(1),
        }
    }
}

impl SchedulerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_active_jobs(mut self, max: usize) -> Self {
        self.max_active_jobs = max;
        self
    }

    pub fn with_max_requests(mut self, max: usize) -> Self {
        self.max_requests = max;
        self
    }

    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    pub fn with_retry_timeout(mut self, timeout: Duration) -> Self {
        self.retry_timeout = timeout;
        self
    }

    pub fn with_default_lifetime(mut self, lifetime: Duration) -> Self {
        self.default_lifetime = lifetime;
        self
    }

    pub fn with_expiration_interval(mut self, interval: Duration) -> Self {
        self.expiration_interval = interval;
        self
    }

    pub fn with_queue_wake_interval(mut self, interval: Duration) -> Self {
        self.queue_wake_interval = interval;
        self
    }

    /// Validates the values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` naming the offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_active_jobs == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_active_jobs must be greater than 0".to_string(),
            ));
        }

        if self.max_requests < self.max_active_jobs {
            return Err(ConfigError::ValidationFailed(
                "max_requests cannot be lower than max_active_jobs".to_string(),
            ));
        }

        if self.default_lifetime.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "default_lifetime must be greater than 0".to_string(),
            ));
        }

        if self.expiration_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "expiration_interval must be greater than 0".to_string(),
            ));
        }

        if self.queue_wake_interval.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "queue_wake_interval must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

/// Where job snapshots are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    /// Process memory; nothing survives a restart.
    #[default]
    Memory,
    /// PostgreSQL at `database_url`.
    Postgres,
}

/// Configuration of the whole engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SrmConfig {
    /// Defaults for every scheduler without its own entry.
    pub defaults: SchedulerConfig,
    /// Per-type overrides.
    pub schedulers: BTreeMap<JobType, SchedulerConfig>,
    pub storage: StorageKind,
    pub database_url: Option<String>,
    /// Root directory of the local storage backend.
    pub backend_root: PathBuf,
    /// How long shutdown waits for running jobs.
    #[serde(rename = "shutdown_grace_ms", with = "millis")]
    pub shutdown_grace: Duration,
}

impl Default for SrmConfig {
    fn default() -> Self {
        Self {
            defaults: SchedulerConfig::default(),
            schedulers: BTreeMap::new(),
            storage: StorageKind::Memory,
            database_url: None,
            backend_root: PathBuf::from("./srm-data"),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

impl SrmConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Effective scheduler configuration for a job type.
    pub fn scheduler(&self, job_type: JobType) -> SchedulerConfig {
        self.schedulers
            .get(&job_type)
            .cloned()
            .unwrap_or_else(|| self.defaults.clone())
    }

    /// Loads configuration from environment variables.
    ///
    /// Variables (all optional):
    /// - `SRM_MAX_ACTIVE_JOBS`, `SRM_MAX_REQUESTS`, `SRM_MAX_RETRIES`:
    ///   scheduler defaults
    /// - `SRM_<TYPE>_MAX_ACTIVE_JOBS`: per-type bound, e.g. `SRM_GET_MAX_ACTIVE_JOBS`
    /// - `SRM_RETRY_TIMEOUT_SECS`, `SRM_DEFAULT_LIFETIME_SECS`,
    ///   `SRM_EXPIRATION_INTERVAL_SECS`, `SRM_QUEUE_WAKE_INTERVAL_MS`
    /// - `SRM_STORAGE`: `memory` or `postgres`
    /// - `DATABASE_URL`: PostgreSQL connection string; selects `postgres`
    ///   storage unless `SRM_STORAGE` says otherwise
    /// - `SRM_BACKEND_ROOT`: local backend root directory
    /// - `SRM_SHUTDOWN_GRACE_SECS`
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value or the result
    /// does not validate.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`SrmConfig::from_env`] over an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let defaults = &mut config.defaults;

        if let Some(val) = lookup("SRM_MAX_ACTIVE_JOBS") {
            defaults.max_active_jobs = parse_env_value(&val, "SRM_MAX_ACTIVE_JOBS")?;
        }

        if let Some(val) = lookup("SRM_MAX_REQUESTS") {
            defaults.max_requests = parse_env_value(&val, "SRM_MAX_REQUESTS")?;
        }

        if let Some(val) = lookup("SRM_MAX_RETRIES") {
            defaults.max_retries = parse_env_value(&val, "SRM_MAX_RETRIES")?;
        }

        if let Some(val) = lookup("SRM_RETRY_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "SRM_RETRY_TIMEOUT_SECS")?;
            defaults.retry_timeout = Duration::from_secs(secs);
        }

        if let Some(val) = lookup("SRM_DEFAULT_LIFETIME_SECS") {
            let secs: u64 = parse_env_value(&val, "SRM_DEFAULT_LIFETIME_SECS")?;
            defaults.default_lifetime = Duration::from_secs(secs);
        }

        if let Some(val) = lookup("SRM_EXPIRATION_INTERVAL_SECS") {
            let secs: u64 = parse_env_value(&val, "SRM_EXPIRATION_INTERVAL_SECS")?;
            defaults.expiration_interval = Duration::from_secs(secs);
        }

        if let Some(val) = lookup("SRM_QUEUE_WAKE_INTERVAL_MS") {
            let ms: u64 = parse_env_value(&val, "SRM_QUEUE_WAKE_INTERVAL_MS")?;
            defaults.queue_wake_interval = Duration::from_millis(ms);
        }

        for job_type in JobType::ALL {
            let key = format!("SRM_{}_MAX_ACTIVE_JOBS", job_type.as_str().to_ascii_uppercase());
            if let Some(val) = lookup(&key) {
                let max = parse_env_value(&val, &key)?;
                let scheduler = config.scheduler(job_type).with_max_active_jobs(max);
                config.schedulers.insert(job_type, scheduler);
            }
        }

        if let Some(url) = lookup("DATABASE_URL") {
            config.database_url = Some(url);
            config.storage = StorageKind::Postgres;
        }

        if let Some(val) = lookup("SRM_STORAGE") {
            config.storage = match val.trim().to_ascii_lowercase().as_str() {
                "memory" => StorageKind::Memory,
                "postgres" | "postgresql" => StorageKind::Postgres,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: "SRM_STORAGE".to_string(),
                        message: format!("expected 'memory' or 'postgres', got '{}'", val),
                    })
                }
            };
        }

        if let Some(val) = lookup("SRM_BACKEND_ROOT") {
            config.backend_root = PathBuf::from(val);
        }

        if let Some(val) = lookup("SRM_SHUTDOWN_GRACE_SECS") {
            let secs: u64 = parse_env_value(&val, "SRM_SHUTDOWN_GRACE_SECS")?;
            config.shutdown_grace = Duration::from_secs(secs);
        }

        config.validate()?;
        Ok(config)
    }

    /// Loads and validates a YAML configuration file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config: SrmConfig = serde_yaml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.defaults.validate()?;
        for (job_type, scheduler) in &self.schedulers {
            scheduler.validate().map_err(|e| {
                ConfigError::ValidationFailed(format!("{} scheduler: {}", job_type, e))
            })?;
        }

        if self.storage == StorageKind::Postgres
            && self.database_url.as_deref().map_or(true, str::is_empty)
        {
            return Err(ConfigError::ValidationFailed(
                "database_url is required for postgres storage".to_string(),
            ));
        }

        Ok(())
    }

    pub fn with_defaults(mut self, defaults: SchedulerConfig) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn with_scheduler(mut self, job_type: JobType, config: SchedulerConfig) -> Self {
        self.schedulers.insert(job_type, config);
        self
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self.storage = StorageKind::Postgres;
        self
    }

    pub fn with_storage(mut self, storage: StorageKind) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_backend_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.backend_root = root.into();
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = SrmConfig::default();
        assert_eq!(config.storage, StorageKind::Memory);
        assert_eq!(config.shutdown_grace, Duration::from_secs(30));
        let get = config.scheduler(JobType::Get);
        assert_eq!(get.max_active_jobs, 10);
        assert_eq!(get.max_retries, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = SrmConfig::new()
            .with_scheduler(JobType::Put, SchedulerConfig::new().with_max_active_jobs(2))
            .with_backend_root("/srv/srm")
            .with_shutdown_grace(Duration::from_secs(5));

        assert_eq!(config.scheduler(JobType::Put).max_active_jobs, 2);
        assert_eq!(config.scheduler(JobType::Get).max_active_jobs, 10);
        assert_eq!(config.backend_root, PathBuf::from("/srv/srm"));
    }

    #[test]
    fn test_from_lookup() {
        let config = SrmConfig::from_lookup(lookup(&[
            ("SRM_MAX_ACTIVE_JOBS", "4"),
            ("SRM_GET_MAX_ACTIVE_JOBS", "7"),
            ("SRM_RETRY_TIMEOUT_SECS", "5"),
            ("SRM_QUEUE_WAKE_INTERVAL_MS", "250"),
            ("DATABASE_URL", "postgres://srm@localhost/srm"),
        ]))
        .unwrap();

        assert_eq!(config.scheduler(JobType::Get).max_active_jobs, 7);
        assert_eq!(config.scheduler(JobType::Put).max_active_jobs, 4);
        assert_eq!(config.defaults.retry_timeout, Duration::from_secs(5));
        assert_eq!(config.defaults.queue_wake_interval, Duration::from_millis(250));
        assert_eq!(config.storage, StorageKind::Postgres);
    }

    #[test]
    fn test_from_lookup_invalid_value() {
        let err = SrmConfig::from_lookup(lookup(&[("SRM_MAX_RETRIES", "many")])).unwrap_err();
        assert!(err.to_string().contains("SRM_MAX_RETRIES"));

        let err = SrmConfig::from_lookup(lookup(&[("SRM_STORAGE", "redis")])).unwrap_err();
        assert!(err.to_string().contains("SRM_STORAGE"));
    }

    #[test]
    fn test_postgres_requires_url() {
        let config = SrmConfig::default().with_storage(StorageKind::Postgres);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("database_url"));
    }

    #[test]
    fn test_validation_names_field() {
        let err = SchedulerConfig::default()
            .with_max_active_jobs(0)
            .validate()
            .unwrap_err();
        assert!(err.to_string().contains("max_active_jobs"));

        let config = SrmConfig::default().with_scheduler(
            JobType::Ls,
            SchedulerConfig::default().with_queue_wake_interval(Duration::ZERO),
        );
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("ls scheduler"));
    }

    #[test]
    fn test_from_yaml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "defaults:\n  max_active_jobs: 3\n  retry_timeout_ms: 1500\nschedulers:\n  bring_online:\n    max_active_jobs: 1\nbackend_root: /tmp/srm\nshutdown_grace_ms: 2000\n"
        )
        .unwrap();

        let config = SrmConfig::from_yaml_file(file.path()).unwrap();
        assert_eq!(config.defaults.max_active_jobs, 3);
        assert_eq!(config.defaults.retry_timeout, Duration::from_millis(1500));
        assert_eq!(config.scheduler(JobType::BringOnline).max_active_jobs, 1);
        assert_eq!(config.scheduler(JobType::Copy).max_active_jobs, 3);
        assert_eq!(config.shutdown_grace, Duration::from_secs(2));
    }
}
