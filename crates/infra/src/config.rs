//! Configuration loaded from environment variables.

use std::time::Duration;

use crate::jobs::SchedulerConfig;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{key} must be {expected}, got {value:?}")]
    Invalid {
        key: &'static str,
        expected: &'static str,
        value: String,
    },
    #[error("{0} is required")]
    Missing(&'static str),
    #[error("priority percentages must sum to at most 100 (high={high}, low={low})")]
    PriorityWeights { high: u32, low: u32 },
}

/// Job store settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStoreConfig {
    pub module_name: String,
    pub timer_start_wait: Duration,
    pub timer_interval: Duration,
    pub worker_job_count: usize,
    pub worker_pool_size: usize,
    pub priority_percentage_high: u32,
    pub priority_percentage_low: u32,
    /// `None` disables orphaned-claim recovery.
    pub claim_lease: Option<Duration>,
    pub database_url: Option<String>,
    pub db_max_connections: u32,
}

impl Default for JobStoreConfig {
    fn default() -> Self {
        Self {
            module_name: "jobstore".to_string(),
            timer_start_wait: Duration::from_millis(20_000),
            timer_interval: Duration::from_millis(20_000),
            worker_job_count: 10,
            worker_pool_size: 10,
            priority_percentage_high: 70,
            priority_percentage_low: 10,
            claim_lease: Some(Duration::from_secs(600)),
            database_url: None,
            db_max_connections: 10,
        }
    }
}

impl JobStoreConfig {
    /// Load from the process environment.
    ///
    /// | Env Var                              | Default    |
    /// |--------------------------------------|------------|
    /// | `JOBSTORE_MODULE_NAME`               | `jobstore` |
    /// | `JOBSTORE_TIMER_START_WAIT_MS`       | `20000`    |
    /// | `JOBSTORE_TIMER_INTERVAL_MS`         | `20000`    |
    /// | `JOBSTORE_WORKER_JOB_COUNT`          | `10`       |
    /// | `JOBSTORE_WORKER_POOL_SIZE`          | `10`       |
    /// | `JOBSTORE_PRIORITY_PERCENTAGE_HIGH`  | `70`       |
    /// | `JOBSTORE_PRIORITY_PERCENTAGE_LOW`   | `10`       |
    /// | `JOBSTORE_CLAIM_LEASE_SECS`          | `600` (0 disables) |
    /// | `DATABASE_URL`                       | unset      |
    /// | `JOBSTORE_DB_MAX_CONNECTIONS`        | `10`       |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using `lookup` in place of the environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let module_name = get("JOBSTORE_MODULE_NAME").unwrap_or(defaults.module_name);
        let timer_start_wait = Duration::from_millis(parse(
            &get,
            "JOBSTORE_TIMER_START_WAIT_MS",
            "a non-negative integer",
            20_000u64,
        )?);
        let timer_interval_ms = parse(&get, "JOBSTORE_TIMER_INTERVAL_MS", "a positive integer", 20_000u64)?;
        if timer_interval_ms == 0 {
            return Err(invalid("JOBSTORE_TIMER_INTERVAL_MS", "a positive integer", "0"));
        }
        let worker_job_count = parse(&get, "JOBSTORE_WORKER_JOB_COUNT", "a positive integer", 10usize)?;
        if worker_job_count == 0 {
            return Err(invalid("JOBSTORE_WORKER_JOB_COUNT", "a positive integer", "0"));
        }
        let worker_pool_size = parse(&get, "JOBSTORE_WORKER_POOL_SIZE", "a positive integer", 10usize)?;
        if worker_pool_size == 0 {
            return Err(invalid("JOBSTORE_WORKER_POOL_SIZE", "a positive integer", "0"));
        }
        let high = parse(&get, "JOBSTORE_PRIORITY_PERCENTAGE_HIGH", "an integer in 0..=100", 70u32)?;
        let low = parse(&get, "JOBSTORE_PRIORITY_PERCENTAGE_LOW", "an integer in 0..=100", 10u32)?;
        if high > 100 || low > 100 || high + low > 100 {
            return Err(ConfigError::PriorityWeights { high, low });
        }
        let lease_secs = parse(&get, "JOBSTORE_CLAIM_LEASE_SECS", "a non-negative integer", 600u64)?;
        let db_max_connections = parse(&get, "JOBSTORE_DB_MAX_CONNECTIONS", "a positive integer", 10u32)?;

        Ok(Self {
            module_name,
            timer_start_wait,
            timer_interval: Duration::from_millis(timer_interval_ms),
            worker_job_count,
            worker_pool_size,
            priority_percentage_high: high,
            priority_percentage_low: low,
            claim_lease: (lease_secs > 0).then(|| Duration::from_secs(lease_secs)),
            database_url: get("DATABASE_URL"),
            db_max_connections,
        })
    }

    pub fn require_database_url(&self) -> Result<&str, ConfigError> {
        self.database_url
            .as_deref()
            .ok_or(ConfigError::Missing("DATABASE_URL"))
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            module_name: self.module_name.clone(),
            initial_delay: self.timer_start_wait,
            interval: self.timer_interval,
            worker_job_count: self.worker_job_count,
            worker_pool_size: self.worker_pool_size,
        }
    }

    /// Claim lease as a chrono duration for timestamp arithmetic.
    pub fn claim_lease_chrono(&self) -> Option<chrono::Duration> {
        self.claim_lease
            .and_then(|lease| chrono::Duration::from_std(lease).ok())
    }
}

fn parse<T, G>(get: &G, key: &'static str, expected: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|_| invalid(key, expected, &raw)),
    }
}

fn invalid(key: &'static str, expected: &'static str, value: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        expected,
        value: value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_yields_defaults() {
        let config = JobStoreConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, JobStoreConfig::default());
        assert_eq!(config.claim_lease_chrono(), Some(chrono::Duration::seconds(600)));
        assert_eq!(
            config.require_database_url(),
            Err(ConfigError::Missing("DATABASE_URL"))
        );
    }

    #[test]
    fn overrides_are_applied() {
        let config = JobStoreConfig::from_lookup(lookup(&[
            ("JOBSTORE_MODULE_NAME", "billing"),
            ("JOBSTORE_TIMER_START_WAIT_MS", "0"),
            ("JOBSTORE_TIMER_INTERVAL_MS", "500"),
            ("JOBSTORE_WORKER_JOB_COUNT", "25"),
            ("JOBSTORE_WORKER_POOL_SIZE", "4"),
            ("JOBSTORE_PRIORITY_PERCENTAGE_HIGH", "50"),
            ("JOBSTORE_PRIORITY_PERCENTAGE_LOW", "50"),
            ("JOBSTORE_CLAIM_LEASE_SECS", "0"),
            ("DATABASE_URL", "postgres://localhost/jobs"),
            ("JOBSTORE_DB_MAX_CONNECTIONS", "3"),
        ]))
        .unwrap();

        assert_eq!(config.module_name, "billing");
        assert_eq!(config.timer_start_wait, Duration::ZERO);
        assert_eq!(config.timer_interval, Duration::from_millis(500));
        assert_eq!(config.worker_job_count, 25);
        assert_eq!(config.worker_pool_size, 4);
        assert_eq!(config.priority_percentage_high, 50);
        assert_eq!(config.priority_percentage_low, 50);
        assert_eq!(config.claim_lease, None);
        assert_eq!(config.require_database_url(), Ok("postgres://localhost/jobs"));
        assert_eq!(config.db_max_connections, 3);

        let scheduler = config.scheduler();
        assert_eq!(scheduler.module_name, "billing");
        assert_eq!(scheduler.worker_pool_size, 4);
    }

    #[test]
    fn malformed_numbers_are_rejected() {
        let err = JobStoreConfig::from_lookup(lookup(&[("JOBSTORE_WORKER_JOB_COUNT", "ten")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                key: "JOBSTORE_WORKER_JOB_COUNT",
                expected: "a non-negative integer",
                value: "ten".to_string(),
            }
        );
    }

    #[test]
    fn zero_interval_job_count_and_pool_are_rejected() {
        assert!(JobStoreConfig::from_lookup(lookup(&[("JOBSTORE_TIMER_INTERVAL_MS", "0")])).is_err());
        assert!(JobStoreConfig::from_lookup(lookup(&[("JOBSTORE_WORKER_POOL_SIZE", "0")])).is_err());
        assert_eq!(
            JobStoreConfig::from_lookup(lookup(&[("JOBSTORE_WORKER_JOB_COUNT", "0")])),
            Err(ConfigError::Invalid {
                key: "JOBSTORE_WORKER_JOB_COUNT",
                expected: "a positive integer",
                value: "0".to_string(),
            })
        );
    }

    #[test]
    fn priority_weights_over_one_hundred_are_rejected() {
        let err = JobStoreConfig::from_lookup(lookup(&[
            ("JOBSTORE_PRIORITY_PERCENTAGE_HIGH", "80"),
            ("JOBSTORE_PRIORITY_PERCENTAGE_LOW", "30"),
        ]))
        .unwrap_err();
        assert_eq!(err, ConfigError::PriorityWeights { high: 80, low: 30 });
    }
}
