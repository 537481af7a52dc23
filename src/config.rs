use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    error::{LockError, Result},
    types::ServiceIdentity,
};

const DEFAULT_KEEP_LOCK_TABLE_BIND_DURATION: Duration = Duration::from_secs(1);
const DEFAULT_KEEP_REMOTE_LOCK_DURATION: Duration = Duration::from_secs(1);
const DEFAULT_MAX_FIXED_SLICE_SIZE: usize = 1024;
const DEFAULT_REMOTE_LOCK_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_DEADLOCK_DETECT_INTERVAL: Duration = Duration::from_secs(1);
const DEFAULT_REMOTE_RETRY_ATTEMPTS: usize = 3;
const DEFAULT_REMOTE_RETRY_BACKOFF: Duration = Duration::from_millis(20);

/// Lock service configuration. Durations are written in milliseconds when
/// loaded from TOML; zero means "use the default".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub service_id: String,
    pub service_address: String,

    /// Lease length a keeper must renew its bindings within.
    #[serde(with = "millis")]
    pub keep_lock_table_bind_duration: Duration,
    /// How long a cached remote binding may be trusted without asking the registry.
    #[serde(with = "millis")]
    pub keep_remote_lock_duration: Duration,
    /// Number of ranges a transaction's held key set keeps verbatim before it is
    /// coalesced into intervals.
    pub max_fixed_slice_size: usize,

    #[serde(with = "millis")]
    pub remote_lock_timeout: Duration,
    #[serde(with = "millis")]
    pub deadlock_detect_interval: Duration,
    pub remote_retry_attempts: usize,
    #[serde(with = "millis")]
    pub remote_retry_backoff: Duration,
}

impl Config {
    pub fn new(service_id: impl Into<String>, service_address: impl Into<String>) -> Self {
        Self {
            service_id: service_id.into(),
            service_address: service_address.into(),
            ..Default::default()
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(content)
            .map_err(|e| LockError::InvalidConfig(format!("failed to parse config: {}", e)))?;
        config.adjust();
        config.validate()?;
        Ok(config)
    }

    /// Fills every unset option with its default.
    pub fn adjust(&mut self) {
        if self.keep_lock_table_bind_duration == Duration::ZERO {
            self.keep_lock_table_bind_duration = DEFAULT_KEEP_LOCK_TABLE_BIND_DURATION;
        }
        if self.keep_remote_lock_duration == Duration::ZERO {
            self.keep_remote_lock_duration = DEFAULT_KEEP_REMOTE_LOCK_DURATION;
        }
        if self.max_fixed_slice_size == 0 {
            self.max_fixed_slice_size = DEFAULT_MAX_FIXED_SLICE_SIZE;
        }
        if self.remote_lock_timeout == Duration::ZERO {
            self.remote_lock_timeout = DEFAULT_REMOTE_LOCK_TIMEOUT;
        }
        if self.deadlock_detect_interval == Duration::ZERO {
            self.deadlock_detect_interval = DEFAULT_DEADLOCK_DETECT_INTERVAL;
        }
        if self.remote_retry_attempts == 0 {
            self.remote_retry_attempts = DEFAULT_REMOTE_RETRY_ATTEMPTS;
        }
        if self.remote_retry_backoff == Duration::ZERO {
            self.remote_retry_backoff = DEFAULT_REMOTE_RETRY_BACKOFF;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.service_id.is_empty() {
            return Err(LockError::InvalidConfig("service_id is required".to_string()));
        }
        if self.service_address.is_empty() {
            return Err(LockError::InvalidConfig(
                "service_address is required".to_string(),
            ));
        }
        Ok(())
    }

    pub fn identity(&self) -> ServiceIdentity {
        ServiceIdentity::new(self.service_id.clone(), self.service_address.clone())
    }

    /// Keeper period: a third of the lease, so a failed renewal still has a
    /// second chance before the lease runs out.
    pub fn renew_interval(&self) -> Duration {
        self.keep_lock_table_bind_duration / 3
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn adjust_fills_defaults() {
        let mut c = Config::new("s1", "address");
        c.adjust();
        assert_ne!(c.keep_lock_table_bind_duration, Duration::ZERO);
        assert_ne!(c.keep_remote_lock_duration, Duration::ZERO);
        assert_ne!(c.max_fixed_slice_size, 0);
        assert!(c.renew_interval() < c.keep_lock_table_bind_duration);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn adjust_keeps_explicit_values() {
        let mut c = Config::new("s1", "address");
        c.max_fixed_slice_size = 7;
        c.adjust();
        assert_eq!(c.max_fixed_slice_size, 7);
    }

    #[test]
    fn missing_identity_fails_validation() {
        let mut c = Config::new("", "address");
        c.adjust();
        assert!(matches!(c.validate(), Err(LockError::InvalidConfig(_))));

        let mut c = Config::new("s1", "");
        c.adjust();
        assert!(matches!(c.validate(), Err(LockError::InvalidConfig(_))));
    }

    #[test]
    fn loads_from_toml() {
        let c = Config::from_toml_str(
            r#"
            service_id = "cn-1"
            service_address = "10.0.0.1:6001"
            keep_lock_table_bind_duration = 3000
            max_fixed_slice_size = 16
            "#,
        )
        .unwrap();
        assert_eq!(c.keep_lock_table_bind_duration, Duration::from_secs(3));
        assert_eq!(c.max_fixed_slice_size, 16);
        assert_eq!(c.keep_remote_lock_duration, DEFAULT_KEEP_REMOTE_LOCK_DURATION);
    }

    #[test]
    fn toml_without_identity_is_rejected() {
        assert!(Config::from_toml_str("max_fixed_slice_size = 4").is_err());
    }
}
