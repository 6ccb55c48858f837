use serde::Deserialize;

/// What the retention sweep does with pending messages whose tenant has been
/// deactivated after the messages were enqueued.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum InactiveTenantPolicy {
    /// Leave the backlog untouched; it is delivered if the tenant is
    /// reactivated.
    #[default]
    Hold,
    /// Leave the backlog untouched but log its size each sweep.
    Flag,
    /// Delete the backlog during the retention sweep.
    Purge,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub db_path: Option<String>,

    /// Seconds between dispatcher polling cycles.
    #[serde(default = "defaults::polling_interval_secs")]
    pub polling_interval_secs: u64,

    /// Maximum rows claimed per tenant per cycle.
    #[serde(default = "defaults::batch_size")]
    pub batch_size: u32,

    /// Failed delivery attempts before a row becomes permanently `Failed`.
    #[serde(default = "defaults::max_retry_count")]
    pub max_retry_count: u32,

    /// Lease duration in seconds. Must exceed expected delivery latency but
    /// stay short enough that a crashed instance does not block retries.
    #[serde(default = "defaults::claim_timeout_secs")]
    pub claim_timeout_secs: u64,

    /// Age in seconds after which `Sent` rows are deleted.
    #[serde(default = "defaults::retention_window_secs")]
    pub retention_window_secs: u64,

    /// Identity under which this instance claims rows. Generated when absent.
    pub instance_id: Option<String>,

    #[serde(default)]
    pub inactive_tenant_policy: InactiveTenantPolicy,
}

mod defaults {
    pub fn polling_interval_secs() -> u64 {
        5
    }

    pub fn batch_size() -> u32 {
        20
    }

    pub fn max_retry_count() -> u32 {
        3
    }

    pub fn claim_timeout_secs() -> u64 {
        30
    }

    pub fn retention_window_secs() -> u64 {
        // one week
        7 * 24 * 60 * 60
    }
}

impl Config {
    pub fn load() -> eyre::Result<Self> {
        Ok(envy::prefixed("OUTPOST_").from_env::<Self>()?)
    }

    /// Configuration errors are the only failures that are fatal at startup.
    pub fn validate(&self) -> Result<(), crate::error::Error> {
        if self.batch_size == 0 {
            return Err(crate::error::Error::invalid_config("batch_size must be at least 1"));
        }
        if self.max_retry_count == 0 {
            return Err(crate::error::Error::invalid_config(
                "max_retry_count must be at least 1",
            ));
        }
        if self.claim_timeout_secs == 0 {
            return Err(crate::error::Error::invalid_config(
                "claim_timeout_secs must be positive",
            ));
        }
        Ok(())
    }

    pub fn polling_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.polling_interval_secs)
    }

    pub fn claim_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.claim_timeout_secs as i64)
    }

    pub fn retention_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.retention_window_secs as i64)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: None,
            polling_interval_secs: defaults::polling_interval_secs(),
            batch_size: defaults::batch_size(),
            max_retry_count: defaults::max_retry_count(),
            claim_timeout_secs: defaults::claim_timeout_secs(),
            retention_window_secs: defaults::retention_window_secs(),
            instance_id: None,
            inactive_tenant_policy: InactiveTenantPolicy::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.polling_interval(), std::time::Duration::from_secs(5));
        assert_eq!(config.max_retry_count, 3);
        assert_eq!(config.inactive_tenant_policy, InactiveTenantPolicy::Hold);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let config = Config {
            batch_size: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
