use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::DashResult;

/// The default minimum number of times to retry loading data prior to failing.
pub const DEFAULT_MIN_LOADABLE_RETRY_COUNT: u32 = 3;

/// Refresh interval used when a dynamic manifest declares `minimumUpdatePeriod` as zero.
pub const MANIFEST_REFRESH_FLOOR_MS: u64 = 5000;

/// Retry budget of HTTP clock synchronization loads.
pub const UTC_TIMING_RETRY_COUNT: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DashPeriodConfig {
    /// Retries granted to manifest loads and to every sample stream.
    pub min_loadable_retry_count: u32,
    /// User agent of the default HTTP data source.
    pub user_agent: Option<String>,
    /// Timeout of a single HTTP request.
    pub request_timeout_secs: u64,
}

impl Default for DashPeriodConfig {
    fn default() -> Self {
        Self {
            min_loadable_retry_count: DEFAULT_MIN_LOADABLE_RETRY_COUNT,
            user_agent: None,
            request_timeout_secs: 60,
        }
    }
}

impl DashPeriodConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> DashResult<Self> {
        let data = std::fs::read_to_string(path)?;
        let config = toml::from_str(&data)?;
        Ok(config)
    }

    pub fn with_min_loadable_retry_count(mut self, retry: u32) -> Self {
        self.min_loadable_retry_count = retry;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}
