//! Runtime configuration.
//!
//! Hosts usually keep the defaults. When they do not, the settings can be
//! built in code or loaded from JSON:
//!
//! ```rust
//! use rill_core::RuntimeConfig;
//!
//! let config = RuntimeConfig::from_json(r#"{ "time_budget_ms": 4 }"#).unwrap();
//! assert_eq!(config.time_budget.as_millis(), 4);
//! assert_eq!(config.max_iterations, 100);
//! ```

use std::time::Duration;

use serde::Deserialize;

/// Settings for the per-thread scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// How long computed evaluation may run per frame before
    /// [`interrupted`](crate::reactive::interrupted) starts returning true.
    #[serde(rename = "time_budget_ms", with = "millis")]
    pub time_budget: Duration,

    /// Passes the frame drain loop makes before giving up.
    pub max_iterations: usize,

    /// Grace period for unused async computeds created without options.
    #[serde(rename = "async_zombie_time_ms", with = "optional_millis")]
    pub async_zombie_time: Option<Duration>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            time_budget: Duration::from_millis(10),
            max_iterations: 100,
            async_zombie_time: Some(Duration::from_millis(100)),
        }
    }
}

impl RuntimeConfig {
    /// Set the frame time budget.
    pub fn with_time_budget(mut self, budget: Duration) -> Self {
        self.time_budget = budget;
        self
    }

    /// Set how many update passes a frame may take before giving up.
    pub fn with_max_iterations(mut self, iterations: usize) -> Self {
        self.max_iterations = iterations;
        self
    }

    /// Set how long unread async computeds are kept. `None` frees them at once.
    pub fn with_async_zombie_time(mut self, zombie_time: Option<Duration>) -> Self {
        self.async_zombie_time = zombie_time;
        self
    }

    /// Parse a configuration, filling missing fields with defaults.
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod optional_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
    }
}
