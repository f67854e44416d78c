use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::power::{AlwaysSafe, BatteryLevel, MinimumBattery, PowerPolicy};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum PowerPolicyConfig {
    AlwaysSafe,
    MinimumBattery { floor: BatteryLevel },
}

impl PowerPolicyConfig {
    pub fn build(&self) -> Box<dyn PowerPolicy> {
        match self {
            PowerPolicyConfig::AlwaysSafe => Box::new(AlwaysSafe),
            PowerPolicyConfig::MinimumBattery { floor } => Box::new(MinimumBattery { floor: *floor }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub max_open_files: usize,
    pub idle_period_secs: u64,
    pub power_policy: PowerPolicyConfig,
}

impl Config {
    pub fn new() -> Self {
        Self {
            max_open_files: 4,
            idle_period_secs: 10 * 60,
            power_policy: PowerPolicyConfig::AlwaysSafe,
        }
    }

    pub fn idle_period(&self) -> Duration {
        Duration::from_secs(self.idle_period_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}
