//! Timeouts, poll intervals and retry delays for the forwarders

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::serde_utils::{duration_millis, duration_secs};

/// Timing knobs shared by the bridge and client forwarders
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// How long the bridge pod may take to become ready
    #[serde(with = "duration_secs")]
    pub pod_ready_timeout: Duration,

    /// How many times the bridge log is read looking for the user marker
    pub user_marker_attempts: u32,

    /// Delay between two reads of the bridge log
    #[serde(with = "duration_millis")]
    pub user_marker_interval: Duration,

    /// How often a live tunnel is checked for errors
    #[serde(with = "duration_millis")]
    pub tunnel_health_interval: Duration,

    /// SSH connect + authentication bound
    #[serde(with = "duration_secs")]
    pub auth_timeout: Duration,

    /// Longest an SSH session is kept before it is re-established
    #[serde(with = "duration_secs")]
    pub session_lifetime: Duration,

    /// How long a stopped session waits for its tasks before abandoning them
    #[serde(with = "duration_secs")]
    pub stop_grace: Duration,

    /// Delay between SSH reconnect attempts
    pub backoff: BackoffConfig,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            pod_ready_timeout: Duration::from_secs(10),
            user_marker_attempts: 20,
            user_marker_interval: Duration::from_millis(500),
            tunnel_health_interval: Duration::from_millis(1000),
            auth_timeout: Duration::from_secs(10),
            session_lifetime: Duration::from_secs(3600),
            stop_grace: Duration::from_secs(5),
            backoff: BackoffConfig::default(),
        }
    }
}

/// Reconnect backoff configuration
///
/// The defaults describe a fixed delay; raise `multiplier` above 1.0 for an
/// exponential one.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Initial delay
    #[serde(with = "duration_secs")]
    pub initial: Duration,

    /// Maximum delay
    #[serde(with = "duration_secs")]
    pub max: Duration,

    /// Multiplier for each retry
    pub multiplier: f64,

    /// Jitter factor (0.0 to 1.0)
    pub jitter: f64,
}

impl BackoffConfig {
    /// A constant delay without jitter
    pub fn fixed(delay: Duration) -> Self {
        Self {
            initial: delay,
            max: delay,
            multiplier: 1.0,
            jitter: 0.0,
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(5))
    }
}
