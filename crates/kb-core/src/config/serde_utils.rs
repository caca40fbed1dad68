//! Serde helpers for durations in session files
//!
//! Long waits are written as whole seconds, short poll intervals as
//! milliseconds, so a session file never needs fractional values.

/// `Duration` as a whole number of seconds
pub mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

/// `Duration` as a whole number of milliseconds
pub mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Timings {
        #[serde(with = "duration_secs")]
        lifetime: Duration,
        #[serde(with = "duration_millis")]
        poll: Duration,
    }

    #[test]
    fn test_writes_integers() {
        let timings = Timings {
            lifetime: Duration::from_secs(3600),
            poll: Duration::from_millis(250),
        };
        let toml = toml::to_string(&timings).unwrap();
        assert!(toml.contains("lifetime = 3600"));
        assert!(toml.contains("poll = 250"));
    }

    #[test]
    fn test_reads_integers() {
        let timings: Timings = toml::from_str("lifetime = 10\npoll = 1500\n").unwrap();
        assert_eq!(timings.lifetime, Duration::from_secs(10));
        assert_eq!(timings.poll, Duration::from_millis(1500));
    }

    #[test]
    fn test_secs_truncates_subsecond() {
        let json = serde_json::to_string(&Timings {
            lifetime: Duration::from_millis(2999),
            poll: Duration::ZERO,
        })
        .unwrap();
        assert_eq!(json, r#"{"lifetime":2,"poll":0}"#);
    }
}
