//! Normalised duration strings ("10m", "4h", "7days") for files and
//! configuration, backed by humantime.

use std::time::Duration;

pub fn format(d: Duration) -> String {
    humantime::format_duration(d).to_string()
}

pub fn parse(s: &str) -> Result<Duration, humantime::DurationError> {
    humantime::parse_duration(s)
}

/// Serde adapter: `Duration` as a humantime string.
pub mod serde_duration {
    use super::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&humantime::format_duration(*d))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrips_common_durations() {
        for s in ["10m", "4h", "7d", "30d", "180d"] {
            let d = parse(s).unwrap();
            assert_eq!(parse(&format(d)).unwrap(), d);
        }
    }

    #[test]
    fn format_is_normalised() {
        assert_eq!(format(Duration::from_secs(600)), "10m");
        assert_eq!(format(Duration::from_secs(4 * 3600)), "4h");
        assert_eq!(format(Duration::from_secs(7 * 86400)), "7days");
    }
}
