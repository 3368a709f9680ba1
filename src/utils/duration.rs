//! Serde helpers and conversions for `chrono::Duration`.

use chrono::Duration;

/// Serialize a `chrono::Duration` as whole seconds.
pub mod secs {
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(value.num_seconds())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = i64::deserialize(deserializer)?;
        Duration::try_seconds(secs)
            .ok_or_else(|| serde::de::Error::custom(format!("duration out of range: {secs}s")))
    }
}

/// Serialize a `chrono::Duration` as milliseconds.
pub mod millis {
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(value.num_milliseconds())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let ms = i64::deserialize(deserializer)?;
        Duration::try_milliseconds(ms)
            .ok_or_else(|| serde::de::Error::custom(format!("duration out of range: {ms}ms")))
    }
}

/// Convert fractional seconds from configuration into a `Duration`.
pub fn from_secs_f64(secs: f64) -> Duration {
    let ms = (secs.max(0.0) * 1000.0).round();
    Duration::try_milliseconds(ms.min(i64::MAX as f64) as i64).unwrap_or(Duration::MAX)
}

/// Convert whole seconds from configuration into a `Duration`.
pub fn from_secs(secs: u64) -> Duration {
    Duration::try_seconds(i64::try_from(secs).unwrap_or(i64::MAX)).unwrap_or(Duration::MAX)
}

/// Convert to a `std::time::Duration` for tokio, clamping negatives to zero.
pub fn to_std(d: Duration) -> std::time::Duration {
    d.to_std().unwrap_or_default()
}

/// Ratio of two durations, `0.0` when the denominator is not positive.
pub fn ratio(numerator: Duration, denominator: Duration) -> f64 {
    let den = denominator.num_milliseconds();
    if den <= 0 {
        return 0.0;
    }
    numerator.num_milliseconds() as f64 / den as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, PartialEq, Debug)]
    struct Wrapper {
        #[serde(with = "secs")]
        interval: Duration,
        #[serde(with = "millis")]
        delay: Duration,
    }

    #[test]
    fn test_serde_helpers() {
        let w = Wrapper {
            interval: Duration::minutes(30),
            delay: Duration::milliseconds(1500),
        };
        let json = serde_json::to_string(&w).unwrap();
        assert_eq!(json, r#"{"interval":1800,"delay":1500}"#);
        let back: Wrapper = serde_json::from_str(&json).unwrap();
        assert_eq!(back, w);
    }

    #[test]
    fn test_conversions() {
        assert_eq!(from_secs_f64(1.5), Duration::milliseconds(1500));
        assert_eq!(from_secs_f64(-3.0), Duration::zero());
        assert_eq!(from_secs(60), Duration::minutes(1));
        assert_eq!(to_std(Duration::seconds(-5)), std::time::Duration::ZERO);
        assert_eq!(ratio(Duration::seconds(30), Duration::seconds(60)), 0.5);
        assert_eq!(ratio(Duration::seconds(30), Duration::zero()), 0.0);
    }
}
