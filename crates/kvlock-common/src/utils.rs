//! Duration helpers
//!
//! Consul expresses TTLs and wait times as strings such as `"15s"` or `"500ms"`.

use std::time::Duration;

/// Parse a duration string (e.g., "15s", "1m", "500ms", "1h", "1m30s").
///
/// Unit segments may be chained; a bare number is read as seconds.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use kvlock_common::parse_duration;
///
/// assert_eq!(parse_duration("15s"), Some(Duration::from_secs(15)));
/// assert_eq!(parse_duration("250ms"), Some(Duration::from_millis(250)));
/// assert_eq!(parse_duration("1m30s"), Some(Duration::from_secs(90)));
/// assert_eq!(parse_duration("fast"), None);
/// ```
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    if let Ok(secs) = s.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }

    let mut total_ms: u64 = 0;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(rest.len());
        if digits == 0 {
            return None;
        }
        let num: u64 = rest[..digits].parse().ok()?;
        rest = &rest[digits..];

        let (multiplier, unit_len) = if rest.starts_with("ms") {
            (1u64, 2)
        } else if rest.starts_with('s') {
            (1000u64, 1)
        } else if rest.starts_with('m') {
            (60_000u64, 1)
        } else if rest.starts_with('h') {
            (3_600_000u64, 1)
        } else {
            return None;
        };
        total_ms = total_ms.checked_add(num.checked_mul(multiplier)?)?;
        rest = &rest[unit_len..];
    }

    Some(Duration::from_millis(total_ms))
}

/// Format a duration the way `parse_duration` reads it back.
pub fn format_duration(d: Duration) -> String {
    if d.subsec_millis() == 0 {
        format!("{}s", d.as_secs())
    } else {
        format!("{}ms", d.as_millis())
    }
}

/// Serde adapter for `Duration` fields written as Consul duration strings.
///
/// Numbers are accepted on input and read as seconds.
pub mod duration_str {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&super::format_duration(*value))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = serde_json::Value::deserialize(deserializer)?;
        from_value(&value).map_err(serde::de::Error::custom)
    }

    fn from_value(value: &serde_json::Value) -> Result<Duration, String> {
        match value {
            serde_json::Value::Number(n) => n
                .as_u64()
                .map(Duration::from_secs)
                .ok_or_else(|| format!("invalid duration: {}", n)),
            serde_json::Value::String(s) => {
                super::parse_duration(s).ok_or_else(|| format!("invalid duration: '{}'", s))
            }
            other => Err(format!("invalid duration: {}", other)),
        }
    }

    /// Same as the parent module for `Option<Duration>`.
    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match value {
                Some(d) => super::serialize(d, serializer),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
        where
            D: Deserializer<'de>,
        {
            let opt: Option<serde_json::Value> = Option::deserialize(deserializer)?;
            match opt {
                None | Some(serde_json::Value::Null) => Ok(None),
                Some(value) => super::from_value(&value)
                    .map(Some)
                    .map_err(serde::de::Error::custom),
            }
        }
    }
}
