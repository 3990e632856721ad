//! Job payloads: an untyped string-to-value mapping with explicit typed
//! accessors.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::Duration;

/// A payload field lookup that did not produce the requested type.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PayloadError {
    /// The key is absent.
    #[error("payload key {0:?} is missing")]
    Missing(String),
    /// The key is present but holds a different type.
    #[error("payload key {key:?} is not a {expected}")]
    WrongType {
        /// The offending key.
        key: String,
        /// The requested type.
        expected: &'static str,
    },
}

/// The job's input data.
///
/// Accessors return explicit errors instead of silent defaults, so handlers
/// distinguish "absent" from "present but mistyped".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload {
    entries: BTreeMap<String, Value>,
}

impl Payload {
    /// Creates an empty payload.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a value under `key`.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.entries.insert(key.into(), value.into());
        self
    }

    /// Builder-style insertion.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    /// The raw value under `key`, if any.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    /// Whether the payload has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    fn fetch(&self, key: &str) -> Result<&Value, PayloadError> {
        self.entries
            .get(key)
            .ok_or_else(|| PayloadError::Missing(key.to_string()))
    }

    /// The string under `key`.
    pub fn get_str(&self, key: &str) -> Result<&str, PayloadError> {
        self.fetch(key)?.as_str().ok_or(PayloadError::WrongType {
            key: key.to_string(),
            expected: "string",
        })
    }

    /// The integer under `key`.
    pub fn get_i64(&self, key: &str) -> Result<i64, PayloadError> {
        self.fetch(key)?.as_i64().ok_or(PayloadError::WrongType {
            key: key.to_string(),
            expected: "integer",
        })
    }

    /// The boolean under `key`.
    pub fn get_bool(&self, key: &str) -> Result<bool, PayloadError> {
        self.fetch(key)?.as_bool().ok_or(PayloadError::WrongType {
            key: key.to_string(),
            expected: "boolean",
        })
    }

    /// The float under `key`.
    pub fn get_f64(&self, key: &str) -> Result<f64, PayloadError> {
        self.fetch(key)?.as_f64().ok_or(PayloadError::WrongType {
            key: key.to_string(),
            expected: "number",
        })
    }

    /// The per-job timeout carried in the payload's `timeout` key, when it
    /// parses as a duration string (`"500ms"`, `"90s"`, `"5m"`, `"1h"`).
    pub fn timeout(&self) -> Option<Duration> {
        self.get_str("timeout").ok().and_then(parse_duration)
    }
}

/// Parses a compact duration string: an integer followed by `ms`, `s`, `m`,
/// or `h`. A bare integer is read as seconds.
pub fn parse_duration(input: &str) -> Option<Duration> {
    let input = input.trim();
    let split = input
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(input.len());
    let (digits, unit) = input.split_at(split);
    let value: u64 = digits.parse().ok()?;
    match unit.trim() {
        "ms" => Some(Duration::from_millis(value)),
        "s" | "" => Some(Duration::from_secs(value)),
        "m" => Some(Duration::from_secs(value * 60)),
        "h" => Some(Duration::from_secs(value * 3600)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_accessors_distinguish_missing_from_mistyped() {
        let payload = Payload::new()
            .with("to", "alice@example.com")
            .with("retries", 3)
            .with("urgent", true);

        assert_eq!(payload.get_str("to").unwrap(), "alice@example.com");
        assert_eq!(payload.get_i64("retries").unwrap(), 3);
        assert!(payload.get_bool("urgent").unwrap());

        assert_eq!(
            payload.get_str("absent"),
            Err(PayloadError::Missing("absent".to_string()))
        );
        assert_eq!(
            payload.get_str("retries"),
            Err(PayloadError::WrongType {
                key: "retries".to_string(),
                expected: "string",
            })
        );
    }

    #[test]
    fn duration_strings_parse() {
        assert_eq!(parse_duration("500ms"), Some(Duration::from_millis(500)));
        assert_eq!(parse_duration("90s"), Some(Duration::from_secs(90)));
        assert_eq!(parse_duration("5m"), Some(Duration::from_secs(300)));
        assert_eq!(parse_duration("2h"), Some(Duration::from_secs(7200)));
        assert_eq!(parse_duration("45"), Some(Duration::from_secs(45)));
        assert_eq!(parse_duration("soon"), None);
        assert_eq!(parse_duration(""), None);
    }

    #[test]
    fn payload_timeout_reads_the_timeout_key() {
        let payload = Payload::new().with("timeout", "250ms");
        assert_eq!(payload.timeout(), Some(Duration::from_millis(250)));

        let payload = Payload::new().with("timeout", 30);
        // Non-string timeouts are ignored.
        assert_eq!(payload.timeout(), None);
    }

    #[test]
    fn payload_round_trips_through_json() {
        let payload = Payload::new().with("a", 1).with("b", "two");
        let json = serde_json::to_string(&payload).unwrap();
        assert_eq!(json, r#"{"a":1,"b":"two"}"#);
        let back: Payload = serde_json::from_str(&json).unwrap();
        assert_eq!(back, payload);
    }
}
