//! Target Position Record Codec
//!
//! Each line on a position source stream is one JSON object:
//!
//! ```json
//! {"position": -3}
//! {"ping": "2024-03-15T14:30:00.000Z"}
//! ```
//!
//! `position` (a JSON number, external units) is optional. Records without
//! it keep the stream alive and re-trigger reconciliation against the last
//! known target. Other fields are ignored.

use std::str::FromStr;

use rust_decimal::Decimal;
use serde_json::Value;

/// Longest excerpt of a rejected line included in logs.
const LOG_EXCERPT_CHARS: usize = 80;

/// Decoded record.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SourceRecord {
    /// New target position, if the record carries one.
    pub position: Option<Decimal>,
    /// Heartbeat payload, if present.
    pub ping: Option<String>,
}

impl SourceRecord {
    /// Record carrying a target.
    #[must_use]
    pub const fn position(position: Decimal) -> Self {
        Self {
            position: Some(position),
            ping: None,
        }
    }
}

/// Record decoding errors.
#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    /// Line is not valid JSON.
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Line is valid JSON but not an object.
    #[error("expected a JSON object, got {0}")]
    NotAnObject(&'static str),

    /// `position` is present but not a number.
    #[error("position is not a number: {0}")]
    NonNumericPosition(String),

    /// `position` is a number that does not fit a decimal.
    #[error("position out of range: {0}")]
    OutOfRange(String),
}

/// Decode one line.
///
/// # Errors
///
/// Returns a [`RecordError`] for anything other than a JSON object whose
/// `position`, if present, is a representable number.
pub fn decode_record(line: &str) -> Result<SourceRecord, RecordError> {
    let value: Value = serde_json::from_str(line)?;
    let Value::Object(fields) = value else {
        return Err(RecordError::NotAnObject(kind_of(&value)));
    };

    let position = match fields.get("position") {
        None => None,
        Some(Value::Number(n)) => Some(number_to_decimal(n)?),
        Some(other) => return Err(RecordError::NonNumericPosition(other.to_string())),
    };

    let ping = fields.get("ping").map(|v| match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    });

    Ok(SourceRecord { position, ping })
}

fn number_to_decimal(n: &serde_json::Number) -> Result<Decimal, RecordError> {
    let text = n.to_string();
    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .map_err(|_| RecordError::OutOfRange(text))
}

const fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Shorten a line for logging without splitting a character.
#[must_use]
pub fn excerpt(line: &str) -> &str {
    match line.char_indices().nth(LOG_EXCERPT_CHARS) {
        Some((end, _)) => &line[..end],
        None => line,
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal_macros::dec;
    use test_case::test_case;

    use super::*;

    #[test_case(r#"{"position": 10}"#, dec!(10) ; "integer")]
    #[test_case(r#"{"position": -3}"#, dec!(-3) ; "negative")]
    #[test_case(r#"{"position": 0.25}"#, dec!(0.25) ; "fraction")]
    #[test_case(r#"{"position": 1e3}"#, dec!(1000) ; "exponent")]
    #[test_case(r#"{"position": 2, "strategy": "x"}"#, dec!(2) ; "extra fields ignored")]
    fn decodes_position(line: &str, expected: Decimal) {
        let record = decode_record(line).unwrap();
        assert_eq!(record.position, Some(expected));
    }

    #[test]
    fn heartbeat_has_no_position() {
        let record = decode_record(r#"{"ping": "2024-03-15T14:30:00Z"}"#).unwrap();
        assert_eq!(record.position, None);
        assert_eq!(record.ping.as_deref(), Some("2024-03-15T14:30:00Z"));
    }

    #[test]
    fn empty_object_is_valid() {
        assert_eq!(decode_record("{}").unwrap(), SourceRecord::default());
    }

    #[test_case("not json" ; "garbage")]
    #[test_case(r#"{"position": 10"# ; "truncated")]
    fn rejects_malformed_json(line: &str) {
        assert!(matches!(decode_record(line), Err(RecordError::Json(_))));
    }

    #[test_case("[1, 2]", "an array" ; "array")]
    #[test_case("10", "a number" ; "bare number")]
    #[test_case("null", "null" ; "null")]
    fn rejects_non_objects(line: &str, kind: &str) {
        match decode_record(line) {
            Err(RecordError::NotAnObject(k)) => assert_eq!(k, kind),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test_case(r#"{"position": "10"}"# ; "string")]
    #[test_case(r#"{"position": null}"# ; "null")]
    #[test_case(r#"{"position": [1]}"# ; "array")]
    fn rejects_non_numeric_position(line: &str) {
        assert!(matches!(
            decode_record(line),
            Err(RecordError::NonNumericPosition(_))
        ));
    }

    #[test]
    fn rejects_unrepresentable_position() {
        assert!(matches!(
            decode_record(r#"{"position": 1e300}"#),
            Err(RecordError::OutOfRange(_))
        ));
    }

    #[test]
    fn excerpt_respects_char_boundaries() {
        let line = "é".repeat(100);
        assert_eq!(excerpt(&line).chars().count(), LOG_EXCERPT_CHARS);
        assert_eq!(excerpt("short"), "short");
    }
}
