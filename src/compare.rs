//! The structured-message comparator.
//!
//! A real deployment's messages have a schema the core doesn't know, so
//! this is treated as an external collaborator in principle — but the core
//! still has to ship something usable out of the box, so this module
//! provides a default comparator alongside the trait a host can replace it
//! with.

use crate::entry::WrappedMessage;

/// Returned instead of a plain bool so the false-alarm case — "every
/// accessible field agrees but the raw bytes disagree" (e.g. a protobuf-like
/// encoder re-serializing unused padding bits differently) — is
/// distinguishable from "truly does not match".
pub const PROTO_COMPARE_FALSE_ALARM: &str = "PROTO_COMPARE_FALSE_ALARM";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompareOutcome {
    /// The two messages are byte-identical.
    Equal,
    /// Bytes differ but every decoded field agrees.
    FalseAlarm,
    /// A genuine mismatch, with a human-readable description.
    Diff(String),
}

impl CompareOutcome {
    pub fn is_match(&self) -> bool {
        matches!(self, CompareOutcome::Equal | CompareOutcome::FalseAlarm)
    }
}

/// A pluggable comparator for [`WrappedMessage`] payloads. The replay
/// engine only ever invokes this after a raw byte comparison has already
/// failed, so implementations do not need to special-case the
/// byte-identical case themselves (though [`CompareOutcome::Equal`] remains
/// available for direct callers and tests).
pub trait MessageComparator: Send + Sync {
    fn compare(&self, expected: &WrappedMessage, actual: &WrappedMessage) -> CompareOutcome;
}

/// Default comparator: decodes both payloads as `serde_json::Value` and
/// compares structurally. This is a reasonable default for hosts whose
/// wire format is JSON-compatible; hosts with a binary schema (protobuf,
/// capnp, ...) should supply their own [`MessageComparator`].
#[derive(Default)]
pub struct JsonValueComparator;

impl MessageComparator for JsonValueComparator {
    fn compare(&self, expected: &WrappedMessage, actual: &WrappedMessage) -> CompareOutcome {
        if expected.value == actual.value && expected.type_name == actual.type_name {
            return CompareOutcome::Equal;
        }
        if expected.type_name != actual.type_name {
            return CompareOutcome::Diff(format!(
                "type mismatch: expected {:?}, got {:?}",
                expected.type_name, actual.type_name
            ));
        }
        let parsed_expected: Result<serde_json::Value, _> = serde_json::from_slice(&expected.value);
        let parsed_actual: Result<serde_json::Value, _> = serde_json::from_slice(&actual.value);
        match (parsed_expected, parsed_actual) {
            (Ok(e), Ok(a)) if e == a => CompareOutcome::FalseAlarm,
            (Ok(e), Ok(a)) => CompareOutcome::Diff(format!("field mismatch: expected {} got {}", e, a)),
            _ => CompareOutcome::Diff(format!(
                "payload bytes differ and could not be decoded as JSON for a structural comparison \
                 (expected {} bytes, got {} bytes)",
                expected.value.len(),
                actual.value.len()
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_reencoding_is_a_false_alarm() {
        let cmp = JsonValueComparator::default();
        let expected = WrappedMessage::new("Row", br#"{"a":1,"b":2}"#.to_vec());
        // same fields, different key order -> different bytes, same JSON value
        let actual = WrappedMessage::new("Row", br#"{"b":2,"a":1}"#.to_vec());
        assert_eq!(cmp.compare(&expected, &actual), CompareOutcome::FalseAlarm);
    }

    #[test]
    fn genuine_field_mismatch_is_a_diff() {
        let cmp = JsonValueComparator::default();
        let expected = WrappedMessage::new("Row", br#"{"a":1}"#.to_vec());
        let actual = WrappedMessage::new("Row", br#"{"a":2}"#.to_vec());
        match cmp.compare(&expected, &actual) {
            CompareOutcome::Diff(_) => {}
            other => panic!("expected Diff, got {:?}", other),
        }
    }
}
