//! Property-list values read from the epilogue of an emlx container.

use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

/// One node of a parsed property list.
///
/// Dictionaries keep their entries in document order and serialize as maps.
#[derive(Debug, Clone, PartialEq)]
pub enum PlistValue {
    String(String),
    Integer(i64),
    Real(f64),
    Boolean(bool),
    Date(DateTime<Utc>),
    Data(Vec<u8>),
    Array(Vec<PlistValue>),
    Dictionary(Vec<(String, PlistValue)>),
}

impl PlistValue {
    /// Look up `key` if this value is a dictionary.
    pub fn get(&self, key: &str) -> Option<&PlistValue> {
        match self {
            PlistValue::Dictionary(entries) => entries
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            PlistValue::Integer(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            PlistValue::String(s) => Some(s),
            _ => None,
        }
    }
}

impl Serialize for PlistValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            PlistValue::String(s) => serializer.serialize_str(s),
            PlistValue::Integer(n) => serializer.serialize_i64(*n),
            PlistValue::Real(x) => serializer.serialize_f64(*x),
            PlistValue::Boolean(b) => serializer.serialize_bool(*b),
            PlistValue::Date(date) => date.serialize(serializer),
            PlistValue::Data(bytes) => bytes.serialize(serializer),
            PlistValue::Array(items) => serializer.collect_seq(items),
            PlistValue::Dictionary(entries) => {
                serializer.collect_map(entries.iter().map(|(k, v)| (k, v)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dictionary_serializes_as_ordered_map() {
        let plist = PlistValue::Dictionary(vec![
            ("remote-id".to_string(), PlistValue::String("4711".into())),
            ("flags".to_string(), PlistValue::Integer(8589934593)),
            (
                "labels".to_string(),
                PlistValue::Array(vec![PlistValue::Boolean(true), PlistValue::Real(1.5)]),
            ),
        ]);
        assert_eq!(
            serde_json::to_string(&plist).unwrap(),
            r#"{"remote-id":"4711","flags":8589934593,"labels":[true,1.5]}"#
        );
    }

    #[test]
    fn test_report_plist_is_json_object() {
        let plist = PlistValue::Dictionary(vec![(
            "nested".to_string(),
            PlistValue::Dictionary(vec![("a".to_string(), PlistValue::Integer(1))]),
        )]);
        let value = serde_json::to_value(&plist).unwrap();
        assert!(value.is_object());
        assert_eq!(value["nested"]["a"], 1);
    }
}
