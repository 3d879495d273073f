//! Metadata dictionary model and conversions from the bus representation.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use zvariant::OwnedValue;

/// Namespaced metadata dictionary (`xesam:title`, `mpris:length`, ...).
///
/// Ordered so that formatted output and tests are deterministic.
pub type Metadata = BTreeMap<String, MetaValue>;

/// A single metadata value.
///
/// MPRIS metadata is heterogeneous; this is the closed set of shapes the
/// relay carries. `mpris:length` is always a `Float` holding seconds,
/// `xesam:artist` is always a `StrList` even for a single artist.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Int(i64),
    Float(f64),
    Str(String),
    StrList(Vec<String>),
}

impl fmt::Display for MetaValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetaValue::Int(i) => write!(f, "{i}"),
            MetaValue::Float(v) => write!(f, "{v}"),
            MetaValue::Str(s) => write!(f, "{s}"),
            MetaValue::StrList(items) => write!(f, "{}", items.join(", ")),
        }
    }
}

impl From<&str> for MetaValue {
    fn from(s: &str) -> Self {
        MetaValue::Str(s.to_string())
    }
}

impl From<String> for MetaValue {
    fn from(s: String) -> Self {
        MetaValue::Str(s)
    }
}

impl From<f64> for MetaValue {
    fn from(v: f64) -> Self {
        MetaValue::Float(v)
    }
}

impl From<i64> for MetaValue {
    fn from(v: i64) -> Self {
        MetaValue::Int(v)
    }
}

/// Unwrap a single variant value into a [`MetaValue`].
///
/// Players disagree about integer signedness and about whether artist is a
/// string or an array, so this is deliberately permissive. Unsupported
/// shapes collapse to their string rendering.
fn unwrap_value(value: &zvariant::Value<'_>) -> MetaValue {
    use zvariant::Value;

    match value {
        Value::Str(s) => MetaValue::Str(s.to_string()),
        Value::Bool(b) => MetaValue::Str(b.to_string()),
        Value::I16(v) => MetaValue::Int(i64::from(*v)),
        Value::I32(v) => MetaValue::Int(i64::from(*v)),
        Value::I64(v) => MetaValue::Int(*v),
        Value::U8(v) => MetaValue::Int(i64::from(*v)),
        Value::U16(v) => MetaValue::Int(i64::from(*v)),
        Value::U32(v) => MetaValue::Int(i64::from(*v)),
        Value::U64(v) => MetaValue::Int(*v as i64),
        Value::F64(v) => MetaValue::Float(*v),
        Value::ObjectPath(p) => MetaValue::Str(p.to_string()),
        Value::Array(arr) => {
            let items = arr
                .iter()
                .filter_map(|item| {
                    if let Value::Str(s) = item {
                        Some(s.to_string())
                    } else {
                        None
                    }
                })
                .collect();
            MetaValue::StrList(items)
        }
        Value::Value(inner) => unwrap_value(inner),
        other => MetaValue::Str(format!("{other:?}")),
    }
}

/// Convert a raw variant map from the bus into a [`Metadata`] dictionary.
///
/// Applies the two normalization invariants at the boundary:
/// `mpris:length` is converted from microseconds to seconds, and
/// `xesam:artist` is coerced to a list even when a player sends a single
/// string.
pub fn from_variant_map(raw: &HashMap<String, OwnedValue>) -> Metadata {
    let mut metadata = Metadata::new();
    for (key, value) in raw {
        let mut unwrapped = unwrap_value(value);
        if key == "mpris:length" {
            unwrapped = match unwrapped {
                MetaValue::Int(us) => MetaValue::Float(us as f64 / 1_000_000.0),
                MetaValue::Float(us) => MetaValue::Float(us / 1_000_000.0),
                other => other,
            };
        }
        if key == "xesam:artist"
            && let MetaValue::Str(single) = unwrapped
        {
            unwrapped = MetaValue::StrList(vec![single]);
        }
        metadata.insert(key.clone(), unwrapped);
    }
    metadata
}

/// Rewrite the namespace separator `:` to `|` in every key.
///
/// Applied at the server boundary only, so that keys are safe to use as
/// format-template placeholders.
pub fn pipe_keys(metadata: &Metadata) -> Metadata {
    metadata
        .iter()
        .map(|(k, v)| (k.replace(':', "|"), v.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use zvariant::Value;

    fn owned(value: Value<'_>) -> OwnedValue {
        OwnedValue::try_from(value).unwrap()
    }

    #[test]
    fn length_is_converted_to_seconds() {
        let mut raw = HashMap::new();
        raw.insert("mpris:length".to_string(), owned(Value::I64(100_000_000)));
        let metadata = from_variant_map(&raw);
        assert_eq!(metadata["mpris:length"], MetaValue::Float(100.0));
    }

    #[test]
    fn length_round_trips_within_a_microsecond() {
        let original_us: i64 = 245_832_117;
        let mut raw = HashMap::new();
        raw.insert("mpris:length".to_string(), owned(Value::I64(original_us)));
        let metadata = from_variant_map(&raw);
        let Some(MetaValue::Float(seconds)) = metadata.get("mpris:length") else {
            panic!("length must be a float");
        };
        let back = (seconds * 1_000_000.0).round() as i64;
        assert!((back - original_us).abs() <= 1);
    }

    #[test]
    fn single_string_artist_becomes_a_list() {
        let mut raw = HashMap::new();
        raw.insert("xesam:artist".to_string(), owned(Value::from("Solo")));
        let metadata = from_variant_map(&raw);
        assert_eq!(
            metadata["xesam:artist"],
            MetaValue::StrList(vec!["Solo".to_string()])
        );
    }

    #[test]
    fn artist_array_stays_a_list() {
        let mut raw = HashMap::new();
        raw.insert(
            "xesam:artist".to_string(),
            owned(Value::new(vec!["A", "B"])),
        );
        let metadata = from_variant_map(&raw);
        assert_eq!(
            metadata["xesam:artist"],
            MetaValue::StrList(vec!["A".to_string(), "B".to_string()])
        );
    }

    #[test]
    fn pipe_rewrite_replaces_namespace_separator() {
        let mut metadata = Metadata::new();
        metadata.insert("xesam:title".to_string(), MetaValue::from("T"));
        metadata.insert("tracking:status".to_string(), MetaValue::from("Playing"));
        let piped = pipe_keys(&metadata);
        assert!(piped.contains_key("xesam|title"));
        assert!(piped.contains_key("tracking|status"));
        assert!(piped.keys().all(|k| !k.contains(':')));
    }

    #[test]
    fn display_joins_artist_lists() {
        let value = MetaValue::StrList(vec!["A".to_string(), "B".to_string()]);
        assert_eq!(value.to_string(), "A, B");
    }
}
