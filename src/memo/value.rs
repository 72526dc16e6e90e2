//! Argument and result values understood by the memoization layer.
//!
//! `Value` is a small JSON-like tree with two extra tags that mark members
//! which can never be serialized or stored: [`Value::Absent`] and
//! [`Value::Opaque`]. The stable serializer and the storage projection both
//! drop these members instead of trying to inspect them.

use std::collections::BTreeMap;

use serde::de::{Deserialize, Deserializer};
use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};
use serde_json::{Map as JsonMap, Number, Value as JsonValue};

/// Non-serializable members that may appear inside an argument tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opaque {
    /// A callable member.
    Function,
    /// A computation that has not settled yet.
    Pending,
}

/// Structured value used for fingerprinting and storage projection.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    /// A member that is declared but carries no value.
    #[default]
    Absent,
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Opaque(Opaque),
}

impl Value {
    /// Convert any serializable type into a `Value`.
    pub fn from_serialize<T>(value: &T) -> Result<Self, serde_json::Error>
    where
        T: Serialize + ?Sized,
    {
        serde_json::to_value(value).map(Self::from)
    }

    /// Returns false for the closed set of members that are never serialized.
    pub fn is_storable(&self) -> bool {
        !matches!(self, Self::Absent | Self::Opaque(_))
    }

    /// Project the value onto JSON, dropping non-storable members.
    ///
    /// Returns `None` when the value itself is not storable. Non-storable list
    /// elements become `null` so positions are preserved.
    pub fn into_json(self) -> Option<JsonValue> {
        match self {
            Self::Absent | Self::Opaque(_) => None,
            Self::Null => Some(JsonValue::Null),
            Self::Bool(flag) => Some(JsonValue::Bool(flag)),
            Self::Number(number) => Some(JsonValue::Number(number)),
            Self::String(text) => Some(JsonValue::String(text)),
            Self::List(items) => Some(JsonValue::Array(
                items
                    .into_iter()
                    .map(|item| item.into_json().unwrap_or(JsonValue::Null))
                    .collect(),
            )),
            Self::Map(members) => Some(JsonValue::Object(storable_members(members))),
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Self::Map(members) => Some(members),
            _ => None,
        }
    }
}

pub(crate) fn storable_members(members: BTreeMap<String, Value>) -> JsonMap<String, JsonValue> {
    members
        .into_iter()
        .filter_map(|(key, member)| member.into_json().map(|json| (key, json)))
        .collect()
}

impl From<JsonValue> for Value {
    fn from(value: JsonValue) -> Self {
        match value {
            JsonValue::Null => Self::Null,
            JsonValue::Bool(flag) => Self::Bool(flag),
            JsonValue::Number(number) => Self::Number(number),
            JsonValue::String(text) => Self::String(text),
            JsonValue::Array(items) => Self::List(items.into_iter().map(Self::from).collect()),
            JsonValue::Object(members) => Self::Map(
                members
                    .into_iter()
                    .map(|(key, member)| (key, Self::from(member)))
                    .collect(),
            ),
        }
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

macro_rules! impl_from_integer {
    ($($ty:ty),+) => {
        $(
            impl From<$ty> for Value {
                fn from(value: $ty) -> Self {
                    Self::Number(Number::from(value))
                }
            }
        )+
    };
}

impl_from_integer!(i8, i16, i32, i64, u8, u16, u32, u64, usize, isize);

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Number::from_f64(value).map_or(Self::Null, Self::Number)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<Opaque> for Value {
    fn from(value: Opaque) -> Self {
        Self::Opaque(value)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(values: Vec<T>) -> Self {
        Self::List(values.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for Value {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self::Map(
            iter.into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .collect(),
        )
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Absent | Self::Opaque(_) | Self::Null => serializer.serialize_unit(),
            Self::Bool(flag) => serializer.serialize_bool(*flag),
            Self::Number(number) => number.serialize(serializer),
            Self::String(text) => serializer.serialize_str(text),
            Self::List(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Self::Map(members) => {
                let mut map = serializer.serialize_map(None)?;
                for (key, member) in members.iter().filter(|(_, member)| member.is_storable()) {
                    map.serialize_entry(key, member)?;
                }
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        JsonValue::deserialize(deserializer).map(Self::from)
    }
}
