//! Persisted cache entries and the result projection they carry.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};

use super::keys::CacheKey;
use super::value::{Value, storable_members};

/// Field that holds results which are not keyed structures.
pub const SCALAR_FIELD: &str = "$value";

/// A cached result as held by a persistent store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub id: CacheKey,
    pub namespace: String,
    pub fields: JsonMap<String, JsonValue>,
    /// Minutes since the Unix epoch of the last read or write.
    pub last_accessed: i64,
}

impl CacheEntry {
    /// Flatten `result` into a new entry.
    ///
    /// Keyed structures become `fields` minus non-storable members; anything
    /// else, including an empty result, is kept under [`SCALAR_FIELD`].
    pub fn from_result<T>(
        id: CacheKey,
        namespace: impl Into<String>,
        result: &T,
        now_minutes: i64,
    ) -> Result<Self, serde_json::Error>
    where
        T: Serialize + ?Sized,
    {
        let fields = match Value::from_serialize(result)? {
            Value::Map(members) => storable_members(members),
            other => {
                let mut fields = JsonMap::new();
                fields.insert(
                    SCALAR_FIELD.to_string(),
                    other.into_json().unwrap_or(JsonValue::Null),
                );
                fields
            }
        };

        Ok(Self {
            id,
            namespace: namespace.into(),
            fields,
            last_accessed: now_minutes,
        })
    }

    /// Rebuild the cached result.
    pub fn restore<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        match self.scalar() {
            Some(value) => serde_json::from_value(value.clone()),
            None => serde_json::from_value(JsonValue::Object(self.fields.clone())),
        }
    }

    /// Whether the entry records an empty result.
    pub fn is_placeholder(&self) -> bool {
        matches!(self.scalar(), Some(JsonValue::Null))
    }

    /// Same entry with `last_accessed` moved to `now_minutes`.
    pub fn touched(mut self, now_minutes: i64) -> Self {
        self.last_accessed = now_minutes;
        self
    }

    pub fn age_minutes(&self, now_minutes: i64) -> i64 {
        now_minutes.saturating_sub(self.last_accessed)
    }

    /// Strictly older than `max_age_minutes`.
    pub fn is_older_than(&self, max_age_minutes: u64, now_minutes: i64) -> bool {
        let max_age = i64::try_from(max_age_minutes).unwrap_or(i64::MAX);
        self.age_minutes(now_minutes) > max_age
    }

    fn scalar(&self) -> Option<&JsonValue> {
        if self.fields.len() == 1 {
            self.fields.get(SCALAR_FIELD)
        } else {
            None
        }
    }
}
