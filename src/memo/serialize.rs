//! Canonical string form of argument values.
//!
//! The output depends only on content: map keys are sorted, list elements are
//! sorted after serialization, excluded and non-storable map members are
//! skipped. Two lists holding the same elements in a different order therefore
//! produce the same string. Strings and map keys are written as quoted JSON
//! strings so their contents can never be mistaken for separators.

use std::collections::BTreeSet;

use serde_json::Value as JsonValue;

use super::value::Value;

const NULL_LITERAL: &str = "null";

/// Map member names ignored while fingerprinting.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExcludedKeys(BTreeSet<String>);

impl ExcludedKeys {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains(key)
    }

    pub fn insert(&mut self, key: impl Into<String>) {
        self.0.insert(key.into());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }
}

impl<S: Into<String>> FromIterator<S> for ExcludedKeys {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

/// Serialize `value` into its canonical string.
pub fn stable_serialize(value: &Value, excluded: &ExcludedKeys) -> String {
    let mut out = String::new();
    write_value(value, excluded, &mut out);
    out
}

fn write_value(value: &Value, excluded: &ExcludedKeys, out: &mut String) {
    match value {
        Value::Absent | Value::Opaque(_) | Value::Null => out.push_str(NULL_LITERAL),
        Value::Bool(flag) => out.push_str(if *flag { "true" } else { "false" }),
        Value::Number(number) => out.push_str(&number.to_string()),
        Value::String(text) => push_quoted(text, out),
        Value::List(items) => {
            let mut rendered: Vec<String> = items
                .iter()
                .map(|item| stable_serialize(item, excluded))
                .collect();
            rendered.sort_unstable();

            out.push('[');
            out.push_str(&rendered.join(","));
            out.push(']');
        }
        Value::Map(members) => {
            out.push('{');
            // BTreeMap iterates keys in lexical order already.
            let mut first = true;
            for (key, member) in members {
                if excluded.contains(key) || !member.is_storable() {
                    continue;
                }
                if !first {
                    out.push(',');
                }
                first = false;
                push_quoted(key, out);
                out.push(':');
                write_value(member, excluded, out);
            }
            out.push('}');
        }
    }
}

fn push_quoted(text: &str, out: &mut String) {
    out.push_str(&JsonValue::from(text).to_string());
}
