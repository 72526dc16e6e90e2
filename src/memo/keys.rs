//! Cache key derivation.
//!
//! A key is the first 64 bits of the SHA-256 digest of the joined canonical
//! argument strings, rendered as 16 lowercase hex characters.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use super::serialize::{ExcludedKeys, stable_serialize};
use super::value::Value;

const ARG_SEPARATOR: &str = "|";
const KEY_BYTES: usize = 8;

/// Opaque fingerprint of an argument list.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    /// Wrap an already computed key, e.g. one read back from storage.
    pub fn from_raw(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Error)]
#[error("argument {position} cannot be fingerprinted: {source}")]
pub struct ArgumentError {
    pub position: usize,
    #[source]
    pub source: serde_json::Error,
}

/// Positional argument lists accepted by memoized functions.
pub trait CacheArgs {
    fn to_values(&self) -> Result<Vec<Value>, ArgumentError>;
}

impl CacheArgs for () {
    fn to_values(&self) -> Result<Vec<Value>, ArgumentError> {
        Ok(Vec::new())
    }
}

impl CacheArgs for [Value] {
    fn to_values(&self) -> Result<Vec<Value>, ArgumentError> {
        Ok(self.to_vec())
    }
}

impl CacheArgs for Vec<Value> {
    fn to_values(&self) -> Result<Vec<Value>, ArgumentError> {
        Ok(self.clone())
    }
}

fn argument<T: Serialize + ?Sized>(position: usize, value: &T) -> Result<Value, ArgumentError> {
    Value::from_serialize(value).map_err(|source| ArgumentError { position, source })
}

macro_rules! impl_cache_args {
    ($($name:ident : $idx:tt),+) => {
        impl<$($name: Serialize),+> CacheArgs for ($($name,)+) {
            fn to_values(&self) -> Result<Vec<Value>, ArgumentError> {
                Ok(vec![$(argument($idx, &self.$idx)?),+])
            }
        }
    };
}

impl_cache_args!(A: 0);
impl_cache_args!(A: 0, B: 1);
impl_cache_args!(A: 0, B: 1, C: 2);
impl_cache_args!(A: 0, B: 1, C: 2, D: 3);
impl_cache_args!(A: 0, B: 1, C: 2, D: 3, E: 4);
impl_cache_args!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5);
impl_cache_args!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6);
impl_cache_args!(A: 0, B: 1, C: 2, D: 3, E: 4, F: 5, G: 6, H: 7);

/// Derive the cache key for `args`, ignoring map members named in `excluded`.
pub fn fingerprint<A>(excluded: &ExcludedKeys, args: &A) -> Result<CacheKey, ArgumentError>
where
    A: CacheArgs + ?Sized,
{
    let values = args.to_values()?;
    Ok(fingerprint_values(excluded, &values))
}

/// Key for an already converted argument list.
pub fn fingerprint_values(excluded: &ExcludedKeys, values: &[Value]) -> CacheKey {
    let joined = values
        .iter()
        .map(|value| stable_serialize(value, excluded))
        .collect::<Vec<_>>()
        .join(ARG_SEPARATOR);

    let digest = Sha256::digest(joined.as_bytes());
    CacheKey(hex::encode(&digest[..KEY_BYTES]))
}
