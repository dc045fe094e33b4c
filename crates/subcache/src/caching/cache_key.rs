use std::fmt::{self, Write};
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use url::Url;

use super::KeyError;

/// The base of the synthetic URLs produced by [`CacheKey::debug_url`].
const DEBUG_URL_BASE: &str = "https://subrequest.cache/";

/// Separates the canonical parts of a sequence descriptor.
///
/// Compact JSON never contains a raw newline, so this cannot appear inside a part.
const PART_SEPARATOR: char = '\n';

/// A normalized cache key.
///
/// This is the SHA-256 hash over the canonical serialization of a key descriptor. Two
/// structurally equal descriptors always produce the same key, across calls and processes.
#[derive(Debug, Clone, Eq)]
pub struct CacheKey {
    metadata: Arc<str>,
    hash: [u8; 32],
    hex: Arc<str>,
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hex)
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl std::hash::Hash for CacheKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl CacheKey {
    /// Creates a [`CacheKey`] from a key descriptor.
    ///
    /// A descriptor serializing to a JSON array (slices, `Vec`s, tuples) contributes each element
    /// as one ordered part. Any other value, including a plain string, is treated as a sequence
    /// of one, so `"a"` and `["a"]` produce the same key.
    pub fn from_descriptor<K>(descriptor: &K) -> Result<Self, KeyError>
    where
        K: Serialize + ?Sized,
    {
        let value = serde_json::to_value(descriptor)
            .map_err(|source| KeyError::Unserializable { index: 0, source })?;

        let mut builder = CacheKeyBuilder::default();
        match value {
            Value::Array(parts) => {
                for (index, part) in parts.iter().enumerate() {
                    builder.write_part(index, part)?;
                }
            }
            other => builder.write_part(0, &other)?,
        }
        Ok(builder.build())
    }

    /// Returns the human-readable canonical input that was hashed into this key.
    pub fn metadata(&self) -> &str {
        &self.metadata
    }

    /// Returns the fixed-length hex representation of this key.
    pub fn as_str(&self) -> &str {
        &self.hex
    }

    /// Returns the relative path for this cache key.
    ///
    /// The relative path is a sha-256 hash hex-formatted like so:
    /// `v$version/aa/bbccdd/eeff...`
    pub fn cache_path(&self, version: u32) -> String {
        let hex = self.as_str();
        format!("v{version}/{}/{}/{}", &hex[..2], &hex[2..8], &hex[8..])
    }

    /// Returns a synthetic URL that embeds this key, for use by debugging tooling.
    pub fn debug_url(&self) -> Url {
        let mut url = Url::parse(DEBUG_URL_BASE).expect("the debug base URL is valid");
        url.set_query(Some(self.as_str()));
        url
    }

    #[cfg(test)]
    pub fn for_testing(key: impl Into<String>) -> Self {
        let metadata = key.into();
        CacheKeyBuilder { metadata }.build()
    }
}

/// Normalizes a key descriptor into a [`CacheKey`].
///
/// See [`CacheKey::from_descriptor`].
pub fn build_key<K>(descriptor: &K) -> Result<CacheKey, KeyError>
where
    K: Serialize + ?Sized,
{
    CacheKey::from_descriptor(descriptor)
}

/// A builder for [`CacheKey`]s.
///
/// This builder implements the [`Write`](std::fmt::Write) trait, and the intention of it is to
/// accept human readable, but most importantly **stable**, input.
/// This input in then being hashed to form the [`CacheKey`].
#[derive(Debug, Default)]
pub struct CacheKeyBuilder {
    metadata: String,
}

impl CacheKeyBuilder {
    /// Appends one canonically serialized part of a sequence descriptor.
    pub fn write_part(&mut self, index: usize, part: &Value) -> Result<(), KeyError> {
        let serialized = serde_json::to_string(part)
            .map_err(|source| KeyError::Unserializable { index, source })?;
        if index > 0 {
            self.metadata.push(PART_SEPARATOR);
        }
        self.metadata.push_str(&serialized);
        Ok(())
    }

    /// Finalize the [`CacheKey`].
    pub fn build(self) -> CacheKey {
        let hash: [u8; 32] = Sha256::digest(&self.metadata).into();

        let mut hex = String::with_capacity(64);
        for b in hash {
            hex.write_fmt(format_args!("{b:02x}")).unwrap();
        }

        CacheKey {
            metadata: self.metadata.into(),
            hash,
            hex: hex.into(),
        }
    }
}

impl fmt::Write for CacheKeyBuilder {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.metadata.write_str(s)
    }
}
