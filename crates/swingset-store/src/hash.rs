//! Content hashes and deterministic CBOR.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

/// Text form of a hash: this prefix followed by 64 lowercase hex digits.
pub const HASH_PREFIX: &str = "sha256:";

/// Encode through `serde_cbor::Value`, whose maps are ordered, so equal
/// values always produce equal bytes.
pub fn to_canonical_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, serde_cbor::Error> {
    serde_cbor::to_vec(&serde_cbor::value::to_value(value)?)
}

/// SHA-256 digest addressing snapshot blobs and chaining kv commits.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash([u8; 32]);

impl Hash {
    pub fn digest(bytes: &[u8]) -> Self {
        Self::digest_parts([bytes])
    }

    /// Digest of the concatenation of `parts`.
    pub fn digest_parts<'a>(parts: impl IntoIterator<Item = &'a [u8]>) -> Self {
        let hasher = parts
            .into_iter()
            .fold(Sha256::new(), |hasher, part| hasher.chain_update(part));
        Hash(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{HASH_PREFIX}{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({self})")
    }
}

#[derive(Debug, thiserror::Error)]
#[error("malformed hash {text:?}: {problem}")]
pub struct HashParseError {
    text: String,
    problem: &'static str,
}

impl FromStr for Hash {
    type Err = HashParseError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let malformed = |problem| HashParseError {
            text: text.to_string(),
            problem,
        };
        let digits = text
            .strip_prefix(HASH_PREFIX)
            .ok_or_else(|| malformed("expected a sha256: prefix"))?;
        let bytes = hex::decode(digits).map_err(|_| malformed("digest is not hex"))?;
        let bytes = <[u8; 32]>::try_from(bytes).map_err(|_| malformed("digest is not 32 bytes"))?;
        Ok(Hash(bytes))
    }
}

impl Serialize for Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_form_parses_back() {
        let hash = Hash::digest(b"snapshot");
        let text = hash.to_string();
        assert!(text.starts_with(HASH_PREFIX));
        assert_eq!(text.len(), HASH_PREFIX.len() + 64);
        assert_eq!(text.parse::<Hash>().unwrap(), hash);
    }

    #[test]
    fn parts_hash_like_their_concatenation() {
        assert_eq!(
            Hash::digest(b"abcdef"),
            Hash::digest_parts([b"ab".as_slice(), b"cd", b"ef"])
        );
    }

    #[test]
    fn malformed_text_is_refused() {
        assert!("deadbeef".parse::<Hash>().is_err());
        assert!("sha256:abcd".parse::<Hash>().is_err());
        assert!(format!("sha256:{}", "zz".repeat(32)).parse::<Hash>().is_err());
    }

    #[test]
    fn map_order_does_not_change_the_encoding() {
        use std::collections::HashMap;
        let forward: HashMap<&str, u32> = [("zeta", 1), ("alpha", 2)].into_iter().collect();
        let backward: HashMap<&str, u32> = [("alpha", 2), ("zeta", 1)].into_iter().collect();
        assert_eq!(
            to_canonical_cbor(&forward).unwrap(),
            to_canonical_cbor(&backward).unwrap()
        );
    }

    #[test]
    fn serde_uses_the_text_form() {
        let hash = Hash::digest(b"heap");
        let bytes = to_canonical_cbor(&hash).unwrap();
        let text: String = serde_cbor::from_slice(&bytes).unwrap();
        assert_eq!(text, hash.to_string());
        assert_eq!(serde_cbor::from_slice::<Hash>(&bytes).unwrap(), hash);
    }
}
