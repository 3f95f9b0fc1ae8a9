//! Salted content hashing using BLAKE3.

use crate::error::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Hash digest size in bytes (BLAKE3 produces 256-bit hashes).
pub const HASH_SIZE: usize = 32;

/// A 32-byte content hash.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Hash([u8; HASH_SIZE]);

impl Hash {
    /// Create a Hash from raw bytes.
    pub fn from_bytes(bytes: [u8; HASH_SIZE]) -> Self {
        Hash(bytes)
    }

    /// Create a Hash from a hex string (64 hex characters).
    pub fn from_hex(hex_str: &str) -> Result<Self> {
        if hex_str.len() != HASH_SIZE * 2 {
            return Err(Error::invalid_hash(format!(
                "Expected {} hex characters, got {}",
                HASH_SIZE * 2,
                hex_str.len()
            )));
        }

        let bytes =
            hex::decode(hex_str).map_err(|e| Error::invalid_hash(format!("Invalid hex: {}", e)))?;

        let mut hash = [0u8; HASH_SIZE];
        hash.copy_from_slice(&bytes);
        Ok(Hash(hash))
    }

    /// Convert to hex string (64 characters).
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Get the first 2 hex characters (for directory fan-out).
    pub fn prefix(&self) -> String {
        hex::encode(&self.0[..1])
    }

    /// Get the raw bytes.
    pub fn as_bytes(&self) -> &[u8; HASH_SIZE] {
        &self.0
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.to_hex())
    }
}

impl Serialize for Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Hash::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Hash accumulator pre-seeded with a store salt.
///
/// The same bytes hashed under different salts give unrelated digests, so
/// hashes from one store cannot be used to confirm content held by another.
#[derive(Clone)]
pub struct ContentHasher {
    inner: blake3::Hasher,
}

impl ContentHasher {
    /// Create a hasher seeded with `salt`.
    pub fn new(salt: &[u8]) -> Self {
        let mut inner = blake3::Hasher::new();
        inner.update(salt);
        Self { inner }
    }

    /// Feed more data.
    pub fn update(&mut self, data: &[u8]) -> &mut Self {
        self.inner.update(data);
        self
    }

    /// Finish and return the digest.
    pub fn finalize(&self) -> Hash {
        Hash(*self.inner.finalize().as_bytes())
    }
}

/// Hash `data` under `salt` in one call: H(salt ‖ data).
pub fn salted_hash(salt: &[u8], data: &[u8]) -> Hash {
    ContentHasher::new(salt).update(data).finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsalted_matches_plain_blake3() {
        let hash = salted_hash(b"", b"hello world");

        // BLAKE3 of "hello world"
        assert_eq!(
            hash.to_hex(),
            "d74981efa70a0c880b8d8c1985d075dbcbf679b99a5f9914e5aaf96b831a9e24"
        );
    }

    #[test]
    fn test_salt_is_prefix() {
        let salted = salted_hash(b"salt", b"data");
        let concatenated = salted_hash(b"", b"saltdata");
        assert_eq!(salted, concatenated);
    }

    #[test]
    fn test_different_salts_differ() {
        let a = salted_hash(&[1u8; 128], b"same block");
        let b = salted_hash(&[2u8; 128], b"same block");
        assert_ne!(a, b);
    }

    #[test]
    fn test_incremental_update() {
        let mut hasher = ContentHasher::new(b"salt");
        hasher.update(b"hello ").update(b"world");
        assert_eq!(hasher.finalize(), salted_hash(b"salt", b"hello world"));
    }

    #[test]
    fn test_hash_from_hex_invalid() {
        assert!(Hash::from_hex("abcd").is_err());
        assert!(Hash::from_hex("").is_err());
        assert!(Hash::from_hex(&"z".repeat(64)).is_err());
    }

    #[test]
    fn test_hash_prefix() {
        let hash = salted_hash(b"", b"test");
        let prefix = hash.prefix();
        assert_eq!(prefix.len(), 2);
        assert!(hash.to_hex().starts_with(&prefix));
    }

    #[test]
    fn test_hash_serde_as_hex_string() {
        let hash = salted_hash(b"salt", b"block");
        let json = serde_json::to_string(&hash).unwrap();
        assert_eq!(json, format!("\"{}\"", hash.to_hex()));

        let parsed: Hash = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, hash);

        assert!(serde_json::from_str::<Hash>("\"not-a-hash\"").is_err());
    }

    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Hashing the same data under the same salt always produces the same hash
        #[test]
        fn prop_salted_hash_deterministic(salt: Vec<u8>, data: Vec<u8>) {
            prop_assert_eq!(salted_hash(&salt, &data), salted_hash(&salt, &data));
        }

        /// Hex encoding round-trips
        #[test]
        fn prop_hex_roundtrip(bytes in prop::array::uniform32(any::<u8>())) {
            let hash = Hash::from_bytes(bytes);
            let parsed = Hash::from_hex(&hash.to_hex())?;
            prop_assert_eq!(hash, parsed);
        }

        /// Invalid hex length always fails
        #[test]
        fn prop_invalid_hex_length_fails(
            s in "[0-9a-f]{0,63}|[0-9a-f]{65,128}"
        ) {
            prop_assert!(Hash::from_hex(&s).is_err());
        }
    }
}
