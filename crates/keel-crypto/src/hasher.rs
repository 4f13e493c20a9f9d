use keel_types::ObjectId;
use serde_json::Value;

use crate::canonical::canonical_json;

/// Number of hex characters kept from a digest when forming an id.
pub const ID_HEX_LEN: usize = 32;

/// Domain-separated BLAKE3 content hasher.
///
/// Each hasher carries a domain tag (e.g., `"keel-node-v1"`) that is
/// prepended to every hash computation, so the same bytes hashed under two
/// domains never collide. Ids are the first [`ID_HEX_LEN`] hex characters of
/// the digest.
pub struct ContentHasher {
    domain: &'static str,
}

impl ContentHasher {
    /// Hasher for serialized graph nodes (including chunk records).
    pub const NODE: Self = Self {
        domain: "keel-node-v1",
    };

    /// Create a hasher with a custom domain tag.
    pub const fn new(domain: &'static str) -> Self {
        Self { domain }
    }

    /// Hash raw bytes with domain separation.
    pub fn hash(&self, data: &[u8]) -> ObjectId {
        let hex = self.digest_hex(data);
        ObjectId::new(hex).unwrap_or_else(|_| unreachable!("hex digests are never empty"))
    }

    /// Hash a JSON value in its canonical encoding.
    pub fn hash_json(&self, value: &Value) -> ObjectId {
        self.hash(canonical_json(value).as_bytes())
    }

    /// Verify that a JSON value hashes to the expected id.
    pub fn verify_json(&self, value: &Value, expected: &ObjectId) -> bool {
        self.hash_json(value) == *expected
    }

    /// The domain tag used by this hasher.
    pub fn domain(&self) -> &str {
        self.domain
    }

    fn digest_hex(&self, data: &[u8]) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.domain.as_bytes());
        hasher.update(b":");
        hasher.update(data);
        let digest = hasher.finalize();
        hex::encode(&digest.as_bytes()[..ID_HEX_LEN / 2])
    }
}
