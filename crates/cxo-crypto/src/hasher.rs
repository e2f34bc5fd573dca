use cxo_types::Hash;

/// Domain-separated BLAKE3 hasher.
///
/// Stored objects are keyed by a plain digest of their bytes (see
/// [`Hash::sum`]). Anything that is signed or otherwise derived, such as the
/// header of a Root, goes through a hasher with its own domain tag so that
/// its digest can never collide with an object key.
pub struct ContentHasher {
    domain: &'static str,
}

impl ContentHasher {
    /// Hasher for signed Root headers.
    pub const ROOT: Self = Self {
        domain: "cxo-root-v1",
    };

    /// Create a hasher with a custom domain tag.
    pub const fn new(domain: &'static str) -> Self {
        Self { domain }
    }

    /// Hash the concatenation of `parts` with domain separation.
    pub fn hash_parts(&self, parts: &[&[u8]]) -> Hash {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.domain.as_bytes());
        hasher.update(b":");
        for part in parts {
            hasher.update(part);
        }
        Hash::from_raw(*hasher.finalize().as_bytes())
    }

    /// Hash raw bytes with domain separation.
    pub fn hash(&self, data: &[u8]) -> Hash {
        self.hash_parts(&[data])
    }

    /// The domain tag used by this hasher.
    pub fn domain(&self) -> &str {
        self.domain
    }

    /// Check that `data` is exactly the content addressed by `expected`.
    ///
    /// This is the plain object-key check, with no domain tag.
    pub fn verify_content(data: &[u8], expected: &Hash) -> bool {
        Hash::sum(data) == *expected
    }
}
