use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use cxo_crypto::{ContentHasher, PubKey, SecretKey, Signature, SignatureError};
use cxo_types::Hash;
use serde::{Deserialize, Serialize};

/// A signed, versioned snapshot of a feed's object tree.
///
/// The signature covers a domain-separated digest of every other field, so
/// it binds the top-level hash to the feed key and to the sequence number.
/// `prev` chains each Root to its predecessor (blank for the first one).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Root {
    pub pub_key: PubKey,
    pub seq: u64,
    /// Unix time in nanoseconds.
    pub time: i64,
    pub prev: Hash,
    /// Hash of the top-level object.
    pub hash: Hash,
    pub sig: Signature,
}

impl Root {
    fn header(pub_key: &PubKey, seq: u64, time: i64, prev: &Hash, hash: &Hash) -> Hash {
        ContentHasher::ROOT.hash_parts(&[
            pub_key.as_bytes(),
            &seq.to_le_bytes(),
            &time.to_le_bytes(),
            prev.as_bytes(),
            hash.as_bytes(),
        ])
    }

    /// Create and sign a Root for the feed of `secret`.
    pub fn sign(secret: &SecretKey, seq: u64, time: i64, prev: Hash, hash: Hash) -> Self {
        let pub_key = secret.pub_key();
        let digest = Self::header(&pub_key, seq, time, &prev, &hash);
        Self {
            pub_key,
            seq,
            time,
            prev,
            hash,
            sig: secret.sign(digest.as_bytes()),
        }
    }

    /// Check the signature against the feed key.
    pub fn verify(&self) -> Result<(), SignatureError> {
        let digest = self.digest();
        self.pub_key.verify(digest.as_bytes(), &self.sig)
    }

    /// Signed header digest. Identifies this Root; the next Root of the
    /// feed carries it as `prev`.
    pub fn digest(&self) -> Hash {
        Self::header(&self.pub_key, self.seq, self.time, &self.prev, &self.hash)
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        Utc.timestamp_nanos(self.time)
    }

    /// `feed/seq:hash` with shortened hex.
    pub fn short(&self) -> String {
        format!(
            "{}/{}:{}",
            self.pub_key.short_hex(),
            self.seq,
            self.hash.short_hex()
        )
    }
}

impl fmt::Display for Root {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.short())
    }
}

/// How much of a Root's tree is present locally.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FillState {
    /// Accepted, nothing of the tree present yet.
    Unfilled,
    /// Part of the tree is present.
    Filling,
    /// Every object reachable from the top is present.
    Full,
}

impl fmt::Display for FillState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FillState::Unfilled => write!(f, "unfilled"),
            FillState::Filling => write!(f, "filling"),
            FillState::Full => write!(f, "full"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root(secret: &SecretKey) -> Root {
        Root::sign(secret, 3, 1_700_000_000_000_000_000, Hash::sum(b"prev"), Hash::sum(b"top"))
    }

    #[test]
    fn signed_root_verifies() {
        let sk = SecretKey::generate();
        assert!(root(&sk).verify().is_ok());
    }

    #[test]
    fn any_field_change_breaks_signature() {
        let sk = SecretKey::generate();
        let mut r = root(&sk);
        r.seq += 1;
        assert_eq!(r.verify(), Err(SignatureError::InvalidSignature));

        let mut r = root(&sk);
        r.hash = Hash::sum(b"other top");
        assert!(r.verify().is_err());

        let mut r = root(&sk);
        r.pub_key = SecretKey::generate().pub_key();
        assert!(r.verify().is_err());
    }

    #[test]
    fn digest_differs_from_object_keys() {
        let r = root(&SecretKey::generate());
        assert_ne!(r.digest(), r.hash);
        assert_eq!(r.digest(), r.digest());
    }

    #[test]
    fn timestamp_and_display() {
        let r = root(&SecretKey::generate());
        assert_eq!(r.timestamp().timestamp(), 1_700_000_000);
        assert!(r.to_string().contains("/3:"));
        assert_eq!(FillState::Filling.to_string(), "filling");
    }
}
