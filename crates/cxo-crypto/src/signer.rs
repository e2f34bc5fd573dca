use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Ed25519 secret key. Whoever holds it owns the feed of its [`PubKey`].
pub struct SecretKey(ed25519_dalek::SigningKey);

/// Ed25519 public key. Identifies a feed.
///
/// Kept as raw bytes so it can be ordered, hashed and used as a map key. The
/// curve point is validated when the key is parsed and again on every
/// verification.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PubKey([u8; 32]);

/// Ed25519 signature.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(#[serde(with = "signature_serde")] ed25519_dalek::Signature);

impl SecretKey {
    /// Generate a new random secret key.
    pub fn generate() -> Self {
        let mut csprng = rand::thread_rng();
        Self(ed25519_dalek::SigningKey::generate(&mut csprng))
    }

    /// Create from a raw 32-byte secret.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(ed25519_dalek::SigningKey::from_bytes(&bytes))
    }

    /// Parse a hex-encoded 32-byte secret.
    pub fn from_hex(s: &str) -> Result<Self, SignatureError> {
        let bytes = hex::decode(s).map_err(|_| SignatureError::InvalidKey)?;
        let arr: [u8; 32] = bytes.try_into().map_err(|_| SignatureError::InvalidKey)?;
        Ok(Self::from_bytes(arr))
    }

    /// Hex-encoded secret. Handle with care.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0.as_bytes())
    }

    /// The feed key this secret signs for.
    pub fn pub_key(&self) -> PubKey {
        PubKey(self.0.verifying_key().to_bytes())
    }

    /// Sign a message.
    pub fn sign(&self, message: &[u8]) -> Signature {
        use ed25519_dalek::Signer;
        Signature(self.0.sign(message))
    }

    /// Raw secret key bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        self.0.as_bytes()
    }
}

impl Clone for SecretKey {
    fn clone(&self) -> Self {
        Self::from_bytes(*self.0.as_bytes())
    }
}

impl PubKey {
    /// Create from a raw 32-byte public key, rejecting invalid curve points.
    pub fn from_bytes(bytes: [u8; 32]) -> Result<Self, SignatureError> {
        ed25519_dalek::VerifyingKey::from_bytes(&bytes).map_err(|_| SignatureError::InvalidKey)?;
        Ok(Self(bytes))
    }

    /// Parse from a 64-character hex string.
    pub fn from_hex(s: &str) -> Result<Self, SignatureError> {
        let bytes = hex::decode(s).map_err(|_| SignatureError::InvalidKey)?;
        let arr: [u8; 32] = bytes.try_into().map_err(|_| SignatureError::InvalidKey)?;
        Self::from_bytes(arr)
    }

    /// Verify a signature on a message.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<(), SignatureError> {
        use ed25519_dalek::Verifier;
        let key = ed25519_dalek::VerifyingKey::from_bytes(&self.0)
            .map_err(|_| SignatureError::InvalidKey)?;
        key.verify(message, &signature.0)
            .map_err(|_| SignatureError::InvalidSignature)
    }

    /// Raw public key bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn short_hex(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl Signature {
    /// Raw 64 signature bytes.
    pub fn to_bytes(&self) -> [u8; 64] {
        self.0.to_bytes()
    }

    pub fn from_bytes(bytes: &[u8; 64]) -> Self {
        Self(ed25519_dalek::Signature::from_bytes(bytes))
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretKey(<redacted>)")
    }
}

impl fmt::Debug for PubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PubKey({})", self.short_hex())
    }
}

impl fmt::Display for PubKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for PubKey {
    type Err = SignatureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({}...)", hex::encode(&self.0.to_bytes()[..8]))
    }
}

/// Errors from signing operations.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("invalid signature")]
    InvalidSignature,
    #[error("invalid key")]
    InvalidKey,
}

mod signature_serde {
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(sig: &ed25519_dalek::Signature, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_bytes(&sig.to_bytes())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<ed25519_dalek::Signature, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes: Vec<u8> = Vec::deserialize(deserializer)?;
        let arr: [u8; 64] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("expected 64-byte signature"))?;
        Ok(ed25519_dalek::Signature::from_bytes(&arr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify() {
        let sk = SecretKey::generate();
        let sig = sk.sign(b"root header");
        assert!(sk.pub_key().verify(b"root header", &sig).is_ok());
    }

    #[test]
    fn wrong_message_fails() {
        let sk = SecretKey::generate();
        let sig = sk.sign(b"original");
        assert_eq!(
            sk.pub_key().verify(b"tampered", &sig),
            Err(SignatureError::InvalidSignature)
        );
    }

    #[test]
    fn foreign_key_fails() {
        let owner = SecretKey::generate();
        let other = SecretKey::generate();
        let sig = other.sign(b"root header");
        assert!(owner.pub_key().verify(b"root header", &sig).is_err());
    }

    #[test]
    fn secret_hex_roundtrip_keeps_pub_key() {
        let sk = SecretKey::generate();
        let restored = SecretKey::from_hex(&sk.to_hex()).unwrap();
        assert_eq!(sk.pub_key(), restored.pub_key());
    }

    #[test]
    fn pub_key_parse() {
        let pk = SecretKey::generate().pub_key();
        assert_eq!(pk.to_string().parse::<PubKey>().unwrap(), pk);
        assert_eq!(PubKey::from_hex("00ff"), Err(SignatureError::InvalidKey));
    }

    #[test]
    fn signature_survives_bincode() {
        let sk = SecretKey::generate();
        let sig = sk.sign(b"test");
        let bytes = bincode::serialize(&sig).unwrap();
        let parsed: Signature = bincode::deserialize(&bytes).unwrap();
        assert_eq!(sig, parsed);
    }

    #[test]
    fn signature_serde_json_roundtrip() {
        let sig = SecretKey::generate().sign(b"test");
        let json = serde_json::to_string(&sig).unwrap();
        let parsed: Signature = serde_json::from_str(&json).unwrap();
        assert_eq!(sig, parsed);
    }

    #[test]
    fn debug_redacts_secret_key() {
        let debug = format!("{:?}", SecretKey::generate());
        assert!(debug.contains("redacted"));
    }

    #[test]
    fn clone_keeps_identity() {
        let sk = SecretKey::generate();
        assert_eq!(sk.clone().pub_key(), sk.pub_key());
    }
}
