//! Cryptographic primitives for CXO.
//!
//! Provides domain-separated BLAKE3 hashing and the Ed25519 key material that
//! identifies a feed and signs its Roots. All crypto operations wrap
//! established libraries.

pub mod hasher;
pub mod signer;

pub use hasher::ContentHasher;
pub use signer::{PubKey, SecretKey, Signature, SignatureError};
