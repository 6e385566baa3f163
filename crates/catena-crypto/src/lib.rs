//! # catena-crypto
//!
//! Cryptographic primitives for the Catena blockchain.
//!
//! The cryptographic suite is fixed — there is no algorithm negotiation.
//! Every identity is an Ed25519 key pair, and every content address is a
//! SHA-256 hash.
//!
//! ## Modules
//!
//! - [`hash`] — 32-byte SHA-256 [`hash::Hash`] values with hex/base58 display
//! - [`keys`] — Ed25519 signing and verification, identity derivation

pub mod hash;
pub mod keys;

pub use hash::Hash;
pub use keys::{KeyPair, Signature, SigningKey, VerifyingKey};

/// Error types for cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// Ed25519 signature verification failed.
    #[error("signature verification failed")]
    SignatureVerification,

    /// Input bytes did not form a valid key or signature.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Hex or base58 decoding failed.
    #[error("encoding error: {0}")]
    Encoding(String),
}

pub type Result<T> = std::result::Result<T, CryptoError>;
