//! Client-side encryption for transferred objects.
//!
//! Content is encrypted with AES-256-CBC and authenticated with HMAC-SHA256.
//! Both symmetric keys are generated per object and wrapped with RSA-OAEP so
//! they can be stored next to the object as metadata.

pub mod cipher;
pub mod keys;
pub mod metadata;

use thiserror::Error;

/// AES-256 key size.
pub const KEY_SIZE: usize = 32;

/// AES block size.
pub const AES_BLOCK_SIZE: usize = 16;

/// CBC initialization vector size.
pub const IV_SIZE: usize = 16;

/// HMAC-SHA256 tag size.
pub const MAC_SIZE: usize = 32;

/// Errors that can occur during encryption, decryption or key handling.
///
/// Variants marked `[INTEGRITY VIOLATION]` mean the stored data or its
/// metadata does not authenticate. The affected object must not be trusted.
#[derive(Error, Debug)]
pub enum CryptoError {
    // =========================================================================
    // INTEGRITY VIOLATIONS
    // =========================================================================
    /// A chunk or stream MAC did not verify.
    ///
    /// **[INTEGRITY VIOLATION]** The ciphertext was modified or the wrong
    /// signing key was unwrapped.
    #[error("[INTEGRITY VIOLATION] HMAC verification failed - ciphertext tampered or wrong key")]
    MacMismatch,

    /// The RSA signature over the wrapped content key did not verify.
    ///
    /// **[INTEGRITY VIOLATION]**
    #[error("[INTEGRITY VIOLATION] wrapped content key signature does not verify")]
    SignatureMismatch,

    /// PKCS#7 padding was malformed after decryption.
    #[error("invalid PKCS#7 padding - corrupted ciphertext or wrong key")]
    Padding,

    // =========================================================================
    // KEY ERRORS
    // =========================================================================
    /// RSA-OAEP unwrapping failed.
    ///
    /// Either the private key does not match the wrapping public key or the
    /// wrapped key was truncated.
    #[error("failed to unwrap content key: {0}")]
    KeyUnwrap(String),

    #[error("failed to wrap content key: {0}")]
    KeyWrap(String),

    #[error("failed to sign wrapped content key: {0}")]
    Signing(String),

    /// The operation needs an RSA key that was not configured.
    #[error("no RSA {0} key available")]
    MissingKey(&'static str),

    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    // =========================================================================
    // FORMAT ERRORS
    // =========================================================================
    /// Ciphertext is not a whole number of AES blocks.
    #[error("invalid ciphertext length {len}: not a multiple of the AES block size")]
    InvalidCiphertextLength { len: usize },

    /// Plaintext given to an unpadded encryption is not block aligned.
    #[error("unpadded plaintext of {len} bytes is not block aligned")]
    UnalignedPlaintext { len: usize },

    /// A sealed chunk is shorter than IV + one block + MAC.
    #[error("sealed chunk of {len} bytes is too short")]
    ChunkTooShort { len: usize },
}

pub use keys::{KeyMaterial, ObjectKeys, WrappedKeys};
