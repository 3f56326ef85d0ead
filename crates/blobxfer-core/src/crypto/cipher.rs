//! AES-256-CBC and HMAC-SHA256 primitives for both encryption modes.
//!
//! # Per-chunk format
//!
//! Every stored chunk is self-contained:
//!
//! ```text
//! IV (16) || AES-256-CBC-PKCS7(plaintext) || HMAC-SHA256(signing_key, IV || ciphertext) (32)
//! ```
//!
//! # Full-object format
//!
//! The stored object is a single CBC stream. Chunk `i` is encrypted with the
//! last ciphertext block of chunk `i - 1` as its IV; only the final chunk is
//! padded. The stream MAC covers `IV || all ciphertext` and lives in metadata.

use ::cbc::cipher::{
    BlockDecryptMut, BlockEncryptMut, KeyIvInit,
    block_padding::{NoPadding, Pkcs7},
};
use rand::RngCore;
use ring::hmac;
use tracing::trace;

use super::{AES_BLOCK_SIZE, CryptoError, IV_SIZE, KEY_SIZE, MAC_SIZE, keys::ObjectKeys};

type Aes256CbcEnc = ::cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = ::cbc::Decryptor<aes::Aes256>;

/// Bytes a sealed chunk adds around its ciphertext.
pub const CHUNK_OVERHEAD: usize = IV_SIZE + MAC_SIZE;

pub fn random_iv() -> [u8; IV_SIZE] {
    let mut iv = [0u8; IV_SIZE];
    rand::rng().fill_bytes(&mut iv);
    iv
}

/// Length of `len` bytes after PKCS#7 padding (always adds at least one byte).
pub fn padded_len(len: u64) -> u64 {
    (len / AES_BLOCK_SIZE as u64 + 1) * AES_BLOCK_SIZE as u64
}

/// Stored size of a sealed chunk holding `plaintext_len` bytes.
pub fn sealed_len(plaintext_len: u64) -> u64 {
    IV_SIZE as u64 + padded_len(plaintext_len) + MAC_SIZE as u64
}

/// Largest plaintext whose sealed form fits in `chunk_size` bytes.
///
/// Equal to `chunk_size - 49` for 16-aligned chunk sizes.
pub fn per_chunk_plaintext_size(chunk_size: u64) -> u64 {
    let room = chunk_size.saturating_sub(CHUNK_OVERHEAD as u64);
    (room / AES_BLOCK_SIZE as u64 * AES_BLOCK_SIZE as u64).saturating_sub(1)
}

/// Encrypts with AES-256-CBC. With `pad` unset the plaintext must be block
/// aligned.
pub fn encrypt(
    key: &[u8; KEY_SIZE],
    iv: &[u8; IV_SIZE],
    plaintext: &[u8],
    pad: bool,
) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256CbcEnc::new(key.into(), iv.into());
    if pad {
        Ok(cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext))
    } else if plaintext.len() % AES_BLOCK_SIZE != 0 {
        Err(CryptoError::UnalignedPlaintext {
            len: plaintext.len(),
        })
    } else {
        Ok(cipher.encrypt_padded_vec_mut::<NoPadding>(plaintext))
    }
}

/// Decrypts AES-256-CBC, stripping PKCS#7 padding when `unpad` is set.
pub fn decrypt(
    key: &[u8; KEY_SIZE],
    iv: &[u8; IV_SIZE],
    ciphertext: &[u8],
    unpad: bool,
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() % AES_BLOCK_SIZE != 0 || (unpad && ciphertext.is_empty()) {
        return Err(CryptoError::InvalidCiphertextLength {
            len: ciphertext.len(),
        });
    }
    let cipher = Aes256CbcDec::new(key.into(), iv.into());
    if unpad {
        cipher
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| CryptoError::Padding)
    } else {
        cipher
            .decrypt_padded_vec_mut::<NoPadding>(ciphertext)
            .map_err(|_| CryptoError::Padding)
    }
}

/// Last ciphertext block, which chains into the next full-object chunk.
pub fn next_iv(ciphertext: &[u8]) -> Option<[u8; IV_SIZE]> {
    let start = ciphertext.len().checked_sub(IV_SIZE)?;
    ciphertext[start..].try_into().ok()
}

/// Encrypts one chunk into the self-contained per-chunk format.
pub fn seal_chunk(keys: &ObjectKeys, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let iv = random_iv();
    let ciphertext = keys.with_content_key(|key| encrypt(key, &iv, plaintext, true))?;

    let mut ctx = hmac::Context::with_key(&keys.hmac_key());
    ctx.update(&iv);
    ctx.update(&ciphertext);
    let tag = ctx.sign();

    let mut sealed = Vec::with_capacity(IV_SIZE + ciphertext.len() + MAC_SIZE);
    sealed.extend_from_slice(&iv);
    sealed.extend_from_slice(&ciphertext);
    sealed.extend_from_slice(tag.as_ref());
    trace!(plaintext_len = plaintext.len(), sealed_len = sealed.len(), "Sealed chunk");
    Ok(sealed)
}

/// Verifies and decrypts one per-chunk sealed chunk.
///
/// The MAC is checked before any decryption takes place.
pub fn open_chunk(keys: &ObjectKeys, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
    if sealed.len() < IV_SIZE + AES_BLOCK_SIZE + MAC_SIZE {
        return Err(CryptoError::ChunkTooShort { len: sealed.len() });
    }
    let (authenticated, tag) = sealed.split_at(sealed.len() - MAC_SIZE);
    hmac::verify(&keys.hmac_key(), authenticated, tag).map_err(|_| CryptoError::MacMismatch)?;

    let (iv, ciphertext) = authenticated.split_at(IV_SIZE);
    let iv: [u8; IV_SIZE] = iv
        .try_into()
        .map_err(|_| CryptoError::ChunkTooShort { len: sealed.len() })?;
    keys.with_content_key(|key| decrypt(key, &iv, ciphertext, true))
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_per_chunk_sizes() {
        assert_eq!(per_chunk_plaintext_size(64), 15);
        assert_eq!(sealed_len(15), 64);
        assert_eq!(per_chunk_plaintext_size(4 * 1024 * 1024), 4 * 1024 * 1024 - 49);
        // Unaligned chunk sizes round down to the block boundary.
        assert_eq!(per_chunk_plaintext_size(100), 47);
        assert!(sealed_len(47) <= 100);
        assert_eq!(per_chunk_plaintext_size(10), 0);
    }

    #[test]
    fn test_padded_len() {
        assert_eq!(padded_len(0), 16);
        assert_eq!(padded_len(15), 16);
        assert_eq!(padded_len(16), 32);
    }

    #[test]
    fn test_unpadded_requires_alignment() {
        let key = [1u8; KEY_SIZE];
        let iv = [2u8; IV_SIZE];
        assert!(matches!(
            encrypt(&key, &iv, &[0; 15], false),
            Err(CryptoError::UnalignedPlaintext { len: 15 })
        ));
        let ct = encrypt(&key, &iv, &[0; 32], false).unwrap();
        assert_eq!(ct.len(), 32);
        assert_eq!(decrypt(&key, &iv, &ct, false).unwrap(), vec![0; 32]);
    }

    #[test]
    fn test_chained_stream_matches_single_pass() {
        let key = [7u8; KEY_SIZE];
        let iv = random_iv();
        let data: Vec<u8> = (0..100u8).collect();
        let whole = encrypt(&key, &iv, &data, true).unwrap();

        let first = encrypt(&key, &iv, &data[..48], false).unwrap();
        let chained_iv = next_iv(&first).unwrap();
        let second = encrypt(&key, &chained_iv, &data[48..], true).unwrap();
        assert_eq!([first, second].concat(), whole);
    }

    #[test]
    fn test_sealed_chunk_tamper_detected() {
        let keys = ObjectKeys::generate();
        let mut sealed = seal_chunk(&keys, b"attack at dawn").unwrap();
        assert_eq!(sealed.len() as u64, sealed_len(14));
        assert_eq!(open_chunk(&keys, &sealed).unwrap(), b"attack at dawn");

        sealed[IV_SIZE + 3] ^= 0x01;
        assert!(matches!(open_chunk(&keys, &sealed), Err(CryptoError::MacMismatch)));
    }

    #[test]
    fn test_open_chunk_wrong_key() {
        let sealed = seal_chunk(&ObjectKeys::generate(), b"data").unwrap();
        assert!(matches!(
            open_chunk(&ObjectKeys::generate(), &sealed),
            Err(CryptoError::MacMismatch)
        ));
        assert!(matches!(
            open_chunk(&ObjectKeys::generate(), &sealed[..40]),
            Err(CryptoError::ChunkTooShort { len: 40 })
        ));
    }

    #[test]
    fn test_empty_plaintext_seals_one_block() {
        let keys = ObjectKeys::generate();
        let sealed = seal_chunk(&keys, &[]).unwrap();
        assert_eq!(sealed.len(), IV_SIZE + AES_BLOCK_SIZE + MAC_SIZE);
        assert!(open_chunk(&keys, &sealed).unwrap().is_empty());
    }

    proptest! {
        #[test]
        fn prop_seal_open_roundtrip(data in proptest::collection::vec(any::<u8>(), 0..600)) {
            let keys = ObjectKeys::generate();
            let sealed = seal_chunk(&keys, &data).unwrap();
            prop_assert_eq!(sealed.len() as u64, sealed_len(data.len() as u64));
            prop_assert_eq!(open_chunk(&keys, &sealed).unwrap(), data);
        }
    }
}
