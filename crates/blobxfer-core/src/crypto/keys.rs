//! Per-object symmetric keys and the RSA key material that wraps them.

use std::{fmt, fs, path::Path};

use rand::RngCore;
use rand_core::OsRng;
use ring::hmac;
use rsa::{
    Oaep, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey,
    pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey},
    pkcs8::{DecodePrivateKey, DecodePublicKey},
};
use sha1::Sha1;
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};
use zeroize::Zeroizing;

use super::{CryptoError, KEY_SIZE};
use crate::config::{ConfigError, TransferConfig};

/// Symmetric keys for one object: the AES-256 content key and the
/// HMAC-SHA256 signing key.
///
/// Generated fresh for every upload and recovered by RSA-OAEP unwrapping on
/// download. Both keys are zeroed on drop and never printed.
#[derive(Clone)]
pub struct ObjectKeys {
    content_key: Zeroizing<[u8; KEY_SIZE]>,
    signing_key: Zeroizing<[u8; KEY_SIZE]>,
}

impl fmt::Debug for ObjectKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectKeys")
            .field("content_key", &"[REDACTED]")
            .field("signing_key", &"[REDACTED]")
            .finish()
    }
}

impl ObjectKeys {
    pub fn generate() -> Self {
        let mut content_key = Zeroizing::new([0u8; KEY_SIZE]);
        let mut signing_key = Zeroizing::new([0u8; KEY_SIZE]);
        let mut rng = rand::rng();
        rng.fill_bytes(&mut content_key[..]);
        rng.fill_bytes(&mut signing_key[..]);
        Self {
            content_key,
            signing_key,
        }
    }

    pub fn from_slices(content_key: &[u8], signing_key: &[u8]) -> Result<Self, CryptoError> {
        Ok(Self {
            content_key: Zeroizing::new(to_key(content_key)?),
            signing_key: Zeroizing::new(to_key(signing_key)?),
        })
    }

    /// Runs `f` with the raw AES content key.
    pub fn with_content_key<F, R>(&self, f: F) -> R
    where
        F: FnOnce(&[u8; KEY_SIZE]) -> R,
    {
        f(&self.content_key)
    }

    /// HMAC-SHA256 key for chunk MACs and metadata authentication.
    pub fn hmac_key(&self) -> hmac::Key {
        hmac::Key::new(hmac::HMAC_SHA256, &self.signing_key[..])
    }
}

fn to_key(bytes: &[u8]) -> Result<[u8; KEY_SIZE], CryptoError> {
    bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKeyLength {
            expected: KEY_SIZE,
            actual: bytes.len(),
        })
}

/// RSA-OAEP wrapped [`ObjectKeys`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrappedKeys {
    pub encrypted_key: Vec<u8>,
    pub encrypted_signing_key: Vec<u8>,
}

/// RSA keys used to wrap, unwrap and sign per-object keys.
///
/// Uploads need the public key; downloads need the private key. A private
/// key alone is enough for both, since the public half is derived from it.
#[derive(Clone, Default)]
pub struct KeyMaterial {
    public: Option<RsaPublicKey>,
    private: Option<RsaPrivateKey>,
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyMaterial")
            .field("public", &self.public.is_some())
            .field("private", &self.private.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl KeyMaterial {
    pub fn from_private_key(private: RsaPrivateKey) -> Self {
        Self {
            public: Some(RsaPublicKey::from(&private)),
            private: Some(private),
        }
    }

    pub fn from_public_key(public: RsaPublicKey) -> Self {
        Self {
            public: Some(public),
            private: None,
        }
    }

    /// Parses PEM keys in PKCS#8 or PKCS#1 form.
    pub fn from_pem(public_pem: Option<&str>, private_pem: Option<&str>) -> Result<Self, String> {
        let private = private_pem
            .map(|pem| {
                RsaPrivateKey::from_pkcs8_pem(pem)
                    .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
                    .map_err(|e| format!("invalid private key: {e}"))
            })
            .transpose()?;
        let public = match public_pem {
            Some(pem) => Some(
                RsaPublicKey::from_public_key_pem(pem)
                    .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
                    .map_err(|e| format!("invalid public key: {e}"))?,
            ),
            None => private.as_ref().map(RsaPublicKey::from),
        };
        Ok(Self { public, private })
    }

    /// Loads the PEM files named in the configuration.
    ///
    /// Returns `None` when no key paths are configured.
    pub fn from_config(config: &TransferConfig) -> Result<Option<Self>, ConfigError> {
        if config.rsa_public_key.is_none() && config.rsa_private_key.is_none() {
            return Ok(None);
        }
        let public = config.rsa_public_key.as_deref().map(read_pem).transpose()?;
        let private = config
            .rsa_private_key
            .as_deref()
            .map(|path| read_pem(path).map(Zeroizing::new))
            .transpose()?;

        let key_path = config
            .rsa_private_key
            .as_ref()
            .or(config.rsa_public_key.as_ref())
            .cloned()
            .unwrap_or_default();
        Self::from_pem(public.as_deref(), private.as_ref().map(|p| p.as_str()))
            .map(Some)
            .map_err(|reason| ConfigError::KeyLoad {
                path: key_path,
                reason,
            })
    }

    pub fn can_wrap(&self) -> bool {
        self.public.is_some()
    }

    pub fn can_unwrap(&self) -> bool {
        self.private.is_some()
    }

    /// RSA-OAEP (SHA-1) wraps both object keys with the public key.
    #[instrument(level = "debug", skip_all)]
    pub fn wrap(&self, keys: &ObjectKeys) -> Result<WrappedKeys, CryptoError> {
        let public = self.public.as_ref().ok_or(CryptoError::MissingKey("public"))?;
        let mut rng = OsRng;
        let encrypted_key = keys.with_content_key(|key| {
            public
                .encrypt(&mut rng, Oaep::new::<Sha1>(), &key[..])
                .map_err(|e| CryptoError::KeyWrap(e.to_string()))
        })?;
        let encrypted_signing_key = public
            .encrypt(&mut rng, Oaep::new::<Sha1>(), &keys.signing_key[..])
            .map_err(|e| CryptoError::KeyWrap(e.to_string()))?;
        debug!("Wrapped object keys");
        Ok(WrappedKeys {
            encrypted_key,
            encrypted_signing_key,
        })
    }

    /// Recovers object keys with the private key.
    #[instrument(level = "debug", skip_all)]
    pub fn unwrap(&self, wrapped: &WrappedKeys) -> Result<ObjectKeys, CryptoError> {
        let private = self
            .private
            .as_ref()
            .ok_or(CryptoError::MissingKey("private"))?;
        let content_key = Zeroizing::new(
            private
                .decrypt(Oaep::new::<Sha1>(), &wrapped.encrypted_key)
                .map_err(|e| CryptoError::KeyUnwrap(e.to_string()))?,
        );
        let signing_key = Zeroizing::new(
            private
                .decrypt(Oaep::new::<Sha1>(), &wrapped.encrypted_signing_key)
                .map_err(|e| CryptoError::KeyUnwrap(e.to_string()))?,
        );
        ObjectKeys::from_slices(&content_key, &signing_key)
    }

    /// Signs `data` (RSASSA-PKCS1-v1_5 over SHA-256) when a private key is
    /// available.
    pub fn sign(&self, data: &[u8]) -> Result<Option<Vec<u8>>, CryptoError> {
        let Some(private) = self.private.as_ref() else {
            return Ok(None);
        };
        let digest = Sha256::digest(data);
        private
            .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
            .map(Some)
            .map_err(|e| CryptoError::Signing(e.to_string()))
    }

    pub fn verify(&self, data: &[u8], signature: &[u8]) -> Result<(), CryptoError> {
        let public = self.public.as_ref().ok_or(CryptoError::MissingKey("public"))?;
        let digest = Sha256::digest(data);
        public
            .verify(Pkcs1v15Sign::new::<Sha256>(), &digest, signature)
            .map_err(|_| CryptoError::SignatureMismatch)
    }
}

fn read_pem(path: &Path) -> Result<String, ConfigError> {
    fs::read_to_string(path).map_err(|e| ConfigError::KeyLoad {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}
