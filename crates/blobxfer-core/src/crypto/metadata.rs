//! Encryption metadata stored alongside encrypted objects.
//!
//! Two metadata entries are written when an encrypted object is committed:
//!
//! - `encryptiondata`: the JSON [`EncryptionMetadataDocument`] with the
//!   wrapped keys, cipher identifiers, chunk layout and (for full-object
//!   mode) the IV and stream MAC
//! - `encryptiondata_authentication`: an HMAC-SHA256 over the exact bytes of
//!   the first entry, keyed with the object's signing key
//!
//! On download nothing in the document is trusted until the wrapped keys
//! have been unwrapped, the optional key signature checked and the
//! authentication entry verified.

use std::collections::{BTreeMap, HashMap};

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use ring::hmac;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use super::{
    CryptoError, IV_SIZE, MAC_SIZE,
    cipher::{random_iv, sealed_len},
    keys::{KeyMaterial, ObjectKeys, WrappedKeys},
};
use crate::config::EncryptionMode;

/// Metadata key of the encryption document.
pub const METADATA_KEY: &str = "encryptiondata";
/// Metadata key of the document's authentication wrapper.
pub const AUTHENTICATION_METADATA_KEY: &str = "encryptiondata_authentication";

pub const PROTOCOL_VERSION: &str = "1.0";
pub const CONTENT_ALGORITHM: &str = "AES_CBC_256";
pub const KEY_WRAP_ALGORITHM: &str = "RSA-OAEP";
pub const MAC_ALGORITHM: &str = "HMAC-SHA256";
pub const KEY_ID: &str = "private:pem";
pub const FULL_BLOB: &str = "FullBlob";
pub const CHUNKED_BLOB: &str = "ChunkedBlob";

const AUTHENTICATION_ENCODING: &str = "UTF-8";

#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("malformed encryption metadata JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("encryption metadata is missing {0}")]
    MissingField(&'static str),

    #[error("field {field} is not valid base64: {source}")]
    InvalidEncoding {
        field: &'static str,
        #[source]
        source: base64::DecodeError,
    },

    #[error("unsupported encryption protocol version '{0}'")]
    UnsupportedProtocol(String),

    #[error("unsupported {field} '{value}'")]
    UnsupportedAlgorithm { field: &'static str, value: String },

    #[error("unsupported encryption mode '{0}'")]
    UnsupportedMode(String),

    #[error("invalid field {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    /// **[INTEGRITY VIOLATION]** The authentication wrapper does not match
    /// the document.
    #[error("[INTEGRITY VIOLATION] encryption metadata authentication failed")]
    AuthenticationFailed,

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct WrappedContentKey {
    pub key_id: String,
    pub encrypted_key: String,
    pub encrypted_authentication_key: String,
    pub algorithm: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_signature: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EncryptionAgent {
    pub protocol: String,
    pub encryption_algorithm: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EncryptionAuthentication {
    pub algorithm: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_authentication_code: Option<String>,
}

/// Plaintext and stored sizes of one chunk.
///
/// For per-chunk objects the stored size is the stride between sealed
/// chunks; for full-object objects both are the upload chunk size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ChunkLayout {
    pub plaintext_chunk_size_bytes: u64,
    pub encrypted_chunk_size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BlobxferExtensions {
    #[serde(
        rename = "PreEncryptedContentMD5",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub pre_encrypted_content_md5: Option<String>,
}

/// The `encryptiondata` JSON document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EncryptionMetadataDocument {
    pub encryption_mode: String,
    pub wrapped_content_key: WrappedContentKey,
    pub encryption_agent: EncryptionAgent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_authentication: Option<EncryptionAuthentication>,
    #[serde(
        rename = "ContentEncryptionIV",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub content_encryption_iv: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_layout: Option<ChunkLayout>,
    #[serde(default)]
    pub key_wrapping_metadata: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blobxfer_extensions: Option<BlobxferExtensions>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct MetadataAuthentication {
    algorithm: String,
    encoding: String,
    message_authentication_code: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AuthenticationWrapper {
    encryption_metadata_authentication: MetadataAuthentication,
}

pub fn mode_identifier(mode: EncryptionMode) -> Option<&'static str> {
    match mode {
        EncryptionMode::None => None,
        EncryptionMode::PerChunk => Some(CHUNKED_BLOB),
        EncryptionMode::FullObject => Some(FULL_BLOB),
    }
}

fn parse_mode(identifier: &str) -> Result<EncryptionMode, MetadataError> {
    match identifier {
        FULL_BLOB => Ok(EncryptionMode::FullObject),
        CHUNKED_BLOB => Ok(EncryptionMode::PerChunk),
        other => Err(MetadataError::UnsupportedMode(other.to_string())),
    }
}

fn decode(field: &'static str, value: &str) -> Result<Vec<u8>, MetadataError> {
    BASE64
        .decode(value)
        .map_err(|source| MetadataError::InvalidEncoding { field, source })
}

fn expect_identifier(
    field: &'static str,
    value: &str,
    expected: &str,
) -> Result<(), MetadataError> {
    if value == expected {
        Ok(())
    } else {
        Err(MetadataError::UnsupportedAlgorithm {
            field,
            value: value.to_string(),
        })
    }
}

/// Everything needed to encrypt or decrypt one object.
#[derive(Debug, Clone)]
pub struct EncryptionParams {
    pub mode: EncryptionMode,
    pub keys: ObjectKeys,
    /// Initial IV of a full-object stream.
    pub iv: Option<[u8; IV_SIZE]>,
    pub layout: ChunkLayout,
    /// Wrapped keys to persist (uploads).
    pub wrapped: Option<WrappedKeys>,
    pub key_signature: Option<Vec<u8>>,
    /// Stored stream MAC to check against (full-object downloads).
    pub expected_mac: Option<Vec<u8>>,
    /// MD5 of the plaintext recorded at upload time (downloads).
    pub pre_encrypted_md5: Option<String>,
}

impl EncryptionParams {
    /// Generates fresh keys, wraps them and, for full-object mode, picks the
    /// initial IV.
    #[instrument(level = "debug", skip(material))]
    pub fn for_upload(
        mode: EncryptionMode,
        layout: ChunkLayout,
        material: &KeyMaterial,
    ) -> Result<Self, CryptoError> {
        let keys = ObjectKeys::generate();
        let wrapped = material.wrap(&keys)?;
        let key_signature = material.sign(&wrapped.encrypted_key)?;
        let iv = matches!(mode, EncryptionMode::FullObject).then(random_iv);
        Ok(Self {
            mode,
            keys,
            iv,
            layout,
            wrapped: Some(wrapped),
            key_signature,
            expected_mac: None,
            pre_encrypted_md5: None,
        })
    }

    /// Builds the two metadata entries for a committed upload.
    pub fn to_metadata(
        &self,
        mac: Option<&[u8]>,
        pre_encrypted_md5: Option<&str>,
    ) -> Result<HashMap<String, String>, MetadataError> {
        let wrapped = self
            .wrapped
            .as_ref()
            .ok_or(MetadataError::MissingField("WrappedContentKey"))?;
        let encryption_mode = mode_identifier(self.mode)
            .ok_or_else(|| MetadataError::UnsupportedMode(self.mode.to_string()))?;

        let document = EncryptionMetadataDocument {
            encryption_mode: encryption_mode.to_string(),
            wrapped_content_key: WrappedContentKey {
                key_id: KEY_ID.to_string(),
                encrypted_key: BASE64.encode(&wrapped.encrypted_key),
                encrypted_authentication_key: BASE64.encode(&wrapped.encrypted_signing_key),
                algorithm: KEY_WRAP_ALGORITHM.to_string(),
                key_signature: self.key_signature.as_ref().map(|s| BASE64.encode(s)),
            },
            encryption_agent: EncryptionAgent {
                protocol: PROTOCOL_VERSION.to_string(),
                encryption_algorithm: CONTENT_ALGORITHM.to_string(),
            },
            encryption_authentication: Some(EncryptionAuthentication {
                algorithm: MAC_ALGORITHM.to_string(),
                message_authentication_code: mac.map(|m| BASE64.encode(m)),
            }),
            content_encryption_iv: self.iv.map(|iv| BASE64.encode(iv)),
            chunk_layout: Some(self.layout),
            key_wrapping_metadata: BTreeMap::from([(
                "EncryptionLibrary".to_string(),
                concat!("blobxfer-core/", env!("CARGO_PKG_VERSION")).to_string(),
            )]),
            blobxfer_extensions: pre_encrypted_md5.map(|md5| BlobxferExtensions {
                pre_encrypted_content_md5: Some(md5.to_string()),
            }),
        };

        let json = serde_json::to_string(&document)?;
        let tag = hmac::sign(&self.keys.hmac_key(), json.as_bytes());
        let wrapper = AuthenticationWrapper {
            encryption_metadata_authentication: MetadataAuthentication {
                algorithm: MAC_ALGORITHM.to_string(),
                encoding: AUTHENTICATION_ENCODING.to_string(),
                message_authentication_code: BASE64.encode(tag.as_ref()),
            },
        };

        Ok(HashMap::from([
            (AUTHENTICATION_METADATA_KEY.to_string(), serde_json::to_string(&wrapper)?),
            (METADATA_KEY.to_string(), json),
        ]))
    }

    /// Parses and authenticates the encryption metadata of a stored object.
    ///
    /// Returns `None` for objects without an encryption document. Checks run
    /// in a fixed order: key unwrap, key signature, metadata authentication,
    /// then cipher identifiers and layout.
    #[instrument(level = "debug", skip_all)]
    pub fn from_metadata(
        metadata: &HashMap<String, String>,
        material: &KeyMaterial,
    ) -> Result<Option<Self>, MetadataError> {
        let Some(raw) = metadata.get(METADATA_KEY) else {
            return Ok(None);
        };
        let document: EncryptionMetadataDocument = serde_json::from_str(raw)?;
        let wrapped_key = &document.wrapped_content_key;

        let wrapped = WrappedKeys {
            encrypted_key: decode("EncryptedKey", &wrapped_key.encrypted_key)?,
            encrypted_signing_key: decode(
                "EncryptedAuthenticationKey",
                &wrapped_key.encrypted_authentication_key,
            )?,
        };
        let keys = material.unwrap(&wrapped)?;

        let key_signature = wrapped_key
            .key_signature
            .as_deref()
            .map(|sig| decode("KeySignature", sig))
            .transpose()?;
        if let Some(signature) = &key_signature {
            material.verify(&wrapped.encrypted_key, signature)?;
        }

        match metadata.get(AUTHENTICATION_METADATA_KEY) {
            Some(auth) => verify_authentication(auth, raw, &keys)?,
            None => debug!("Encryption metadata has no authentication wrapper"),
        }

        if document.encryption_agent.protocol != PROTOCOL_VERSION {
            return Err(MetadataError::UnsupportedProtocol(
                document.encryption_agent.protocol.clone(),
            ));
        }
        expect_identifier(
            "EncryptionAlgorithm",
            &document.encryption_agent.encryption_algorithm,
            CONTENT_ALGORITHM,
        )?;
        expect_identifier("key wrapping algorithm", &wrapped_key.algorithm, KEY_WRAP_ALGORITHM)?;
        if let Some(auth) = &document.encryption_authentication {
            expect_identifier("authentication algorithm", &auth.algorithm, MAC_ALGORITHM)?;
        }
        let mode = parse_mode(&document.encryption_mode)?;

        let layout = document
            .chunk_layout
            .ok_or(MetadataError::MissingField("ChunkLayout"))?;
        let (iv, expected_mac) = match mode {
            EncryptionMode::FullObject => {
                let iv = document
                    .content_encryption_iv
                    .as_deref()
                    .ok_or(MetadataError::MissingField("ContentEncryptionIV"))?;
                let iv: [u8; IV_SIZE] = decode("ContentEncryptionIV", iv)?
                    .try_into()
                    .map_err(|_| MetadataError::InvalidField {
                        field: "ContentEncryptionIV",
                        reason: format!("expected {IV_SIZE} bytes"),
                    })?;
                let mac = document
                    .encryption_authentication
                    .as_ref()
                    .and_then(|a| a.message_authentication_code.as_deref())
                    .ok_or(MetadataError::MissingField("MessageAuthenticationCode"))?;
                let mac = decode("MessageAuthenticationCode", mac)?;
                if mac.len() != MAC_SIZE {
                    return Err(MetadataError::InvalidField {
                        field: "MessageAuthenticationCode",
                        reason: format!("expected {MAC_SIZE} bytes, got {}", mac.len()),
                    });
                }
                (Some(iv), Some(mac))
            }
            _ => {
                if layout.plaintext_chunk_size_bytes == 0
                    || layout.encrypted_chunk_size_bytes
                        != sealed_len(layout.plaintext_chunk_size_bytes)
                {
                    return Err(MetadataError::InvalidField {
                        field: "ChunkLayout",
                        reason: format!(
                            "stored chunk size {} does not fit plaintext chunk size {}",
                            layout.encrypted_chunk_size_bytes, layout.plaintext_chunk_size_bytes
                        ),
                    });
                }
                (None, None)
            }
        };

        Ok(Some(Self {
            mode,
            keys,
            iv,
            layout,
            wrapped: Some(wrapped),
            key_signature,
            expected_mac,
            pre_encrypted_md5: document
                .blobxfer_extensions
                .and_then(|ext| ext.pre_encrypted_content_md5),
        }))
    }
}

fn verify_authentication(
    wrapper_json: &str,
    document_json: &str,
    keys: &ObjectKeys,
) -> Result<(), MetadataError> {
    let wrapper: AuthenticationWrapper = serde_json::from_str(wrapper_json)?;
    let auth = wrapper.encryption_metadata_authentication;
    expect_identifier("metadata authentication algorithm", &auth.algorithm, MAC_ALGORITHM)?;
    let tag = decode("MessageAuthenticationCode", &auth.message_authentication_code)?;
    hmac::verify(&keys.hmac_key(), document_json.as_bytes(), &tag).map_err(|_| {
        warn!("Encryption metadata authentication failed");
        MetadataError::AuthenticationFailed
    })
}

/// Reads `PreEncryptedContentMD5` without authenticating the document.
///
/// Used only to decide whether an upload can be skipped.
pub fn peek_pre_encrypted_md5(metadata: &HashMap<String, String>) -> Option<String> {
    let raw = metadata.get(METADATA_KEY)?;
    let document: EncryptionMetadataDocument = serde_json::from_str(raw).ok()?;
    document.blobxfer_extensions?.pre_encrypted_content_md5
}

#[cfg(test)]
mod tests {
    use serde_json::Value;

    use super::*;
    use crate::crypto::keys::test_keys;

    fn material() -> KeyMaterial {
        KeyMaterial::from_private_key(test_keys::private_key())
    }

    fn layout() -> ChunkLayout {
        ChunkLayout {
            plaintext_chunk_size_bytes: 15,
            encrypted_chunk_size_bytes: 64,
        }
    }

    fn full_object_metadata(material: &KeyMaterial) -> (EncryptionParams, HashMap<String, String>) {
        let params = EncryptionParams::for_upload(
            EncryptionMode::FullObject,
            ChunkLayout {
                plaintext_chunk_size_bytes: 32,
                encrypted_chunk_size_bytes: 32,
            },
            material,
        )
        .unwrap();
        let map = params.to_metadata(Some(&[9u8; MAC_SIZE]), Some("md5==")).unwrap();
        (params, map)
    }

    fn edit_document(map: &mut HashMap<String, String>, edit: impl FnOnce(&mut Value)) {
        let mut value: Value = serde_json::from_str(&map[METADATA_KEY]).unwrap();
        edit(&mut value);
        map.insert(METADATA_KEY.to_string(), value.to_string());
    }

    #[test]
    fn test_document_field_names() {
        let material = material();
        let (_, map) = full_object_metadata(&material);
        let value: Value = serde_json::from_str(&map[METADATA_KEY]).unwrap();
        assert_eq!(value["EncryptionMode"], "FullBlob");
        assert_eq!(value["WrappedContentKey"]["Algorithm"], "RSA-OAEP");
        assert_eq!(value["WrappedContentKey"]["KeyId"], "private:pem");
        assert!(value["WrappedContentKey"]["KeySignature"].is_string());
        assert_eq!(value["EncryptionAgent"]["Protocol"], "1.0");
        assert_eq!(value["EncryptionAgent"]["EncryptionAlgorithm"], "AES_CBC_256");
        assert_eq!(value["EncryptionAuthentication"]["Algorithm"], "HMAC-SHA256");
        assert!(value["ContentEncryptionIV"].is_string());
        assert_eq!(value["ChunkLayout"]["PlaintextChunkSizeBytes"], 32);
        assert_eq!(value["BlobxferExtensions"]["PreEncryptedContentMD5"], "md5==");

        let auth: Value = serde_json::from_str(&map[AUTHENTICATION_METADATA_KEY]).unwrap();
        assert_eq!(auth["EncryptionMetadataAuthentication"]["Encoding"], "UTF-8");
    }

    #[test]
    fn test_roundtrip_full_object() {
        let material = material();
        let (params, map) = full_object_metadata(&material);
        let parsed = EncryptionParams::from_metadata(&map, &material).unwrap().unwrap();
        assert_eq!(parsed.mode, EncryptionMode::FullObject);
        assert_eq!(parsed.iv, params.iv);
        assert_eq!(parsed.expected_mac.as_deref(), Some(&[9u8; MAC_SIZE][..]));
        assert_eq!(parsed.pre_encrypted_md5.as_deref(), Some("md5=="));
        assert_eq!(peek_pre_encrypted_md5(&map).as_deref(), Some("md5=="));
    }

    #[test]
    fn test_roundtrip_per_chunk() {
        let material = material();
        let params =
            EncryptionParams::for_upload(EncryptionMode::PerChunk, layout(), &material).unwrap();
        assert!(params.iv.is_none());
        let map = params.to_metadata(None, None).unwrap();
        let parsed = EncryptionParams::from_metadata(&map, &material).unwrap().unwrap();
        assert_eq!(parsed.mode, EncryptionMode::PerChunk);
        assert_eq!(parsed.layout, layout());
        assert!(parsed.expected_mac.is_none());
    }

    #[test]
    fn test_unencrypted_object_has_no_params() {
        assert!(
            EncryptionParams::from_metadata(&HashMap::new(), &material())
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn test_tampered_document_fails_authentication() {
        let material = material();
        let (_, mut map) = full_object_metadata(&material);
        edit_document(&mut map, |v| v["EncryptionAgent"]["Protocol"] = "2.0".into());
        assert!(matches!(
            EncryptionParams::from_metadata(&map, &material),
            Err(MetadataError::AuthenticationFailed)
        ));
    }

    #[test]
    fn test_wrong_protocol_without_authentication() {
        let material = material();
        let (_, mut map) = full_object_metadata(&material);
        map.remove(AUTHENTICATION_METADATA_KEY);
        edit_document(&mut map, |v| v["EncryptionAgent"]["Protocol"] = "2.0".into());
        assert!(matches!(
            EncryptionParams::from_metadata(&map, &material),
            Err(MetadataError::UnsupportedProtocol(p)) if p == "2.0"
        ));
    }

    #[test]
    fn test_unknown_algorithm_rejected() {
        let material = material();
        let (_, mut map) = full_object_metadata(&material);
        map.remove(AUTHENTICATION_METADATA_KEY);
        edit_document(&mut map, |v| {
            v["EncryptionAgent"]["EncryptionAlgorithm"] = "AES_CTR_128".into();
        });
        assert!(matches!(
            EncryptionParams::from_metadata(&map, &material),
            Err(MetadataError::UnsupportedAlgorithm { .. })
        ));
    }

    #[test]
    fn test_truncated_wrapped_key_rejected() {
        let material = material();
        let (_, mut map) = full_object_metadata(&material);
        edit_document(&mut map, |v| {
            let key = v["WrappedContentKey"]["EncryptedKey"].as_str().unwrap().to_string();
            v["WrappedContentKey"]["EncryptedKey"] = key[..key.len() / 2].to_string().into();
        });
        let err = EncryptionParams::from_metadata(&map, &material).unwrap_err();
        assert!(matches!(
            err,
            MetadataError::Crypto(CryptoError::KeyUnwrap(_)) | MetadataError::InvalidEncoding { .. }
        ));
    }

    #[test]
    fn test_swapped_signature_rejected() {
        let material = material();
        let (_, mut map) = full_object_metadata(&material);
        let (_, other) = full_object_metadata(&material);
        let other: Value = serde_json::from_str(&other[METADATA_KEY]).unwrap();
        edit_document(&mut map, |v| {
            v["WrappedContentKey"]["KeySignature"] = other["WrappedContentKey"]["KeySignature"].clone();
        });
        assert!(matches!(
            EncryptionParams::from_metadata(&map, &material),
            Err(MetadataError::Crypto(CryptoError::SignatureMismatch))
        ));
    }

    #[test]
    fn test_bad_chunk_layout_rejected() {
        let material = material();
        let params =
            EncryptionParams::for_upload(EncryptionMode::PerChunk, layout(), &material).unwrap();
        let mut map = params.to_metadata(None, None).unwrap();
        map.remove(AUTHENTICATION_METADATA_KEY);
        edit_document(&mut map, |v| v["ChunkLayout"]["EncryptedChunkSizeBytes"] = 63.into());
        assert!(matches!(
            EncryptionParams::from_metadata(&map, &material),
            Err(MetadataError::InvalidField { field: "ChunkLayout", .. })
        ));
    }
}
