//! Transfer configuration.
//!
//! A [`TransferConfig`] is built once per run (from code or from a JSON
//! document) and shared read-only by the planner, the workers and the
//! finalizer.

use std::{
    fmt, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::{AES_BLOCK_SIZE, IV_SIZE, MAC_SIZE};

/// Default number of transfer worker threads.
pub const DEFAULT_WORKERS: usize = 64;

/// Default chunk size: 4 MiB.
pub const DEFAULT_CHUNK_SIZE_BYTES: u64 = 4 * 1024 * 1024;

/// Largest chunk a single put-block / put-page call accepts.
pub const MAX_CHUNK_SIZE_BYTES: u64 = 100 * 1024 * 1024;

/// Maximum number of committed blocks in one block blob.
pub const MAX_BLOCKS_PER_BLOB: u64 = 50_000;

/// Page blob write granularity.
pub const PAGE_SIZE_BYTES: u64 = 512;

/// Maximum size of a page blob (1 TiB).
pub const MAX_PAGE_BLOB_SIZE_BYTES: u64 = 1024 * 1024 * 1024 * 1024;

/// Suffix of in-progress download files.
pub const TEMP_FILE_SUFFIX: &str = ".blobtmp";

/// Remote name meaning "every blob in the container".
pub const CONTAINER_WILDCARD: &str = ".";

/// Smallest chunk size usable with per-chunk encryption (one padded block
/// of payload plus IV and MAC).
pub const MIN_PER_CHUNK_SIZE_BYTES: u64 = (IV_SIZE + AES_BLOCK_SIZE + MAC_SIZE) as u64;

/// Remote object kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlobType {
    /// Committed through an ordered block list.
    #[default]
    Block,
    /// Written in 512-byte aligned pages.
    Page,
}

impl fmt::Display for BlobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlobType::Block => write!(f, "block"),
            BlobType::Page => write!(f, "page"),
        }
    }
}

/// How uploaded content is encrypted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EncryptionMode {
    /// Content is stored as-is.
    #[default]
    None,
    /// Every chunk is sealed independently (`IV || ciphertext || MAC`).
    PerChunk,
    /// One CBC stream over the whole object; chunks are chained by IV.
    FullObject,
}

impl EncryptionMode {
    pub fn is_encrypted(self) -> bool {
        !matches!(self, EncryptionMode::None)
    }
}

impl fmt::Display for EncryptionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncryptionMode::None => write!(f, "none"),
            EncryptionMode::PerChunk => write!(f, "per-chunk"),
            EncryptionMode::FullObject => write!(f, "full-object"),
        }
    }
}

/// Backoff settings for retried REST calls.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Upper bound for a single backoff delay, in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
        }
    }
}

/// Errors raised while validating configuration or planning a transfer.
///
/// All of these are raised before any chunk I/O begins.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("container name must not be empty")]
    EmptyContainer,

    #[error("worker count must be at least 1")]
    NoWorkers,

    #[error("invalid chunk size {chunk_size}: {reason}")]
    InvalidChunkSize { chunk_size: u64, reason: String },

    #[error("'{name}' needs {chunks} chunks, exceeding the limit of {limit} per object")]
    TooManyChunks { name: String, chunks: u64, limit: u64 },

    #[error("'{name}' is {size} bytes, exceeding the page blob limit of {limit} bytes")]
    ObjectTooLarge { name: String, size: u64, limit: u64 },

    #[error("unsupported option combination: {0}")]
    UnsupportedCombination(String),

    #[error("encryption requires an RSA {0} key")]
    MissingKey(&'static str),

    #[error("failed to load RSA key from {path:?}: {reason}")]
    KeyLoad { path: PathBuf, reason: String },

    #[error("failed to read configuration from {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Json(#[from] serde_json::Error),

    #[error("local resource {0:?} does not exist")]
    MissingLocalResource(PathBuf),
}

/// Process-wide transfer settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TransferConfig {
    /// Remote container all objects live in.
    pub container: String,
    /// Number of worker threads (capped at the number of chunk operations).
    pub workers: usize,
    /// Nominal chunk size in bytes; `0` selects [`DEFAULT_CHUNK_SIZE_BYTES`].
    pub chunk_size_bytes: u64,
    /// Time budget for one REST call including its retries, in seconds.
    /// Absent or non-positive means unbounded.
    pub timeout_secs: Option<f64>,
    /// Backoff settings for transient REST failures.
    pub retry: RetryConfig,
    /// Compute whole-file MD5 hashes to store on upload and check on download.
    pub compute_file_md5: bool,
    /// Skip objects whose MD5 already matches the destination.
    pub skip_on_md5_match: bool,
    /// Keep downloaded files whose integrity check failed.
    pub keep_mismatched_files: bool,
    /// Remote object kind for uploads.
    pub blob_type: BlobType,
    /// Encryption applied to uploads.
    pub encryption_mode: EncryptionMode,
    /// PEM file with the RSA public key used to wrap content keys.
    pub rsa_public_key: Option<PathBuf>,
    /// PEM file with the RSA private key used to unwrap (and sign) content keys.
    pub rsa_private_key: Option<PathBuf>,
    /// Descend into subdirectories when uploading a directory.
    pub recursive: bool,
    /// Keep the uploaded directory's own name as a virtual directory prefix.
    pub keep_root_dir: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            container: String::new(),
            workers: DEFAULT_WORKERS,
            chunk_size_bytes: DEFAULT_CHUNK_SIZE_BYTES,
            timeout_secs: None,
            retry: RetryConfig::default(),
            compute_file_md5: true,
            skip_on_md5_match: false,
            keep_mismatched_files: false,
            blob_type: BlobType::Block,
            encryption_mode: EncryptionMode::None,
            rsa_public_key: None,
            rsa_private_key: None,
            recursive: true,
            keep_root_dir: false,
        }
    }
}

impl TransferConfig {
    /// Creates a configuration with defaults for the given container.
    pub fn new(container: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            ..Default::default()
        }
    }

    /// Parses a JSON configuration document. Missing fields take defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Loads a JSON configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let json = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    #[must_use]
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size_bytes: u64) -> Self {
        self.chunk_size_bytes = chunk_size_bytes;
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = Some(timeout.as_secs_f64());
        self
    }

    #[must_use]
    pub fn with_retry_delays(mut self, base: Duration, max: Duration) -> Self {
        self.retry = RetryConfig {
            base_delay_ms: base.as_millis() as u64,
            max_delay_ms: max.as_millis() as u64,
        };
        self
    }

    #[must_use]
    pub fn with_file_md5(mut self, enabled: bool) -> Self {
        self.compute_file_md5 = enabled;
        self
    }

    #[must_use]
    pub fn with_skip_on_md5_match(mut self, enabled: bool) -> Self {
        self.skip_on_md5_match = enabled;
        self
    }

    #[must_use]
    pub fn with_keep_mismatched_files(mut self, keep: bool) -> Self {
        self.keep_mismatched_files = keep;
        self
    }

    #[must_use]
    pub fn with_blob_type(mut self, blob_type: BlobType) -> Self {
        self.blob_type = blob_type;
        self
    }

    #[must_use]
    pub fn with_encryption(mut self, mode: EncryptionMode) -> Self {
        self.encryption_mode = mode;
        self
    }

    #[must_use]
    pub fn with_rsa_keys(mut self, public: Option<PathBuf>, private: Option<PathBuf>) -> Self {
        self.rsa_public_key = public;
        self.rsa_private_key = private;
        self
    }

    #[must_use]
    pub fn with_recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    #[must_use]
    pub fn with_keep_root_dir(mut self, keep: bool) -> Self {
        self.keep_root_dir = keep;
        self
    }

    /// Nominal chunk size with the `0 = default` rule applied.
    pub fn chunk_size(&self) -> u64 {
        if self.chunk_size_bytes == 0 {
            DEFAULT_CHUNK_SIZE_BYTES
        } else {
            self.chunk_size_bytes
        }
    }

    /// Per-call time budget, if bounded.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs
            .filter(|secs| secs.is_finite() && *secs > 0.0)
            .map(Duration::from_secs_f64)
    }

    /// Checks option combinations and chunk size constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.container.is_empty() {
            return Err(ConfigError::EmptyContainer);
        }
        if self.workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if self.skip_on_md5_match && !self.compute_file_md5 {
            return Err(ConfigError::UnsupportedCombination(
                "skip-on-match requires file MD5 computation".into(),
            ));
        }

        let chunk_size = self.chunk_size();
        let invalid = |reason: &str| ConfigError::InvalidChunkSize {
            chunk_size,
            reason: reason.to_string(),
        };
        if chunk_size > MAX_CHUNK_SIZE_BYTES {
            return Err(invalid("larger than the 100 MiB per-call limit"));
        }

        match (self.blob_type, self.encryption_mode) {
            (BlobType::Page, mode) if mode.is_encrypted() => {
                return Err(ConfigError::UnsupportedCombination(
                    "page blobs cannot be encrypted".into(),
                ));
            }
            (BlobType::Page, _) if chunk_size % PAGE_SIZE_BYTES != 0 => {
                return Err(invalid("page blob chunks must be a multiple of 512 bytes"));
            }
            (_, EncryptionMode::FullObject) if chunk_size % AES_BLOCK_SIZE as u64 != 0 => {
                return Err(invalid(
                    "full-object encryption needs a multiple of the 16-byte AES block",
                ));
            }
            (_, EncryptionMode::PerChunk) if chunk_size < MIN_PER_CHUNK_SIZE_BYTES => {
                return Err(invalid("too small to hold an IV, one cipher block and a MAC"));
            }
            _ => {}
        }

        Ok(())
    }
}
