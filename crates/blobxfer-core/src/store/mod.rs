//! Blob-storage REST surface used by the transfer engine.
//!
//! The engine never talks to a network client directly; it drives a
//! [`BlobStore`] implementation shared by every worker thread. Credential
//! handling and endpoint discovery belong to the implementation.
//!
//! [`retry::RetryPolicy`] wraps individual calls with a time budget and
//! randomized exponential backoff. [`memory::MemoryBlobStore`] is an
//! in-process implementation with latency and fault injection.

pub mod memory;
pub mod retry;

use std::{collections::HashMap, io};

use thiserror::Error;

use crate::config::BlobType;

/// Properties of a stored object, as returned by HEAD or a listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlobProperties {
    pub name: String,
    /// Stored length in bytes (ciphertext length for encrypted objects).
    pub length: u64,
    /// Base64 MD5 of the stored bytes, if the object has one.
    pub content_md5: Option<String>,
    /// User metadata; empty when a listing was requested without metadata.
    pub metadata: HashMap<String, String>,
    pub blob_type: BlobType,
}

/// One page of a container listing.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    pub entries: Vec<BlobProperties>,
    /// Continuation marker; `None` on the last page.
    pub next_marker: Option<String>,
}

/// Content headers applied when committing an object.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentSettings {
    pub content_md5: Option<String>,
}

impl ContentSettings {
    pub fn with_md5(content_md5: Option<String>) -> Self {
        Self { content_md5 }
    }
}

/// Errors returned by a [`BlobStore`] call.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The service answered with a non-success status.
    #[error("HTTP {status}: {message}")]
    Http { status: u16, message: String },

    /// The connection failed before a response arrived.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),

    /// A single call did not answer in time.
    #[error("request timed out")]
    Timeout,

    /// Retries stopped because the call's time budget ran out.
    #[error("retry budget exhausted after {attempts} attempts: {last}")]
    RetryBudgetExhausted {
        attempts: u32,
        #[source]
        last: Box<StoreError>,
    },
}

impl StoreError {
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        StoreError::Http {
            status,
            message: message.into(),
        }
    }

    pub fn not_found(name: &str) -> Self {
        Self::http(404, format!("object '{name}' not found"))
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            StoreError::Http { status, .. } => Some(*status),
            StoreError::RetryBudgetExhausted { last, .. } => last.status(),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }

    /// Whether the call may succeed if repeated.
    ///
    /// Timeouts, dropped connections, throttling (429) and server errors are
    /// transient. Client errors, 501 (not implemented) and 505 (version not
    /// supported) are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Http { status, .. } => match *status {
                429 => true,
                501 | 505 => false,
                s => (500..600).contains(&s),
            },
            StoreError::Transport(err) => matches!(
                err.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::BrokenPipe
            ),
            StoreError::Timeout => true,
            StoreError::RetryBudgetExhausted { .. } => false,
        }
    }
}

/// REST operations the transfer engine needs from a blob service.
///
/// All ranges are inclusive on both ends, matching HTTP `Range` semantics.
/// Implementations are shared across worker threads.
pub trait BlobStore: Send + Sync {
    fn list_objects(
        &self,
        container: &str,
        marker: Option<&str>,
        include_metadata: bool,
    ) -> Result<ListPage, StoreError>;

    fn head_object(&self, container: &str, name: &str) -> Result<BlobProperties, StoreError>;

    fn get_range(
        &self,
        container: &str,
        name: &str,
        start: u64,
        end_inclusive: u64,
    ) -> Result<Vec<u8>, StoreError>;

    /// Stages one block; it becomes visible only once listed in a block list.
    fn put_block(
        &self,
        container: &str,
        name: &str,
        block_id: &str,
        data: &[u8],
        md5: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Commits staged blocks in the given order.
    fn put_block_list(
        &self,
        container: &str,
        name: &str,
        block_ids: &[String],
        settings: &ContentSettings,
    ) -> Result<(), StoreError>;

    /// Creates (or resets) a zero-filled page object of `size` bytes.
    fn create_page_object(&self, container: &str, name: &str, size: u64)
    -> Result<(), StoreError>;

    fn put_page(
        &self,
        container: &str,
        name: &str,
        start: u64,
        end_inclusive: u64,
        data: &[u8],
        md5: Option<&str>,
    ) -> Result<(), StoreError>;

    fn set_properties(
        &self,
        container: &str,
        name: &str,
        settings: &ContentSettings,
    ) -> Result<(), StoreError>;

    /// Replaces the object's user metadata.
    fn set_metadata(
        &self,
        container: &str,
        name: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<(), StoreError>;

    /// Removes an object and its staged blocks. Transfers never call this;
    /// it is here for callers that manage the container between runs.
    fn delete_object(&self, container: &str, name: &str) -> Result<(), StoreError>;
}

/// Follows continuation markers until the whole container has been listed.
pub fn list_all(
    store: &dyn BlobStore,
    container: &str,
    include_metadata: bool,
) -> Result<Vec<BlobProperties>, StoreError> {
    let mut entries = Vec::new();
    let mut marker: Option<String> = None;
    loop {
        let page = store.list_objects(container, marker.as_deref(), include_metadata)?;
        entries.extend(page.entries);
        match page.next_marker {
            Some(next) if !next.is_empty() => marker = Some(next),
            _ => break,
        }
    }
    Ok(entries)
}
