//! Error types for the transfer engine.
//!
//! Each layer has its own error enum; [`TransferError`] wraps them together
//! with an [`ObjectContext`] describing which object (and chunk) failed.

use std::{fmt, io, path::PathBuf};

use thiserror::Error;

pub use crate::{
    config::ConfigError,
    crypto::{CryptoError, metadata::MetadataError},
    store::StoreError,
};

/// Identifies the object and chunk an error belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectContext {
    pub remote_name: Option<String>,
    pub local_path: Option<PathBuf>,
    pub sequence: Option<u64>,
}

impl ObjectContext {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_remote_name(mut self, name: impl Into<String>) -> Self {
        self.remote_name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_local_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.local_path = Some(path.into());
        self
    }

    #[must_use]
    pub fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = Some(sequence);
        self
    }
}

impl fmt::Display for ObjectContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();

        if let Some(ref name) = self.remote_name {
            parts.push(format!("object '{name}'"));
        }
        if let Some(sequence) = self.sequence {
            parts.push(format!("chunk {sequence}"));
        }
        if let Some(ref path) = self.local_path {
            parts.push(format!("at {:?}", path.display()));
        }

        if parts.is_empty() {
            write!(f, "(no context)")
        } else {
            write!(f, "{}", parts.join(", "))
        }
    }
}

#[derive(Error, Debug)]
pub enum TransferError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("{op} failed for {context}: {source}")]
    Store {
        op: &'static str,
        context: ObjectContext,
        #[source]
        source: StoreError,
    },

    #[error("encryption error for {context}: {source}")]
    Crypto {
        context: ObjectContext,
        #[source]
        source: CryptoError,
    },

    #[error("invalid encryption metadata for {context}: {source}")]
    Metadata {
        context: ObjectContext,
        #[source]
        source: MetadataError,
    },

    #[error("I/O error for {context}: {source}")]
    Io {
        context: ObjectContext,
        #[source]
        source: io::Error,
    },

    #[error("integrity check failed for {context}: {reason}")]
    Integrity {
        context: ObjectContext,
        reason: String,
    },

    #[error("failed to start worker thread: {0}")]
    WorkerSpawn(#[source] io::Error),

    #[error("worker thread panicked")]
    WorkerPanicked,

    #[error("transfer aborted")]
    Aborted,
}

impl TransferError {
    pub fn store(op: &'static str, context: ObjectContext, source: StoreError) -> Self {
        TransferError::Store {
            op,
            context,
            source,
        }
    }

    pub fn crypto(context: ObjectContext, source: CryptoError) -> Self {
        TransferError::Crypto { context, source }
    }

    pub fn metadata(context: ObjectContext, source: MetadataError) -> Self {
        TransferError::Metadata { context, source }
    }

    pub fn io(context: ObjectContext, source: io::Error) -> Self {
        TransferError::Io { context, source }
    }

    /// Whether the failure only affects one object.
    ///
    /// Object-local failures are recorded in the run summary; everything
    /// else aborts the run.
    pub fn is_object_local(&self) -> bool {
        matches!(
            self,
            TransferError::Crypto { .. }
                | TransferError::Metadata { .. }
                | TransferError::Integrity { .. }
        )
    }
}
