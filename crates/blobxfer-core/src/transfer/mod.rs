//! Chunked transfer pipeline.
//!
//! Planner → chunk queue → worker pool → completion channel → finalizer.
//! [`engine::TransferEngine`] wires the stages together for one run.

pub mod engine;
pub mod finalize;
pub mod instruction;
pub mod planner;
pub mod queue;
pub mod worker;

use std::{
    fmt,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

pub use engine::{ObjectFailure, TransferEngine, TransferSummary};

use crate::store::BlobProperties;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Upload,
    Download,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Upload => write!(f, "upload"),
            Direction::Download => write!(f, "download"),
        }
    }
}

/// One local file paired with one remote object.
#[derive(Debug, Clone)]
pub struct TransferObject {
    pub local_path: PathBuf,
    pub remote_name: String,
    pub direction: Direction,
    /// Remote properties already known from a listing (downloads only).
    pub remote: Option<BlobProperties>,
}

impl TransferObject {
    pub fn upload(local_path: impl Into<PathBuf>, remote_name: impl Into<String>) -> Self {
        Self {
            local_path: local_path.into(),
            remote_name: remote_name.into(),
            direction: Direction::Upload,
            remote: None,
        }
    }

    pub fn download(remote_name: impl Into<String>, local_path: impl Into<PathBuf>) -> Self {
        Self {
            local_path: local_path.into(),
            remote_name: remote_name.into(),
            direction: Direction::Download,
            remote: None,
        }
    }

    /// Skips the HEAD request during planning.
    #[must_use]
    pub fn with_remote_properties(mut self, properties: BlobProperties) -> Self {
        self.remote = Some(properties);
        self
    }
}

/// Requests cancellation of a running transfer.
///
/// Workers check the flag between chunks; chunks already in flight finish.
#[derive(Debug, Clone, Default)]
pub struct AbortHandle(Arc<AtomicBool>);

impl AbortHandle {
    pub(crate) fn from_flag(flag: Arc<AtomicBool>) -> Self {
        Self(flag)
    }

    pub fn abort(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_aborted(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}
