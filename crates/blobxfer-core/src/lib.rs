//! Chunked, parallel, optionally encrypted blob transfer engine.
//!
//! The engine moves local files to and from a blob store in fixed-size chunks:
//!
//! - [`transfer::planner`] turns a [`transfer::TransferObject`] into ordered
//!   chunk instructions
//! - [`transfer::queue`] orders those instructions by sequence index
//! - [`transfer::worker`] runs a fixed pool of threads against a [`store::BlobStore`]
//! - [`transfer::finalize`] commits or validates each object exactly once
//!
//! Encryption (AES-256-CBC + HMAC-SHA256 with RSA-OAEP wrapped keys) lives in
//! [`crypto`]; content hashing and skip-on-match in [`integrity`].

pub mod config;
pub mod crypto;
pub mod error;
pub mod integrity;
pub mod store;
pub mod transfer;

pub use config::{BlobType, EncryptionMode, TransferConfig};
pub use crypto::keys::KeyMaterial;
pub use store::{BlobStore, memory::MemoryBlobStore};
pub use transfer::{
    AbortHandle, Direction, TransferEngine, TransferObject, TransferSummary,
};
