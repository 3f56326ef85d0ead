//! Chunk instructions and the shared per-object state they point at.

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    fs::{File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use md5::Md5;
use parking_lot::{Condvar, Mutex, MutexGuard};
use ring::hmac;

use super::Direction;
use crate::{
    config::BlobType,
    crypto::{IV_SIZE, metadata::EncryptionParams},
    error::{ObjectContext, TransferError},
};

/// How long an IV waiter sleeps before re-checking the abort flag.
const IV_WAIT_SLICE: Duration = Duration::from_millis(50);

/// The REST operation a chunk maps to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkOp {
    PutBlock { block_id: String },
    /// Inclusive, 512-aligned page range.
    PutPage { start: u64, end: u64 },
    /// Inclusive stored range. With `leading_iv` the first 16 bytes are the
    /// previous ciphertext block, fetched only to serve as this chunk's IV.
    GetRange { start: u64, end: u64, leading_iv: bool },
    /// Zero-length object; all work happens at finalization.
    Empty,
}

/// One unit of work for the worker pool. Consumed exactly once.
pub struct ChunkInstruction {
    pub sequence: u64,
    /// Plaintext offset in the local file.
    pub offset: u64,
    /// Plaintext length in the local file (an upper bound for downloads of
    /// the final encrypted chunk).
    pub length: u64,
    pub op: ChunkOp,
    /// Last chunk of the object; carries the PKCS#7 padding when encrypted.
    pub final_chunk: bool,
    pub object: Arc<ObjectState>,
}

impl fmt::Debug for ChunkInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChunkInstruction")
            .field("object", &self.object.remote_name)
            .field("sequence", &self.sequence)
            .field("offset", &self.offset)
            .field("length", &self.length)
            .field("op", &self.op)
            .field("final_chunk", &self.final_chunk)
            .finish()
    }
}

impl ChunkInstruction {
    pub fn context(&self) -> ObjectContext {
        self.object.context().with_sequence(self.sequence)
    }
}

/// Mutable state of one object, guarded by the object lock.
#[derive(Default)]
pub struct ObjectProgress {
    /// Running HMAC over `IV || ciphertext` (full-object mode).
    pub stream_mac: Option<hmac::Context>,
    /// Running MD5 of the uploaded ciphertext (full-object uploads).
    pub stream_md5: Option<Md5>,
    /// IVs ready for consumption, keyed by the chunk that needs them.
    pub ivs: HashMap<u64, [u8; IV_SIZE]>,
    /// Downloaded ciphertext waiting for its turn in the stream MAC.
    pub pending_mac: BTreeMap<u64, Vec<u8>>,
    pub next_mac_sequence: u64,
    /// Highest plaintext byte written so far (downloads).
    pub plaintext_len: u64,
    /// First object-local failure; remaining chunks are skipped.
    pub failure: Option<String>,
    pub(crate) completed_ops: u64,
}

impl ObjectProgress {
    /// Feeds downloaded ciphertext into the stream MAC in sequence order.
    pub fn absorb_ciphertext(&mut self, sequence: u64, ciphertext: Vec<u8>) {
        self.pending_mac.insert(sequence, ciphertext);
        while let Some(ciphertext) = self.pending_mac.remove(&self.next_mac_sequence) {
            if let Some(mac) = self.stream_mac.as_mut() {
                mac.update(&ciphertext);
            }
            self.next_mac_sequence += 1;
        }
    }
}

/// Shared state of one planned object. Immutable apart from
/// [`ObjectProgress`].
pub struct ObjectState {
    pub direction: Direction,
    pub remote_name: String,
    /// Source file (uploads) or final destination (downloads).
    pub local_path: PathBuf,
    /// File the workers touch: the source file or the `.blobtmp` file.
    pub work_path: PathBuf,
    pub blob_type: BlobType,
    pub encryption: Option<EncryptionParams>,
    pub total_ops: u64,
    /// Ordered block ids to commit (block uploads).
    pub block_ids: Vec<String>,
    /// MD5 of the local file (uploads, when hashing is enabled).
    pub file_md5: Option<String>,
    /// Content MD5 of the stored object (downloads).
    pub remote_md5: Option<String>,
    /// Bytes stored remotely (downloads) or read locally (uploads).
    pub stored_length: u64,
    pub(crate) progress: Mutex<ObjectProgress>,
    pub(crate) iv_ready: Condvar,
}

impl fmt::Debug for ObjectState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectState")
            .field("direction", &self.direction)
            .field("remote_name", &self.remote_name)
            .field("local_path", &self.local_path)
            .field("blob_type", &self.blob_type)
            .field("encryption", &self.encryption.as_ref().map(|e| e.mode))
            .field("total_ops", &self.total_ops)
            .finish_non_exhaustive()
    }
}

impl ObjectState {
    pub fn context(&self) -> ObjectContext {
        ObjectContext::new()
            .with_remote_name(&self.remote_name)
            .with_local_path(&self.local_path)
    }

    pub fn lock(&self) -> MutexGuard<'_, ObjectProgress> {
        self.progress.lock()
    }

    /// Counts one finished chunk operation.
    ///
    /// Returns `true` for the call that brings the count up to `total_ops`.
    /// Each instruction completes once, so that call is the only one.
    pub fn record_completion(&self) -> bool {
        let mut progress = self.progress.lock();
        progress.completed_ops += 1;
        progress.completed_ops == self.total_ops
    }

    pub fn completed_ops(&self) -> u64 {
        self.progress.lock().completed_ops
    }

    /// Reads `len` bytes at `offset` of the work file.
    ///
    /// The file is opened for this chunk only, so descriptors scale with the
    /// worker count rather than the number of planned objects.
    pub fn read_at(&self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let mut file = File::open(&self.work_path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buffer = vec![0u8; len];
        file.read_exact(&mut buffer)?;
        Ok(buffer)
    }

    /// Writes plaintext at `offset` of the work file and extends the
    /// plaintext high-water mark.
    pub fn write_at(&self, offset: u64, data: &[u8]) -> io::Result<()> {
        let mut file = OpenOptions::new().write(true).open(&self.work_path)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        let mut progress = self.progress.lock();
        progress.plaintext_len = progress.plaintext_len.max(offset + data.len() as u64);
        Ok(())
    }

    /// Marks the object failed and wakes IV waiters so they can give up.
    pub fn mark_failed(&self, reason: String) {
        let mut progress = self.progress.lock();
        if progress.failure.is_none() {
            progress.failure = Some(reason);
        }
        self.iv_ready.notify_all();
    }

    pub fn has_failed(&self) -> bool {
        self.progress.lock().failure.is_some()
    }

    /// Blocks until the IV for `sequence` has been published, then takes it.
    ///
    /// Returns `None` if the object failed while waiting and
    /// [`TransferError::Aborted`] if the run was aborted.
    pub fn wait_for_iv(
        &self,
        sequence: u64,
        abort: &AtomicBool,
    ) -> Result<Option<[u8; IV_SIZE]>, TransferError> {
        let mut progress = self.progress.lock();
        loop {
            if let Some(iv) = progress.ivs.remove(&sequence) {
                return Ok(Some(iv));
            }
            if progress.failure.is_some() {
                return Ok(None);
            }
            if abort.load(Ordering::Acquire) {
                return Err(TransferError::Aborted);
            }
            self.iv_ready.wait_for(&mut progress, IV_WAIT_SLICE);
        }
    }

    /// Publishes the IV for `sequence` and wakes every waiter on this object.
    ///
    /// `progress` must be this object's locked state.
    pub fn publish_iv(&self, progress: &mut ObjectProgress, sequence: u64, iv: [u8; IV_SIZE]) {
        progress.ivs.insert(sequence, iv);
        self.iv_ready.notify_all();
    }
}
