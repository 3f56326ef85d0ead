//! Transfer worker pool.
//!
//! A fixed number of named threads drain the shared [`ChunkQueue`]. Each
//! processed chunk produces a [`Completion`] on the completion channel; the
//! engine's drain loop owns finalization.
//!
//! Failures fall into two classes. Object-local failures (bad MAC, bad
//! padding) mark the object failed and still report a completion, so the
//! object is cleaned up at finalization while the rest of the run continues.
//! Everything else is recorded here, raises the abort flag and stops the
//! worker.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
};

use crossbeam_channel::Sender;
use md5::Digest;
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use super::{
    Direction,
    instruction::{ChunkInstruction, ChunkOp, ObjectState},
    queue::ChunkQueue,
};
use crate::{
    config::{EncryptionMode, TransferConfig},
    crypto::{CryptoError, IV_SIZE, cipher},
    error::TransferError,
    integrity::md5_base64,
    store::{BlobStore, retry::RetryPolicy},
};

/// Everything a worker needs besides its queue.
pub struct WorkerContext {
    pub store: Arc<dyn BlobStore>,
    pub config: Arc<TransferConfig>,
    pub retry: RetryPolicy,
    pub abort: Arc<AtomicBool>,
}

/// One finished chunk operation.
#[derive(Debug)]
pub struct Completion {
    pub object: Arc<ObjectState>,
    pub sequence: u64,
    /// Payload bytes moved over the wire.
    pub bytes: u64,
}

pub struct WorkerPool {
    workers: Vec<JoinHandle<()>>,
    errors: Arc<Mutex<Vec<TransferError>>>,
}

impl WorkerPool {
    /// Starts `count` workers over `queue`.
    ///
    /// If a thread cannot be started the workers already running are told
    /// to stop and joined before the error is returned.
    pub fn spawn(
        count: usize,
        queue: Arc<ChunkQueue>,
        ctx: Arc<WorkerContext>,
        completions: Sender<Completion>,
    ) -> Result<Self, TransferError> {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let mut pool = Self {
            workers: Vec::with_capacity(count),
            errors,
        };

        for worker_id in 0..count {
            let queue = Arc::clone(&queue);
            let ctx_for_thread = Arc::clone(&ctx);
            let completions = completions.clone();
            let errors = Arc::clone(&pool.errors);

            let spawned = thread::Builder::new()
                .name(format!("blobxfer-worker-{worker_id}"))
                .spawn(move || worker_loop(worker_id, &queue, &ctx_for_thread, &completions, &errors));

            match spawned {
                Ok(handle) => pool.workers.push(handle),
                Err(err) => {
                    ctx.abort.store(true, Ordering::Release);
                    pool.join();
                    return Err(TransferError::WorkerSpawn(err));
                }
            }
        }

        info!(workers = count, "Transfer workers started");
        Ok(pool)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Whether any worker has recorded a run-fatal error.
    pub fn has_failed(&self) -> bool {
        !self.errors.lock().is_empty()
    }

    /// Waits for every worker and returns the errors they recorded.
    pub fn join(&mut self) -> Vec<TransferError> {
        debug!("Waiting for transfer workers to finish");
        let mut panicked = false;
        for handle in std::mem::take(&mut self.workers) {
            if handle.join().is_err() {
                panicked = true;
            }
        }
        let mut errors = std::mem::take(&mut *self.errors.lock());
        if panicked {
            errors.push(TransferError::WorkerPanicked);
        }
        errors
    }
}

fn worker_loop(
    worker_id: usize,
    queue: &ChunkQueue,
    ctx: &WorkerContext,
    completions: &Sender<Completion>,
    errors: &Mutex<Vec<TransferError>>,
) {
    trace!(worker_id, "Transfer worker started");

    while !ctx.abort.load(Ordering::Acquire) {
        let Some(instruction) = queue.pop() else {
            break;
        };

        let bytes = match process_instruction(ctx, &instruction) {
            Ok(bytes) => bytes,
            Err(TransferError::Aborted) => break,
            Err(err) if err.is_object_local() => {
                warn!(worker_id, error = %err, "Chunk failed, abandoning object");
                instruction.object.mark_failed(err.to_string());
                0
            }
            Err(err) => {
                warn!(worker_id, error = %err, "Chunk failed, aborting transfer");
                errors.lock().push(err);
                ctx.abort.store(true, Ordering::Release);
                break;
            }
        };

        let completion = Completion {
            object: Arc::clone(&instruction.object),
            sequence: instruction.sequence,
            bytes,
        };
        if completions.send(completion).is_err() {
            debug!(worker_id, "Completion channel closed");
            break;
        }
    }

    trace!(worker_id, "Transfer worker exiting");
}

/// Runs one chunk instruction to completion and returns the payload size.
pub fn process_instruction(
    ctx: &WorkerContext,
    instruction: &ChunkInstruction,
) -> Result<u64, TransferError> {
    let object = &instruction.object;
    if object.has_failed() {
        trace!(remote = %object.remote_name, sequence = instruction.sequence, "Object already failed, skipping chunk");
        return Ok(0);
    }

    match (&instruction.op, object.direction) {
        (ChunkOp::Empty, _) => Ok(0),
        (ChunkOp::PutBlock { block_id }, Direction::Upload) => {
            let Some(payload) = upload_payload(ctx, instruction)? else {
                return Ok(0);
            };
            let md5 = md5_base64(&payload);
            ctx.retry
                .run("put_block", || {
                    ctx.store.put_block(
                        &ctx.config.container,
                        &object.remote_name,
                        block_id,
                        &payload,
                        Some(&md5),
                    )
                })
                .map_err(|e| TransferError::store("put_block", instruction.context(), e))?;
            Ok(payload.len() as u64)
        }
        (ChunkOp::PutPage { start, end }, Direction::Upload) => {
            let mut data = object
                .read_at(instruction.offset, instruction.length as usize)
                .map_err(|e| TransferError::io(instruction.context(), e))?;
            data.resize((end - start + 1) as usize, 0);
            let md5 = md5_base64(&data);
            ctx.retry
                .run("put_page", || {
                    ctx.store.put_page(
                        &ctx.config.container,
                        &object.remote_name,
                        *start,
                        *end,
                        &data,
                        Some(&md5),
                    )
                })
                .map_err(|e| TransferError::store("put_page", instruction.context(), e))?;
            Ok(data.len() as u64)
        }
        (
            ChunkOp::GetRange {
                start,
                end,
                leading_iv,
            },
            Direction::Download,
        ) => download_range(ctx, instruction, *start, *end, *leading_iv),
        (op, direction) => Err(TransferError::io(
            instruction.context(),
            std::io::Error::other(format!("{op:?} is not valid for a {direction}")),
        )),
    }
}

/// Reads one upload chunk and applies the object's encryption.
///
/// `None` means the object failed while this chunk waited for its IV.
fn upload_payload(
    ctx: &WorkerContext,
    instruction: &ChunkInstruction,
) -> Result<Option<Vec<u8>>, TransferError> {
    let object = &instruction.object;
    let crypto_error = |e| TransferError::crypto(instruction.context(), e);
    let plaintext = object
        .read_at(instruction.offset, instruction.length as usize)
        .map_err(|e| TransferError::io(instruction.context(), e))?;

    let Some(params) = &object.encryption else {
        return Ok(Some(plaintext));
    };

    match params.mode {
        EncryptionMode::PerChunk => cipher::seal_chunk(&params.keys, &plaintext)
            .map(Some)
            .map_err(crypto_error),
        EncryptionMode::FullObject => {
            let Some(iv) = object.wait_for_iv(instruction.sequence, &ctx.abort)? else {
                return Ok(None);
            };
            let ciphertext = params
                .keys
                .with_content_key(|key| {
                    cipher::encrypt(key, &iv, &plaintext, instruction.final_chunk)
                })
                .map_err(crypto_error)?;

            let mut progress = object.lock();
            if let Some(mac) = progress.stream_mac.as_mut() {
                mac.update(&ciphertext);
            }
            if let Some(md5) = progress.stream_md5.as_mut() {
                md5.update(&ciphertext);
            }
            if !instruction.final_chunk {
                let next = cipher::next_iv(&ciphertext).ok_or_else(|| {
                    crypto_error(CryptoError::InvalidCiphertextLength {
                        len: ciphertext.len(),
                    })
                })?;
                object.publish_iv(&mut progress, instruction.sequence + 1, next);
            }
            Ok(Some(ciphertext))
        }
        EncryptionMode::None => Ok(Some(plaintext)),
    }
}

fn download_range(
    ctx: &WorkerContext,
    instruction: &ChunkInstruction,
    start: u64,
    end: u64,
    leading_iv: bool,
) -> Result<u64, TransferError> {
    let object = &instruction.object;
    let crypto_error = |e| TransferError::crypto(instruction.context(), e);
    let io_error = |e| TransferError::io(instruction.context(), e);

    let data = ctx
        .retry
        .run("get_range", || {
            ctx.store
                .get_range(&ctx.config.container, &object.remote_name, start, end)
        })
        .map_err(|e| TransferError::store("get_range", instruction.context(), e))?;
    let fetched = data.len() as u64;

    let Some(params) = &object.encryption else {
        object.write_at(instruction.offset, &data).map_err(io_error)?;
        return Ok(fetched);
    };

    match params.mode {
        EncryptionMode::PerChunk => {
            let plaintext = cipher::open_chunk(&params.keys, &data).map_err(crypto_error)?;
            object
                .write_at(instruction.offset, &plaintext)
                .map_err(io_error)?;
        }
        EncryptionMode::FullObject | EncryptionMode::None => {
            let (iv, ciphertext) = if leading_iv {
                if data.len() < IV_SIZE {
                    return Err(crypto_error(CryptoError::ChunkTooShort { len: data.len() }));
                }
                let (iv, rest) = data.split_at(IV_SIZE);
                let iv: [u8; IV_SIZE] = iv
                    .try_into()
                    .map_err(|_| crypto_error(CryptoError::ChunkTooShort { len: data.len() }))?;
                (iv, rest)
            } else {
                let iv = params.iv.ok_or_else(|| {
                    crypto_error(CryptoError::MissingKey("initialization vector"))
                })?;
                (iv, data.as_slice())
            };

            let plaintext = params
                .keys
                .with_content_key(|key| {
                    cipher::decrypt(key, &iv, ciphertext, instruction.final_chunk)
                })
                .map_err(crypto_error)?;
            object
                .write_at(instruction.offset, &plaintext)
                .map_err(io_error)?;
            object
                .lock()
                .absorb_ciphertext(instruction.sequence, ciphertext.to_vec());
        }
    }
    Ok(fetched)
}

#[cfg(test)]
mod tests {
    use std::{io::Write, path::Path, time::Duration};

    use crossbeam_channel::unbounded;

    use super::*;
    use crate::{
        config::BlobType,
        crypto::keys::{KeyMaterial, test_keys},
        store::memory::{MemoryBlobStore, MemoryStoreStats},
        transfer::{TransferObject, planner::Planner},
    };

    fn context(store: Arc<MemoryBlobStore>, config: TransferConfig) -> Arc<WorkerContext> {
        let abort = Arc::new(AtomicBool::new(false));
        Arc::new(WorkerContext {
            store,
            retry: RetryPolicy::new(Duration::from_millis(1), Duration::from_millis(2))
                .with_abort_flag(Arc::clone(&abort)),
            config: Arc::new(config),
            abort,
        })
    }

    fn write_file(dir: &Path, name: &str, data: &[u8]) -> std::path::PathBuf {
        let path = dir.join(name);
        std::fs::File::create(&path).unwrap().write_all(data).unwrap();
        path
    }

    fn run_pool(
        ctx: &Arc<WorkerContext>,
        instructions: Vec<ChunkInstruction>,
        workers: usize,
    ) -> Vec<Completion> {
        let queue = Arc::new(ChunkQueue::new());
        queue.extend(instructions);
        let (tx, rx) = unbounded();
        let mut pool = WorkerPool::spawn(workers, queue, Arc::clone(ctx), tx).unwrap();
        let errors = pool.join();
        assert!(errors.is_empty(), "unexpected worker errors: {errors:?}");
        rx.try_iter().collect()
    }

    #[test]
    fn test_pool_uploads_every_block() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "f", b"0123456789");
        let store = Arc::new(MemoryBlobStore::new());
        let config = TransferConfig::new("c").with_chunk_size(4);
        let ctx = context(Arc::clone(&store), config.clone());

        let plan = Planner::new(store.as_ref(), &config, &ctx.retry)
            .plan(&TransferObject::upload(&path, "f"))
            .unwrap();
        let completions = run_pool(&ctx, plan.instructions, 3);

        assert_eq!(completions.len(), 3);
        assert_eq!(completions.iter().map(|c| c.bytes).sum::<u64>(), 10);
        let mut staged = store.staged_block_ids("c", "f");
        staged.sort();
        assert_eq!(staged, ["00000000", "00000001", "00000002"]);
    }

    #[test]
    fn test_full_object_chunks_chain_ivs() {
        let dir = tempfile::tempdir().unwrap();
        let data: Vec<u8> = (0..100u8).collect();
        let path = write_file(dir.path(), "f", &data);
        let store = Arc::new(MemoryBlobStore::new());
        let material = KeyMaterial::from_private_key(test_keys::private_key());
        let config = TransferConfig::new("c")
            .with_chunk_size(32)
            .with_encryption(EncryptionMode::FullObject);
        let ctx = context(Arc::clone(&store), config.clone());

        let plan = Planner::new(store.as_ref(), &config, &ctx.retry)
            .with_keys(Some(&material))
            .plan(&TransferObject::upload(&path, "f"))
            .unwrap();
        let state = plan.state.clone().unwrap();
        let completions = run_pool(&ctx, plan.instructions, 4);

        // 32 + 32 + 32 + (4 padded to 16).
        assert_eq!(completions.iter().map(|c| c.bytes).sum::<u64>(), 112);
        let progress = state.lock();
        assert!(progress.ivs.is_empty());
        assert!(progress.stream_mac.is_some());
    }

    #[test]
    fn test_page_chunk_is_zero_padded() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "p", &[9u8; 511]);
        let store = Arc::new(MemoryBlobStore::new());
        let config = TransferConfig::new("c")
            .with_blob_type(BlobType::Page)
            .with_chunk_size(512);
        let ctx = context(Arc::clone(&store), config.clone());

        let plan = Planner::new(store.as_ref(), &config, &ctx.retry)
            .plan(&TransferObject::upload(&path, "p"))
            .unwrap();
        run_pool(&ctx, plan.instructions, 1);

        assert_eq!(store.page_write_sizes(), [512]);
        let stored = store.object_data("c", "p").unwrap();
        assert_eq!(&stored[..511], &[9u8; 511][..]);
        assert_eq!(stored[511], 0);
    }

    #[test]
    fn test_tampered_chunk_fails_object_not_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "f", &[5u8; 40]);
        let store = Arc::new(MemoryBlobStore::new());
        let material = KeyMaterial::from_private_key(test_keys::private_key());
        let config = TransferConfig::new("c")
            .with_chunk_size(64)
            .with_encryption(EncryptionMode::PerChunk);
        let ctx = context(Arc::clone(&store), config.clone());

        // Seed an encrypted object by hand: one sealed chunk plus metadata.
        let plan = Planner::new(store.as_ref(), &config, &ctx.retry)
            .with_keys(Some(&material))
            .plan(&TransferObject::upload(&path, "f"))
            .unwrap();
        let params = plan.state.as_ref().unwrap().encryption.as_ref().unwrap();
        let mut sealed = cipher::seal_chunk(&params.keys, &[5u8; 15]).unwrap();
        let metadata = params.to_metadata(None, None).unwrap();
        sealed[20] ^= 0x01;
        store.insert_object("c", "enc", sealed, BlobType::Block, None, metadata);

        let plan = Planner::new(store.as_ref(), &config, &ctx.retry)
            .with_keys(Some(&material))
            .plan(&TransferObject::download("enc", dir.path().join("out")))
            .unwrap();
        let state = plan.state.clone().unwrap();
        let completions = run_pool(&ctx, plan.instructions, 2);

        assert_eq!(completions.len(), 1);
        assert!(state.has_failed());
        assert!(!ctx.abort.load(Ordering::Acquire));
    }

    #[test]
    fn test_store_failure_aborts_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "f", b"abcdefgh");
        let store = Arc::new(MemoryBlobStore::new());
        let config = TransferConfig::new("c").with_chunk_size(4);
        let ctx = context(Arc::clone(&store), config.clone());

        let plan = Planner::new(store.as_ref(), &config, &ctx.retry)
            .plan(&TransferObject::upload(&path, "f"))
            .unwrap();
        store.fail_next(1, 403);

        let queue = Arc::new(ChunkQueue::new());
        queue.extend(plan.instructions);
        let (tx, _rx) = unbounded();
        let mut pool = WorkerPool::spawn(1, queue, Arc::clone(&ctx), tx).unwrap();
        let errors = pool.join();

        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], TransferError::Store { op: "put_block", .. }));
        assert!(ctx.abort.load(Ordering::Acquire));
        assert_eq!(MemoryStoreStats::get(&store.stats().put_block), 1);
    }

    #[test]
    fn test_transient_failures_are_retried() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "f", b"abcd");
        let store = Arc::new(MemoryBlobStore::new());
        let config = TransferConfig::new("c");
        let ctx = context(Arc::clone(&store), config.clone());

        let plan = Planner::new(store.as_ref(), &config, &ctx.retry)
            .plan(&TransferObject::upload(&path, "f"))
            .unwrap();
        store.fail_next(2, 503);
        let completions = run_pool(&ctx, plan.instructions, 1);

        assert_eq!(completions.len(), 1);
        assert_eq!(store.staged_block_ids("c", "f"), ["00000000"]);
    }
}
