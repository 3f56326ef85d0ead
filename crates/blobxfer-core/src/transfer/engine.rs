//! Transfer orchestration.
//!
//! [`TransferEngine`] turns a local path or remote name into
//! [`TransferObject`]s, plans them, feeds the worker pool and finalizes each
//! object as its last chunk completes. One engine can run any number of
//! transfers; each `run` gets its own queue, pool and completion channel.

use std::{
    collections::HashMap,
    fmt,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use crossbeam_channel::{RecvTimeoutError, unbounded};
use tracing::{debug, info, instrument, trace, warn};
use walkdir::WalkDir;

use super::{
    AbortHandle, Direction, TransferObject,
    finalize::{FinalizeOutcome, finalize},
    planner::Planner,
    queue::ChunkQueue,
    worker::{WorkerContext, WorkerPool},
};
use crate::{
    config::{CONTAINER_WILDCARD, ConfigError, TEMP_FILE_SUFFIX, TransferConfig},
    crypto::keys::KeyMaterial,
    error::{ObjectContext, TransferError},
    store::{self, BlobProperties, BlobStore, retry::RetryPolicy},
};

/// How often the drain loop wakes up to look for worker failures.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// One object that did not make it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectFailure {
    pub remote_name: String,
    pub local_path: PathBuf,
    pub reason: String,
    /// The data arrived but failed verification.
    pub integrity: bool,
}

/// Outcome of one transfer run.
#[derive(Debug, Clone)]
pub struct TransferSummary {
    pub direction: Direction,
    /// Objects considered, including skipped and failed ones.
    pub objects_total: usize,
    pub objects_transferred: usize,
    pub objects_skipped: usize,
    pub ops_total: u64,
    pub ops_completed: u64,
    pub bytes_transferred: u64,
    /// Worker threads started for the run; zero when nothing was queued.
    pub workers: usize,
    pub failures: Vec<ObjectFailure>,
    pub elapsed: Duration,
}

impl TransferSummary {
    fn new(direction: Direction) -> Self {
        Self {
            direction,
            objects_total: 0,
            objects_transferred: 0,
            objects_skipped: 0,
            ops_total: 0,
            ops_completed: 0,
            bytes_transferred: 0,
            workers: 0,
            failures: Vec::new(),
            elapsed: Duration::ZERO,
        }
    }

    fn record_failure(
        &mut self,
        remote_name: &str,
        local_path: &Path,
        reason: String,
        integrity: bool,
    ) {
        self.failures.push(ObjectFailure {
            remote_name: remote_name.to_string(),
            local_path: local_path.to_path_buf(),
            reason,
            integrity,
        });
    }

    /// Nothing needed transferring and nothing failed.
    pub fn is_no_op(&self) -> bool {
        self.ops_total == 0 && self.failures.is_empty()
    }

    pub fn integrity_failures(&self) -> usize {
        self.failures.iter().filter(|f| f.integrity).count()
    }

    /// Process exit status: 0 when clean (or nothing to do), 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        i32::from(!self.failures.is_empty())
    }
}

impl fmt::Display for TransferSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_no_op() {
            return write!(
                f,
                "{}: no work to do ({} object(s) already up to date)",
                self.direction, self.objects_skipped
            );
        }
        write!(
            f,
            "{}: {} of {} object(s) transferred, {} skipped, {} failed ({} integrity); \
             {}/{} ops, {} bytes in {:.3}s",
            self.direction,
            self.objects_transferred,
            self.objects_total,
            self.objects_skipped,
            self.failures.len(),
            self.integrity_failures(),
            self.ops_completed,
            self.ops_total,
            self.bytes_transferred,
            self.elapsed.as_secs_f64()
        )
    }
}

pub struct TransferEngine {
    store: Arc<dyn BlobStore>,
    config: Arc<TransferConfig>,
    keys: Option<Arc<KeyMaterial>>,
    abort: Arc<AtomicBool>,
}

impl fmt::Debug for TransferEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferEngine")
            .field("config", &self.config)
            .field("keys", &self.keys)
            .field("aborted", &self.abort.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl TransferEngine {
    /// Validates `config` and loads any RSA keys it names.
    pub fn new(store: Arc<dyn BlobStore>, config: TransferConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let keys = KeyMaterial::from_config(&config)?.map(Arc::new);
        Ok(Self {
            store,
            config: Arc::new(config),
            keys,
            abort: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Uses already-loaded key material instead of the configured PEM files.
    #[must_use]
    pub fn with_keys(mut self, keys: KeyMaterial) -> Self {
        self.keys = Some(Arc::new(keys));
        self
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Handle for cancelling runs from another thread.
    ///
    /// Aborting is sticky: once set (by the handle or by a run-fatal worker
    /// error) every later run on this engine returns
    /// [`TransferError::Aborted`].
    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle::from_flag(Arc::clone(&self.abort))
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::from_config(&self.config).with_abort_flag(Arc::clone(&self.abort))
    }

    /// Uploads a file or directory.
    ///
    /// A file goes to `remote_name` (default: its file name). A directory is
    /// mirrored with names relative to it, or to its parent with
    /// `keep_root_dir`; `remote_name` then acts as a prefix.
    pub fn upload(
        &self,
        local: &Path,
        remote_name: Option<&str>,
    ) -> Result<TransferSummary, TransferError> {
        let objects = self.upload_objects(local, remote_name)?;
        self.run(Direction::Upload, objects)
    }

    /// Downloads one object, or the whole container when `remote_name` is
    /// `"."`.
    pub fn download(&self, remote_name: &str, local: &Path) -> Result<TransferSummary, TransferError> {
        let objects = self.download_objects(remote_name, local)?;
        self.run(Direction::Download, objects)
    }

    /// Expands a local path into upload objects.
    pub fn upload_objects(
        &self,
        local: &Path,
        remote_name: Option<&str>,
    ) -> Result<Vec<TransferObject>, TransferError> {
        if local.is_file() {
            let name = match remote_name {
                Some(name) => name.to_string(),
                None => local
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .ok_or_else(|| ConfigError::MissingLocalResource(local.to_path_buf()))?,
            };
            return Ok(vec![TransferObject::upload(local, name)]);
        }
        if !local.is_dir() {
            return Err(ConfigError::MissingLocalResource(local.to_path_buf()).into());
        }

        let base = match (self.config.keep_root_dir, local.parent()) {
            (true, Some(parent)) => parent,
            _ => local,
        };
        let max_depth = if self.config.recursive { usize::MAX } else { 1 };
        let prefix = remote_name.map(|p| p.trim_end_matches('/')).filter(|p| !p.is_empty());

        let mut objects = Vec::new();
        for entry in WalkDir::new(local)
            .max_depth(max_depth)
            .sort_by_file_name()
        {
            let entry = entry.map_err(|e| {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| local.to_path_buf());
                TransferError::io(
                    ObjectContext::new().with_local_path(path),
                    e.into_io_error()
                        .unwrap_or_else(|| std::io::Error::other("directory walk failed")),
                )
            })?;
            if !entry.file_type().is_file() || is_temp_file(entry.path()) {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(base) else {
                continue;
            };
            let relative = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            let name = match prefix {
                Some(prefix) => format!("{prefix}/{relative}"),
                None => relative,
            };
            objects.push(TransferObject::upload(entry.path(), name));
        }
        debug!(root = ?local, objects = objects.len(), "Collected upload objects");
        Ok(objects)
    }

    /// Expands a remote name into download objects.
    pub fn download_objects(
        &self,
        remote_name: &str,
        local: &Path,
    ) -> Result<Vec<TransferObject>, TransferError> {
        if remote_name == CONTAINER_WILDCARD {
            let retry = self.retry_policy();
            let listing = retry
                .run("list_objects", || {
                    store::list_all(self.store.as_ref(), &self.config.container, true)
                })
                .map_err(|e| TransferError::store("list_objects", ObjectContext::new(), e))?;
            let objects: Vec<TransferObject> = listing
                .into_iter()
                .map(|properties| {
                    let path = remote_to_local(local, &properties.name);
                    TransferObject::download(properties.name.clone(), path)
                        .with_remote_properties(properties)
                })
                .collect();
            debug!(container = %self.config.container, objects = objects.len(), "Listed container");
            return Ok(objects);
        }

        let path = if local.is_dir() {
            remote_to_local(local, remote_name.rsplit('/').next().unwrap_or(remote_name))
        } else {
            local.to_path_buf()
        };
        Ok(vec![TransferObject::download(remote_name, path)])
    }

    /// Plans, transfers and finalizes `objects`.
    ///
    /// Object-local failures end up in the summary. Any other failure aborts
    /// the run: the first error is returned once all workers have stopped.
    #[instrument(level = "debug", skip(self, objects), fields(container = %self.config.container, objects = objects.len()))]
    pub fn run(
        &self,
        direction: Direction,
        objects: Vec<TransferObject>,
    ) -> Result<TransferSummary, TransferError> {
        let started = Instant::now();
        let mut summary = TransferSummary::new(direction);
        summary.objects_total = objects.len();
        if self.abort.load(Ordering::Acquire) {
            return Err(TransferError::Aborted);
        }

        info!(
            %direction,
            objects = objects.len(),
            mode = %self.config.encryption_mode,
            blob_type = %self.config.blob_type,
            "Starting transfer"
        );

        let retry = self.retry_policy();
        let listing = self.skip_listing(direction, &retry)?;
        let planner = Planner::new(self.store.as_ref(), &self.config, &retry)
            .with_keys(self.keys.as_deref())
            .with_listing(listing.as_ref());

        let queue = Arc::new(ChunkQueue::new());
        for object in &objects {
            if self.abort.load(Ordering::Acquire) {
                return Err(TransferError::Aborted);
            }
            match planner.plan(object) {
                Ok(plan) if plan.is_skipped() => summary.objects_skipped += 1,
                Ok(plan) => {
                    summary.ops_total += plan.total_ops;
                    queue.extend(plan.instructions);
                }
                Err(err) if err.is_object_local() => {
                    warn!(remote = %object.remote_name, error = %err, "Planning failed");
                    let reason = err.to_string();
                    summary.record_failure(&object.remote_name, &object.local_path, reason, false);
                }
                Err(err) => return Err(err),
            }
        }

        if summary.ops_total > 0 {
            self.drain(queue, &retry, &mut summary)?;
        }

        summary.elapsed = started.elapsed();
        info!(
            transferred = summary.objects_transferred,
            skipped = summary.objects_skipped,
            failed = summary.failures.len(),
            bytes = summary.bytes_transferred,
            elapsed_ms = summary.elapsed.as_millis() as u64,
            "Transfer finished"
        );
        Ok(summary)
    }

    /// Remote listing for upload skip-on-match, fetched once per run.
    fn skip_listing(
        &self,
        direction: Direction,
        retry: &RetryPolicy,
    ) -> Result<Option<HashMap<String, BlobProperties>>, TransferError> {
        if direction != Direction::Upload
            || !self.config.skip_on_md5_match
            || !self.config.compute_file_md5
        {
            return Ok(None);
        }
        let entries = retry
            .run("list_objects", || {
                store::list_all(self.store.as_ref(), &self.config.container, true)
            })
            .map_err(|e| TransferError::store("list_objects", ObjectContext::new(), e))?;
        Ok(Some(
            entries.into_iter().map(|p| (p.name.clone(), p)).collect(),
        ))
    }

    /// Runs the worker pool over `queue` and finalizes objects as their last
    /// completion arrives.
    fn drain(
        &self,
        queue: Arc<ChunkQueue>,
        retry: &RetryPolicy,
        summary: &mut TransferSummary,
    ) -> Result<(), TransferError> {
        let workers = self
            .config
            .workers
            .min(usize::try_from(summary.ops_total).unwrap_or(usize::MAX))
            .max(1);
        let ctx = Arc::new(WorkerContext {
            store: Arc::clone(&self.store),
            config: Arc::clone(&self.config),
            retry: retry.clone(),
            abort: Arc::clone(&self.abort),
        });
        let (tx, rx) = unbounded();
        let mut pool = WorkerPool::spawn(workers, queue, ctx, tx)?;
        summary.workers = pool.worker_count();

        let mut outstanding = summary.ops_total;
        while outstanding > 0 {
            if pool.has_failed() {
                break;
            }
            let completion = match rx.recv_timeout(DRAIN_POLL_INTERVAL) {
                Ok(completion) => completion,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            };
            outstanding -= 1;
            summary.ops_completed += 1;
            summary.bytes_transferred += completion.bytes;
            trace!(
                remote = %completion.object.remote_name,
                sequence = completion.sequence,
                outstanding,
                "Chunk completed"
            );

            let object = &completion.object;
            if !object.record_completion() {
                continue;
            }
            match finalize(self.store.as_ref(), &self.config, retry, object) {
                Ok(FinalizeOutcome::Committed | FinalizeOutcome::Downloaded) => {
                    summary.objects_transferred += 1;
                }
                Ok(FinalizeOutcome::IntegrityMismatch { reason, .. }) => {
                    summary.record_failure(&object.remote_name, &object.local_path, reason, true);
                }
                Ok(FinalizeOutcome::Failed(reason)) => {
                    summary.record_failure(&object.remote_name, &object.local_path, reason, false);
                }
                Err(err) if err.is_object_local() => {
                    let reason = err.to_string();
                    summary.record_failure(&object.remote_name, &object.local_path, reason, false);
                }
                Err(err) => {
                    self.abort.store(true, Ordering::Release);
                    pool.join();
                    return Err(err);
                }
            }
        }

        let errors = pool.join();
        if let Some(err) = errors.into_iter().next() {
            return Err(err);
        }
        if outstanding > 0 {
            warn!(outstanding, "Transfer aborted before all chunks completed");
            return Err(TransferError::Aborted);
        }
        Ok(())
    }
}

fn is_temp_file(path: &Path) -> bool {
    path.to_string_lossy().ends_with(TEMP_FILE_SUFFIX)
}

/// Local path for a `/`-separated remote name under `root`.
fn remote_to_local(root: &Path, remote_name: &str) -> PathBuf {
    remote_name
        .split('/')
        .filter(|part| !part.is_empty() && *part != "." && *part != "..")
        .fold(root.to_path_buf(), |path, part| path.join(part))
}
