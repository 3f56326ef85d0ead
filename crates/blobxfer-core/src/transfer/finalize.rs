//! Per-object finalization.
//!
//! Runs once per object, on the engine thread, after the last chunk
//! completion. Uploads are committed (block list or page properties) and
//! tagged with encryption metadata. Downloads are truncated, verified and
//! moved from the `.blobtmp` path to their destination.

use std::{fs, io, path::Path};

use subtle::ConstantTimeEq;
use tracing::{debug, info, instrument, warn};

use super::{Direction, instruction::ObjectState};
use crate::{
    config::{BlobType, EncryptionMode, TransferConfig},
    crypto::metadata::EncryptionParams,
    error::{ObjectContext, TransferError},
    integrity,
    store::{BlobStore, ContentSettings, retry::RetryPolicy},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizeOutcome {
    /// Upload committed remotely.
    Committed,
    /// Download verified and moved into place.
    Downloaded,
    /// Download completed but failed verification.
    IntegrityMismatch { reason: String, kept: bool },
    /// A chunk of this object failed; nothing was committed.
    Failed(String),
}

/// Commits or verifies one fully transferred object.
#[instrument(level = "debug", skip_all, fields(remote = %state.remote_name, direction = %state.direction))]
pub fn finalize(
    store: &dyn BlobStore,
    config: &TransferConfig,
    retry: &RetryPolicy,
    state: &ObjectState,
) -> Result<FinalizeOutcome, TransferError> {
    let failure = state.lock().failure.clone();
    if let Some(reason) = failure {
        if state.direction == Direction::Download {
            discard_temp(state);
        }
        warn!(%reason, "Object failed, not finalizing");
        return Ok(FinalizeOutcome::Failed(reason));
    }

    match state.direction {
        Direction::Upload => commit_upload(store, config, retry, state),
        Direction::Download => complete_download(config, state),
    }
}

fn commit_upload(
    store: &dyn BlobStore,
    config: &TransferConfig,
    retry: &RetryPolicy,
    state: &ObjectState,
) -> Result<FinalizeOutcome, TransferError> {
    let context = state.context();
    let container = config.container.as_str();
    let name = state.remote_name.as_str();

    let (mac, stream_md5) = {
        let mut progress = state.lock();
        let mac = progress.stream_mac.take().map(|ctx| ctx.sign().as_ref().to_vec());
        let md5 = progress.stream_md5.take().map(integrity::finish_md5);
        (mac, md5)
    };

    match state.blob_type {
        BlobType::Block => {
            let content_md5 = match state.encryption.as_ref().map(|p| p.mode) {
                None | Some(EncryptionMode::None) => state.file_md5.clone().or_else(|| {
                    (state.stored_length == 0).then(integrity::empty_md5)
                }),
                Some(EncryptionMode::FullObject) => stream_md5,
                Some(EncryptionMode::PerChunk) => None,
            };
            let settings = ContentSettings::with_md5(content_md5);
            retry
                .run("put_block_list", || {
                    store.put_block_list(container, name, &state.block_ids, &settings)
                })
                .map_err(|e| TransferError::store("put_block_list", context.clone(), e))?;
        }
        BlobType::Page => {
            let content_md5 = state
                .file_md5
                .clone()
                .or_else(|| (state.stored_length == 0).then(integrity::empty_md5));
            let settings = ContentSettings::with_md5(content_md5);
            retry
                .run("set_properties", || store.set_properties(container, name, &settings))
                .map_err(|e| TransferError::store("set_properties", context.clone(), e))?;
        }
    }

    if let Some(params) = &state.encryption {
        let metadata = params
            .to_metadata(mac.as_deref(), state.file_md5.as_deref())
            .map_err(|e| TransferError::metadata(context.clone(), e))?;
        retry
            .run("set_metadata", || store.set_metadata(container, name, &metadata))
            .map_err(|e| TransferError::store("set_metadata", context.clone(), e))?;
    }

    info!(
        blocks = state.block_ids.len(),
        bytes = state.stored_length,
        encrypted = state.encryption.is_some(),
        "Upload committed"
    );
    Ok(FinalizeOutcome::Committed)
}

fn complete_download(
    config: &TransferConfig,
    state: &ObjectState,
) -> Result<FinalizeOutcome, TransferError> {
    let context = state.context();
    let io_error = |e| TransferError::io(context.clone(), e);

    let mac = {
        let mut progress = state.lock();
        let length = match state.encryption {
            Some(_) => progress.plaintext_len,
            None => state.stored_length,
        };
        let file = fs::OpenOptions::new()
            .write(true)
            .open(&state.work_path)
            .map_err(io_error)?;
        file.set_len(length).map_err(io_error)?;
        file.sync_all().map_err(io_error)?;
        let complete = progress.pending_mac.is_empty() && progress.next_mac_sequence == state.total_ops;
        let mac = progress.stream_mac.take().map(|ctx| ctx.sign().as_ref().to_vec());
        mac.filter(|_| complete)
    };

    match verify_download(config, state, mac.as_deref()) {
        Ok(()) => {
            fs::rename(&state.work_path, &state.local_path).map_err(io_error)?;
            info!(path = ?state.local_path, "Download complete");
            Ok(FinalizeOutcome::Downloaded)
        }
        Err(TransferError::Integrity { reason, .. }) if config.keep_mismatched_files => {
            fs::rename(&state.work_path, &state.local_path).map_err(io_error)?;
            warn!(path = ?state.local_path, %reason, "Integrity check failed, keeping file");
            Ok(FinalizeOutcome::IntegrityMismatch { reason, kept: true })
        }
        Err(TransferError::Integrity { reason, .. }) => {
            discard_temp(state);
            warn!(path = ?state.local_path, %reason, "Integrity check failed, file removed");
            Ok(FinalizeOutcome::IntegrityMismatch {
                reason,
                kept: false,
            })
        }
        Err(err) => Err(err),
    }
}

/// Checks the downloaded temp file. A mismatch is reported as
/// [`TransferError::Integrity`].
fn verify_download(
    config: &TransferConfig,
    state: &ObjectState,
    mac: Option<&[u8]>,
) -> Result<(), TransferError> {
    let context = state.context();
    let check_md5 = |expected: &str| {
        match md5_mismatch(&state.work_path, expected)
            .map_err(|e| TransferError::io(context.clone(), e))?
        {
            Some(reason) => Err(TransferError::Integrity {
                context: context.clone(),
                reason,
            }),
            None => Ok(()),
        }
    };

    let Some(params) = &state.encryption else {
        return match (&state.remote_md5, config.compute_file_md5) {
            (Some(expected), true) => check_md5(expected),
            _ => {
                debug!("No content MD5 to verify against");
                Ok(())
            }
        };
    };

    if params.mode == EncryptionMode::FullObject
        && let Some(reason) = mac_mismatch(params, mac)
    {
        return Err(TransferError::Integrity { context, reason });
    }

    match (&params.pre_encrypted_md5, config.compute_file_md5) {
        (Some(expected), true) => check_md5(expected),
        _ => Ok(()),
    }
}

fn mac_mismatch(params: &EncryptionParams, computed: Option<&[u8]>) -> Option<String> {
    let Some(expected) = params.expected_mac.as_deref() else {
        return Some("no stored stream MAC".to_string());
    };
    let Some(computed) = computed else {
        return Some("stream MAC incomplete".to_string());
    };
    if bool::from(computed.ct_eq(expected)) {
        debug!("Stream MAC verified");
        None
    } else {
        Some("stream MAC mismatch".to_string())
    }
}

fn md5_mismatch(path: &Path, expected: &str) -> io::Result<Option<String>> {
    let actual = integrity::file_md5(path, false)?;
    if actual == expected {
        debug!(md5 = %actual, "Content MD5 verified");
        Ok(None)
    } else {
        Ok(Some(format!("MD5 mismatch: expected {expected}, got {actual}")))
    }
}

fn discard_temp(state: &ObjectState) {
    if let Err(err) = fs::remove_file(&state.work_path)
        && err.kind() != io::ErrorKind::NotFound
    {
        let context = ObjectContext::new().with_local_path(&state.work_path);
        warn!(%context, error = %err, "Failed to remove temporary file");
    }
}

#[cfg(test)]
mod tests {
    use std::{io::Write, path::PathBuf, sync::Arc};

    use super::*;
    use crate::{
        crypto::{
            cipher,
            keys::{KeyMaterial, test_keys},
        },
        integrity::md5_base64,
        store::memory::MemoryBlobStore,
        transfer::{
            TransferObject,
            planner::{Planner, temp_path},
            worker::{WorkerContext, process_instruction},
        },
    };

    struct Harness {
        store: Arc<MemoryBlobStore>,
        ctx: WorkerContext,
        keys: KeyMaterial,
    }

    impl Harness {
        fn new(config: TransferConfig) -> Self {
            let store = Arc::new(MemoryBlobStore::new());
            let ctx = WorkerContext {
                store: store.clone(),
                config: Arc::new(config),
                retry: RetryPolicy::default(),
                abort: Arc::default(),
            };
            Self {
                store,
                ctx,
                keys: KeyMaterial::from_private_key(test_keys::private_key()),
            }
        }

        /// Plans and runs every chunk in order, then finalizes.
        fn transfer(&self, object: &TransferObject) -> (Arc<ObjectState>, FinalizeOutcome) {
            let plan = Planner::new(self.store.as_ref(), &self.ctx.config, &self.ctx.retry)
                .with_keys(Some(&self.keys))
                .plan(object)
                .unwrap();
            let state = plan.state.clone().unwrap();
            let mut last = false;
            for instruction in &plan.instructions {
                process_instruction(&self.ctx, instruction).unwrap();
                last = state.record_completion();
            }
            assert!(last);
            let outcome =
                finalize(self.store.as_ref(), &self.ctx.config, &self.ctx.retry, &state).unwrap();
            (state, outcome)
        }
    }

    fn write_file(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.join(name);
        fs::File::create(&path).unwrap().write_all(data).unwrap();
        path
    }

    #[test]
    fn test_block_upload_commits_with_file_md5() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "f", b"0123456789");
        let harness = Harness::new(TransferConfig::new("c").with_chunk_size(4));

        let (_, outcome) = harness.transfer(&TransferObject::upload(&path, "f"));
        assert_eq!(outcome, FinalizeOutcome::Committed);
        assert_eq!(harness.store.object_data("c", "f").unwrap(), b"0123456789");
        assert_eq!(harness.store.block_list_commits("c", "f"), 1);
        let props = harness.store.head_object("c", "f").unwrap();
        assert_eq!(props.content_md5, Some(md5_base64(b"0123456789")));
    }

    #[test]
    fn test_empty_upload_commits_empty_md5() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "e", b"");
        let harness = Harness::new(TransferConfig::new("c").with_file_md5(false));

        let (_, outcome) = harness.transfer(&TransferObject::upload(&path, "e"));
        assert_eq!(outcome, FinalizeOutcome::Committed);
        let props = harness.store.head_object("c", "e").unwrap();
        assert_eq!(props.length, 0);
        assert_eq!(props.content_md5, Some(integrity::empty_md5()));
    }

    #[test]
    fn test_empty_page_upload_commits_empty_md5() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "p", b"");
        let harness = Harness::new(
            TransferConfig::new("c")
                .with_blob_type(BlobType::Page)
                .with_file_md5(false),
        );

        let (_, outcome) = harness.transfer(&TransferObject::upload(&path, "p"));
        assert_eq!(outcome, FinalizeOutcome::Committed);
        let props = harness.store.head_object("c", "p").unwrap();
        assert_eq!(props.blob_type, BlobType::Page);
        assert_eq!(props.length, 0);
        assert_eq!(props.content_md5, Some(integrity::empty_md5()));
    }

    #[test]
    fn test_full_object_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let data: Vec<u8> = (0..=255u8).cycle().take(1000).collect();
        let path = write_file(dir.path(), "f", &data);
        let harness = Harness::new(
            TransferConfig::new("c")
                .with_chunk_size(96)
                .with_encryption(EncryptionMode::FullObject),
        );

        let (_, outcome) = harness.transfer(&TransferObject::upload(&path, "f"));
        assert_eq!(outcome, FinalizeOutcome::Committed);
        let stored = harness.store.object_data("c", "f").unwrap();
        assert_eq!(stored.len() as u64, cipher::padded_len(1000));
        let props = harness.store.head_object("c", "f").unwrap();
        assert_eq!(props.content_md5, Some(md5_base64(&stored)));

        let out = dir.path().join("out").join("f");
        let (_, outcome) = harness.transfer(&TransferObject::download("f", &out));
        assert_eq!(outcome, FinalizeOutcome::Downloaded);
        assert_eq!(fs::read(&out).unwrap(), data);
        assert!(!temp_path(&out).exists());
    }

    #[test]
    fn test_per_chunk_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let data = vec![42u8; 100];
        let path = write_file(dir.path(), "f", &data);
        let harness = Harness::new(
            TransferConfig::new("c")
                .with_chunk_size(64)
                .with_encryption(EncryptionMode::PerChunk),
        );

        harness.transfer(&TransferObject::upload(&path, "f"));
        // 100 bytes in 15-byte pieces: 7 sealed chunks of 64 bytes.
        assert_eq!(harness.store.object_data("c", "f").unwrap().len(), 7 * 64);

        let out = dir.path().join("f.out");
        let (_, outcome) = harness.transfer(&TransferObject::download("f", &out));
        assert_eq!(outcome, FinalizeOutcome::Downloaded);
        assert_eq!(fs::read(&out).unwrap(), data);
    }

    #[test]
    fn test_tampered_full_object_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "f", &[7u8; 200]);
        let harness = Harness::new(
            TransferConfig::new("c")
                .with_chunk_size(64)
                .with_encryption(EncryptionMode::FullObject),
        );
        harness.transfer(&TransferObject::upload(&path, "f"));

        // Flip a bit in the first block: decryption still succeeds, the
        // stream MAC does not.
        let mut stored = harness.store.object_data("c", "f").unwrap();
        stored[3] ^= 0x80;
        harness.store.overwrite_data("c", "f", stored);

        let out = dir.path().join("f.out");
        let (_, outcome) = harness.transfer(&TransferObject::download("f", &out));
        assert!(matches!(
            outcome,
            FinalizeOutcome::IntegrityMismatch { kept: false, .. }
        ));
        assert!(!out.exists());
        assert!(!temp_path(&out).exists());
    }

    #[test]
    fn test_mismatched_plain_download_can_be_kept() {
        let dir = tempfile::tempdir().unwrap();
        let harness = Harness::new(TransferConfig::new("c").with_keep_mismatched_files(true));
        harness.store.insert_object(
            "c",
            "f",
            b"actual".to_vec(),
            BlobType::Block,
            Some(md5_base64(b"expected")),
            Default::default(),
        );

        let out = dir.path().join("f");
        let (_, outcome) = harness.transfer(&TransferObject::download("f", &out));
        assert!(matches!(
            outcome,
            FinalizeOutcome::IntegrityMismatch { kept: true, .. }
        ));
        assert_eq!(fs::read(&out).unwrap(), b"actual");
    }

    #[test]
    fn test_md5_mismatch_is_integrity_error() {
        let dir = tempfile::tempdir().unwrap();
        let harness = Harness::new(TransferConfig::new("c"));
        harness.store.insert_object(
            "c",
            "f",
            b"actual".to_vec(),
            BlobType::Block,
            Some(md5_base64(b"expected")),
            Default::default(),
        );
        let plan = Planner::new(harness.store.as_ref(), &harness.ctx.config, &harness.ctx.retry)
            .plan(&TransferObject::download("f", dir.path().join("f")))
            .unwrap();
        for instruction in &plan.instructions {
            process_instruction(&harness.ctx, instruction).unwrap();
        }

        let state = plan.state.unwrap();
        let err = verify_download(&harness.ctx.config, &state, None).unwrap_err();
        assert!(err.is_object_local());
        match err {
            TransferError::Integrity { context, reason } => {
                assert_eq!(context.remote_name.as_deref(), Some("f"));
                assert!(reason.starts_with("MD5 mismatch"), "{reason}");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_failed_object_is_not_committed() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "f", b"abcdefgh");
        let harness = Harness::new(TransferConfig::new("c").with_chunk_size(4));
        let plan = Planner::new(harness.store.as_ref(), &harness.ctx.config, &harness.ctx.retry)
            .plan(&TransferObject::upload(&path, "f"))
            .unwrap();
        let state = plan.state.unwrap();
        state.mark_failed("chunk 0 failed".into());

        let outcome = finalize(
            harness.store.as_ref(),
            &harness.ctx.config,
            &harness.ctx.retry,
            &state,
        )
        .unwrap();
        assert_eq!(outcome, FinalizeOutcome::Failed("chunk 0 failed".into()));
        assert!(harness.store.object_names("c").is_empty());
    }
}
