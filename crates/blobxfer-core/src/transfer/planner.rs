//! Transfer planning: one [`TransferObject`] in, ordered chunk instructions out.
//!
//! Planning does every check that can fail before chunk I/O starts: chunk
//! limits, skip-on-match, encryption metadata authentication. It also does
//! the per-object setup the workers rely on (key generation, page object
//! creation, temp file preallocation).

use std::{
    collections::HashMap,
    ffi::OsString,
    fs::{self, OpenOptions},
    path::{Path, PathBuf},
    sync::Arc,
};

use md5::{Digest, Md5};
use parking_lot::{Condvar, Mutex};
use ring::hmac;
use tracing::{debug, instrument};

use super::{
    Direction, TransferObject,
    instruction::{ChunkInstruction, ChunkOp, ObjectProgress, ObjectState},
};
use crate::{
    config::{
        BlobType, ConfigError, EncryptionMode, MAX_BLOCKS_PER_BLOB, MAX_PAGE_BLOB_SIZE_BYTES,
        PAGE_SIZE_BYTES, TEMP_FILE_SUFFIX, TransferConfig,
    },
    crypto::{
        AES_BLOCK_SIZE, CryptoError, IV_SIZE, MAC_SIZE,
        cipher::{per_chunk_plaintext_size, sealed_len},
        keys::KeyMaterial,
        metadata::{ChunkLayout, EncryptionParams, METADATA_KEY},
    },
    error::{ObjectContext, TransferError},
    integrity,
    store::{BlobProperties, BlobStore, retry::RetryPolicy},
};

/// Result of planning one object.
#[derive(Debug)]
pub struct Plan {
    pub total_ops: u64,
    pub instructions: Vec<ChunkInstruction>,
    /// `None` when the object was skipped.
    pub state: Option<Arc<ObjectState>>,
}

impl Plan {
    fn skipped() -> Self {
        Self {
            total_ops: 0,
            instructions: Vec::new(),
            state: None,
        }
    }

    pub fn is_skipped(&self) -> bool {
        self.total_ops == 0
    }
}

/// Size of `len` rounded up to whole pages.
pub fn page_aligned(len: u64) -> u64 {
    len.div_ceil(PAGE_SIZE_BYTES) * PAGE_SIZE_BYTES
}

/// `<local>.blobtmp`
pub fn temp_path(local: &Path) -> PathBuf {
    let mut name = OsString::from(local.as_os_str());
    name.push(TEMP_FILE_SUFFIX);
    PathBuf::from(name)
}

/// Byte range of one chunk before it is mapped to a REST operation.
struct ChunkSpan {
    offset: u64,
    length: u64,
}

fn chunk_spans(total: u64, chunk: u64) -> impl Iterator<Item = ChunkSpan> {
    (0..total.div_ceil(chunk)).map(move |i| {
        let offset = i * chunk;
        ChunkSpan {
            offset,
            length: chunk.min(total - offset),
        }
    })
}

pub struct Planner<'a> {
    store: &'a dyn BlobStore,
    config: &'a TransferConfig,
    retry: &'a RetryPolicy,
    keys: Option<&'a KeyMaterial>,
    listing: Option<&'a HashMap<String, BlobProperties>>,
}

impl<'a> Planner<'a> {
    pub fn new(store: &'a dyn BlobStore, config: &'a TransferConfig, retry: &'a RetryPolicy) -> Self {
        Self {
            store,
            config,
            retry,
            keys: None,
            listing: None,
        }
    }

    #[must_use]
    pub fn with_keys(mut self, keys: Option<&'a KeyMaterial>) -> Self {
        self.keys = keys;
        self
    }

    /// Remote listing used for upload skip-on-match.
    #[must_use]
    pub fn with_listing(mut self, listing: Option<&'a HashMap<String, BlobProperties>>) -> Self {
        self.listing = listing;
        self
    }

    #[instrument(level = "debug", skip(self, object), fields(remote = %object.remote_name, direction = %object.direction))]
    pub fn plan(&self, object: &TransferObject) -> Result<Plan, TransferError> {
        let plan = match object.direction {
            Direction::Upload => self.plan_upload(object)?,
            Direction::Download => self.plan_download(object)?,
        };
        debug!(total_ops = plan.total_ops, "Planned object");
        Ok(plan)
    }

    fn plan_upload(&self, object: &TransferObject) -> Result<Plan, TransferError> {
        let config = self.config;
        let context = ObjectContext::new()
            .with_remote_name(&object.remote_name)
            .with_local_path(&object.local_path);
        let io_error = |e| TransferError::io(context.clone(), e);

        let size = fs::metadata(&object.local_path).map_err(io_error)?.len();
        let mode = config.encryption_mode;
        let blob_type = config.blob_type;
        let chunk_size = config.chunk_size();

        let material = if mode.is_encrypted() {
            Some(
                self.keys
                    .filter(|k| k.can_wrap())
                    .ok_or(ConfigError::MissingKey("public"))?,
            )
        } else {
            None
        };

        let payload_chunk = match mode {
            EncryptionMode::PerChunk => per_chunk_plaintext_size(chunk_size),
            _ => chunk_size,
        };
        let num_chunks = size.div_ceil(payload_chunk).max(1);
        match blob_type {
            BlobType::Block if num_chunks > MAX_BLOCKS_PER_BLOB => {
                return Err(ConfigError::TooManyChunks {
                    name: object.remote_name.clone(),
                    chunks: num_chunks,
                    limit: MAX_BLOCKS_PER_BLOB,
                }
                .into());
            }
            BlobType::Page if page_aligned(size) > MAX_PAGE_BLOB_SIZE_BYTES => {
                return Err(ConfigError::ObjectTooLarge {
                    name: object.remote_name.clone(),
                    size,
                    limit: MAX_PAGE_BLOB_SIZE_BYTES,
                }
                .into());
            }
            _ => {}
        }

        let file_md5 = if config.compute_file_md5 {
            Some(
                integrity::file_md5(&object.local_path, blob_type == BlobType::Page)
                    .map_err(io_error)?,
            )
        } else {
            None
        };

        if config.skip_on_md5_match
            && let Some(md5) = &file_md5
            && integrity::upload_matches(
                md5,
                self.listing.and_then(|l| l.get(&object.remote_name)),
                mode.is_encrypted(),
            )
        {
            debug!("Remote object already matches, skipping upload");
            return Ok(Plan::skipped());
        }

        let encryption = match material {
            Some(material) => {
                let layout = match mode {
                    EncryptionMode::PerChunk => ChunkLayout {
                        plaintext_chunk_size_bytes: payload_chunk,
                        encrypted_chunk_size_bytes: sealed_len(payload_chunk),
                    },
                    _ => ChunkLayout {
                        plaintext_chunk_size_bytes: chunk_size,
                        encrypted_chunk_size_bytes: chunk_size,
                    },
                };
                Some(
                    EncryptionParams::for_upload(mode, layout, material)
                        .map_err(|e| TransferError::crypto(context.clone(), e))?,
                )
            }
            None => None,
        };

        let mut progress = ObjectProgress::default();
        if let Some(params) = &encryption
            && let Some(iv) = params.iv
        {
            let mut mac = hmac::Context::with_key(&params.keys.hmac_key());
            mac.update(&iv);
            progress.stream_mac = Some(mac);
            progress.stream_md5 = Some(Md5::new());
            progress.ivs.insert(0, iv);
        }

        let empty = size == 0 && encryption.is_none();
        let spans: Vec<ChunkSpan> = if size == 0 {
            vec![ChunkSpan {
                offset: 0,
                length: 0,
            }]
        } else {
            chunk_spans(size, payload_chunk).collect()
        };
        let ops: Vec<ChunkOp> = spans
            .iter()
            .enumerate()
            .map(|(seq, span)| match (empty, blob_type) {
                (true, _) => ChunkOp::Empty,
                (false, BlobType::Block) => ChunkOp::PutBlock {
                    block_id: format!("{seq:08}"),
                },
                (false, BlobType::Page) => ChunkOp::PutPage {
                    start: span.offset,
                    end: span.offset + page_aligned(span.length) - 1,
                },
            })
            .collect();
        let block_ids = ops
            .iter()
            .filter_map(|op| match op {
                ChunkOp::PutBlock { block_id } => Some(block_id.clone()),
                _ => None,
            })
            .collect();

        if blob_type == BlobType::Page {
            let page_size = page_aligned(size);
            self.retry
                .run("create_page_object", || {
                    self.store
                        .create_page_object(&config.container, &object.remote_name, page_size)
                })
                .map_err(|e| TransferError::store("create_page_object", context.clone(), e))?;
        }

        let state = Arc::new(ObjectState {
            direction: Direction::Upload,
            remote_name: object.remote_name.clone(),
            local_path: object.local_path.clone(),
            work_path: object.local_path.clone(),
            blob_type,
            encryption,
            total_ops: ops.len() as u64,
            block_ids,
            file_md5,
            remote_md5: None,
            stored_length: size,
            progress: Mutex::new(progress),
            iv_ready: Condvar::new(),
        });

        Ok(Self::into_plan(&state, spans, ops))
    }

    fn plan_download(&self, object: &TransferObject) -> Result<Plan, TransferError> {
        let config = self.config;
        let context = ObjectContext::new()
            .with_remote_name(&object.remote_name)
            .with_local_path(&object.local_path);
        let io_error = |e| TransferError::io(context.clone(), e);

        let properties = match &object.remote {
            Some(properties) => properties.clone(),
            None => self
                .retry
                .run("head_object", || {
                    self.store.head_object(&config.container, &object.remote_name)
                })
                .map_err(|e| TransferError::store("head_object", context.clone(), e))?,
        };

        let encryption = if properties.metadata.contains_key(METADATA_KEY) {
            let material = self
                .keys
                .filter(|k| k.can_unwrap())
                .ok_or(ConfigError::MissingKey("private"))?;
            EncryptionParams::from_metadata(&properties.metadata, material)
                .map_err(|e| TransferError::metadata(context.clone(), e))?
        } else {
            None
        };

        if config.skip_on_md5_match && config.compute_file_md5 {
            let expected = match &encryption {
                Some(params) => params.pre_encrypted_md5.as_deref(),
                None => properties.content_md5.as_deref(),
            };
            if integrity::download_matches(&object.local_path, expected).map_err(io_error)? {
                debug!("Local file already matches, skipping download");
                return Ok(Plan::skipped());
            }
        }

        let stored = properties.length;
        let crypto_error = |e| TransferError::crypto(context.clone(), e);
        let mut progress = ObjectProgress::default();
        let (spans, ops): (Vec<ChunkSpan>, Vec<ChunkOp>) = match &encryption {
            None if stored == 0 => (
                vec![ChunkSpan {
                    offset: 0,
                    length: 0,
                }],
                vec![ChunkOp::Empty],
            ),
            None => chunk_spans(stored, config.chunk_size())
                .map(|span| {
                    let op = ChunkOp::GetRange {
                        start: span.offset,
                        end: span.offset + span.length - 1,
                        leading_iv: false,
                    };
                    (span, op)
                })
                .unzip(),
            Some(params) => {
                let minimum = (IV_SIZE + AES_BLOCK_SIZE + MAC_SIZE) as u64;
                match params.mode {
                    EncryptionMode::PerChunk => {
                        if stored < minimum || stored % AES_BLOCK_SIZE as u64 != 0 {
                            return Err(crypto_error(CryptoError::InvalidCiphertextLength {
                                len: stored as usize,
                            }));
                        }
                        let stride = params.layout.encrypted_chunk_size_bytes;
                        let plain = params.layout.plaintext_chunk_size_bytes;
                        chunk_spans(stored, stride)
                            .enumerate()
                            .map(|(i, sealed)| {
                                let op = ChunkOp::GetRange {
                                    start: sealed.offset,
                                    end: sealed.offset + sealed.length - 1,
                                    leading_iv: false,
                                };
                                let span = ChunkSpan {
                                    offset: i as u64 * plain,
                                    length: plain,
                                };
                                (span, op)
                            })
                            .unzip()
                    }
                    _ => {
                        if stored == 0 || stored % AES_BLOCK_SIZE as u64 != 0 {
                            return Err(crypto_error(CryptoError::InvalidCiphertextLength {
                                len: stored as usize,
                            }));
                        }
                        if let Some(iv) = params.iv {
                            let mut mac = hmac::Context::with_key(&params.keys.hmac_key());
                            mac.update(&iv);
                            progress.stream_mac = Some(mac);
                        }
                        let block = AES_BLOCK_SIZE as u64;
                        let chunk = (config.chunk_size() / block * block).max(block);
                        chunk_spans(stored, chunk)
                            .map(|span| {
                                let leading_iv = span.offset > 0;
                                let op = ChunkOp::GetRange {
                                    start: if leading_iv {
                                        span.offset - IV_SIZE as u64
                                    } else {
                                        span.offset
                                    },
                                    end: span.offset + span.length - 1,
                                    leading_iv,
                                };
                                (span, op)
                            })
                            .unzip()
                    }
                }
            }
        };

        let work_path = temp_path(&object.local_path);
        if let Some(parent) = object.local_path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(io_error)?;
        }
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&work_path)
            .and_then(|file| file.set_len(stored))
            .map_err(io_error)?;

        let state = Arc::new(ObjectState {
            direction: Direction::Download,
            remote_name: object.remote_name.clone(),
            local_path: object.local_path.clone(),
            work_path,
            blob_type: properties.blob_type,
            encryption,
            total_ops: ops.len() as u64,
            block_ids: Vec::new(),
            file_md5: None,
            remote_md5: properties.content_md5.clone(),
            stored_length: stored,
            progress: Mutex::new(progress),
            iv_ready: Condvar::new(),
        });

        Ok(Self::into_plan(&state, spans, ops))
    }

    fn into_plan(state: &Arc<ObjectState>, spans: Vec<ChunkSpan>, ops: Vec<ChunkOp>) -> Plan {
        let total = ops.len() as u64;
        let instructions = spans
            .into_iter()
            .zip(ops)
            .enumerate()
            .map(|(seq, (span, op))| ChunkInstruction {
                sequence: seq as u64,
                offset: span.offset,
                length: span.length,
                op,
                final_chunk: seq as u64 + 1 == total,
                object: Arc::clone(state),
            })
            .collect();
        Plan {
            total_ops: total,
            instructions,
            state: Some(Arc::clone(state)),
        }
    }
}
