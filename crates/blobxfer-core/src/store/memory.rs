//! In-memory [`BlobStore`] with latency and fault injection.
//!
//! Behaves like the block/page REST service closely enough to exercise the
//! engine end to end: staged blocks stay invisible until committed, page
//! writes must be 512-byte aligned, per-call MD5s are verified and listings
//! are paginated.

use std::{
    collections::{BTreeMap, HashMap},
    ops::RangeInclusive,
    sync::atomic::{AtomicU32, AtomicU64, Ordering},
    thread,
    time::Duration,
};

use parking_lot::Mutex;
use rand::Rng;

use super::{BlobProperties, BlobStore, ContentSettings, ListPage, StoreError};
use crate::{
    config::{BlobType, MAX_CHUNK_SIZE_BYTES, MAX_PAGE_BLOB_SIZE_BYTES, PAGE_SIZE_BYTES},
    integrity::md5_base64,
};

/// Listing page size used by the service.
pub const DEFAULT_PAGE_RESULTS: usize = 1000;

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    blob_type: BlobType,
    content_md5: Option<String>,
    metadata: HashMap<String, String>,
}

type ObjectKey = (String, String);

#[derive(Debug, Default)]
struct StoreState {
    objects: BTreeMap<ObjectKey, StoredObject>,
    staged: HashMap<ObjectKey, HashMap<String, Vec<u8>>>,
    block_list_commits: HashMap<ObjectKey, u32>,
    page_writes: Vec<u64>,
}

/// Per-operation call counters.
#[derive(Debug, Default)]
pub struct MemoryStoreStats {
    pub list_objects: AtomicU64,
    pub head_object: AtomicU64,
    pub get_range: AtomicU64,
    pub put_block: AtomicU64,
    pub put_block_list: AtomicU64,
    pub create_page_object: AtomicU64,
    pub put_page: AtomicU64,
    pub set_properties: AtomicU64,
    pub set_metadata: AtomicU64,
    pub delete_object: AtomicU64,
    pub injected_faults: AtomicU64,
}

impl MemoryStoreStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}

/// Thread-safe in-process blob service.
#[derive(Debug)]
pub struct MemoryBlobStore {
    state: Mutex<StoreState>,
    latency: Option<RangeInclusive<u64>>,
    page_results: usize,
    pending_faults: AtomicU32,
    fault_status: AtomicU32,
    stats: MemoryStoreStats,
}

impl Default for MemoryBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(StoreState::default()),
            latency: None,
            page_results: DEFAULT_PAGE_RESULTS,
            pending_faults: AtomicU32::new(0),
            fault_status: AtomicU32::new(503),
            stats: MemoryStoreStats::default(),
        }
    }

    /// Sleeps a random duration in `[min, max]` before every call.
    #[must_use]
    pub fn with_latency(mut self, min: Duration, max: Duration) -> Self {
        let min = min.as_micros() as u64;
        let max = (max.as_micros() as u64).max(min);
        self.latency = Some(min..=max);
        self
    }

    /// Number of entries returned per listing page.
    #[must_use]
    pub fn with_page_results(mut self, page_results: usize) -> Self {
        self.page_results = page_results.max(1);
        self
    }

    /// Fails the next `count` calls with HTTP `status`.
    pub fn fail_next(&self, count: u32, status: u16) {
        self.fault_status.store(u32::from(status), Ordering::SeqCst);
        self.pending_faults.store(count, Ordering::SeqCst);
    }

    pub fn stats(&self) -> &MemoryStoreStats {
        &self.stats
    }

    /// Stores a committed object directly, bypassing the block protocol.
    pub fn insert_object(
        &self,
        container: &str,
        name: &str,
        data: Vec<u8>,
        blob_type: BlobType,
        content_md5: Option<String>,
        metadata: HashMap<String, String>,
    ) {
        self.state.lock().objects.insert(
            key(container, name),
            StoredObject {
                data,
                blob_type,
                content_md5,
                metadata,
            },
        );
    }

    /// Committed bytes of an object.
    pub fn object_data(&self, container: &str, name: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .objects
            .get(&key(container, name))
            .map(|o| o.data.clone())
    }

    /// Replaces stored bytes without touching MD5 or metadata.
    pub fn overwrite_data(&self, container: &str, name: &str, data: Vec<u8>) -> bool {
        match self.state.lock().objects.get_mut(&key(container, name)) {
            Some(object) => {
                object.data = data;
                true
            }
            None => false,
        }
    }

    pub fn object_metadata(&self, container: &str, name: &str) -> Option<HashMap<String, String>> {
        self.state
            .lock()
            .objects
            .get(&key(container, name))
            .map(|o| o.metadata.clone())
    }

    pub fn object_names(&self, container: &str) -> Vec<String> {
        self.state
            .lock()
            .objects
            .keys()
            .filter(|(c, _)| c == container)
            .map(|(_, n)| n.clone())
            .collect()
    }

    /// How many times a block list was committed for the object.
    pub fn block_list_commits(&self, container: &str, name: &str) -> u32 {
        self.state
            .lock()
            .block_list_commits
            .get(&key(container, name))
            .copied()
            .unwrap_or(0)
    }

    /// Ids of blocks staged but not yet committed.
    pub fn staged_block_ids(&self, container: &str, name: &str) -> Vec<String> {
        let state = self.state.lock();
        let mut ids: Vec<String> = state
            .staged
            .get(&key(container, name))
            .map(|blocks| blocks.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    /// Payload lengths of every accepted page write, in arrival order.
    pub fn page_write_sizes(&self) -> Vec<u64> {
        self.state.lock().page_writes.clone()
    }

    fn before_call(&self, counter: &AtomicU64) -> Result<(), StoreError> {
        MemoryStoreStats::bump(counter);
        if let Some(range) = &self.latency {
            let micros = rand::rng().random_range(range.clone());
            thread::sleep(Duration::from_micros(micros));
        }
        let injected = self
            .pending_faults
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            MemoryStoreStats::bump(&self.stats.injected_faults);
            let status = self.fault_status.load(Ordering::SeqCst) as u16;
            return Err(StoreError::http(status, "injected fault"));
        }
        Ok(())
    }
}

fn key(container: &str, name: &str) -> ObjectKey {
    (container.to_string(), name.to_string())
}

fn check_md5(data: &[u8], md5: Option<&str>) -> Result<(), StoreError> {
    match md5 {
        Some(expected) if md5_base64(data) != expected => {
            Err(StoreError::http(400, "Md5Mismatch: payload MD5 does not match header"))
        }
        _ => Ok(()),
    }
}

fn properties(name: &str, object: &StoredObject, include_metadata: bool) -> BlobProperties {
    BlobProperties {
        name: name.to_string(),
        length: object.data.len() as u64,
        content_md5: object.content_md5.clone(),
        metadata: if include_metadata {
            object.metadata.clone()
        } else {
            HashMap::new()
        },
        blob_type: object.blob_type,
    }
}

impl BlobStore for MemoryBlobStore {
    fn list_objects(
        &self,
        container: &str,
        marker: Option<&str>,
        include_metadata: bool,
    ) -> Result<ListPage, StoreError> {
        self.before_call(&self.stats.list_objects)?;
        let state = self.state.lock();
        let mut matching = state
            .objects
            .iter()
            .filter(|((c, n), _)| c == container && marker.is_none_or(|m| n.as_str() >= m));

        let entries: Vec<BlobProperties> = matching
            .by_ref()
            .take(self.page_results)
            .map(|((_, n), o)| properties(n, o, include_metadata))
            .collect();
        let next_marker = matching.next().map(|((_, n), _)| n.clone());

        Ok(ListPage {
            entries,
            next_marker,
        })
    }

    fn head_object(&self, container: &str, name: &str) -> Result<BlobProperties, StoreError> {
        self.before_call(&self.stats.head_object)?;
        let state = self.state.lock();
        state
            .objects
            .get(&key(container, name))
            .map(|o| properties(name, o, true))
            .ok_or_else(|| StoreError::not_found(name))
    }

    fn get_range(
        &self,
        container: &str,
        name: &str,
        start: u64,
        end_inclusive: u64,
    ) -> Result<Vec<u8>, StoreError> {
        self.before_call(&self.stats.get_range)?;
        let state = self.state.lock();
        let object = state
            .objects
            .get(&key(container, name))
            .ok_or_else(|| StoreError::not_found(name))?;
        let len = object.data.len() as u64;
        if start > end_inclusive || start >= len {
            return Err(StoreError::http(
                416,
                format!("range {start}-{end_inclusive} not satisfiable for length {len}"),
            ));
        }
        let end = end_inclusive.min(len - 1);
        Ok(object.data[start as usize..=end as usize].to_vec())
    }

    fn put_block(
        &self,
        container: &str,
        name: &str,
        block_id: &str,
        data: &[u8],
        md5: Option<&str>,
    ) -> Result<(), StoreError> {
        self.before_call(&self.stats.put_block)?;
        if block_id.is_empty() {
            return Err(StoreError::http(400, "InvalidBlockId"));
        }
        if data.len() as u64 > MAX_CHUNK_SIZE_BYTES {
            return Err(StoreError::http(413, "RequestBodyTooLarge"));
        }
        check_md5(data, md5)?;
        self.state
            .lock()
            .staged
            .entry(key(container, name))
            .or_default()
            .insert(block_id.to_string(), data.to_vec());
        Ok(())
    }

    fn put_block_list(
        &self,
        container: &str,
        name: &str,
        block_ids: &[String],
        settings: &ContentSettings,
    ) -> Result<(), StoreError> {
        self.before_call(&self.stats.put_block_list)?;
        let mut state = self.state.lock();
        let object_key = key(container, name);
        if let Some(id) = block_ids.iter().find(|id| {
            !state
                .staged
                .get(&object_key)
                .is_some_and(|blocks| blocks.contains_key(id.as_str()))
        }) {
            return Err(StoreError::http(
                400,
                format!("InvalidBlockList: unknown block '{id}'"),
            ));
        }

        let staged = state.staged.remove(&object_key).unwrap_or_default();
        let mut data = Vec::new();
        for id in block_ids {
            data.extend_from_slice(&staged[id]);
        }

        state.objects.insert(
            object_key.clone(),
            StoredObject {
                data,
                blob_type: BlobType::Block,
                content_md5: settings.content_md5.clone(),
                metadata: HashMap::new(),
            },
        );
        *state.block_list_commits.entry(object_key).or_insert(0) += 1;
        Ok(())
    }

    fn create_page_object(
        &self,
        container: &str,
        name: &str,
        size: u64,
    ) -> Result<(), StoreError> {
        self.before_call(&self.stats.create_page_object)?;
        if size % PAGE_SIZE_BYTES != 0 {
            return Err(StoreError::http(400, "page object size must be 512-byte aligned"));
        }
        if size > MAX_PAGE_BLOB_SIZE_BYTES {
            return Err(StoreError::http(400, "page object too large"));
        }
        self.state.lock().objects.insert(
            key(container, name),
            StoredObject {
                data: vec![0; size as usize],
                blob_type: BlobType::Page,
                content_md5: None,
                metadata: HashMap::new(),
            },
        );
        Ok(())
    }

    fn put_page(
        &self,
        container: &str,
        name: &str,
        start: u64,
        end_inclusive: u64,
        data: &[u8],
        md5: Option<&str>,
    ) -> Result<(), StoreError> {
        self.before_call(&self.stats.put_page)?;
        if start % PAGE_SIZE_BYTES != 0 || (end_inclusive + 1) % PAGE_SIZE_BYTES != 0 {
            return Err(StoreError::http(400, "page range must be 512-byte aligned"));
        }
        if end_inclusive < start || data.len() as u64 != end_inclusive - start + 1 {
            return Err(StoreError::http(400, "payload length does not match page range"));
        }
        check_md5(data, md5)?;

        let mut state = self.state.lock();
        let object = state
            .objects
            .get_mut(&key(container, name))
            .ok_or_else(|| StoreError::not_found(name))?;
        if object.blob_type != BlobType::Page {
            return Err(StoreError::http(409, "InvalidBlobType"));
        }
        if end_inclusive >= object.data.len() as u64 {
            return Err(StoreError::http(416, "page range beyond object size"));
        }
        object.data[start as usize..=end_inclusive as usize].copy_from_slice(data);
        state.page_writes.push(data.len() as u64);
        Ok(())
    }

    fn set_properties(
        &self,
        container: &str,
        name: &str,
        settings: &ContentSettings,
    ) -> Result<(), StoreError> {
        self.before_call(&self.stats.set_properties)?;
        let mut state = self.state.lock();
        let object = state
            .objects
            .get_mut(&key(container, name))
            .ok_or_else(|| StoreError::not_found(name))?;
        object.content_md5.clone_from(&settings.content_md5);
        Ok(())
    }

    fn set_metadata(
        &self,
        container: &str,
        name: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<(), StoreError> {
        self.before_call(&self.stats.set_metadata)?;
        let mut state = self.state.lock();
        let object = state
            .objects
            .get_mut(&key(container, name))
            .ok_or_else(|| StoreError::not_found(name))?;
        object.metadata.clone_from(metadata);
        Ok(())
    }

    fn delete_object(&self, container: &str, name: &str) -> Result<(), StoreError> {
        self.before_call(&self.stats.delete_object)?;
        let mut state = self.state.lock();
        let object_key = key(container, name);
        state.staged.remove(&object_key);
        state
            .objects
            .remove(&object_key)
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::list_all;

    #[test]
    fn test_blocks_invisible_until_committed() {
        let store = MemoryBlobStore::new();
        store.put_block("c", "a", "00000000", b"hello ", None).unwrap();
        store.put_block("c", "a", "00000001", b"world", None).unwrap();
        assert!(store.head_object("c", "a").unwrap_err().is_not_found());

        let ids = vec!["00000000".to_string(), "00000001".to_string()];
        let md5 = md5_base64(b"hello world");
        store
            .put_block_list("c", "a", &ids, &ContentSettings::with_md5(Some(md5.clone())))
            .unwrap();

        let props = store.head_object("c", "a").unwrap();
        assert_eq!(props.length, 11);
        assert_eq!(props.content_md5, Some(md5));
        assert_eq!(store.get_range("c", "a", 6, 100).unwrap(), b"world");
        assert_eq!(store.block_list_commits("c", "a"), 1);
        assert!(store.staged_block_ids("c", "a").is_empty());
    }

    #[test]
    fn test_unknown_block_in_list_is_rejected() {
        let store = MemoryBlobStore::new();
        store.put_block("c", "a", "00000000", b"x", None).unwrap();
        let err = store
            .put_block_list("c", "a", &["00000001".into()], &ContentSettings::default())
            .unwrap_err();
        assert_eq!(err.status(), Some(400));
        assert_eq!(store.staged_block_ids("c", "a"), vec!["00000000".to_string()]);
    }

    #[test]
    fn test_block_md5_is_verified() {
        let store = MemoryBlobStore::new();
        let err = store
            .put_block("c", "a", "00000000", b"data", Some(&md5_base64(b"other")))
            .unwrap_err();
        assert_eq!(err.status(), Some(400));
        store
            .put_block("c", "a", "00000000", b"data", Some(&md5_base64(b"data")))
            .unwrap();
    }

    #[test]
    fn test_page_writes_must_be_aligned() {
        let store = MemoryBlobStore::new();
        assert!(store.create_page_object("c", "p", 100).is_err());
        store.create_page_object("c", "p", 1024).unwrap();

        assert!(store.put_page("c", "p", 0, 99, &[1; 100], None).is_err());
        assert!(store.put_page("c", "p", 1, 512, &[1; 512], None).is_err());
        store.put_page("c", "p", 512, 1023, &[7; 512], None).unwrap();

        let data = store.object_data("c", "p").unwrap();
        assert_eq!(&data[..512], &[0; 512][..]);
        assert_eq!(&data[512..], &[7; 512][..]);
        assert_eq!(store.page_write_sizes(), vec![512]);
    }

    #[test]
    fn test_listing_pagination() {
        let store = MemoryBlobStore::new().with_page_results(2);
        for name in ["a", "b", "c", "d", "e"] {
            store.insert_object("box", name, vec![1], BlobType::Block, None, HashMap::new());
        }
        store.insert_object("other", "z", vec![], BlobType::Block, None, HashMap::new());

        let first = store.list_objects("box", None, false).unwrap();
        assert_eq!(first.entries.len(), 2);
        assert_eq!(first.next_marker.as_deref(), Some("c"));

        let all = list_all(&store, "box", false).unwrap();
        let names: Vec<_> = all.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["a", "b", "c", "d", "e"]);
        assert_eq!(MemoryStoreStats::get(&store.stats().list_objects), 4);
    }

    #[test]
    fn test_listing_metadata_is_optional() {
        let store = MemoryBlobStore::new();
        let metadata = HashMap::from([("k".to_string(), "v".to_string())]);
        store.insert_object("c", "a", vec![], BlobType::Block, None, metadata);
        assert!(store.list_objects("c", None, false).unwrap().entries[0].metadata.is_empty());
        assert_eq!(store.list_objects("c", None, true).unwrap().entries[0].metadata["k"], "v");
    }

    #[test]
    fn test_delete_object_drops_staged_blocks() {
        let store = MemoryBlobStore::new();
        store.insert_object("c", "a", vec![1], BlobType::Block, None, HashMap::new());
        store.put_block("c", "a", "00000000", b"xy", None).unwrap();
        assert_eq!(store.staged_block_ids("c", "a"), ["00000000"]);

        store.delete_object("c", "a").unwrap();
        assert!(store.object_names("c").is_empty());
        assert!(store.staged_block_ids("c", "a").is_empty());
        assert!(store.delete_object("c", "a").unwrap_err().is_not_found());
        assert_eq!(MemoryStoreStats::get(&store.stats().delete_object), 2);
    }

    #[test]
    fn test_fault_injection() {
        let store = MemoryBlobStore::new();
        store.fail_next(2, 503);
        assert_eq!(store.head_object("c", "a").unwrap_err().status(), Some(503));
        assert_eq!(store.head_object("c", "a").unwrap_err().status(), Some(503));
        assert!(store.head_object("c", "a").unwrap_err().is_not_found());
        assert_eq!(MemoryStoreStats::get(&store.stats().injected_faults), 2);
    }

    #[test]
    fn test_unsatisfiable_range() {
        let store = MemoryBlobStore::new();
        store.insert_object("c", "a", vec![1, 2, 3], BlobType::Block, None, HashMap::new());
        assert_eq!(store.get_range("c", "a", 3, 10).unwrap_err().status(), Some(416));
        assert_eq!(store.get_range("c", "a", 1, 1).unwrap(), vec![2]);
    }
}
