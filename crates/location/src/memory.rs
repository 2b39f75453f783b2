//! In-process object store.
//!
//! Emulates the behaviours the transfer engine depends on: block staging and
//! block-list commit (with the default content type forced on commit), page
//! objects with 512-byte alignment and sparse population, append objects
//! guarded by position and size conditions, plain range-writable files,
//! ETags, server-side range/whole copies and asynchronous copies that advance
//! each time their status is polled.
//!
//! Every operation is recorded so callers can assert on the exact call
//! sequence, and faults can be injected per operation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::trace;

use crate::attributes::{
    AccessCondition, Attributes, ByteRange, ContentProperties, CopyState, CopyStatus, Metadata,
};
use crate::error::ProviderError;
use crate::location::{BlobKind, Location, LocationKind};
use crate::provider::{ChunkAddress, ChunkPayload, ObjectDestination, ObjectSource, ProviderFuture};
use crate::{MAX_RANGE_WRITE, PAGE_SIZE};

/// Content type applied by calls that cannot express an empty one.
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// Operations recorded by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    FetchAttributes,
    ReadRange,
    ListRanges,
    Create,
    WriteChunk,
    PutWhole,
    SubmitBlockList,
    SetProperties,
    Commit,
    StartCopy,
    GetCopyStatus,
    ReadBack,
}

/// One recorded provider call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub op: Operation,
    pub target: String,
    /// Offset for positional operations, block index order otherwise.
    pub offset: Option<u64>,
}

type ErrorFactory = Arc<dyn Fn() -> ProviderError + Send + Sync>;

struct Fault {
    op: Operation,
    target: Option<String>,
    skip: usize,
    times: usize,
    /// Perform the operation, then report the error anyway.
    apply_first: bool,
    make: ErrorFactory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ObjectKind {
    Blob(BlobKind),
    File,
}

struct PendingCopy {
    status: CopyStatus,
    data: Vec<u8>,
    properties: ContentProperties,
    metadata: Metadata,
}

struct MemoryObject {
    kind: ObjectKind,
    data: Vec<u8>,
    populated: Vec<ByteRange>,
    etag: String,
    properties: ContentProperties,
    metadata: Metadata,
    committed_blocks: HashMap<String, Vec<u8>>,
    copy: Option<PendingCopy>,
}

#[derive(Default)]
struct StoreState {
    objects: HashMap<String, MemoryObject>,
    staged: HashMap<String, HashMap<String, Vec<u8>>>,
    calls: Vec<Call>,
    faults: Vec<Fault>,
}

struct StoreInner {
    state: Mutex<StoreState>,
    etags: AtomicU64,
    copies: AtomicU64,
    copy_step: AtomicU64,
    latency: Mutex<Option<Duration>>,
}

/// Thread-safe in-memory store. Cloning shares the same objects.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<StoreInner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn key_of(location: &Location) -> String {
    location.copy_source_uri().unwrap_or_else(|| location.id())
}

fn kind_of(location: &Location) -> ObjectKind {
    match location.kind() {
        LocationKind::Blob(k) => ObjectKind::Blob(k),
        LocationKind::File => ObjectKind::File,
        _ => ObjectKind::Blob(BlobKind::Block),
    }
}

fn normalize(props: ContentProperties) -> ContentProperties {
    let clear = |v: Option<String>| v.filter(|s| !s.is_empty());
    ContentProperties {
        content_type: clear(props.content_type),
        content_encoding: clear(props.content_encoding),
        content_language: clear(props.content_language),
        content_disposition: clear(props.content_disposition),
        cache_control: clear(props.cache_control),
        content_md5: clear(props.content_md5),
    }
}

fn with_default_content_type(mut props: ContentProperties) -> ContentProperties {
    if props.content_type_is_empty() {
        props.content_type = Some(DEFAULT_CONTENT_TYPE.to_string());
    }
    normalize(props)
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StoreInner {
                state: Mutex::new(StoreState::default()),
                etags: AtomicU64::new(1),
                copies: AtomicU64::new(1),
                copy_step: AtomicU64::new(u64::MAX),
                latency: Mutex::new(None),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, StoreState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_etag(&self) -> String {
        format!("\"0x{:X}\"", self.inner.etags.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns a handle usable as both source and destination.
    pub fn object(&self, location: Location) -> Arc<MemoryObjectHandle> {
        Arc::new(MemoryObjectHandle {
            store: self.clone(),
            key: key_of(&location),
            location,
        })
    }

    /// Seeds a fully populated object.
    pub fn put(&self, location: &Location, data: Vec<u8>, properties: ContentProperties, metadata: Metadata) {
        let populated = vec![ByteRange::new(0, data.len() as u64)];
        self.insert(location, data, populated, properties, metadata);
    }

    /// Seeds a sparse object of `length` bytes where only `ranges` hold data.
    pub fn put_sparse(&self, location: &Location, length: u64, ranges: Vec<(u64, Vec<u8>)>) {
        let mut data = vec![0u8; length as usize];
        let mut populated = Vec::with_capacity(ranges.len());
        for (offset, bytes) in ranges {
            let start = offset as usize;
            data[start..start + bytes.len()].copy_from_slice(&bytes);
            populated.push(ByteRange::new(offset, bytes.len() as u64));
        }
        self.insert(
            location,
            data,
            ByteRange::merge(populated),
            ContentProperties::default(),
            Metadata::new(),
        );
    }

    fn insert(
        &self,
        location: &Location,
        data: Vec<u8>,
        populated: Vec<ByteRange>,
        properties: ContentProperties,
        metadata: Metadata,
    ) {
        let etag = self.next_etag();
        self.state().objects.insert(
            key_of(location),
            MemoryObject {
                kind: kind_of(location),
                data,
                populated,
                etag,
                properties: normalize(properties),
                metadata,
                committed_blocks: HashMap::new(),
                copy: None,
            },
        );
    }

    /// Current content of an object, if it exists.
    pub fn data(&self, location: &Location) -> Option<Vec<u8>> {
        self.state().objects.get(&key_of(location)).map(|o| o.data.clone())
    }

    /// Current attributes of an object, bypassing call recording.
    pub fn attributes(&self, location: &Location) -> Option<Attributes> {
        self.state()
            .objects
            .get(&key_of(location))
            .map(MemoryObject::attributes)
    }

    /// Overwrites bytes of an existing object in place, bumping its ETag.
    pub fn tamper(&self, location: &Location, offset: u64, bytes: &[u8]) {
        let etag = self.next_etag();
        let mut state = self.state();
        if let Some(obj) = state.objects.get_mut(&key_of(location)) {
            let start = offset as usize;
            let end = start + bytes.len();
            if obj.data.len() < end {
                obj.data.resize(end, 0);
            }
            obj.data[start..end].copy_from_slice(bytes);
            obj.etag = etag;
        }
    }

    /// Marks a copy into `destination` as pending from `source_uri`.
    pub fn set_pending_copy(&self, destination: &Location, copy_id: &str, source_uri: &str, total: u64) {
        let etag = self.next_etag();
        let mut state = self.state();
        let key = key_of(destination);
        let source_data = state
            .objects
            .get(source_uri)
            .map(|o| (o.data.clone(), o.properties.clone(), o.metadata.clone()));
        let (data, properties, metadata) =
            source_data.unwrap_or_else(|| (vec![0u8; total as usize], ContentProperties::default(), Metadata::new()));
        let obj = state.objects.entry(key).or_insert_with(|| MemoryObject {
            kind: kind_of(destination),
            data: Vec::new(),
            populated: Vec::new(),
            etag,
            properties: ContentProperties::default(),
            metadata: Metadata::new(),
            committed_blocks: HashMap::new(),
            copy: None,
        });
        obj.copy = Some(PendingCopy {
            status: CopyStatus {
                copy_id: copy_id.to_string(),
                state: CopyState::Pending,
                bytes_copied: 0,
                total_bytes: total,
                source: source_uri.to_string(),
                description: None,
            },
            data,
            properties,
            metadata,
        });
    }

    /// Ends the pending copy into `destination` with `state`.
    pub fn end_copy(&self, destination: &Location, state: CopyState, description: &str) {
        let mut guard = self.state();
        if let Some(copy) = guard
            .objects
            .get_mut(&key_of(destination))
            .and_then(|o| o.copy.as_mut())
        {
            copy.status.state = state;
            copy.status.description = Some(description.to_string());
        }
    }

    /// Bytes an asynchronous copy advances per status poll (default: all at once).
    pub fn set_copy_step(&self, bytes: u64) {
        self.inner.copy_step.store(bytes.max(1), Ordering::Relaxed);
    }

    /// Delay applied before every operation.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.inner.latency.lock().unwrap_or_else(PoisonError::into_inner) = latency;
    }

    /// Fails the next `times` calls of `op` (optionally only on `target`).
    pub fn fail(
        &self,
        op: Operation,
        target: Option<&Location>,
        times: usize,
        make: impl Fn() -> ProviderError + Send + Sync + 'static,
    ) {
        self.add_fault(op, target, 0, times, false, make);
    }

    /// Lets `skip` calls of `op` through, then fails the following one.
    pub fn fail_after(
        &self,
        op: Operation,
        target: Option<&Location>,
        skip: usize,
        make: impl Fn() -> ProviderError + Send + Sync + 'static,
    ) {
        self.add_fault(op, target, skip, 1, false, make);
    }

    /// Performs the `skip + 1`-th call of `op`, then reports an error for it.
    ///
    /// Models a request whose response was lost after the service applied it.
    pub fn fail_after_apply(
        &self,
        op: Operation,
        target: Option<&Location>,
        skip: usize,
        make: impl Fn() -> ProviderError + Send + Sync + 'static,
    ) {
        self.add_fault(op, target, skip, 1, true, make);
    }

    fn add_fault(
        &self,
        op: Operation,
        target: Option<&Location>,
        skip: usize,
        times: usize,
        apply_first: bool,
        make: impl Fn() -> ProviderError + Send + Sync + 'static,
    ) {
        self.state().faults.push(Fault {
            op,
            target: target.map(key_of),
            skip,
            times,
            apply_first,
            make: Arc::new(make),
        });
    }

    /// Every call recorded so far, in order.
    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    /// Number of recorded calls of `op` against `target`.
    pub fn count(&self, op: Operation, target: &Location) -> usize {
        let key = key_of(target);
        self.state()
            .calls
            .iter()
            .filter(|c| c.op == op && c.target == key)
            .count()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    /// Records the call and resolves any injected fault.
    ///
    /// Returns `Err` to fail before applying, `Ok(Some(err))` to apply then fail.
    fn enter(&self, op: Operation, key: &str, offset: Option<u64>) -> Result<Option<ProviderError>, ProviderError> {
        let mut state = self.state();
        state.calls.push(Call {
            op,
            target: key.to_string(),
            offset,
        });
        let fault = state.faults.iter_mut().find(|f| {
            f.op == op && f.times > 0 && f.target.as_deref().is_none_or(|t| t == key)
        });
        let Some(fault) = fault else {
            return Ok(None);
        };
        if fault.skip > 0 {
            fault.skip -= 1;
            return Ok(None);
        }
        fault.times -= 1;
        let err = (fault.make)();
        if fault.apply_first {
            Ok(Some(err))
        } else {
            Err(err)
        }
    }

    async fn delay(&self) {
        let latency = *self.inner.latency.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(d) = latency {
            tokio::time::sleep(d).await;
        }
    }
}

impl MemoryObject {
    fn attributes(&self) -> Attributes {
        Attributes {
            length: self.data.len() as u64,
            etag: Some(self.etag.clone()),
            blob_kind: match self.kind {
                ObjectKind::Blob(k) => Some(k),
                ObjectKind::File => None,
            },
            properties: self.properties.clone(),
            metadata: self.metadata.clone(),
            copy: self.copy.as_ref().map(|c| c.status.clone()),
        }
    }

    fn check(&self, conditions: &AccessCondition) -> Result<(), ProviderError> {
        if let Some(etag) = &conditions.if_match
            && *etag != self.etag
        {
            return Err(ProviderError::PreconditionFailed(format!(
                "etag {} does not match {etag}",
                self.etag
            )));
        }
        if conditions.if_none_match.as_deref() == Some("*") {
            return Err(ProviderError::PreconditionFailed("object exists".into()));
        }
        Ok(())
    }
}

/// Handle to one object in a [`MemoryStore`].
pub struct MemoryObjectHandle {
    store: MemoryStore,
    location: Location,
    key: String,
}

impl MemoryObjectHandle {
    fn not_found(&self) -> ProviderError {
        ProviderError::NotFound(self.key.clone())
    }

    async fn attributes(&self) -> Result<Attributes, ProviderError> {
        self.store.delay().await;
        let after = self.store.enter(Operation::FetchAttributes, &self.key, None)?;
        let attrs = self
            .store
            .state()
            .objects
            .get(&self.key)
            .map(MemoryObject::attributes)
            .ok_or_else(|| self.not_found())?;
        after.map_or(Ok(attrs), Err)
    }

    fn slice(obj: &MemoryObject, offset: u64, length: u64) -> Vec<u8> {
        let len = obj.data.len() as u64;
        let start = offset.min(len) as usize;
        let end = offset.saturating_add(length).min(len) as usize;
        obj.data[start..end].to_vec()
    }

    async fn read(&self, op: Operation, offset: u64, length: u64, conditions: AccessCondition) -> Result<Vec<u8>, ProviderError> {
        self.store.delay().await;
        let after = self.store.enter(op, &self.key, Some(offset))?;
        let state = self.store.state();
        let obj = state.objects.get(&self.key).ok_or_else(|| self.not_found())?;
        obj.check(&conditions)?;
        let bytes = Self::slice(obj, offset, length);
        after.map_or(Ok(bytes), Err)
    }

    async fn ranges(&self, offset: u64, length: u64) -> Result<Vec<ByteRange>, ProviderError> {
        self.store.delay().await;
        let after = self.store.enter(Operation::ListRanges, &self.key, Some(offset))?;
        let state = self.store.state();
        let obj = state.objects.get(&self.key).ok_or_else(|| self.not_found())?;
        let window = ByteRange::new(offset, length);
        let ranges = obj
            .populated
            .iter()
            .filter(|r| r.overlaps(&window))
            .map(|r| {
                let start = r.offset.max(offset);
                let end = r.end().min(window.end());
                ByteRange::new(start, end - start)
            })
            .collect();
        after.map_or(Ok(ranges), Err)
    }

    /// Resolves a payload into bytes, reading copy sources from the store.
    fn resolve(state: &StoreState, payload: ChunkPayload, conditions: &AccessCondition) -> Result<Vec<u8>, ProviderError> {
        let (uri, range) = match payload {
            ChunkPayload::Bytes(b) => return Ok(b),
            ChunkPayload::SourceRange {
                source_uri,
                offset,
                length,
            } => (source_uri, Some((offset, length))),
            ChunkPayload::SourceObject { source_uri } => (source_uri, None),
        };
        let src = state
            .objects
            .get(&uri)
            .ok_or_else(|| ProviderError::NotFound(uri.clone()))?;
        if let Some(etag) = &conditions.source_if_match
            && *etag != src.etag
        {
            return Err(ProviderError::PreconditionFailed(format!(
                "source etag {} does not match {etag}",
                src.etag
            )));
        }
        Ok(match range {
            Some((offset, length)) => Self::slice(src, offset, length),
            None => src.data.clone(),
        })
    }

    async fn create_object(&self, size: u64, conditions: AccessCondition) -> Result<(), ProviderError> {
        self.store.delay().await;
        let after = self.store.enter(Operation::Create, &self.key, Some(size))?;
        let kind = kind_of(&self.location);
        match kind {
            ObjectKind::Blob(BlobKind::Page) if size % PAGE_SIZE != 0 => {
                return Err(ProviderError::InvalidRange(format!(
                    "page object size {size} is not a multiple of {PAGE_SIZE}"
                )));
            }
            ObjectKind::Blob(BlobKind::Append) if size != 0 => {
                return Err(ProviderError::InvalidRange("append objects are created empty".into()));
            }
            ObjectKind::Blob(BlobKind::Block) => {
                return Err(ProviderError::unsupported("create", &self.location));
            }
            _ => {}
        }
        let etag = self.store.next_etag();
        let mut state = self.store.state();
        if let Some(existing) = state.objects.get(&self.key) {
            existing.check(&conditions)?;
        }
        state.objects.insert(
            self.key.clone(),
            MemoryObject {
                kind,
                data: vec![0u8; size as usize],
                populated: Vec::new(),
                etag,
                properties: ContentProperties::default(),
                metadata: Metadata::new(),
                committed_blocks: HashMap::new(),
                copy: None,
            },
        );
        after.map_or(Ok(()), Err)
    }

    async fn write(&self, address: ChunkAddress, payload: ChunkPayload, conditions: AccessCondition) -> Result<(), ProviderError> {
        self.store.delay().await;
        let offset = match &address {
            ChunkAddress::Range { offset } => Some(*offset),
            ChunkAddress::Append => conditions.append_position,
            ChunkAddress::Block { .. } => None,
        };
        let after = self.store.enter(Operation::WriteChunk, &self.key, offset)?;
        let etag = self.store.next_etag();
        let mut state = self.store.state();
        let data = Self::resolve(&state, payload, &conditions)?;

        if let ChunkAddress::Block { id } = address {
            if !matches!(kind_of(&self.location), ObjectKind::Blob(BlobKind::Block)) {
                return Err(ProviderError::unsupported("block write", &self.location));
            }
            trace!(key = %self.key, %id, len = data.len(), "stage block");
            state.staged.entry(self.key.clone()).or_default().insert(id, data);
            return after.map_or(Ok(()), Err);
        }

        let obj = state.objects.get_mut(&self.key).ok_or_else(|| self.not_found())?;
        if let Some(expected) = &conditions.if_match
            && *expected != obj.etag
        {
            return Err(ProviderError::PreconditionFailed("etag mismatch".into()));
        }
        let len = data.len() as u64;
        let start = match (address, obj.kind) {
            (ChunkAddress::Append, ObjectKind::Blob(BlobKind::Append)) => {
                let current = obj.data.len() as u64;
                if let Some(pos) = conditions.append_position
                    && pos != current
                {
                    return Err(ProviderError::PreconditionFailed(format!(
                        "append position {pos} does not match length {current}"
                    )));
                }
                if let Some(max) = conditions.max_size
                    && current + len > max
                {
                    return Err(ProviderError::PreconditionFailed(format!(
                        "append would exceed max size {max}"
                    )));
                }
                if len > MAX_RANGE_WRITE {
                    return Err(ProviderError::InvalidRange(format!("append of {len} bytes too large")));
                }
                obj.data.extend_from_slice(&data);
                current
            }
            (ChunkAddress::Range { offset }, ObjectKind::Blob(BlobKind::Page) | ObjectKind::File) => {
                if obj.kind == ObjectKind::Blob(BlobKind::Page) && (offset % PAGE_SIZE != 0 || len % PAGE_SIZE != 0) {
                    return Err(ProviderError::InvalidRange(format!(
                        "page write at {offset} of {len} bytes is not {PAGE_SIZE}-aligned"
                    )));
                }
                if offset + len > obj.data.len() as u64 {
                    return Err(ProviderError::InvalidRange(format!(
                        "write at {offset} of {len} bytes past end {}",
                        obj.data.len()
                    )));
                }
                let start = offset as usize;
                obj.data[start..start + data.len()].copy_from_slice(&data);
                offset
            }
            (address, _) => {
                return Err(ProviderError::Unsupported(format!("{address:?} on {}", self.key)));
            }
        };
        let mut populated = std::mem::take(&mut obj.populated);
        populated.push(ByteRange::new(start, len));
        obj.populated = ByteRange::merge(populated);
        obj.etag = etag;
        after.map_or(Ok(()), Err)
    }

    async fn put(&self, payload: ChunkPayload, properties: ContentProperties, metadata: Metadata, conditions: AccessCondition) -> Result<(), ProviderError> {
        self.store.delay().await;
        let after = self.store.enter(Operation::PutWhole, &self.key, None)?;
        if !matches!(kind_of(&self.location), ObjectKind::Blob(BlobKind::Block)) {
            return Err(ProviderError::unsupported("put_whole", &self.location));
        }
        let etag = self.store.next_etag();
        let mut state = self.store.state();
        if let Some(existing) = state.objects.get(&self.key) {
            existing.check(&conditions)?;
        }
        let data = Self::resolve(&state, payload, &conditions)?;
        let len = data.len() as u64;
        state.objects.insert(
            self.key.clone(),
            MemoryObject {
                kind: ObjectKind::Blob(BlobKind::Block),
                data,
                populated: vec![ByteRange::new(0, len)],
                etag,
                properties: with_default_content_type(properties),
                metadata,
                committed_blocks: HashMap::new(),
                copy: None,
            },
        );
        after.map_or(Ok(()), Err)
    }

    async fn commit_blocks(&self, block_ids: Vec<String>, properties: ContentProperties, metadata: Metadata, conditions: AccessCondition) -> Result<(), ProviderError> {
        self.store.delay().await;
        let after = self
            .store
            .enter(Operation::SubmitBlockList, &self.key, Some(block_ids.len() as u64))?;
        let etag = self.store.next_etag();
        let mut guard = self.store.state();
        let state = &mut *guard;
        let mut blocks = state.staged.remove(&self.key).unwrap_or_default();
        if let Some(existing) = state.objects.get_mut(&self.key) {
            if let Err(e) = existing.check(&conditions) {
                state.staged.insert(self.key.clone(), blocks);
                return Err(e);
            }
            for (id, bytes) in existing.committed_blocks.drain() {
                blocks.entry(id).or_insert(bytes);
            }
        }
        let mut data = Vec::new();
        let mut committed = HashMap::with_capacity(block_ids.len());
        for id in &block_ids {
            let bytes = blocks
                .get(id)
                .ok_or_else(|| ProviderError::InvalidRange(format!("block {id} not found")))?;
            data.extend_from_slice(bytes);
            committed.insert(id.clone(), bytes.clone());
        }
        let len = data.len() as u64;
        state.objects.insert(
            self.key.clone(),
            MemoryObject {
                kind: ObjectKind::Blob(BlobKind::Block),
                data,
                populated: vec![ByteRange::new(0, len)],
                etag,
                properties: with_default_content_type(properties),
                metadata,
                committed_blocks: committed,
                copy: None,
            },
        );
        after.map_or(Ok(()), Err)
    }

    async fn replace_properties(&self, properties: ContentProperties, metadata: Option<Metadata>, op: Operation) -> Result<(), ProviderError> {
        self.store.delay().await;
        let after = self.store.enter(op, &self.key, None)?;
        let etag = self.store.next_etag();
        let mut state = self.store.state();
        let obj = state.objects.get_mut(&self.key).ok_or_else(|| self.not_found())?;
        obj.properties = normalize(properties);
        if let Some(metadata) = metadata {
            obj.metadata = metadata;
        }
        obj.etag = etag;
        after.map_or(Ok(()), Err)
    }

    async fn begin_copy(&self, source_uri: String, conditions: AccessCondition) -> Result<String, ProviderError> {
        self.store.delay().await;
        let after = self.store.enter(Operation::StartCopy, &self.key, None)?;
        let copy_id = format!("copy-{}", self.store.inner.copies.fetch_add(1, Ordering::Relaxed));
        let etag = self.store.next_etag();
        let mut state = self.store.state();
        if let Some(existing) = state.objects.get(&self.key)
            && existing
                .copy
                .as_ref()
                .is_some_and(|c| c.status.state == CopyState::Pending)
        {
            return Err(ProviderError::CopyPending(self.key.clone()));
        }
        let src = state
            .objects
            .get(&source_uri)
            .ok_or_else(|| ProviderError::NotFound(source_uri.clone()))?;
        if let Some(expected) = &conditions.source_if_match
            && *expected != src.etag
        {
            return Err(ProviderError::PreconditionFailed("source etag mismatch".into()));
        }
        let pending = PendingCopy {
            status: CopyStatus {
                copy_id: copy_id.clone(),
                state: CopyState::Pending,
                bytes_copied: 0,
                total_bytes: src.data.len() as u64,
                source: source_uri.clone(),
                description: None,
            },
            data: src.data.clone(),
            properties: src.properties.clone(),
            metadata: src.metadata.clone(),
        };
        if let Some(existing) = state.objects.get(&self.key) {
            existing.check(&AccessCondition {
                source_if_match: None,
                ..conditions
            })?;
        }
        state.objects.insert(
            self.key.clone(),
            MemoryObject {
                kind: kind_of(&self.location),
                data: Vec::new(),
                populated: Vec::new(),
                etag,
                properties: ContentProperties::default(),
                metadata: Metadata::new(),
                committed_blocks: HashMap::new(),
                copy: Some(pending),
            },
        );
        match after {
            Some(err) => Err(err),
            None => Ok(copy_id),
        }
    }

    async fn poll_copy(&self, copy_id: String) -> Result<CopyStatus, ProviderError> {
        self.store.delay().await;
        let after = self.store.enter(Operation::GetCopyStatus, &self.key, None)?;
        let step = self.store.inner.copy_step.load(Ordering::Relaxed);
        let etag = self.store.next_etag();
        let mut state = self.store.state();
        let obj = state.objects.get_mut(&self.key).ok_or_else(|| self.not_found())?;
        let copy = obj
            .copy
            .as_mut()
            .filter(|c| c.status.copy_id == copy_id)
            .ok_or_else(|| ProviderError::NotFound(format!("copy {copy_id}")))?;
        if copy.status.state == CopyState::Pending {
            copy.status.bytes_copied = copy.status.bytes_copied.saturating_add(step).min(copy.status.total_bytes);
            if copy.status.bytes_copied == copy.status.total_bytes {
                copy.status.state = CopyState::Success;
                obj.data = std::mem::take(&mut copy.data);
                obj.properties = copy.properties.clone();
                obj.metadata = copy.metadata.clone();
                obj.populated = vec![ByteRange::new(0, obj.data.len() as u64)];
                obj.etag = etag;
            }
        }
        let status = copy.status.clone();
        after.map_or(Ok(status), Err)
    }
}

impl ObjectSource for MemoryObjectHandle {
    fn location(&self) -> &Location {
        &self.location
    }

    fn fetch_attributes(&self) -> ProviderFuture<'_, Attributes> {
        Box::pin(self.attributes())
    }

    fn read_range(&self, offset: u64, length: u64, conditions: AccessCondition) -> ProviderFuture<'_, Vec<u8>> {
        Box::pin(self.read(Operation::ReadRange, offset, length, conditions))
    }

    fn list_ranges(&self, offset: u64, length: u64) -> ProviderFuture<'_, Vec<ByteRange>> {
        Box::pin(self.ranges(offset, length))
    }
}

impl ObjectDestination for MemoryObjectHandle {
    fn location(&self) -> &Location {
        &self.location
    }

    fn fetch_attributes(&self) -> ProviderFuture<'_, Attributes> {
        Box::pin(self.attributes())
    }

    fn create(&self, size: u64, conditions: AccessCondition) -> ProviderFuture<'_, ()> {
        Box::pin(self.create_object(size, conditions))
    }

    fn write_chunk(&self, address: ChunkAddress, payload: ChunkPayload, conditions: AccessCondition) -> ProviderFuture<'_, ()> {
        Box::pin(self.write(address, payload, conditions))
    }

    fn put_whole(&self, payload: ChunkPayload, properties: ContentProperties, metadata: Metadata, conditions: AccessCondition) -> ProviderFuture<'_, ()> {
        Box::pin(self.put(payload, properties, metadata, conditions))
    }

    fn submit_block_list(&self, block_ids: Vec<String>, properties: ContentProperties, metadata: Metadata, conditions: AccessCondition) -> ProviderFuture<'_, ()> {
        Box::pin(self.commit_blocks(block_ids, properties, metadata, conditions))
    }

    fn set_properties(&self, properties: ContentProperties) -> ProviderFuture<'_, ()> {
        Box::pin(self.replace_properties(properties, None, Operation::SetProperties))
    }

    fn commit(&self, properties: ContentProperties, metadata: Metadata) -> ProviderFuture<'_, ()> {
        Box::pin(self.replace_properties(properties, Some(metadata), Operation::Commit))
    }

    fn start_copy(&self, source_uri: String, conditions: AccessCondition) -> ProviderFuture<'_, String> {
        Box::pin(self.begin_copy(source_uri, conditions))
    }

    fn get_copy_status(&self, copy_id: String) -> ProviderFuture<'_, CopyStatus> {
        Box::pin(self.poll_copy(copy_id))
    }

    fn read_range(&self, offset: u64, length: u64) -> ProviderFuture<'_, Vec<u8>> {
        Box::pin(self.read(Operation::ReadBack, offset, length, AccessCondition::none()))
    }
}
