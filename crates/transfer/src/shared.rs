//! Producer/consumer exchange between a reader and a writer.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};

use datamover_location::{ContentProperties, Metadata};

use crate::TransferError;
use crate::chunk::Chunk;
use crate::sizing::ChunkPlan;

/// Properties and metadata to apply at commit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FinalAttributes {
    pub properties: ContentProperties,
    pub metadata: Metadata,
}

/// Per-job exchange point.
///
/// The reader publishes chunks keyed by offset; a writer claims each offset
/// at most once and takes ownership of the buffer.
pub struct SharedTransferData {
    total_length: OnceLock<u64>,
    plan: ChunkPlan,
    chunks: Mutex<BTreeMap<u64, Chunk>>,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    final_attributes: Mutex<Option<FinalAttributes>>,
    content_md5: OnceLock<String>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SharedTransferData {
    pub fn new(total_length: Option<u64>, plan: ChunkPlan) -> Self {
        let total = OnceLock::new();
        if let Some(len) = total_length {
            let _ = total.set(len);
        }
        Self {
            total_length: total,
            plan,
            chunks: Mutex::new(BTreeMap::new()),
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            final_attributes: Mutex::new(None),
            content_md5: OnceLock::new(),
        }
    }

    pub fn total_length(&self) -> Option<u64> {
        self.total_length.get().copied()
    }

    /// Sets the total length exactly once.
    ///
    /// Setting the same value again is a no-op; a different value, or one below
    /// the bytes already read, is an error.
    pub fn set_total_length(&self, length: u64) -> Result<(), TransferError> {
        let read = self.bytes_read();
        if length < read {
            return Err(TransferError::InvalidConfiguration(format!(
                "total length {length} is below the {read} bytes already read"
            )));
        }
        let current = *self.total_length.get_or_init(|| length);
        if current != length {
            return Err(TransferError::InvalidConfiguration(format!(
                "total length already set to {current}, cannot change to {length}"
            )));
        }
        Ok(())
    }

    pub fn block_size(&self) -> u64 {
        self.plan.block_size
    }

    pub fn chunks_per_read(&self) -> usize {
        self.plan.chunks_per_read
    }

    pub fn plan(&self) -> ChunkPlan {
        self.plan
    }

    /// Inserts a chunk read from the source.
    pub fn publish(&self, chunk: Chunk) {
        self.bytes_read.fetch_add(chunk.len(), Ordering::AcqRel);
        lock(&self.chunks).insert(chunk.offset(), chunk);
    }

    /// Takes ownership of the chunk at `offset`, if it is available.
    pub fn claim(&self, offset: u64) -> Option<Chunk> {
        lock(&self.chunks).remove(&offset)
    }

    /// Takes the lowest available chunk.
    pub fn claim_any(&self) -> Option<Chunk> {
        lock(&self.chunks).pop_first().map(|(_, chunk)| chunk)
    }

    pub fn is_available(&self, offset: u64) -> bool {
        lock(&self.chunks).contains_key(&offset)
    }

    pub fn available(&self) -> usize {
        lock(&self.chunks).len()
    }

    /// Drops every unclaimed chunk, returning how many were released.
    pub fn release_all(&self) -> usize {
        let mut chunks = lock(&self.chunks);
        let n = chunks.len();
        chunks.clear();
        n
    }

    pub fn record_written(&self, bytes: u64) {
        self.bytes_written.fetch_add(bytes, Ordering::AcqRel);
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Acquire)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Acquire)
    }

    /// Records properties and metadata captured from the source.
    pub fn set_final_attributes(&self, attributes: FinalAttributes) {
        *lock(&self.final_attributes) = Some(attributes);
    }

    pub fn final_attributes(&self) -> Option<FinalAttributes> {
        lock(&self.final_attributes).clone()
    }

    pub fn set_content_md5(&self, md5: String) {
        let _ = self.content_md5.set(md5);
    }

    pub fn content_md5(&self) -> Option<&str> {
        self.content_md5.get().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn plan() -> ChunkPlan {
        ChunkPlan {
            block_size: 4,
            chunks_per_read: 1,
            chunk_count: None,
        }
    }

    #[test]
    fn total_length_set_once() {
        let shared = SharedTransferData::new(None, plan());
        assert_eq!(shared.total_length(), None);
        shared.set_total_length(10).unwrap();
        shared.set_total_length(10).unwrap();
        assert!(shared.set_total_length(11).is_err());
        assert_eq!(shared.total_length(), Some(10));
    }

    #[test]
    fn total_length_not_below_bytes_read() {
        let shared = SharedTransferData::new(None, plan());
        shared.publish(Chunk::new(0, vec![1; 4]));
        shared.publish(Chunk::new(4, vec![1; 4]));
        assert!(shared.set_total_length(6).is_err());
        assert!(shared.set_total_length(8).is_ok());
    }

    #[test]
    fn chunk_claimed_at_most_once() {
        let shared = Arc::new(SharedTransferData::new(Some(400), plan()));
        for i in 0..100 {
            shared.publish(Chunk::new(i * 4, vec![0; 4]));
        }
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let s = Arc::clone(&shared);
                std::thread::spawn(move || {
                    let mut got = Vec::new();
                    for i in 0..100 {
                        if let Some(c) = s.claim(i * 4) {
                            got.push(c.offset());
                        }
                    }
                    got
                })
            })
            .collect();
        let mut all: Vec<u64> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        all.sort_unstable();
        assert_eq!(all, (0..100).map(|i| i * 4).collect::<Vec<_>>());
        assert_eq!(shared.available(), 0);
    }

    #[test]
    fn claim_any_takes_lowest() {
        let shared = SharedTransferData::new(Some(12), plan());
        shared.publish(Chunk::new(8, vec![0; 4]));
        shared.publish(Chunk::new(0, vec![0; 4]));
        assert_eq!(shared.claim_any().map(|c| c.offset()), Some(0));
        assert!(shared.is_available(8));
        assert_eq!(shared.release_all(), 1);
    }

    #[test]
    fn counters() {
        let shared = SharedTransferData::new(Some(8), plan());
        shared.publish(Chunk::new(0, vec![0; 4]));
        shared.record_written(4);
        assert_eq!((shared.bytes_read(), shared.bytes_written()), (4, 4));
        shared.set_content_md5("abc".into());
        shared.set_content_md5("def".into());
        assert_eq!(shared.content_md5(), Some("abc"));
    }
}
