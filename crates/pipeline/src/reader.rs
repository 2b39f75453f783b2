//! Producer side of the pipeline.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, trace};

use datamover_location::ObjectSource;
use datamover_transfer::{Chunk, ContentHasher, ControllerBase, TransferError, TransferOptions};

use crate::exchange::Exchange;

/// Reader phases after the source has been opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReaderState {
    /// Separate sequential pass computing the content MD5.
    HashContent,
    /// Reading chunks into the exchange.
    Read,
    /// Every chunk has been read.
    Done,
}

/// One unit of reader work, claimed synchronously and executed afterwards.
#[derive(Debug)]
pub(crate) enum ReadStep {
    Hash { offset: u64, length: u64 },
    Read { offset: u64, length: u64 },
}

struct Progress {
    state: ReaderState,
    in_flight: usize,
    hash_busy: bool,
    hash_offset: u64,
}

/// Reads chunks from the source, respecting the checkpoint window.
pub struct ChunkReader {
    source: Arc<dyn ObjectSource>,
    exchange: Arc<Exchange>,
    /// One read in flight at a time, strictly in offset order.
    sequential: bool,
    segment_size: usize,
    checksums: bool,
    progress: Mutex<Progress>,
    hasher: Mutex<Option<ContentHasher>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ChunkReader {
    pub(crate) fn new(
        source: Arc<dyn ObjectSource>,
        exchange: Arc<Exchange>,
        options: &TransferOptions,
    ) -> Self {
        let sequential = source.sequential_only() || !source.length_known();
        let total = exchange.shared.total_length();

        // Random-access sources hash in a pass of their own; sequential ones
        // hash as they go, which only covers the content on a fresh start.
        let (state, hasher) = match (options.compute_content_md5, sequential) {
            (true, false) if total.is_some_and(|t| t > 0) => {
                (ReaderState::HashContent, Some(ContentHasher::new()))
            }
            (true, true) if !exchange.resumed() => (ReaderState::Read, Some(ContentHasher::new())),
            (true, _) => {
                if total == Some(0) {
                    exchange.shared.set_content_md5(ContentHasher::new().finish());
                } else {
                    debug!(source = %source.location(), "content MD5 unavailable for a resumed stream");
                }
                (ReaderState::Read, None)
            }
            (false, _) => (ReaderState::Read, None),
        };

        let reader = Self {
            source,
            exchange,
            sequential,
            segment_size: options.segment_size.max(1) as usize,
            checksums: options.verify_chunk_checksums,
            progress: Mutex::new(Progress {
                state,
                in_flight: 0,
                hash_busy: false,
                hash_offset: 0,
            }),
            hasher: Mutex::new(hasher),
        };
        reader.settle();
        reader
    }

    pub fn state(&self) -> ReaderState {
        lock(&self.progress).state
    }

    pub fn has_work(&self) -> bool {
        let p = lock(&self.progress);
        match p.state {
            ReaderState::HashContent => !p.hash_busy,
            ReaderState::Read => {
                self.exchange.is_accepting()
                    && (!self.sequential || p.in_flight == 0)
                    && self.exchange.scheduler.has_next()
            }
            ReaderState::Done => false,
        }
    }

    pub(crate) fn claim(&self) -> Option<ReadStep> {
        let mut p = lock(&self.progress);
        match p.state {
            ReaderState::HashContent if !p.hash_busy => {
                let total = self.exchange.shared.total_length()?;
                let length = self.exchange.shared.block_size().min(total - p.hash_offset);
                p.hash_busy = true;
                Some(ReadStep::Hash {
                    offset: p.hash_offset,
                    length,
                })
            }
            ReaderState::Read if self.exchange.is_accepting() => {
                if self.sequential && p.in_flight > 0 {
                    return None;
                }
                let scheduler = &self.exchange.scheduler;
                let offset = scheduler.next()?;
                self.exchange.chunks.expect(1);
                p.in_flight += 1;
                let length = scheduler
                    .chunk_len(offset)
                    .unwrap_or_else(|| scheduler.block_size());
                Some(ReadStep::Read { offset, length })
            }
            _ => None,
        }
    }

    pub(crate) async fn execute(
        &self,
        base: &ControllerBase,
        step: ReadStep,
    ) -> Result<(), TransferError> {
        base.check_cancelled()?;
        match step {
            ReadStep::Hash { offset, length } => self.hash(base, offset, length).await,
            ReadStep::Read { offset, length } => self.read(base, offset, length).await,
        }
    }

    async fn hash(&self, base: &ControllerBase, offset: u64, length: u64) -> Result<(), TransferError> {
        let data = base
            .call(self.source.read_range(offset, length, self.exchange.read_conditions()))
            .await?;
        if data.len() as u64 != length {
            return Err(source_changed(offset, length, data.len()));
        }
        let mut hasher = lock(&self.hasher);
        if let Some(h) = hasher.as_mut() {
            h.update(&data);
        }
        let mut p = lock(&self.progress);
        p.hash_busy = false;
        p.hash_offset = offset + length;
        if Some(p.hash_offset) == self.exchange.shared.total_length() {
            if let Some(h) = hasher.take() {
                self.exchange.shared.set_content_md5(h.finish());
            }
            debug!(source = %self.source.location(), "content MD5 computed");
            p.state = ReaderState::Read;
        }
        drop(p);
        drop(hasher);
        self.settle();
        Ok(())
    }

    async fn read(&self, base: &ControllerBase, offset: u64, length: u64) -> Result<(), TransferError> {
        let data = base
            .call(self.source.read_range(offset, length, self.exchange.read_conditions()))
            .await?;
        let got = data.len() as u64;
        let exchange = &self.exchange;

        if exchange.shared.total_length().is_some() {
            if got != length {
                return Err(source_changed(offset, length, data.len()));
            }
        } else if got < length {
            let end = offset + got;
            exchange.shared.set_total_length(end)?;
            exchange.scheduler.set_total(end);
            debug!(source = %self.source.location(), length = end, "source length discovered");
        }

        if got == 0 {
            // Nothing past the end; the expected completion is ours to report.
            exchange.chunks.signal();
        } else {
            self.hash_in_order(offset, &data);
            let mut chunk = Chunk::segmented(offset, data, self.segment_size);
            if self.checksums {
                chunk = chunk.with_checksum();
            }
            trace!(offset, len = got, "chunk read");
            exchange.shared.publish(chunk);
        }

        lock(&self.progress).in_flight -= 1;
        self.settle();
        Ok(())
    }

    fn hash_in_order(&self, offset: u64, data: &[u8]) {
        let mut hasher = lock(&self.hasher);
        let Some(h) = hasher.as_mut() else {
            return;
        };
        if lock(&self.progress).state != ReaderState::Read {
            return;
        }
        if h.consumed() == offset {
            h.update(data);
        } else {
            debug!(offset, hashed = h.consumed(), "chunk out of order, dropping content MD5");
            *hasher = None;
        }
    }

    /// Seals the fan-in once every chunk has been read.
    fn settle(&self) {
        let mut p = lock(&self.progress);
        if p.state != ReaderState::Read || p.in_flight > 0 || !self.exchange.scheduler.is_exhausted()
        {
            return;
        }
        p.state = ReaderState::Done;
        drop(p);

        if let Some(h) = lock(&self.hasher).take()
            && Some(h.consumed()) == self.exchange.shared.total_length()
        {
            self.exchange.shared.set_content_md5(h.finish());
        }
        let fired = self.exchange.chunks.seal();
        debug!(
            source = %self.source.location(),
            bytes = self.exchange.shared.bytes_read(),
            fired,
            "all chunks read"
        );
    }
}

fn source_changed(offset: u64, expected: u64, got: usize) -> TransferError {
    TransferError::PreconditionFailed(format!(
        "source returned {got} of {expected} bytes at offset {offset}"
    ))
}
