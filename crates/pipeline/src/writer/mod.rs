//! Consumer side of the pipeline.
//!
//! Every destination kind shares the same phases (see [`WriterState`]); they
//! differ in how chunks are claimed and written:
//!
//! - sequential (local files, streams, append-only objects): strictly by
//!   expected offset, one write at a time
//! - block: any available chunk, staged under a deterministic block id
//! - range (page blobs, files): any available chunk at its own offset
//! - single-shot: small block objects, written with one put once all chunks
//!   are in

mod block;
mod range;
mod sequential;
mod single;
mod state;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, trace};

use datamover_location::{AccessCondition, DestinationKind, ObjectDestination, ObjectSource};
use datamover_transfer::commit::{commit_destination, final_attributes, normalize_after_put};
use datamover_transfer::validation::{check_destination_type, check_resume_destination};
use datamover_transfer::{Chunk, ControllerBase, TransferError, TransferOptions};

use crate::exchange::Exchange;
use block::BlockWriter;
use range::RangeWriter;
use sequential::SequentialWriter;
use single::SingleShotWriter;

pub use state::{WriterEvent, WriterState, transition};

enum Discipline {
    Sequential(SequentialWriter),
    Block(BlockWriter),
    Range(RangeWriter),
    SingleShot(SingleShotWriter),
}

/// One unit of writer work, claimed synchronously and executed afterwards.
pub(crate) enum WriteStep {
    Probe,
    Create,
    Write(Chunk),
    PutWhole(Vec<Chunk>),
    Commit,
}

struct Phase {
    state: WriterState,
    /// A single-unit step (probe, create, commit) is in flight.
    busy: bool,
}

/// Writes claimed chunks to the destination and commits it.
pub struct ChunkWriter {
    source: Arc<dyn ObjectSource>,
    dest: Arc<dyn ObjectDestination>,
    exchange: Arc<Exchange>,
    discipline: Discipline,
    verify_checksums: bool,
    phase: Mutex<Phase>,
}

fn single_shot(total: Option<u64>, block_size: u64, options: &TransferOptions) -> bool {
    total.is_some_and(|t| {
        t > 0
            && t <= options.single_put_threshold
            && t.div_ceil(block_size) <= options.max_window_size as u64
    })
}

impl ChunkWriter {
    pub(crate) fn new(
        source: Arc<dyn ObjectSource>,
        dest: Arc<dyn ObjectDestination>,
        exchange: Arc<Exchange>,
        options: &TransferOptions,
    ) -> Self {
        let kind = exchange.kind;
        let block_size = exchange.shared.block_size();
        let discipline = match kind {
            DestinationKind::BlockBlob
                if single_shot(exchange.shared.total_length(), block_size, options) =>
            {
                Discipline::SingleShot(SingleShotWriter)
            }
            DestinationKind::BlockBlob => {
                Discipline::Block(BlockWriter::new(&dest.location().name(), block_size))
            }
            DestinationKind::PageBlob => Discipline::Range(RangeWriter::new(true)),
            DestinationKind::File => Discipline::Range(RangeWriter::new(false)),
            DestinationKind::AppendBlob | DestinationKind::Local | DestinationKind::Stream => {
                Discipline::Sequential(SequentialWriter::new(kind, exchange.initial.entry_offset))
            }
        };
        Self {
            source,
            dest,
            exchange,
            discipline,
            verify_checksums: options.verify_chunk_checksums,
            phase: Mutex::new(Phase {
                state: WriterState::FetchAttributes,
                busy: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Phase> {
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> WriterState {
        self.lock().state
    }

    /// Whether the destination is allocated before the first write.
    fn needs_create(&self) -> bool {
        matches!(self.discipline, Discipline::Sequential(_) | Discipline::Range(_))
    }

    fn can_claim_chunk(&self) -> bool {
        let exchange = &self.exchange;
        match &self.discipline {
            Discipline::Sequential(w) => w.can_claim(&exchange.shared),
            Discipline::SingleShot(w) => w.can_claim(exchange),
            Discipline::Block(_) | Discipline::Range(_) => exchange.shared.available() > 0,
        }
    }

    pub fn has_work(&self) -> bool {
        let p = self.lock();
        match p.state {
            WriterState::FetchAttributes | WriterState::Create | WriterState::Commit => !p.busy,
            WriterState::Write => self.exchange.chunks.is_fired() || self.can_claim_chunk(),
            WriterState::Finished | WriterState::Error => false,
        }
    }

    pub(crate) fn claim(&self) -> Option<WriteStep> {
        let mut p = self.lock();
        match p.state {
            WriterState::FetchAttributes | WriterState::Create | WriterState::Commit if !p.busy => {
                p.busy = true;
                Some(match p.state {
                    WriterState::FetchAttributes => WriteStep::Probe,
                    WriterState::Create => WriteStep::Create,
                    _ => WriteStep::Commit,
                })
            }
            WriterState::Write => {
                if self.exchange.chunks.is_fired() {
                    p.state = transition(p.state, WriterEvent::AllWritten);
                    p.busy = true;
                    debug!(destination = %self.dest.location(), "all chunks written");
                    return Some(WriteStep::Commit);
                }
                let shared = &self.exchange.shared;
                match &self.discipline {
                    Discipline::Sequential(w) => w.claim(shared).map(WriteStep::Write),
                    Discipline::SingleShot(w) => w.claim(&self.exchange).map(WriteStep::PutWhole),
                    Discipline::Block(_) | Discipline::Range(_) => {
                        shared.claim_any().map(WriteStep::Write)
                    }
                }
            }
            _ => None,
        }
    }

    pub(crate) async fn execute(
        &self,
        base: &ControllerBase,
        step: WriteStep,
    ) -> Result<(), TransferError> {
        let result = match base.check_cancelled() {
            Err(e) => Err(e),
            Ok(()) => match step {
                WriteStep::Probe => self.probe(base).await,
                WriteStep::Create => self.create(base).await,
                WriteStep::Write(chunk) => self.write(base, chunk).await,
                WriteStep::PutWhole(chunks) => self.put_whole(base, chunks).await,
                WriteStep::Commit => self.commit(base).await,
            },
        };
        if result.is_err() {
            self.advance(WriterEvent::Failed);
        }
        result
    }

    fn advance(&self, event: WriterEvent) {
        let mut p = self.lock();
        let next = transition(p.state, event);
        if next == p.state {
            // Another unit already took this transition and may hold `busy`.
            return;
        }
        debug!(destination = %self.dest.location(), from = ?p.state, to = ?next, "writer transition");
        p.state = next;
        p.busy = false;
        if matches!(next, WriterState::Write | WriterState::Commit) {
            self.exchange.start_accepting();
        }
    }

    async fn probe(&self, base: &ControllerBase) -> Result<(), TransferError> {
        let kind = self.exchange.kind;
        let found = match base.call(self.dest.fetch_attributes()).await {
            Ok(attrs) => Some(attrs),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };
        if let Some(attrs) = &found {
            check_destination_type(kind, attrs)?;
        }
        // A stream has no prior content to protect.
        base.check_overwrite(found.is_some() && kind != DestinationKind::Stream)?;
        check_resume_destination(
            kind,
            &self.exchange.initial,
            found.as_ref(),
            self.exchange.shared.total_length(),
        )?;

        let create = self.needs_create() && !self.exchange.resumed();
        self.advance(WriterEvent::Probed {
            create,
            all_written: self.exchange.chunks.is_fired(),
        });
        Ok(())
    }

    async fn create(&self, base: &ControllerBase) -> Result<(), TransferError> {
        let size = match self.exchange.kind {
            DestinationKind::AppendBlob | DestinationKind::Stream => 0,
            _ => self.exchange.shared.total_length().unwrap_or(0),
        };
        base.call(self.dest.create(size, AccessCondition::none()))
            .await?;
        debug!(destination = %self.dest.location(), size, "destination created");
        self.advance(WriterEvent::Created {
            all_written: self.exchange.chunks.is_fired(),
        });
        Ok(())
    }

    async fn write(&self, base: &ControllerBase, chunk: Chunk) -> Result<(), TransferError> {
        if self.verify_checksums {
            chunk.verify()?;
        }
        let (offset, length) = (chunk.offset(), chunk.len());
        let dest = &*self.dest;
        match &self.discipline {
            Discipline::Sequential(w) => w.write(base, &*self.source, dest, chunk).await?,
            Discipline::Block(w) => w.write(base, dest, chunk).await?,
            Discipline::Range(w) => w.write(base, dest, chunk).await?,
            Discipline::SingleShot(_) => {
                return Err(TransferError::InvalidConfiguration(
                    "single-shot destinations take the whole object at once".into(),
                ));
            }
        }
        self.finish_chunk(base, offset, length);
        Ok(())
    }

    async fn put_whole(&self, base: &ControllerBase, mut chunks: Vec<Chunk>) -> Result<(), TransferError> {
        let Discipline::SingleShot(w) = &self.discipline else {
            return Err(TransferError::InvalidConfiguration(
                "only single-shot destinations take the whole object at once".into(),
            ));
        };
        if self.verify_checksums {
            for chunk in &chunks {
                chunk.verify()?;
            }
        }
        let shared = &self.exchange.shared;
        let attrs = base
            .call(final_attributes(shared.final_attributes(), &*self.source))
            .await?;
        w.put(base, &*self.dest, &mut chunks, attrs, shared.content_md5())
            .await?;
        for chunk in &chunks {
            self.finish_chunk(base, chunk.offset(), chunk.len());
        }
        Ok(())
    }

    /// Bookkeeping once a chunk is durably written.
    fn finish_chunk(&self, base: &ControllerBase, offset: u64, length: u64) {
        self.exchange.scheduler.complete(offset);
        self.exchange.shared.record_written(length);
        base.report_progress(length);
        trace!(offset, len = length, "chunk written");
        if self.exchange.chunks.signal() {
            self.advance(WriterEvent::AllWritten);
        }
    }

    async fn commit(&self, base: &ControllerBase) -> Result<(), TransferError> {
        let shared = &self.exchange.shared;
        let dest = &*self.dest;
        let attrs = base
            .call(final_attributes(shared.final_attributes(), &*self.source))
            .await?;
        match &self.discipline {
            Discipline::SingleShot(_) => {
                let mut desired = attrs.properties;
                if let Some(md5) = shared.content_md5() {
                    desired.content_md5 = Some(md5.to_string());
                }
                base.call(normalize_after_put(dest, &desired)).await?;
            }
            Discipline::Block(w) => {
                let ids = w.block_list(shared.total_length().unwrap_or(0));
                base.call(commit_destination(
                    dest,
                    self.exchange.kind,
                    ids,
                    attrs,
                    shared.content_md5(),
                ))
                .await?;
            }
            Discipline::Sequential(_) | Discipline::Range(_) => {
                base.call(commit_destination(
                    dest,
                    self.exchange.kind,
                    Vec::new(),
                    attrs,
                    shared.content_md5(),
                ))
                .await?;
            }
        }
        self.advance(WriterEvent::Committed);
        base.succeed();
        Ok(())
    }
}
