//! Streaming transfer controller tying the reader and writer together.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use tracing::debug;

use datamover_location::{DestinationKind, ObjectDestination, ObjectSource};
use datamover_transfer::{ControllerBase, JobStatus, TransferController, TransferError, WorkFuture};

use crate::exchange::Exchange;
use crate::reader::{ChunkReader, ReadStep};
use crate::writer::{ChunkWriter, WriteStep};

struct Stages {
    exchange: Arc<Exchange>,
    reader: ChunkReader,
    writer: ChunkWriter,
}

enum Step {
    Cancel,
    Open,
    Write(WriteStep),
    Read(ReadStep),
    Idle,
}

/// Client-mediated transfer: reads the source chunk by chunk and writes each
/// chunk to the destination.
///
/// The first unit opens the source; afterwards writer work is preferred over
/// reader work so buffered chunks drain before more are read.
pub struct ChunkedTransferController {
    base: ControllerBase,
    source: Arc<dyn ObjectSource>,
    dest: Arc<dyn ObjectDestination>,
    kind: DestinationKind,
    opening: AtomicBool,
    stages: OnceLock<Stages>,
}

impl ChunkedTransferController {
    pub fn new(
        base: ControllerBase,
        source: Arc<dyn ObjectSource>,
        dest: Arc<dyn ObjectDestination>,
    ) -> Result<Self, TransferError> {
        let kind = dest.location().destination_kind().ok_or_else(|| {
            TransferError::InvalidConfiguration(format!("{} cannot be written", dest.location()))
        })?;
        Ok(Self {
            base,
            source,
            dest,
            kind,
            opening: AtomicBool::new(false),
            stages: OnceLock::new(),
        })
    }

    fn next_step(&self) -> Step {
        if self.base.is_finished() {
            return Step::Idle;
        }
        if self.base.is_cancel_requested() {
            return Step::Cancel;
        }
        let Some(stages) = self.stages.get() else {
            return if self.opening.swap(true, Ordering::AcqRel) {
                Step::Idle
            } else {
                Step::Open
            };
        };
        if let Some(step) = stages.writer.claim() {
            return Step::Write(step);
        }
        stages.reader.claim().map_or(Step::Idle, Step::Read)
    }

    async fn run(&self, step: Step) -> Result<(), TransferError> {
        match step {
            Step::Cancel => Err(TransferError::Cancelled),
            Step::Open => self.open().await,
            Step::Write(step) => match self.stages.get() {
                Some(stages) => stages.writer.execute(&self.base, step).await,
                None => Ok(()),
            },
            Step::Read(step) => match self.stages.get() {
                Some(stages) => stages.reader.execute(&self.base, step).await,
                None => Ok(()),
            },
            Step::Idle => Ok(()),
        }
    }

    async fn open(&self) -> Result<(), TransferError> {
        self.base.check_cancelled()?;
        let job = self.base.job();
        job.set_status(JobStatus::Transfer);
        let exchange = Arc::new(Exchange::open(&self.base, &*self.source, self.kind).await?);

        if exchange.resumed()
            && let Some(done) = exchange.scheduler.completed_bytes()
        {
            debug!(job = %job.id(), bytes = done, "resuming with bytes already transferred");
            self.base.report_progress(done);
        }

        let options = self.base.options();
        let writer = ChunkWriter::new(
            Arc::clone(&self.source),
            Arc::clone(&self.dest),
            Arc::clone(&exchange),
            options,
        );
        let reader = ChunkReader::new(Arc::clone(&self.source), Arc::clone(&exchange), options);
        let _ = self.stages.set(Stages {
            exchange,
            reader,
            writer,
        });
        Ok(())
    }
}

impl TransferController for ChunkedTransferController {
    fn base(&self) -> &ControllerBase {
        &self.base
    }

    fn has_work(&self) -> bool {
        if self.base.is_finished() {
            return false;
        }
        if self.base.cancel_pending() {
            return true;
        }
        match self.stages.get() {
            None => !self.opening.load(Ordering::Acquire),
            Some(stages) => stages.writer.has_work() || stages.reader.has_work(),
        }
    }

    fn do_work(&self) -> WorkFuture<'_> {
        let unit = self.base.begin_unit();
        let step = self.next_step();
        Box::pin(async move {
            let _unit = unit;
            if let Err(e) = self.run(step).await {
                if let Some(stages) = self.stages.get() {
                    stages.exchange.shared.release_all();
                }
                self.base.fail(e);
            }
            self.base.is_finished()
        })
    }
}
