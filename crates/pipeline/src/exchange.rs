//! State shared between the reader and writer of one job.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

use datamover_location::{AccessCondition, DestinationKind, ObjectSource, PAGE_SIZE};
use datamover_transfer::{
    CheckpointSnapshot, ChunkScheduler, ControllerBase, FanIn, FinalAttributes,
    SharedTransferData, TransferError, WindowMode, plan_chunks,
};

/// State the reader and writer of one job share once the source is open.
pub(crate) struct Exchange {
    pub shared: SharedTransferData,
    pub scheduler: ChunkScheduler,
    /// One expected completion per scheduled chunk; sealed once reading ends.
    pub chunks: FanIn,
    /// Checkpoint as it was when the job was opened.
    pub initial: CheckpointSnapshot,
    pub kind: DestinationKind,
    source_etag: Option<String>,
    accepting: AtomicBool,
}

impl Exchange {
    /// Opens the source: fetches its attributes, sizes the chunks and
    /// validates the persisted checkpoint against them.
    pub async fn open(
        base: &ControllerBase,
        source: &dyn ObjectSource,
        kind: DestinationKind,
    ) -> Result<Self, TransferError> {
        let attrs = base.call(source.fetch_attributes()).await?;
        let total = source.length_known().then_some(attrs.length);
        if kind == DestinationKind::PageBlob
            && let Some(len) = total
            && len % PAGE_SIZE != 0
        {
            return Err(TransferError::InvalidConfiguration(format!(
                "page blob destinations need a length that is a multiple of {PAGE_SIZE}, source has {len}"
            )));
        }
        if total.is_none() && matches!(kind, DestinationKind::PageBlob | DestinationKind::File) {
            return Err(TransferError::InvalidConfiguration(format!(
                "{kind} destinations need a source of known length"
            )));
        }

        let plan = plan_chunks(total, kind, base.options())?;
        let shared = SharedTransferData::new(total, plan);
        shared.set_final_attributes(FinalAttributes {
            properties: attrs.properties,
            metadata: attrs.metadata,
        });

        let checkpoint = base.job().checkpoint();
        let initial = checkpoint.snapshot();
        let mode = if kind.is_sequential() {
            WindowMode::Sequential
        } else {
            WindowMode::Ranged
        };
        let scheduler = ChunkScheduler::new(
            checkpoint.clone(),
            mode,
            plan.block_size,
            total,
            base.options().max_window_size,
        )?;
        debug!(
            job = %base.job().id(),
            total = ?total,
            block_size = plan.block_size,
            chunks = ?plan.chunk_count,
            resumed = !initial.is_fresh(),
            "source opened"
        );

        Ok(Self {
            shared,
            scheduler,
            chunks: base.open_fan_in(),
            initial,
            kind,
            source_etag: attrs.etag,
            accepting: AtomicBool::new(false),
        })
    }

    pub fn resumed(&self) -> bool {
        !self.initial.is_fresh()
    }

    /// Conditions pinning reads to the source version seen at open.
    pub fn read_conditions(&self) -> AccessCondition {
        AccessCondition::if_match(self.source_etag.clone())
    }

    /// The writer is ready to take chunks.
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    pub fn start_accepting(&self) {
        self.accepting.store(true, Ordering::Release);
    }
}
