//! Server-to-server copies orchestrated chunk by chunk.
//!
//! The destination service copies each chunk straight from the source; the
//! controller only decides chunk boundaries, guards every call with the
//! conditions the destination kind needs and commits at the end. Progress is
//! checkpointed exactly like a client-mediated transfer.

mod ranges;
mod state;

use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};

use tracing::{debug, trace};

use datamover_location::{
    AccessCondition, ByteRange, ChunkAddress, ChunkPayload, DestinationKind, ObjectDestination,
    ObjectSource, PAGE_SIZE,
};
use datamover_transfer::commit::{commit_destination, final_attributes, normalize_after_put};
use datamover_transfer::validation::{check_destination_type, check_resume_destination};
use datamover_transfer::verify::resolve_append_race;
use datamover_transfer::{
    BlockIdGenerator, CheckpointSnapshot, ChunkScheduler, ControllerBase, FanIn, FinalAttributes,
    JobStatus, TransferController, TransferError, WindowMode, WorkFuture, plan_chunks,
};

use ranges::RangeDiscovery;
pub use ranges::{populated_chunks, spans};
pub use state::{SyncCopyEvent, SyncCopyState, transition};

enum Discipline {
    Block(BlockIdGenerator),
    Range,
    Append,
    SingleShot,
}

/// Everything fixed once the source attributes are known.
struct Plan {
    total: u64,
    block_size: u64,
    source_uri: String,
    source_etag: Option<String>,
    attributes: FinalAttributes,
    discipline: Discipline,
    scheduler: ChunkScheduler,
    chunks: FanIn,
    initial: CheckpointSnapshot,
    discovery: OnceLock<RangeDiscovery>,
}

impl Plan {
    fn resumed(&self) -> bool {
        !self.initial.is_fresh()
    }

    fn chunk_len(&self, offset: u64) -> u64 {
        self.block_size.min(self.total - offset)
    }
}

struct Phase {
    state: SyncCopyState,
    busy: bool,
    in_flight: usize,
    single_claimed: bool,
}

enum Step {
    Cancel,
    Idle,
    FetchSource,
    CheckDestination,
    Create,
    Discover(ByteRange),
    Copy(u64),
    PutWhole,
    Commit,
}

/// Copies an object server-to-server, one range or block per call.
pub struct SyncCopyController {
    base: ControllerBase,
    source: Arc<dyn ObjectSource>,
    dest: Arc<dyn ObjectDestination>,
    kind: DestinationKind,
    phase: Mutex<Phase>,
    plan: OnceLock<Plan>,
}

impl SyncCopyController {
    pub fn new(
        base: ControllerBase,
        source: Arc<dyn ObjectSource>,
        dest: Arc<dyn ObjectDestination>,
    ) -> Result<Self, TransferError> {
        let location = dest.location();
        let kind = match location.destination_kind() {
            Some(kind) if location.is_remote() => kind,
            _ => {
                return Err(TransferError::InvalidConfiguration(format!(
                    "{location} cannot receive a server-side copy"
                )));
            }
        };
        Ok(Self {
            base,
            source,
            dest,
            kind,
            phase: Mutex::new(Phase {
                state: SyncCopyState::FetchSourceAttributes,
                busy: false,
                in_flight: 0,
                single_claimed: false,
            }),
            plan: OnceLock::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Phase> {
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> SyncCopyState {
        self.lock().state
    }

    fn plan(&self) -> Result<&Plan, TransferError> {
        self.plan.get().ok_or_else(|| {
            TransferError::InvalidConfiguration("source attributes have not been fetched".into())
        })
    }

    fn advance(&self, event: SyncCopyEvent) {
        let mut p = self.lock();
        let next = transition(p.state, event);
        if next == p.state {
            // Another unit already took this transition and may hold `busy`.
            return;
        }
        debug!(job = %self.base.job().id(), from = ?p.state, to = ?next, "copy transition");
        p.state = next;
        p.busy = false;
    }

    fn copy_has_work(&self, p: &Phase, plan: &Plan) -> bool {
        if plan.chunks.is_fired() {
            return true;
        }
        match plan.discipline {
            Discipline::SingleShot => !p.single_claimed,
            Discipline::Append if p.in_flight > 0 => false,
            _ => {
                plan.scheduler.has_next()
                    || (plan.scheduler.is_exhausted() && plan.chunks.pending() == 0)
            }
        }
    }

    fn claim(&self) -> Step {
        if self.base.is_finished() {
            return Step::Idle;
        }
        if self.base.is_cancel_requested() {
            return Step::Cancel;
        }
        let mut p = self.lock();
        match p.state {
            SyncCopyState::FetchSourceAttributes
            | SyncCopyState::GetDestination
            | SyncCopyState::Create
            | SyncCopyState::Commit
                if !p.busy =>
            {
                p.busy = true;
                match p.state {
                    SyncCopyState::FetchSourceAttributes => Step::FetchSource,
                    SyncCopyState::GetDestination => Step::CheckDestination,
                    SyncCopyState::Create => Step::Create,
                    _ => Step::Commit,
                }
            }
            SyncCopyState::PreCopy => self
                .plan
                .get()
                .and_then(|plan| plan.discovery.get())
                .and_then(RangeDiscovery::claim_span)
                .map_or(Step::Idle, Step::Discover),
            SyncCopyState::Copy => {
                let Some(plan) = self.plan.get() else {
                    return Step::Idle;
                };
                if plan.chunks.is_fired() {
                    p.state = transition(p.state, SyncCopyEvent::AllCopied);
                    p.busy = true;
                    return Step::Commit;
                }
                match plan.discipline {
                    Discipline::SingleShot => {
                        if p.single_claimed {
                            return Step::Idle;
                        }
                        p.single_claimed = true;
                        plan.chunks.expect(1);
                        plan.chunks.seal();
                        Step::PutWhole
                    }
                    Discipline::Append if p.in_flight > 0 => Step::Idle,
                    _ => match plan.scheduler.next() {
                        Some(offset) => {
                            plan.chunks.expect(1);
                            p.in_flight += 1;
                            Step::Copy(offset)
                        }
                        None if plan.scheduler.is_exhausted() && plan.chunks.seal() => {
                            p.state = transition(p.state, SyncCopyEvent::AllCopied);
                            p.busy = true;
                            Step::Commit
                        }
                        None => Step::Idle,
                    },
                }
            }
            _ => Step::Idle,
        }
    }

    async fn run(&self, step: Step) -> Result<(), TransferError> {
        match step {
            Step::Cancel => Err(TransferError::Cancelled),
            Step::Idle => Ok(()),
            Step::FetchSource => self.fetch_source().await,
            Step::CheckDestination => self.check_destination().await,
            Step::Create => self.create().await,
            Step::Discover(span) => self.discover(span).await,
            Step::Copy(offset) => self.copy_chunk(offset).await,
            Step::PutWhole => self.put_whole().await,
            Step::Commit => self.commit().await,
        }
    }

    async fn fetch_source(&self) -> Result<(), TransferError> {
        self.base.job().set_status(JobStatus::Transfer);
        let attrs = self.base.call(self.source.fetch_attributes()).await?;
        let source_uri = self.source.copy_source_uri().ok_or_else(|| {
            TransferError::InvalidConfiguration(format!(
                "{} cannot be read by the destination service",
                self.source.location()
            ))
        })?;
        let total = attrs.length;
        if self.kind == DestinationKind::PageBlob && total % PAGE_SIZE != 0 {
            return Err(TransferError::InvalidConfiguration(format!(
                "page blob destinations need a length that is a multiple of {PAGE_SIZE}, source has {total}"
            )));
        }

        let options = self.base.options();
        let chunk_plan = plan_chunks(Some(total), self.kind, options)?;
        let block_size = chunk_plan.block_size;
        let discipline = match self.kind {
            DestinationKind::BlockBlob
                if total > 0
                    && total <= options.single_put_threshold
                    && total.div_ceil(block_size) <= options.max_window_size as u64 =>
            {
                Discipline::SingleShot
            }
            DestinationKind::BlockBlob => {
                Discipline::Block(BlockIdGenerator::new(&self.dest.location().name()))
            }
            DestinationKind::AppendBlob => Discipline::Append,
            _ => Discipline::Range,
        };
        let checkpoint = self.base.job().checkpoint();
        let initial = checkpoint.snapshot();
        let mode = if self.kind.is_sequential() {
            WindowMode::Sequential
        } else {
            WindowMode::Ranged
        };
        let scheduler = ChunkScheduler::new(
            Arc::clone(checkpoint),
            mode,
            block_size,
            Some(total),
            options.max_window_size,
        )?;
        debug!(
            job = %self.base.job().id(),
            total,
            block_size,
            chunks = ?chunk_plan.chunk_count,
            resumed = !initial.is_fresh(),
            "copy source opened"
        );
        if !initial.is_fresh()
            && let Some(done) = scheduler.completed_bytes()
        {
            self.base.report_progress(done);
        }

        let _ = self.plan.set(Plan {
            total,
            block_size,
            source_uri,
            source_etag: attrs.etag,
            attributes: FinalAttributes {
                properties: attrs.properties,
                metadata: attrs.metadata,
            },
            discipline,
            scheduler,
            chunks: self.base.open_fan_in(),
            initial,
            discovery: OnceLock::new(),
        });
        self.advance(SyncCopyEvent::SourceFetched);
        Ok(())
    }

    /// Sparse sources copied into zero-filled destinations skip empty chunks.
    fn needs_discovery(&self, plan: &Plan) -> bool {
        plan.total > 0
            && self.source.needs_range_discovery()
            && matches!(self.kind, DestinationKind::PageBlob | DestinationKind::File)
    }

    async fn check_destination(&self) -> Result<(), TransferError> {
        let plan = self.plan()?;
        let existing = match self.base.call(self.dest.fetch_attributes()).await {
            Ok(attrs) => Some(attrs),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };
        if let Some(attrs) = &existing {
            check_destination_type(self.kind, attrs)?;
        }
        self.base.check_overwrite(existing.is_some())?;
        check_resume_destination(self.kind, &plan.initial, existing.as_ref(), Some(plan.total))?;

        let create = self.kind != DestinationKind::BlockBlob && !plan.resumed();
        let discover = self.needs_discovery(plan);
        if discover && !create {
            self.start_discovery(plan);
        }
        self.advance(SyncCopyEvent::DestinationChecked { create, discover });
        Ok(())
    }

    async fn create(&self) -> Result<(), TransferError> {
        let plan = self.plan()?;
        let size = match self.kind {
            DestinationKind::AppendBlob => 0,
            _ => plan.total,
        };
        self.base
            .call(self.dest.create(size, AccessCondition::none()))
            .await?;
        debug!(destination = %self.dest.location(), size, "destination created");
        let discover = self.needs_discovery(plan);
        if discover {
            self.start_discovery(plan);
        }
        self.advance(SyncCopyEvent::Created { discover });
        Ok(())
    }

    fn start_discovery(&self, plan: &Plan) {
        let spans = spans(plan.total, self.base.options().range_span_size);
        let done = self.base.fan_in(spans.len());
        trace!(spans = spans.len(), "discovering populated ranges");
        let _ = plan.discovery.set(RangeDiscovery::new(spans, done));
    }

    async fn discover(&self, span: ByteRange) -> Result<(), TransferError> {
        let plan = self.plan()?;
        let ranges = self
            .base
            .call(self.source.list_ranges(span.offset, span.length))
            .await?;
        let Some(discovery) = plan.discovery.get() else {
            return Ok(());
        };
        if !discovery.record(ranges) {
            return Ok(());
        }

        let populated = populated_chunks(discovery.take_ranges(), plan.block_size, plan.total);
        let before = plan.scheduler.completed_bytes().unwrap_or(0);
        debug!(job = %self.base.job().id(), chunks = populated.len(), "populated ranges discovered");
        plan.scheduler.restrict_to(populated);
        let after = plan.scheduler.completed_bytes().unwrap_or(0);
        // Empty chunks count as transferred.
        self.base.report_progress(after.saturating_sub(before));
        self.advance(SyncCopyEvent::RangesDiscovered);
        Ok(())
    }

    async fn copy_chunk(&self, offset: u64) -> Result<(), TransferError> {
        let plan = self.plan()?;
        let length = plan.chunk_len(offset);
        let payload = ChunkPayload::SourceRange {
            source_uri: plan.source_uri.clone(),
            offset,
            length,
        };
        let guarded = AccessCondition {
            source_if_match: plan.source_etag.clone(),
            ..AccessCondition::none()
        };
        let dest = &*self.dest;
        match &plan.discipline {
            Discipline::Block(ids) => {
                let id = ids.id_for_offset(offset, plan.block_size);
                trace!(offset, %id, "copying block");
                self.base
                    .call(dest.write_chunk(ChunkAddress::Block { id }, payload, guarded))
                    .await?;
            }
            Discipline::Range => {
                trace!(offset, len = length, "copying range");
                self.base
                    .call(dest.write_chunk(ChunkAddress::Range { offset }, payload, guarded))
                    .await?;
            }
            Discipline::Append => {
                let conditions = AccessCondition {
                    max_size: Some(self.kind.max_size()),
                    source_if_match: plan.source_etag.clone(),
                    ..AccessCondition::append_at(offset)
                };
                let result = self
                    .base
                    .call(dest.write_chunk(ChunkAddress::Append, payload, conditions))
                    .await;
                match result {
                    Ok(()) => {}
                    Err(e) if e.is_precondition_failed() => {
                        debug!(offset, error = %e, "append condition failed, verifying destination");
                        self.base
                            .call(resolve_append_race(&*self.source, dest, offset, length, e))
                            .await?;
                    }
                    Err(e) => return Err(e),
                }
            }
            Discipline::SingleShot => {
                return Err(TransferError::InvalidConfiguration(
                    "single-shot copies take the whole object at once".into(),
                ));
            }
        }

        plan.scheduler.complete(offset);
        self.base.report_progress(length);
        self.lock().in_flight -= 1;
        if plan.chunks.signal() {
            self.advance(SyncCopyEvent::AllCopied);
        }
        Ok(())
    }

    async fn put_whole(&self) -> Result<(), TransferError> {
        let plan = self.plan()?;
        let payload = ChunkPayload::SourceObject {
            source_uri: plan.source_uri.clone(),
        };
        let conditions = AccessCondition {
            source_if_match: plan.source_etag.clone(),
            ..AccessCondition::none()
        };
        let attrs = plan.attributes.clone();
        self.base
            .call(self.dest.put_whole(payload, attrs.properties, attrs.metadata, conditions))
            .await?;
        debug!(destination = %self.dest.location(), bytes = plan.total, "object copied in one call");
        self.base.report_progress(plan.total);
        if plan.chunks.signal() {
            self.advance(SyncCopyEvent::AllCopied);
        }
        Ok(())
    }

    async fn commit(&self) -> Result<(), TransferError> {
        let plan = self.plan()?;
        let dest = &*self.dest;
        let attrs = self
            .base
            .call(final_attributes(Some(plan.attributes.clone()), &*self.source))
            .await?;
        match &plan.discipline {
            Discipline::SingleShot => {
                self.base
                    .call(normalize_after_put(dest, &attrs.properties))
                    .await?;
            }
            Discipline::Block(ids) => {
                let block_ids = ids.ids(plan.total.div_ceil(plan.block_size));
                self.base
                    .call(commit_destination(dest, self.kind, block_ids, attrs, None))
                    .await?;
            }
            Discipline::Range | Discipline::Append => {
                self.base
                    .call(commit_destination(dest, self.kind, Vec::new(), attrs, None))
                    .await?;
            }
        }
        self.advance(SyncCopyEvent::Committed);
        self.base.succeed();
        Ok(())
    }
}

impl TransferController for SyncCopyController {
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
        let p = self.lock();
        match p.state {
            SyncCopyState::FetchSourceAttributes
            | SyncCopyState::GetDestination
            | SyncCopyState::Create
            | SyncCopyState::Commit => !p.busy,
            SyncCopyState::PreCopy => self
                .plan
                .get()
                .and_then(|plan| plan.discovery.get())
                .is_some_and(RangeDiscovery::has_span),
            SyncCopyState::Copy => self
                .plan
                .get()
                .is_some_and(|plan| self.copy_has_work(&p, plan)),
            SyncCopyState::Finished | SyncCopyState::Error => false,
        }
    }

    fn do_work(&self) -> WorkFuture<'_> {
        let unit = self.base.begin_unit();
        let step = self.claim();
        Box::pin(async move {
            let _unit = unit;
            if let Err(e) = self.run(step).await {
                self.advance(SyncCopyEvent::Failed);
                self.base.fail(e);
            }
            self.base.is_finished()
        })
    }
}
