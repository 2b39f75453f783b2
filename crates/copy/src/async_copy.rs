//! Server-initiated copies tracked by polling.
//!
//! `FetchSourceAttributes -> GetDestination -> StartCopy -> GetCopyState`,
//! ending in `Finished` or `Error`. A job persisted while its copy was running
//! comes back in `GetCopyState` with the recorded copy id.
//!
//! Between polls the controller reports no work and names the instant the next
//! poll is due through [`TransferController::eligible_at`]; nothing sleeps.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::time::Instant;
use tracing::{debug, info, trace};

use datamover_location::{
    AccessCondition, CopyState, DestinationKind, ObjectDestination, ObjectSource, SourceUri,
};
use datamover_transfer::commit::final_attributes;
use datamover_transfer::validation::check_destination_type;
use datamover_transfer::{
    ControllerBase, FinalAttributes, JobStatus, TransferController, TransferError, WorkFuture,
    check_size_limit,
};

use crate::backoff::PollBackoff;

/// Phases of an asynchronous copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncCopyState {
    FetchSourceAttributes,
    GetDestination,
    StartCopy,
    GetCopyState,
    Finished,
    Error,
}

impl AsyncCopyState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncCopyEvent {
    SourceFetched,
    DestinationChecked,
    CopyStarted,
    CopyCompleted,
    Failed,
}

/// Next state after `event`. Terminal states absorb everything.
pub fn transition(state: AsyncCopyState, event: AsyncCopyEvent) -> AsyncCopyState {
    use AsyncCopyEvent as E;
    use AsyncCopyState as S;

    if state.is_terminal() {
        return state;
    }
    match (state, event) {
        (_, E::Failed) => S::Error,
        (S::FetchSourceAttributes, E::SourceFetched) => S::GetDestination,
        (S::GetDestination, E::DestinationChecked) => S::StartCopy,
        (S::StartCopy, E::CopyStarted) => S::GetCopyState,
        (S::GetCopyState, E::CopyCompleted) => S::Finished,
        (s, _) => s,
    }
}

enum CopySource {
    Uri(String),
    Object(Arc<dyn ObjectSource>),
}

struct Progress {
    state: AsyncCopyState,
    busy: bool,
    source_uri: Option<String>,
    source_etag: Option<String>,
    attributes: Option<FinalAttributes>,
    copy_id: Option<String>,
    next_poll: Option<Instant>,
    backoff: PollBackoff,
    /// Bytes already reported as progress.
    reported: u64,
}

enum Step {
    Cancel,
    Idle,
    FetchSource,
    CheckDestination,
    Start { uri: String, etag: Option<String> },
    Poll { copy_id: String },
}

/// Collects the pieces of an [`AsyncCopyController`].
///
/// Exactly one of [`source_uri`](Self::source_uri) and
/// [`source`](Self::source) must be given.
pub struct AsyncCopyBuilder {
    base: ControllerBase,
    dest: Arc<dyn ObjectDestination>,
    source_uri: Option<String>,
    source: Option<Arc<dyn ObjectSource>>,
}

impl AsyncCopyBuilder {
    /// Copies from an arbitrary URI the destination service can reach.
    pub fn source_uri(mut self, uri: impl Into<String>) -> Self {
        self.source_uri = Some(uri.into());
        self
    }

    /// Copies from an object whose attributes can be fetched first.
    pub fn source(mut self, source: Arc<dyn ObjectSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn build(self) -> Result<AsyncCopyController, TransferError> {
        let source = match (self.source_uri, self.source) {
            (Some(uri), None) => CopySource::Uri(uri),
            (None, Some(source)) => CopySource::Object(source),
            (Some(_), Some(_)) => {
                return Err(TransferError::InvalidConfiguration(
                    "give either a source URI or a source object, not both".into(),
                ));
            }
            (None, None) => {
                return Err(TransferError::InvalidConfiguration(
                    "an asynchronous copy needs a source".into(),
                ));
            }
        };
        let location = self.dest.location();
        let kind = match location.destination_kind() {
            Some(kind) if location.is_remote() => kind,
            _ => {
                return Err(TransferError::InvalidConfiguration(format!(
                    "{location} cannot receive a server-side copy"
                )));
            }
        };

        let job = self.base.job();
        let (state, copy_id) = if job.status() == JobStatus::Monitor {
            let id = job.copy_id().ok_or_else(|| {
                TransferError::ResumeStateInconsistent(format!(
                    "job {} is monitoring a copy but has no copy id",
                    job.id()
                ))
            })?;
            debug!(job = %job.id(), copy_id = %id, "resuming copy monitor");
            (AsyncCopyState::GetCopyState, Some(id))
        } else {
            (AsyncCopyState::FetchSourceAttributes, None)
        };
        let source_uri = match &source {
            CopySource::Uri(uri) => Some(uri.clone()),
            CopySource::Object(_) => None,
        };
        let backoff = PollBackoff::new(&self.base.options().copy_poll);

        Ok(AsyncCopyController {
            base: self.base,
            source,
            dest: self.dest,
            kind,
            progress: Mutex::new(Progress {
                state,
                busy: false,
                source_uri,
                source_etag: None,
                attributes: None,
                copy_id,
                next_poll: None,
                backoff,
                reported: 0,
            }),
        })
    }
}

/// Starts a server-side copy and polls it to completion.
pub struct AsyncCopyController {
    base: ControllerBase,
    source: CopySource,
    dest: Arc<dyn ObjectDestination>,
    kind: DestinationKind,
    progress: Mutex<Progress>,
}

impl AsyncCopyController {
    pub fn builder(base: ControllerBase, dest: Arc<dyn ObjectDestination>) -> AsyncCopyBuilder {
        AsyncCopyBuilder {
            base,
            dest,
            source_uri: None,
            source: None,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Progress> {
        self.progress.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> AsyncCopyState {
        self.lock().state
    }

    /// Copy id once the copy has been started or adopted.
    pub fn copy_id(&self) -> Option<String> {
        self.lock().copy_id.clone()
    }

    fn claim(&self) -> Step {
        if self.base.is_finished() {
            return Step::Idle;
        }
        if self.base.is_cancel_requested() {
            return Step::Cancel;
        }
        let mut p = self.lock();
        if p.busy || p.state.is_terminal() {
            return Step::Idle;
        }
        let step = match p.state {
            AsyncCopyState::FetchSourceAttributes => Step::FetchSource,
            AsyncCopyState::GetDestination => Step::CheckDestination,
            AsyncCopyState::StartCopy => match &p.source_uri {
                Some(uri) => Step::Start {
                    uri: uri.clone(),
                    etag: p.source_etag.clone(),
                },
                None => return Step::Idle,
            },
            AsyncCopyState::GetCopyState => {
                if p.next_poll.is_some_and(|at| Instant::now() < at) {
                    return Step::Idle;
                }
                match &p.copy_id {
                    Some(id) => Step::Poll {
                        copy_id: id.clone(),
                    },
                    None => return Step::Idle,
                }
            }
            AsyncCopyState::Finished | AsyncCopyState::Error => return Step::Idle,
        };
        p.busy = true;
        step
    }

    fn advance(&self, event: AsyncCopyEvent) {
        let mut p = self.lock();
        let next = transition(p.state, event);
        if next != p.state {
            debug!(job = %self.base.job().id(), from = ?p.state, to = ?next, "copy transition");
        }
        p.state = next;
        p.busy = false;
    }

    async fn run(&self, step: Step) -> Result<(), TransferError> {
        match step {
            Step::Cancel => Err(TransferError::Cancelled),
            Step::Idle => Ok(()),
            Step::FetchSource => self.fetch_source().await,
            Step::CheckDestination => self.check_destination().await,
            Step::Start { uri, etag } => self.start(uri, etag).await,
            Step::Poll { copy_id } => self.poll(copy_id).await,
        }
    }

    async fn fetch_source(&self) -> Result<(), TransferError> {
        self.base.job().set_status(JobStatus::Transfer);
        if let CopySource::Object(source) = &self.source {
            let attrs = self.base.call(source.fetch_attributes()).await?;
            check_size_limit(self.kind, attrs.length)?;
            let uri = source.copy_source_uri().ok_or_else(|| {
                TransferError::InvalidConfiguration(format!(
                    "{} cannot be read by the destination service",
                    source.location()
                ))
            })?;
            let mut p = self.lock();
            p.source_uri = Some(uri);
            p.source_etag = attrs.etag;
            p.attributes = Some(FinalAttributes {
                properties: attrs.properties,
                metadata: attrs.metadata,
            });
        }
        self.advance(AsyncCopyEvent::SourceFetched);
        Ok(())
    }

    async fn check_destination(&self) -> Result<(), TransferError> {
        let existing = match self.base.call(self.dest.fetch_attributes()).await {
            Ok(attrs) => Some(attrs),
            Err(e) if e.is_not_found() => None,
            Err(e) => return Err(e),
        };
        if let Some(attrs) = &existing {
            check_destination_type(self.kind, attrs)?;
        }
        self.base.check_overwrite(existing.is_some())?;
        self.advance(AsyncCopyEvent::DestinationChecked);
        Ok(())
    }

    async fn start(&self, uri: String, etag: Option<String>) -> Result<(), TransferError> {
        let conditions = AccessCondition {
            source_if_match: etag,
            ..AccessCondition::none()
        };
        let copy_id = match self
            .base
            .call(self.dest.start_copy(uri.clone(), conditions))
            .await
        {
            Ok(id) => id,
            Err(e) if e.is_copy_pending() => self.adopt_pending(&uri, e).await?,
            Err(e) => return Err(e),
        };
        debug!(job = %self.base.job().id(), %copy_id, "copy started");
        self.base.job().begin_monitor(copy_id.clone());
        {
            let mut p = self.lock();
            p.copy_id = Some(copy_id);
            p.backoff.reset();
            p.next_poll = Some(Instant::now() + p.backoff.current());
        }
        self.advance(AsyncCopyEvent::CopyStarted);
        Ok(())
    }

    /// Takes over a copy already running on the destination when it copies
    /// exactly this job's source, snapshot and version included.
    async fn adopt_pending(&self, uri: &str, original: TransferError) -> Result<String, TransferError> {
        let attrs = self.base.call(self.dest.fetch_attributes()).await?;
        let Some(pending) = attrs.copy.filter(|c| c.state == CopyState::Pending) else {
            return Err(original);
        };
        if SourceUri::parse(&pending.source) != SourceUri::parse(uri) {
            debug!(
                job = %self.base.job().id(),
                pending = %pending.source,
                wanted = %uri,
                "pending copy is from another source"
            );
            return Err(original);
        }
        info!(job = %self.base.job().id(), copy_id = %pending.copy_id, "adopting pending copy");
        Ok(pending.copy_id)
    }

    async fn poll(&self, copy_id: String) -> Result<(), TransferError> {
        let status = self
            .base
            .call(self.dest.get_copy_status(copy_id.clone()))
            .await?;
        let delta = {
            let mut p = self.lock();
            let delta = status.bytes_copied.saturating_sub(p.reported);
            p.reported = p.reported.max(status.bytes_copied);
            delta
        };
        self.base.report_progress(delta);

        match status.state {
            CopyState::Pending => {
                let remaining = status.total_bytes.saturating_sub(status.bytes_copied);
                let mut p = self.lock();
                let wait = p.backoff.next_wait(remaining);
                p.next_poll = Some(Instant::now() + wait);
                p.busy = false;
                trace!(%copy_id, copied = status.bytes_copied, remaining, wait_ms = wait.as_millis() as u64, "copy pending");
                Ok(())
            }
            CopyState::Success => {
                self.apply_attributes().await?;
                self.advance(AsyncCopyEvent::CopyCompleted);
                self.base.succeed();
                Ok(())
            }
            CopyState::Failed | CopyState::Aborted => Err(TransferError::CopyFailed {
                status: status.state,
                description: status.description.unwrap_or_default(),
            }),
        }
    }

    /// Applies the source's properties and metadata to the copied object.
    ///
    /// A copy from a bare URI keeps whatever the service carried over.
    async fn apply_attributes(&self) -> Result<(), TransferError> {
        let CopySource::Object(source) = &self.source else {
            return Ok(());
        };
        let captured = self.lock().attributes.clone();
        let attrs = self
            .base
            .call(final_attributes(captured, source.as_ref()))
            .await?;
        self.base
            .call(self.dest.commit(attrs.properties, attrs.metadata))
            .await
    }
}

impl TransferController for AsyncCopyController {
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
        if p.busy || p.state.is_terminal() {
            return false;
        }
        p.state != AsyncCopyState::GetCopyState || p.next_poll.is_none_or(|at| Instant::now() >= at)
    }

    fn do_work(&self) -> WorkFuture<'_> {
        let unit = self.base.begin_unit();
        let step = self.claim();
        Box::pin(async move {
            let _unit = unit;
            if let Err(e) = self.run(step).await {
                self.advance(AsyncCopyEvent::Failed);
                self.base.fail(e);
            }
            self.base.is_finished()
        })
    }

    fn eligible_at(&self) -> Option<Instant> {
        let p = self.lock();
        match p.state {
            AsyncCopyState::GetCopyState if !p.busy => p.next_poll,
            _ => None,
        }
    }
}
