//! Lifecycle shared by every controller.
//!
//! A controller is driven from outside: a scheduler asks [`TransferController::has_work`]
//! and, if so, calls [`TransferController::do_work`], which performs one state
//! transition (normally one provider call) and reports whether the job is done.
//! Several units may be in flight at once.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::fan_in::FanIn;
use crate::job::{JobStatus, TransferJob};
use crate::progress::{ProgressEvent, ProgressSink};
use crate::{TransferError, TransferOptions};

/// Future returned by [`TransferController::do_work`]; resolves to "job finished".
pub type WorkFuture<'a> = Pin<Box<dyn Future<Output = bool> + Send + 'a>>;

/// `(source_id, destination_id, destination_exists) -> allow`.
pub type OverwritePolicy = Arc<dyn Fn(&str, &str, bool) -> bool + Send + Sync>;

/// Receives the job's single outcome.
pub type Completion = oneshot::Receiver<Result<(), TransferError>>;

/// Contract between a controller and whoever schedules it.
pub trait TransferController: Send + Sync {
    fn base(&self) -> &ControllerBase;

    /// A call to [`do_work`](Self::do_work) would make progress right now.
    fn has_work(&self) -> bool;

    /// Performs one unit of work. Resolves to `true` once the job is finished.
    fn do_work(&self) -> WorkFuture<'_>;

    fn is_finished(&self) -> bool {
        self.base().is_finished()
    }

    /// Requests cancellation; returns `true` for the call that won.
    fn cancel(&self) -> bool {
        self.base().cancel()
    }

    /// Earliest instant the controller will have work again, when it is
    /// waiting on a timer.
    fn eligible_at(&self) -> Option<Instant> {
        None
    }

    fn job(&self) -> &Arc<TransferJob> {
        self.base().job()
    }

    fn take_completion(&self) -> Option<Completion> {
        self.base().take_completion()
    }
}

/// Decrements the active-unit counter when dropped.
pub struct UnitGuard<'a> {
    active: &'a AtomicUsize,
}

impl Drop for UnitGuard<'_> {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Work-unit accounting, cancellation, exactly-once completion and the
/// overwrite gate.
pub struct ControllerBase {
    job: Arc<TransferJob>,
    options: Arc<TransferOptions>,
    cancel: CancellationToken,
    linked: Vec<CancellationToken>,
    cancel_requested: AtomicBool,
    active: AtomicUsize,
    errored: Arc<AtomicBool>,
    finished: AtomicBool,
    completion_tx: Mutex<Option<oneshot::Sender<Result<(), TransferError>>>>,
    completion_rx: Mutex<Option<Completion>>,
    overwrite: Option<OverwritePolicy>,
    progress: Option<Arc<dyn ProgressSink>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ControllerBase {
    pub fn new(job: Arc<TransferJob>, options: Arc<TransferOptions>) -> Self {
        let (tx, rx) = oneshot::channel();
        Self {
            job,
            options,
            cancel: CancellationToken::new(),
            linked: Vec::new(),
            cancel_requested: AtomicBool::new(false),
            active: AtomicUsize::new(0),
            errored: Arc::new(AtomicBool::new(false)),
            finished: AtomicBool::new(false),
            completion_tx: Mutex::new(Some(tx)),
            completion_rx: Mutex::new(Some(rx)),
            overwrite: None,
            progress: None,
        }
    }

    /// Links an external cancellation source (user or scheduler level).
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.linked.push(token);
        self
    }

    pub fn with_overwrite_policy(mut self, policy: OverwritePolicy) -> Self {
        self.overwrite = Some(policy);
        self
    }

    pub fn with_progress(mut self, sink: Arc<dyn ProgressSink>) -> Self {
        self.progress = Some(sink);
        self
    }

    pub fn job(&self) -> &Arc<TransferJob> {
        &self.job
    }

    pub fn options(&self) -> &TransferOptions {
        &self.options
    }

    // -----------------------------------------------------------------------
    // Work units
    // -----------------------------------------------------------------------

    pub fn begin_unit(&self) -> UnitGuard<'_> {
        self.active.fetch_add(1, Ordering::AcqRel);
        UnitGuard {
            active: &self.active,
        }
    }

    pub fn active_units(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    // -----------------------------------------------------------------------
    // Cancellation
    // -----------------------------------------------------------------------

    /// Idempotent; the first call wins and later calls are no-ops.
    pub fn cancel(&self) -> bool {
        if self.cancel_requested.swap(true, Ordering::AcqRel) {
            return false;
        }
        debug!(job = %self.job.id(), "cancellation requested");
        self.cancel.cancel();
        true
    }

    /// Any linked source, or this controller itself, asked to cancel.
    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::Acquire)
            || self.cancel.is_cancelled()
            || self.linked.iter().any(CancellationToken::is_cancelled)
    }

    /// A cancellation still has to be turned into the job's outcome.
    pub fn cancel_pending(&self) -> bool {
        self.is_cancel_requested() && !self.is_finished()
    }

    /// Resolves once any cancellation source fires.
    pub async fn cancelled(&self) {
        let mut waits: Vec<Pin<Box<dyn Future<Output = ()> + Send + '_>>> =
            Vec::with_capacity(self.linked.len() + 1);
        waits.push(Box::pin(self.cancel.cancelled()));
        for token in &self.linked {
            waits.push(Box::pin(token.cancelled()));
        }
        futures_util::future::select_all(waits).await;
    }

    /// Checked at state-transition boundaries.
    pub fn check_cancelled(&self) -> Result<(), TransferError> {
        if self.is_cancel_requested() {
            Err(TransferError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Runs one provider operation, abandoning it if cancellation fires first.
    pub async fn call<T, E>(&self, op: impl Future<Output = Result<T, E>>) -> Result<T, TransferError>
    where
        E: Into<TransferError>,
    {
        tokio::select! {
            biased;
            _ = self.cancelled() => Err(TransferError::Cancelled),
            r = op => r.map_err(Into::into),
        }
    }

    // -----------------------------------------------------------------------
    // Completion
    // -----------------------------------------------------------------------

    pub fn is_errored(&self) -> bool {
        self.errored.load(Ordering::Acquire)
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Sealed fan-in that goes inert once this controller errors.
    pub fn fan_in(&self, count: usize) -> FanIn {
        FanIn::linked(count, Arc::clone(&self.errored))
    }

    /// Growable fan-in that goes inert once this controller errors.
    pub fn open_fan_in(&self) -> FanIn {
        FanIn::open_linked(Arc::clone(&self.errored))
    }

    pub fn succeed(&self) -> bool {
        self.complete(Ok(()))
    }

    /// Records `err` as the outcome unless another outcome already won.
    pub fn fail(&self, err: TransferError) -> bool {
        self.complete(Err(err))
    }

    fn complete(&self, result: Result<(), TransferError>) -> bool {
        let Some(tx) = lock(&self.completion_tx).take() else {
            if let Err(e) = &result {
                trace!(job = %self.job.id(), error = %e, "outcome already recorded, dropping error");
            }
            return false;
        };
        match &result {
            Ok(()) => {
                self.job.set_status(JobStatus::Finished);
                info!(job = %self.job.id(), destination = %self.job.destination(), "transfer finished");
            }
            Err(e) => {
                self.errored.store(true, Ordering::Release);
                if e.is_cancelled() || e.is_skipped() {
                    info!(job = %self.job.id(), reason = %e, "transfer stopped");
                } else {
                    warn!(job = %self.job.id(), error = %e, "transfer failed");
                }
            }
        }
        self.finished.store(true, Ordering::Release);
        let _ = tx.send(result);
        true
    }

    /// Takes the completion receiver. Can only be called once.
    pub fn take_completion(&self) -> Option<Completion> {
        lock(&self.completion_rx).take()
    }

    // -----------------------------------------------------------------------
    // Overwrite gate and progress
    // -----------------------------------------------------------------------

    /// Asks the overwrite predicate at most once per job.
    ///
    /// Absent destinations and controllers without a predicate always pass.
    pub fn check_overwrite(&self, destination_exists: bool) -> Result<(), TransferError> {
        let Some(policy) = &self.overwrite else {
            return Ok(());
        };
        if !destination_exists && self.job.overwrite().is_none() {
            return Ok(());
        }
        let source = self.job.source().id();
        let destination = self.job.destination().id();
        let allowed = self
            .job
            .decide_overwrite(|| policy(&source, &destination, destination_exists));
        if allowed {
            Ok(())
        } else {
            Err(TransferError::Skipped(destination))
        }
    }

    pub fn report_progress(&self, delta: u64) {
        if delta == 0 {
            return;
        }
        if let Some(sink) = &self.progress {
            sink.report(ProgressEvent {
                job_id: self.job.id().to_string(),
                bytes_transferred_delta: delta,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use datamover_location::{BlobKind, Location};

    fn base() -> ControllerBase {
        let job = TransferJob::new(
            Location::local("/in"),
            Location::blob("https://a.test", "c", "out", BlobKind::Block),
        );
        ControllerBase::new(Arc::new(job), Arc::new(TransferOptions::default()))
    }

    #[test]
    fn unit_guard_tracks_active_units() {
        let b = base();
        let g1 = b.begin_unit();
        let g2 = b.begin_unit();
        assert_eq!(b.active_units(), 2);
        drop(g1);
        drop(g2);
        assert_eq!(b.active_units(), 0);
    }

    #[test]
    fn first_cancel_wins() {
        let b = base();
        assert!(b.check_cancelled().is_ok());
        assert!(b.cancel());
        assert!(!b.cancel());
        assert!(b.is_cancel_requested());
        assert!(b.cancel_pending());
        assert!(matches!(b.check_cancelled(), Err(TransferError::Cancelled)));
    }

    #[tokio::test]
    async fn linked_token_cancels() {
        let user = CancellationToken::new();
        let b = base().with_cancellation(user.clone());
        assert!(!b.is_cancel_requested());
        user.cancel();
        assert!(b.is_cancel_requested());
        b.cancelled().await;
    }

    #[tokio::test]
    async fn call_is_abandoned_on_cancel() {
        let b = base();
        b.cancel();
        let op = std::future::pending::<Result<(), datamover_location::ProviderError>>();
        let r = b.call(op).await;
        assert!(matches!(r, Err(TransferError::Cancelled)));
    }

    #[tokio::test]
    async fn completion_delivered_exactly_once() {
        let b = base();
        let rx = b.take_completion().unwrap();
        assert!(b.take_completion().is_none());

        assert!(b.fail(TransferError::ContentMismatch { offset: 4 }));
        assert!(!b.fail(TransferError::Cancelled));
        assert!(!b.succeed());
        assert!(b.is_errored());
        assert!(b.is_finished());

        let outcome = rx.await.unwrap();
        assert!(matches!(outcome, Err(TransferError::ContentMismatch { offset: 4 })));
    }

    #[test]
    fn concurrent_completions_single_winner() {
        let b = Arc::new(base());
        let handles: Vec<_> = (0..64)
            .map(|i| {
                let b = Arc::clone(&b);
                std::thread::spawn(move || {
                    if i % 2 == 0 {
                        b.succeed()
                    } else {
                        b.fail(TransferError::Cancelled)
                    }
                })
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
    }

    #[test]
    fn fan_in_goes_inert_after_failure() {
        let b = base();
        let f = b.fan_in(2);
        assert!(!f.signal());
        b.fail(TransferError::NotFound("x".into()));
        assert!(!f.signal());
        assert!(!f.is_fired());
    }

    #[test]
    fn overwrite_policy_consulted_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        let b = base().with_overwrite_policy(Arc::new(move |src, dst, exists| {
            c.fetch_add(1, Ordering::SeqCst);
            assert_eq!(src, "/in");
            assert!(dst.ends_with("/c/out"));
            !exists
        }));
        assert!(b.check_overwrite(false).is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(matches!(b.check_overwrite(true), Err(TransferError::Skipped(_))));
        assert!(matches!(b.check_overwrite(true), Err(TransferError::Skipped(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(b.job().overwrite(), Some(false));
    }

    #[test]
    fn progress_reported_to_sink() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        let b = base().with_progress(Arc::new(move |e: ProgressEvent| {
            s.lock().unwrap().push(e.bytes_transferred_delta);
        }));
        b.report_progress(10);
        b.report_progress(0);
        b.report_progress(5);
        assert_eq!(*seen.lock().unwrap(), vec![10, 5]);
    }
}
