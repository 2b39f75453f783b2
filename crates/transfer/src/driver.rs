//! Runs a single controller to completion.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::TransferError;
use crate::controller::TransferController;

/// Idle wait when the controller has nothing to do and nothing is in flight.
const IDLE_WAIT: Duration = Duration::from_millis(1);

/// Consecutive idle rounds between two "stalled" log lines.
const IDLE_REPORT_EVERY: u32 = 1000;

/// Keeps up to `parallelism` work units in flight until the controller
/// finishes, then returns its outcome.
///
/// Waits for a poll timer or an idle round race against cancellation, so a
/// cancel is turned into the outcome without sitting out the wait.
pub async fn drive(
    controller: Arc<dyn TransferController>,
    parallelism: usize,
) -> Result<(), TransferError> {
    let completion = controller.take_completion().ok_or_else(|| {
        TransferError::InvalidConfiguration("controller outcome already taken".into())
    })?;
    let limit = parallelism.max(1);
    let base = controller.base();
    debug!(job = %controller.job().id(), parallelism = limit, "driving transfer");

    let mut in_flight = FuturesUnordered::new();
    let mut idle_rounds: u32 = 0;
    loop {
        while in_flight.len() < limit && !controller.is_finished() && controller.has_work() {
            in_flight.push(controller.do_work());
        }
        if in_flight.is_empty() {
            if controller.is_finished() {
                break;
            }
            let wait = match controller.eligible_at() {
                Some(at) => {
                    idle_rounds = 0;
                    trace!(job = %controller.job().id(), "waiting for next eligible time");
                    at
                }
                None => {
                    idle_rounds += 1;
                    if idle_rounds % IDLE_REPORT_EVERY == 0 {
                        debug!(
                            job = %controller.job().id(),
                            idle_rounds,
                            "controller has no work and nothing in flight"
                        );
                    }
                    Instant::now() + IDLE_WAIT
                }
            };
            if base.cancel_pending() {
                // Cancellation still has to become the outcome; never park on it.
                tokio::time::sleep(IDLE_WAIT).await;
                continue;
            }
            tokio::select! {
                () = tokio::time::sleep_until(wait) => {}
                () = base.cancelled() => {
                    debug!(job = %controller.job().id(), "cancelled while waiting");
                }
            }
            continue;
        }
        idle_rounds = 0;
        if let Some(finished) = in_flight.next().await
            && finished
            && in_flight.is_empty()
        {
            break;
        }
    }
    drop(in_flight);

    completion.await.unwrap_or(Err(TransferError::Cancelled))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use datamover_location::{BlobKind, Location};

    use crate::controller::{ControllerBase, WorkFuture};
    use crate::{FanIn, TransferJob, TransferOptions};

    /// Hands out `units` independent units and succeeds once all report in.
    struct Counting {
        base: ControllerBase,
        next: AtomicUsize,
        units: usize,
        peak: AtomicUsize,
        done: FanIn,
    }

    impl Counting {
        fn new(units: usize) -> Self {
            let job = TransferJob::new(
                Location::local("/in"),
                Location::blob("https://a.test", "c", "o", BlobKind::Block),
            );
            let base = ControllerBase::new(Arc::new(job), Arc::new(TransferOptions::default()));
            let done = base.fan_in(units);
            Self {
                base,
                next: AtomicUsize::new(0),
                units,
                peak: AtomicUsize::new(0),
                done,
            }
        }
    }

    impl TransferController for Counting {
        fn base(&self) -> &ControllerBase {
            &self.base
        }

        fn has_work(&self) -> bool {
            self.next.load(Ordering::SeqCst) < self.units
        }

        fn do_work(&self) -> WorkFuture<'_> {
            let unit = self.base.begin_unit();
            self.next.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                let _unit = unit;
                self.peak.fetch_max(self.base.active_units(), Ordering::SeqCst);
                tokio::task::yield_now().await;
                if self.done.signal() {
                    self.base.succeed();
                }
                self.base.is_finished()
            })
        }
    }

    #[tokio::test]
    async fn runs_to_completion_within_parallelism() {
        let c = Arc::new(Counting::new(20));
        drive(c.clone(), 4).await.unwrap();
        assert!(c.is_finished());
        assert!(c.peak.load(Ordering::SeqCst) <= 4);
        assert_eq!(c.base.active_units(), 0);
    }

    /// Always waiting on a timer far in the future until cancelled.
    struct Parked {
        base: ControllerBase,
    }

    impl TransferController for Parked {
        fn base(&self) -> &ControllerBase {
            &self.base
        }

        fn has_work(&self) -> bool {
            self.base.cancel_pending()
        }

        fn do_work(&self) -> WorkFuture<'_> {
            Box::pin(async move {
                self.base.fail(TransferError::Cancelled);
                true
            })
        }

        fn eligible_at(&self) -> Option<Instant> {
            Some(Instant::now() + Duration::from_secs(300))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_interrupts_a_timer_wait() {
        let job = TransferJob::new(
            Location::local("/in"),
            Location::blob("https://a.test", "c", "o", BlobKind::Block),
        );
        let c = Arc::new(Parked {
            base: ControllerBase::new(Arc::new(job), Arc::new(TransferOptions::default())),
        });
        let run = tokio::spawn(drive(c.clone(), 1));
        tokio::time::sleep(Duration::from_secs(5)).await;

        let cancelled_at = Instant::now();
        assert!(c.cancel());
        let err = run.await.unwrap().unwrap_err();
        assert!(matches!(err, TransferError::Cancelled));
        assert!(cancelled_at.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn outcome_can_only_be_driven_once() {
        let c = Arc::new(Counting::new(1));
        let _rx = c.take_completion();
        let err = drive(c, 1).await.unwrap_err();
        assert!(matches!(err, TransferError::InvalidConfiguration(_)));
    }
}
