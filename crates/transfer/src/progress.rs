//! Progress surface: controllers emit byte deltas, a [`ProgressTracker`]
//! folds them into per-job totals and rates.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

const DEFAULT_PUBLISH_EVERY: Duration = Duration::from_millis(500);
const RATE_WINDOW: Duration = Duration::from_secs(5);
const RATE_SAMPLES: usize = 100;

/// Incremental progress reported by a controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    pub job_id: String,
    pub bytes_transferred_delta: u64,
}

/// Receives progress deltas from controllers.
pub trait ProgressSink: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

impl<F> ProgressSink for F
where
    F: Fn(ProgressEvent) + Send + Sync,
{
    fn report(&self, event: ProgressEvent) {
        self(event)
    }
}

/// Point-in-time view of one job.
#[derive(Debug, Clone, PartialEq)]
pub struct JobProgress {
    pub job_id: String,
    pub bytes_transferred: u64,
    pub total_bytes: Option<u64>,
    pub bytes_per_second: f64,
    pub eta: Option<Duration>,
}

impl JobProgress {
    /// Completed share in `[0, 1]`, when the total is known.
    pub fn fraction(&self) -> Option<f64> {
        self.total_bytes.map(|total| {
            if total == 0 {
                1.0
            } else {
                (self.bytes_transferred as f64 / total as f64).min(1.0)
            }
        })
    }
}

pub type ProgressCallback = Arc<dyn Fn(&JobProgress) + Send + Sync>;

/// Byte rate over a sliding time window.
pub struct SpeedCalculator {
    window: Duration,
    capacity: usize,
    samples: Mutex<VecDeque<(Instant, u64)>>,
}

impl Default for SpeedCalculator {
    fn default() -> Self {
        Self::new(RATE_WINDOW, RATE_SAMPLES)
    }
}

impl SpeedCalculator {
    pub fn new(window: Duration, capacity: usize) -> Self {
        Self {
            window,
            capacity: capacity.max(2),
            samples: Mutex::new(VecDeque::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<(Instant, u64)>> {
        self.samples.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record(&self, bytes: u64) {
        let now = Instant::now();
        let mut samples = self.lock();
        samples.push_back((now, bytes));
        while samples
            .front()
            .is_some_and(|(at, _)| now.duration_since(*at) > self.window)
        {
            samples.pop_front();
        }
        while samples.len() > self.capacity {
            samples.pop_front();
        }
    }

    /// Bytes per second across the retained samples; zero until two samples
    /// span a measurable interval.
    pub fn rate(&self) -> f64 {
        let samples = self.lock();
        let (Some((first, _)), Some((last, _))) = (samples.front(), samples.back()) else {
            return 0.0;
        };
        let span = last.duration_since(*first);
        if span.is_zero() {
            return 0.0;
        }
        let bytes: u64 = samples.iter().map(|(_, b)| b).sum();
        bytes as f64 / span.as_secs_f64()
    }

    pub fn eta(&self, remaining: u64) -> Option<Duration> {
        let rate = self.rate();
        (rate > 0.0).then(|| Duration::from_secs_f64(remaining as f64 / rate))
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}

#[derive(Default)]
struct JobTally {
    transferred: u64,
    total: Option<u64>,
    speed: SpeedCalculator,
}

impl JobTally {
    fn view(&self, job_id: &str) -> JobProgress {
        JobProgress {
            job_id: job_id.to_string(),
            bytes_transferred: self.transferred,
            total_bytes: self.total,
            bytes_per_second: self.speed.rate(),
            eta: self
                .total
                .and_then(|t| self.speed.eta(t.saturating_sub(self.transferred))),
        }
    }

    fn done(&self) -> bool {
        self.total.is_some_and(|t| self.transferred >= t)
    }
}

#[derive(Default)]
struct Ledger {
    jobs: HashMap<String, JobTally>,
    overall: u64,
    callbacks: Vec<ProgressCallback>,
}

impl Ledger {
    fn publish(&self, job_id: &str, job: &JobTally) {
        let view = job.view(job_id);
        for cb in &self.callbacks {
            cb(&view);
        }
    }
}

/// Aggregates deltas from any number of jobs.
///
/// Usable directly as a [`ProgressSink`]; deltas for unregistered jobs only
/// count toward [`overall`](Self::overall).
pub struct ProgressTracker {
    ledger: Arc<Mutex<Ledger>>,
    publish_every: Duration,
    publisher: Mutex<Option<CancellationToken>>,
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new(DEFAULT_PUBLISH_EVERY)
    }
}

impl ProgressTracker {
    pub fn new(publish_every: Duration) -> Self {
        Self {
            ledger: Arc::new(Mutex::new(Ledger::default())),
            publish_every,
            publisher: Mutex::new(None),
        }
    }

    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn on_progress(&self, callback: ProgressCallback) {
        self.ledger().callbacks.push(callback);
    }

    pub fn register(&self, job_id: &str, total: Option<u64>) {
        let mut ledger = self.ledger();
        let job = ledger.jobs.entry(job_id.to_string()).or_default();
        job.total = total;
    }

    /// Records a total learned after registration (streams of unknown length).
    pub fn set_total(&self, job_id: &str, total: u64) {
        if let Some(job) = self.ledger().jobs.get_mut(job_id) {
            job.total = Some(total);
        }
    }

    /// Drops a job; its bytes stay in the overall count.
    pub fn forget(&self, job_id: &str) {
        self.ledger().jobs.remove(job_id);
    }

    pub fn progress(&self, job_id: &str) -> Option<JobProgress> {
        self.ledger().jobs.get(job_id).map(|j| j.view(job_id))
    }

    pub fn overall(&self) -> u64 {
        self.ledger().overall
    }

    /// Pushes the current view of `job_id` to every callback.
    pub fn publish(&self, job_id: &str) {
        let ledger = self.ledger();
        if let Some(job) = ledger.jobs.get(job_id) {
            ledger.publish(job_id, job);
        }
    }

    /// Publishes every unfinished job on a fixed period from a background
    /// task, until [`stop`](Self::stop). Restarting replaces the running task.
    pub fn start(&self) {
        let token = CancellationToken::new();
        if let Some(previous) = self
            .publisher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(token.clone())
        {
            previous.cancel();
        }

        let ledger = Arc::clone(&self.ledger);
        let period = self.publish_every;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let ledger = ledger.lock().unwrap_or_else(PoisonError::into_inner);
                        for (id, job) in ledger.jobs.iter().filter(|(_, j)| !j.done()) {
                            ledger.publish(id, job);
                        }
                    }
                }
            }
            trace!("progress publisher stopped");
        });
    }

    pub fn stop(&self) {
        if let Some(token) = self
            .publisher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            token.cancel();
        }
    }
}

impl Drop for ProgressTracker {
    fn drop(&mut self) {
        self.stop();
    }
}

impl ProgressSink for ProgressTracker {
    fn report(&self, event: ProgressEvent) {
        let mut ledger = self.ledger();
        ledger.overall += event.bytes_transferred_delta;
        if let Some(job) = ledger.jobs.get_mut(&event.job_id) {
            job.transferred += event.bytes_transferred_delta;
            job.speed.record(event.bytes_transferred_delta);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn delta(job: &str, bytes: u64) -> ProgressEvent {
        ProgressEvent {
            job_id: job.into(),
            bytes_transferred_delta: bytes,
        }
    }

    #[test]
    fn deltas_fold_into_job_and_overall_totals() {
        let tracker = ProgressTracker::default();
        tracker.register("a", Some(1000));
        tracker.report(delta("a", 400));
        tracker.report(delta("a", 100));
        tracker.report(delta("stray", 7));

        let p = tracker.progress("a").unwrap();
        assert_eq!(p.bytes_transferred, 500);
        assert_eq!(p.fraction(), Some(0.5));
        assert_eq!(tracker.overall(), 507);

        tracker.forget("a");
        assert!(tracker.progress("a").is_none());
        assert_eq!(tracker.overall(), 507);
    }

    #[test]
    fn late_total_for_streams() {
        let tracker = ProgressTracker::default();
        tracker.register("s", None);
        tracker.report(delta("s", 30));
        assert_eq!(tracker.progress("s").unwrap().fraction(), None);
        tracker.set_total("s", 30);
        assert_eq!(tracker.progress("s").unwrap().fraction(), Some(1.0));
    }

    #[test]
    fn publish_reaches_callbacks_for_known_jobs_only() {
        let tracker = ProgressTracker::default();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        tracker.on_progress(Arc::new(move |p: &JobProgress| {
            sink.lock().unwrap().push(p.job_id.clone());
        }));
        tracker.register("a", None);
        tracker.publish("a");
        tracker.publish("missing");
        assert_eq!(*seen.lock().unwrap(), vec!["a".to_string()]);
    }

    #[test]
    fn closures_are_sinks() {
        let total = Arc::new(AtomicUsize::new(0));
        let t = Arc::clone(&total);
        let sink: Arc<dyn ProgressSink> = Arc::new(move |e: ProgressEvent| {
            t.fetch_add(e.bytes_transferred_delta as usize, Ordering::Relaxed);
        });
        sink.report(delta("j", 42));
        assert_eq!(total.load(Ordering::Relaxed), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn publisher_skips_finished_jobs_and_stops() {
        let tracker = ProgressTracker::new(Duration::from_millis(100));
        let ticks = Arc::new(AtomicUsize::new(0));
        let t = Arc::clone(&ticks);
        tracker.on_progress(Arc::new(move |_: &JobProgress| {
            t.fetch_add(1, Ordering::SeqCst);
        }));
        tracker.register("open", Some(10));
        tracker.register("done", Some(5));
        tracker.report(delta("done", 5));
        tracker.start();

        tokio::time::sleep(Duration::from_millis(350)).await;
        tracker.stop();
        let seen = ticks.load(Ordering::SeqCst);
        assert!((3..=4).contains(&seen), "saw {seen} notifications");

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(ticks.load(Ordering::SeqCst), seen);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_over_window() {
        let calc = SpeedCalculator::default();
        assert_eq!(calc.rate(), 0.0);
        assert!(calc.eta(10).is_none());

        calc.record(500);
        tokio::time::advance(Duration::from_secs(1)).await;
        calc.record(500);
        assert_eq!(calc.rate(), 1000.0);
        assert_eq!(calc.eta(2000), Some(Duration::from_secs(2)));

        tokio::time::advance(Duration::from_secs(10)).await;
        calc.record(1);
        assert_eq!(calc.rate(), 0.0);

        calc.clear();
        assert_eq!(calc.rate(), 0.0);
    }

    #[test]
    fn sample_capacity_is_bounded() {
        let calc = SpeedCalculator::new(Duration::from_secs(60), 5);
        for i in 0..20 {
            calc.record(i);
        }
        assert_eq!(calc.lock().len(), 5);
    }
}
