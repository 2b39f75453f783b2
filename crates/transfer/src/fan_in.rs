//! Decrement-to-zero completion latch.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Fires exactly once, when every expected completion has arrived.
///
/// A fan-in may be sized up front ([`FanIn::new`]) or grown while work is
/// discovered ([`FanIn::open`] + [`expect`](FanIn::expect) +
/// [`seal`](FanIn::seal)). It never fires once the owning controller has
/// errored, which guards against a late chunk completion racing a failure.
#[derive(Debug)]
pub struct FanIn {
    pending: AtomicUsize,
    sealed: AtomicBool,
    fired: AtomicBool,
    halted: Arc<AtomicBool>,
}

impl FanIn {
    /// A sealed latch expecting `count` completions. Zero fires immediately.
    pub fn new(count: usize) -> Self {
        Self::linked(count, Arc::new(AtomicBool::new(false)))
    }

    /// An unsealed latch with nothing expected yet.
    pub fn open() -> Self {
        Self::open_linked(Arc::new(AtomicBool::new(false)))
    }

    /// A sealed latch that stays inert once `halted` is set.
    pub fn linked(count: usize, halted: Arc<AtomicBool>) -> Self {
        let fan_in = Self {
            pending: AtomicUsize::new(count),
            sealed: AtomicBool::new(true),
            fired: AtomicBool::new(false),
            halted,
        };
        if count == 0 {
            fan_in.try_fire();
        }
        fan_in
    }

    pub fn open_linked(halted: Arc<AtomicBool>) -> Self {
        Self {
            pending: AtomicUsize::new(0),
            sealed: AtomicBool::new(false),
            fired: AtomicBool::new(false),
            halted,
        }
    }

    /// Registers `n` more completions. Only valid before [`seal`](Self::seal).
    pub fn expect(&self, n: usize) {
        debug_assert!(!self.sealed.load(Ordering::SeqCst));
        self.pending.fetch_add(n, Ordering::SeqCst);
    }

    /// No further completions will be expected. Returns `true` if this call fired.
    pub fn seal(&self) -> bool {
        self.sealed.store(true, Ordering::SeqCst);
        self.pending.load(Ordering::SeqCst) == 0 && self.try_fire()
    }

    /// Reports one completion. Returns `true` for the single call that fires.
    pub fn signal(&self) -> bool {
        let prev = self.pending.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "fan-in signalled more often than expected");
        prev == 1 && self.sealed.load(Ordering::SeqCst) && self.try_fire()
    }

    /// Makes the latch inert.
    pub fn halt(&self) {
        self.halted.store(true, Ordering::SeqCst);
    }

    pub fn is_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    fn try_fire(&self) -> bool {
        if self.halted.load(Ordering::SeqCst) {
            return false;
        }
        self.fired
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}
