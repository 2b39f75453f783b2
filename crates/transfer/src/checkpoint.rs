//! Persisted per-object progress.

use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Serialized form of a [`Checkpoint`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointSnapshot {
    /// Everything below this offset is done and will not be rescheduled.
    pub entry_offset: u64,
    /// Chunk start offsets in flight or interrupted mid-flight.
    #[serde(default)]
    pub window: BTreeSet<u64>,
}

impl CheckpointSnapshot {
    /// No chunk has ever been scheduled.
    pub fn is_fresh(&self) -> bool {
        self.entry_offset == 0 && self.window.is_empty()
    }
}

/// Entry offset plus the transfer window, guarded by its own lock.
///
/// Safe to serialize at any point between chunk start and completion.
#[derive(Debug, Default)]
pub struct Checkpoint {
    inner: Mutex<CheckpointSnapshot>,
}

impl Checkpoint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: CheckpointSnapshot) -> Self {
        Self {
            inner: Mutex::new(snapshot),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, CheckpointSnapshot> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn snapshot(&self) -> CheckpointSnapshot {
        self.lock().clone()
    }

    pub fn entry_offset(&self) -> u64 {
        self.lock().entry_offset
    }

    pub fn window(&self) -> Vec<u64> {
        self.lock().window.iter().copied().collect()
    }

    pub fn window_len(&self) -> usize {
        self.lock().window.len()
    }

    pub fn is_fresh(&self) -> bool {
        self.lock().is_fresh()
    }
}

impl Serialize for Checkpoint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.snapshot().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Checkpoint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        CheckpointSnapshot::deserialize(deserializer).map(Self::from_snapshot)
    }
}
