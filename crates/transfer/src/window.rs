//! Transfer window discipline.
//!
//! A [`ChunkScheduler`] hands out chunk offsets against a job's
//! [`Checkpoint`]. An offset enters the window when work on it begins and
//! leaves only once the chunk is durably written. Interrupted window entries
//! from a persisted checkpoint are handed out again before any new offset.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, trace};

use crate::TransferError;
use crate::checkpoint::{Checkpoint, CheckpointSnapshot};

/// How the entry offset follows completions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowMode {
    /// Entry offset is the lowest offset still in flight (stream, local, append).
    Sequential,
    /// Entry offset is the boundary past which nothing was scheduled yet.
    Ranged,
}

struct SchedulerState {
    total: Option<u64>,
    retry: VecDeque<u64>,
    cursor: u64,
    /// Sparse schedule: only these offsets are handed out past the cursor.
    allowed: Option<VecDeque<u64>>,
}

impl SchedulerState {
    fn clamped_cursor(&self) -> u64 {
        self.total.map_or(self.cursor, |t| self.cursor.min(t))
    }

    fn new_exhausted(&self) -> bool {
        match &self.allowed {
            Some(list) => list.is_empty(),
            None => self.total.is_some_and(|t| self.cursor >= t),
        }
    }
}

/// Hands out chunk offsets while maintaining the checkpoint window.
pub struct ChunkScheduler {
    checkpoint: Arc<Checkpoint>,
    mode: WindowMode,
    block_size: u64,
    max_window: usize,
    state: Mutex<SchedulerState>,
}

/// Rejects a persisted checkpoint that cannot belong to an object of `total` bytes
/// chunked at `block_size`.
pub fn validate_checkpoint(
    snapshot: &CheckpointSnapshot,
    block_size: u64,
    total: Option<u64>,
) -> Result<(), TransferError> {
    if let Some(total) = total
        && snapshot.entry_offset > total
    {
        return Err(TransferError::ResumeStateInconsistent(format!(
            "entry offset {} is past the source length {total}",
            snapshot.entry_offset
        )));
    }
    for &offset in &snapshot.window {
        if offset % block_size != 0 {
            return Err(TransferError::ResumeStateInconsistent(format!(
                "window offset {offset} is not aligned to the {block_size} byte chunk size"
            )));
        }
        if let Some(total) = total
            && offset >= total
        {
            return Err(TransferError::ResumeStateInconsistent(format!(
                "window offset {offset} is past the source length {total}"
            )));
        }
    }
    Ok(())
}

impl ChunkScheduler {
    pub fn new(
        checkpoint: Arc<Checkpoint>,
        mode: WindowMode,
        block_size: u64,
        total: Option<u64>,
        max_window: usize,
    ) -> Result<Self, TransferError> {
        if block_size == 0 {
            return Err(TransferError::InvalidConfiguration("block size is zero".into()));
        }
        let snap = checkpoint.snapshot();
        validate_checkpoint(&snap, block_size, total)?;

        let retry: VecDeque<u64> = snap.window.iter().copied().collect();
        let cursor = snap
            .window
            .last()
            .map_or(snap.entry_offset, |last| snap.entry_offset.max(last + block_size));
        if !retry.is_empty() {
            debug!(retry = retry.len(), entry = snap.entry_offset, "resuming transfer window");
        }
        let state = SchedulerState {
            total,
            retry,
            cursor,
            allowed: None,
        };
        Ok(Self {
            checkpoint,
            mode,
            block_size,
            max_window: max_window.max(1),
            state: Mutex::new(state),
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn block_size(&self) -> u64 {
        self.block_size
    }

    pub fn mode(&self) -> WindowMode {
        self.mode
    }

    pub fn total(&self) -> Option<u64> {
        self.lock_state().total
    }

    pub fn checkpoint(&self) -> &Arc<Checkpoint> {
        &self.checkpoint
    }

    /// Length of the chunk starting at `offset`, if the total is known.
    pub fn chunk_len(&self, offset: u64) -> Option<u64> {
        self.total()
            .map(|t| self.block_size.min(t.saturating_sub(offset)))
    }

    /// Limits new scheduling to `offsets` (sparse sources).
    ///
    /// Offsets below the cursor and offsets already awaiting retry are dropped.
    pub fn restrict_to(&self, offsets: impl IntoIterator<Item = u64>) {
        let mut state = self.lock_state();
        let mut list: Vec<u64> = offsets
            .into_iter()
            .filter(|o| *o >= state.cursor && !state.retry.contains(o))
            .filter(|o| state.total.is_none_or(|t| *o < t))
            .collect();
        list.sort_unstable();
        list.dedup();
        trace!(chunks = list.len(), "restricting schedule to populated chunks");
        state.allowed = Some(list.into());
    }

    /// Next offset to work on, or `None` when nothing can start right now.
    ///
    /// Retries bypass the window bound; new offsets wait until the window has room.
    pub fn next(&self) -> Option<u64> {
        let mut guard = self.lock_state();
        let state = &mut *guard;
        if let Some(offset) = state.retry.pop_front() {
            trace!(offset, "retrying interrupted chunk");
            return Some(offset);
        }

        let mut cp = self.checkpoint.lock();
        if cp.window.len() >= self.max_window || state.new_exhausted() {
            return None;
        }
        let offset = match &mut state.allowed {
            Some(list) => list.pop_front()?,
            None => state.cursor,
        };
        cp.window.insert(offset);
        state.cursor = state.cursor.max(offset + self.block_size);
        cp.entry_offset = match self.mode {
            WindowMode::Ranged => state.clamped_cursor(),
            WindowMode::Sequential => cp.window.first().copied().unwrap_or(offset),
        };
        Some(offset)
    }

    /// Removes a durably written chunk from the window.
    pub fn complete(&self, offset: u64) {
        let state = self.lock_state();
        let mut cp = self.checkpoint.lock();
        cp.window.remove(&offset);
        if self.mode == WindowMode::Sequential {
            cp.entry_offset = cp
                .window
                .first()
                .copied()
                .unwrap_or_else(|| state.clamped_cursor());
        }
    }

    /// Fixes the total once a source of unknown length reaches its end.
    ///
    /// Window entries at or past the end are dropped; they carry no data.
    pub fn set_total(&self, total: u64) {
        let mut state = self.lock_state();
        state.total = Some(total);
        state.cursor = state.cursor.min(total);
        state.retry.retain(|o| *o < total);
        let mut cp = self.checkpoint.lock();
        cp.window.retain(|o| *o < total);
        cp.entry_offset = match self.mode {
            WindowMode::Ranged => cp.entry_offset.min(total),
            WindowMode::Sequential => cp.window.first().copied().unwrap_or(state.cursor),
        };
    }

    /// Retries are pending or a new offset could start now.
    pub fn has_next(&self) -> bool {
        let state = self.lock_state();
        if !state.retry.is_empty() {
            return true;
        }
        !state.new_exhausted() && self.checkpoint.window_len() < self.max_window
    }

    /// Every offset has been handed out.
    pub fn is_exhausted(&self) -> bool {
        let state = self.lock_state();
        state.retry.is_empty() && state.new_exhausted()
    }

    /// Chunks that still have to complete, counting the window.
    ///
    /// `None` while the total length is unknown.
    pub fn remaining_chunks(&self) -> Option<u64> {
        let state = self.lock_state();
        let in_window = self.checkpoint.window_len() as u64;
        let fresh = match &state.allowed {
            Some(list) => list.len() as u64,
            None => state.total?.saturating_sub(state.cursor).div_ceil(self.block_size),
        };
        Some(in_window + fresh)
    }

    /// Bytes already durably transferred according to the checkpoint.
    pub fn completed_bytes(&self) -> Option<u64> {
        let state = self.lock_state();
        let total = state.total?;
        let len = |o: u64| self.block_size.min(total.saturating_sub(o));
        let window: u64 = self.checkpoint.lock().window.iter().map(|&o| len(o)).sum();
        let fresh: u64 = match &state.allowed {
            Some(list) => list.iter().map(|&o| len(o)).sum(),
            None => total.saturating_sub(state.cursor),
        };
        Some(total.saturating_sub(window + fresh))
    }
}
