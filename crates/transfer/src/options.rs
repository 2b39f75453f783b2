//! Immutable per-controller configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use datamover_location::PAGE_SIZE;

use crate::TransferError;
use crate::block_id::MAX_ID_BLOCKS;

const MIB: u64 = 1024 * 1024;

/// Poll timing for server-initiated copies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CopyPollOptions {
    pub min_interval_ms: u64,
    pub max_interval_ms: u64,
    /// Remaining bytes at or below which polling returns to the minimum interval.
    pub near_completion_bytes: u64,
    /// Consecutive polls outside the near-completion zone before the wait grows.
    pub polls_before_backoff: u32,
}

impl Default for CopyPollOptions {
    fn default() -> Self {
        Self {
            min_interval_ms: 100,
            max_interval_ms: 300_000,
            near_completion_bytes: 100 * MIB,
            polls_before_backoff: 2,
        }
    }
}

impl CopyPollOptions {
    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms)
    }
}

/// Options passed into every controller at construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TransferOptions {
    /// Configured chunk size; block-addressable uploads may widen it.
    pub block_size: u64,
    pub max_block_count: u64,
    /// Size of one pooled buffer segment.
    pub segment_size: u64,
    /// Upper bound on in-flight chunk offsets per job.
    pub max_window_size: usize,
    /// Objects up to this size go to block destinations in one call.
    pub single_put_threshold: u64,
    pub compute_content_md5: bool,
    pub verify_chunk_checksums: bool,
    /// Window size for sparse range discovery.
    pub range_span_size: u64,
    pub copy_poll: CopyPollOptions,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            block_size: 4 * MIB,
            max_block_count: datamover_location::MAX_BLOCK_COUNT,
            segment_size: 4 * MIB,
            max_window_size: 128,
            single_put_threshold: 32 * MIB,
            compute_content_md5: false,
            verify_chunk_checksums: false,
            range_span_size: 148 * 4 * MIB,
            copy_poll: CopyPollOptions::default(),
        }
    }
}

impl TransferOptions {
    /// Parses options from JSON; missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, TransferError> {
        let options: Self = serde_json::from_str(json)?;
        options.validate()?;
        Ok(options)
    }

    pub fn from_file(path: &Path) -> Result<Self, TransferError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json(&json)
    }

    pub fn validate(&self) -> Result<(), TransferError> {
        let invalid = |msg: &str| Err(TransferError::InvalidConfiguration(msg.to_string()));
        if self.block_size == 0 || self.segment_size == 0 || self.range_span_size == 0 {
            return invalid("sizes must be non-zero");
        }
        if self.block_size % PAGE_SIZE != 0 {
            return invalid("blockSize must be a multiple of 512");
        }
        if self.max_block_count == 0 || self.max_window_size == 0 {
            return invalid("maxBlockCount and maxWindowSize must be non-zero");
        }
        if self.max_block_count > MAX_ID_BLOCKS {
            return invalid("maxBlockCount exceeds the number of distinct fixed-length block ids");
        }
        if self.copy_poll.min_interval_ms == 0
            || self.copy_poll.min_interval_ms > self.copy_poll.max_interval_ms
        {
            return invalid("copyPoll.minIntervalMs must be non-zero and not above maxIntervalMs");
        }
        Ok(())
    }

    /// Number of pooled segments making up one chunk of `block_size` bytes.
    pub fn chunks_per_read(&self, block_size: u64) -> usize {
        block_size.div_ceil(self.segment_size).max(1) as usize
    }
}
