//! Sparse range discovery for range-aware sources.
//!
//! The source is split into spans; each span's populated ranges are listed
//! by its own work unit. Once every span has reported, the merged ranges are
//! mapped onto chunk offsets and only those chunks are copied.

use std::sync::{Mutex, MutexGuard, PoisonError};

use datamover_location::ByteRange;
use datamover_transfer::FanIn;

/// Splits `[0, total)` into consecutive spans of at most `span` bytes.
pub fn spans(total: u64, span: u64) -> Vec<ByteRange> {
    let span = span.max(1);
    (0..total.div_ceil(span))
        .map(|i| {
            let offset = i * span;
            ByteRange::new(offset, span.min(total - offset))
        })
        .collect()
}

/// Start offsets of every `block_size` chunk overlapping one of `ranges`,
/// ascending and without duplicates.
pub fn populated_chunks(ranges: Vec<ByteRange>, block_size: u64, total: u64) -> Vec<u64> {
    let mut offsets = Vec::new();
    for range in ByteRange::merge(ranges) {
        let end = range.end().min(total);
        let mut chunk = range.offset / block_size * block_size;
        while chunk < end {
            if offsets.last() != Some(&chunk) {
                offsets.push(chunk);
            }
            chunk += block_size;
        }
    }
    offsets
}

struct Found {
    next_span: usize,
    ranges: Vec<ByteRange>,
}

/// Span bookkeeping for one discovery pass.
pub(crate) struct RangeDiscovery {
    spans: Vec<ByteRange>,
    found: Mutex<Found>,
    /// One completion per span.
    pub done: FanIn,
}

impl RangeDiscovery {
    pub fn new(spans: Vec<ByteRange>, done: FanIn) -> Self {
        Self {
            spans,
            found: Mutex::new(Found {
                next_span: 0,
                ranges: Vec::new(),
            }),
            done,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Found> {
        self.found.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn has_span(&self) -> bool {
        self.lock().next_span < self.spans.len()
    }

    pub fn claim_span(&self) -> Option<ByteRange> {
        let mut f = self.lock();
        let span = self.spans.get(f.next_span).copied()?;
        f.next_span += 1;
        Some(span)
    }

    /// Records a span's ranges. Returns `true` for the span that completed
    /// the pass.
    pub fn record(&self, ranges: Vec<ByteRange>) -> bool {
        self.lock().ranges.extend(ranges);
        self.done.signal()
    }

    pub fn take_ranges(&self) -> Vec<ByteRange> {
        std::mem::take(&mut self.lock().ranges)
    }
}
