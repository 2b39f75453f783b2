//! Resolution of append-position races.
//!
//! A conditional append that fails its precondition may have landed on an
//! earlier attempt whose response was lost. The destination is compared with
//! the source before the failure is treated as corruption.

use tracing::{debug, warn};

use datamover_location::{AccessCondition, ObjectDestination, ObjectSource};

use crate::TransferError;

/// Decides whether `[offset, offset + length)` already holds the source bytes.
///
/// Returns `Ok(())` when it does, `original` when the destination has not
/// reached `offset` (the race is not about this chunk), and
/// [`TransferError::ContentMismatch`] when the bytes diverge.
pub async fn resolve_append_race(
    source: &dyn ObjectSource,
    dest: &dyn ObjectDestination,
    offset: u64,
    length: u64,
    original: TransferError,
) -> Result<(), TransferError> {
    let current = dest.fetch_attributes().await?.length;
    if current <= offset {
        return Err(original);
    }
    if current < offset + length {
        warn!(destination = %dest.location(), offset, current, "destination ends inside the chunk");
        return Err(TransferError::ContentMismatch { offset: current });
    }
    let expected = source
        .read_range(offset, length, AccessCondition::none())
        .await?;
    let actual = dest.read_range(offset, length).await?;
    if let Some(at) = first_difference(&expected, &actual) {
        warn!(destination = %dest.location(), offset = offset + at, "destination content diverges");
        return Err(TransferError::ContentMismatch { offset: offset + at });
    }
    debug!(destination = %dest.location(), offset, length, "chunk had already landed");
    Ok(())
}

fn first_difference(a: &[u8], b: &[u8]) -> Option<u64> {
    a.iter()
        .zip(b)
        .position(|(x, y)| x != y)
        .or_else(|| (a.len() != b.len()).then(|| a.len().min(b.len())))
        .map(|i| i as u64)
}
