//! Checks run against the live destination before any data is written.

use datamover_location::{Attributes, DestinationKind};

use crate::TransferError;
use crate::checkpoint::CheckpointSnapshot;

/// An existing destination must be of the kind the job writes.
pub fn check_destination_type(
    kind: DestinationKind,
    existing: &Attributes,
) -> Result<(), TransferError> {
    match (kind.blob_kind(), existing.blob_kind) {
        (Some(want), Some(found)) if want != found => {
            Err(TransferError::DestinationTypeMismatch(format!(
                "destination is a {found}, expected a {want}"
            )))
        }
        _ => Ok(()),
    }
}

/// A resumed transfer must find the destination it left behind.
///
/// `existing` is `None` when the destination is absent. Fresh checkpoints
/// always pass.
pub fn check_resume_destination(
    kind: DestinationKind,
    checkpoint: &CheckpointSnapshot,
    existing: Option<&Attributes>,
    source_length: Option<u64>,
) -> Result<(), TransferError> {
    if checkpoint.is_fresh() {
        return Ok(());
    }
    let Some(existing) = existing else {
        // Uncommitted blocks are invisible until the list is submitted.
        if kind == DestinationKind::BlockBlob {
            return Ok(());
        }
        return Err(TransferError::ResumeStateInconsistent(format!(
            "{kind} destination disappeared while resuming at offset {}",
            checkpoint.entry_offset
        )));
    };
    if kind.is_sequential() {
        if existing.length < checkpoint.entry_offset {
            return Err(TransferError::ResumeStateInconsistent(format!(
                "destination holds {} bytes but the checkpoint is at {}",
                existing.length, checkpoint.entry_offset
            )));
        }
    } else if kind != DestinationKind::BlockBlob
        && let Some(len) = source_length
        && existing.length != len
    {
        return Err(TransferError::ResumeStateInconsistent(format!(
            "destination is {} bytes but the source is {len}",
            existing.length
        )));
    }
    Ok(())
}
