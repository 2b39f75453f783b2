//! Chunk size derivation.

use datamover_location::{DestinationKind, MAX_BLOCK_SIZE};

use crate::{TransferError, TransferOptions};

/// Chunk geometry for one object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlan {
    pub block_size: u64,
    /// Pooled segments per chunk read.
    pub chunks_per_read: usize,
    /// `None` while the total length is unknown.
    pub chunk_count: Option<u64>,
}

/// Fails before any I/O when `length` exceeds what `kind` can hold.
pub fn check_size_limit(kind: DestinationKind, length: u64) -> Result<(), TransferError> {
    let limit = kind.max_size();
    if length > limit {
        return Err(TransferError::SourceTooLarge {
            kind,
            length,
            limit,
        });
    }
    Ok(())
}

/// Derives the chunk size for an object of `total` bytes written to `kind`.
///
/// Range-limited destinations cap chunks at the largest single write.
/// Block-addressable destinations keep the configured size unless that would
/// exceed the block-count limit, in which case the size becomes the smallest
/// multiple of the configured size that fits.
pub fn plan_chunks(
    total: Option<u64>,
    kind: DestinationKind,
    options: &TransferOptions,
) -> Result<ChunkPlan, TransferError> {
    if let Some(total) = total {
        check_size_limit(kind, total)?;
    }
    let configured = options.block_size;
    let block_size = match (kind.max_chunk_size(), total) {
        (Some(max), _) => configured.min(max),
        (None, Some(total)) if kind == DestinationKind::BlockBlob => {
            let count = total.div_ceil(configured);
            if count > options.max_block_count {
                let minimum = total.div_ceil(options.max_block_count);
                minimum.div_ceil(configured) * configured
            } else {
                configured
            }
        }
        _ => configured,
    };
    if block_size > MAX_BLOCK_SIZE && kind == DestinationKind::BlockBlob {
        return Err(TransferError::SourceTooLarge {
            kind,
            length: total.unwrap_or_default(),
            limit: MAX_BLOCK_SIZE * options.max_block_count,
        });
    }
    Ok(ChunkPlan {
        block_size,
        chunks_per_read: options.chunks_per_read(block_size),
        chunk_count: total.map(|t| t.div_ceil(block_size)),
    })
}
