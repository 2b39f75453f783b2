//! Range-addressable destinations (page blobs, files).

use tracing::trace;

use datamover_location::{AccessCondition, ChunkAddress, ChunkPayload, ObjectDestination};
use datamover_transfer::{Chunk, ControllerBase, TransferError};

pub(crate) struct RangeWriter {
    /// The destination was allocated zero-filled, so zero chunks need no write.
    skip_zero: bool,
}

impl RangeWriter {
    pub fn new(skip_zero: bool) -> Self {
        Self { skip_zero }
    }

    pub async fn write(
        &self,
        base: &ControllerBase,
        dest: &dyn ObjectDestination,
        chunk: Chunk,
    ) -> Result<(), TransferError> {
        let offset = chunk.offset();
        if self.skip_zero && chunk.is_zero() {
            trace!(offset, len = chunk.len(), "skipping empty range");
            return Ok(());
        }
        let payload = ChunkPayload::Bytes(chunk.into_bytes());
        base.call(dest.write_chunk(ChunkAddress::Range { offset }, payload, AccessCondition::none()))
            .await
    }
}
