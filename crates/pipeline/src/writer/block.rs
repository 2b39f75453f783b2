//! Block-addressable destinations: any available chunk, staged under a
//! deterministic id and committed as an ordered list.

use tracing::trace;

use datamover_location::{AccessCondition, ChunkAddress, ChunkPayload, ObjectDestination};
use datamover_transfer::{BlockIdGenerator, Chunk, ControllerBase, TransferError};

pub(crate) struct BlockWriter {
    ids: BlockIdGenerator,
    block_size: u64,
}

impl BlockWriter {
    pub fn new(destination_name: &str, block_size: u64) -> Self {
        Self {
            ids: BlockIdGenerator::new(destination_name),
            block_size,
        }
    }

    pub async fn write(
        &self,
        base: &ControllerBase,
        dest: &dyn ObjectDestination,
        chunk: Chunk,
    ) -> Result<(), TransferError> {
        let id = self.ids.id_for_offset(chunk.offset(), self.block_size);
        trace!(offset = chunk.offset(), %id, "staging block");
        let payload = ChunkPayload::Bytes(chunk.into_bytes());
        base.call(dest.write_chunk(ChunkAddress::Block { id }, payload, AccessCondition::none()))
            .await
    }

    /// Ordered block list for an object of `total` bytes.
    pub fn block_list(&self, total: u64) -> Vec<String> {
        self.ids.ids(total.div_ceil(self.block_size))
    }
}
