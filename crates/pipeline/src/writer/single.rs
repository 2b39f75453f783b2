//! Objects small enough to be written in one call.

use tracing::debug;

use datamover_location::{AccessCondition, ChunkPayload, ObjectDestination};
use datamover_transfer::{Chunk, ControllerBase, FinalAttributes, TransferError};

use crate::exchange::Exchange;

/// Collects every chunk, then writes the whole object with one put.
pub(crate) struct SingleShotWriter;

impl SingleShotWriter {
    /// All chunks have been read and none has been claimed yet.
    pub fn can_claim(&self, exchange: &Exchange) -> bool {
        let available = exchange.shared.available();
        available > 0
            && exchange.scheduler.is_exhausted()
            && available == exchange.scheduler.checkpoint().window_len()
    }

    pub fn claim(&self, exchange: &Exchange) -> Option<Vec<Chunk>> {
        if !self.can_claim(exchange) {
            return None;
        }
        let mut chunks = Vec::new();
        while let Some(chunk) = exchange.shared.claim_any() {
            chunks.push(chunk);
        }
        Some(chunks)
    }

    pub async fn put(
        &self,
        base: &ControllerBase,
        dest: &dyn ObjectDestination,
        chunks: &mut [Chunk],
        attrs: FinalAttributes,
        content_md5: Option<&str>,
    ) -> Result<(), TransferError> {
        chunks.sort_by_key(Chunk::offset);
        let total: u64 = chunks.iter().map(Chunk::len).sum();
        let mut data = Vec::with_capacity(total as usize);
        for chunk in chunks.iter() {
            for segment in chunk.segments() {
                data.extend_from_slice(segment);
            }
        }
        let mut properties = attrs.properties;
        if let Some(md5) = content_md5 {
            properties.content_md5 = Some(md5.to_string());
        }
        base.call(dest.put_whole(
            ChunkPayload::Bytes(data),
            properties,
            attrs.metadata,
            AccessCondition::none(),
        ))
        .await?;
        debug!(destination = %dest.location(), bytes = total, "object written in one call");
        Ok(())
    }
}
