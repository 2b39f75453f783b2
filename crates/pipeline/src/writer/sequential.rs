//! In-order writes: local files, streams and append-only objects.

use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::debug;

use datamover_location::{
    AccessCondition, ChunkAddress, ChunkPayload, DestinationKind, ObjectDestination, ObjectSource,
};
use datamover_transfer::verify::resolve_append_race;
use datamover_transfer::{Chunk, ControllerBase, SharedTransferData, TransferError};

struct Cursor {
    next: u64,
    busy: bool,
}

/// Consumes chunks strictly by expected offset, one write at a time.
pub(crate) struct SequentialWriter {
    kind: DestinationKind,
    cursor: Mutex<Cursor>,
}

impl SequentialWriter {
    /// `start` is the first offset not yet known to be written.
    pub fn new(kind: DestinationKind, start: u64) -> Self {
        Self {
            kind,
            cursor: Mutex::new(Cursor {
                next: start,
                busy: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Cursor> {
        self.cursor.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn can_claim(&self, shared: &SharedTransferData) -> bool {
        let c = self.lock();
        !c.busy && shared.is_available(c.next)
    }

    pub fn claim(&self, shared: &SharedTransferData) -> Option<Chunk> {
        let mut c = self.lock();
        if c.busy {
            return None;
        }
        let chunk = shared.claim(c.next)?;
        c.busy = true;
        Some(chunk)
    }

    pub async fn write(
        &self,
        base: &ControllerBase,
        source: &dyn ObjectSource,
        dest: &dyn ObjectDestination,
        chunk: Chunk,
    ) -> Result<(), TransferError> {
        let offset = chunk.offset();
        let length = chunk.len();
        let append = self.kind == DestinationKind::AppendBlob;
        let (address, conditions) = if append {
            let conditions = AccessCondition {
                max_size: Some(self.kind.max_size()),
                ..AccessCondition::append_at(offset)
            };
            (ChunkAddress::Append, conditions)
        } else {
            (ChunkAddress::Range { offset }, AccessCondition::none())
        };

        let payload = ChunkPayload::Bytes(chunk.into_bytes());
        match base.call(dest.write_chunk(address, payload, conditions)).await {
            Ok(()) => {}
            Err(e) if append && e.is_precondition_failed() => {
                debug!(destination = %dest.location(), offset, "append position race, verifying content");
                base.call(resolve_append_race(source, dest, offset, length, e))
                    .await?;
            }
            Err(e) => return Err(e),
        }

        let mut c = self.lock();
        c.next = offset + length;
        c.busy = false;
        Ok(())
    }
}
