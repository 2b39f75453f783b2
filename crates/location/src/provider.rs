//! Provider traits the transfer engine drives.
//!
//! Both traits are object safe: every async operation returns a boxed
//! future so controllers can hold `Arc<dyn ObjectSource>` and
//! `Arc<dyn ObjectDestination>` selected once at construction. Arguments are
//! taken by value so implementations never have to tie them to `&self`.

use std::future::Future;
use std::pin::Pin;

use crate::attributes::{AccessCondition, Attributes, ByteRange, ContentProperties, CopyStatus, Metadata};
use crate::error::ProviderError;
use crate::location::{BlobKind, Location, LocationKind};

/// Boxed future returned by every provider operation.
pub type ProviderFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ProviderError>> + Send + 'a>>;

/// Where a chunk lands in the destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkAddress {
    /// Positional write (page, file, local, stream).
    Range { offset: u64 },
    /// Write at the current end; position guarded by [`AccessCondition::append_position`].
    Append,
    /// Uncommitted block of a block-addressable object.
    Block { id: String },
}

/// What a chunk write carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkPayload {
    /// Bytes already held by the client.
    Bytes(Vec<u8>),
    /// Server-to-server copy of a byte range.
    SourceRange {
        source_uri: String,
        offset: u64,
        length: u64,
    },
    /// Server-to-server copy of a whole object.
    SourceObject { source_uri: String },
}

impl ChunkPayload {
    /// Payload length when it is known without contacting the source.
    pub fn len(&self) -> Option<u64> {
        match self {
            Self::Bytes(b) => Some(b.len() as u64),
            Self::SourceRange { length, .. } => Some(*length),
            Self::SourceObject { .. } => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == Some(0)
    }
}

fn unsupported<'a, T: Send + 'a>(op: &str, location: &Location) -> ProviderFuture<'a, T> {
    let err = ProviderError::unsupported(op, location);
    Box::pin(std::future::ready(Err(err)))
}

/// Readable side of a transfer.
pub trait ObjectSource: Send + Sync {
    fn location(&self) -> &Location;

    /// Fetches length, ETag, properties and metadata.
    ///
    /// Absence is reported as [`ProviderError::NotFound`].
    fn fetch_attributes(&self) -> ProviderFuture<'_, Attributes>;

    /// Reads `length` bytes at `offset`. Short reads only happen at the end
    /// of a source whose length is not known up front.
    fn read_range(
        &self,
        offset: u64,
        length: u64,
        conditions: AccessCondition,
    ) -> ProviderFuture<'_, Vec<u8>>;

    /// Populated ranges within `[offset, offset + length)`.
    ///
    /// Sources that are never sparse report the whole window.
    fn list_ranges(&self, offset: u64, length: u64) -> ProviderFuture<'_, Vec<ByteRange>> {
        Box::pin(std::future::ready(Ok(vec![ByteRange::new(offset, length)])))
    }

    /// URI a destination service can copy from.
    fn copy_source_uri(&self) -> Option<String> {
        self.location().copy_source_uri()
    }

    /// Whether [`list_ranges`](Self::list_ranges) carries real sparseness information.
    fn needs_range_discovery(&self) -> bool {
        matches!(self.location().kind(), LocationKind::Blob(BlobKind::Page))
    }

    /// Reads must be issued strictly in offset order, one at a time.
    fn sequential_only(&self) -> bool {
        false
    }

    /// `false` when the total length is only discovered at end of data.
    fn length_known(&self) -> bool {
        true
    }
}

/// Writable side of a transfer.
///
/// Operations a destination kind has no use for default to
/// [`ProviderError::Unsupported`].
pub trait ObjectDestination: Send + Sync {
    fn location(&self) -> &Location;

    /// Probes existence, size and type. Absence is [`ProviderError::NotFound`].
    fn fetch_attributes(&self) -> ProviderFuture<'_, Attributes>;

    /// Allocates (or truncates) the destination to `size` bytes.
    fn create(&self, size: u64, conditions: AccessCondition) -> ProviderFuture<'_, ()>;

    /// Writes one chunk.
    fn write_chunk(
        &self,
        address: ChunkAddress,
        payload: ChunkPayload,
        conditions: AccessCondition,
    ) -> ProviderFuture<'_, ()>;

    /// Writes the whole object in one call, replacing any existing content.
    ///
    /// Providers may apply default content-type / content-encoding values
    /// when the supplied ones are empty.
    fn put_whole(
        &self,
        _payload: ChunkPayload,
        _properties: ContentProperties,
        _metadata: Metadata,
        _conditions: AccessCondition,
    ) -> ProviderFuture<'_, ()> {
        unsupported("put_whole", self.location())
    }

    /// Commits uncommitted blocks in the given order.
    ///
    /// An empty content type cannot be expressed here; providers fall back
    /// to their default.
    fn submit_block_list(
        &self,
        _block_ids: Vec<String>,
        _properties: ContentProperties,
        _metadata: Metadata,
        _conditions: AccessCondition,
    ) -> ProviderFuture<'_, ()> {
        unsupported("submit_block_list", self.location())
    }

    /// Replaces content properties exactly as given (`Some("")` clears).
    fn set_properties(&self, _properties: ContentProperties) -> ProviderFuture<'_, ()> {
        unsupported("set_properties", self.location())
    }

    /// Applies final properties and metadata once all data is written.
    fn commit(&self, properties: ContentProperties, metadata: Metadata) -> ProviderFuture<'_, ()>;

    /// Starts a server-initiated copy and returns its copy id.
    fn start_copy(
        &self,
        _source_uri: String,
        _conditions: AccessCondition,
    ) -> ProviderFuture<'_, String> {
        unsupported("start_copy", self.location())
    }

    fn get_copy_status(&self, _copy_id: String) -> ProviderFuture<'_, CopyStatus> {
        unsupported("get_copy_status", self.location())
    }

    /// Reads back destination bytes for content verification.
    fn read_range(&self, _offset: u64, _length: u64) -> ProviderFuture<'_, Vec<u8>> {
        unsupported("read_range", self.location())
    }

    /// Flushes buffered writes (streams, local files).
    fn flush(&self) -> ProviderFuture<'_, ()> {
        Box::pin(std::future::ready(Ok(())))
    }
}
