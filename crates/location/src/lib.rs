//! Locations, attributes and provider interfaces consumed by the transfer
//! engine.
//!
//! The engine never talks to a storage service directly. It drives
//! [`ObjectSource`] and [`ObjectDestination`] implementations, which this
//! crate defines together with three bundled providers:
//!
//! - [`local::LocalObject`] for files on the local filesystem
//! - [`stream::StreamSource`] / [`stream::StreamDestination`] for generic byte streams
//! - [`memory::MemoryStore`] for an in-process object store (block, page,
//!   append and file objects, server-side copies)

pub mod attributes;
pub mod error;
pub mod local;
pub mod location;
pub mod memory;
pub mod provider;
pub mod stream;

pub use attributes::{
    AccessCondition, Attributes, ByteRange, ContentProperties, CopyState, CopyStatus, Metadata,
};
pub use error::ProviderError;
pub use location::{
    BlobKind, BlobLocation, DestinationKind, FileLocation, Location, LocationKind, SourceUri,
    StreamLocation,
};
pub use provider::{ChunkAddress, ChunkPayload, ObjectDestination, ObjectSource, ProviderFuture};

/// Page-addressable objects are written in units of this many bytes.
pub const PAGE_SIZE: u64 = 512;

/// Largest single range write accepted by page, append and file objects.
pub const MAX_RANGE_WRITE: u64 = 4 * 1024 * 1024;

/// Largest single block accepted by a block-addressable object.
pub const MAX_BLOCK_SIZE: u64 = 4000 * 1024 * 1024;

/// Maximum number of blocks in a committed block list.
pub const MAX_BLOCK_COUNT: u64 = 50_000;
