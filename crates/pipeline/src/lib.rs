//! Client-mediated chunked transfer.
//!
//! A [`ChunkReader`] reads the source chunk by chunk and publishes each chunk
//! into the job's shared exchange; a [`ChunkWriter`] claims chunks and writes
//! them with the discipline its destination requires, then commits once every
//! chunk is accounted for. [`ChunkedTransferController`] drives both.

mod controller;
mod exchange;
pub mod reader;
pub mod writer;

pub use controller::ChunkedTransferController;
pub use reader::{ChunkReader, ReaderState};
pub use writer::{ChunkWriter, WriterEvent, WriterState, transition};
