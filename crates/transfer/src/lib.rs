//! Core primitives of the transfer engine: jobs and their checkpoints, the
//! transfer window, chunk exchange between a reader and a writer, fan-in
//! counters and the lifecycle every controller shares.
//!
//! The engines themselves live in `datamover-pipeline` (client-mediated
//! chunked copy) and `datamover-copy` (server-side copies).

pub mod block_id;
pub mod checkpoint;
pub mod chunk;
pub mod commit;
pub mod controller;
pub mod driver;
mod error;
pub mod fan_in;
pub mod hash;
pub mod job;
mod options;
pub mod progress;
pub mod shared;
pub mod sizing;
pub mod validation;
pub mod verify;
pub mod window;

pub use block_id::BlockIdGenerator;
pub use checkpoint::{Checkpoint, CheckpointSnapshot};
pub use chunk::Chunk;
pub use controller::{
    Completion, ControllerBase, OverwritePolicy, TransferController, UnitGuard, WorkFuture,
};
pub use driver::drive;
pub use error::TransferError;
pub use fan_in::FanIn;
pub use hash::{ContentHasher, content_md5};
pub use job::{JobSnapshot, JobStatus, TransferJob};
pub use options::{CopyPollOptions, TransferOptions};
pub use progress::{
    JobProgress, ProgressCallback, ProgressEvent, ProgressSink, ProgressTracker, SpeedCalculator,
};
pub use shared::{FinalAttributes, SharedTransferData};
pub use sizing::{ChunkPlan, check_size_limit, plan_chunks};
pub use window::{ChunkScheduler, WindowMode};
