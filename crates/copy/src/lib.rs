//! Server-side copy engines.
//!
//! Neither engine moves bytes through the client:
//!
//! - [`AsyncCopyController`] starts a copy the service runs on its own and
//!   polls its status with [`PollBackoff`] until it ends.
//! - [`SyncCopyController`] asks the destination to copy one source range
//!   per call and commits once every range has landed.

pub mod async_copy;
pub mod backoff;
pub mod sync_copy;

pub use async_copy::{AsyncCopyBuilder, AsyncCopyController, AsyncCopyEvent, AsyncCopyState};
pub use backoff::PollBackoff;
pub use sync_copy::{SyncCopyController, SyncCopyEvent, SyncCopyState};
