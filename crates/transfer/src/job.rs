//! A persistable transfer job: endpoints, lifecycle status and checkpoint.

use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};

use datamover_location::Location;

use crate::TransferError;
use crate::checkpoint::{Checkpoint, CheckpointSnapshot};

/// Lifecycle of a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum JobStatus {
    #[default]
    NotStarted,
    Transfer,
    /// Waiting on a server-initiated copy.
    Monitor,
    Finished,
}

/// Persisted form of a [`TransferJob`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSnapshot {
    pub id: String,
    pub source: Location,
    pub destination: Location,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub copy_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overwrite: Option<bool>,
    #[serde(default)]
    pub checkpoint: CheckpointSnapshot,
}

/// One logical object-to-object transfer (thread-safe).
pub struct TransferJob {
    id: String,
    source: Location,
    destination: Location,
    inner: RwLock<JobInner>,
    checkpoint: Arc<Checkpoint>,
}

struct JobInner {
    status: JobStatus,
    copy_id: Option<String>,
    /// Cached overwrite decision: unset, allow or deny.
    overwrite: Option<bool>,
}

impl TransferJob {
    /// Creates a job that has not started yet.
    pub fn new(source: Location, destination: Location) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source,
            destination,
            inner: RwLock::new(JobInner {
                status: JobStatus::NotStarted,
                copy_id: None,
                overwrite: None,
            }),
            checkpoint: Arc::new(Checkpoint::new()),
        }
    }

    /// Replaces the generated id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn from_snapshot(snapshot: JobSnapshot) -> Self {
        Self {
            id: snapshot.id,
            source: snapshot.source,
            destination: snapshot.destination,
            inner: RwLock::new(JobInner {
                status: snapshot.status,
                copy_id: snapshot.copy_id,
                overwrite: snapshot.overwrite,
            }),
            checkpoint: Arc::new(Checkpoint::from_snapshot(snapshot.checkpoint)),
        }
    }

    pub fn snapshot(&self) -> JobSnapshot {
        let s = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        JobSnapshot {
            id: self.id.clone(),
            source: self.source.clone(),
            destination: self.destination.clone(),
            status: s.status,
            copy_id: s.copy_id.clone(),
            overwrite: s.overwrite,
            checkpoint: self.checkpoint.snapshot(),
        }
    }

    pub fn to_json(&self) -> Result<String, TransferError> {
        Ok(serde_json::to_string(&self.snapshot())?)
    }

    pub fn from_json(json: &str) -> Result<Self, TransferError> {
        let snapshot: JobSnapshot = serde_json::from_str(json)?;
        Ok(Self::from_snapshot(snapshot))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn source(&self) -> &Location {
        &self.source
    }

    pub fn destination(&self) -> &Location {
        &self.destination
    }

    pub fn checkpoint(&self) -> &Arc<Checkpoint> {
        &self.checkpoint
    }

    pub fn status(&self) -> JobStatus {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).status
    }

    pub fn set_status(&self, status: JobStatus) {
        let mut s = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        s.status = status;
    }

    pub fn copy_id(&self) -> Option<String> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .copy_id
            .clone()
    }

    /// Records the copy id and moves the job to [`JobStatus::Monitor`].
    pub fn begin_monitor(&self, copy_id: String) {
        let mut s = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        s.copy_id = Some(copy_id);
        s.status = JobStatus::Monitor;
    }

    pub fn overwrite(&self) -> Option<bool> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).overwrite
    }

    /// Caches the overwrite decision; the first decision sticks.
    pub fn decide_overwrite(&self, decide: impl FnOnce() -> bool) -> bool {
        let mut s = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        *s.overwrite.get_or_insert_with(decide)
    }
}
