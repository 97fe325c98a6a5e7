//! Background jobs for clustering and index rebuilds.
//!
//! Each job runs to completion on its own thread with its own database
//! connection. There is no cancellation: callers poll for the outcome.

pub mod manager;

use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::vectors::EntityKind;

pub use manager::JobManager;

/// Unique identifier for a background job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct JobId(pub u64);

impl JobId {
    pub fn new() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        JobId(COUNTER.fetch_add(1, Ordering::SeqCst))
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Clustering(EntityKind),
    IndexRebuild(EntityKind),
}

impl JobKind {
    pub fn display_name(&self) -> String {
        match self {
            JobKind::Clustering(kind) => format!("{} clustering", kind),
            JobKind::IndexRebuild(kind) => format!("{} index rebuild", kind),
        }
    }
}

/// How far a job has come, in records of its entity kind.
#[derive(Debug, Clone, PartialEq)]
pub struct JobProgress {
    pub done: usize,
    pub total: usize,
    pub stage: Option<&'static str>,
}

impl JobProgress {
    pub fn at(done: usize, total: usize) -> Self {
        Self {
            done,
            total,
            stage: None,
        }
    }

    pub fn in_stage(self, stage: &'static str) -> Self {
        Self {
            stage: Some(stage),
            ..self
        }
    }

    /// Share of the work done, in `[0, 1]`. An empty job counts as finished.
    pub fn fraction(&self) -> f32 {
        match self.total {
            0 => 1.0,
            total => (self.done.min(total) as f32) / total as f32,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Running,
    Completed,
    Failed(String),
}

/// Sent by a worker thread over its job channel.
#[derive(Debug, Clone)]
pub enum JobUpdate {
    Started { total: usize },
    Progress(JobProgress),
    Completed { message: String },
    Failed { error: String },
}

/// A tracked job and its update channel.
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub state: JobState,
    pub progress: Option<JobProgress>,
    pub receiver: mpsc::Receiver<JobUpdate>,
    pub started_at: Instant,
    handle: Option<JoinHandle<()>>,
}

impl Job {
    pub fn new(kind: JobKind, receiver: mpsc::Receiver<JobUpdate>) -> Self {
        Self {
            id: JobId::new(),
            kind,
            state: JobState::Running,
            progress: None,
            receiver,
            started_at: Instant::now(),
            handle: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == JobState::Running
    }
}

/// A job that finished since the last poll.
#[derive(Debug, Clone)]
pub struct JobCompletion {
    pub id: JobId,
    pub kind: JobKind,
    pub message: String,
    pub success: bool,
    pub elapsed: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_fraction() {
        assert_eq!(JobProgress::at(0, 0).fraction(), 1.0);
        assert_eq!(JobProgress::at(1, 4).fraction(), 0.25);
        assert_eq!(JobProgress::at(9, 4).fraction(), 1.0);
        assert_eq!(JobProgress::at(0, 3).in_stage("clustering").stage, Some("clustering"));
    }

    #[test]
    fn test_job_ids_are_unique() {
        assert_ne!(JobId::new(), JobId::new());
    }
}
