//! Job manager for clustering and rebuild passes.

use anyhow::{bail, Result};
use std::collections::HashMap;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use tracing::{error, info};

use super::{Job, JobCompletion, JobId, JobKind, JobProgress, JobState, JobUpdate};
use crate::config::Config;
use crate::db::Database;
use crate::library::run_clustering;
use crate::vectors::{EmbeddingSource, EntityKind, VectorIndexManager};

/// Tracks background jobs. Jobs share the vector indices with the caller but
/// open their own connection to the record store.
pub struct JobManager {
    config: Config,
    index: Arc<VectorIndexManager>,
    jobs: HashMap<JobId, Job>,
    /// Order in which jobs were added.
    job_order: Vec<JobId>,
}

impl JobManager {
    pub fn new(config: Config, index: Arc<VectorIndexManager>) -> Self {
        Self {
            config,
            index,
            jobs: HashMap::new(),
            job_order: Vec::new(),
        }
    }

    fn register(&mut self, kind: JobKind) -> Result<(JobId, mpsc::Sender<JobUpdate>)> {
        if self.is_running(kind) {
            bail!("{} is already running", kind.display_name());
        }
        let (tx, rx) = mpsc::channel();
        let job = Job::new(kind, rx);
        let id = job.id;

        self.jobs.insert(id, job);
        self.job_order.push(id);

        Ok((id, tx))
    }

    fn attach(&mut self, id: JobId, handle: thread::JoinHandle<()>) {
        if let Some(job) = self.jobs.get_mut(&id) {
            job.handle = Some(handle);
        }
    }

    /// Start a full clustering pass for `kind`.
    pub fn spawn_clustering(&mut self, kind: EntityKind) -> Result<JobId> {
        if !kind.has_identities() {
            bail!("{} records are not clustered", kind);
        }
        let (id, tx) = self.register(JobKind::Clustering(kind))?;
        let config = self.config.clone();

        let handle = thread::spawn(move || {
            let result = (|| -> Result<String> {
                let db = Database::open(&config.db_path)?;
                let total = db.count_embeddings(kind, config.index.dimension(kind))?;
                let _ = tx.send(JobUpdate::Started { total });
                let _ = tx.send(JobUpdate::Progress(
                    JobProgress::at(0, total).in_stage("clustering"),
                ));

                let report = run_clustering(&db, &config, kind)?;
                Ok(format!(
                    "{:?}: {} groups, {} clustered, {} noise, {} created, {} reused",
                    report.status,
                    report.groups,
                    report.clustered,
                    report.noise,
                    report.identities_created,
                    report.identities_reused
                ))
            })();
            finish(&tx, kind, result);
        });

        self.attach(id, handle);
        info!("Started {} clustering job", kind);
        Ok(id)
    }

    /// Start an unconditional rebuild of the `kind` index.
    pub fn spawn_rebuild(&mut self, kind: EntityKind) -> Result<JobId> {
        let (id, tx) = self.register(JobKind::IndexRebuild(kind))?;
        let db_path = self.config.db_path.clone();
        let index = Arc::clone(&self.index);

        let handle = thread::spawn(move || {
            let result = (|| -> Result<String> {
                let db = Database::open(&db_path)?;
                let total = db.count_embeddings(kind, index.dimension(kind))?;
                let _ = tx.send(JobUpdate::Started { total });

                let outcome = index.rebuild(kind, &db)?;
                Ok(format!("{:?} with {} vectors", outcome.action, outcome.count))
            })();
            finish(&tx, kind, result);
        });

        self.attach(id, handle);
        info!("Started {} index rebuild job", kind);
        Ok(id)
    }

    /// Check if a job of the given kind is already running.
    pub fn is_running(&self, kind: JobKind) -> bool {
        self.jobs.values().any(|j| j.kind == kind && j.is_running())
    }

    /// Drain every job channel. Returns the jobs that finished.
    pub fn poll_updates(&mut self) -> Vec<JobCompletion> {
        let mut completed = Vec::new();

        for (&id, job) in self.jobs.iter_mut() {
            while let Ok(update) = job.receiver.try_recv() {
                match update {
                    JobUpdate::Started { total } => {
                        job.progress = Some(JobProgress::at(0, total));
                    }
                    JobUpdate::Progress(progress) => {
                        job.progress = Some(progress);
                    }
                    JobUpdate::Completed { message } => {
                        job.state = JobState::Completed;
                        completed.push(JobCompletion {
                            id,
                            kind: job.kind,
                            message,
                            success: true,
                            elapsed: job.started_at.elapsed(),
                        });
                    }
                    JobUpdate::Failed { error } => {
                        job.state = JobState::Failed(error.clone());
                        completed.push(JobCompletion {
                            id,
                            kind: job.kind,
                            message: error,
                            success: false,
                            elapsed: job.started_at.elapsed(),
                        });
                    }
                }
            }
        }

        for info in &completed {
            if let Some(mut job) = self.jobs.remove(&info.id) {
                if let Some(handle) = job.handle.take() {
                    let _ = handle.join();
                }
            }
            self.job_order.retain(|id| *id != info.id);
        }

        completed
    }

    /// Block until every running job has finished.
    pub fn wait_all(&mut self) -> Vec<JobCompletion> {
        for job in self.jobs.values_mut() {
            if let Some(handle) = job.handle.take() {
                if handle.join().is_err() {
                    job.state = JobState::Failed("worker thread panicked".to_string());
                }
            }
        }
        let mut completed = self.poll_updates();

        // Jobs whose thread died without reporting.
        let stuck: Vec<JobId> = self
            .jobs
            .iter()
            .filter(|(_, j)| !matches!(j.state, JobState::Completed))
            .map(|(id, _)| *id)
            .collect();
        for id in stuck {
            if let Some(job) = self.jobs.remove(&id) {
                completed.push(JobCompletion {
                    id,
                    kind: job.kind,
                    message: "worker exited without reporting".to_string(),
                    success: false,
                    elapsed: job.started_at.elapsed(),
                });
            }
            self.job_order.retain(|j| *j != id);
        }

        completed
    }

    /// Running jobs in start order.
    pub fn running_jobs(&self) -> Vec<&Job> {
        self.job_order
            .iter()
            .filter_map(|id| self.jobs.get(id))
            .filter(|j| j.is_running())
            .collect()
    }

    pub fn has_running_jobs(&self) -> bool {
        self.jobs.values().any(|j| j.is_running())
    }
}

fn finish(tx: &mpsc::Sender<JobUpdate>, kind: EntityKind, result: Result<String>) {
    let update = match result {
        Ok(message) => JobUpdate::Completed { message },
        Err(e) => {
            error!("{} job failed: {:#}", kind, e);
            JobUpdate::Failed {
                error: format!("{:#}", e),
            }
        }
    };
    let _ = tx.send(update);
}
