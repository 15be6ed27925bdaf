//! The coordinator process.
//!
//! Runs to completion with blocking fabric calls: it is not part of the
//! worker group, so nothing ever waits on it while it blocks.

use std::collections::BTreeSet;
use std::path::PathBuf;

use thiserror::Error;
use tracing::{debug, error, info};

use crate::fabric::{encode, Endpoint, FabricError, Rank, Source, Tag};

use super::jobfile::{JobFile, JobFileError};
use super::{ABORT_SIGNAL, COORDINATOR_RANK, FAILURE_SIGNAL};

/// Why the coordinator did not complete a run.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    JobFile(#[from] JobFileError),

    #[error("{needed} processes are needed to run! But this group has {actual} processes")]
    ProcessCountMismatch { needed: u32, actual: u32 },

    #[error("worker {rank} failed")]
    WorkerFailed { rank: Rank },

    #[error("world fabric: {0}")]
    Fabric(#[from] FabricError),
}

impl CoordinatorError {
    /// Whether this is a problem with the job file or the process group,
    /// answered with an abort broadcast.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            CoordinatorError::JobFile(_) | CoordinatorError::ProcessCountMismatch { .. }
        )
    }
}

/// How a coordinator run ended.
#[derive(Debug)]
pub enum Outcome {
    /// Every job was delivered and every worker acknowledged.
    Completed { jobs: usize },
    /// The configuration was rejected, or a worker failed, and every worker
    /// was told to abort.
    Aborted { reason: CoordinatorError, signal: u64 },
}

impl Outcome {
    /// Process exit status: the abort signal, or 1 if it does not fit.
    pub fn exit_status(&self) -> i32 {
        match self {
            Outcome::Completed { .. } => 0,
            Outcome::Aborted { signal, .. } => i32::try_from(*signal).unwrap_or(1),
        }
    }
}

/// Rank 0 of the world fabric.
pub struct Coordinator {
    world: Endpoint,
    job_file: PathBuf,
}

impl Coordinator {
    /// Coordinator over its world endpoint, reading jobs from `job_file`.
    pub fn new(world: Endpoint, job_file: impl Into<PathBuf>) -> Self {
        Coordinator {
            world,
            job_file: job_file.into(),
        }
    }

    /// Distribute every job, then run the two-phase end-of-work handshake.
    ///
    /// A configuration error is reported once on stdout and answered with an
    /// abort to every worker. So is a failed completion notice, except that
    /// it is only logged. Only fabric failures are returned as errors.
    pub fn run(&mut self) -> Result<Outcome, CoordinatorError> {
        let file = match self.prepare() {
            Ok(file) => file,
            Err(reason) if reason.is_configuration() => {
                println!("Error: {}", reason);
                error!(error = %reason, "rejecting configuration");
                self.shut_down_all(ABORT_SIGNAL)?;
                return Ok(Outcome::Aborted {
                    reason,
                    signal: ABORT_SIGNAL,
                });
            }
            Err(e) => return Err(e),
        };

        for job in &file.jobs {
            self.world.send(job.rank, Tag::Job, job.text.as_bytes().to_vec())?;
        }
        info!(jobs = file.jobs.len(), workers = file.workers, "jobs distributed");

        self.broadcast(Tag::EndOfInput, &0u64)?;
        if let Some(rank) = self.await_workers()? {
            let reason = CoordinatorError::WorkerFailed { rank };
            error!(error = %reason, "aborting group");
            self.shut_down_all(FAILURE_SIGNAL)?;
            return Ok(Outcome::Aborted {
                reason,
                signal: FAILURE_SIGNAL,
            });
        }

        Ok(Outcome::Completed {
            jobs: file.jobs.len(),
        })
    }

    /// World rank, always [`COORDINATOR_RANK`].
    pub fn rank(&self) -> Rank {
        self.world.rank()
    }

    fn prepare(&self) -> Result<JobFile, CoordinatorError> {
        let file = JobFile::load(&self.job_file)?;
        let actual = self.world.size();
        if file.processes_needed() != actual {
            return Err(CoordinatorError::ProcessCountMismatch {
                needed: file.processes_needed(),
                actual,
            });
        }
        Ok(file)
    }

    /// Collect every worker's completion notice, then acknowledge each.
    ///
    /// Stops at the first failed notice and returns its sender, without
    /// acknowledging anyone.
    fn await_workers(&mut self) -> Result<Option<Rank>, CoordinatorError> {
        let mut pending: BTreeSet<Rank> = self.workers().collect();
        while !pending.is_empty() {
            let envelope = self.world.recv(Source::Any, Tag::EndOfJobs)?;
            let done: bool = envelope.decode()?;
            debug!(worker = envelope.source, done, "completion notice");
            if !done {
                return Ok(Some(envelope.source));
            }
            pending.remove(&envelope.source);
        }
        info!("all workers done");
        self.broadcast(Tag::EndOfJobs, &true)?;
        Ok(None)
    }

    fn shut_down_all(&mut self, signal: u64) -> Result<(), CoordinatorError> {
        self.broadcast(Tag::Abort, &signal)
    }

    fn broadcast<T: serde::Serialize>(&mut self, tag: Tag, value: &T) -> Result<(), CoordinatorError> {
        let body = encode(value)?;
        for worker in self.workers() {
            self.world.send(worker, tag, body.clone())?;
        }
        Ok(())
    }

    fn workers(&self) -> impl Iterator<Item = Rank> {
        (0..self.world.size()).filter(|&r| r != COORDINATOR_RANK)
    }
}
