//! Process-group bootstrap.
//!
//! Runs the coordinator and every worker in its own thread. Two fabrics are
//! built per run: the world fabric (coordinator is rank 0, workers are ranks
//! 1..=N) and the worker-group fabric (workers are ranks 0..N-1), whose
//! endpoints are owned by the workers' console locks. Every process keeps its
//! endpoints open until the final barrier.

use std::io;
use std::path::PathBuf;
use std::sync::{Arc, Barrier};
use std::thread::{self, JoinHandle};

use thiserror::Error;
use tracing::{info, info_span, warn};

use crate::coordinator::{Coordinator, CoordinatorError, Outcome, COORDINATOR_RANK};
use crate::fabric::{Fabric, FabricConfig, Rank};
use crate::lock::{ConsoleLock, ReplyPolicy};
use crate::worker::{ConsoleSink, WorkerDriver, WorkerState};

#[cfg(test)]
mod tests;

/// Everything needed to launch one run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub job_file: PathBuf,
    /// Total process count, coordinator included.
    pub processes: u32,
    pub policy: ReplyPolicy,
    /// Applied to both fabrics.
    pub fabric: FabricConfig,
}

/// Failures of the launcher itself, as opposed to outcomes of a run.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("a process group needs at least one process")]
    EmptyGroup,

    #[error("failed to start process {rank}: {source}")]
    Spawn {
        rank: Rank,
        #[source]
        source: io::Error,
    },

    #[error("process {rank} panicked")]
    Panicked { rank: Rank },

    #[error("coordinator failed: {0}")]
    Coordinator(#[from] CoordinatorError),
}

/// Final state of one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerReport {
    /// World rank.
    pub rank: Rank,
    pub state: WorkerState,
    pub printed: usize,
    /// Jobs still queued when the worker halted.
    pub queued: usize,
    pub abort_signal: Option<u64>,
    /// Logical clock when the worker halted.
    pub clock: u64,
}

impl<S: ConsoleSink> From<&WorkerDriver<S>> for WorkerReport {
    fn from(driver: &WorkerDriver<S>) -> Self {
        WorkerReport {
            rank: driver.rank(),
            state: driver.state(),
            printed: driver.printed(),
            queued: driver.queued(),
            abort_signal: driver.abort_signal(),
            clock: driver.console_lock().clock(),
        }
    }
}

/// How a run ended.
#[derive(Debug)]
pub struct RunReport {
    pub coordinator: Outcome,
    /// Ordered by rank.
    pub workers: Vec<WorkerReport>,
}

impl RunReport {
    /// Status the launcher exits with. Workers always report zero.
    pub fn exit_status(&self) -> i32 {
        self.coordinator.exit_status()
    }

    /// Jobs printed across all workers.
    pub fn total_printed(&self) -> usize {
        self.workers.iter().map(|w| w.printed).sum()
    }
}

/// Launch the process group and wait for every process to finish.
///
/// `make_sink` builds the console sink of the worker with the given world
/// rank.
pub fn run<S, F>(config: &RunConfig, make_sink: F) -> Result<RunReport, ClusterError>
where
    S: ConsoleSink + 'static,
    F: Fn(Rank) -> S,
{
    if config.processes == 0 {
        return Err(ClusterError::EmptyGroup);
    }

    let workers = config.processes - 1;
    info!(
        processes = config.processes,
        policy = ?config.policy,
        job_file = %config.job_file.display(),
        "starting process group"
    );

    let mut world = Fabric::build(config.processes, &config.fabric).into_iter();
    let lock_group = Fabric::build(workers, &config.fabric);
    let barrier = Arc::new(Barrier::new(config.processes as usize));

    let coordinator_world = world.next().ok_or(ClusterError::EmptyGroup)?;
    let coordinator = spawn_coordinator(
        Coordinator::new(coordinator_world, config.job_file.clone()),
        Arc::clone(&barrier),
    )?;

    let mut handles = Vec::with_capacity(workers as usize);
    for (world, group) in world.zip(lock_group) {
        let rank = world.rank();
        let lock = ConsoleLock::new(group, config.policy);
        let driver = WorkerDriver::new(world, lock, make_sink(rank));
        handles.push((rank, spawn_worker(driver, Arc::clone(&barrier))?));
    }

    let mut reports = Vec::with_capacity(handles.len());
    for (rank, handle) in handles {
        reports.push(handle.join().map_err(|_| ClusterError::Panicked { rank })?);
    }
    let outcome = coordinator
        .join()
        .map_err(|_| ClusterError::Panicked {
            rank: COORDINATOR_RANK,
        })??;

    info!(
        status = outcome.exit_status(),
        printed = reports.iter().map(|r| r.printed).sum::<usize>(),
        "process group finished"
    );

    Ok(RunReport {
        coordinator: outcome,
        workers: reports,
    })
}

fn spawn_coordinator(
    mut coordinator: Coordinator,
    barrier: Arc<Barrier>,
) -> Result<JoinHandle<Result<Outcome, CoordinatorError>>, ClusterError> {
    thread::Builder::new()
        .name("coordinator".to_string())
        .spawn(move || {
            let _span = info_span!("coordinator").entered();
            let outcome = coordinator.run();
            if let Err(e) = &outcome {
                warn!(error = %e, "coordinator stopped early");
            }
            barrier.wait();
            outcome
        })
        .map_err(|source| ClusterError::Spawn {
            rank: COORDINATOR_RANK,
            source,
        })
}

fn spawn_worker<S: ConsoleSink + 'static>(
    mut driver: WorkerDriver<S>,
    barrier: Arc<Barrier>,
) -> Result<JoinHandle<WorkerReport>, ClusterError> {
    let rank = driver.rank();
    thread::Builder::new()
        .name(format!("worker-{}", rank))
        .spawn(move || {
            let _span = info_span!("worker", rank).entered();
            driver.run();
            let report = WorkerReport::from(&driver);
            // Endpoints stay open until every process is done.
            barrier.wait();
            report
        })
        .map_err(|source| ClusterError::Spawn { rank, source })
}
