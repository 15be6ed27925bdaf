//! Per-worker control loop.
//!
//! Every step is non-blocking: it polls the coordinator's messages, services
//! peers through the console lock and prints at most one job.

use std::collections::VecDeque;
use std::io;
use std::thread;

use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::coordinator::COORDINATOR_RANK;
use crate::fabric::{encode, Endpoint, FabricError, Rank, RecvHandle, SendHandle, Source, Tag};
use crate::lock::{ConsoleLock, LockError};

use super::sink::{ConsoleSink, PrintLine};

/// Worker lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    /// Accepting jobs.
    Running,
    /// End-of-input seen; queued jobs may remain.
    Draining,
    /// Completion notice sent; waiting for the group-done acknowledgment.
    NotifiedDone,
    Terminated,
    /// Aborted by the coordinator, or failed locally.
    Error,
}

impl WorkerState {
    /// Whether the loop has halted.
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkerState::Terminated | WorkerState::Error)
    }
}

/// Local failures that stop a worker.
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("console lock: {0}")]
    Lock(#[from] LockError),

    #[error("world fabric: {0}")]
    Fabric(#[from] FabricError),

    #[error("console sink: {0}")]
    Sink(#[from] io::Error),

    /// The lock granted a round with no job behind it.
    #[error("granted round has no queued job")]
    NoQueuedJob,
}

/// Drives one worker from intake to termination.
pub struct WorkerDriver<S: ConsoleSink> {
    /// World endpoint (coordinator is rank 0).
    world: Endpoint,
    lock: ConsoleLock,
    sink: S,
    state: WorkerState,
    /// Jobs awaiting output, one lock round each.
    jobs: VecDeque<String>,
    eof: Option<RecvHandle>,
    abort: Option<RecvHandle>,
    ack: Option<RecvHandle>,
    notice: Option<SendHandle>,
    eof_seen: bool,
    abort_signal: Option<u64>,
    ack_seen: bool,
    notice_delivered: bool,
    printed: usize,
}

impl<S: ConsoleSink> WorkerDriver<S> {
    /// Wrap a world endpoint and a console lock over the worker group.
    ///
    /// Posts the standing receives for end-of-input and abort, and initialises
    /// the lock.
    pub fn new(mut world: Endpoint, mut lock: ConsoleLock, sink: S) -> Self {
        lock.init();
        let coordinator = Source::Rank(COORDINATOR_RANK);
        let eof = world.irecv(coordinator, Tag::EndOfInput);
        let abort = world.irecv(coordinator, Tag::Abort);

        WorkerDriver {
            world,
            lock,
            sink,
            state: WorkerState::Running,
            jobs: VecDeque::new(),
            eof: Some(eof),
            abort: Some(abort),
            ack: None,
            notice: None,
            eof_seen: false,
            abort_signal: None,
            ack_seen: false,
            notice_delivered: false,
            printed: 0,
        }
    }

    /// Run one loop iteration. Returns the state after it.
    ///
    /// Does nothing once the worker has halted.
    pub fn step(&mut self) -> Result<WorkerState, WorkerError> {
        if self.state.is_terminal() {
            return Ok(self.state);
        }

        self.intake()?;

        if self.poll_abort()? {
            return Ok(self.state);
        }

        self.poll_end_of_input()?;

        if self.poll_ack()? {
            return Ok(self.state);
        }

        // Peers may depend on our replies in every state, including while
        // waiting for the acknowledgment.
        self.lock.test()?;

        if self.lock.lock()? {
            self.print_head()?;
        }

        Ok(self.state)
    }

    /// Step until the worker halts.
    ///
    /// A local failure is reported to the coordinator. Once it answers, the
    /// loop ends in [`WorkerState::Error`].
    pub fn run(&mut self) -> WorkerState {
        info!(rank = self.rank(), "worker started");
        loop {
            match self.step() {
                Ok(state) if state.is_terminal() => return state,
                Ok(_) => thread::yield_now(),
                Err(e) => {
                    error!(rank = self.rank(), error = %e, "worker failed");
                    if let Err(e) = self.report_failure() {
                        error!(rank = self.rank(), error = %e, "failure not reported");
                    }
                    self.halt(WorkerState::Error);
                    return self.state;
                }
            }
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// World rank.
    pub fn rank(&self) -> Rank {
        self.world.rank()
    }

    /// Jobs received but not yet printed.
    pub fn queued(&self) -> usize {
        self.jobs.len()
    }

    /// Jobs printed so far.
    pub fn printed(&self) -> usize {
        self.printed
    }

    /// Signal carried by the coordinator's abort, if one arrived.
    pub fn abort_signal(&self) -> Option<u64> {
        self.abort_signal
    }

    /// The lock this worker requests the console through.
    pub fn console_lock(&self) -> &ConsoleLock {
        &self.lock
    }

    /// The console this worker prints to.
    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Receive one job, if the coordinator sent one, and request the console
    /// for it.
    fn intake(&mut self) -> Result<(), WorkerError> {
        let coordinator = Source::Rank(COORDINATOR_RANK);
        let Some(status) = self.world.iprobe(coordinator, Tag::Job)? else {
            return Ok(());
        };

        // Already queued as unexpected, so this returns at once.
        let text = self.world.recv(coordinator, Tag::Job)?.into_text()?;
        trace!(rank = self.rank(), len = status.len, "job received");

        self.jobs.push_back(text);
        let stamp = self.lock.request()?;
        debug!(rank = self.rank(), stamp, queued = self.jobs.len(), "job queued");
        Ok(())
    }

    fn poll_abort(&mut self) -> Result<bool, WorkerError> {
        let Some(handle) = self.abort.as_ref() else {
            return Ok(false);
        };
        let Some(envelope) = self.world.test_recv(handle)? else {
            return Ok(false);
        };

        self.abort = None;
        let signal: u64 = envelope.decode()?;
        self.abort_signal = Some(signal);
        warn!(rank = self.rank(), signal, queued = self.jobs.len(), "abort received");

        self.halt(WorkerState::Error);
        Ok(true)
    }

    fn poll_end_of_input(&mut self) -> Result<(), WorkerError> {
        if let Some(handle) = self.eof.as_ref() {
            if self.world.test_recv(handle)?.is_some() {
                self.eof = None;
                self.eof_seen = true;
                self.state = WorkerState::Draining;
                debug!(rank = self.rank(), queued = self.jobs.len(), "end of input");
            }
        }

        if self.eof_seen && self.jobs.is_empty() && self.notice.is_none() {
            let notice = self.world.isend(COORDINATOR_RANK, Tag::EndOfJobs, encode(&true)?)?;
            self.notice = Some(notice);
            self.ack = Some(self.world.irecv(Source::Rank(COORDINATOR_RANK), Tag::EndOfJobs));
            self.state = WorkerState::NotifiedDone;
            info!(rank = self.rank(), printed = self.printed, "all jobs printed");
        }

        Ok(())
    }

    fn poll_ack(&mut self) -> Result<bool, WorkerError> {
        let Some(handle) = self.ack.as_ref() else {
            return Ok(false);
        };
        let Some(envelope) = self.world.test_recv(handle)? else {
            return Ok(false);
        };

        self.ack = None;
        self.ack_seen = envelope.decode()?;
        if let Some(notice) = self.notice.as_ref() {
            self.notice_delivered = self.world.test_send(notice)?;
        }

        self.halt(WorkerState::Terminated);
        Ok(true)
    }

    fn print_head(&mut self) -> Result<(), WorkerError> {
        let text = self.jobs.front().ok_or(WorkerError::NoQueuedJob)?;
        self.sink.print(PrintLine {
            rank: self.world.rank(),
            clock: self.lock.clock(),
            text,
        })?;

        self.lock.exit()?;
        self.jobs.pop_front();
        self.printed += 1;
        Ok(())
    }

    /// Send a failed completion notice (`false`) and block until the
    /// coordinator answers with an abort, or with the acknowledgment of a
    /// notice sent earlier.
    ///
    /// The world inbox keeps draining meanwhile, so the coordinator never
    /// stalls on a send to this worker.
    fn report_failure(&mut self) -> Result<(), WorkerError> {
        let notice = self.world.isend(COORDINATOR_RANK, Tag::EndOfJobs, encode(&false)?)?;
        warn!(rank = self.rank(), queued = self.jobs.len(), "reporting local failure");

        while self.abort.is_some() || self.ack.is_some() {
            if let Some(handle) = self.abort.as_ref() {
                if let Some(envelope) = self.world.test_recv(handle)? {
                    self.abort = None;
                    self.abort_signal = Some(envelope.decode()?);
                    break;
                }
            }
            if let Some(handle) = self.ack.as_ref() {
                if let Some(envelope) = self.world.test_recv(handle)? {
                    self.ack = None;
                    self.ack_seen = envelope.decode()?;
                    break;
                }
            }
            self.world.test_send(&notice)?;
            thread::yield_now();
        }

        Ok(())
    }

    /// Cancel every receive still posted on the world endpoint and stop.
    ///
    /// Any round still held is left as is.
    fn halt(&mut self, state: WorkerState) {
        for handle in [self.eof.take(), self.abort.take(), self.ack.take()]
            .into_iter()
            .flatten()
        {
            self.world.cancel(handle);
        }
        self.state = state;

        debug!(
            rank = self.rank(),
            state = ?self.state,
            eof = self.eof_seen,
            abort = ?self.abort_signal,
            notice_delivered = self.notice_delivered,
            ack = self.ack_seen,
            queued = self.jobs.len(),
            printed = self.printed,
            "worker halted"
        );
    }
}
