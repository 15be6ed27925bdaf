//! Coordinator side: reads the job file, hands each job to its worker and
//! runs the end-of-work handshake.

use crate::fabric::Rank;

pub mod jobfile;
pub mod master;

/// World rank of the coordinator.
pub const COORDINATOR_RANK: Rank = 0;

/// Signal carried by the abort broadcast.
pub const ABORT_SIGNAL: u64 = 0;

/// Signal carried by the abort that follows a worker's local failure.
pub const FAILURE_SIGNAL: u64 = 1;

pub use jobfile::{JobFile, JobFileError, JobLine};
pub use master::{Coordinator, CoordinatorError, Outcome};
