//! Worker side: the per-worker control loop and the console it prints to.
//!
//! # Invariants
//!
//! 1. **Print Once**: every job taken in is printed exactly once, unless an
//!    abort arrives first.
//! 2. **Queue Follows Rounds**: a job leaves the queue only after the round
//!    requested for it has been released.
//! 3. **Always Serving**: until the worker halts, every step services peers'
//!    requests.

pub mod driver;
pub mod sink;


pub use driver::{WorkerDriver, WorkerError, WorkerState};
pub use sink::{ConsoleSink, PrintLine, StdoutSink};
