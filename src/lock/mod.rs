//! Console lock: the distributed mutual-exclusion engine.
//!
//! # Invariants
//!
//! 1. **Monotonic Clock**: a worker's logical clock never decreases.
//! 2. **FIFO Rounds**: rounds are granted and released in the order they were
//!    requested; only the head round is ever polled for completion.
//! 3. **Deferred Exactly Once**: every deferred request is answered exactly
//!    once, and never while the round that deferred it is still active.
//! 4. **Single Holder**: under [`ReplyPolicy::RequestOrder`], no two workers
//!    hold a granted round at the same time.

pub mod clock;
pub mod console;
pub mod exchange;

#[cfg(test)]
mod tests;

pub use clock::LogicalClock;
pub use console::{ConsoleLock, LockError, ReplyPolicy};
pub use exchange::TrackedExchange;
