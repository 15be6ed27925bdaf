//! In-memory message-passing fabric.
//!
//! Every process owns one [`Endpoint`] per fabric it belongs to. The fabric
//! is reliable, ordered per (sender, receiver) pair and never duplicates.
//!
//! # Invariants
//!
//! 1. **Per-Link FIFO**: a send issued after another to the same destination is
//!    never delivered before it, even while the earlier one is still pending.
//! 2. **Posted-Order Matching**: an arriving envelope completes the earliest
//!    posted receive whose selector accepts it.
//! 3. **No Blocking in Non-Blocking Calls**: `isend`, `irecv`, `iprobe` and the
//!    `test_*` family return immediately.

pub mod error;
pub mod message;
pub mod network;

pub use error::FabricError;
pub use message::{encode, Envelope, Rank, Source, Status, Tag};
pub use network::{Endpoint, Fabric, FabricConfig, RecvHandle, SendHandle};
