//! Console lock: workers sharing one console under Lamport-clock mutual
//! exclusion.
//!
//! A coordinator hands text jobs to a group of workers. Each worker prints
//! its jobs only while it holds the console lock, a Ricart–Agrawala protocol
//! run over the worker group's own fabric.

pub mod checker;
pub mod cluster;
pub mod config;
pub mod coordinator;
pub mod fabric;
pub mod lock;
pub mod worker;
