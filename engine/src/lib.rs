//! Fail-fast parallel batch evaluation.
//!
//! Work items are scored by a pool of isolated worker processes. The first
//! failure (a scorer error, a timeout, or a worker that dies) cancels the rest
//! of the batch, and the run either yields every result or an aggregated
//! failure naming each item that went wrong.
//!
//! - **[`queue`]**, **[`monitor`]**, **[`aggregate`]**, **[`reduce`]**: pure,
//!   deterministic building blocks with no process I/O.
//! - **[`worker`]**, **[`supervise`]**, **[`cleanup`]**: OS process lifecycle
//!   (spawn, exit notification, termination and reaping).
//! - **[`pool`]**: the orchestrator wiring both halves together.
//! - **[`protocol`]**: the line-delimited JSON spoken between the pool and its
//!   workers, including the worker-side serve loop.

pub mod aggregate;
pub mod cleanup;
pub mod config;
pub mod item;
pub mod logging;
pub mod monitor;
pub mod pool;
pub mod protocol;
pub mod queue;
pub mod reduce;
pub mod supervise;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod worker;

pub use aggregate::{FailureCause, RunFailure, RunOutcome, TaskError};
pub use config::EngineConfig;
pub use item::{ItemResult, ItemScores, WorkItem};
pub use pool::Engine;
pub use protocol::Scorer;
pub use worker::WorkerCommand;
