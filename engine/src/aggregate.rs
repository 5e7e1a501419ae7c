//! Terminal outcome of a run and the errors that make it fail.

use std::fmt;
use std::time::Duration;

use crate::item::{ItemResult, WorkItem};
use crate::supervise::WorkerExit;

/// Why an item (or a worker slot) failed.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureCause {
    /// The scorer returned an error.
    Scoring { message: String },
    /// The worker process died outside the reply protocol.
    WorkerCrash { pid: u32, exit: Option<String> },
    /// No reply arrived within the per-item deadline.
    Timeout { after: Duration },
    /// The worker answered with something that is not a reply.
    Protocol { message: String },
    /// The worker process could not be started.
    Spawn { message: String },
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureCause::Scoring { message } => write!(f, "{message}"),
            FailureCause::WorkerCrash { pid, exit } => write!(
                f,
                "worker process {pid} died unexpectedly ({}), outcome unknown",
                exit.as_deref().unwrap_or("exit status unknown")
            ),
            FailureCause::Timeout { after } => {
                write!(f, "no reply within {}s", after.as_secs_f64())
            }
            FailureCause::Protocol { message } => write!(f, "malformed worker reply: {message}"),
            FailureCause::Spawn { message } => write!(f, "worker failed to start: {message}"),
        }
    }
}

/// A failure bound to the item that caused it.
///
/// `item` is `None` only when a worker failed while idle (died between
/// items, or never started).
#[derive(Debug, Clone, PartialEq)]
pub struct TaskError {
    pub slot: usize,
    pub item: Option<WorkItem>,
    pub cause: FailureCause,
}

impl TaskError {
    pub fn new(slot: usize, item: Option<WorkItem>, cause: FailureCause) -> Self {
        Self { slot, item, cause }
    }

    pub fn item_id(&self) -> Option<&str> {
        self.item.as_ref().map(|item| item.id.as_str())
    }
}

impl From<WorkerExit> for TaskError {
    fn from(exit: WorkerExit) -> Self {
        Self {
            slot: exit.slot,
            item: exit.item,
            cause: FailureCause::WorkerCrash {
                pid: exit.pid,
                exit: exit.status,
            },
        }
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.item {
            Some(item) => write!(f, "item {}: {}", item.id, self.cause),
            None => write!(f, "worker slot {}: {}", self.slot, self.cause),
        }
    }
}

/// Every failure observed during a run, plus what was lost because of them.
#[derive(Debug, Clone, PartialEq)]
pub struct RunFailure {
    pub errors: Vec<TaskError>,
    /// Items that completed before cancellation; their results are dropped.
    pub completed: usize,
    pub total: usize,
}

impl RunFailure {
    /// Items that were neither completed nor reported as failed.
    pub fn unevaluated(&self) -> usize {
        let failed_items = self.errors.iter().filter(|e| e.item.is_some()).count();
        self.total.saturating_sub(self.completed + failed_items)
    }
}

impl fmt::Display for RunFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "batch evaluation failed with {} error(s) ({} of {} items completed, {} not evaluated)",
            self.errors.len(),
            self.completed,
            self.total,
            self.unevaluated()
        )?;
        for error in &self.errors {
            write!(f, "\n- {error}")?;
        }
        Ok(())
    }
}

impl std::error::Error for RunFailure {}

/// Exactly one of these ends every run.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Every item scored; results are in completion order.
    Completed(Vec<ItemResult>),
    Failed(RunFailure),
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Completed(_))
    }

    pub fn into_result(self) -> Result<Vec<ItemResult>, RunFailure> {
        match self {
            RunOutcome::Completed(results) => Ok(results),
            RunOutcome::Failed(failure) => Err(failure),
        }
    }
}

/// Append-only sink for one run's results and errors.
#[derive(Debug)]
pub struct Collector {
    total: usize,
    results: Vec<ItemResult>,
    errors: Vec<TaskError>,
}

impl Collector {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            results: Vec::with_capacity(total),
            errors: Vec::new(),
        }
    }

    pub fn record_result(&mut self, result: ItemResult) {
        self.results.push(result);
    }

    pub fn record_error(&mut self, error: TaskError) {
        self.errors.push(error);
    }

    pub fn completed(&self) -> usize {
        self.results.len()
    }

    pub fn failed(&self) -> usize {
        self.errors.len()
    }

    /// All results if nothing failed, otherwise every error and no results.
    pub fn finish(self) -> RunOutcome {
        if self.errors.is_empty() {
            RunOutcome::Completed(self.results)
        } else {
            RunOutcome::Failed(RunFailure {
                errors: self.errors,
                completed: self.results.len(),
                total: self.total,
            })
        }
    }
}
