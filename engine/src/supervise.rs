//! Exit supervision for worker processes.
//!
//! A background thread polls every worker for exit and publishes unexpected
//! exits on a channel of its own, separate from task completions. A worker
//! killed from outside or crashing inside native code never sends a reply;
//! this is how the pool still finds out.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{Receiver, Sender, unbounded};
use tracing::{debug, warn};

use crate::item::WorkItem;
use crate::worker::WorkerProcess;

/// An unexpected worker exit.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerExit {
    pub slot: usize,
    pub pid: u32,
    /// Rendered exit status (`"exit status: 3"`, `"signal: 9 (SIGKILL)"`).
    pub status: Option<String>,
    /// Item the worker was evaluating; its outcome is unknown.
    pub item: Option<WorkItem>,
}

#[derive(Debug)]
pub struct Supervisor {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Supervisor {
    /// Start polling `workers` every `interval`.
    pub fn start(
        workers: Vec<Arc<WorkerProcess>>,
        interval: Duration,
    ) -> std::io::Result<(Self, Receiver<WorkerExit>)> {
        let (tx, rx) = unbounded();
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let handle = thread::Builder::new()
            .name("supervisor".to_string())
            .spawn(move || {
                while !thread_stop.load(Ordering::SeqCst) {
                    sweep(&workers, &tx);
                    thread::sleep(interval);
                }
                // Last look so an exit between the final poll and stop() is not lost.
                sweep(&workers, &tx);
            })?;
        Ok((
            Self {
                stop,
                handle: Some(handle),
            },
            rx,
        ))
    }

    /// Stop polling after one final sweep.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            warn!("supervisor thread panicked");
        }
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Check each worker once; publish exits nobody expected. Returns how many.
pub fn sweep(workers: &[Arc<WorkerProcess>], tx: &Sender<WorkerExit>) -> usize {
    let mut reported = 0;
    for worker in workers {
        let status = match worker.try_status() {
            Ok(Some(status)) => status,
            Ok(None) => continue,
            Err(err) => {
                warn!(slot = worker.slot(), err = %format!("{err:#}"), "worker poll failed");
                continue;
            }
        };
        let Some(crash) = worker.claim_crash() else {
            continue;
        };
        debug!(slot = worker.slot(), pid = worker.pid(), %status, "unexpected worker exit");
        let exit = WorkerExit {
            slot: worker.slot(),
            pid: worker.pid(),
            status: Some(status.to_string()),
            item: crash.item,
        };
        if tx.send(exit).is_ok() {
            reported += 1;
        }
    }
    reported
}
