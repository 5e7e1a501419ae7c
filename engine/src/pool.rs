//! Batch orchestration: spawn workers, feed them items, stop on first failure.

use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::Result;
use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, never, unbounded};
use tracing::{debug, error, info, instrument, warn};

use crate::aggregate::{Collector, FailureCause, RunOutcome, TaskError};
use crate::cleanup::CleanupController;
use crate::config::EngineConfig;
use crate::item::{ItemResult, WorkItem};
use crate::monitor::{FailureMonitor, Transition};
use crate::protocol::Reply;
use crate::queue::TaskQueue;
use crate::supervise::{Supervisor, WorkerExit};
use crate::worker::{ReplyLine, WorkerCommand, WorkerProcess};

/// What driver threads tell the orchestrator.
#[derive(Debug)]
enum Event {
    Completed(ItemResult),
    Failed(TaskError),
    SlotDone { slot: usize },
}

/// Entry point: a validated configuration plus the worker launch recipe.
#[derive(Debug, Clone)]
pub struct Engine {
    config: EngineConfig,
    command: WorkerCommand,
    capacity: Option<usize>,
}

impl Engine {
    pub fn new(config: EngineConfig, command: WorkerCommand) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            command,
            capacity: None,
        })
    }

    /// Pretend the host has `capacity` execution units instead of asking the OS.
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    /// Workers a run over `items` items would start.
    pub fn worker_count(&self, items: usize) -> usize {
        let workers = match self.capacity {
            Some(capacity) => self.config.resolve_workers(capacity),
            None => self.config.effective_workers(),
        };
        workers.min(items)
    }

    /// Evaluate every item. Never returns an error of its own: anything that
    /// goes wrong ends up in `RunOutcome::Failed`.
    #[instrument(skip_all, fields(items = items.len()))]
    pub fn run(&self, items: Vec<WorkItem>) -> RunOutcome {
        let total = items.len();
        let workers = self.worker_count(total);
        let started = Instant::now();
        info!(total, workers, "batch run started");

        let run = Run {
            queue: Arc::new(TaskQueue::new(items)),
            monitor: FailureMonitor::new(),
            cleanup: CleanupController::new(
                self.config.cleanup_grace(),
                self.config.supervise_interval(),
            ),
        };
        let mut collector = Collector::new(total);

        let mut spawned = Vec::with_capacity(workers);
        for slot in 0..workers {
            if run.monitor.is_cancelling() {
                break;
            }
            match WorkerProcess::spawn(slot, &self.command) {
                Ok(worker) => {
                    run.cleanup.register(Arc::clone(&worker.process));
                    spawned.push(worker);
                }
                Err(err) => {
                    run.fail(
                        &mut collector,
                        TaskError::new(
                            slot,
                            None,
                            FailureCause::Spawn {
                                message: format!("{err:#}"),
                            },
                        ),
                    );
                }
            }
        }

        let (supervisor, mut exits) =
            match Supervisor::start(run.cleanup.workers(), self.config.supervise_interval()) {
                Ok((supervisor, exits)) => (Some(supervisor), exits),
                Err(e) => {
                    error!(err = %e, "failed to start supervisor");
                    run.fail(
                        &mut collector,
                        TaskError::new(
                            0,
                            None,
                            FailureCause::Spawn {
                                message: format!("supervisor thread: {e}"),
                            },
                        ),
                    );
                    (None, never())
                }
            };

        let (events_tx, events) = unbounded();
        let mut drivers: Vec<JoinHandle<()>> = Vec::with_capacity(spawned.len());
        for worker in spawned {
            let slot = worker.process.slot();
            let queue = Arc::clone(&run.queue);
            let process = Arc::clone(&worker.process);
            let tx = events_tx.clone();
            let timeout = self.config.item_timeout();
            let handle = thread::Builder::new()
                .name(format!("worker-{slot}"))
                .spawn(move || drive(process, worker.replies, queue, tx, timeout));
            match handle {
                Ok(handle) => drivers.push(handle),
                Err(e) => {
                    error!(slot, err = %e, "failed to start driver thread");
                    worker.process.expect_exit();
                    run.fail(
                        &mut collector,
                        TaskError::new(
                            slot,
                            None,
                            FailureCause::Spawn {
                                message: format!("driver thread: {e}"),
                            },
                        ),
                    );
                }
            }
        }
        drop(events_tx);

        let mut live = drivers.len();
        while live > 0 {
            crossbeam::select! {
                recv(events) -> event => match event {
                    Ok(Event::Completed(result)) => {
                        debug!(item_id = %result.item_id, "item completed");
                        collector.record_result(result);
                    }
                    Ok(Event::Failed(failure)) => run.fail(&mut collector, failure),
                    Ok(Event::SlotDone { slot }) => {
                        live -= 1;
                        debug!(slot, live, "slot finished");
                    }
                    Err(_) => break,
                },
                recv(exits) -> exit => match exit {
                    Ok(exit) => run.crash(&mut collector, exit),
                    Err(_) => exits = never(),
                },
            }
        }

        if let Some(supervisor) = supervisor {
            supervisor.stop();
        }
        for exit in exits.try_iter() {
            run.crash(&mut collector, exit);
        }

        // Unconditional: the success path must not leak processes either.
        run.cleanup.terminate_all();
        for handle in drivers {
            if handle.join().is_err() {
                warn!("driver thread panicked");
            }
        }

        info!(
            completed = collector.completed(),
            failed = collector.failed(),
            failures = run.monitor.failures(),
            claimed = run.queue.claimed(),
            drained = run.queue.is_drained(),
            elapsed_secs = started.elapsed().as_secs_f64(),
            "batch run finished"
        );
        collector.finish()
    }
}

/// Shared state of one run.
struct Run {
    queue: Arc<TaskQueue>,
    monitor: FailureMonitor,
    cleanup: CleanupController,
}

impl Run {
    /// Record a failure; the first one cancels the queue and tears workers down.
    fn fail(&self, collector: &mut Collector, failure: TaskError) {
        warn!(slot = failure.slot, item_id = ?failure.item_id(), cause = %failure.cause, "task failed");
        collector.record_error(failure);
        if self.monitor.record_failure() == Transition::Tripped {
            warn!("first failure observed, cancelling remaining work");
            self.queue.cancel();
            self.cleanup.terminate_all();
        }
    }

    fn crash(&self, collector: &mut Collector, exit: WorkerExit) {
        self.fail(collector, TaskError::from(exit));
    }
}

/// Tells the orchestrator a slot is finished when dropped, so a driver that
/// panics still lets `Engine::run` return.
struct SlotGuard {
    slot: usize,
    events: Sender<Event>,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        if thread::panicking() {
            error!(slot = self.slot, "driver thread panicked");
        }
        let _ = self.events.send(Event::SlotDone { slot: self.slot });
    }
}

/// Feed one worker until the queue runs dry, is cancelled, or the worker is lost.
///
/// A slot that sees a failure cancels the queue itself so no other slot
/// claims a fresh item before the orchestrator catches up.
fn drive(
    worker: Arc<WorkerProcess>,
    replies: Receiver<ReplyLine>,
    queue: Arc<TaskQueue>,
    events: Sender<Event>,
    timeout: Duration,
) {
    let slot = worker.slot();
    let _done = SlotGuard {
        slot,
        events: events.clone(),
    };
    let fail = |item: Option<WorkItem>, cause: FailureCause| {
        queue.cancel();
        if let Some(item) = item {
            let _ = events.send(Event::Failed(TaskError::new(slot, Some(item), cause)));
        }
    };

    while let Some(item) = queue.claim() {
        debug!(slot, item_id = %item.id, "item claimed");
        worker.assign(item.clone());
        if let Err(err) = worker.send(&item) {
            debug!(slot, err = %format!("{err:#}"), "request not delivered");
            report_lost(&worker, &queue, &events);
            break;
        }

        match replies.recv_timeout(timeout) {
            Ok(Ok(Reply::Scored(scores))) => {
                // None: the supervisor already reported this worker as crashed.
                if let Some(item) = worker.release() {
                    let _ = events.send(Event::Completed(ItemResult::new(&item, scores)));
                }
            }
            Ok(Ok(Reply::Failed { message })) => {
                fail(worker.release(), FailureCause::Scoring { message });
            }
            Ok(Err(message)) => {
                // The reply stream is out of sync; this worker cannot be trusted.
                worker.expect_exit();
                fail(worker.release(), FailureCause::Protocol { message });
                break;
            }
            Err(RecvTimeoutError::Timeout) => {
                worker.expect_exit();
                fail(worker.release(), FailureCause::Timeout { after: timeout });
                break;
            }
            Err(RecvTimeoutError::Disconnected) => {
                report_lost(&worker, &queue, &events);
                break;
            }
        }
    }

    worker.expect_exit();
    worker.close_requests();
}

/// The worker stopped talking. Report it unless the supervisor (or a
/// deliberate shutdown) got there first.
fn report_lost(worker: &WorkerProcess, queue: &TaskQueue, events: &Sender<Event>) {
    let Some(crash) = worker.claim_crash() else {
        return;
    };
    queue.cancel();
    let exit = worker
        .try_status()
        .ok()
        .flatten()
        .map(|status| status.to_string());
    let cause = FailureCause::WorkerCrash {
        pid: worker.pid(),
        exit,
    };
    let _ = events.send(Event::Failed(TaskError::new(
        worker.slot(),
        crash.item,
        cause,
    )));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_is_reported_done_even_when_the_driver_panics() {
        let (tx, rx) = unbounded();
        let handle = thread::spawn(move || {
            let _done = SlotGuard { slot: 3, events: tx };
            panic!("driver bug");
        });
        assert!(handle.join().is_err());
        match rx.recv_timeout(Duration::from_secs(1)) {
            Ok(Event::SlotDone { slot }) => assert_eq!(slot, 3),
            other => panic!("expected SlotDone, got {other:?}"),
        }
    }

    #[test]
    fn slot_is_reported_done_exactly_once() {
        let (tx, rx) = unbounded();
        drop(SlotGuard { slot: 0, events: tx });
        assert!(matches!(rx.try_recv(), Ok(Event::SlotDone { slot: 0 })));
        assert!(rx.try_recv().is_err());
    }
}
