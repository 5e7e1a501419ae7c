//! Cancellation and cleanup of worker processes.
//!
//! After [`CleanupController::terminate_all`] returns, no process started by
//! a registered worker is left running: every worker gets a graceful request
//! (stdin closed, SIGTERM once idle), a bounded grace period, then SIGKILL for
//! whatever is still around, and finally a bounded reap.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, System};
use tracing::{debug, info, instrument, warn};

use crate::worker::WorkerProcess;

/// Upper bound on waiting for a SIGKILLed process to be reaped.
const REAP_TIMEOUT: Duration = Duration::from_secs(2);
/// How long killed process groups get to disappear.
const SETTLE_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GroupSignal {
    Term,
    Kill,
    Check,
}

#[cfg(unix)]
impl GroupSignal {
    /// `None` is the null signal: delivery is checked, nothing is sent.
    fn as_signal(self) -> Option<nix::sys::signal::Signal> {
        use nix::sys::signal::Signal;
        match self {
            GroupSignal::Term => Some(Signal::SIGTERM),
            GroupSignal::Kill => Some(Signal::SIGKILL),
            GroupSignal::Check => None,
        }
    }
}

/// What happened when a process group was signalled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Delivered,
    /// No process is left in the group.
    Gone,
    /// The signal could not be delivered; the group may still be alive.
    Failed,
}

/// Counters describing one cleanup pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    /// Worker processes registered with the controller.
    pub workers: usize,
    /// Worker processes still running when cleanup started.
    pub live_at_start: usize,
    /// Descendant processes found under those workers.
    pub descendants: usize,
    /// Workers whose process group was gone before the grace period ran out.
    pub exited_gracefully: usize,
    /// Workers that needed SIGKILL.
    pub killed: usize,
}

/// Owns the set of worker processes for a run and tears them down.
#[derive(Debug)]
pub struct CleanupController {
    workers: Mutex<Vec<Arc<WorkerProcess>>>,
    /// Pids of workers a finished pass already tore down. Their groups are
    /// not signalled again: the ids may have been recycled since.
    swept: Mutex<HashSet<u32>>,
    serial: Mutex<()>,
    grace: Duration,
    poll: Duration,
}

impl CleanupController {
    pub fn new(grace: Duration, poll: Duration) -> Self {
        Self {
            workers: Mutex::new(Vec::new()),
            swept: Mutex::new(HashSet::new()),
            serial: Mutex::new(()),
            grace,
            poll,
        }
    }

    pub fn register(&self, worker: Arc<WorkerProcess>) {
        lock(&self.workers).push(worker);
    }

    pub fn workers(&self) -> Vec<Arc<WorkerProcess>> {
        lock(&self.workers).clone()
    }

    /// Terminate every registered worker and its descendants.
    ///
    /// Re-entrant: concurrent callers are serialized and a later pass skips
    /// the workers an earlier one already tore down. Processes that vanish
    /// while being signalled are ignored.
    #[instrument(skip_all, fields(grace_secs = self.grace.as_secs()))]
    pub fn terminate_all(&self) -> CleanupReport {
        let _serial = lock(&self.serial);

        let registered = self.workers();
        let workers: Vec<Arc<WorkerProcess>> = {
            let swept = lock(&self.swept);
            registered
                .iter()
                .filter(|w| !swept.contains(&w.pid()))
                .cloned()
                .collect()
        };
        let mut report = CleanupReport {
            workers: registered.len(),
            ..CleanupReport::default()
        };

        // 1. Enumerate: live roots, their current process trees, and whatever
        // is left in the group of a worker that already exited.
        let live_roots: Vec<u32> = workers
            .iter()
            .filter(|w| matches!(w.try_status(), Ok(None)))
            .map(|w| w.pid())
            .collect();
        report.live_at_start = live_roots.len();
        let groups: Vec<u32> = workers.iter().map(|w| w.pid()).collect();
        let tree = ProcessTree::snapshot(&live_roots, &groups);
        report.descendants = tree.descendants.len();
        debug!(
            live = report.live_at_start,
            descendants = report.descendants,
            "cleanup enumerated processes"
        );

        // 2. Graceful request. Busy workers keep their current item: closing
        // stdin lets them finish it and exit on their own.
        let mut termed = vec![false; workers.len()];
        for (idx, worker) in workers.iter().enumerate() {
            worker.expect_exit();
            worker.close_requests();
            if !worker.is_busy() {
                signal_group(worker.pid(), GroupSignal::Term);
                termed[idx] = true;
            }
        }

        // 3. Bounded wait for voluntary exit.
        let deadline = Instant::now() + self.grace;
        let mut gone = vec![false; workers.len()];
        loop {
            for (idx, worker) in workers.iter().enumerate() {
                if gone[idx] {
                    continue;
                }
                if matches!(worker.try_status(), Ok(None)) {
                    continue;
                }
                // The worker itself exited; anything left in its group is an
                // orphaned descendant.
                if !termed[idx] {
                    signal_group(worker.pid(), GroupSignal::Term);
                    termed[idx] = true;
                }
                gone[idx] = !group_alive(worker.pid());
            }
            if gone.iter().all(|g| *g) {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep(self.poll.min(deadline - now));
        }
        report.exited_gracefully = gone.iter().filter(|g| **g).count();

        // 4. Forceful kill for whatever outlived the grace period.
        for (idx, worker) in workers.iter().enumerate() {
            if gone[idx] {
                continue;
            }
            warn!(slot = worker.slot(), pid = worker.pid(), "worker outlived grace period, killing");
            signal_group(worker.pid(), GroupSignal::Kill);
            worker.kill();
            report.killed += 1;
        }
        tree.kill_survivors();

        // 5. Reap our direct children, then let killed groups drain.
        for worker in &workers {
            worker.reap(REAP_TIMEOUT);
        }
        if report.killed > 0 {
            let settle = Instant::now() + SETTLE_TIMEOUT;
            while Instant::now() < settle && workers.iter().any(|w| group_alive(w.pid())) {
                thread::sleep(self.poll);
            }
        }
        lock(&self.swept).extend(workers.iter().map(|w| w.pid()));

        info!(
            workers = report.workers,
            live_at_start = report.live_at_start,
            descendants = report.descendants,
            exited_gracefully = report.exited_gracefully,
            killed = report.killed,
            "cleanup finished"
        );
        report
    }
}

/// Descendants of the workers, captured at one instant.
#[derive(Debug, Default)]
struct ProcessTree {
    /// `(pid, start_time)` so a recycled pid is never signalled.
    descendants: Vec<(Pid, u64)>,
}

impl ProcessTree {
    /// Walks the parent links down from `live_roots`, then adds every other
    /// member of the process groups led by `groups`. Orphans of a worker that
    /// already exited are re-parented away from it but keep its group.
    fn snapshot(live_roots: &[u32], groups: &[u32]) -> Self {
        if groups.is_empty() {
            return Self::default();
        }
        let mut sys = System::new();
        sys.refresh_processes(ProcessesToUpdate::All, true);

        let mut children: HashMap<Pid, Vec<Pid>> = HashMap::new();
        for (pid, process) in sys.processes() {
            if let Some(parent) = process.parent() {
                children.entry(parent).or_default().push(*pid);
            }
        }

        let leaders: HashSet<u32> = groups.iter().copied().collect();
        let mut seen: HashSet<Pid> = HashSet::new();
        let mut descendants = Vec::new();
        let mut record = |pid: Pid| {
            if leaders.contains(&pid.as_u32()) || !seen.insert(pid) {
                return;
            }
            if let Some(process) = sys.process(pid) {
                descendants.push((pid, process.start_time()));
            }
        };

        let mut stack: Vec<Pid> = live_roots.iter().map(|pid| Pid::from_u32(*pid)).collect();
        while let Some(pid) = stack.pop() {
            for child in children.get(&pid).into_iter().flatten() {
                record(*child);
                stack.push(*child);
            }
        }
        for pid in sys.processes().keys() {
            if process_group(pid.as_u32()).is_some_and(|pgid| leaders.contains(&pgid)) {
                record(*pid);
            }
        }
        Self { descendants }
    }

    /// SIGKILL snapshot members that are still alive, including any that
    /// left their worker's process group.
    fn kill_survivors(&self) {
        if self.descendants.is_empty() {
            return;
        }
        let pids: Vec<Pid> = self.descendants.iter().map(|(pid, _)| *pid).collect();
        let mut sys = System::new();
        sys.refresh_processes(ProcessesToUpdate::Some(&pids), true);
        for (pid, started) in &self.descendants {
            let Some(process) = sys.process(*pid) else {
                continue;
            };
            if process.start_time() != *started || process.status() == ProcessStatus::Zombie {
                continue;
            }
            if process.kill() {
                debug!(pid = pid.as_u32(), "killed surviving descendant");
            }
        }
    }
}

/// Signal every process in the group led by `pgid`.
#[cfg(unix)]
fn signal_group(pgid: u32, signal: GroupSignal) -> Delivery {
    use nix::errno::Errno;
    use nix::sys::signal::killpg;
    use nix::unistd::Pid as GroupId;

    // Group 0 would be our own.
    let Some(raw) = i32::try_from(pgid).ok().filter(|raw| *raw > 0) else {
        warn!(pgid, "refusing to signal invalid process group");
        return Delivery::Failed;
    };
    match killpg(GroupId::from_raw(raw), signal.as_signal()) {
        Ok(()) => Delivery::Delivered,
        Err(Errno::ESRCH) => Delivery::Gone,
        Err(err) => {
            warn!(pgid, ?signal, %err, "failed to signal process group");
            Delivery::Failed
        }
    }
}

#[cfg(not(unix))]
fn signal_group(_pgid: u32, _signal: GroupSignal) -> Delivery {
    Delivery::Gone
}

/// Only a group known to be empty counts as gone; a failed check does not.
fn group_alive(pgid: u32) -> bool {
    signal_group(pgid, GroupSignal::Check) != Delivery::Gone
}

#[cfg(unix)]
fn process_group(pid: u32) -> Option<u32> {
    let raw = i32::try_from(pid).ok()?;
    let pgid = nix::unistd::getpgid(Some(nix::unistd::Pid::from_raw(raw))).ok()?;
    u32::try_from(pgid.as_raw()).ok()
}

#[cfg(not(unix))]
fn process_group(_pid: u32) -> Option<u32> {
    None
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
