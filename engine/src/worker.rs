//! Worker processes: spawning, request delivery and assignment tracking.

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use crossbeam::channel::{Receiver, unbounded};
use tracing::{debug, error, warn};
use wait_timeout::ChildExt;

use crate::item::WorkItem;
use crate::protocol::{Reply, decode_reply, encode_request};

/// How to launch one worker process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

impl WorkerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    fn build(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());
        // Own process group: cleanup signals the group, which also reaches
        // descendants orphaned after the worker itself exits.
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            cmd.process_group(0);
        }
        cmd
    }
}

/// Reply line as seen by the pool: decoded, or the decode error text.
pub type ReplyLine = std::result::Result<Reply, String>;

/// Who gets to report an unexpected exit.
#[derive(Debug, Default)]
struct Assignment {
    current: Option<WorkItem>,
    exit_expected: bool,
    crash_claimed: bool,
}

/// The item a crashed worker was holding, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct Crash {
    pub item: Option<WorkItem>,
}

/// One OS process bound to a pool slot for its whole life.
#[derive(Debug)]
pub struct WorkerProcess {
    slot: usize,
    pid: u32,
    child: Mutex<Child>,
    stdin: Mutex<Option<ChildStdin>>,
    assignment: Mutex<Assignment>,
}

/// A freshly started worker plus the channel its replies arrive on.
#[derive(Debug)]
pub struct SpawnedWorker {
    pub process: Arc<WorkerProcess>,
    pub replies: Receiver<ReplyLine>,
}

impl WorkerProcess {
    /// Start the process and a reader thread decoding its stdout.
    pub fn spawn(slot: usize, command: &WorkerCommand) -> Result<SpawnedWorker> {
        let mut child = match command.build().spawn() {
            Ok(child) => child,
            Err(e) => {
                error!(slot, program = %command.program.display(), err = %e, "failed to spawn worker");
                return Err(e)
                    .with_context(|| format!("spawn worker {}", command.program.display()));
            }
        };
        let pid = child.id();

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("stdout was not piped"))?;

        let (tx, replies) = unbounded();
        // Detached on purpose: it ends when the last holder of the pipe exits.
        thread::Builder::new()
            .name(format!("worker-{slot}-replies"))
            .spawn(move || {
                for line in BufReader::new(stdout).lines() {
                    let Ok(line) = line else { break };
                    if line.trim().is_empty() {
                        continue;
                    }
                    let reply = decode_reply(&line).map_err(|err| format!("{err:#}"));
                    if tx.send(reply).is_err() {
                        break;
                    }
                }
            })
            .context("spawn reply reader thread")?;

        debug!(slot, pid, "worker spawned");
        Ok(SpawnedWorker {
            process: Arc::new(Self {
                slot,
                pid,
                child: Mutex::new(child),
                stdin: Mutex::new(Some(stdin)),
                assignment: Mutex::new(Assignment::default()),
            }),
            replies,
        })
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Record the item this worker is about to evaluate.
    pub fn assign(&self, item: WorkItem) {
        lock(&self.assignment).current = Some(item);
    }

    /// Take back the in-flight item. `None` if a crash report already took it.
    pub fn release(&self) -> Option<WorkItem> {
        lock(&self.assignment).current.take()
    }

    pub fn is_busy(&self) -> bool {
        lock(&self.assignment).current.is_some()
    }

    /// From now on an exit of this process is not a crash.
    pub fn expect_exit(&self) {
        lock(&self.assignment).exit_expected = true;
    }

    /// Claim the right to report this worker as crashed.
    ///
    /// Returns `Some` exactly once, and never after `expect_exit`. The
    /// in-flight item travels with the claim so it is reported only once.
    pub fn claim_crash(&self) -> Option<Crash> {
        let mut assignment = lock(&self.assignment);
        if assignment.exit_expected || assignment.crash_claimed {
            return None;
        }
        assignment.crash_claimed = true;
        Some(Crash {
            item: assignment.current.take(),
        })
    }

    /// Write one request line to the worker's stdin.
    pub fn send(&self, item: &WorkItem) -> Result<()> {
        let line = encode_request(item)?;
        let mut stdin = lock(&self.stdin);
        let pipe = stdin
            .as_mut()
            .ok_or_else(|| anyhow!("worker {} request channel closed", self.slot))?;
        pipe.write_all(line.as_bytes())
            .with_context(|| format!("write request to worker {}", self.slot))?;
        pipe.flush()
            .with_context(|| format!("flush request to worker {}", self.slot))?;
        Ok(())
    }

    /// Close stdin, asking the worker to exit after its current item.
    /// Returns whether the channel was still open.
    pub fn close_requests(&self) -> bool {
        lock(&self.stdin).take().is_some()
    }

    /// Non-blocking exit check. Reaps the process if it has exited.
    pub fn try_status(&self) -> Result<Option<ExitStatus>> {
        lock(&self.child)
            .try_wait()
            .with_context(|| format!("poll worker {}", self.pid))
    }

    /// SIGKILL the worker process itself. A process that already exited is fine.
    pub fn kill(&self) {
        let mut child = lock(&self.child);
        if let Ok(Some(_)) = child.try_wait() {
            return;
        }
        if let Err(e) = child.kill() {
            debug!(pid = self.pid, err = %e, "kill raced with exit");
        }
    }

    /// Wait for the process to be reaped, bounded by `timeout`.
    pub fn reap(&self, timeout: Duration) -> Option<ExitStatus> {
        let mut child = lock(&self.child);
        match child.wait_timeout(timeout) {
            Ok(status) => status,
            Err(e) => {
                warn!(pid = self.pid, err = %e, "reap failed");
                None
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Duration;

    use serde_json::Value;

    use super::*;

    fn sh(script: &str) -> WorkerCommand {
        WorkerCommand::new("/bin/sh").arg("-c").arg(script)
    }

    #[test]
    fn round_trips_one_request() {
        let spawned = WorkerProcess::spawn(
            0,
            &sh(r#"read line; printf '{"status":"failed","message":"nope"}\n'"#),
        )
        .expect("spawn");
        let worker = spawned.process;
        worker
            .send(&WorkItem::new("a", Value::Null))
            .expect("send");
        let reply = spawned
            .replies
            .recv_timeout(Duration::from_secs(5))
            .expect("reply");
        assert_eq!(
            reply,
            Ok(Reply::Failed {
                message: "nope".to_string()
            })
        );
        assert!(worker.reap(Duration::from_secs(5)).is_some());
    }

    #[test]
    fn malformed_reply_surfaces_as_error_text() {
        let spawned = WorkerProcess::spawn(1, &sh("read line; echo garbage")).expect("spawn");
        spawned
            .process
            .send(&WorkItem::new("a", Value::Null))
            .expect("send");
        let reply = spawned
            .replies
            .recv_timeout(Duration::from_secs(5))
            .expect("reply");
        assert!(reply.is_err());
        spawned.process.reap(Duration::from_secs(5));
    }

    #[test]
    fn crash_claim_is_single_and_carries_item() {
        let spawned = WorkerProcess::spawn(0, &sh("exit 0")).expect("spawn");
        let worker = spawned.process;
        worker.assign(WorkItem::new("held", Value::Null));
        assert!(worker.is_busy());

        let crash = worker.claim_crash().expect("first claim");
        assert_eq!(crash.item.map(|i| i.id), Some("held".to_string()));
        assert!(worker.claim_crash().is_none());
        assert!(worker.release().is_none());
        worker.reap(Duration::from_secs(5));
    }

    #[test]
    fn expected_exit_is_never_a_crash() {
        let spawned = WorkerProcess::spawn(0, &sh("exit 0")).expect("spawn");
        let worker = spawned.process;
        worker.expect_exit();
        assert!(worker.claim_crash().is_none());
        worker.reap(Duration::from_secs(5));
    }

    #[test]
    fn send_after_close_fails() {
        let spawned = WorkerProcess::spawn(0, &sh("cat >/dev/null")).expect("spawn");
        let worker = spawned.process;
        assert!(worker.close_requests());
        assert!(!worker.close_requests());
        assert!(worker.send(&WorkItem::new("late", Value::Null)).is_err());
        assert!(worker.reap(Duration::from_secs(5)).is_some());
    }

    #[test]
    fn spawn_failure_is_an_error() {
        let err = WorkerProcess::spawn(0, &WorkerCommand::new("/nonexistent/worker-binary"))
            .expect_err("missing program");
        assert!(format!("{err:#}").contains("spawn worker"));
    }
}
