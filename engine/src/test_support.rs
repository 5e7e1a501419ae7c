//! Scripted worker processes and process-table helpers for tests.
//!
//! [`ShellWorker`] writes a small `/bin/sh` worker that speaks the reply
//! protocol. Its behaviour is picked by the item id:
//!
//! | id contains | reply                                       |
//! |-------------|---------------------------------------------|
//! | `stubborn`  | ignores SIGTERM and never replies           |
//! | `fail`      | `failed` reply                              |
//! | `crash`     | the worker SIGKILLs itself                  |
//! | `hang`      | no reply for 30 seconds                     |
//! | `garbled`   | a line that is not JSON                     |
//! | otherwise   | `scored` with `dice: {a: 1.0, b: 0.5}`      |
//!
//! Ids starting with `sync-` wait until two such ids have been logged, so
//! two workers can be made to fail at the same moment.

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::json;
use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, System};
use tempfile::TempDir;

use crate::config::EngineConfig;
use crate::item::WorkItem;
use crate::worker::WorkerCommand;

const WORKER_SCRIPT: &str = r#"log="$1"
pids="$2"
echo $$ >> "$pids"
if [ -n "$WORKER_BACKGROUND" ]; then
  sleep 30 >/dev/null 2>&1 </dev/null &
  echo $! >> "$pids"
fi
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/.*"id":"\([^"]*\)".*/\1/p')
  echo "$id" >> "$log"
  case "$id" in
    sync-*)
      n=0
      while [ "$(grep -c '^sync-' "$log")" -lt 2 ] && [ "$n" -lt 200 ]; do
        sleep 0.05
        n=$((n + 1))
      done
      ;;
  esac
  if [ -n "$WORKER_DELAY" ]; then
    sleep "$WORKER_DELAY"
  fi
  case "$id" in
    *stubborn*) trap '' TERM; while :; do sleep 0.05; done ;;
    *fail*) printf '{"status":"failed","message":"scoring failed for %s"}\n' "$id" ;;
    *crash*) kill -9 $$ ;;
    *hang*) sleep 30 ;;
    *garbled*) echo "not json" ;;
    *) printf '{"status":"scored","metrics":{"dice":{"a":1.0,"b":0.5}},"summary":0.75}\n' ;;
  esac
done
"#;

/// A scripted worker living in its own temporary directory.
#[derive(Debug)]
pub struct ShellWorker {
    dir: TempDir,
    delay: Option<String>,
    background: bool,
}

impl ShellWorker {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("worker.sh"), WORKER_SCRIPT).expect("write worker script");
        Self {
            dir,
            delay: None,
            background: false,
        }
    }

    /// Sleep this many seconds before answering each item.
    pub fn with_delay(mut self, secs: f64) -> Self {
        self.delay = Some(secs.to_string());
        self
    }

    /// Each worker leaves a background `sleep` behind in its process group.
    pub fn with_background_child(mut self) -> Self {
        self.background = true;
        self
    }

    fn log_path(&self) -> PathBuf {
        self.dir.path().join("executed.log")
    }

    fn pids_path(&self) -> PathBuf {
        self.dir.path().join("pids.log")
    }

    pub fn command(&self) -> WorkerCommand {
        let mut command = WorkerCommand::new("/bin/sh")
            .arg(self.dir.path().join("worker.sh").display().to_string())
            .arg(self.log_path().display().to_string())
            .arg(self.pids_path().display().to_string());
        if let Some(delay) = &self.delay {
            command = command.env("WORKER_DELAY", delay);
        }
        if self.background {
            command = command.env("WORKER_BACKGROUND", "1");
        }
        command
    }

    /// Item ids the workers started on, in start order.
    pub fn executed(&self) -> Vec<String> {
        read_lines(&self.log_path())
    }

    /// Every worker and background pid the script recorded.
    pub fn spawned_pids(&self) -> Vec<u32> {
        read_lines(&self.pids_path())
            .iter()
            .filter_map(|line| line.parse().ok())
            .collect()
    }
}

impl Default for ShellWorker {
    fn default() -> Self {
        Self::new()
    }
}

fn read_lines(path: &Path) -> Vec<String> {
    fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(str::to_string)
        .collect()
}

pub fn items(ids: &[&str]) -> Vec<WorkItem> {
    ids.iter()
        .map(|id| WorkItem::new(*id, json!({ "source": id })))
        .collect()
}

pub fn numbered_items(prefix: &str, count: usize) -> Vec<WorkItem> {
    (0..count)
        .map(|n| WorkItem::new(format!("{prefix}-{n}"), json!({ "index": n })))
        .collect()
}

/// Short timeouts so failing tests finish quickly.
pub fn fast_config(max_workers: i64) -> EngineConfig {
    EngineConfig {
        max_workers: Some(max_workers),
        cleanup_grace_secs: 2,
        item_timeout_secs: 30,
        supervise_interval_ms: 20,
    }
}

/// True while `pid` exists and is not a zombie.
pub fn process_alive(pid: u32) -> bool {
    let pid = Pid::from_u32(pid);
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::Some(&[pid]), true);
    sys.process(pid)
        .is_some_and(|process| process.status() != ProcessStatus::Zombie)
}

/// Wait up to `timeout` for every pid to disappear; returns the survivors.
pub fn wait_until_dead(pids: &[u32], timeout: Duration) -> Vec<u32> {
    let deadline = Instant::now() + timeout;
    loop {
        let alive: Vec<u32> = pids.iter().copied().filter(|pid| process_alive(*pid)).collect();
        if alive.is_empty() || Instant::now() >= deadline {
            return alive;
        }
        thread::sleep(Duration::from_millis(20));
    }
}
