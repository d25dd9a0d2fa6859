//! Local process executioner.
//!
//! Each task runs as `/bin/sh -c WRAPPER program stdout stderr exitCode` in
//! its own process group. The wrapper redirects the program's output and
//! writes its exit status to the exit-code file, so a controller that
//! restarts can still learn how a task ended by pid and file alone.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use pipex_core::{Task, TaskId, EXITCODE_ERROR, EXITCODE_KILLED, EXITCODE_OK};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::executioner::{Executioner, Launched, PollStatus};
use crate::{ExecError, Result};

/// Executioner name recorded in checkpoints.
pub const LOCAL: &str = "local";

const WRAPPER: &str = r#""$0" > "$1" 2> "$2"; echo $? > "$3""#;

/// Runs tasks as processes on this machine.
#[derive(Debug)]
pub struct LocalExecutioner {
    shell: PathBuf,
    interval: Duration,
    children: Mutex<HashMap<TaskId, Child>>,
}

impl LocalExecutioner {
    /// Executioner using `/bin/sh`, polled every 100ms.
    pub fn new() -> Self {
        Self {
            shell: PathBuf::from("/bin/sh"),
            interval: Duration::from_millis(100),
            children: Mutex::new(HashMap::new()),
        }
    }

    /// Set the polling period.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Set the shell running the wrapper.
    pub fn with_shell(mut self, shell: impl Into<PathBuf>) -> Self {
        self.shell = shell.into();
        self
    }

    fn children(&self) -> MutexGuard<'_, HashMap<TaskId, Child>> {
        self.children.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn artifacts(task: &Task) -> Result<(PathBuf, PathBuf, PathBuf)> {
        match (task.stdout_file(), task.stderr_file(), task.exit_code_file()) {
            (Some(out), Some(err), Some(code)) => Ok((out, err, code)),
            _ => Err(ExecError::StartFailure {
                task: task.id().clone(),
                reason: "task was not materialized".to_string(),
            }),
        }
    }
}

impl Default for LocalExecutioner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Executioner for LocalExecutioner {
    fn name(&self) -> &str {
        LOCAL
    }

    fn monitor_interval(&self) -> Duration {
        self.interval
    }

    async fn launch(&self, task: &Arc<Task>) -> Result<Launched> {
        let (stdout, stderr, exit_code) = Self::artifacts(task)?;
        let program = program_path(task.program_file())?;
        // A stale exit code from an earlier run would be read as this run's.
        remove_if_exists(&exit_code)?;

        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(WRAPPER)
            .arg(&program)
            .arg(&stdout)
            .arg(&stderr)
            .arg(&exit_code)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        #[cfg(unix)]
        cmd.process_group(0);

        let child = cmd.spawn()?;
        let pid = child.id().map(|p| p.to_string());
        info!(task = %task.id(), pid = ?pid, "launched {}", task.program_file().display());
        self.children().insert(task.id().clone(), child);

        Ok(Launched { pid, running: true })
    }

    async fn poll(&self, task: &Task) -> Result<PollStatus> {
        {
            let mut children = self.children();
            if let Some(child) = children.get_mut(task.id()) {
                let Some(status) = child.try_wait()? else {
                    return Ok(PollStatus::Running);
                };
                children.remove(task.id());
                drop(children);

                if status.code().is_none() {
                    debug!(task = %task.id(), "wrapper terminated by signal");
                    return Ok(PollStatus::Exited(EXITCODE_KILLED));
                }
                let code = read_exit_code(task.exit_code_file().as_deref())
                    .map(normalize_exit_code)
                    .unwrap_or(EXITCODE_ERROR);
                return Ok(PollStatus::Exited(code));
            }
        }

        // Task launched by an earlier controller: go by exit file and pid.
        let exit_file = task.exit_code_file();
        if let Some(code) = read_exit_code(exit_file.as_deref()) {
            return Ok(PollStatus::Exited(normalize_exit_code(code)));
        }
        let alive = parse_pid(task.pid().as_deref()).map(is_pid_alive).unwrap_or(false);
        if alive {
            return Ok(PollStatus::Running);
        }
        // The wrapper may have written the file right before exiting.
        match read_exit_code(exit_file.as_deref()) {
            Some(code) => Ok(PollStatus::Exited(normalize_exit_code(code))),
            None => Ok(PollStatus::Exited(EXITCODE_KILLED)),
        }
    }

    async fn cancel(&self, task: &Task) -> Result<()> {
        let child = self.children().remove(task.id());
        let pid = child
            .as_ref()
            .and_then(|c| c.id())
            .map(|p| p as i32)
            .or_else(|| parse_pid(task.pid().as_deref()));

        if let Some(pid) = pid {
            kill_group(pid);
        }
        if let Some(mut child) = child {
            if let Err(e) = child.kill().await {
                debug!(task = %task.id(), "child already gone: {}", e);
            }
        }
        Ok(())
    }

    async fn attach(&self, task: &Arc<Task>) -> Result<()> {
        let has_exit_file = read_exit_code(task.exit_code_file().as_deref()).is_some();
        if parse_pid(task.pid().as_deref()).is_none() && !has_exit_file {
            return Err(ExecError::Detached(task.id().clone()));
        }
        debug!(task = %task.id(), pid = ?task.pid(), "re-attached");
        Ok(())
    }
}

/// Map a program's native exit status onto the engine's exit codes.
pub fn normalize_exit_code(code: i32) -> i32 {
    if code == 0 {
        EXITCODE_OK
    } else {
        EXITCODE_ERROR
    }
}

/// `$0` in the wrapper is looked up on `PATH` unless it contains a slash.
fn program_path(path: &Path) -> std::io::Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    Ok(std::env::current_dir()?.join(path))
}

fn read_exit_code(path: Option<&Path>) -> Option<i32> {
    let text = std::fs::read_to_string(path?).ok()?;
    text.trim().parse().ok()
}

fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn parse_pid(pid: Option<&str>) -> Option<i32> {
    pid?.parse::<i32>().ok().filter(|p| *p > 0)
}

/// Check if a process with the given PID is alive.
fn is_pid_alive(pid: i32) -> bool {
    // kill(pid, 0) checks if the process exists without sending a signal
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

/// SIGKILL the whole process group led by `pid`.
fn kill_group(pid: i32) {
    let ret = unsafe { libc::kill(-(pid as libc::pid_t), libc::SIGKILL) };
    if ret != 0 {
        warn!(pid, "could not signal process group: {}", std::io::Error::last_os_error());
    }
}
