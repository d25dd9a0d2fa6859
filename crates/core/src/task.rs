//! Task model - one unit of executable work.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, warn};

use crate::cleanup::CleanupRegistry;
use crate::error::{Error, Result};
use crate::id::TaskId;
use crate::resources::Resources;
use crate::state::{TaskState, EXITCODE_ERROR, EXITCODE_KILLED};

/// Prefix written in front of every program file. `-e` stops the script at
/// the first failing command.
pub const SHEBANG: &str = "#!/bin/sh -e\n\n";

/// Lines of stdout/stderr shown in verbose reports.
const REPORT_TAIL_LINES: usize = 10;

/// A task to be executed by an executioner.
///
/// Identity, program and output contract are fixed at construction. The run
/// state (lifecycle state, exit value, pid, artifact paths, cached output
/// check) sits behind a per-task mutex, so concurrent readers never see a
/// half-applied transition. Tasks are shared as `Arc<Task>`.
#[derive(Debug)]
pub struct Task {
    id: TaskId,
    source_file: String,
    source_line: u32,
    program_file: PathBuf,
    program_text: String,
    resources: Resources,
    output_files: Vec<PathBuf>,
    can_fail: bool,
    run: Mutex<RunState>,
}

#[derive(Debug, Clone, Default)]
struct RunState {
    state: TaskState,
    exit_value: i32,
    exit_value_set: bool,
    pid: Option<String>,
    stdout_file: Option<PathBuf>,
    stderr_file: Option<PathBuf>,
    exit_code_file: Option<PathBuf>,
    output_check: Option<String>,
}

/// A consistent copy of every task field, taken under the task lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSnapshot {
    /// Task id
    pub id: TaskId,
    /// Failure does not abort the run
    pub can_fail: bool,
    /// Lifecycle state
    pub state: TaskState,
    /// Exit value as reported by the backend
    pub exit_value: i32,
    /// Backend process or job id
    pub pid: Option<String>,
    /// Script that created the task
    pub source_file: String,
    /// Line in the script that created the task
    pub source_line: u32,
    /// Program file path
    pub program_file: PathBuf,
    /// Program text
    pub program_text: String,
    /// Standard output file
    pub stdout_file: Option<PathBuf>,
    /// Standard error file
    pub stderr_file: Option<PathBuf>,
    /// Exit code file
    pub exit_code_file: Option<PathBuf>,
    /// Resource request, including affinity hints
    pub resources: Resources,
    /// Declared output files
    pub output_files: Vec<PathBuf>,
}

impl Task {
    /// Create a task for `program_text`, to be written to `program_file`.
    pub fn new(
        id: impl Into<TaskId>,
        program_file: impl Into<PathBuf>,
        program_text: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            source_file: String::new(),
            source_line: 0,
            program_file: program_file.into(),
            program_text: program_text.into(),
            resources: Resources::default(),
            output_files: Vec::new(),
            can_fail: false,
            run: Mutex::new(RunState::default()),
        }
    }

    /// Record the script position that created this task.
    pub fn with_source(mut self, file: impl Into<String>, line: u32) -> Self {
        self.source_file = file.into();
        self.source_line = line;
        self
    }

    /// Set the resource request.
    pub fn with_resources(mut self, resources: Resources) -> Self {
        self.resources = resources;
        self
    }

    /// Declare the files this task must produce.
    pub fn with_output_files<I, P>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.output_files = files.into_iter().map(Into::into).collect();
        self
    }

    /// Allow this task to fail without aborting the run.
    pub fn with_can_fail(mut self, can_fail: bool) -> Self {
        self.can_fail = can_fail;
        self
    }

    /// Use explicit artifact paths instead of the derived ones.
    pub fn with_artifacts(self, stdout: PathBuf, stderr: PathBuf, exit_code: PathBuf) -> Self {
        {
            let mut run = self.run();
            run.stdout_file = Some(stdout);
            run.stderr_file = Some(stderr);
            run.exit_code_file = Some(exit_code);
        }
        self
    }

    /// Rebuild a task from a checkpoint snapshot.
    pub fn restore(snapshot: TaskSnapshot) -> Self {
        let run = RunState {
            state: snapshot.state,
            exit_value: snapshot.exit_value,
            exit_value_set: snapshot.state.is_terminal(),
            pid: snapshot.pid,
            stdout_file: snapshot.stdout_file,
            stderr_file: snapshot.stderr_file,
            exit_code_file: snapshot.exit_code_file,
            output_check: None,
        };
        Self {
            id: snapshot.id,
            source_file: snapshot.source_file,
            source_line: snapshot.source_line,
            program_file: snapshot.program_file,
            program_text: snapshot.program_text,
            resources: snapshot.resources,
            output_files: snapshot.output_files,
            can_fail: snapshot.can_fail,
            run: Mutex::new(run),
        }
    }

    fn run(&self) -> MutexGuard<'_, RunState> {
        self.run.lock().unwrap_or_else(|e| e.into_inner())
    }

    // === Accessors ===

    /// Task id.
    pub fn id(&self) -> &TaskId {
        &self.id
    }

    /// Script that created this task.
    pub fn source_file(&self) -> &str {
        &self.source_file
    }

    /// Line in the script that created this task.
    pub fn source_line(&self) -> u32 {
        self.source_line
    }

    /// Program file path.
    pub fn program_file(&self) -> &Path {
        &self.program_file
    }

    /// Program text, without the shebang.
    pub fn program_text(&self) -> &str {
        &self.program_text
    }

    /// Resource request.
    pub fn resources(&self) -> &Resources {
        &self.resources
    }

    /// Declared output files.
    pub fn output_files(&self) -> &[PathBuf] {
        &self.output_files
    }

    /// Failure does not abort the run.
    pub fn can_fail(&self) -> bool {
        self.can_fail
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TaskState {
        self.run().state
    }

    /// Backend process or job id, once known.
    pub fn pid(&self) -> Option<String> {
        self.run().pid.clone()
    }

    /// Record the backend process or job id.
    pub fn set_pid(&self, pid: impl Into<String>) {
        self.run().pid = Some(pid.into());
    }

    /// Standard output file, once derived.
    pub fn stdout_file(&self) -> Option<PathBuf> {
        self.run().stdout_file.clone()
    }

    /// Standard error file, once derived.
    pub fn stderr_file(&self) -> Option<PathBuf> {
        self.run().stderr_file.clone()
    }

    /// Exit code file, once derived.
    pub fn exit_code_file(&self) -> Option<PathBuf> {
        self.run().exit_code_file.clone()
    }

    /// Exit value, forced to 1 when the output contract is violated.
    pub fn exit_value(&self) -> i32 {
        let mut run = self.run();
        if !self.check_outputs(&mut run).is_empty() {
            return EXITCODE_ERROR;
        }
        run.exit_value
    }

    /// Exit value exactly as reported by the backend.
    pub fn raw_exit_value(&self) -> i32 {
        self.run().exit_value
    }

    /// Output contract failures, empty when every output is present.
    pub fn output_errors(&self) -> String {
        let mut run = self.run();
        self.check_outputs(&mut run).to_string()
    }

    // === Predicates ===

    /// Has the task left `None`?
    pub fn is_started(&self) -> bool {
        self.run().state != TaskState::None
    }

    /// Is the task running?
    pub fn is_running(&self) -> bool {
        self.run().state == TaskState::Running
    }

    /// Has the task reached a terminal state?
    pub fn is_done(&self) -> bool {
        self.run().state.is_terminal()
    }

    /// Is the task in an error or killed state?
    pub fn is_error(&self) -> bool {
        self.run().state.is_error()
    }

    /// Finished, exit value 0 and every declared output present and non-empty.
    pub fn is_successful(&self) -> bool {
        let mut run = self.run();
        run.state == TaskState::Finished
            && run.exit_value == 0
            && self.check_outputs(&mut run).is_empty()
    }

    /// Error state, non-zero exit value, or a violated output contract.
    pub fn is_failed(&self) -> bool {
        let mut run = self.run();
        run.state.is_error() || run.exit_value != 0 || !self.check_outputs(&mut run).is_empty()
    }

    /// Never started, so eligible for admission.
    pub fn can_run(&self) -> bool {
        self.run().state == TaskState::None
    }

    // === Transitions ===

    /// Explicit transition, validated against the state machine.
    pub fn record_state(&self, state: TaskState) -> Result<()> {
        let mut run = self.run();
        self.transition(&mut run, state)
    }

    /// Set the exit value and move to the matching terminal state.
    ///
    /// A task still in `Started` passes through `Running` first. Reporting
    /// the same code twice is tolerated; a different code is an error.
    pub fn set_exit_value(&self, code: i32) -> Result<()> {
        let mut run = self.run();
        if run.exit_value_set {
            if run.exit_value == code {
                return Ok(());
            }
            return Err(Error::ExitValueConflict {
                task: self.id.clone(),
                current: run.exit_value,
                requested: code,
            });
        }
        self.apply_exit(&mut run, code)
    }

    /// Like [`Task::set_exit_value`], but a task that already reached a
    /// terminal state is left untouched and `false` is returned.
    ///
    /// Used when a backend report may race with a kill.
    pub fn finish_if_active(&self, code: i32) -> Result<bool> {
        let mut run = self.run();
        if run.state.is_terminal() {
            return Ok(false);
        }
        self.apply_exit(&mut run, code)?;
        Ok(true)
    }

    /// Move to `Killed` from any non-terminal state. Returns `false` when
    /// the task was already terminal.
    pub fn mark_killed(&self) -> Result<bool> {
        let mut run = self.run();
        let state = run.state;
        match state {
            s if s.is_terminal() => Ok(false),
            TaskState::None => {
                self.transition(&mut run, TaskState::Killed)?;
                run.exit_value = EXITCODE_KILLED;
                run.exit_value_set = true;
                Ok(true)
            }
            _ => {
                self.apply_exit(&mut run, EXITCODE_KILLED)?;
                Ok(true)
            }
        }
    }

    fn apply_exit(&self, run: &mut RunState, code: i32) -> Result<()> {
        let target = TaskState::from_exit_code(code);
        if run.state == TaskState::Started {
            self.transition(run, TaskState::Running)?;
        }
        self.transition(run, target)?;
        run.exit_value = code;
        run.exit_value_set = true;
        Ok(())
    }

    fn transition(&self, run: &mut RunState, to: TaskState) -> Result<()> {
        if run.state == to {
            return Ok(());
        }
        if !run.state.can_transition_to(to) {
            return Err(Error::InvalidStateTransition {
                task: self.id.clone(),
                from: run.state,
                to,
            });
        }
        debug!(task = %self.id, from = %run.state, to = %to, "state change");
        run.state = to;
        Ok(())
    }

    // === Output contract ===

    /// Compute the output check once the task finished, then cache it.
    fn check_outputs<'a>(&self, run: &'a mut RunState) -> &'a str {
        if run.output_check.is_none() {
            if run.state != TaskState::Finished {
                return "";
            }
            let mut errors = String::new();
            for file in &self.output_files {
                match std::fs::metadata(file) {
                    Err(_) => errors.push_str(&format!(
                        "Error: Output file '{}' does not exist\n",
                        file.display()
                    )),
                    Ok(meta) if meta.len() == 0 => errors.push_str(&format!(
                        "Error: Output file '{}' has zero length\n",
                        file.display()
                    )),
                    Ok(_) => {}
                }
            }
            if !errors.is_empty() {
                warn!(task = %self.id, "output contract violated:\n{}", errors.trim_end());
            }
            run.output_check = Some(errors);
        }
        run.output_check.as_deref().unwrap_or("")
    }

    // === Filesystem ===

    /// Write the program file and derive the artifact paths.
    ///
    /// The file gets the [`SHEBANG`] prefix and is made executable. Unset
    /// stdout/stderr/exit-code paths are derived from the program file by
    /// replacing its extension.
    pub fn materialize(&self) -> Result<()> {
        if let Some(parent) = self.program_file.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        std::fs::write(&self.program_file, format!("{}{}", SHEBANG, self.program_text))?;
        set_executable(&self.program_file)?;

        let mut run = self.run();
        if run.stdout_file.is_none() {
            run.stdout_file = Some(self.program_file.with_extension("stdout"));
        }
        if run.stderr_file.is_none() {
            run.stderr_file = Some(self.program_file.with_extension("stderr"));
        }
        if run.exit_code_file.is_none() {
            run.exit_code_file = Some(self.program_file.with_extension("exitCode"));
        }
        Ok(())
    }

    /// Delete program and artifact files when the registry is cleaned up.
    pub fn mark_temporary(&self, registry: &CleanupRegistry) {
        registry.register(&self.program_file);
        let run = self.run();
        for path in [&run.stdout_file, &run.stderr_file, &run.exit_code_file]
            .into_iter()
            .flatten()
        {
            registry.register(path);
        }
    }

    /// Delete the declared output files when the registry is cleaned up.
    pub fn mark_outputs_temporary(&self, registry: &CleanupRegistry) {
        for file in &self.output_files {
            registry.register(file);
        }
    }

    // === Snapshots & reports ===

    /// Copy every field under the task lock.
    pub fn snapshot(&self) -> TaskSnapshot {
        let run = self.run();
        TaskSnapshot {
            id: self.id.clone(),
            can_fail: self.can_fail,
            state: run.state,
            exit_value: run.exit_value,
            pid: run.pid.clone(),
            source_file: self.source_file.clone(),
            source_line: self.source_line,
            program_file: self.program_file.clone(),
            program_text: self.program_text.clone(),
            stdout_file: run.stdout_file.clone(),
            stderr_file: run.stderr_file.clone(),
            exit_code_file: run.exit_code_file.clone(),
            resources: self.resources.clone(),
            output_files: self.output_files.clone(),
        }
    }

    /// Human readable description, used in failure messages.
    pub fn report(&self, verbose: bool) -> String {
        if !verbose {
            return format!("'{}', line {}", self.source_file, self.source_line);
        }

        let output_errors = self.output_errors();
        let run = self.run().clone();
        let mut out = String::new();
        out.push_str(&format!(
            "\tProgram & line     : '{}', line {}\n",
            self.source_file, self.source_line
        ));
        out.push_str(&format!("\tTask ID            : '{}'\n", self.id));
        out.push_str(&format!("\tTask state         : '{}'\n", run.state));
        out.push_str(&format!(
            "\tScript file        : '{}'\n",
            self.program_file.display()
        ));
        out.push_str(&format!("\tExit status        : '{}'\n", run.exit_value));
        if !output_errors.is_empty() {
            out.push_str("\tOutput file errors :\n");
            out.push_str(&indent(&output_errors));
        }
        if let Some(tail) = run.stderr_file.as_deref().and_then(tail_file) {
            out.push_str(&format!("\tStdErr ({} lines)  :\n", REPORT_TAIL_LINES));
            out.push_str(&indent(&tail));
        }
        if let Some(tail) = run.stdout_file.as_deref().and_then(tail_file) {
            out.push_str(&format!("\tStdOut ({} lines)  :\n", REPORT_TAIL_LINES));
            out.push_str(&indent(&tail));
        }
        out
    }
}

impl std::fmt::Display for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.report(false))
    }
}

fn tail_file(path: &Path) -> Option<String> {
    let text = std::fs::read_to_string(path).ok()?;
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(REPORT_TAIL_LINES);
    let tail = lines[start..].join("\n");
    (!tail.is_empty()).then_some(tail)
}

fn indent(text: &str) -> String {
    text.lines().map(|line| format!("\t\t{}\n", line)).collect()
}

#[cfg(unix)]
fn set_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn set_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
