//! Scheduler and admission control.
//!
//! The scheduler owns the resource pool and every submitted task. One lock
//! guards "read free capacity, pick tasks, reserve", so two admission passes
//! can never both claim the same capacity. Backend calls (start, poll,
//! cancel) run outside that lock, fanned out on a `JoinSet`.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use pipex_core::{Task, TaskId, TaskSnapshot, TaskState, EXITCODE_KILLED, EXITCODE_TIMEOUT};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::executioner::{Executioner, PollStatus};
use crate::pool::ResourcePool;
use crate::{ExecError, Result};

/// Scheduler tuning, loadable from the CLI config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Upper bound for a single backend poll, in milliseconds
    pub poll_timeout_ms: u64,
    /// Fixed tick period; defaults to the fastest executioner's interval
    pub tick_interval_ms: Option<u64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_timeout_ms: 5_000,
            tick_interval_ms: None,
        }
    }
}

impl SchedulerConfig {
    /// Poll timeout as a duration.
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

/// What one tick did.
#[derive(Debug, Default)]
pub struct TickReport {
    /// Tasks admitted and handed to their executioner
    pub admitted: Vec<TaskId>,
    /// Tasks that reached a terminal state, with that state
    pub completed: Vec<(TaskId, TaskState)>,
    /// Task-level failures observed this tick
    pub failures: Vec<ExecError>,
    /// Set when this tick made the run fatally failed
    pub fatal: Option<TaskId>,
}

impl TickReport {
    /// Did anything change?
    pub fn is_empty(&self) -> bool {
        self.admitted.is_empty() && self.completed.is_empty() && self.failures.is_empty()
    }
}

/// Task counts by phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskCounts {
    /// Not started yet
    pub pending: usize,
    /// Started or running
    pub running: usize,
    /// Terminal
    pub done: usize,
    /// Terminal and failed
    pub failed: usize,
}

struct Entry {
    task: Arc<Task>,
    executioner: String,
    started_at: Option<Instant>,
    reserved: bool,
    /// Backend start or kill calls still running. Capacity stays held
    /// until they return.
    in_flight: u32,
}

struct Inner {
    pool: ResourcePool,
    tasks: HashMap<TaskId, Entry>,
    order: Vec<TaskId>,
    pending: VecDeque<TaskId>,
    running: Vec<TaskId>,
    killed: HashSet<TaskId>,
    fatal: Option<TaskId>,
    cancelled: bool,
}

impl Inner {
    fn accepts_work(&self) -> bool {
        !self.cancelled && self.fatal.is_none()
    }
}

/// Admission controller and dispatcher for one run.
pub struct Scheduler {
    inner: Mutex<Inner>,
    executioners: HashMap<String, Arc<dyn Executioner>>,
    default_executioner: Option<String>,
    config: SchedulerConfig,
    changed: Notify,
}

impl Scheduler {
    /// Scheduler over `pool`, with no executioner yet.
    pub fn new(pool: ResourcePool, config: SchedulerConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                pool,
                tasks: HashMap::new(),
                order: Vec::new(),
                pending: VecDeque::new(),
                running: Vec::new(),
                killed: HashSet::new(),
                fatal: None,
                cancelled: false,
            }),
            executioners: HashMap::new(),
            default_executioner: None,
            config,
            changed: Notify::new(),
        }
    }

    /// Register a backend. The first one registered becomes the default.
    pub fn register_executioner(&mut self, executioner: Arc<dyn Executioner>) {
        let name = executioner.name().to_string();
        if self.default_executioner.is_none() {
            self.default_executioner = Some(name.clone());
        }
        self.executioners.insert(name, executioner);
    }

    /// Builder form of [`Scheduler::register_executioner`].
    pub fn with_executioner(mut self, executioner: Arc<dyn Executioner>) -> Self {
        self.register_executioner(executioner);
        self
    }

    /// Route tasks submitted without an explicit backend to `name`.
    pub fn set_default_executioner(&mut self, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        if !self.executioners.contains_key(&name) {
            return Err(ExecError::UnknownExecutioner(name));
        }
        self.default_executioner = Some(name);
        Ok(())
    }

    /// Registered backend named `name`.
    pub fn executioner(&self, name: &str) -> Option<Arc<dyn Executioner>> {
        self.executioners.get(name).cloned()
    }

    /// Scheduler configuration.
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Period between ticks.
    pub fn tick_interval(&self) -> Duration {
        if let Some(ms) = self.config.tick_interval_ms {
            return Duration::from_millis(ms);
        }
        self.executioners
            .values()
            .map(|e| e.monitor_interval())
            .min()
            .unwrap_or(Duration::from_secs(1))
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn resolve(&self, name: Option<&str>) -> Result<String> {
        let name = match name.or(self.default_executioner.as_deref()) {
            Some(name) => name,
            None => return Err(ExecError::UnknownExecutioner(String::new())),
        };
        if !self.executioners.contains_key(name) {
            return Err(ExecError::UnknownExecutioner(name.to_string()));
        }
        Ok(name.to_string())
    }

    fn lookup(&self, name: &str) -> Result<Arc<dyn Executioner>> {
        self.executioner(name)
            .ok_or_else(|| ExecError::UnknownExecutioner(name.to_string()))
    }

    /// A backend call on `id` returned.
    fn settle(&self, id: &TaskId) {
        if let Some(entry) = self.inner().tasks.get_mut(id) {
            entry.in_flight = entry.in_flight.saturating_sub(1);
        }
    }

    // === Submission ===

    /// Queue `task` on the default executioner.
    pub fn submit(&self, task: Arc<Task>) -> Result<()> {
        self.submit_to(task, None)
    }

    /// Queue `task` on the named executioner (or the default).
    ///
    /// A request larger than the whole pool can never run: the task is
    /// marked `StartFailed` and `ResourceUnsatisfiable` is returned.
    pub fn submit_to(&self, task: Arc<Task>, executioner: Option<&str>) -> Result<()> {
        let executioner = self.resolve(executioner)?;
        if !task.can_run() {
            return Err(pipex_core::Error::InvalidStateTransition {
                task: task.id().clone(),
                from: task.state(),
                to: TaskState::Started,
            }
            .into());
        }

        let id = task.id().clone();
        let result = {
            let mut guard = self.inner();
            let inner = &mut *guard;
            if !inner.accepts_work() {
                return Err(ExecError::RunCancelled);
            }
            if inner.tasks.contains_key(&id) {
                return Err(ExecError::DuplicateTask(id));
            }

            let unsatisfiable = !inner.pool.can_ever_fit(task.resources());
            let result = if unsatisfiable {
                task.record_state(TaskState::StartFailed)?;
                if !task.can_fail() && inner.fatal.is_none() {
                    inner.fatal = Some(id.clone());
                }
                Err(ExecError::ResourceUnsatisfiable {
                    task: id.clone(),
                    requested: task.resources().clone(),
                    capacity: inner.pool.total().clone(),
                })
            } else {
                inner.pending.push_back(id.clone());
                Ok(())
            };

            inner.order.push(id.clone());
            inner.tasks.insert(
                id.clone(),
                Entry {
                    task,
                    executioner,
                    started_at: None,
                    reserved: false,
                    in_flight: 0,
                },
            );
            result
        };

        match &result {
            Ok(()) => debug!(task = %id, "submitted"),
            Err(e) => warn!(task = %id, "rejected: {}", e),
        }
        self.changed.notify_waiters();
        result
    }

    /// Re-register a task read from a checkpoint.
    ///
    /// Unstarted tasks are queued again, started ones are re-attached
    /// through `executioner` and keep their resources, terminal ones are
    /// kept for reporting only. A started task whose process handle is
    /// lost is marked killed and counts as a failure. An unstarted task
    /// too large for this pool is marked `StartFailed` and
    /// `ResourceUnsatisfiable` is returned, as in [`Scheduler::submit_to`].
    pub async fn restore(&self, task: Arc<Task>, executioner: Option<&str>) -> Result<()> {
        let name = self.resolve(executioner)?;
        let id = task.id().clone();
        if self.inner().tasks.contains_key(&id) {
            return Err(ExecError::DuplicateTask(id));
        }

        let mut lost = false;
        if matches!(task.state(), TaskState::Started | TaskState::Running) {
            match self.lookup(&name)?.attach(&task).await {
                Ok(()) => {}
                Err(ExecError::Detached(_)) => {
                    warn!(task = %id, "process handle lost, marking task killed");
                    task.mark_killed()?;
                    lost = true;
                }
                Err(e) => return Err(e),
            }
        }

        let state = task.state();
        let result = {
            let mut guard = self.inner();
            let inner = &mut *guard;
            if inner.tasks.contains_key(&id) {
                return Err(ExecError::DuplicateTask(id));
            }
            let mut entry = Entry {
                task: task.clone(),
                executioner: name,
                started_at: None,
                reserved: false,
                in_flight: 0,
            };

            let result = match state {
                TaskState::None if !inner.pool.can_ever_fit(task.resources()) => {
                    task.record_state(TaskState::StartFailed)?;
                    if !task.can_fail() && inner.fatal.is_none() {
                        inner.fatal = Some(id.clone());
                    }
                    Err(ExecError::ResourceUnsatisfiable {
                        task: id.clone(),
                        requested: task.resources().clone(),
                        capacity: inner.pool.total().clone(),
                    })
                }
                TaskState::None => {
                    inner.pending.push_back(id.clone());
                    Ok(())
                }
                TaskState::Started | TaskState::Running => {
                    if !task.resources().fits_within(&inner.pool.free()) {
                        warn!(
                            task = %id,
                            requested = %task.resources(),
                            free = %inner.pool.free(),
                            "re-attached task exceeds free capacity"
                        );
                    }
                    inner.pool.force_reserve(task.resources());
                    entry.reserved = true;
                    entry.started_at = Some(Instant::now());
                    inner.running.push(id.clone());
                    Ok(())
                }
                _ => {
                    if lost && !task.can_fail() && inner.fatal.is_none() {
                        error!(task = %id, "task may not fail, aborting run");
                        inner.fatal = Some(id.clone());
                    }
                    Ok(())
                }
            };
            inner.order.push(id.clone());
            inner.tasks.insert(id.clone(), entry);
            result
        };

        match &result {
            Ok(()) => debug!(task = %id, state = %state, "restored"),
            Err(e) => warn!(task = %id, "rejected on restore: {}", e),
        }
        self.changed.notify_waiters();
        result
    }

    // === Control loop ===

    /// One scheduling pass: admit, dispatch, poll, enforce timeouts, reap.
    ///
    /// Task-level failures land in the report. Only engine-invariant
    /// violations are returned as errors.
    pub async fn tick(&self) -> Result<TickReport> {
        let mut report = TickReport::default();

        let admitted = self.admit();
        self.dispatch(admitted, &mut report).await?;
        self.poll_running().await?;
        self.enforce_timeouts().await?;
        self.reap(&mut report);

        if !report.is_empty() {
            self.changed.notify_waiters();
        }
        Ok(report)
    }

    /// Reserve capacity for pending tasks in arrival order.
    ///
    /// Stops at the first task that does not fit, so a large task at the
    /// head of the queue is never overtaken by smaller ones behind it.
    fn admit(&self) -> Vec<(Arc<Task>, Arc<dyn Executioner>)> {
        let mut guard = self.inner();
        let inner = &mut *guard;
        let mut admitted = Vec::new();
        if !inner.accepts_work() {
            return admitted;
        }

        while let Some(id) = inner.pending.front().cloned() {
            let Some(entry) = inner.tasks.get(&id) else {
                inner.pending.pop_front();
                continue;
            };
            let task = entry.task.clone();
            if !task.can_run() {
                inner.pending.pop_front();
                continue;
            }
            let Some(executioner) = self.executioners.get(&entry.executioner).cloned() else {
                // Checked at submit time; registry is fixed afterwards.
                inner.pending.pop_front();
                continue;
            };
            if !inner.pool.try_reserve(task.resources()) {
                debug!(task = %id, free = %inner.pool.free(), "waiting for capacity");
                break;
            }

            inner.pending.pop_front();
            if let Some(entry) = inner.tasks.get_mut(&id) {
                entry.reserved = true;
                entry.in_flight += 1;
            }
            inner.running.push(id);
            admitted.push((task, executioner));
        }
        admitted
    }

    async fn dispatch(
        &self,
        admitted: Vec<(Arc<Task>, Arc<dyn Executioner>)>,
        report: &mut TickReport,
    ) -> Result<()> {
        if admitted.is_empty() {
            return Ok(());
        }

        let mut set = JoinSet::new();
        for (task, executioner) in admitted {
            set.spawn(async move {
                let result = executioner.start(&task).await;
                (task, result)
            });
        }

        while let Some(joined) = set.join_next().await {
            let (task, result) = joined?;
            if result.is_ok() {
                let mut inner = self.inner();
                if let Some(entry) = inner.tasks.get_mut(task.id()) {
                    entry.started_at = Some(Instant::now());
                }
            }
            self.settle(task.id());
            match result {
                Ok(()) => {
                    info!(task = %task.id(), resources = %task.resources(), "dispatched");
                    report.admitted.push(task.id().clone());
                }
                Err(e) if e.is_invariant_violation() => return Err(e),
                Err(e) => report.failures.push(e),
            }
        }
        Ok(())
    }

    fn active(&self) -> Vec<(Arc<Task>, Arc<dyn Executioner>, Option<Instant>)> {
        let inner = self.inner();
        inner
            .running
            .iter()
            .filter_map(|id| inner.tasks.get(id))
            .filter(|entry| entry.task.is_started() && !entry.task.is_done())
            .filter_map(|entry| {
                let exe = self.executioners.get(&entry.executioner)?.clone();
                Some((entry.task.clone(), exe, entry.started_at))
            })
            .collect()
    }

    async fn poll_running(&self) -> Result<()> {
        let active = self.active();
        if active.is_empty() {
            return Ok(());
        }

        let poll_timeout = self.config.poll_timeout();
        let mut set = JoinSet::new();
        for (task, executioner, _) in active {
            set.spawn(async move {
                let status = tokio::time::timeout(poll_timeout, executioner.poll(&task)).await;
                (task, status)
            });
        }

        while let Some(joined) = set.join_next().await {
            let (task, status) = joined?;
            match status {
                Err(_) => warn!(task = %task.id(), "poll timed out after {:?}", poll_timeout),
                Ok(Err(e)) if e.is_invariant_violation() => return Err(e),
                Ok(Err(e)) => warn!(task = %task.id(), "poll failed: {}", e),
                Ok(Ok(PollStatus::Queued)) => {}
                Ok(Ok(PollStatus::Running)) => {
                    if task.state() == TaskState::Started {
                        if let Err(e) = task.record_state(TaskState::Running) {
                            // A concurrent kill may have won the race.
                            if !task.is_done() {
                                return Err(e.into());
                            }
                        }
                    }
                }
                Ok(Ok(PollStatus::Exited(code))) => {
                    if task.finish_if_active(code)? {
                        debug!(task = %task.id(), code, "exited");
                    }
                }
            }
        }
        Ok(())
    }

    async fn enforce_timeouts(&self) -> Result<()> {
        let now = Instant::now();
        let expired: Vec<_> = self
            .active()
            .into_iter()
            .filter(|(task, _, started_at)| match (task.resources().timeout, started_at) {
                (Some(limit), Some(started)) => now.duration_since(*started) >= limit,
                _ => false,
            })
            .collect();

        for (task, executioner, _) in expired {
            warn!(task = %task.id(), "wall-clock budget exceeded, killing");
            if let Err(e) = executioner.cancel(&task).await {
                warn!(task = %task.id(), "cancel failed: {}", e);
            }
            task.finish_if_active(EXITCODE_TIMEOUT)?;
        }
        Ok(())
    }

    /// Release resources of finished tasks and classify their outcome.
    fn reap(&self, report: &mut TickReport) {
        let mut guard = self.inner();
        let inner = &mut *guard;
        let running = std::mem::take(&mut inner.running);
        let mut still_running = Vec::with_capacity(running.len());

        for id in running {
            let Some(entry) = inner.tasks.get(&id) else {
                continue;
            };
            let task = entry.task.clone();
            if !task.is_done() || entry.in_flight > 0 {
                still_running.push(id);
                continue;
            }
            if entry.reserved {
                inner.pool.release(task.resources());
                if let Some(entry) = inner.tasks.get_mut(&id) {
                    entry.reserved = false;
                }
            }

            let state = task.state();
            let requested_kill = inner.killed.contains(&id);
            if let Some(failure) = classify(&task, requested_kill) {
                report.failures.push(failure);
            }
            if task.is_failed() && !task.can_fail() && !requested_kill && inner.fatal.is_none() {
                error!(task = %id, state = %state, "task may not fail, aborting run");
                inner.fatal = Some(id.clone());
                report.fatal = Some(id.clone());
            }
            info!(task = %id, state = %state, exit = task.exit_value(), "completed");
            report.completed.push((id, state));
        }
        inner.running = still_running;
    }

    // === Cancellation ===

    /// Kill one task. Returns `false` if it had already finished.
    pub async fn kill(&self, id: &TaskId) -> Result<bool> {
        let (task, executioner, held) = {
            let mut guard = self.inner();
            let inner = &mut *guard;
            let Some(entry) = inner.tasks.get_mut(id) else {
                return Err(ExecError::UnknownTask(id.clone()));
            };
            let task = entry.task.clone();
            let executioner = self.lookup(&entry.executioner)?;
            let held = !task.is_done();
            if held {
                entry.in_flight += 1;
                inner.killed.insert(id.clone());
                inner.pending.retain(|p| p != id);
            }
            (task, executioner, held)
        };

        let killed = executioner.kill(&task).await;
        if held {
            self.settle(id);
        }
        let killed = killed?;
        if killed {
            info!(task = %id, "killed on request");
        }
        self.changed.notify_waiters();
        Ok(killed)
    }

    /// Stop the run: refuse further submissions and kill everything not
    /// yet finished. Returns the number of tasks killed.
    pub async fn cancel(&self) -> Result<usize> {
        self.inner().cancelled = true;
        info!("run cancelled");
        self.drain().await
    }

    /// Kill everything left after a fatal failure.
    pub async fn abort(&self) -> Result<usize> {
        if let Some(task) = self.fatal_task() {
            info!(task = %task, "aborting run");
        }
        self.drain().await
    }

    async fn drain(&self) -> Result<usize> {
        let victims: Vec<_> = {
            let mut guard = self.inner();
            let inner = &mut *guard;
            inner.pending.clear();
            let ids: Vec<TaskId> = inner
                .order
                .iter()
                .filter(|id| inner.tasks.get(*id).is_some_and(|e| !e.task.is_done()))
                .cloned()
                .collect();
            let mut victims = Vec::with_capacity(ids.len());
            for id in ids {
                inner.killed.insert(id.clone());
                if let Some(entry) = inner.tasks.get_mut(&id) {
                    if let Some(exe) = self.executioners.get(&entry.executioner) {
                        entry.in_flight += 1;
                        victims.push((entry.task.clone(), exe.clone()));
                    }
                }
            }
            victims
        };

        let mut killed = 0;
        let mut violation = None;
        for (task, executioner) in victims {
            let result = executioner.kill(&task).await;
            self.settle(task.id());
            match result {
                Ok(true) => killed += 1,
                Ok(false) => {}
                Err(e) if e.is_invariant_violation() => {
                    violation.get_or_insert(e);
                }
                Err(e) => warn!(task = %task.id(), "kill failed: {}", e),
            }
        }
        if let Some(e) = violation {
            return Err(e);
        }

        // Killed tasks hold no capacity any more.
        self.reap(&mut TickReport::default());
        self.changed.notify_waiters();
        Ok(killed)
    }

    // === Queries ===

    /// Task counts by phase.
    pub fn counts(&self) -> TaskCounts {
        let inner = self.inner();
        let mut counts = TaskCounts::default();
        for entry in inner.tasks.values() {
            match entry.task.state() {
                TaskState::None => counts.pending += 1,
                TaskState::Started | TaskState::Running => counts.running += 1,
                _ => {
                    counts.done += 1;
                    if entry.task.is_failed() {
                        counts.failed += 1;
                    }
                }
            }
        }
        counts
    }

    /// Has a task that may not fail failed?
    pub fn is_failed(&self) -> bool {
        self.inner().fatal.is_some()
    }

    /// The task that made the run fail.
    pub fn fatal_task(&self) -> Option<TaskId> {
        self.inner().fatal.clone()
    }

    /// Was the run cancelled?
    pub fn is_cancelled(&self) -> bool {
        self.inner().cancelled
    }

    /// Nothing running and nothing left that could still be admitted.
    pub fn is_idle(&self) -> bool {
        let inner = self.inner();
        inner.running.is_empty() && (inner.pending.is_empty() || !inner.accepts_work())
    }

    /// Capacity not reserved yet.
    pub fn free(&self) -> pipex_core::Resources {
        self.inner().pool.free()
    }

    /// Task by id.
    pub fn task(&self, id: &TaskId) -> Option<Arc<Task>> {
        self.inner().tasks.get(id).map(|e| e.task.clone())
    }

    /// All tasks in arrival order.
    pub fn tasks(&self) -> Vec<Arc<Task>> {
        let inner = self.inner();
        inner
            .order
            .iter()
            .filter_map(|id| inner.tasks.get(id))
            .map(|e| e.task.clone())
            .collect()
    }

    /// Wait until `id` reaches a terminal state and return that state.
    pub async fn wait_for(&self, id: &TaskId) -> Result<TaskState> {
        loop {
            let notified = self.changed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let task = self
                .task(id)
                .ok_or_else(|| ExecError::UnknownTask(id.clone()))?;
            if task.is_done() {
                return Ok(task.state());
            }
            notified.await;
        }
    }

    /// Per-task snapshots in arrival order, each with its executioner name.
    pub fn snapshot(&self) -> Vec<(TaskSnapshot, String)> {
        let inner = self.inner();
        inner
            .order
            .iter()
            .filter_map(|id| inner.tasks.get(id))
            .map(|e| (e.task.snapshot(), e.executioner.clone()))
            .collect()
    }
}

fn classify(task: &Task, requested_kill: bool) -> Option<ExecError> {
    let id = task.id().clone();
    match task.state() {
        TaskState::Finished => {
            let details = task.output_errors();
            if !details.is_empty() {
                Some(ExecError::OutputContractViolation { task: id, details })
            } else if task.raw_exit_value() != 0 {
                Some(ExecError::NonZeroExit {
                    task: id,
                    exit_value: task.raw_exit_value(),
                })
            } else {
                None
            }
        }
        TaskState::ErrorTimeout => Some(ExecError::Timeout {
            task: id,
            after: task.resources().timeout.unwrap_or_default(),
        }),
        TaskState::Error => Some(ExecError::NonZeroExit {
            task: id,
            exit_value: task.raw_exit_value(),
        }),
        TaskState::Killed if !requested_kill => Some(ExecError::NonZeroExit {
            task: id,
            exit_value: EXITCODE_KILLED,
        }),
        // Start failures are reported by dispatch.
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockExecutioner;
    use pipex_core::{Resources, EXITCODE_ERROR, EXITCODE_OK};
    use std::path::Path;

    fn task(dir: &Path, id: &str, cpus: u32) -> Arc<Task> {
        Arc::new(
            Task::new(id, dir.join(format!("{}.sh", id)), "true")
                .with_resources(Resources::new().with_cpus(cpus)),
        )
    }

    fn scheduler(cpus: u32, mock: &Arc<MockExecutioner>) -> Scheduler {
        let pool = ResourcePool::new(Resources::new().with_cpus(cpus).with_mem_mb(1024));
        Scheduler::new(pool, SchedulerConfig::default()).with_executioner(mock.clone())
    }

    fn ids(names: &[&str]) -> Vec<TaskId> {
        names.iter().map(|n| TaskId::from(*n)).collect()
    }

    #[tokio::test]
    async fn test_admission_never_exceeds_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockExecutioner::new("mock"));
        let sched = Arc::new(scheduler(4, &mock));

        let mut submitters = JoinSet::new();
        for i in 0..10 {
            let sched = sched.clone();
            let t = task(dir.path(), &format!("t{}", i), 1 + (i % 3));
            submitters.spawn(async move { sched.submit(t) });
        }

        let mut rounds = 0;
        loop {
            sched.tick().await.unwrap();
            assert!(mock.peak_cpus() <= 4, "peak {} over capacity", mock.peak_cpus());
            for id in mock.running_ids() {
                mock.finish(id.as_str(), EXITCODE_OK);
            }
            if submitters.is_empty() && sched.counts().done == 10 {
                break;
            }
            while let Some(res) = submitters.try_join_next() {
                res.unwrap().unwrap();
            }
            rounds += 1;
            assert!(rounds < 100, "run did not converge");
            tokio::task::yield_now().await;
        }

        assert_eq!(mock.launched().len(), 10);
        assert_eq!(sched.free().cpus, 4);
        assert!(!sched.is_failed());
    }

    #[tokio::test]
    async fn test_full_capacity_tasks_run_in_arrival_order() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockExecutioner::new("mock"));
        let sched = scheduler(2, &mock);
        sched.submit(task(dir.path(), "a", 2)).unwrap();
        sched.submit(task(dir.path(), "b", 2)).unwrap();

        let report = sched.tick().await.unwrap();
        assert_eq!(report.admitted, ids(&["a"]));
        assert_eq!(sched.counts().pending, 1);

        mock.finish("a", EXITCODE_OK);
        let report = sched.tick().await.unwrap();
        assert_eq!(report.completed, vec![(TaskId::from("a"), TaskState::Finished)]);

        let report = sched.tick().await.unwrap();
        assert_eq!(report.admitted, ids(&["b"]));
        assert_eq!(mock.launched(), ids(&["a", "b"]));
    }

    #[tokio::test]
    async fn test_head_of_line_is_not_overtaken() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockExecutioner::new("mock"));
        let sched = scheduler(2, &mock);
        sched.submit(task(dir.path(), "a", 1)).unwrap();
        sched.submit(task(dir.path(), "b", 2)).unwrap();
        sched.submit(task(dir.path(), "c", 1)).unwrap();

        sched.tick().await.unwrap();
        // c would fit next to a, but b arrived first.
        assert_eq!(mock.launched(), ids(&["a"]));

        mock.finish("a", EXITCODE_OK);
        sched.tick().await.unwrap();
        sched.tick().await.unwrap();
        assert_eq!(mock.launched(), ids(&["a", "b"]));

        mock.finish("b", EXITCODE_OK);
        sched.tick().await.unwrap();
        sched.tick().await.unwrap();
        assert_eq!(mock.launched(), ids(&["a", "b", "c"]));
    }

    #[tokio::test]
    async fn test_oversized_request_fails_at_submit() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockExecutioner::new("mock"));
        let sched = scheduler(4, &mock);

        let big = Arc::new(
            Task::new("big", dir.path().join("big.sh"), "true")
                .with_resources(Resources::new().with_cpus(8))
                .with_can_fail(true),
        );
        let err = sched.submit(big.clone()).unwrap_err();
        assert!(matches!(err, ExecError::ResourceUnsatisfiable { .. }));
        assert_eq!(big.state(), TaskState::StartFailed);
        assert!(!sched.is_failed());

        let strict = task(dir.path(), "strict", 5);
        assert!(sched.submit(strict).is_err());
        assert!(sched.is_failed());
        assert!(mock.launched().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_and_unknown_executioner() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockExecutioner::new("mock"));
        let sched = scheduler(4, &mock);

        sched.submit(task(dir.path(), "a", 1)).unwrap();
        assert!(matches!(
            sched.submit(task(dir.path(), "a", 1)),
            Err(ExecError::DuplicateTask(_))
        ));
        assert!(matches!(
            sched.submit_to(task(dir.path(), "b", 1), Some("slurm")),
            Err(ExecError::UnknownExecutioner(_))
        ));
    }

    #[tokio::test]
    async fn test_start_failure_releases_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockExecutioner::new("mock"));
        mock.fail_start("a");
        let sched = scheduler(1, &mock);

        let a = Arc::new(
            Task::new("a", dir.path().join("a.sh"), "true")
                .with_resources(Resources::new().with_cpus(1))
                .with_can_fail(true),
        );
        sched.submit(a.clone()).unwrap();
        sched.submit(task(dir.path(), "b", 1)).unwrap();

        let report = sched.tick().await.unwrap();
        assert!(matches!(report.failures[..], [ExecError::StartFailure { .. }]));
        assert_eq!(a.state(), TaskState::StartFailed);
        assert_eq!(sched.free().cpus, 1);

        let report = sched.tick().await.unwrap();
        assert_eq!(report.admitted, ids(&["b"]));
        assert!(!sched.is_failed());
    }

    #[tokio::test]
    async fn test_timeout_kills_task() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockExecutioner::new("mock"));
        let sched = scheduler(1, &mock);
        let slow = Arc::new(
            Task::new("slow", dir.path().join("slow.sh"), "sleep 60")
                .with_resources(Resources::new().with_timeout(Duration::from_millis(20)))
                .with_can_fail(true),
        );
        sched.submit(slow.clone()).unwrap();

        sched.tick().await.unwrap();
        assert!(slow.is_running());

        tokio::time::sleep(Duration::from_millis(40)).await;
        let report = sched.tick().await.unwrap();
        assert_eq!(slow.state(), TaskState::ErrorTimeout);
        assert_eq!(slow.exit_value(), EXITCODE_TIMEOUT);
        assert_eq!(mock.cancelled(), ids(&["slow"]));
        assert!(matches!(report.failures[..], [ExecError::Timeout { .. }]));
    }

    #[tokio::test]
    async fn test_failure_of_required_task_aborts_run() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockExecutioner::new("mock"));
        let sched = scheduler(1, &mock);
        sched.submit(task(dir.path(), "a", 1)).unwrap();
        sched.submit(task(dir.path(), "b", 1)).unwrap();

        sched.tick().await.unwrap();
        mock.finish("a", EXITCODE_ERROR);
        let report = sched.tick().await.unwrap();

        assert_eq!(report.fatal, Some("a".into()));
        assert!(sched.is_failed());
        assert!(report.admitted.is_empty());
        assert!(matches!(
            sched.submit(task(dir.path(), "c", 1)),
            Err(ExecError::RunCancelled)
        ));

        assert_eq!(sched.abort().await.unwrap(), 1);
        let b = sched.task(&"b".into()).unwrap();
        assert_eq!(b.state(), TaskState::Killed);
        assert!(sched.is_idle());
    }

    #[tokio::test]
    async fn test_missing_output_is_a_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockExecutioner::new("mock").exiting_with(EXITCODE_OK));
        let sched = scheduler(1, &mock);
        let t = Arc::new(
            Task::new("out", dir.path().join("out.sh"), "true")
                .with_output_files([dir.path().join("out.txt")]),
        );
        sched.submit(t.clone()).unwrap();

        let report = sched.tick().await.unwrap();
        assert_eq!(t.state(), TaskState::Finished);
        assert_eq!(t.exit_value(), EXITCODE_ERROR);
        assert!(!t.is_successful());
        assert!(matches!(
            report.failures[..],
            [ExecError::OutputContractViolation { .. }]
        ));
        assert!(sched.is_failed());
    }

    #[tokio::test]
    async fn test_cancel_kills_everything() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockExecutioner::new("mock"));
        let sched = scheduler(1, &mock);
        sched.submit(task(dir.path(), "a", 1)).unwrap();
        sched.submit(task(dir.path(), "b", 1)).unwrap();
        sched.tick().await.unwrap();

        assert_eq!(sched.cancel().await.unwrap(), 2);
        assert!(sched.is_cancelled());
        assert!(!sched.is_failed());
        assert_eq!(mock.cancelled(), ids(&["a"]));
        for t in sched.tasks() {
            assert_eq!(t.state(), TaskState::Killed);
        }
        assert_eq!(sched.free().cpus, 1);
        assert!(matches!(
            sched.submit(task(dir.path(), "c", 1)),
            Err(ExecError::RunCancelled)
        ));
    }

    #[tokio::test]
    async fn test_kill_single_task_does_not_fail_run() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockExecutioner::new("mock"));
        let sched = scheduler(2, &mock);
        sched.submit(task(dir.path(), "a", 1)).unwrap();
        sched.tick().await.unwrap();

        assert!(sched.kill(&"a".into()).await.unwrap());
        assert!(!sched.kill(&"a".into()).await.unwrap());
        let report = sched.tick().await.unwrap();
        assert_eq!(report.completed, vec![(TaskId::from("a"), TaskState::Killed)]);
        assert!(report.failures.is_empty());
        assert!(!sched.is_failed());
        assert!(matches!(
            sched.kill(&"zzz".into()).await,
            Err(ExecError::UnknownTask(_))
        ));
    }

    #[tokio::test]
    async fn test_wait_for_wakes_on_completion() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockExecutioner::new("mock"));
        let sched = Arc::new(scheduler(1, &mock));
        sched.submit(task(dir.path(), "a", 1)).unwrap();

        let waiter = {
            let sched = sched.clone();
            tokio::spawn(async move { sched.wait_for(&"a".into()).await })
        };

        sched.tick().await.unwrap();
        mock.finish("a", EXITCODE_OK);
        sched.tick().await.unwrap();

        let state = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(state, TaskState::Finished);
    }

    #[tokio::test]
    async fn test_restore_reattaches_running_task() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockExecutioner::new("mock"));
        let sched = scheduler(2, &mock);

        let running = task(dir.path(), "r", 2);
        running.record_state(TaskState::Started).unwrap();
        running.record_state(TaskState::Running).unwrap();
        running.set_pid("mock-r");
        let done = task(dir.path(), "d", 1);
        done.record_state(TaskState::Started).unwrap();
        done.set_exit_value(EXITCODE_OK).unwrap();

        sched.restore(running, Some("mock")).await.unwrap();
        sched.restore(done, None).await.unwrap();
        sched.restore(task(dir.path(), "p", 1), None).await.unwrap();

        assert_eq!(mock.attached(), ids(&["r"]));
        assert_eq!(sched.free().cpus, 0);
        assert_eq!(
            sched.counts(),
            TaskCounts {
                pending: 1,
                running: 1,
                done: 1,
                failed: 0
            }
        );

        // The re-attached task holds the pool; p waits and nothing restarts r.
        sched.tick().await.unwrap();
        assert!(mock.launched().is_empty());

        mock.finish("r", EXITCODE_OK);
        sched.tick().await.unwrap();
        sched.tick().await.unwrap();
        assert_eq!(mock.launched(), ids(&["p"]));
    }

    #[tokio::test]
    async fn test_cancel_during_dispatch_cancels_launched_process() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockExecutioner::new("mock").launching_after(Duration::from_millis(200)));
        let sched = Arc::new(scheduler(1, &mock));
        sched.submit(task(dir.path(), "a", 1)).unwrap();

        let ticking = {
            let sched = sched.clone();
            tokio::spawn(async move { sched.tick().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sched.cancel().await.unwrap(), 1);
        // The launch is still in flight, so its capacity is still held.
        assert_eq!(sched.free().cpus, 0);

        let report = ticking.await.unwrap().unwrap();
        assert_eq!(report.completed, vec![(TaskId::from("a"), TaskState::Killed)]);
        assert!(report.failures.is_empty());
        assert_eq!(mock.launched(), ids(&["a"]));
        assert_eq!(mock.cancelled(), ids(&["a"]));
        assert!(mock.running_ids().is_empty());
        assert_eq!(sched.free().cpus, 1);
        assert!(sched.is_idle());
    }

    #[tokio::test]
    async fn test_restore_over_capacity_still_tracks_task() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockExecutioner::new("mock"));
        let sched = scheduler(1, &mock);

        let wide = task(dir.path(), "wide", 3);
        wide.record_state(TaskState::Started).unwrap();
        wide.set_pid("mock-wide");
        sched.restore(wide, None).await.unwrap();
        sched.submit(task(dir.path(), "next", 1)).unwrap();

        assert_eq!(sched.free().cpus, 0);
        sched.tick().await.unwrap();
        assert!(mock.launched().is_empty());

        mock.finish("wide", EXITCODE_OK);
        sched.tick().await.unwrap();
        assert_eq!(sched.free().cpus, 1);
        sched.tick().await.unwrap();
        assert_eq!(mock.launched(), ids(&["next"]));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_submit_kill_and_cancel_leave_no_orphans() {
        let dir = tempfile::tempdir().unwrap();
        let mock = Arc::new(MockExecutioner::new("mock").launching_after(Duration::from_millis(3)));
        let sched = Arc::new(scheduler(3, &mock));

        let ticker = {
            let sched = sched.clone();
            let mock = mock.clone();
            tokio::spawn(async move {
                while !sched.is_cancelled() {
                    sched.tick().await?;
                    assert!(mock.peak_cpus() <= 3, "peak {} over capacity", mock.peak_cpus());
                    tokio::task::yield_now().await;
                }
                Ok::<_, ExecError>(())
            })
        };

        let mut workers = JoinSet::new();
        for worker in 0..3u32 {
            let sched = sched.clone();
            let root = dir.path().to_path_buf();
            workers.spawn(async move {
                for i in 0..15u32 {
                    let t = task(&root, &format!("w{}-{}", worker, i), 1 + i % 2);
                    match sched.submit(t) {
                        Ok(()) | Err(ExecError::RunCancelled) => {}
                        Err(e) => panic!("unexpected submit error: {}", e),
                    }
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            });
        }
        {
            let sched = sched.clone();
            workers.spawn(async move {
                for i in 0..15u32 {
                    let id = TaskId::from(format!("w1-{}", i));
                    match sched.kill(&id).await {
                        Ok(_) | Err(ExecError::UnknownTask(_)) => {}
                        Err(e) => panic!("unexpected kill error: {}", e),
                    }
                    tokio::time::sleep(Duration::from_millis(2)).await;
                }
            });
        }
        {
            let mock = mock.clone();
            workers.spawn(async move {
                for _ in 0..20 {
                    for id in mock.running_ids() {
                        mock.finish(id.as_str(), EXITCODE_OK);
                    }
                    tokio::time::sleep(Duration::from_millis(2)).await;
                }
            });
        }

        tokio::time::sleep(Duration::from_millis(30)).await;
        sched.cancel().await.unwrap();
        while let Some(res) = workers.join_next().await {
            res.unwrap();
        }
        ticker.await.unwrap().unwrap();
        // Settle anything a concurrent kill left for the next reap.
        sched.tick().await.unwrap();

        assert!(sched.tasks().iter().all(|t| t.is_done()));
        assert!(mock.running_ids().is_empty(), "orphaned: {:?}", mock.running_ids());
        assert!(mock.peak_cpus() <= 3);
        assert_eq!(sched.free().cpus, 3);
        assert!(!sched.is_failed());
        assert!(sched.is_idle());
    }

    #[test]
    fn test_config_defaults_from_json() {
        let config: SchedulerConfig = serde_json::from_str(r#"{"tick_interval_ms": 50}"#).unwrap();
        assert_eq!(config.poll_timeout(), Duration::from_secs(5));
        assert_eq!(config.tick_interval_ms, Some(50));
    }
}
