//! Scripted executioner for scheduler tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use pipex_core::{Resources, Task, TaskId};

use crate::executioner::{Executioner, Launched, PollStatus};
use crate::{ExecError, Result};

/// Runs nothing; tasks finish when the test says so.
pub struct MockExecutioner {
    name: String,
    queued: bool,
    exit_on_first_poll: Option<i32>,
    launch_delay: Option<Duration>,
    state: Mutex<MockState>,
}

#[derive(Default)]
struct MockState {
    fail_start: HashSet<TaskId>,
    exits: HashMap<TaskId, i32>,
    launched: Vec<TaskId>,
    running: HashMap<TaskId, Resources>,
    peak: Resources,
    cancelled: Vec<TaskId>,
    attached: Vec<TaskId>,
}

impl MockExecutioner {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            queued: false,
            exit_on_first_poll: None,
            launch_delay: None,
            state: Mutex::new(MockState::default()),
        }
    }

    /// Launched tasks report `Queued` until finished.
    pub fn queued(mut self) -> Self {
        self.queued = true;
        self
    }

    /// Every task exits with `code` on its first poll.
    pub fn exiting_with(mut self, code: i32) -> Self {
        self.exit_on_first_poll = Some(code);
        self
    }

    /// Every launch takes `delay` before it returns.
    pub fn launching_after(mut self, delay: Duration) -> Self {
        self.launch_delay = Some(delay);
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    pub fn fail_start(&self, id: &str) {
        self.lock().fail_start.insert(id.into());
    }

    /// The next poll of `id` reports `Exited(code)`.
    pub fn finish(&self, id: &str, code: i32) {
        self.lock().exits.insert(id.into(), code);
    }

    pub fn launched(&self) -> Vec<TaskId> {
        self.lock().launched.clone()
    }

    pub fn cancelled(&self) -> Vec<TaskId> {
        self.lock().cancelled.clone()
    }

    pub fn attached(&self) -> Vec<TaskId> {
        self.lock().attached.clone()
    }

    /// Highest CPU total ever running at once.
    pub fn peak_cpus(&self) -> u32 {
        self.lock().peak.cpus
    }

    pub fn running_ids(&self) -> HashSet<TaskId> {
        self.lock().running.keys().cloned().collect()
    }

    fn track(state: &mut MockState, task: &Task) {
        state.running.insert(task.id().clone(), task.resources().clone());
        let total = state
            .running
            .values()
            .fold(Resources::default(), |acc, r| acc.add(r));
        if total.cpus > state.peak.cpus {
            state.peak = total;
        }
    }
}

#[async_trait]
impl Executioner for MockExecutioner {
    fn name(&self) -> &str {
        &self.name
    }

    fn monitor_interval(&self) -> Duration {
        Duration::from_millis(10)
    }

    async fn launch(&self, task: &Arc<Task>) -> Result<Launched> {
        if let Some(delay) = self.launch_delay {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.lock();
        if state.fail_start.contains(task.id()) {
            return Err(ExecError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "refused by mock",
            )));
        }
        state.launched.push(task.id().clone());
        Self::track(&mut state, task);
        Ok(Launched {
            pid: Some(format!("mock-{}", task.id())),
            running: !self.queued,
        })
    }

    async fn poll(&self, task: &Task) -> Result<PollStatus> {
        let mut state = self.lock();
        let code = state.exits.remove(task.id()).or(self.exit_on_first_poll);
        match code {
            Some(code) => {
                state.running.remove(task.id());
                Ok(PollStatus::Exited(code))
            }
            None if self.queued => Ok(PollStatus::Queued),
            None => Ok(PollStatus::Running),
        }
    }

    async fn cancel(&self, task: &Task) -> Result<()> {
        let mut state = self.lock();
        state.running.remove(task.id());
        state.cancelled.push(task.id().clone());
        Ok(())
    }

    async fn attach(&self, task: &Arc<Task>) -> Result<()> {
        let mut state = self.lock();
        if task.pid().is_none() {
            return Err(ExecError::Detached(task.id().clone()));
        }
        state.attached.push(task.id().clone());
        Self::track(&mut state, task);
        Ok(())
    }
}
