//! Checkpoint manager: persist scheduler state and resume from it.

use std::sync::Arc;

use pipex_core::{Task, TaskState};
use pipex_storage::{Checkpoint, CheckpointStore};
use tracing::{debug, info, warn};

use crate::scheduler::Scheduler;
use crate::{ExecError, Result};

/// Saves and restores a scheduler through a [`CheckpointStore`].
pub struct CheckpointManager {
    store: Box<dyn CheckpointStore>,
}

impl CheckpointManager {
    /// Manager writing to `store`.
    pub fn new(store: Box<dyn CheckpointStore>) -> Self {
        Self { store }
    }

    /// Underlying store.
    pub fn store(&self) -> &dyn CheckpointStore {
        self.store.as_ref()
    }

    /// Build a checkpoint from the scheduler's current state.
    ///
    /// Each task is copied under its own lock, so no record mixes two
    /// states of the same task.
    pub fn capture(scheduler: &Scheduler) -> Checkpoint {
        let mut checkpoint = Checkpoint::new();
        for (snapshot, executioner) in scheduler.snapshot() {
            if matches!(snapshot.state, TaskState::Started | TaskState::Running) {
                checkpoint.dispatch.insert(snapshot.id.clone(), executioner);
            }
            checkpoint.tasks.push(snapshot);
        }
        checkpoint
    }

    /// Persist the scheduler. Returns the number of tasks written.
    pub async fn save(&self, scheduler: &Scheduler) -> Result<usize> {
        let checkpoint = Self::capture(scheduler);
        self.store.save(&checkpoint).await?;
        debug!(
            tasks = checkpoint.tasks.len(),
            "checkpoint written to {}",
            self.store.describe()
        );
        Ok(checkpoint.tasks.len())
    }

    /// Stored checkpoint, if any.
    pub async fn load(&self) -> Result<Option<Checkpoint>> {
        Ok(self.store.load().await?)
    }

    /// Re-register every checkpointed task with `scheduler`.
    ///
    /// Started and running tasks are re-attached through the executioner
    /// that owned them and polled from there; they are never started a
    /// second time. A task whose process handle cannot be resolved is
    /// marked killed, and a pending task larger than the pool fails to
    /// start; both fail the run unless the task may fail. Returns the
    /// number of tasks restored.
    pub async fn restore(&self, scheduler: &Scheduler) -> Result<usize> {
        let Some(checkpoint) = self.store.load().await? else {
            info!("no checkpoint at {}", self.store.describe());
            return Ok(0);
        };

        let mut restored = 0;
        for snapshot in checkpoint.tasks {
            let executioner = checkpoint.dispatch.get(&snapshot.id).map(String::as_str);
            let task = Arc::new(Task::restore(snapshot));

            match scheduler.restore(task, executioner).await {
                Ok(()) => {}
                // Recorded on the task; the run summary reports it.
                Err(e @ ExecError::ResourceUnsatisfiable { .. }) => warn!("{}", e),
                Err(e) => return Err(e),
            }
            restored += 1;
        }

        let counts = scheduler.counts();
        info!(
            restored,
            pending = counts.pending,
            running = counts.running,
            done = counts.done,
            "resumed from {}",
            self.store.describe()
        );
        Ok(restored)
    }

    /// Remove the stored checkpoint.
    pub async fn clear(&self) -> Result<()> {
        Ok(self.store.clear().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::ResourcePool;
    use crate::scheduler::SchedulerConfig;
    use crate::testing::MockExecutioner;
    use pipex_core::{Resources, TaskId, EXITCODE_OK};
    use pipex_storage::{FileCheckpointStore, MemoryCheckpointStore, StorageError};

    fn scheduler(mock: &Arc<MockExecutioner>) -> Scheduler {
        let pool = ResourcePool::new(Resources::new().with_cpus(2));
        Scheduler::new(pool, SchedulerConfig::default()).with_executioner(mock.clone())
    }

    fn task(dir: &std::path::Path, id: &str) -> Arc<Task> {
        Arc::new(
            Task::new(id, dir.join(format!("{}.sh", id)), format!("echo {}", id))
                .with_resources(Resources::new().with_cpus(1)),
        )
    }

    #[tokio::test]
    async fn test_round_trip_reattaches_running_task() {
        let dir = tempfile::tempdir().unwrap();
        let manager =
            CheckpointManager::new(Box::new(FileCheckpointStore::new(dir.path().join("run.ckpt"))));

        let first = Arc::new(MockExecutioner::new("mock"));
        let sched = scheduler(&first);
        for id in ["done", "running", "pending", "later"] {
            sched.submit(task(dir.path(), id)).unwrap();
        }
        sched.tick().await.unwrap();
        first.finish("done", EXITCODE_OK);
        sched.tick().await.unwrap();
        sched.tick().await.unwrap();

        assert_eq!(manager.save(&sched).await.unwrap(), 4);
        let before: Vec<_> = sched.tasks().iter().map(|t| t.snapshot()).collect();
        let saved = manager.load().await.unwrap().unwrap();
        assert_eq!(saved.tasks, before);
        assert_eq!(saved.dispatch.len(), 2);

        // A new controller process picks the run up.
        let second = Arc::new(MockExecutioner::new("mock"));
        let resumed = scheduler(&second);
        assert_eq!(manager.restore(&resumed).await.unwrap(), 4);

        let after: Vec<_> = resumed.tasks().iter().map(|t| t.snapshot()).collect();
        assert_eq!(after, before);
        assert_eq!(second.attached(), vec![TaskId::from("running"), TaskId::from("pending")]);

        second.finish("running", EXITCODE_OK);
        second.finish("pending", EXITCODE_OK);
        resumed.tick().await.unwrap();
        resumed.tick().await.unwrap();
        assert_eq!(second.launched(), vec![TaskId::from("later")]);
        assert!(!second.launched().contains(&TaskId::from("running")));
    }

    #[tokio::test]
    async fn test_detached_task_is_marked_killed() {
        let dir = tempfile::tempdir().unwrap();
        let lost = task(dir.path(), "lost");
        lost.record_state(TaskState::Started).unwrap();
        lost.record_state(TaskState::Running).unwrap();

        let store = MemoryCheckpointStore::new();
        let mut checkpoint = Checkpoint::new();
        checkpoint.tasks.push(lost.snapshot());
        checkpoint.dispatch.insert(lost.id().clone(), "mock".to_string());
        store.save(&checkpoint).await.unwrap();
        let manager = CheckpointManager::new(Box::new(store));

        let mock = Arc::new(MockExecutioner::new("mock"));
        let sched = scheduler(&mock);
        assert_eq!(manager.restore(&sched).await.unwrap(), 1);

        let restored = sched.task(lost.id()).unwrap();
        assert_eq!(restored.state(), TaskState::Killed);
        assert_eq!(sched.free().cpus, 2);
        assert_eq!(sched.fatal_task(), Some(lost.id().clone()));
    }

    #[tokio::test]
    async fn test_lost_task_fails_resumed_run() {
        let dir = tempfile::tempdir().unwrap();
        let lost = task(dir.path(), "lost");
        lost.record_state(TaskState::Started).unwrap();
        lost.record_state(TaskState::Running).unwrap();
        let waiting = task(dir.path(), "waiting");

        let store = MemoryCheckpointStore::new();
        let mut checkpoint = Checkpoint::new();
        checkpoint.tasks.push(lost.snapshot());
        checkpoint.tasks.push(waiting.snapshot());
        checkpoint.dispatch.insert(lost.id().clone(), "mock".to_string());
        store.save(&checkpoint).await.unwrap();

        let mock = Arc::new(MockExecutioner::new("mock"));
        let sched = Arc::new(scheduler(&mock));
        CheckpointManager::new(Box::new(store)).restore(&sched).await.unwrap();

        let summary = crate::Engine::new(sched.clone()).run_until_idle().await.unwrap();
        assert!(summary.failed());
        assert_eq!(summary.fatal, Some(TaskId::from("lost")));
        assert!(mock.launched().is_empty());
        let waiting = sched.task(&"waiting".into()).unwrap();
        assert_eq!(waiting.state(), TaskState::Killed);
    }

    #[tokio::test]
    async fn test_oversized_pending_task_fails_on_smaller_pool() {
        let dir = tempfile::tempdir().unwrap();
        let big = Arc::new(
            Task::new("big", dir.path().join("big.sh"), "true")
                .with_resources(Resources::new().with_cpus(4)),
        );
        let small = task(dir.path(), "small");

        let store = MemoryCheckpointStore::new();
        let mut checkpoint = Checkpoint::new();
        checkpoint.tasks.push(big.snapshot());
        checkpoint.tasks.push(small.snapshot());
        store.save(&checkpoint).await.unwrap();

        let mock = Arc::new(MockExecutioner::new("mock"));
        let sched = Arc::new(scheduler(&mock));
        let manager = CheckpointManager::new(Box::new(store));
        assert_eq!(manager.restore(&sched).await.unwrap(), 2);

        let big = sched.task(&"big".into()).unwrap();
        assert_eq!(big.state(), TaskState::StartFailed);
        assert_eq!(sched.fatal_task(), Some(TaskId::from("big")));

        let config = crate::EngineConfig {
            max_ticks: Some(50),
            ..Default::default()
        };
        let summary = crate::Engine::new(sched.clone())
            .with_config(config)
            .run_until_idle()
            .await
            .unwrap();
        assert!(summary.failed());
        assert!(!summary.interrupted);
        assert!(summary.ticks < 50);
    }

    #[tokio::test]
    async fn test_oversized_pending_task_that_may_fail_does_not_block() {
        let dir = tempfile::tempdir().unwrap();
        let big = Arc::new(
            Task::new("big", dir.path().join("big.sh"), "true")
                .with_resources(Resources::new().with_cpus(4))
                .with_can_fail(true),
        );
        let mock = Arc::new(MockExecutioner::new("mock").exiting_with(EXITCODE_OK));
        let sched = scheduler(&mock);

        let err = sched.restore(big, None).await.unwrap_err();
        assert!(matches!(err, ExecError::ResourceUnsatisfiable { .. }));
        sched.restore(task(dir.path(), "small"), None).await.unwrap();

        sched.tick().await.unwrap();
        assert_eq!(mock.launched(), vec![TaskId::from("small")]);
        assert!(!sched.is_failed());
    }

    #[tokio::test]
    async fn test_unregistered_executioner_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let t = task(dir.path(), "remote");
        t.record_state(TaskState::Started).unwrap();
        t.set_pid("job-17");

        let store = MemoryCheckpointStore::new();
        let mut checkpoint = Checkpoint::new();
        checkpoint.tasks.push(t.snapshot());
        checkpoint.dispatch.insert(t.id().clone(), "slurm".to_string());
        store.save(&checkpoint).await.unwrap();

        let mock = Arc::new(MockExecutioner::new("mock"));
        let sched = scheduler(&mock);
        let err = CheckpointManager::new(Box::new(store))
            .restore(&sched)
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::UnknownExecutioner(name) if name == "slurm"));
    }

    #[tokio::test]
    async fn test_corrupt_checkpoint_propagates() {
        let store = MemoryCheckpointStore::new();
        store
            .set_raw("Checkpoint\t1\t2026-01-01T00:00:00Z\nTask\tonly-an-id\n")
            .await;
        let mock = Arc::new(MockExecutioner::new("mock"));
        let sched = scheduler(&mock);

        let err = CheckpointManager::new(Box::new(store))
            .restore(&sched)
            .await
            .unwrap_err();
        assert!(err.is_invariant_violation());
        assert!(matches!(
            err,
            ExecError::Storage(StorageError::CorruptCheckpoint { line: 2, .. })
        ));
        assert!(sched.tasks().is_empty());
    }

    #[tokio::test]
    async fn test_missing_checkpoint_restores_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let manager =
            CheckpointManager::new(Box::new(FileCheckpointStore::new(dir.path().join("none"))));
        let mock = Arc::new(MockExecutioner::new("mock"));
        assert_eq!(manager.restore(&scheduler(&mock)).await.unwrap(), 0);
    }
}
