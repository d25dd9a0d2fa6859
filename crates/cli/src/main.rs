//! pipex CLI - run shell programs as resource-bounded tasks.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use pipex_core::{CleanupRegistry, Resources, Task, TaskId};
use pipex_execution::{
    CheckpointManager, Engine, EngineConfig, LocalExecutioner, ResourcePool, RunSummary,
    Scheduler, SchedulerConfig,
};
use pipex_storage::{CheckpointStore, FileCheckpointStore};
use serde::Deserialize;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "pipex")]
#[command(about = "Resource-aware pipeline task runner", long_about = None)]
struct Cli {
    /// JSON config file (engine, scheduler, capacity)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run programs as tasks
    Run {
        /// CPUs requested by each task
        #[arg(long, default_value = "1")]
        cpus: u32,
        /// Memory requested by each task, in MB
        #[arg(long = "mem-mb", default_value = "0")]
        mem_mb: u64,
        /// Wall-clock budget per task
        #[arg(long = "timeout-secs")]
        timeout_secs: Option<u64>,
        /// Checkpoint file
        #[arg(long)]
        checkpoint: Option<PathBuf>,
        /// Directory for program files and their output
        #[arg(long, default_value = ".pipex")]
        workdir: PathBuf,
        /// A failing task does not abort the run
        #[arg(long = "can-fail")]
        can_fail: bool,
        /// Delete program and log files after a successful run
        #[arg(long)]
        temporary: bool,
        #[command(flatten)]
        pool: PoolArgs,
        /// Programs, one task each
        #[arg(last = true, required = true)]
        programs: Vec<String>,
    },
    /// Continue a run from its checkpoint
    Resume {
        /// Checkpoint file
        #[arg(long)]
        checkpoint: PathBuf,
        #[command(flatten)]
        pool: PoolArgs,
    },
    /// List the records of a checkpoint
    Show {
        /// Checkpoint file
        #[arg(long)]
        checkpoint: PathBuf,
    },
}

#[derive(Args)]
struct PoolArgs {
    /// Total CPUs (default: available parallelism)
    #[arg(long = "capacity-cpus")]
    capacity_cpus: Option<u32>,
    /// Total memory, in MB
    #[arg(long = "capacity-mem-mb", default_value = "16384")]
    capacity_mem_mb: u64,
}

/// Contents of the `--config` file.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Config {
    engine: EngineConfig,
    scheduler: SchedulerConfig,
    capacity: Option<Resources>,
}

impl Config {
    fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("parsing config {}", path.display()))
    }

    fn capacity(&self, pool: &PoolArgs) -> Resources {
        if let Some(capacity) = &self.capacity {
            return capacity.clone();
        }
        let cpus = pool.capacity_cpus.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get() as u32)
                .unwrap_or(1)
        });
        Resources::new().with_cpus(cpus).with_mem_mb(pool.capacity_mem_mb)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            cpus,
            mem_mb,
            timeout_secs,
            checkpoint,
            workdir,
            can_fail,
            temporary,
            pool,
            programs,
        } => {
            let mut request = Resources::new().with_cpus(cpus).with_mem_mb(mem_mb);
            if let Some(secs) = timeout_secs {
                request = request.with_timeout(Duration::from_secs(secs));
            }
            let scheduler = build_scheduler(&config, &pool);
            for task in build_tasks(&workdir, &programs, &request, can_fail) {
                // Unsatisfiable requests are recorded on the task and in the summary.
                if let Err(e) = scheduler.submit(Arc::new(task)) {
                    warn!("{}", e);
                }
            }

            let mut engine = Engine::new(scheduler.clone()).with_config(config.engine.clone());
            if let Some(path) = checkpoint {
                info!("Checkpointing to {}", path.display());
                engine = engine.with_checkpoints(manager(&path));
            }
            let summary = drive(engine, &scheduler).await?;
            finish(&scheduler, &summary, cli.json)?;

            if temporary {
                let registry = CleanupRegistry::new();
                for task in scheduler.tasks() {
                    task.mark_temporary(&registry);
                }
                let removed = registry.cleanup();
                info!(removed, "Removed temporary files");
            }
        }
        Commands::Resume { checkpoint, pool } => {
            let scheduler = build_scheduler(&config, &pool);
            let restored = manager(&checkpoint).restore(&scheduler).await?;
            if restored == 0 {
                bail!("nothing to resume in {}", checkpoint.display());
            }

            let engine = Engine::new(scheduler.clone())
                .with_config(config.engine.clone())
                .with_checkpoints(manager(&checkpoint));
            let summary = drive(engine, &scheduler).await?;
            finish(&scheduler, &summary, cli.json)?;
        }
        Commands::Show { checkpoint } => {
            let Some(loaded) = FileCheckpointStore::new(&checkpoint).load().await? else {
                bail!("no checkpoint at {}", checkpoint.display());
            };

            if cli.json {
                let tasks: Vec<_> = loaded
                    .tasks
                    .iter()
                    .map(|t| {
                        serde_json::json!({
                            "id": t.id.as_str(),
                            "state": t.state,
                            "exit_value": t.exit_value,
                            "pid": t.pid,
                            "can_fail": t.can_fail,
                            "program_file": t.program_file,
                            "resources": t.resources,
                            "executioner": loaded.dispatch.get(&t.id),
                        })
                    })
                    .collect();
                println!("{}", serde_json::to_string_pretty(&tasks)?);
                return Ok(());
            }

            let created = loaded
                .created_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "-".to_string());
            println!("Checkpoint v{} ({})", loaded.version, created);
            println!("Tasks ({})", loaded.tasks.len());
            for task in &loaded.tasks {
                println!(
                    "  {} | {} | exit {} | pid {} | {}",
                    task.id,
                    task.state,
                    task.exit_value,
                    task.pid.as_deref().unwrap_or("-"),
                    task.program_file.display(),
                );
            }
            for (task, executioner) in &loaded.dispatch {
                println!("  dispatch {} -> {}", task, executioner);
            }
        }
    }

    Ok(())
}

fn build_scheduler(config: &Config, pool: &PoolArgs) -> Arc<Scheduler> {
    let capacity = config.capacity(pool);
    info!("Capacity: {}", capacity);
    let scheduler = Scheduler::new(ResourcePool::new(capacity), config.scheduler.clone())
        .with_executioner(Arc::new(LocalExecutioner::new()));
    Arc::new(scheduler)
}

fn manager(path: &Path) -> CheckpointManager {
    CheckpointManager::new(Box::new(FileCheckpointStore::new(path)))
}

fn build_tasks(workdir: &Path, programs: &[String], request: &Resources, can_fail: bool) -> Vec<Task> {
    programs
        .iter()
        .enumerate()
        .map(|(i, program)| {
            let id = TaskId::new();
            let program_file = workdir.join(format!("{}.sh", id));
            Task::new(id, program_file, program.as_str())
                .with_source("<command line>", i as u32 + 1)
                .with_resources(request.clone())
                .with_can_fail(can_fail)
        })
        .collect()
}

/// Run the engine, cancelling the run on Ctrl-C.
async fn drive(engine: Engine, scheduler: &Arc<Scheduler>) -> Result<RunSummary> {
    let mut handle = engine.spawn();
    let summary = tokio::select! {
        joined = &mut handle => joined??,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, killing remaining tasks");
            scheduler.cancel().await?;
            handle.await??
        }
    };
    Ok(summary)
}

fn finish(scheduler: &Scheduler, summary: &RunSummary, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(summary)?);
    } else {
        let counts = summary.counts;
        println!(
            "Ticks: {} | done: {} | failed: {} | pending: {} | running: {}",
            summary.ticks, counts.done, counts.failed, counts.pending, counts.running
        );
    }

    for id in &summary.failed_tasks {
        if let Some(task) = scheduler.task(id) {
            eprintln!("Task failed:\n{}", task.report(true));
        }
    }

    if summary.failed() {
        match &summary.fatal {
            Some(task) => bail!("run aborted: task {} failed", task),
            None => bail!("run cancelled"),
        }
    }
    if summary.interrupted {
        info!("Stopped with work left; resume from the checkpoint");
    }
    Ok(())
}
