//! Periodic background flush and compaction.
//!
//! Tasks run on the tokio runtime; the engine work itself is synchronous and
//! is moved onto the blocking pool. Manual [`Engine::flush`] and
//! [`Engine::compact`] calls remain available and serialize with the tasks.

use crate::engine::{Engine, EngineState};
use crate::error::{Result, TsmError};
use std::io;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

/// Context provided to background tasks during execution.
pub struct Context {
    /// Name of the running task.
    pub task_name: &'static str,
    /// Number of this run, starting at 1.
    pub run_id: u64,
    /// Fires when the scheduler shuts down.
    pub shutdown: broadcast::Receiver<()>,
}

/// A task run periodically by the [`Scheduler`].
#[async_trait::async_trait]
pub trait BackgroundTask: Send + Sync {
    /// Task name for logging.
    fn name(&self) -> &'static str;

    /// How often to run this task.
    fn interval(&self) -> Duration;

    /// Runs the task once.
    async fn execute(&self, ctx: Context) -> Result<()>;
}

/// Runs registered tasks on timers until shut down.
pub struct Scheduler {
    tasks: RwLock<Vec<JoinHandle<()>>>,
    shutdown_tx: broadcast::Sender<()>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("tasks", &self.tasks.read().map(|t| t.len()).unwrap_or(0))
            .finish()
    }
}

impl Scheduler {
    /// Creates a scheduler with no tasks.
    pub fn new() -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            tasks: RwLock::new(Vec::new()),
            shutdown_tx,
        }
    }

    /// Registers a periodic task. Must be called within a tokio runtime.
    pub fn register<T: BackgroundTask + 'static>(&self, task: Arc<T>) -> &Self {
        let handle = self.spawn_timer_loop(task);
        self.tasks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
        self
    }

    /// Number of registered tasks.
    pub fn task_count(&self) -> usize {
        self.tasks.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn spawn_timer_loop<T: BackgroundTask + 'static>(&self, task: Arc<T>) -> JoinHandle<()> {
        let interval = task.interval();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut run_id = 0u64;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        run_id += 1;
                        let ctx = Context {
                            task_name: task.name(),
                            run_id,
                            shutdown: shutdown_rx.resubscribe(),
                        };

                        if let Err(e) = task.execute(ctx).await {
                            error!(task = task.name(), run_id, error = %e, "background task failed");
                        }
                    }

                    _ = shutdown_rx.recv() => {
                        info!(task = task.name(), "background task shutting down");
                        break;
                    }
                }
            }
        })
    }

    /// Signals every task to stop and waits for them.
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown_tx.send(()).ok();

        let handles: Vec<_> = self
            .tasks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for handle in handles {
            handle.await.map_err(join_error)?;
        }
        Ok(())
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

fn join_error(e: tokio::task::JoinError) -> TsmError {
    TsmError::IoError(io::Error::other(format!("background task join error: {e}")))
}

/// Flushes the cache whenever [`Engine::should_flush`] says so.
#[derive(Debug)]
pub struct FlushTask {
    engine: Arc<Engine>,
    interval: Duration,
}

impl FlushTask {
    /// Creates a flush task checking every `interval`.
    pub fn new(engine: Arc<Engine>, interval: Duration) -> Self {
        Self { engine, interval }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for FlushTask {
    fn name(&self) -> &'static str {
        "flush"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn execute(&self, ctx: Context) -> Result<()> {
        if self.engine.state() != EngineState::Serving || !self.engine.should_flush() {
            return Ok(());
        }
        debug!(task = ctx.task_name, run_id = ctx.run_id, "flush due");
        let engine = self.engine.clone();
        match tokio::task::spawn_blocking(move || engine.flush())
            .await
            .map_err(join_error)?
        {
            Err(TsmError::EngineClosed) => Ok(()),
            other => other,
        }
    }
}

/// Plans and runs compactions.
#[derive(Debug)]
pub struct CompactionTask {
    engine: Arc<Engine>,
    interval: Duration,
}

impl CompactionTask {
    /// Creates a compaction task running every `interval`.
    pub fn new(engine: Arc<Engine>, interval: Duration) -> Self {
        Self { engine, interval }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for CompactionTask {
    fn name(&self) -> &'static str {
        "compaction"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn execute(&self, ctx: Context) -> Result<()> {
        if self.engine.state() != EngineState::Serving {
            return Ok(());
        }
        let engine = self.engine.clone();
        let summary = match tokio::task::spawn_blocking(move || engine.compact())
            .await
            .map_err(join_error)?
        {
            Err(TsmError::EngineClosed) => return Ok(()),
            other => other?,
        };
        if !summary.completed.is_empty() {
            debug!(
                task = ctx.task_name,
                run_id = ctx.run_id,
                groups = summary.completed.len(),
                files = summary.files_compacted(),
                "compaction pass finished"
            );
        }
        Ok(())
    }
}
