//! Task scheduler
//!
//! Polls the store for pending tasks, claims each one atomically and drives
//! its executor until an attempt terminates. Claimed tasks run concurrently,
//! bounded by a semaphore. No retries: a failed attempt fails the task.

use super::{Attempt, ExecutorContext, ExecutorRegistry, TaskExecutor};
use crate::error::{AppError, AppResult};
use crate::models::{Progress, Task, TaskCompletion, TaskStatus};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

/// Scheduler tuning
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Delay between polls of the store
    pub interval: Duration,
    pub max_concurrent_tasks: usize,
    /// Delay before re-invoking an attempt that did not terminate
    pub task_poll_interval: Duration,
}

/// Live view of a task for status readers
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskLiveStatus {
    pub completed: bool,
    pub progress: Progress,
}

#[derive(Clone)]
pub struct Scheduler {
    ctx: Arc<ExecutorContext>,
    registry: Arc<ExecutorRegistry>,
    config: SchedulerConfig,
    permits: Arc<Semaphore>,
    live: Arc<RwLock<HashMap<i32, Arc<TaskExecutor>>>>,
    tracker: TaskTracker,
}

impl Scheduler {
    pub fn new(ctx: Arc<ExecutorContext>, registry: Arc<ExecutorRegistry>, config: SchedulerConfig) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(config.max_concurrent_tasks.max(1))),
            ctx,
            registry,
            config,
            live: Arc::new(RwLock::new(HashMap::new())),
            tracker: TaskTracker::new(),
        }
    }

    /// Completion flag and progress of a task. Tasks not currently executing
    /// are answered from the store row.
    pub async fn status(&self, task: &Task) -> TaskLiveStatus {
        if let Some(executor) = self.live.read().await.get(&task.id) {
            return TaskLiveStatus {
                completed: executor.is_completed(),
                progress: executor.progress(),
            };
        }
        TaskLiveStatus {
            completed: task.status.is_terminal(),
            progress: Progress::default(),
        }
    }

    /// Claim and start as many pending tasks as there are free slots.
    /// Returns the number started.
    pub async fn tick(&self, cancel: &CancellationToken) -> AppResult<usize> {
        let mut started = 0;
        for task in self.ctx.store.list_tasks(Some(TaskStatus::Pending)).await? {
            let permit = match self.permits.clone().try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let Some(task) = self.ctx.store.claim_task(task.id).await? else {
                // Claimed elsewhere
                continue;
            };
            debug!(task_id = task.id, task_type = %task.task_type, "task claimed");
            let scheduler = self.clone();
            let cancel = cancel.child_token();
            self.tracker.spawn(async move {
                if let Err(e) = scheduler.execute(task, cancel, permit).await {
                    error!(error = %e, "failed to record task outcome");
                }
            });
            started += 1;
        }
        Ok(started)
    }

    /// Drive a claimed task to a terminal state and persist it
    #[instrument(skip_all, fields(task_id = task.id, task_type = %task.task_type))]
    pub async fn execute(&self, task: Task, cancel: CancellationToken, _permit: OwnedSemaphorePermit) -> AppResult<Task> {
        let executor = match self.registry.create(task.task_type) {
            Ok(executor) => Arc::new(executor),
            Err(e) => {
                return self
                    .ctx
                    .store
                    .complete_task(task.id, &TaskCompletion::Failed(e.to_string()))
                    .await
            }
        };
        self.live.write().await.insert(task.id, executor.clone());

        let completion = self.drive(&executor, &task, &cancel).await;
        match &completion {
            TaskCompletion::Succeeded(result) => info!(detail = %result.detail, "task done"),
            TaskCompletion::Failed(message) => warn!(error = %message, "task failed"),
        }
        let saved = self.ctx.store.complete_task(task.id, &completion).await;
        self.live.write().await.remove(&task.id);
        saved
    }

    async fn drive(&self, executor: &TaskExecutor, task: &Task, cancel: &CancellationToken) -> TaskCompletion {
        loop {
            match executor.run_once(&self.ctx, task, cancel).await {
                Attempt::Succeeded(result) => return TaskCompletion::Succeeded(result),
                Attempt::Failed(e) => {
                    debug!(kind = ?e.kind(), "attempt failed");
                    return TaskCompletion::Failed(e.to_string());
                }
                Attempt::Pending => {
                    debug!("attempt not finished, polling again");
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            return TaskCompletion::Failed(AppError::Cancelled.to_string());
                        }
                        _ = tokio::time::sleep(self.config.task_poll_interval) => {}
                    }
                }
            }
        }
    }

    /// Poll until `cancel` fires, then wait for running tasks to wind down
    pub async fn run(self, cancel: CancellationToken) {
        info!(
            interval_ms = self.config.interval.as_millis() as u64,
            max_concurrent = self.config.max_concurrent_tasks,
            "scheduler started"
        );
        loop {
            if let Err(e) = self.tick(&cancel).await {
                error!(error = %e, "scheduler tick failed");
            }
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.config.interval) => {}
            }
        }
        self.tracker.close();
        self.tracker.wait().await;
        info!("scheduler stopped");
    }
}
