//! Bounded-concurrency task runner for the execute phase.
//!
//! The runner fans a batch of independent tasks out over a semaphore. A
//! failing or panicking task is recorded against that task only; the queue is
//! always drained and every task gets an outcome.

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::errors::InvocationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// One independently generatable unit of work.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: String,
    /// Artifact the task produces, usually a project-relative file path
    pub target: String,
    pub description: String,
    #[serde(default)]
    pub state: TaskState,
}

impl Task {
    pub fn new(id: impl Into<String>, target: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            target: target.into(),
            description: description.into(),
            state: TaskState::Pending,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct TaskOutput {
    /// Artifact written by the task, if any
    #[serde(default)]
    pub artifact: Option<String>,
    #[serde(default)]
    pub bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskFailure {
    pub message: String,
    /// Worth another attempt
    pub transient: bool,
}

impl TaskFailure {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: true,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: false,
        }
    }
}

impl From<InvocationError> for TaskFailure {
    fn from(err: InvocationError) -> Self {
        Self {
            transient: err.is_transient(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskOutcome {
    Succeeded(TaskOutput),
    Failed(TaskFailure),
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, TaskOutcome::Succeeded(_))
    }
}

/// Aggregate of a batch, used to decide the execute phase outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchAggregate {
    Empty,
    AllSucceeded,
    Partial { failed: Vec<String> },
    AllFailed,
}

/// Result of one runner batch.
#[derive(Debug, Clone, Serialize)]
pub struct TaskReport {
    /// Tasks in submission order with their final state
    pub tasks: Vec<Task>,
    pub outcomes: BTreeMap<String, TaskOutcome>,
    /// Highest number of tasks observed running at once
    pub peak_running: usize,
}

impl TaskReport {
    pub fn succeeded(&self) -> impl Iterator<Item = (&String, &TaskOutput)> {
        self.outcomes.iter().filter_map(|(id, o)| match o {
            TaskOutcome::Succeeded(out) => Some((id, out)),
            TaskOutcome::Failed(_) => None,
        })
    }

    pub fn failed(&self) -> impl Iterator<Item = (&String, &TaskFailure)> {
        self.outcomes.iter().filter_map(|(id, o)| match o {
            TaskOutcome::Failed(f) => Some((id, f)),
            TaskOutcome::Succeeded(_) => None,
        })
    }

    pub fn aggregate(&self) -> BatchAggregate {
        let failed: Vec<String> = self.failed().map(|(id, _)| id.clone()).collect();
        if self.outcomes.is_empty() {
            BatchAggregate::Empty
        } else if failed.is_empty() {
            BatchAggregate::AllSucceeded
        } else if failed.len() == self.outcomes.len() {
            BatchAggregate::AllFailed
        } else {
            BatchAggregate::Partial { failed }
        }
    }
}

/// Executes one task. Implementations must be safe to call concurrently.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, task: &Task) -> Result<TaskOutput, TaskFailure>;
}

/// Called whenever a task changes state.
pub type TaskListener = Arc<dyn Fn(&Task) + Send + Sync>;

/// Runs tasks with at most `max_concurrency` in flight.
#[derive(Clone)]
pub struct TaskRunner {
    max_concurrency: usize,
    task_timeout: Option<Duration>,
    listener: Option<TaskListener>,
}

impl TaskRunner {
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            max_concurrency: max_concurrency.max(1),
            task_timeout: None,
            listener: None,
        }
    }

    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = Some(timeout);
        self
    }

    pub fn with_listener(mut self, listener: TaskListener) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    fn notify(&self, task: &Task) {
        if let Some(listener) = &self.listener {
            listener(task);
        }
    }

    /// Run every task and return the complete outcome map.
    pub async fn run(&self, tasks: Vec<Task>, executor: Arc<dyn TaskExecutor>) -> TaskReport {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrency));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let mut set = JoinSet::new();
        let mut ids_by_handle = HashMap::new();

        for task in &tasks {
            let task = task.clone();
            let semaphore = semaphore.clone();
            let executor = executor.clone();
            let running = running.clone();
            let peak = peak.clone();
            let runner = self.clone();
            let task_id = task.id.clone();

            let handle = set.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return TaskOutcome::Failed(TaskFailure::fatal("task queue closed"));
                };

                let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                let mut started = task.clone();
                started.state = TaskState::Running;
                runner.notify(&started);

                let work = AssertUnwindSafe(executor.execute(&task)).catch_unwind();
                let outcome = match runner.task_timeout {
                    Some(limit) => match tokio::time::timeout(limit, work).await {
                        Ok(result) => result,
                        Err(_) => Ok(Err(TaskFailure::transient(format!(
                            "task timed out after {}s",
                            limit.as_secs()
                        )))),
                    },
                    None => work.await,
                };

                running.fetch_sub(1, Ordering::SeqCst);

                match outcome {
                    Ok(Ok(output)) => TaskOutcome::Succeeded(output),
                    Ok(Err(failure)) => TaskOutcome::Failed(failure),
                    Err(panic) => TaskOutcome::Failed(TaskFailure::fatal(format!(
                        "task panicked: {}",
                        panic_message(panic.as_ref())
                    ))),
                }
            });
            ids_by_handle.insert(handle.id(), task_id);
        }

        let mut outcomes = BTreeMap::new();
        while let Some(joined) = set.join_next_with_id().await {
            let (handle_id, outcome) = match joined {
                Ok((id, outcome)) => (id, outcome),
                Err(e) => (
                    e.id(),
                    TaskOutcome::Failed(TaskFailure::fatal(format!("task aborted: {}", e))),
                ),
            };
            let Some(task_id) = ids_by_handle.remove(&handle_id) else {
                continue;
            };
            match &outcome {
                TaskOutcome::Succeeded(_) => tracing::debug!(task = %task_id, "Task succeeded"),
                TaskOutcome::Failed(f) => {
                    tracing::warn!(task = %task_id, transient = f.transient, error = %f.message, "Task failed")
                }
            }
            outcomes.insert(task_id, outcome);
        }

        let tasks: Vec<Task> = tasks
            .into_iter()
            .map(|mut task| {
                task.state = match outcomes.get(&task.id) {
                    Some(TaskOutcome::Succeeded(_)) => TaskState::Succeeded,
                    _ => TaskState::Failed,
                };
                self.notify(&task);
                task
            })
            .collect();

        TaskReport {
            tasks,
            outcomes,
            peak_running: peak.load(Ordering::SeqCst),
        }
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
