//! Asynchronous tasks and the reports clients poll.

use crate::error::{Result, ServerError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{RwLock, Semaphore};
use tracing::{debug, info, warn};

pub const TASKS_PATH: &str = "/pulp/api/v2/tasks/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Waiting,
    Running,
    Finished,
    Error,
}

impl TaskState {
    pub fn is_complete(self) -> bool {
        matches!(self, TaskState::Finished | TaskState::Error)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpawnedTask {
    #[serde(rename = "_href")]
    pub href: String,
    pub task_id: String,
}

/// The body of a `202 Accepted` response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallReport {
    pub spawned_tasks: Vec<SpawnedTask>,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<serde_json::Value>,
}

impl From<SpawnedTask> for CallReport {
    fn from(task: SpawnedTask) -> Self {
        Self {
            spawned_tasks: vec![task],
            result: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskReport {
    #[serde(rename = "_href")]
    pub href: String,
    pub task_id: String,
    pub task_type: String,
    pub tags: Vec<String>,
    pub state: TaskState,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<serde_json::Value>,
}

pub struct TaskManager {
    tasks: Arc<RwLock<HashMap<String, TaskReport>>>,
    workers: Arc<Semaphore>,
}

impl TaskManager {
    pub fn new(concurrency: usize) -> Self {
        Self {
            tasks: Arc::default(),
            workers: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    /// Queues `work` and returns immediately. The task waits for a free
    /// worker slot, then runs to completion.
    pub async fn spawn<F>(&self, task_type: &str, tags: Vec<String>, work: F) -> SpawnedTask
    where
        F: Future<Output = Result<serde_json::Value>> + Send + 'static,
    {
        let task_id = uuid::Uuid::new_v4().to_string();
        let spawned = SpawnedTask {
            href: format!("{TASKS_PATH}{task_id}/"),
            task_id: task_id.clone(),
        };
        let report = TaskReport {
            href: spawned.href.clone(),
            task_id: task_id.clone(),
            task_type: task_type.to_string(),
            tags,
            state: TaskState::Waiting,
            result: None,
            error: None,
        };
        self.tasks.write().await.insert(task_id.clone(), report);
        debug!("Queued task {} ({})", task_id, task_type);

        let tasks = Arc::clone(&self.tasks);
        let workers = Arc::clone(&self.workers);
        tokio::spawn(async move {
            let _permit = match workers.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            set_state(&tasks, &task_id, |r| r.state = TaskState::Running).await;

            match work.await {
                Ok(result) => {
                    info!("Task {} finished", task_id);
                    set_state(&tasks, &task_id, |r| {
                        r.state = TaskState::Finished;
                        r.result = Some(result);
                    })
                    .await;
                }
                Err(e) => {
                    warn!("Task {} failed: {}", task_id, e);
                    set_state(&tasks, &task_id, |r| {
                        r.state = TaskState::Error;
                        r.error = Some(e.to_report());
                    })
                    .await;
                }
            }
        });

        spawned
    }

    pub async fn get(&self, task_id: &str) -> Result<TaskReport> {
        self.tasks
            .read()
            .await
            .get(task_id)
            .cloned()
            .ok_or_else(|| ServerError::TaskNotFound(task_id.to_string()))
    }
}

async fn set_state(
    tasks: &RwLock<HashMap<String, TaskReport>>,
    task_id: &str,
    update: impl FnOnce(&mut TaskReport),
) {
    if let Some(report) = tasks.write().await.get_mut(task_id) {
        update(report);
    }
}
