//! HTTP clients for the management API and for Crane.

use crate::error::ClientError;
use crate::repository::{repository_href, RepositoryCreate};
use crate::tasks::{CallReport, TaskReport, TaskState};
use reqwest::header::ACCEPT;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

pub type ClientResult<T> = std::result::Result<T, ClientError>;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const POLL_ATTEMPTS: u32 = 600;

async fn check(response: Response) -> ClientResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ClientError::Status {
        status: status.as_u16(),
        body,
    })
}

/// A client for the management REST API.
#[derive(Debug, Clone)]
pub struct ApiClient {
    base_url: String,
    http: Client,
}

impl ApiClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> ClientResult<T> {
        let response = check(self.http.get(self.url(path)).send().await?).await?;
        Ok(response.json().await?)
    }

    pub async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> ClientResult<T> {
        let response = check(self.http.post(self.url(path)).json(body).send().await?).await?;
        Ok(response.json().await?)
    }

    pub async fn put<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> ClientResult<T> {
        let response = check(self.http.put(self.url(path)).json(body).send().await?).await?;
        Ok(response.json().await?)
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> ClientResult<T> {
        let response = check(self.http.delete(self.url(path)).send().await?).await?;
        Ok(response.json().await?)
    }

    /// Creates a repository and returns its JSON representation.
    pub async fn create_repository(&self, body: &RepositoryCreate) -> ClientResult<Value> {
        self.post(crate::repository::REPOSITORY_PATH, body).await
    }

    pub async fn get_repository(&self, id: &str, details: bool) -> ClientResult<Value> {
        self.get(&format!("{}?details={details}", repository_href(id)))
            .await
    }

    /// Syncs a repository and waits for the sync task.
    pub async fn sync_repository(&self, id: &str) -> ClientResult<Vec<TaskReport>> {
        let report: CallReport = self
            .post(&format!("{}actions/sync/", repository_href(id)), &json!({}))
            .await?;
        self.poll_spawned_tasks(&report).await
    }

    /// Publishes a repository through one distributor and waits for the task.
    pub async fn publish_repository(
        &self,
        id: &str,
        distributor_id: &str,
    ) -> ClientResult<Vec<TaskReport>> {
        let report: CallReport = self
            .post(
                &format!("{}actions/publish/", repository_href(id)),
                &json!({"id": distributor_id}),
            )
            .await?;
        self.poll_spawned_tasks(&report).await
    }

    pub async fn delete_repository(&self, id: &str) -> ClientResult<Vec<TaskReport>> {
        let report: CallReport = self.delete(&repository_href(id)).await?;
        self.poll_spawned_tasks(&report).await
    }

    pub async fn search_units(&self, id: &str) -> ClientResult<Vec<Value>> {
        self.post(&format!("{}search/units/", repository_href(id)), &json!({}))
            .await
    }

    pub async fn orphan_counts(&self) -> ClientResult<Value> {
        self.get(crate::api::ORPHANS_PATH).await
    }

    pub async fn delete_orphans(&self) -> ClientResult<Vec<TaskReport>> {
        let report: CallReport = self.delete(crate::api::ORPHANS_PATH).await?;
        self.poll_spawned_tasks(&report).await
    }

    /// Waits for every task a call spawned, in order.
    pub async fn poll_spawned_tasks(&self, report: &CallReport) -> ClientResult<Vec<TaskReport>> {
        let mut reports = Vec::with_capacity(report.spawned_tasks.len());
        for task in &report.spawned_tasks {
            reports.push(self.poll_task(&task.href).await?);
        }
        Ok(reports)
    }

    /// Polls a task until it completes. A task that ends in error is
    /// returned as [`ClientError::TaskFailed`].
    pub async fn poll_task(&self, href: &str) -> ClientResult<TaskReport> {
        for _ in 0..POLL_ATTEMPTS {
            let report: TaskReport = self.get(href).await?;
            debug!("Task {} is {:?}", report.task_id, report.state);
            match report.state {
                TaskState::Finished => return Ok(report),
                TaskState::Error => {
                    return Err(ClientError::TaskFailed {
                        task_id: report.task_id,
                        error: report.error.unwrap_or(Value::Null),
                    })
                }
                TaskState::Waiting | TaskState::Running => tokio::time::sleep(POLL_INTERVAL).await,
            }
        }
        Err(ClientError::TaskTimeout {
            task_id: href.to_string(),
            attempts: POLL_ATTEMPTS,
        })
    }
}

/// A client for Crane.
#[derive(Debug, Clone)]
pub struct CraneClient {
    base_url: String,
    http: Client,
}

impl CraneClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http: Client::new(),
        }
    }

    /// The repository listing for one registry API version, `"v1"` or
    /// `"v2"`.
    pub async fn repositories(&self, version: &str) -> ClientResult<Value> {
        let url = format!("{}/crane/repositories/{version}", self.base_url);
        let response = check(self.http.get(url).send().await?).await?;
        Ok(response.json().await?)
    }

    /// Fetches a manifest without checking the status, so callers can assert
    /// on 404s and headers. `accept` of `None` sends no `Accept` header.
    pub async fn get_manifest(
        &self,
        name: &str,
        reference: &str,
        accept: Option<&str>,
    ) -> ClientResult<Response> {
        let url = format!("{}/v2/{name}/manifests/{reference}", self.base_url);
        let mut request = self.http.get(url);
        if let Some(accept) = accept {
            request = request.header(ACCEPT, accept);
        }
        Ok(request.send().await?)
    }

    pub async fn get_blob(&self, name: &str, digest: &str) -> ClientResult<Response> {
        let url = format!("{}/v2/{name}/blobs/{digest}", self.base_url);
        Ok(self.http.get(url).send().await?)
    }

    pub async fn tags(&self, name: &str) -> ClientResult<Value> {
        let url = format!("{}/v2/{name}/tags/list", self.base_url);
        let response = check(self.http.get(url).send().await?).await?;
        Ok(response.json().await?)
    }
}
