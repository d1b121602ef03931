//! The repository management REST API.

use crate::error::{Result, ServerError};
use crate::manager::ContentManager;
use crate::repository::{RepositoryCreate, RepositoryUpdate};
use crate::tasks::{CallReport, TaskManager};
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

pub const ORPHANS_PATH: &str = "/pulp/api/v2/content/orphans/";

const BODY_LIMIT: usize = 1024 * 1024;

#[derive(Clone)]
struct AppState {
    manager: Arc<ContentManager>,
    tasks: Arc<TaskManager>,
}

#[derive(Deserialize)]
struct DetailsParams {
    #[serde(default)]
    details: bool,
}

#[derive(Deserialize)]
struct PublishBody {
    id: String,
}

pub fn router(manager: Arc<ContentManager>, tasks: Arc<TaskManager>) -> Router {
    Router::new()
        .route(
            "/pulp/api/v2/repositories/",
            get(list_repositories).post(create_repository),
        )
        .route(
            "/pulp/api/v2/repositories/{id}/",
            get(get_repository)
                .put(update_repository)
                .delete(delete_repository),
        )
        .route("/pulp/api/v2/repositories/{id}/actions/sync/", post(sync_repository))
        .route(
            "/pulp/api/v2/repositories/{id}/actions/publish/",
            post(publish_repository),
        )
        .route("/pulp/api/v2/repositories/{id}/search/units/", post(search_units))
        .route(
            "/pulp/api/v2/content/orphans/",
            get(orphan_counts).delete(delete_orphans),
        )
        .route("/pulp/api/v2/tasks/{id}/", get(get_task))
        .layer(
            tower::ServiceBuilder::new()
                .layer(axum::extract::DefaultBodyLimit::max(BODY_LIMIT))
                .layer(TraceLayer::new_for_http()),
        )
        .with_state(AppState { manager, tasks })
}

fn accepted(report: CallReport) -> Response {
    (StatusCode::ACCEPTED, Json(report)).into_response()
}

async fn list_repositories(
    State(state): State<AppState>,
    Query(params): Query<DetailsParams>,
) -> Json<Vec<Value>> {
    let repositories = state.manager.repositories().list().await;
    Json(
        repositories
            .iter()
            .map(|r| r.to_json(params.details))
            .collect(),
    )
}

async fn create_repository(State(state): State<AppState>, body: Bytes) -> Result<Response> {
    let body: RepositoryCreate = serde_json::from_slice(&body)
        .map_err(|e| ServerError::InvalidInput(format!("malformed repository: {e}")))?;
    info!("Creating repository: {}", body.id);
    let repository = state.manager.repositories().create(body).await?;
    Ok((StatusCode::CREATED, Json(repository.to_json(false))).into_response())
}

async fn get_repository(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<DetailsParams>,
) -> Result<Json<Value>> {
    let repository = state.manager.repositories().get(&id).await?;
    Ok(Json(repository.to_json(params.details)))
}

async fn update_repository(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<RepositoryUpdate>,
) -> Result<Json<Value>> {
    info!("Updating repository: {}", id);
    let repository = state.manager.repositories().update(&id, body).await?;
    Ok(Json(json!({
        "result": repository.to_json(true),
        "error": null,
        "spawned_tasks": [],
    })))
}

async fn delete_repository(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response> {
    state.manager.repositories().get(&id).await?;
    info!("Deleting repository: {}", id);

    let manager = Arc::clone(&state.manager);
    let tags = vec![format!("pulp:repository:{id}"), "pulp:action:delete".to_string()];
    let task = state
        .tasks
        .spawn("repository.delete", tags, async move {
            manager.delete_repository(&id).await?;
            Ok::<_, ServerError>(Value::Null)
        })
        .await;
    Ok(accepted(task.into()))
}

async fn sync_repository(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response> {
    state.manager.repositories().get(&id).await?;
    info!("Syncing repository: {}", id);

    let manager = Arc::clone(&state.manager);
    let tags = vec![format!("pulp:repository:{id}"), "pulp:action:sync".to_string()];
    let task = state
        .tasks
        .spawn("repository.sync", tags, async move {
            manager.sync_repository(&id).await
        })
        .await;
    Ok(accepted(task.into()))
}

async fn publish_repository(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<PublishBody>,
) -> Result<Response> {
    state
        .manager
        .repositories()
        .get(&id)
        .await?
        .distributor(&body.id)?;
    info!("Publishing repository: {} via {}", id, body.id);

    let manager = Arc::clone(&state.manager);
    let tags = vec![format!("pulp:repository:{id}"), "pulp:action:publish".to_string()];
    let task = state
        .tasks
        .spawn("repository.publish", tags, async move {
            let published = manager.publish_repository(&id, &body.id).await?;
            Ok::<_, ServerError>(json!({
                "repo_registry_id": published.repo_registry_id,
                "tags": published.tags.len(),
            }))
        })
        .await;
    Ok(accepted(task.into()))
}

async fn search_units(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Vec<Value>>> {
    let repository = state.manager.repositories().get(&id).await?;
    Ok(Json(repository.content.units()))
}

async fn orphan_counts(State(state): State<AppState>) -> Result<Json<Value>> {
    let counts = state.manager.orphan_counts().await?;
    Ok(Json(serde_json::to_value(counts)?))
}

async fn delete_orphans(State(state): State<AppState>) -> Response {
    info!("Deleting orphans");
    let manager = Arc::clone(&state.manager);
    let tags = vec!["pulp:content_unit:orphans".to_string()];
    let task = state
        .tasks
        .spawn("content.orphan.delete", tags, async move {
            let report = manager.delete_orphans().await?;
            Ok::<_, ServerError>(serde_json::to_value(report)?)
        })
        .await;
    accepted(task.into())
}

async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    let report = state.tasks.get(&id).await?;
    Ok(Json(serde_json::to_value(report)?))
}
