/// Publish and status endpoints
use crate::{
    context::AppContext,
    error::{PipelineError, PipelineResult},
    events::{EventSnapshot, Operation},
    handlers::paths,
    status::CorrelationStatus,
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Upper bound on any caller-requested wait
const MAX_WAIT_MS: u64 = 300_000;
const DEFAULT_WAIT_MS: u64 = 30_000;

/// Build event routes
pub fn routes() -> Router<AppContext> {
    Router::new()
        .route("/roots/:root_id/events", post(publish_event))
        .route("/roots/:root_id/batches", post(publish_batch))
        .route("/events/:id", get(get_event))
        .route("/events/:id/wait", get(wait_for_event))
        .route("/correlations/:id", get(get_correlation))
}

/// Request to publish one operation
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublishRequest {
    operation: Operation,
    #[serde(default)]
    correlation_id: Option<String>,
    #[serde(default)]
    sequence: i64,
    /// Block until the event is terminal, up to this many milliseconds
    #[serde(default)]
    wait_timeout_ms: Option<u64>,
}

/// Request to publish an ordered group
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublishBatchRequest {
    operations: Vec<Operation>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PublishBatchResponse {
    correlation_id: String,
    count: usize,
}

#[derive(Debug, Deserialize)]
struct WaitQuery {
    timeout_ms: Option<u64>,
}

fn validate_operation(operation: &Operation) -> PipelineResult<()> {
    for path in operation.affected_paths() {
        paths::validate_relative(&path)?;
    }
    Ok(())
}

async fn publish_event(
    State(ctx): State<AppContext>,
    Path(root_id): Path<String>,
    Json(req): Json<PublishRequest>,
) -> PipelineResult<(StatusCode, Json<EventSnapshot>)> {
    validate_operation(&req.operation)?;

    let record = ctx
        .publisher
        .publish(&root_id, req.operation, req.correlation_id, req.sequence)
        .await?;

    match req.wait_timeout_ms {
        Some(timeout_ms) => {
            let snapshot = ctx
                .status
                .wait_for(record.id, Duration::from_millis(timeout_ms.min(MAX_WAIT_MS)))
                .await?;
            Ok((StatusCode::OK, Json(snapshot)))
        }
        None => Ok((StatusCode::ACCEPTED, Json(EventSnapshot::from(record)))),
    }
}

async fn publish_batch(
    State(ctx): State<AppContext>,
    Path(root_id): Path<String>,
    Json(req): Json<PublishBatchRequest>,
) -> PipelineResult<(StatusCode, Json<PublishBatchResponse>)> {
    for operation in &req.operations {
        validate_operation(operation)?;
    }

    let count = req.operations.len();
    let correlation_id = ctx.publisher.publish_batch(&root_id, req.operations).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(PublishBatchResponse {
            correlation_id,
            count,
        }),
    ))
}

async fn get_event(
    State(ctx): State<AppContext>,
    Path(id): Path<i64>,
) -> PipelineResult<Json<EventSnapshot>> {
    Ok(Json(ctx.status.get(id).await?))
}

async fn wait_for_event(
    State(ctx): State<AppContext>,
    Path(id): Path<i64>,
    Query(query): Query<WaitQuery>,
) -> PipelineResult<Json<EventSnapshot>> {
    let timeout_ms = query.timeout_ms.unwrap_or(DEFAULT_WAIT_MS).min(MAX_WAIT_MS);
    Ok(Json(ctx.status.wait_for(id, Duration::from_millis(timeout_ms)).await?))
}

async fn get_correlation(
    State(ctx): State<AppContext>,
    Path(id): Path<String>,
) -> PipelineResult<Json<CorrelationStatus>> {
    if id.trim().is_empty() {
        return Err(PipelineError::Validation("Correlation id is required".to_string()));
    }
    Ok(Json(ctx.status.get_by_correlation(&id).await?))
}
