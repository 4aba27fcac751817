/// Background task implementations
use crate::{context::AppContext, db, error::PipelineResult};
use chrono::{Duration, Utc};

/// Delete completed/superseded and failed records past their retention windows
pub async fn purge_expired_events(ctx: &AppContext) -> PipelineResult<u64> {
    let now = Utc::now();
    let retention = &ctx.config.retention;

    let completed_before = now - Duration::seconds(retention.completed_retention_secs as i64);
    let failed_before = now - Duration::seconds(retention.failed_retention_secs as i64);

    ctx.event_store
        .purge_terminal(completed_before, failed_before)
        .await
}

/// Health check - verify the database answers
pub async fn health_check(ctx: &AppContext) -> PipelineResult<()> {
    db::test_connection(&ctx.db).await
}
