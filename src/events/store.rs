/// Event store - SQLite access for the `file_event` table
use crate::{
    db::{format_timestamp, parse_timestamp},
    error::{PipelineError, PipelineResult},
    events::{EventRecord, EventStatus, NewEvent, Operation},
};
use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, QueryBuilder, Row, Sqlite, SqliteConnection, SqlitePool};

const EVENT_COLUMNS: &str = "id, resource_root_id, operation, status, correlation_id, sequence, \
     created_at, claimed_at, completed_at, available_at, retry_count, max_retries, error_message";

/// Which pending records a supersession may replace
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupersedeScope {
    /// Any uncorrelated pending record touching the paths
    AllIntents,
    /// Only pending watcher syncs; used when the new record is itself a sync
    SyncOnly,
}

/// Persistence access for event records
#[derive(Clone)]
pub struct EventStore {
    db: SqlitePool,
}

impl EventStore {
    /// Create a new event store
    pub fn new(db: SqlitePool) -> Self {
        Self { db }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.db
    }

    /// Insert a single pending record
    pub async fn insert(&self, new: &NewEvent) -> PipelineResult<EventRecord> {
        let mut conn = self.db.acquire().await?;
        Self::insert_with(&mut conn, new, Utc::now()).await
    }

    /// Insert a pending record on an existing connection or transaction
    pub(crate) async fn insert_with(
        conn: &mut SqliteConnection,
        new: &NewEvent,
        now: DateTime<Utc>,
    ) -> PipelineResult<EventRecord> {
        let now = format_timestamp(now);
        let operation = serde_json::to_string(&new.operation)?;

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO file_event (
                resource_root_id, kind, operation, path, dest_path, status,
                correlation_id, sequence, created_at, available_at, retry_count, max_retries
            )
            VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, ?7, ?8, ?8, 0, ?9)
            RETURNING {}
            "#,
            EVENT_COLUMNS
        ))
        .bind(&new.resource_root_id)
        .bind(new.operation.kind())
        .bind(&operation)
        .bind(new.operation.path())
        .bind(new.operation.dest_path())
        .bind(&new.correlation_id)
        .bind(new.sequence)
        .bind(&now)
        .bind(new.max_retries)
        .fetch_one(&mut *conn)
        .await?;

        row_to_record(&row)
    }

    /// Supersede pending records that touch any of `paths`
    pub async fn supersede_pending(
        &self,
        resource_root_id: &str,
        paths: &[String],
        scope: SupersedeScope,
    ) -> PipelineResult<Vec<EventRecord>> {
        let mut conn = self.db.acquire().await?;
        Self::supersede_with(&mut conn, resource_root_id, paths, scope, Utc::now()).await
    }

    /// Supersession on an existing connection or transaction.
    ///
    /// Only `pending` rows match, so a record that has been claimed is never
    /// replaced mid-flight. Correlated rows are part of a multi-step intent and
    /// are left alone.
    pub(crate) async fn supersede_with(
        conn: &mut SqliteConnection,
        resource_root_id: &str,
        paths: &[String],
        scope: SupersedeScope,
        now: DateTime<Utc>,
    ) -> PipelineResult<Vec<EventRecord>> {
        if paths.is_empty() {
            return Ok(Vec::new());
        }

        let mut builder: QueryBuilder<Sqlite> =
            QueryBuilder::new("UPDATE file_event SET status = 'superseded', completed_at = ");
        builder.push_bind(format_timestamp(now));
        builder.push(" WHERE resource_root_id = ");
        builder.push_bind(resource_root_id.to_string());
        builder.push(" AND status = 'pending' AND correlation_id IS NULL AND (path IN (");
        push_path_list(&mut builder, paths);
        builder.push(") OR dest_path IN (");
        push_path_list(&mut builder, paths);
        builder.push("))");
        if scope == SupersedeScope::SyncOnly {
            builder.push(" AND kind = 'sync'");
        }
        builder.push(" RETURNING ");
        builder.push(EVENT_COLUMNS);

        let rows = builder.build().fetch_all(&mut *conn).await?;
        let mut records = rows
            .iter()
            .map(row_to_record)
            .collect::<PipelineResult<Vec<_>>>()?;
        records.sort_by_key(|record| record.id);

        Ok(records)
    }

    /// Atomically claim up to `limit` pending records for one root.
    ///
    /// A single `UPDATE ... RETURNING` selects and flips the rows, so two
    /// claimers can never both receive the same record. A candidate is skipped
    /// when:
    /// - it is still backing off (`available_at` in the future)
    /// - a `processing` record, or an older `pending` record that is itself
    ///   claimable by sequence, touches one of its paths (a gated record never
    ///   blocks, or groups inserted out of order would wait on each other)
    /// - a lower `sequence` of its correlation group is not yet terminal
    pub async fn claim(
        &self,
        resource_root_id: &str,
        limit: u32,
    ) -> PipelineResult<Vec<EventRecord>> {
        let now = format_timestamp(Utc::now());

        let rows = sqlx::query(&format!(
            r#"
            UPDATE file_event
            SET status = 'processing', claimed_at = ?1
            WHERE status = 'pending'
              AND id IN (
                SELECT c.id
                FROM file_event c
                WHERE c.resource_root_id = ?2
                  AND c.status = 'pending'
                  AND c.available_at <= ?1
                  AND NOT EXISTS (
                    SELECT 1 FROM file_event o
                    WHERE o.resource_root_id = c.resource_root_id
                      AND o.id <> c.id
                      AND (
                        o.status = 'processing'
                        OR (o.status = 'pending'
                            AND (o.created_at < c.created_at
                                 OR (o.created_at = c.created_at AND o.id < c.id))
                            AND NOT EXISTS (
                              SELECT 1 FROM file_event og
                              WHERE o.correlation_id IS NOT NULL
                                AND og.correlation_id = o.correlation_id
                                AND og.sequence < o.sequence
                                AND og.status IN ('pending', 'processing')
                            ))
                      )
                      AND (o.path IN (c.path, c.dest_path) OR o.dest_path IN (c.path, c.dest_path))
                  )
                  AND NOT EXISTS (
                    SELECT 1 FROM file_event g
                    WHERE c.correlation_id IS NOT NULL
                      AND g.correlation_id = c.correlation_id
                      AND g.sequence < c.sequence
                      AND g.status IN ('pending', 'processing')
                  )
                ORDER BY c.created_at ASC, c.id ASC
                LIMIT ?3
              )
            RETURNING {}
            "#,
            EVENT_COLUMNS
        ))
        .bind(&now)
        .bind(resource_root_id)
        .bind(limit as i64)
        .fetch_all(&self.db)
        .await?;

        // RETURNING order is unspecified
        let mut records = rows
            .iter()
            .map(row_to_record)
            .collect::<PipelineResult<Vec<_>>>()?;
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));

        Ok(records)
    }

    /// Mark a processing record completed
    pub async fn mark_completed(&self, id: i64) -> PipelineResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE file_event
            SET status = 'completed', completed_at = ?1, error_message = NULL
            WHERE id = ?2 AND status = 'processing'
            "#,
        )
        .bind(format_timestamp(Utc::now()))
        .bind(id)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Return a processing record to pending after a transient failure.
    ///
    /// Refuses once `retry_count` has reached `max_retries`; the caller must
    /// fail the record instead.
    pub async fn requeue(&self, id: i64, available_at: DateTime<Utc>) -> PipelineResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE file_event
            SET status = 'pending',
                retry_count = retry_count + 1,
                available_at = ?1,
                claimed_at = NULL
            WHERE id = ?2 AND status = 'processing' AND retry_count < max_retries
            "#,
        )
        .bind(format_timestamp(available_at))
        .bind(id)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Hand a root's processing records back to the queue without counting an attempt.
    ///
    /// Used by the root's own worker when it could not record an outcome.
    pub async fn release_processing(&self, resource_root_id: &str) -> PipelineResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE file_event
            SET status = 'pending', claimed_at = NULL
            WHERE resource_root_id = ?1 AND status = 'processing'
            "#,
        )
        .bind(resource_root_id)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected())
    }

    /// Mark a processing record failed
    pub async fn mark_failed(&self, id: i64, error_message: &str) -> PipelineResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE file_event
            SET status = 'failed', completed_at = ?1, error_message = ?2
            WHERE id = ?3 AND status = 'processing'
            "#,
        )
        .bind(format_timestamp(Utc::now()))
        .bind(error_message)
        .bind(id)
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Recover records a previous process left in `processing`.
    ///
    /// Treated as a transient failure: requeued while retries remain,
    /// failed otherwise.
    pub async fn recover_orphaned(&self, resource_root_id: &str) -> PipelineResult<Vec<EventRecord>> {
        let now = format_timestamp(Utc::now());

        let rows = sqlx::query(&format!(
            r#"
            UPDATE file_event
            SET status = CASE WHEN retry_count < max_retries THEN 'pending' ELSE 'failed' END,
                retry_count = CASE WHEN retry_count < max_retries THEN retry_count + 1 ELSE retry_count END,
                error_message = CASE WHEN retry_count < max_retries THEN NULL
                                     ELSE 'interrupted while processing' END,
                completed_at = CASE WHEN retry_count < max_retries THEN NULL ELSE ?1 END,
                available_at = ?1,
                claimed_at = NULL
            WHERE resource_root_id = ?2 AND status = 'processing'
            RETURNING {}
            "#,
            EVENT_COLUMNS
        ))
        .bind(&now)
        .bind(resource_root_id)
        .fetch_all(&self.db)
        .await?;

        rows.iter().map(row_to_record).collect()
    }

    /// Get a record by id
    pub async fn get(&self, id: i64) -> PipelineResult<Option<EventRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM file_event WHERE id = ?1",
            EVENT_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.db)
        .await?;

        row.as_ref().map(row_to_record).transpose()
    }

    /// All records of a correlation group in sequence order
    pub async fn list_by_correlation(&self, correlation_id: &str) -> PipelineResult<Vec<EventRecord>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {}
            FROM file_event
            WHERE correlation_id = ?1
            ORDER BY sequence ASC, id ASC
            "#,
            EVENT_COLUMNS
        ))
        .bind(correlation_id)
        .fetch_all(&self.db)
        .await?;

        rows.iter().map(row_to_record).collect()
    }

    /// Delete terminal records past their retention window.
    ///
    /// Superseded records share the completed window.
    pub async fn purge_terminal(
        &self,
        completed_before: DateTime<Utc>,
        failed_before: DateTime<Utc>,
    ) -> PipelineResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM file_event
            WHERE (status IN ('completed', 'superseded') AND completed_at < ?1)
               OR (status = 'failed' AND completed_at < ?2)
            "#,
        )
        .bind(format_timestamp(completed_before))
        .bind(format_timestamp(failed_before))
        .execute(&self.db)
        .await?;

        Ok(result.rows_affected())
    }
}

fn push_path_list(builder: &mut QueryBuilder<'_, Sqlite>, paths: &[String]) {
    let mut separated = builder.separated(", ");
    for path in paths {
        separated.push_bind(path.clone());
    }
}

fn parse_optional_timestamp(raw: Option<String>) -> PipelineResult<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_timestamp).transpose()
}

/// Convert database row to EventRecord
fn row_to_record(row: &SqliteRow) -> PipelineResult<EventRecord> {
    let status_raw: String = row.try_get("status")?;
    let status = EventStatus::parse(&status_raw)
        .ok_or_else(|| PipelineError::Internal(format!("Unknown event status: {}", status_raw)))?;
    let operation: Operation = serde_json::from_str(&row.try_get::<String, _>("operation")?)?;

    Ok(EventRecord {
        id: row.try_get("id")?,
        resource_root_id: row.try_get("resource_root_id")?,
        operation,
        status,
        correlation_id: row.try_get("correlation_id")?,
        sequence: row.try_get("sequence")?,
        created_at: parse_timestamp(&row.try_get::<String, _>("created_at")?)?,
        claimed_at: parse_optional_timestamp(row.try_get("claimed_at")?)?,
        completed_at: parse_optional_timestamp(row.try_get("completed_at")?)?,
        available_at: parse_timestamp(&row.try_get::<String, _>("available_at")?)?,
        retry_count: row.try_get("retry_count")?,
        max_retries: row.try_get("max_retries")?,
        error_message: row.try_get("error_message")?,
    })
}
