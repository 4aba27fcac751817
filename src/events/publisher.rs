/// Event publisher - the only entry point that creates event records
use crate::{
    error::{PipelineError, PipelineResult},
    events::{
        store::{EventStore, SupersedeScope},
        EventRecord, NewEvent, Operation,
    },
    metrics,
};
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Publishes operations as pending event records.
///
/// Returns as soon as the insert commits; execution happens on the root's
/// worker and is observed through the status surface.
#[derive(Clone)]
pub struct EventPublisher {
    store: EventStore,
    max_retries: i64,
    known_roots: Option<Arc<Vec<String>>>,
}

impl EventPublisher {
    /// Create a new publisher
    pub fn new(store: EventStore, max_retries: u32) -> Self {
        Self {
            store,
            max_retries: max_retries as i64,
            known_roots: None,
        }
    }

    /// Reject publishes for roots nobody is working on
    pub fn with_known_roots(mut self, roots: Vec<String>) -> Self {
        self.known_roots = Some(Arc::new(roots));
        self
    }

    fn check_root(&self, resource_root_id: &str) -> PipelineResult<()> {
        match &self.known_roots {
            Some(roots) if !roots.iter().any(|root| root == resource_root_id) => Err(
                PipelineError::NotFound(format!("Unknown resource root: {}", resource_root_id)),
            ),
            _ => Ok(()),
        }
    }

    /// Publish a single operation.
    ///
    /// Without a correlation id, older pending records for the same paths are
    /// superseded in the same transaction. A sync only replaces older syncs.
    pub async fn publish(
        &self,
        resource_root_id: &str,
        operation: Operation,
        correlation_id: Option<String>,
        sequence: i64,
    ) -> PipelineResult<EventRecord> {
        self.check_root(resource_root_id)?;

        let now = Utc::now();
        let mut tx = self.store.pool().begin().await?;

        let mut operation = operation;
        let mut superseded = Vec::new();
        if correlation_id.is_none() {
            let scope = if operation.is_sync() {
                SupersedeScope::SyncOnly
            } else {
                SupersedeScope::AllIntents
            };
            superseded = EventStore::supersede_with(
                &mut *tx,
                resource_root_id,
                &operation.affected_paths(),
                scope,
                now,
            )
            .await?;

            for old in &superseded {
                operation = operation.absorb_superseded(&old.operation);
            }
        }

        let record = EventStore::insert_with(
            &mut *tx,
            &NewEvent {
                resource_root_id: resource_root_id.to_string(),
                operation,
                correlation_id,
                sequence,
                max_retries: self.max_retries,
            },
            now,
        )
        .await?;

        tx.commit().await?;

        metrics::EVENTS_PUBLISHED_TOTAL
            .with_label_values(&[record.operation.kind()])
            .inc();
        for old in &superseded {
            metrics::EVENTS_SUPERSEDED_TOTAL.inc();
            info!(
                root = %resource_root_id,
                event_id = old.id,
                superseded_by = record.id,
                path = %old.operation.path(),
                "Superseded pending event"
            );
        }
        debug!(
            root = %resource_root_id,
            event_id = record.id,
            kind = record.operation.kind(),
            path = %record.operation.path(),
            "Published event"
        );

        Ok(record)
    }

    /// Publish an ordered group of operations under one fresh correlation id.
    ///
    /// Records get `sequence = 0..n-1` and are inserted in one transaction, so
    /// the worker never sees a partial group.
    pub async fn publish_batch(
        &self,
        resource_root_id: &str,
        operations: Vec<Operation>,
    ) -> PipelineResult<String> {
        self.check_root(resource_root_id)?;

        if operations.is_empty() {
            return Err(PipelineError::Validation(
                "Batch must contain at least one operation".to_string(),
            ));
        }

        let correlation_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let count = operations.len();

        let mut tx = self.store.pool().begin().await?;
        for (sequence, operation) in operations.into_iter().enumerate() {
            let kind = operation.kind();
            EventStore::insert_with(
                &mut *tx,
                &NewEvent {
                    resource_root_id: resource_root_id.to_string(),
                    operation,
                    correlation_id: Some(correlation_id.clone()),
                    sequence: sequence as i64,
                    max_retries: self.max_retries,
                },
                now,
            )
            .await?;
            metrics::EVENTS_PUBLISHED_TOTAL.with_label_values(&[kind]).inc();
        }
        tx.commit().await?;

        info!(
            root = %resource_root_id,
            correlation_id = %correlation_id,
            count,
            "Published event batch"
        );

        Ok(correlation_id)
    }

    /// Supersede pending records for `paths` without publishing anything new
    pub async fn supersede_pending(
        &self,
        resource_root_id: &str,
        paths: &[String],
    ) -> PipelineResult<usize> {
        let superseded = self
            .store
            .supersede_pending(resource_root_id, paths, SupersedeScope::AllIntents)
            .await?;

        for old in &superseded {
            metrics::EVENTS_SUPERSEDED_TOTAL.inc();
            info!(
                root = %resource_root_id,
                event_id = old.id,
                path = %old.operation.path(),
                "Superseded pending event"
            );
        }

        Ok(superseded.len())
    }
}
