/// Event worker - one claim/dispatch loop per resource root
///
/// Claims pending records, runs them through the root's executor, records
/// the outcome and stages touched paths on the root's commit batcher.

pub mod backoff;

use crate::{
    config::QueueConfig,
    error::PipelineResult,
    events::{EventRecord, EventStatus, EventStore},
    handlers::OperationExecutor,
    metrics,
    vcs::CommitBatcher,
};
use chrono::Utc;
use std::{sync::Arc, time::Duration};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Tuning for one worker loop
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub claim_batch_size: u32,
    pub poll_interval: Duration,
    pub retry_backoff_cap: Duration,
}

impl From<&QueueConfig> for WorkerSettings {
    fn from(config: &QueueConfig) -> Self {
        Self {
            claim_batch_size: config.claim_batch_size,
            poll_interval: config.poll_interval(),
            retry_backoff_cap: config.retry_backoff_cap(),
        }
    }
}

/// What happened in one claim/dispatch round
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoundSummary {
    pub claimed: usize,
    pub completed: usize,
    pub retried: usize,
    pub failed: usize,
}

pub struct EventWorker {
    resource_root_id: String,
    store: EventStore,
    executor: Arc<dyn OperationExecutor>,
    batcher: CommitBatcher,
    settings: WorkerSettings,
    /// Claimed records may still be `processing` after a failed store write
    stranded: bool,
}

impl EventWorker {
    pub fn new(
        resource_root_id: impl Into<String>,
        store: EventStore,
        executor: Arc<dyn OperationExecutor>,
        batcher: CommitBatcher,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            resource_root_id: resource_root_id.into(),
            store,
            executor,
            batcher,
            settings,
            stranded: false,
        }
    }

    pub fn resource_root_id(&self) -> &str {
        &self.resource_root_id
    }

    pub fn batcher(&self) -> &CommitBatcher {
        &self.batcher
    }

    /// Return records a previous process left in `processing` to the queue
    pub async fn recover(&self) -> PipelineResult<usize> {
        let recovered = self.store.recover_orphaned(&self.resource_root_id).await?;

        for record in &recovered {
            if record.status == EventStatus::Failed {
                metrics::record_event_finished(&self.resource_root_id, EventStatus::Failed.as_str());
                warn!(
                    root = %self.resource_root_id,
                    event_id = record.id,
                    "Interrupted event has no retries left, marked failed"
                );
            } else {
                info!(
                    root = %self.resource_root_id,
                    event_id = record.id,
                    retry_count = record.retry_count,
                    "Requeued interrupted event"
                );
            }
        }

        Ok(recovered.len())
    }

    /// Run one claim/dispatch round, flushing whenever the batcher is due
    ///
    /// If an outcome cannot be written, the round stops and every record it
    /// still holds goes back to `pending` before the error is returned.
    pub async fn run_once(&mut self) -> PipelineResult<RoundSummary> {
        if self.stranded {
            self.release_stranded().await?;
        }

        let records = self
            .store
            .claim(&self.resource_root_id, self.settings.claim_batch_size)
            .await?;

        let mut summary = RoundSummary {
            claimed: records.len(),
            ..RoundSummary::default()
        };

        for record in records {
            let event_id = record.id;
            match self.dispatch(record).await {
                Ok(EventStatus::Completed) => summary.completed += 1,
                Ok(EventStatus::Pending) => summary.retried += 1,
                Ok(_) => summary.failed += 1,
                Err(e) => {
                    error!(
                        root = %self.resource_root_id,
                        event_id,
                        "Failed to record event outcome, releasing claimed events: {}",
                        e
                    );
                    self.stranded = true;
                    self.release_stranded().await?;
                    return Err(e);
                }
            }

            if self.batcher.should_commit() {
                self.flush().await;
            }
        }

        if self.batcher.should_commit() {
            self.flush().await;
        }

        Ok(summary)
    }

    async fn release_stranded(&mut self) -> PipelineResult<()> {
        let released = self.store.release_processing(&self.resource_root_id).await?;
        self.stranded = false;
        if released > 0 {
            warn!(root = %self.resource_root_id, released, "Returned claimed events to the queue");
        }
        Ok(())
    }

    /// Execute one claimed record and persist its outcome. Returns the new status.
    async fn dispatch(&mut self, record: EventRecord) -> PipelineResult<EventStatus> {
        debug!(
            root = %self.resource_root_id,
            event_id = record.id,
            kind = record.operation.kind(),
            path = %record.operation.path(),
            "Dispatching event"
        );

        let error = match self.executor.execute(&record.operation).await {
            Ok(paths) => {
                // Staged first: the change is on disk even if recording it fails
                self.batcher.stage(paths);
                if !self.store.mark_completed(record.id).await? {
                    warn!(event_id = record.id, "Event left processing before completion was recorded");
                }
                metrics::record_event_finished(&self.resource_root_id, EventStatus::Completed.as_str());
                return Ok(EventStatus::Completed);
            }
            Err(e) => e,
        };

        if error.is_transient() && record.retry_count < record.max_retries {
            let delay = backoff::retry_delay(record.retry_count, self.settings.retry_backoff_cap);
            let available_at = Utc::now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());

            if self.store.requeue(record.id, available_at).await? {
                metrics::EVENT_RETRIES_TOTAL
                    .with_label_values(&[&self.resource_root_id])
                    .inc();
                warn!(
                    root = %self.resource_root_id,
                    event_id = record.id,
                    attempt = record.retry_count + 1,
                    retry_in_ms = delay.as_millis() as u64,
                    "Transient failure, event requeued: {}",
                    error
                );
                return Ok(EventStatus::Pending);
            }
        }

        let message = error.to_string();
        self.store.mark_failed(record.id, &message).await?;
        metrics::record_event_finished(&self.resource_root_id, EventStatus::Failed.as_str());
        error!(
            root = %self.resource_root_id,
            event_id = record.id,
            transient = error.is_transient(),
            retry_count = record.retry_count,
            "Event failed: {}",
            message
        );

        Ok(EventStatus::Failed)
    }

    /// Flush the batcher. Failures stay staged and are retried by the batcher's own backoff.
    pub async fn flush(&mut self) {
        if let Err(e) = self.batcher.flush().await {
            error!(root = %self.resource_root_id, "Commit failed: {}", e);
        }
    }

    /// Loop until `shutdown` flips to true or its sender is dropped.
    ///
    /// The in-flight round always finishes; pending paths get a final flush.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(root = %self.resource_root_id, "Event worker started");

        if let Err(e) = self.recover().await {
            error!(root = %self.resource_root_id, "Failed to recover interrupted events: {}", e);
        }

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.run_once().await {
                Ok(summary) if summary.claimed > 0 => continue,
                Ok(_) => {}
                Err(e) => error!(root = %self.resource_root_id, "Worker round failed: {}", e),
            }

            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
            }
        }

        if self.batcher.pending_len() > 0 {
            info!(
                root = %self.resource_root_id,
                files = self.batcher.pending_len(),
                "Flushing staged paths before shutdown"
            );
            self.flush().await;
        }

        info!(root = %self.resource_root_id, "Event worker stopped");
    }
}
