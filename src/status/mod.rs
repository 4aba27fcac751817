/// Status queries - observe event records without touching the queue
use crate::{
    error::{PipelineError, PipelineResult},
    events::{EventSnapshot, EventStatus, EventStore},
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// A correlation group with aggregate counts
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CorrelationStatus {
    pub correlation_id: String,
    pub events: Vec<EventSnapshot>,
    pub completed: usize,
    pub failed: usize,
    pub superseded: usize,
    pub total: usize,
}

impl CorrelationStatus {
    /// Every record has reached a terminal status
    pub fn is_finished(&self) -> bool {
        self.events.iter().all(|event| event.status.is_terminal())
    }
}

#[derive(Clone)]
pub struct StatusQuery {
    store: EventStore,
    poll_interval: Duration,
}

impl StatusQuery {
    pub fn new(store: EventStore, poll_interval: Duration) -> Self {
        Self {
            store,
            poll_interval,
        }
    }

    pub async fn get(&self, event_id: i64) -> PipelineResult<EventSnapshot> {
        self.store
            .get(event_id)
            .await?
            .map(EventSnapshot::from)
            .ok_or_else(|| PipelineError::NotFound(format!("Event {} not found", event_id)))
    }

    pub async fn get_by_correlation(&self, correlation_id: &str) -> PipelineResult<CorrelationStatus> {
        let records = self.store.list_by_correlation(correlation_id).await?;
        if records.is_empty() {
            return Err(PipelineError::NotFound(format!(
                "Correlation {} not found",
                correlation_id
            )));
        }

        let events: Vec<EventSnapshot> = records.iter().map(EventSnapshot::from).collect();
        let count = |status: EventStatus| events.iter().filter(|e| e.status == status).count();

        Ok(CorrelationStatus {
            correlation_id: correlation_id.to_string(),
            completed: count(EventStatus::Completed),
            failed: count(EventStatus::Failed),
            superseded: count(EventStatus::Superseded),
            total: events.len(),
            events,
        })
    }

    /// Poll until the event is terminal or `timeout` passes
    pub async fn wait_for(&self, event_id: i64, timeout: Duration) -> PipelineResult<EventSnapshot> {
        let started = Instant::now();
        let deadline = started + timeout;

        loop {
            let snapshot = self.get(event_id).await?;
            if snapshot.status.is_terminal() {
                return Ok(snapshot);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(PipelineError::WaitTimeout {
                    event_id,
                    waited_ms: started.elapsed().as_millis() as u64,
                });
            }
            tokio::time::sleep(self.poll_interval.min(deadline - now)).await;
        }
    }
}
