/// Event queue - persisted file operations and their lifecycle
///
/// Every write request becomes an `EventRecord` in the `file_event` table.
/// Records move `pending -> processing -> completed | failed`, or
/// `pending -> superseded` when a newer intent for the same path arrives.

pub mod operation;
pub mod publisher;
pub mod store;

pub use operation::{ExternalChangeKind, Operation};
pub use publisher::EventPublisher;
pub use store::EventStore;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle status of an event record
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Superseded,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "pending",
            EventStatus::Processing => "processing",
            EventStatus::Completed => "completed",
            EventStatus::Failed => "failed",
            EventStatus::Superseded => "superseded",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(EventStatus::Pending),
            "processing" => Some(EventStatus::Processing),
            "completed" => Some(EventStatus::Completed),
            "failed" => Some(EventStatus::Failed),
            "superseded" => Some(EventStatus::Superseded),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventStatus::Completed | EventStatus::Failed | EventStatus::Superseded
        )
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted operation with its lifecycle bookkeeping
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub id: i64,
    pub resource_root_id: String,
    pub operation: Operation,
    pub status: EventStatus,
    pub correlation_id: Option<String>,
    /// Order within a correlation group; meaningless without `correlation_id`
    pub sequence: i64,
    pub created_at: DateTime<Utc>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Earliest time the record may be claimed (retry backoff)
    pub available_at: DateTime<Utc>,
    pub retry_count: i64,
    pub max_retries: i64,
    pub error_message: Option<String>,
}

/// Parameters for inserting a new pending record
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub resource_root_id: String,
    pub operation: Operation,
    pub correlation_id: Option<String>,
    pub sequence: i64,
    pub max_retries: i64,
}

/// Externally visible shape of an event record (operation payload omitted)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EventSnapshot {
    pub id: i64,
    pub resource_root_id: String,
    pub status: EventStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub sequence: i64,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub retry_count: i64,
}

impl From<&EventRecord> for EventSnapshot {
    fn from(record: &EventRecord) -> Self {
        Self {
            id: record.id,
            resource_root_id: record.resource_root_id.clone(),
            status: record.status,
            correlation_id: record.correlation_id.clone(),
            sequence: record.sequence,
            created_at: record.created_at,
            completed_at: record.completed_at,
            error_message: record.error_message.clone(),
            retry_count: record.retry_count,
        }
    }
}

impl From<EventRecord> for EventSnapshot {
    fn from(record: EventRecord) -> Self {
        EventSnapshot::from(&record)
    }
}
