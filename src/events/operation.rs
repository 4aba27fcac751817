/// Operation definitions for the event queue
use serde::{Deserialize, Serialize};

/// One unit of work against a resource root.
///
/// Paths are relative to the root, `/`-separated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Operation {
    #[serde(rename_all = "camelCase")]
    Create {
        path: String,
        content: String,
        #[serde(default)]
        metadata: serde_json::Value,
    },
    #[serde(rename_all = "camelCase")]
    Update {
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<serde_json::Value>,
    },
    #[serde(rename_all = "camelCase")]
    Move {
        source_path: String,
        dest_path: String,
        #[serde(default)]
        is_directory: bool,
    },
    #[serde(rename_all = "camelCase")]
    Delete {
        path: String,
        #[serde(default)]
        is_directory: bool,
    },
    /// Produced only by the change watcher
    #[serde(rename_all = "camelCase")]
    Sync {
        path: String,
        external_event_kind: ExternalChangeKind,
    },
}

/// Kind of change observed by the filesystem watcher
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ExternalChangeKind {
    Created,
    Modified,
    Removed,
}

impl Operation {
    pub fn kind(&self) -> &'static str {
        match self {
            Operation::Create { .. } => "create",
            Operation::Update { .. } => "update",
            Operation::Move { .. } => "move",
            Operation::Delete { .. } => "delete",
            Operation::Sync { .. } => "sync",
        }
    }

    /// Primary path this operation acts on (source path for moves)
    pub fn path(&self) -> &str {
        match self {
            Operation::Create { path, .. }
            | Operation::Update { path, .. }
            | Operation::Delete { path, .. }
            | Operation::Sync { path, .. } => path,
            Operation::Move { source_path, .. } => source_path,
        }
    }

    /// Secondary path, only set for moves
    pub fn dest_path(&self) -> Option<&str> {
        match self {
            Operation::Move { dest_path, .. } => Some(dest_path),
            _ => None,
        }
    }

    /// Every path this operation can touch
    pub fn affected_paths(&self) -> Vec<String> {
        let mut paths = vec![self.path().to_string()];
        if let Some(dest) = self.dest_path() {
            paths.push(dest.to_string());
        }
        paths
    }

    pub fn is_sync(&self) -> bool {
        matches!(self, Operation::Sync { .. })
    }

    /// Fold a newer update into a create it supersedes.
    ///
    /// A pending create that gets superseded never touches disk, so the update
    /// that replaced it has to carry the create's intent or it would fail on a
    /// missing metadata record.
    pub fn absorb_superseded(self, superseded: &Operation) -> Operation {
        match (self, superseded) {
            (
                Operation::Update {
                    path,
                    content,
                    metadata,
                },
                Operation::Create {
                    path: created_path,
                    content: created_content,
                    metadata: created_metadata,
                },
            ) if path == *created_path => Operation::Create {
                path,
                content: content.unwrap_or_else(|| created_content.clone()),
                metadata: metadata.unwrap_or_else(|| created_metadata.clone()),
            },
            (operation, _) => operation,
        }
    }
}
