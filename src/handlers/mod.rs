/// Operation handlers - apply one operation to the filesystem and metadata store
///
/// Each handler returns the root-relative paths it touched so the worker can
/// stage them for the next commit. Handlers are safe to re-run after a
/// transient failure.

pub mod paths;

use crate::{
    error::PipelineError,
    events::{ExternalChangeKind, Operation},
    metadata::{content_hash, MetadataStore},
    watcher::RecentWrites,
};
use async_trait::async_trait;
use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};
use thiserror::Error;
use tokio::fs;
use tracing::debug;

/// Handler failure, classified by whether a retry can succeed
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("{0}")]
    Transient(PipelineError),

    #[error("{0}")]
    Permanent(PipelineError),
}

impl HandlerError {
    pub fn is_transient(&self) -> bool {
        matches!(self, HandlerError::Transient(_))
    }

    pub fn into_inner(self) -> PipelineError {
        match self {
            HandlerError::Transient(e) | HandlerError::Permanent(e) => e,
        }
    }
}

impl From<PipelineError> for HandlerError {
    fn from(err: PipelineError) -> Self {
        if is_transient(&err) {
            HandlerError::Transient(err)
        } else {
            HandlerError::Permanent(err)
        }
    }
}

impl From<std::io::Error> for HandlerError {
    fn from(err: std::io::Error) -> Self {
        PipelineError::Io(err).into()
    }
}

fn is_transient(err: &PipelineError) -> bool {
    match err {
        PipelineError::LockTimeout(_) | PipelineError::Vcs { .. } => true,
        PipelineError::Io(e) => !matches!(
            e.kind(),
            ErrorKind::PermissionDenied
                | ErrorKind::InvalidInput
                | ErrorKind::InvalidData
                | ErrorKind::AlreadyExists
        ),
        PipelineError::Database(e) => !matches!(
            e,
            sqlx::Error::RowNotFound
                | sqlx::Error::ColumnNotFound(_)
                | sqlx::Error::ColumnDecode { .. }
                | sqlx::Error::Decode(_)
                | sqlx::Error::TypeNotFound { .. }
        ),
        _ => false,
    }
}

pub type HandlerResult<T> = Result<T, HandlerError>;

/// Executes operations for one resource root
#[async_trait]
pub trait OperationExecutor: Send + Sync {
    /// Apply `operation`, returning the root-relative paths it touched
    async fn execute(&self, operation: &Operation) -> HandlerResult<Vec<String>>;
}

/// Filesystem + metadata implementation of `OperationExecutor`
#[derive(Clone)]
pub struct OperationHandlers {
    resource_root_id: String,
    root: PathBuf,
    metadata: MetadataStore,
    recent_writes: Option<Arc<RecentWrites>>,
}

impl OperationHandlers {
    pub fn new(resource_root_id: impl Into<String>, root: impl Into<PathBuf>, metadata: MetadataStore) -> Self {
        Self {
            resource_root_id: resource_root_id.into(),
            root: root.into(),
            metadata,
            recent_writes: None,
        }
    }

    /// Mark every successful disk write so the watcher can ignore it
    pub fn with_recent_writes(mut self, recent_writes: Arc<RecentWrites>) -> Self {
        self.recent_writes = Some(recent_writes);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn create(
        &self,
        path: &str,
        content: &str,
        metadata: &serde_json::Value,
    ) -> HandlerResult<Vec<String>> {
        let target = paths::resolve(&self.root, path)?;
        self.create_parents(&target).await?;
        fs::write(&target, content).await?;
        self.mark_written(&[path]);

        self.metadata
            .upsert(
                &self.resource_root_id,
                path,
                &content_hash(content.as_bytes()),
                content.len() as i64,
                Some(metadata),
            )
            .await?;

        Ok(vec![path.to_string()])
    }

    async fn update(
        &self,
        path: &str,
        content: Option<&str>,
        metadata: Option<&serde_json::Value>,
    ) -> HandlerResult<Vec<String>> {
        let target = paths::resolve(&self.root, path)?;
        if self.metadata.get(&self.resource_root_id, path).await?.is_none() {
            return Err(PipelineError::NotFound(format!("No metadata record for {}", path)).into());
        }

        let bytes = match content {
            Some(content) => {
                self.create_parents(&target).await?;
                fs::write(&target, content).await?;
                self.mark_written(&[path]);
                content.as_bytes().to_vec()
            }
            None => match fs::read(&target).await {
                Ok(bytes) => bytes,
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    return Err(PipelineError::NotFound(format!("File missing on disk: {}", path)).into());
                }
                Err(e) => return Err(e.into()),
            },
        };

        self.metadata
            .upsert(
                &self.resource_root_id,
                path,
                &content_hash(&bytes),
                bytes.len() as i64,
                metadata,
            )
            .await?;

        Ok(vec![path.to_string()])
    }

    async fn move_path(&self, source: &str, dest: &str) -> HandlerResult<Vec<String>> {
        let from = paths::resolve(&self.root, source)?;
        let to = paths::resolve(&self.root, dest)?;
        let touched = vec![source.to_string(), dest.to_string()];

        let source_meta = match fs::symlink_metadata(&from).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                if fs::symlink_metadata(&to).await.is_ok() {
                    // Already applied by an earlier attempt
                    self.rename_metadata(source, dest, to.is_dir()).await?;
                    return Ok(touched);
                }
                return Err(PipelineError::NotFound(format!("Move source does not exist: {}", source)).into());
            }
            Err(e) => return Err(e.into()),
        };

        if fs::symlink_metadata(&to).await.is_ok() {
            return Err(PipelineError::Conflict(format!("Move destination already exists: {}", dest)).into());
        }

        self.create_parents(&to).await?;
        fs::rename(&from, &to).await?;
        self.mark_written(&[source, dest]);

        self.rename_metadata(source, dest, source_meta.is_dir()).await?;
        self.prune_empty_parents(&from).await;

        Ok(touched)
    }

    async fn rename_metadata(&self, source: &str, dest: &str, is_directory: bool) -> HandlerResult<()> {
        let moved = if is_directory {
            self.metadata
                .rename_prefix(&self.resource_root_id, source, dest)
                .await?
        } else {
            self.metadata
                .rename(&self.resource_root_id, source, dest)
                .await?
        };
        debug!(root = %self.resource_root_id, source, dest, records = moved, "Moved metadata");
        Ok(())
    }

    async fn delete(&self, path: &str) -> HandlerResult<Vec<String>> {
        let target = paths::resolve(&self.root, path)?;

        let removed = match fs::symlink_metadata(&target).await {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(&target).await,
            Ok(_) => fs::remove_file(&target).await,
            Err(e) => Err(e),
        };
        match removed {
            Ok(()) => self.mark_written(&[path]),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        self.metadata
            .delete_prefix(&self.resource_root_id, path)
            .await?;
        self.prune_empty_parents(&target).await;

        Ok(vec![path.to_string()])
    }

    /// Bring metadata in line with what is on disk. Never writes to disk.
    async fn sync(&self, path: &str, kind: ExternalChangeKind) -> HandlerResult<Vec<String>> {
        let target = paths::resolve(&self.root, path)?;

        match fs::symlink_metadata(&target).await {
            Ok(meta) if meta.is_file() => {
                let bytes = fs::read(&target).await?;
                self.metadata
                    .upsert(
                        &self.resource_root_id,
                        path,
                        &content_hash(&bytes),
                        bytes.len() as i64,
                        None,
                    )
                    .await?;
            }
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                self.metadata
                    .delete_prefix(&self.resource_root_id, path)
                    .await?;
            }
            Err(e) => return Err(e.into()),
        }

        debug!(root = %self.resource_root_id, path, ?kind, "Synced external change");
        Ok(vec![path.to_string()])
    }

    fn mark_written(&self, paths: &[&str]) {
        if let Some(recent) = &self.recent_writes {
            recent.mark_all(paths.iter().copied());
        }
    }

    /// Directories the worker creates are its own writes too
    async fn create_parents(&self, target: &Path) -> HandlerResult<()> {
        let created = paths::create_parents(&self.root, target).await?;
        self.mark_written(&created.iter().map(String::as_str).collect::<Vec<_>>());
        Ok(())
    }

    async fn prune_empty_parents(&self, target: &Path) {
        let removed = paths::prune_empty_parents(&self.root, target).await;
        if !removed.is_empty() {
            debug!(root = %self.resource_root_id, dirs = ?removed, "Pruned empty directories");
            self.mark_written(&removed.iter().map(String::as_str).collect::<Vec<_>>());
        }
    }
}

#[async_trait]
impl OperationExecutor for OperationHandlers {
    async fn execute(&self, operation: &Operation) -> HandlerResult<Vec<String>> {
        match operation {
            Operation::Create {
                path,
                content,
                metadata,
            } => self.create(path, content, metadata).await,
            Operation::Update {
                path,
                content,
                metadata,
            } => self.update(path, content.as_deref(), metadata.as_ref()).await,
            Operation::Move {
                source_path,
                dest_path,
                ..
            } => self.move_path(source_path, dest_path).await,
            Operation::Delete { path, .. } => self.delete(path).await,
            Operation::Sync {
                path,
                external_event_kind,
            } => self.sync(path, *external_event_kind).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;
    use serde_json::json;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    async fn create_test_handlers() -> (OperationHandlers, MetadataStore, TempDir) {
        let dir = tempdir().unwrap();
        let metadata = MetadataStore::new(db::memory_pool().await.unwrap());
        let handlers = OperationHandlers::new("notes", dir.path(), metadata.clone());
        (handlers, metadata, dir)
    }

    fn create(path: &str, content: &str) -> Operation {
        Operation::Create {
            path: path.to_string(),
            content: content.to_string(),
            metadata: json!({"title": path}),
        }
    }

    #[tokio::test]
    async fn test_create_writes_file_and_metadata() {
        let (handlers, metadata, dir) = create_test_handlers().await;

        let touched = handlers.execute(&create("deep/a.md", "hello")).await.unwrap();

        assert_eq!(touched, vec!["deep/a.md".to_string()]);
        assert_eq!(std::fs::read_to_string(dir.path().join("deep/a.md")).unwrap(), "hello");
        let record = metadata.get("notes", "deep/a.md").await.unwrap().unwrap();
        assert_eq!(record.content_hash, content_hash(b"hello"));
        assert_eq!(record.size_bytes, 5);
        assert_eq!(record.metadata, json!({"title": "deep/a.md"}));
    }

    #[tokio::test]
    async fn test_update_without_metadata_is_permanent() {
        let (handlers, _, _dir) = create_test_handlers().await;

        let err = handlers
            .execute(&Operation::Update {
                path: "missing.md".to_string(),
                content: Some("x".to_string()),
                metadata: None,
            })
            .await
            .unwrap_err();

        assert!(!err.is_transient());
        assert!(matches!(err.into_inner(), PipelineError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_update_overwrites_content() {
        let (handlers, metadata, dir) = create_test_handlers().await;
        handlers.execute(&create("a.md", "one")).await.unwrap();

        handlers
            .execute(&Operation::Update {
                path: "a.md".to_string(),
                content: Some("two".to_string()),
                metadata: None,
            })
            .await
            .unwrap();

        assert_eq!(std::fs::read_to_string(dir.path().join("a.md")).unwrap(), "two");
        let record = metadata.get("notes", "a.md").await.unwrap().unwrap();
        assert_eq!(record.content_hash, content_hash(b"two"));
        assert_eq!(record.metadata, json!({"title": "a.md"}));
    }

    #[tokio::test]
    async fn test_move_file_and_prune_source_directory() {
        let (handlers, metadata, dir) = create_test_handlers().await;
        handlers.execute(&create("notes/x.md", "x")).await.unwrap();

        let mv = Operation::Move {
            source_path: "notes/x.md".to_string(),
            dest_path: "archive/notes/x.md".to_string(),
            is_directory: false,
        };
        let touched = handlers.execute(&mv).await.unwrap();

        assert_eq!(touched, vec!["notes/x.md".to_string(), "archive/notes/x.md".to_string()]);
        assert!(dir.path().join("archive/notes/x.md").exists());
        assert!(!dir.path().join("notes").exists());
        assert!(metadata.get("notes", "notes/x.md").await.unwrap().is_none());
        assert!(metadata.get("notes", "archive/notes/x.md").await.unwrap().is_some());

        // Re-running an applied move is a no-op
        assert!(handlers.execute(&mv).await.is_ok());
    }

    #[tokio::test]
    async fn test_move_directory_rewrites_prefix() {
        let (handlers, metadata, dir) = create_test_handlers().await;
        handlers.execute(&create("notes/x.md", "x")).await.unwrap();
        handlers.execute(&create("notes/sub/y.md", "y")).await.unwrap();

        handlers
            .execute(&Operation::Move {
                source_path: "notes".to_string(),
                dest_path: "archive/notes".to_string(),
                is_directory: true,
            })
            .await
            .unwrap();

        assert!(dir.path().join("archive/notes/sub/y.md").exists());
        assert!(metadata.get("notes", "archive/notes/sub/y.md").await.unwrap().is_some());
        assert!(metadata.get("notes", "notes/x.md").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_move_onto_existing_destination_conflicts() {
        let (handlers, _, _dir) = create_test_handlers().await;
        handlers.execute(&create("a.md", "a")).await.unwrap();
        handlers.execute(&create("b.md", "b")).await.unwrap();

        let err = handlers
            .execute(&Operation::Move {
                source_path: "a.md".to_string(),
                dest_path: "b.md".to_string(),
                is_directory: false,
            })
            .await
            .unwrap_err();

        assert!(!err.is_transient());
        assert!(matches!(err.into_inner(), PipelineError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_delete_directory_is_recursive_and_idempotent() {
        let (handlers, metadata, dir) = create_test_handlers().await;
        handlers.execute(&create("dir/a.md", "a")).await.unwrap();
        handlers.execute(&create("dir/b.md", "b")).await.unwrap();

        let delete = Operation::Delete {
            path: "dir".to_string(),
            is_directory: true,
        };
        handlers.execute(&delete).await.unwrap();
        handlers.execute(&delete).await.unwrap();

        assert!(!dir.path().join("dir").exists());
        assert!(metadata.list("notes").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sync_never_writes_to_disk() {
        let (handlers, metadata, dir) = create_test_handlers().await;
        std::fs::write(dir.path().join("ext.md"), "external").unwrap();

        handlers
            .execute(&Operation::Sync {
                path: "ext.md".to_string(),
                external_event_kind: ExternalChangeKind::Created,
            })
            .await
            .unwrap();
        let record = metadata.get("notes", "ext.md").await.unwrap().unwrap();
        assert_eq!(record.content_hash, content_hash(b"external"));

        std::fs::remove_file(dir.path().join("ext.md")).unwrap();
        handlers
            .execute(&Operation::Sync {
                path: "ext.md".to_string(),
                external_event_kind: ExternalChangeKind::Removed,
            })
            .await
            .unwrap();
        assert!(metadata.get("notes", "ext.md").await.unwrap().is_none());
        assert!(!dir.path().join("ext.md").exists());
    }

    #[tokio::test]
    async fn test_invalid_path_is_permanent() {
        let (handlers, _, _dir) = create_test_handlers().await;
        let err = handlers.execute(&create("../escape.md", "x")).await.unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_writes_are_marked_for_the_watcher() {
        let (handlers, _, _dir) = create_test_handlers().await;
        let recent = Arc::new(RecentWrites::new(Duration::from_secs(1)));
        let handlers = handlers.with_recent_writes(recent.clone());

        handlers.execute(&create("a.md", "a")).await.unwrap();
        assert!(recent.is_recent("a.md"));
    }

    #[tokio::test]
    async fn test_created_directories_are_marked() {
        let (handlers, _, _dir) = create_test_handlers().await;
        let recent = Arc::new(RecentWrites::new(Duration::from_secs(1)));
        let handlers = handlers.with_recent_writes(recent.clone());

        handlers.execute(&create("deep/nested/a.md", "a")).await.unwrap();
        assert!(recent.is_recent("deep"));
        assert!(recent.is_recent("deep/nested"));
    }

    #[tokio::test]
    async fn test_pruned_directory_is_marked_after_delete() {
        let (handlers, _, dir) = create_test_handlers().await;
        std::fs::create_dir_all(dir.path().join("deep")).unwrap();
        std::fs::write(dir.path().join("deep/a.md"), "a").unwrap();

        let recent = Arc::new(RecentWrites::new(Duration::from_secs(1)));
        let handlers = handlers.with_recent_writes(recent.clone());
        handlers
            .execute(&Operation::Delete {
                path: "deep/a.md".to_string(),
                is_directory: false,
            })
            .await
            .unwrap();

        assert!(!dir.path().join("deep").exists());
        assert!(recent.is_recent("deep"));
    }

    #[test]
    fn test_classification() {
        assert!(HandlerError::from(PipelineError::LockTimeout("repo".into())).is_transient());
        assert!(HandlerError::from(std::io::Error::from(ErrorKind::Interrupted)).is_transient());
        assert!(!HandlerError::from(std::io::Error::from(ErrorKind::PermissionDenied)).is_transient());
        assert!(!HandlerError::from(PipelineError::Validation("bad".into())).is_transient());
    }
}
