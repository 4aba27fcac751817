/// Change watcher - turns external filesystem edits into `Sync` events
///
/// Notifications are coalesced per path over a short window, filtered
/// (outside the root, inside `.git`, or recently written by the worker),
/// then published like any other operation.

pub mod suppression;

pub use suppression::RecentWrites;

use crate::{
    error::{PipelineError, PipelineResult},
    events::{EventPublisher, EventRecord, ExternalChangeKind, Operation},
    handlers::paths,
    metrics,
};
use notify::{event::ModifyKind, Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, error, info, warn};

/// Watches one resource root
pub struct ChangeWatcher {
    resource_root_id: String,
    root: PathBuf,
    canonical_root: PathBuf,
    publisher: EventPublisher,
    recent_writes: Arc<RecentWrites>,
    debounce: Duration,
}

/// Keeps the OS watcher alive; dropping it stops notifications
pub struct WatcherHandle {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl WatcherHandle {
    /// Wait for the coalescing loop to exit after shutdown
    pub async fn stopped(self) {
        let WatcherHandle { _watcher, task } = self;
        if let Err(e) = task.await {
            error!("Watcher task ended abnormally: {}", e);
        }
    }
}

impl ChangeWatcher {
    pub fn new(
        resource_root_id: impl Into<String>,
        root: impl Into<PathBuf>,
        publisher: EventPublisher,
        recent_writes: Arc<RecentWrites>,
        debounce: Duration,
    ) -> PipelineResult<Self> {
        let root = root.into();
        let canonical_root = std::fs::canonicalize(&root)?;

        Ok(Self {
            resource_root_id: resource_root_id.into(),
            root,
            canonical_root,
            publisher,
            recent_writes,
            debounce,
        })
    }

    /// Root-relative path for a notification, or `None` if it must be ignored
    pub fn admit(&self, path: &Path) -> Option<String> {
        let relative = paths::to_relative(&self.canonical_root, path)
            .or_else(|| paths::to_relative(&self.root, path))?;

        if relative == ".git" || relative.starts_with(".git/") {
            return None;
        }

        if self.recent_writes.is_recent(&relative) {
            metrics::WATCHER_SUPPRESSED_TOTAL
                .with_label_values(&[&self.resource_root_id])
                .inc();
            debug!(root = %self.resource_root_id, path = %relative, "Suppressed self-caused change");
            return None;
        }

        Some(relative)
    }

    /// Publish a `Sync` for one observed change unless it is filtered out
    pub async fn handle_change(
        &self,
        path: &Path,
        kind: ExternalChangeKind,
    ) -> PipelineResult<Option<EventRecord>> {
        let Some(relative) = self.admit(path) else {
            return Ok(None);
        };

        let record = self
            .publisher
            .publish(
                &self.resource_root_id,
                Operation::Sync {
                    path: relative,
                    external_event_kind: kind,
                },
                None,
                0,
            )
            .await?;

        Ok(Some(record))
    }

    /// Publish a coalesced batch of changes, returning how many became events
    pub async fn publish_changes(&self, changes: HashMap<PathBuf, ExternalChangeKind>) -> usize {
        let mut changes: Vec<_> = changes.into_iter().collect();
        changes.sort_by(|a, b| a.0.cmp(&b.0));

        let mut published = 0;
        for (path, kind) in changes {
            match self.handle_change(&path, kind).await {
                Ok(Some(_)) => published += 1,
                Ok(None) => {}
                Err(e) => warn!(
                    root = %self.resource_root_id,
                    path = %path.display(),
                    "Failed to publish external change: {}",
                    e
                ),
            }
        }
        published
    }

    /// Start the OS watcher and the coalescing loop
    pub fn start(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> PipelineResult<WatcherHandle> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) => {
                    for change in convert_notify_event(&event) {
                        if event_tx.send(change).is_err() {
                            break;
                        }
                    }
                }
                Err(e) => error!("Watch error: {:?}", e),
            },
            Config::default(),
        )
        .map_err(|e| PipelineError::Watch(format!("Failed to create watcher: {}", e)))?;

        watcher
            .watch(&self.root, RecursiveMode::Recursive)
            .map_err(|e| {
                PipelineError::Watch(format!("Failed to watch {}: {}", self.root.display(), e))
            })?;
        info!(root = %self.resource_root_id, path = %self.root.display(), "Watching resource root");

        let task = tokio::spawn(self.coalesce_loop(event_rx, shutdown));

        Ok(WatcherHandle {
            _watcher: watcher,
            task,
        })
    }

    async fn coalesce_loop(
        self: Arc<Self>,
        mut event_rx: mpsc::UnboundedReceiver<(PathBuf, ExternalChangeKind)>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut pending: HashMap<PathBuf, ExternalChangeKind> = HashMap::new();
        let mut flush_at: Option<Instant> = None;

        loop {
            tokio::select! {
                received = event_rx.recv() => match received {
                    Some((path, kind)) => {
                        let merged = coalesce(pending.get(&path).copied(), kind);
                        pending.insert(path, merged);
                        flush_at.get_or_insert_with(|| Instant::now() + self.debounce);
                    }
                    None => break,
                },
                _ = sleep_until_some(flush_at) => {
                    flush_at = None;
                    let batch = std::mem::take(&mut pending);
                    let published = self.publish_changes(batch).await;
                    if published > 0 {
                        debug!(root = %self.resource_root_id, published, "Published external changes");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(root = %self.resource_root_id, "Change watcher stopped");
    }
}

async fn sleep_until_some(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Later notifications refine earlier ones for the same path
fn coalesce(previous: Option<ExternalChangeKind>, next: ExternalChangeKind) -> ExternalChangeKind {
    use ExternalChangeKind::*;

    match (previous, next) {
        (Some(Created), Modified) => Created,
        (Some(Removed), Created | Modified) => Modified,
        (_, next) => next,
    }
}

fn convert_notify_event(event: &Event) -> Vec<(PathBuf, ExternalChangeKind)> {
    let kind = match event.kind {
        EventKind::Create(_) => Some(ExternalChangeKind::Created),
        // Renames report both ends; existence decides which side each path is
        EventKind::Modify(ModifyKind::Name(_)) => None,
        EventKind::Modify(_) => Some(ExternalChangeKind::Modified),
        EventKind::Remove(_) => Some(ExternalChangeKind::Removed),
        EventKind::Any | EventKind::Access(_) | EventKind::Other => return Vec::new(),
    };

    event
        .paths
        .iter()
        .map(|path| {
            let kind = kind.unwrap_or_else(|| {
                if path.exists() {
                    ExternalChangeKind::Created
                } else {
                    ExternalChangeKind::Removed
                }
            });
            (path.clone(), kind)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, events::EventStore};
    use tempfile::{tempdir, TempDir};

    async fn setup() -> (Arc<ChangeWatcher>, Arc<RecentWrites>, EventStore, TempDir) {
        let dir = tempdir().unwrap();
        let store = EventStore::new(db::memory_pool().await.unwrap());
        let recent = Arc::new(RecentWrites::new(Duration::from_secs(1)));
        let watcher = ChangeWatcher::new(
            "notes",
            dir.path(),
            EventPublisher::new(store.clone(), 3),
            recent.clone(),
            Duration::from_millis(20),
        )
        .unwrap();
        (Arc::new(watcher), recent, store, dir)
    }

    #[tokio::test]
    async fn test_admit_filters_git_and_outside_paths() {
        let (watcher, _, _, dir) = setup().await;
        let root = std::fs::canonicalize(dir.path()).unwrap();

        assert_eq!(watcher.admit(&root.join("a.md")), Some("a.md".to_string()));
        assert_eq!(watcher.admit(&root.join(".git/index")), None);
        assert_eq!(watcher.admit(&root.join(".git")), None);
        assert_eq!(watcher.admit(Path::new("/somewhere/else.md")), None);
    }

    #[tokio::test]
    async fn test_recent_write_is_suppressed() {
        let (watcher, recent, store, dir) = setup().await;
        recent.mark("a.md");

        let suppressed = watcher
            .handle_change(&dir.path().join("a.md"), ExternalChangeKind::Modified)
            .await
            .unwrap();
        assert!(suppressed.is_none());

        let published = watcher
            .handle_change(&dir.path().join("b.md"), ExternalChangeKind::Created)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            store.get(published.id).await.unwrap().unwrap().operation,
            Operation::Sync {
                path: "b.md".to_string(),
                external_event_kind: ExternalChangeKind::Created,
            }
        );
    }

    #[tokio::test]
    async fn test_publish_changes_counts_published() {
        let (watcher, recent, _, dir) = setup().await;
        recent.mark("skip.md");

        let changes = HashMap::from([
            (dir.path().join("a.md"), ExternalChangeKind::Created),
            (dir.path().join("skip.md"), ExternalChangeKind::Modified),
            (dir.path().join(".git/HEAD"), ExternalChangeKind::Modified),
        ]);
        assert_eq!(watcher.publish_changes(changes).await, 1);
    }

    #[test]
    fn test_coalesce() {
        use ExternalChangeKind::*;
        assert_eq!(coalesce(None, Modified), Modified);
        assert_eq!(coalesce(Some(Created), Modified), Created);
        assert_eq!(coalesce(Some(Removed), Created), Modified);
        assert_eq!(coalesce(Some(Modified), Removed), Removed);
    }

    #[test]
    fn test_convert_ignores_access_events() {
        let event = Event::new(EventKind::Access(notify::event::AccessKind::Any))
            .add_path(PathBuf::from("/vault/a.md"));
        assert!(convert_notify_event(&event).is_empty());

        let event = Event::new(EventKind::Remove(notify::event::RemoveKind::File))
            .add_path(PathBuf::from("/vault/a.md"));
        assert_eq!(
            convert_notify_event(&event),
            vec![(PathBuf::from("/vault/a.md"), ExternalChangeKind::Removed)]
        );
    }
}
