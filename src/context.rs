/// Application context and dependency injection
use crate::{
    config::PipelineConfig,
    db,
    error::{PipelineError, PipelineResult},
    events::{EventPublisher, EventStore},
    handlers::OperationHandlers,
    metadata::MetadataStore,
    status::StatusQuery,
    vcs::{CommitBatcher, CommitIdentity, GitRepository, RepositoryLocks},
    watcher::{ChangeWatcher, RecentWrites, WatcherHandle},
    worker::{EventWorker, WorkerSettings},
};
use sqlx::SqlitePool;
use std::{path::PathBuf, sync::Arc};
use tokio::{sync::watch, task::JoinHandle};
use tracing::{error, info};

/// Everything bound to one resource root
pub struct ResourceRoot {
    pub id: String,
    pub path: PathBuf,
    pub repository: GitRepository,
    pub recent_writes: Arc<RecentWrites>,
}

/// Application context holding all shared services
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<PipelineConfig>,
    pub db: SqlitePool,
    pub event_store: EventStore,
    pub publisher: EventPublisher,
    pub status: StatusQuery,
    pub metadata: MetadataStore,
    pub locks: RepositoryLocks,
    pub roots: Arc<Vec<ResourceRoot>>,
}

/// Running workers and watchers
pub struct PipelineHandles {
    workers: Vec<JoinHandle<()>>,
    watchers: Vec<WatcherHandle>,
}

impl PipelineHandles {
    /// Wait for every worker to finish its final flush
    pub async fn join(self) {
        for result in futures::future::join_all(self.workers).await {
            if let Err(e) = result {
                error!("Worker task ended abnormally: {}", e);
            }
        }
        for watcher in self.watchers {
            watcher.stopped().await;
        }
    }
}

impl AppContext {
    /// Create a new application context from configuration
    pub async fn new(config: PipelineConfig) -> PipelineResult<Self> {
        config.validate()?;

        tokio::fs::create_dir_all(&config.storage.data_directory)
            .await
            .map_err(|e| {
                PipelineError::Internal(format!(
                    "Failed to create directory {:?}: {}",
                    config.storage.data_directory, e
                ))
            })?;

        let db = db::create_pool(&config.storage.database_path, db::DatabaseOptions::default()).await?;
        db::run_migrations(&db).await?;
        db::test_connection(&db).await?;

        Self::with_pool(config, db)
    }

    /// Build the context over an existing, migrated pool
    pub fn with_pool(config: PipelineConfig, db: SqlitePool) -> PipelineResult<Self> {
        let event_store = EventStore::new(db.clone());
        let metadata = MetadataStore::new(db.clone());
        let locks = RepositoryLocks::new();

        let identity = CommitIdentity {
            name: config.commit.author_name.clone(),
            email: config.commit.author_email.clone(),
        };

        let mut roots = Vec::with_capacity(config.storage.roots.len());
        for root in &config.storage.roots {
            let repository = GitRepository::new(
                root.path.clone(),
                &locks,
                identity.clone(),
                config.commit.lock_timeout(),
            )?;
            roots.push(ResourceRoot {
                id: root.id.clone(),
                path: root.path.clone(),
                repository,
                recent_writes: Arc::new(RecentWrites::new(config.watcher.suppression_window())),
            });
        }

        let publisher = EventPublisher::new(event_store.clone(), config.queue.max_retries)
            .with_known_roots(roots.iter().map(|root| root.id.clone()).collect());
        let status = StatusQuery::new(event_store.clone(), config.queue.wait_poll_interval());

        Ok(Self {
            config: Arc::new(config),
            db,
            event_store,
            publisher,
            status,
            metadata,
            locks,
            roots: Arc::new(roots),
        })
    }

    pub fn root(&self, id: &str) -> Option<&ResourceRoot> {
        self.roots.iter().find(|root| root.id == id)
    }

    /// Worker for one root, with its own batcher
    pub fn build_worker(&self, root: &ResourceRoot) -> EventWorker {
        let handlers = OperationHandlers::new(root.id.clone(), root.path.clone(), self.metadata.clone())
            .with_recent_writes(Arc::clone(&root.recent_writes));

        let batcher = CommitBatcher::new(
            root.id.clone(),
            Arc::new(root.repository.clone()),
            self.config.commit.commit_interval(),
            self.config.commit.force_commit_threshold,
            self.config.commit.failure_backoff_cap(),
        );

        EventWorker::new(
            root.id.clone(),
            self.event_store.clone(),
            Arc::new(handlers),
            batcher,
            WorkerSettings::from(&self.config.queue),
        )
    }

    /// Spawn one worker per root, plus a watcher per root when enabled
    pub fn start_pipeline(&self, shutdown: watch::Receiver<bool>) -> PipelineResult<PipelineHandles> {
        let mut handles = PipelineHandles {
            workers: Vec::with_capacity(self.roots.len()),
            watchers: Vec::new(),
        };

        for root in self.roots.iter() {
            let worker = self.build_worker(root);
            handles.workers.push(tokio::spawn(worker.run(shutdown.clone())));

            if self.config.watcher.enabled {
                let watcher = ChangeWatcher::new(
                    root.id.clone(),
                    root.path.clone(),
                    self.publisher.clone(),
                    Arc::clone(&root.recent_writes),
                    self.config.watcher.debounce(),
                )?;
                handles.watchers.push(Arc::new(watcher).start(shutdown.clone())?);
            }

            info!(root = %root.id, path = %root.path.display(), "Resource root online");
        }

        Ok(handles)
    }

    /// Get service URL
    pub fn service_url(&self) -> String {
        format!(
            "http://{}:{}",
            self.config.service.hostname, self.config.service.port
        )
    }
}
