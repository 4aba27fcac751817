/// Configuration management for the vault pipeline
use crate::error::{PipelineError, PipelineResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Main pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub service: ServiceConfig,
    pub storage: StorageConfig,
    pub queue: QueueConfig,
    pub commit: CommitConfig,
    pub retention: RetentionConfig,
    pub watcher: WatcherConfig,
    pub logging: LoggingConfig,
}

/// HTTP bind configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub hostname: String,
    pub port: u16,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_directory: PathBuf,
    pub database_path: PathBuf,
    pub roots: Vec<RootConfig>,
}

/// One tracked resource root (a directory that is also a git working tree)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RootConfig {
    pub id: String,
    pub path: PathBuf,
}

/// Event queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Idle sleep between claim rounds
    pub poll_interval_ms: u64,
    /// Maximum records claimed per round
    pub claim_batch_size: u32,
    /// Transient failures tolerated before a record is marked failed
    pub max_retries: u32,
    /// Upper bound for the exponential retry delay
    pub retry_backoff_cap_secs: u64,
    /// Polling cadence used by `StatusQuery::wait_for`
    pub wait_poll_interval_ms: u64,
}

/// Commit batching configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitConfig {
    pub commit_interval_secs: u64,
    pub force_commit_threshold: usize,
    pub failure_backoff_cap_secs: u64,
    pub lock_timeout_ms: u64,
    pub author_name: String,
    pub author_email: String,
}

/// Retention windows for terminal records
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    pub completed_retention_secs: u64,
    pub failed_retention_secs: u64,
    pub sweep_interval_secs: u64,
}

/// Filesystem watcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    pub enabled: bool,
    /// How long a worker write suppresses watcher notifications for the same path
    pub suppression_window_ms: u64,
    /// Coalescing window for bursts of raw notifications
    pub debounce_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub json: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 250,
            claim_batch_size: 10,
            max_retries: 3,
            retry_backoff_cap_secs: 60,
            wait_poll_interval_ms: 100,
        }
    }
}

impl QueueConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn retry_backoff_cap(&self) -> Duration {
        Duration::from_secs(self.retry_backoff_cap_secs)
    }

    pub fn wait_poll_interval(&self) -> Duration {
        Duration::from_millis(self.wait_poll_interval_ms)
    }
}

impl Default for CommitConfig {
    fn default() -> Self {
        Self {
            commit_interval_secs: 5,
            force_commit_threshold: 100,
            failure_backoff_cap_secs: 300,
            lock_timeout_ms: 30_000,
            author_name: "vault-pipeline".to_string(),
            author_email: "vault-pipeline@localhost".to_string(),
        }
    }
}

impl CommitConfig {
    pub fn commit_interval(&self) -> Duration {
        Duration::from_secs(self.commit_interval_secs)
    }

    pub fn failure_backoff_cap(&self) -> Duration {
        Duration::from_secs(self.failure_backoff_cap_secs)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            completed_retention_secs: 86_400,     // 1 day
            failed_retention_secs: 7 * 86_400,    // 7 days
            sweep_interval_secs: 3600,            // hourly
        }
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            suppression_window_ms: 1000,
            debounce_ms: 200,
        }
    }
}

impl WatcherConfig {
    pub fn suppression_window(&self) -> Duration {
        Duration::from_millis(self.suppression_window_ms)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

impl PipelineConfig {
    /// Defaults for everything except storage; used by tests and embedders
    pub fn with_roots(data_directory: PathBuf, roots: Vec<RootConfig>) -> Self {
        Self {
            service: ServiceConfig {
                hostname: "127.0.0.1".to_string(),
                port: 3080,
            },
            storage: StorageConfig {
                database_path: data_directory.join("pipeline.sqlite"),
                data_directory,
                roots,
            },
            queue: QueueConfig::default(),
            commit: CommitConfig::default(),
            retention: RetentionConfig::default(),
            watcher: WatcherConfig::default(),
            logging: LoggingConfig {
                level: "vault_pipeline=debug,tower_http=debug".to_string(),
                json: false,
            },
        }
    }

    /// Load configuration from environment variables
    pub fn from_env() -> PipelineResult<Self> {
        dotenv::dotenv().ok();

        let hostname = env::var("VAULT_HOSTNAME").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env::var("VAULT_PORT")
            .unwrap_or_else(|_| "3080".to_string())
            .parse()
            .map_err(|_| PipelineError::Validation("Invalid port number".to_string()))?;

        let data_directory: PathBuf = env::var("VAULT_DATA_DIRECTORY")
            .unwrap_or_else(|_| "./data".to_string())
            .into();
        let database_path = env::var("VAULT_DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_directory.join("pipeline.sqlite"));
        let roots = match env::var("VAULT_ROOTS") {
            Ok(raw) => parse_roots(&raw)?,
            Err(_) => vec![RootConfig {
                id: "default".to_string(),
                path: data_directory.join("vault"),
            }],
        };

        let queue_defaults = QueueConfig::default();
        let queue = QueueConfig {
            poll_interval_ms: env_or("VAULT_POLL_INTERVAL_MS", queue_defaults.poll_interval_ms),
            claim_batch_size: env_or("VAULT_CLAIM_BATCH_SIZE", queue_defaults.claim_batch_size),
            max_retries: env_or("VAULT_MAX_RETRIES", queue_defaults.max_retries),
            retry_backoff_cap_secs: env_or(
                "VAULT_RETRY_BACKOFF_CAP_SECS",
                queue_defaults.retry_backoff_cap_secs,
            ),
            wait_poll_interval_ms: env_or(
                "VAULT_WAIT_POLL_INTERVAL_MS",
                queue_defaults.wait_poll_interval_ms,
            ),
        };

        let commit_defaults = CommitConfig::default();
        let commit = CommitConfig {
            commit_interval_secs: env_or(
                "VAULT_COMMIT_INTERVAL_SECS",
                commit_defaults.commit_interval_secs,
            ),
            force_commit_threshold: env_or(
                "VAULT_FORCE_COMMIT_THRESHOLD",
                commit_defaults.force_commit_threshold,
            ),
            failure_backoff_cap_secs: env_or(
                "VAULT_COMMIT_FAILURE_BACKOFF_CAP_SECS",
                commit_defaults.failure_backoff_cap_secs,
            ),
            lock_timeout_ms: env_or("VAULT_LOCK_TIMEOUT_MS", commit_defaults.lock_timeout_ms),
            author_name: env::var("VAULT_COMMIT_AUTHOR_NAME")
                .unwrap_or(commit_defaults.author_name),
            author_email: env::var("VAULT_COMMIT_AUTHOR_EMAIL")
                .unwrap_or(commit_defaults.author_email),
        };

        let retention_defaults = RetentionConfig::default();
        let retention = RetentionConfig {
            completed_retention_secs: env_or(
                "VAULT_COMPLETED_RETENTION_SECS",
                retention_defaults.completed_retention_secs,
            ),
            failed_retention_secs: env_or(
                "VAULT_FAILED_RETENTION_SECS",
                retention_defaults.failed_retention_secs,
            ),
            sweep_interval_secs: env_or(
                "VAULT_RETENTION_SWEEP_INTERVAL_SECS",
                retention_defaults.sweep_interval_secs,
            ),
        };

        let watcher_defaults = WatcherConfig::default();
        let watcher = WatcherConfig {
            enabled: env_or("VAULT_WATCHER_ENABLED", watcher_defaults.enabled),
            suppression_window_ms: env_or(
                "VAULT_SUPPRESSION_WINDOW_MS",
                watcher_defaults.suppression_window_ms,
            ),
            debounce_ms: env_or("VAULT_WATCHER_DEBOUNCE_MS", watcher_defaults.debounce_ms),
        };

        let level = env::var("RUST_LOG")
            .unwrap_or_else(|_| "vault_pipeline=debug,tower_http=debug".to_string());
        let json = env::var("LOG_FORMAT")
            .map(|format| format.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        Ok(PipelineConfig {
            service: ServiceConfig { hostname, port },
            storage: StorageConfig {
                data_directory,
                database_path,
                roots,
            },
            queue,
            commit,
            retention,
            watcher,
            logging: LoggingConfig { level, json },
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> PipelineResult<()> {
        if self.queue.claim_batch_size == 0 {
            return Err(PipelineError::Validation(
                "Claim batch size must be at least 1".to_string(),
            ));
        }

        if self.commit.force_commit_threshold == 0 {
            return Err(PipelineError::Validation(
                "Force commit threshold must be at least 1".to_string(),
            ));
        }

        if self.storage.roots.is_empty() {
            return Err(PipelineError::Validation(
                "At least one resource root is required".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for root in &self.storage.roots {
            if root.id.trim().is_empty() {
                return Err(PipelineError::Validation(
                    "Resource root id cannot be empty".to_string(),
                ));
            }
            if !seen.insert(root.id.as_str()) {
                return Err(PipelineError::Validation(format!(
                    "Duplicate resource root id: {}",
                    root.id
                )));
            }
        }

        // Suppression markers must outlive the coalescing window or self-writes leak through
        if self.watcher.enabled && self.watcher.suppression_window_ms < self.watcher.debounce_ms {
            return Err(PipelineError::Validation(
                "Suppression window must not be shorter than the watcher debounce window"
                    .to_string(),
            ));
        }

        Ok(())
    }
}

/// Parse `id=path` pairs separated by commas
pub fn parse_roots(raw: &str) -> PipelineResult<Vec<RootConfig>> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (id, path) = entry.split_once('=').ok_or_else(|| {
                PipelineError::Validation(format!("Invalid root entry (expected id=path): {}", entry))
            })?;
            Ok(RootConfig {
                id: id.trim().to_string(),
                path: PathBuf::from(path.trim()),
            })
        })
        .collect()
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}
