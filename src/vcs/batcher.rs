/// Commit batcher - amortizes repository commits over bursts of writes
///
/// One batcher per resource root, owned by that root's worker. Paths are
/// collected until the commit interval elapses or the force threshold is
/// reached, then committed together.
use crate::{error::PipelineResult, metrics, vcs::VersionControl};
use std::{
    collections::BTreeSet,
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{debug, info, warn};

/// Result of a successful flush
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitOutcome {
    /// `None` when the index was already up to date
    pub commit_id: Option<String>,
    pub paths: Vec<String>,
    pub message: String,
}

pub struct CommitBatcher {
    resource_root_id: String,
    vcs: Arc<dyn VersionControl>,
    pending: BTreeSet<String>,
    last_commit: Instant,
    commit_interval: Duration,
    force_commit_threshold: usize,
    failure_backoff_cap: Duration,
    consecutive_failures: u32,
    retry_after: Option<Instant>,
}

impl CommitBatcher {
    pub fn new(
        resource_root_id: impl Into<String>,
        vcs: Arc<dyn VersionControl>,
        commit_interval: Duration,
        force_commit_threshold: usize,
        failure_backoff_cap: Duration,
    ) -> Self {
        Self {
            resource_root_id: resource_root_id.into(),
            vcs,
            pending: BTreeSet::new(),
            last_commit: Instant::now(),
            commit_interval,
            force_commit_threshold: force_commit_threshold.max(1),
            failure_backoff_cap,
            consecutive_failures: 0,
            retry_after: None,
        }
    }

    /// Add paths to the pending set
    pub fn stage<I>(&mut self, paths: I)
    where
        I: IntoIterator<Item = String>,
    {
        self.pending.extend(paths);
        self.update_gauge();
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn pending_paths(&self) -> impl Iterator<Item = &str> {
        self.pending.iter().map(String::as_str)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Whether a flush is due now
    pub fn should_commit(&self) -> bool {
        self.should_commit_at(Instant::now())
    }

    fn should_commit_at(&self, now: Instant) -> bool {
        if self.pending.is_empty() {
            return false;
        }
        if matches!(self.retry_after, Some(at) if now < at) {
            return false;
        }

        self.pending.len() >= self.force_commit_threshold
            || now.duration_since(self.last_commit) >= self.commit_interval
    }

    /// Commit every pending path in one commit.
    ///
    /// On failure the paths stay pending and the next attempt is delayed by
    /// `min(2^failures s, cap)`. Paths are never dropped.
    pub async fn flush(&mut self) -> PipelineResult<Option<CommitOutcome>> {
        if self.pending.is_empty() {
            return Ok(None);
        }

        let paths: Vec<String> = self.pending.iter().cloned().collect();
        let message = commit_message(&paths);
        let started = Instant::now();

        match self.vcs.commit(&paths, &message).await {
            Ok(commit_id) => {
                let outcome = if commit_id.is_some() { "committed" } else { "empty" };
                metrics::record_commit(
                    &self.resource_root_id,
                    outcome,
                    paths.len(),
                    started.elapsed().as_secs_f64(),
                );

                match &commit_id {
                    Some(id) => info!(
                        root = %self.resource_root_id,
                        commit = %id,
                        files = paths.len(),
                        "Committed batch"
                    ),
                    None => debug!(
                        root = %self.resource_root_id,
                        files = paths.len(),
                        "Batch left index unchanged, nothing committed"
                    ),
                }

                self.pending.clear();
                self.last_commit = Instant::now();
                self.consecutive_failures = 0;
                self.retry_after = None;
                self.update_gauge();

                Ok(Some(CommitOutcome {
                    commit_id,
                    paths,
                    message,
                }))
            }
            Err(e) => {
                metrics::record_commit(
                    &self.resource_root_id,
                    "failed",
                    paths.len(),
                    started.elapsed().as_secs_f64(),
                );

                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                let delay = failure_backoff(self.consecutive_failures, self.failure_backoff_cap);
                self.retry_after = Some(Instant::now() + delay);

                warn!(
                    root = %self.resource_root_id,
                    files = paths.len(),
                    failures = self.consecutive_failures,
                    retry_in_secs = delay.as_secs(),
                    "Commit failed, keeping paths staged: {}",
                    e
                );
                Err(e)
            }
        }
    }

    fn update_gauge(&self) {
        metrics::PENDING_COMMIT_PATHS
            .with_label_values(&[&self.resource_root_id])
            .set(self.pending.len() as i64);
    }
}

/// `"Update <path>"` for one path, `"Batch update: N files"` otherwise
pub fn commit_message(paths: &[String]) -> String {
    match paths {
        [only] => format!("Update {}", only),
        _ => format!("Batch update: {} files", paths.len()),
    }
}

fn failure_backoff(failures: u32, cap: Duration) -> Duration {
    let secs = 1u64.checked_shl(failures.min(63)).unwrap_or(u64::MAX);
    Duration::from_secs(secs).min(cap)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PipelineError;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct RecordingVcs {
        commits: Mutex<Vec<(Vec<String>, String)>>,
        failing: AtomicBool,
    }

    #[async_trait]
    impl VersionControl for RecordingVcs {
        async fn commit(&self, paths: &[String], message: &str) -> PipelineResult<Option<String>> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(PipelineError::Vcs {
                    command: "git commit".to_string(),
                    stderr: "disk full".to_string(),
                });
            }
            let mut commits = self.commits.lock();
            commits.push((paths.to_vec(), message.to_string()));
            Ok(Some(format!("commit-{}", commits.len())))
        }
    }

    fn batcher(vcs: Arc<RecordingVcs>, interval: Duration) -> CommitBatcher {
        CommitBatcher::new("notes", vcs, interval, 100, Duration::from_secs(300))
    }

    #[test]
    fn test_commit_message() {
        assert_eq!(commit_message(&["a.md".to_string()]), "Update a.md");
        assert_eq!(
            commit_message(&["a.md".to_string(), "b.md".to_string()]),
            "Batch update: 2 files"
        );
    }

    #[test]
    fn test_failure_backoff_is_capped() {
        let cap = Duration::from_secs(300);
        assert_eq!(failure_backoff(1, cap), Duration::from_secs(2));
        assert_eq!(failure_backoff(3, cap), Duration::from_secs(8));
        assert_eq!(failure_backoff(20, cap), cap);
        assert_eq!(failure_backoff(200, cap), cap);
    }

    #[test]
    fn test_threshold_triggers_before_interval() {
        let vcs = Arc::new(RecordingVcs::default());
        let mut batcher = batcher(vcs, Duration::from_secs(3600));

        for i in 0..99 {
            batcher.stage([format!("file-{:03}.md", i)]);
        }
        assert!(!batcher.should_commit());

        batcher.stage(["file-099.md".to_string()]);
        assert!(batcher.should_commit());
    }

    #[test]
    fn test_interval_triggers_commit() {
        let vcs = Arc::new(RecordingVcs::default());
        let mut batcher = batcher(vcs, Duration::from_secs(5));

        assert!(!batcher.should_commit_at(Instant::now() + Duration::from_secs(10)));

        batcher.stage(["a.md".to_string()]);
        assert!(!batcher.should_commit());
        assert!(batcher.should_commit_at(Instant::now() + Duration::from_secs(6)));
    }

    #[tokio::test]
    async fn test_flush_commits_distinct_paths_once() {
        let vcs = Arc::new(RecordingVcs::default());
        let mut batcher = batcher(vcs.clone(), Duration::from_secs(5));

        batcher.stage(["b.md".to_string(), "a.md".to_string()]);
        batcher.stage(["a.md".to_string()]);

        let outcome = batcher.flush().await.unwrap().unwrap();
        assert_eq!(outcome.paths, vec!["a.md".to_string(), "b.md".to_string()]);
        assert_eq!(outcome.message, "Batch update: 2 files");
        assert_eq!(outcome.commit_id.as_deref(), Some("commit-1"));
        assert_eq!(batcher.pending_len(), 0);

        assert!(batcher.flush().await.unwrap().is_none());
        assert_eq!(vcs.commits.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_flush_keeps_paths_and_backs_off() {
        let vcs = Arc::new(RecordingVcs::default());
        vcs.failing.store(true, Ordering::SeqCst);
        let mut batcher = batcher(vcs.clone(), Duration::ZERO);

        batcher.stage(["a.md".to_string()]);
        assert!(batcher.should_commit());
        assert!(batcher.flush().await.is_err());

        assert_eq!(batcher.pending_paths().collect::<Vec<_>>(), vec!["a.md"]);
        assert_eq!(batcher.consecutive_failures(), 1);
        assert!(!batcher.should_commit());
        assert!(batcher.should_commit_at(Instant::now() + Duration::from_secs(3)));

        vcs.failing.store(false, Ordering::SeqCst);
        let outcome = batcher.flush().await.unwrap().unwrap();
        assert_eq!(outcome.message, "Update a.md");
        assert_eq!(batcher.consecutive_failures(), 0);
    }
}
