/// Version control - one repository per resource root, written only under its lock
///
/// - `lock`: reentrant per-repository mutex with blocking and async acquisition
/// - `git`: the git CLI backend
/// - `batcher`: amortizes commits over bursts of staged paths

pub mod batcher;
pub mod git;
pub mod lock;

pub use batcher::{CommitBatcher, CommitOutcome};
pub use git::GitRepository;
pub use lock::{RepositoryGuard, RepositoryLock, RepositoryLocks};

use crate::error::PipelineResult;
use async_trait::async_trait;

/// A repository that can record changes to a set of paths
#[async_trait]
pub trait VersionControl: Send + Sync {
    /// Stage `paths` (adds for existing paths, removals otherwise) and commit.
    ///
    /// Returns `Ok(None)` when staging left the index unchanged.
    async fn commit(&self, paths: &[String], message: &str) -> PipelineResult<Option<String>>;
}

/// Author identity passed to every commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitIdentity {
    pub name: String,
    pub email: String,
}
