/// Git CLI backend for a resource root
///
/// Every repository mutation runs under the root's `RepositoryLock`. The
/// lock is taken again by each nested step, which relies on its reentrancy.
use crate::{
    error::{PipelineError, PipelineResult},
    vcs::{CommitIdentity, RepositoryLock, RepositoryLocks, VersionControl},
};
use async_trait::async_trait;
use std::{
    path::{Path, PathBuf},
    process::Output,
    sync::Arc,
    time::Duration,
};
use tracing::{debug, info};

/// Git repository rooted at a resource root's working tree
#[derive(Clone)]
pub struct GitRepository {
    workdir: PathBuf,
    lock: Arc<RepositoryLock>,
    identity: CommitIdentity,
    lock_timeout: Duration,
}

impl GitRepository {
    /// Resolve the root's lock; the directory is created if missing
    pub fn new(
        workdir: impl Into<PathBuf>,
        locks: &RepositoryLocks,
        identity: CommitIdentity,
        lock_timeout: Duration,
    ) -> PipelineResult<Self> {
        let workdir = workdir.into();
        std::fs::create_dir_all(&workdir)?;
        let lock = locks.for_root(&workdir)?;

        Ok(Self {
            workdir,
            lock,
            identity,
            lock_timeout,
        })
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    pub fn lock(&self) -> &Arc<RepositoryLock> {
        &self.lock
    }

    /// Create the repository if the working tree has none yet
    pub async fn ensure_initialized(&self) -> PipelineResult<()> {
        let _guard = self.lock.acquire_timeout(self.lock_timeout).await?;
        if self.workdir.join(".git").exists() {
            return Ok(());
        }

        self.git(&["init", "--quiet"]).await?;
        info!(workdir = %self.workdir.display(), "Initialized git repository");
        Ok(())
    }

    /// Stage `path` as an add if it exists on disk, as a removal otherwise
    pub async fn stage(&self, path: &str) -> PipelineResult<()> {
        let _guard = self.lock.acquire_timeout(self.lock_timeout).await?;
        let args = self.stage_args(path);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.git(&args).await?;
        Ok(())
    }

    /// Whether the index differs from HEAD
    pub async fn has_staged_changes(&self) -> PipelineResult<bool> {
        let _guard = self.lock.acquire_timeout(self.lock_timeout).await?;
        let output = git_command(&self.workdir)
            .args(STAGED_CHECK)
            .output()
            .await?;
        staged_check_result(&output)
    }

    /// Commit the index and return the new HEAD
    pub async fn commit_index(&self, message: &str) -> PipelineResult<String> {
        let _guard = self.lock.acquire_timeout(self.lock_timeout).await?;
        let args = self.commit_args(message);
        let output = git_command(&self.workdir).args(&args).output().await?;
        check_output(&output, args.as_slice())?;

        let head = self.git(&["rev-parse", "HEAD"]).await?;
        Ok(stdout_string(&head))
    }

    /// Synchronous stage-and-commit for callers outside the event queue.
    ///
    /// Takes the same lock as the async path, so it serializes with the
    /// root's batcher. Must not be called from a runtime worker thread.
    pub fn commit_paths_blocking(
        &self,
        paths: &[String],
        message: &str,
    ) -> PipelineResult<Option<String>> {
        let _guard = self.lock.acquire_blocking_timeout(self.lock_timeout)?;

        if !self.workdir.join(".git").exists() {
            self.git_blocking(&["init", "--quiet"])?;
        }
        for path in paths {
            let args = self.stage_args(path);
            let args: Vec<&str> = args.iter().map(String::as_str).collect();
            self.git_blocking(&args)?;
        }

        let output = blocking_git_command(&self.workdir)
            .args(STAGED_CHECK)
            .output()?;
        if !staged_check_result(&output)? {
            debug!(workdir = %self.workdir.display(), "Nothing staged, skipping commit");
            return Ok(None);
        }

        let args = self.commit_args(message);
        let output = blocking_git_command(&self.workdir).args(&args).output()?;
        check_output(&output, args.as_slice())?;
        let head = self.git_blocking(&["rev-parse", "HEAD"])?;
        Ok(Some(stdout_string(&head)))
    }

    fn stage_args(&self, path: &str) -> Vec<String> {
        if self.workdir.join(path).exists() {
            vec!["add".into(), "--all".into(), "--".into(), path.into()]
        } else {
            vec![
                "rm".into(),
                "-r".into(),
                "--cached".into(),
                "--ignore-unmatch".into(),
                "--quiet".into(),
                "--".into(),
                path.into(),
            ]
        }
    }

    fn commit_args(&self, message: &str) -> Vec<String> {
        vec![
            "-c".into(),
            format!("user.name={}", self.identity.name),
            "-c".into(),
            format!("user.email={}", self.identity.email),
            "commit".into(),
            "--quiet".into(),
            "--no-verify".into(),
            "-m".into(),
            message.into(),
        ]
    }

    async fn git(&self, args: &[&str]) -> PipelineResult<Output> {
        let output = git_command(&self.workdir).args(args).output().await?;
        check_output(&output, args)?;
        Ok(output)
    }

    fn git_blocking(&self, args: &[&str]) -> PipelineResult<Output> {
        let output = blocking_git_command(&self.workdir).args(args).output()?;
        check_output(&output, args)?;
        Ok(output)
    }
}

#[async_trait]
impl VersionControl for GitRepository {
    async fn commit(&self, paths: &[String], message: &str) -> PipelineResult<Option<String>> {
        let _guard = self.lock.acquire_timeout(self.lock_timeout).await?;

        self.ensure_initialized().await?;
        for path in paths {
            self.stage(path).await?;
        }
        if !self.has_staged_changes().await? {
            debug!(workdir = %self.workdir.display(), "Nothing staged, skipping commit");
            return Ok(None);
        }

        self.commit_index(message).await.map(Some)
    }
}

/// Exit 0 means the index matches HEAD, exit 1 means it differs
const STAGED_CHECK: [&str; 3] = ["diff", "--cached", "--quiet"];

fn staged_check_result(output: &Output) -> PipelineResult<bool> {
    match output.status.code() {
        Some(0) => Ok(false),
        Some(1) => Ok(true),
        _ => Err(PipelineError::Vcs {
            command: format!("git {}", STAGED_CHECK.join(" ")),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        }),
    }
}

fn check_output<S: AsRef<str>>(output: &Output, args: &[S]) -> PipelineResult<()> {
    if output.status.success() {
        return Ok(());
    }

    let args: Vec<&str> = args.iter().map(AsRef::as_ref).collect();
    Err(PipelineError::Vcs {
        command: format!("git {}", args.join(" ")),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

fn stdout_string(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// Git command with system and user config ignored and prompts disabled
fn git_command(workdir: &Path) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new("git");
    cmd.current_dir(workdir);
    cmd.env("GIT_CONFIG_NOSYSTEM", "1");
    cmd.env("GIT_CONFIG_GLOBAL", "/dev/null");
    cmd.env("GIT_TERMINAL_PROMPT", "0");
    cmd.kill_on_drop(true);
    cmd
}

fn blocking_git_command(workdir: &Path) -> std::process::Command {
    let mut cmd = std::process::Command::new("git");
    cmd.current_dir(workdir);
    cmd.env("GIT_CONFIG_NOSYSTEM", "1");
    cmd.env("GIT_CONFIG_GLOBAL", "/dev/null");
    cmd.env("GIT_TERMINAL_PROMPT", "0");
    cmd
}

/// Whether a `git` binary is on PATH
pub fn git_available() -> bool {
    std::process::Command::new("git")
        .arg("--version")
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn identity() -> CommitIdentity {
        CommitIdentity {
            name: "Vault Pipeline".to_string(),
            email: "pipeline@localhost".to_string(),
        }
    }

    fn test_repo(dir: &TempDir) -> GitRepository {
        GitRepository::new(
            dir.path(),
            &RepositoryLocks::new(),
            identity(),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    fn log_subjects(dir: &Path) -> Vec<String> {
        let output = blocking_git_command(dir)
            .args(["log", "--format=%s"])
            .output()
            .unwrap();
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_stage_args_choose_add_or_remove() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("present.md"), "x").unwrap();
        let repo = test_repo(&dir);

        assert_eq!(repo.stage_args("present.md")[0], "add");
        assert_eq!(repo.stage_args("gone.md")[0], "rm");
    }

    #[tokio::test]
    async fn test_commit_stages_adds_and_removals() {
        if !git_available() {
            return;
        }
        let dir = TempDir::new().unwrap();
        let repo = test_repo(&dir);

        std::fs::write(dir.path().join("a.md"), "one").unwrap();
        std::fs::write(dir.path().join("b.md"), "two").unwrap();
        let first = repo
            .commit(&["a.md".to_string(), "b.md".to_string()], "Batch update: 2 files")
            .await
            .unwrap();
        assert!(first.is_some());

        std::fs::remove_file(dir.path().join("b.md")).unwrap();
        let second = repo
            .commit(&["b.md".to_string()], "Update b.md")
            .await
            .unwrap();
        assert!(second.is_some());
        assert_ne!(first, second);

        assert_eq!(
            log_subjects(dir.path()),
            vec!["Update b.md".to_string(), "Batch update: 2 files".to_string()]
        );
        assert_eq!(repo.lock().depth(), 0);
    }

    #[tokio::test]
    async fn test_commit_skips_when_nothing_changed() {
        if !git_available() {
            return;
        }
        let dir = TempDir::new().unwrap();
        let repo = test_repo(&dir);

        std::fs::write(dir.path().join("a.md"), "one").unwrap();
        repo.commit(&["a.md".to_string()], "Update a.md").await.unwrap();

        let again = repo.commit(&["a.md".to_string()], "Update a.md").await.unwrap();
        assert!(again.is_none());
        assert_eq!(log_subjects(dir.path()).len(), 1);
    }

    #[test]
    fn test_blocking_commit_uses_same_repository() {
        if !git_available() {
            return;
        }
        let dir = TempDir::new().unwrap();
        let repo = test_repo(&dir);

        std::fs::create_dir_all(dir.path().join("notes")).unwrap();
        std::fs::write(dir.path().join("notes/x.md"), "x").unwrap();
        let commit = repo
            .commit_paths_blocking(&["notes".to_string()], "Update notes")
            .unwrap();
        assert!(commit.is_some());
        assert!(repo
            .commit_paths_blocking(&["notes".to_string()], "Update notes")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_failed_command_reports_stderr() {
        if !git_available() {
            return;
        }
        let dir = TempDir::new().unwrap();
        let repo = test_repo(&dir);

        let err = repo.git_blocking(&["rev-parse", "HEAD"]).unwrap_err();
        match err {
            PipelineError::Vcs { command, .. } => assert_eq!(command, "git rev-parse HEAD"),
            other => panic!("unexpected error: {}", other),
        }
    }
}
