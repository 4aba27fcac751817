/// Reentrant repository lock
///
/// Keyed by the canonical repository path. The owner is the current tokio
/// task when there is one, otherwise the current thread, so a task keeps
/// ownership across `.await` points even when it migrates between workers.
use crate::error::{PipelineError, PipelineResult};
use parking_lot::{Condvar, Mutex};
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
    thread::{self, ThreadId},
    time::{Duration, Instant},
};
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Owner {
    Thread(ThreadId),
    Task(tokio::task::Id),
}

impl Owner {
    fn current() -> Self {
        match tokio::task::try_id() {
            Some(id) => Owner::Task(id),
            None => Owner::Thread(thread::current().id()),
        }
    }
}

#[derive(Debug, Default)]
struct LockState {
    owner: Option<Owner>,
    depth: usize,
}

/// Reentrant mutex serializing all writes to one repository
#[derive(Debug)]
pub struct RepositoryLock {
    key: PathBuf,
    state: Mutex<LockState>,
    released: Condvar,
    notify: Notify,
}

impl RepositoryLock {
    fn new(key: PathBuf) -> Self {
        Self {
            key,
            state: Mutex::new(LockState::default()),
            released: Condvar::new(),
            notify: Notify::new(),
        }
    }

    /// Canonical path this lock guards
    pub fn key(&self) -> &Path {
        &self.key
    }

    /// Nesting depth held by the current owner (0 when free)
    pub fn depth(&self) -> usize {
        self.state.lock().depth
    }

    fn try_enter(state: &mut LockState, me: Owner) -> bool {
        match state.owner {
            None => {
                state.owner = Some(me);
                state.depth = 1;
                true
            }
            Some(owner) if owner == me => {
                state.depth += 1;
                true
            }
            Some(_) => false,
        }
    }

    /// Acquire from async code; re-entry by the same task never waits
    pub async fn acquire(self: &Arc<Self>) -> RepositoryGuard {
        let me = Owner::current();
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a release in between is not missed
            notified.as_mut().enable();

            let entered = Self::try_enter(&mut self.state.lock(), me);
            if entered {
                return RepositoryGuard { lock: Arc::clone(self) };
            }
            notified.await;
        }
    }

    /// Async acquisition bounded by `timeout`
    pub async fn acquire_timeout(self: &Arc<Self>, timeout: Duration) -> PipelineResult<RepositoryGuard> {
        tokio::time::timeout(timeout, self.acquire())
            .await
            .map_err(|_| PipelineError::LockTimeout(self.key.display().to_string()))
    }

    /// Acquire from a plain thread. Blocks the caller; never use on a runtime worker.
    pub fn acquire_blocking(self: &Arc<Self>) -> RepositoryGuard {
        let me = Owner::current();
        let mut state = self.state.lock();
        while !Self::try_enter(&mut state, me) {
            self.released.wait(&mut state);
        }
        RepositoryGuard { lock: Arc::clone(self) }
    }

    /// Blocking acquisition bounded by `timeout`
    pub fn acquire_blocking_timeout(self: &Arc<Self>, timeout: Duration) -> PipelineResult<RepositoryGuard> {
        let me = Owner::current();
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if Self::try_enter(&mut state, me) {
                return Ok(RepositoryGuard { lock: Arc::clone(self) });
            }
            if self.released.wait_until(&mut state, deadline).timed_out() {
                if Self::try_enter(&mut state, me) {
                    return Ok(RepositoryGuard { lock: Arc::clone(self) });
                }
                return Err(PipelineError::LockTimeout(self.key.display().to_string()));
            }
        }
    }

    fn release(&self) {
        let mut state = self.state.lock();
        state.depth = state.depth.saturating_sub(1);
        if state.depth > 0 {
            return;
        }
        state.owner = None;
        drop(state);

        self.released.notify_all();
        self.notify.notify_waiters();
    }
}

/// Held ownership of a `RepositoryLock`; one nesting level is released on drop
#[must_use = "the lock is released as soon as the guard is dropped"]
#[derive(Debug)]
pub struct RepositoryGuard {
    lock: Arc<RepositoryLock>,
}

impl RepositoryGuard {
    pub fn key(&self) -> &Path {
        self.lock.key()
    }
}

impl Drop for RepositoryGuard {
    fn drop(&mut self) {
        self.lock.release();
    }
}

/// Registry handing out one lock per canonical repository path
#[derive(Debug, Clone, Default)]
pub struct RepositoryLocks {
    locks: Arc<Mutex<HashMap<PathBuf, Arc<RepositoryLock>>>>,
}

impl RepositoryLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock for the repository at `root`. Symlinks are resolved, so aliases share a lock.
    pub fn for_root(&self, root: &Path) -> PipelineResult<Arc<RepositoryLock>> {
        let key = std::fs::canonicalize(root)?;
        let mut locks = self.locks.lock();
        let lock = locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(RepositoryLock::new(key)));
        Ok(Arc::clone(lock))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn test_lock(dir: &TempDir) -> Arc<RepositoryLock> {
        RepositoryLocks::new().for_root(dir.path()).unwrap()
    }

    #[test]
    fn test_blocking_acquire_is_reentrant() {
        let dir = TempDir::new().unwrap();
        let lock = test_lock(&dir);

        let outer = lock.acquire_blocking();
        let inner = lock.acquire_blocking();
        assert_eq!(lock.depth(), 2);

        drop(inner);
        assert_eq!(lock.depth(), 1);
        drop(outer);
        assert_eq!(lock.depth(), 0);
    }

    #[test]
    fn test_blocking_timeout_when_held_by_other_thread() {
        let dir = TempDir::new().unwrap();
        let lock = test_lock(&dir);
        let _guard = lock.acquire_blocking();

        let other = Arc::clone(&lock);
        let result = thread::spawn(move || {
            other
                .acquire_blocking_timeout(Duration::from_millis(50))
                .map(|_| ())
        })
        .join()
        .unwrap();

        assert!(matches!(result, Err(PipelineError::LockTimeout(_))));
    }

    #[test]
    fn test_blocking_waiter_proceeds_after_release() {
        let dir = TempDir::new().unwrap();
        let lock = test_lock(&dir);
        let guard = lock.acquire_blocking();

        let other = Arc::clone(&lock);
        let waiter = thread::spawn(move || {
            let _guard = other.acquire_blocking_timeout(Duration::from_secs(5)).unwrap();
        });

        thread::sleep(Duration::from_millis(20));
        drop(guard);
        waiter.join().unwrap();
        assert_eq!(lock.depth(), 0);
    }

    #[test]
    fn test_async_acquire_is_reentrant() {
        let dir = TempDir::new().unwrap();
        let lock = test_lock(&dir);

        tokio_test::block_on(async {
            let outer = lock.acquire().await;
            let inner = lock.acquire().await;
            assert_eq!(lock.depth(), 2);
            drop(inner);
            drop(outer);
        });
        assert_eq!(lock.depth(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_async_tasks_are_serialized() {
        let dir = TempDir::new().unwrap();
        let lock = test_lock(&dir);
        let inside = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let lock = Arc::clone(&lock);
            let inside = Arc::clone(&inside);
            handles.push(tokio::spawn(async move {
                let _guard = lock.acquire().await;
                assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                tokio::time::sleep(Duration::from_millis(5)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(lock.depth(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_async_timeout_while_thread_holds_lock() {
        let dir = TempDir::new().unwrap();
        let lock = test_lock(&dir);

        let holder = Arc::clone(&lock);
        let (held_tx, held_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();
        let thread = thread::spawn(move || {
            let _guard = holder.acquire_blocking();
            held_tx.send(()).unwrap();
            release_rx.recv().unwrap();
        });
        held_rx.recv().unwrap();

        let result = lock.acquire_timeout(Duration::from_millis(50)).await;
        assert!(matches!(result, Err(PipelineError::LockTimeout(_))));

        release_tx.send(()).unwrap();
        thread.join().unwrap();
        let _guard = lock.acquire_timeout(Duration::from_secs(5)).await.unwrap();
    }

    #[test]
    fn test_registry_shares_lock_across_aliases() {
        let dir = TempDir::new().unwrap();
        let locks = RepositoryLocks::new();

        let direct = locks.for_root(dir.path()).unwrap();
        let dotted = locks.for_root(&dir.path().join(".")).unwrap();
        assert!(Arc::ptr_eq(&direct, &dotted));

        let other = TempDir::new().unwrap();
        assert!(!Arc::ptr_eq(&direct, &locks.for_root(other.path()).unwrap()));
    }
}
