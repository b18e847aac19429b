// Concurrency limits for one run
// Semaphores for task dispatch, generation calls, filesystem writes and shell
// execution, plus per-path write locks.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard, OwnedSemaphorePermit, Semaphore};

use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};

/// Hands out one async mutex per path so two writers never touch the same file
#[derive(Default)]
pub struct PathLockManager {
    locks: std::sync::Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl PathLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn write_lock(&self, path: &Path) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = match self.locks.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            // Entries nobody else holds can go
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            locks
                .entry(path.to_path_buf())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

/// Held for the duration of one filesystem write
pub struct WriteGuard {
    _permit: OwnedSemaphorePermit,
    _path: OwnedMutexGuard<()>,
}

pub struct ResourceLimits {
    pub tasks: Arc<Semaphore>,
    pub llm: Arc<Semaphore>,
    pub fs_write: Arc<Semaphore>,
    pub shell: Arc<Semaphore>,
    pub paths: PathLockManager,
}

impl ResourceLimits {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        let size = |n: u32| (n.max(1)) as usize;
        Self {
            tasks: Arc::new(Semaphore::new(size(config.max_parallel_tasks))),
            llm: Arc::new(Semaphore::new(size(config.llm_parallel))),
            fs_write: Arc::new(Semaphore::new(size(config.fs_write_parallel))),
            shell: Arc::new(Semaphore::new(size(config.shell_parallel))),
            paths: PathLockManager::new(),
        }
    }

    pub async fn acquire_llm(&self) -> Result<OwnedSemaphorePermit> {
        self.llm
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| OrchestratorError::InvalidOperation("Failed to acquire llm permit".to_string()))
    }

    pub async fn acquire_shell(&self) -> Result<OwnedSemaphorePermit> {
        self.shell
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| OrchestratorError::InvalidOperation("Failed to acquire shell permit".to_string()))
    }

    /// fs_write permit first, then the path lock
    pub async fn write_guard(&self, path: &Path) -> Result<WriteGuard> {
        let permit = self
            .fs_write
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| {
                OrchestratorError::InvalidOperation("Failed to acquire fs_write permit".to_string())
            })?;
        let path_guard = self.paths.write_lock(path).await;
        Ok(WriteGuard {
            _permit: permit,
            _path: path_guard,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn path_write_lock_excludes_concurrent_writers() {
        let locks = Arc::new(PathLockManager::new());
        let path = PathBuf::from("/tmp/some-file.txt");

        let started = Arc::new(AtomicUsize::new(0));
        let acquired_late = Arc::new(AtomicUsize::new(0));

        let locks1 = locks.clone();
        let path1 = path.clone();
        let started1 = started.clone();
        let t1 = tokio::spawn(async move {
            let _guard = locks1.write_lock(&path1).await;
            started1.store(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(150)).await;
        });

        while started.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        let locks2 = locks.clone();
        let acquired_late2 = acquired_late.clone();
        let start = tokio::time::Instant::now();
        let t2 = tokio::spawn(async move {
            let _guard = locks2.write_lock(&path).await;
            if start.elapsed() >= Duration::from_millis(120) {
                acquired_late2.store(1, Ordering::SeqCst);
            }
        });

        t1.await.unwrap();
        t2.await.unwrap();
        assert_eq!(acquired_late.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_paths_do_not_contend() {
        let locks = PathLockManager::new();
        let _a = locks.write_lock(Path::new("/tmp/a")).await;
        let b = tokio::time::timeout(Duration::from_millis(50), locks.write_lock(Path::new("/tmp/b"))).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn limits_are_sized_from_config() {
        let config = OrchestratorConfig {
            max_parallel_tasks: 2,
            llm_parallel: 5,
            ..Default::default()
        };
        let limits = ResourceLimits::from_config(&config);
        assert_eq!(limits.tasks.available_permits(), 2);
        assert_eq!(limits.llm.available_permits(), 5);
        assert_eq!(limits.fs_write.available_permits(), 1);

        let _guard = limits.write_guard(Path::new("/tmp/x")).await.unwrap();
        assert_eq!(limits.fs_write.available_permits(), 0);
    }
}
