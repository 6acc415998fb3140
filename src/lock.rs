//! # Mutation Lock
//!
//! One exclusive lock for "any write to the live source tree". The
//! foreground command path and the scheduler's background tasks both hold
//! it for the whole validate + confirm + apply sequence. Read-only scans do
//! not take it.
//!
//! Acquisition is bounded: a waiter gives up after its timeout and learns
//! who was holding the lock.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex as SyncMutex;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Lock acquisition failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LockError {
    /// The lock stayed held for the whole wait.
    #[error("mutation lock held by '{holder}'; gave up after {waited:?}")]
    Timeout {
        /// Who held the lock when we gave up.
        holder: String,
        /// How long we waited.
        waited: Duration,
    },
}

/// Process-wide exclusion for live-tree writes.
///
/// Cheap to clone; clones share the same lock.
#[derive(Debug, Clone, Default)]
pub struct MutationLock {
    inner: Arc<Mutex<()>>,
    holder: Arc<SyncMutex<Option<String>>>,
}

/// Proof of exclusive access; released on drop.
#[derive(Debug)]
pub struct MutationGuard {
    _guard: OwnedMutexGuard<()>,
    holder: Arc<SyncMutex<Option<String>>>,
    name: String,
    acquired: Instant,
}

impl MutationGuard {
    /// Name passed to [`MutationLock::acquire`].
    pub fn holder(&self) -> &str {
        &self.name
    }
}

impl Drop for MutationGuard {
    fn drop(&mut self) {
        *self.holder.lock() = None;
        tracing::debug!(
            holder = %self.name,
            held_ms = self.acquired.elapsed().as_millis() as u64,
            "lock: released"
        );
    }
}

impl MutationLock {
    /// A fresh, unheld lock.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait up to `timeout` for exclusive access.
    ///
    /// # Errors
    ///
    /// [`LockError::Timeout`] naming the current holder.
    pub async fn acquire(&self, holder: &str, timeout: Duration) -> Result<MutationGuard, LockError> {
        let started = Instant::now();
        match tokio::time::timeout(timeout, Arc::clone(&self.inner).lock_owned()).await {
            Ok(guard) => {
                *self.holder.lock() = Some(holder.to_string());
                tracing::debug!(
                    holder,
                    waited_ms = started.elapsed().as_millis() as u64,
                    "lock: acquired"
                );
                Ok(MutationGuard {
                    _guard: guard,
                    holder: Arc::clone(&self.holder),
                    name: holder.to_string(),
                    acquired: Instant::now(),
                })
            }
            Err(_) => {
                let current = self.holder().unwrap_or_else(|| "unknown".to_string());
                tracing::warn!(holder, current = %current, ?timeout, "lock: acquisition timed out");
                Err(LockError::Timeout {
                    holder: current,
                    waited: timeout,
                })
            }
        }
    }

    /// Who holds the lock right now, if anyone.
    pub fn holder(&self) -> Option<String> {
        self.holder.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_and_release_records_holder() {
        let lock = MutationLock::new();
        {
            let guard = lock.acquire("improve", Duration::from_secs(1)).await.expect("test: acquire");
            assert_eq!(guard.holder(), "improve");
            assert_eq!(lock.holder().as_deref(), Some("improve"));
        }
        assert_eq!(lock.holder(), None);
    }

    #[tokio::test]
    async fn test_second_acquire_times_out_and_names_holder() {
        let lock = MutationLock::new();
        let _held = lock.acquire("self_check", Duration::from_secs(1)).await.expect("test: acquire");
        let err = lock
            .clone()
            .acquire("improve", Duration::from_millis(20))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            LockError::Timeout {
                holder: "self_check".into(),
                waited: Duration::from_millis(20),
            }
        );
    }

    #[tokio::test]
    async fn test_waiter_proceeds_after_release() {
        let lock = MutationLock::new();
        let held = lock.acquire("first", Duration::from_secs(1)).await.expect("test: acquire");
        let other = lock.clone();
        let waiter = tokio::spawn(async move {
            other
                .acquire("second", Duration::from_secs(5))
                .await
                .map(|g| g.holder().to_string())
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);
        let name = waiter.await.expect("test: join").expect("test: acquire");
        assert_eq!(name, "second");
    }
}
