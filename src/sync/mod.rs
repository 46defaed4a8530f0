//! Distributed mutual exclusion.
//!
//! A [`LockProvider`] hands out [`Lease`]s for named resources. Holding a lease
//! is the only right to mutate the guarded resource: workflow instances use it
//! for single ownership across hosts, the file transport uses it as the
//! message reservation itself.

use std::fmt;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

/// File-lock backed provider (cross-process).
pub mod file;
/// Process-local provider.
pub mod memory;

pub use file::FileLockProvider;
pub use memory::MemoryLockProvider;

/// Poll period used by the default [`LockProvider::wait`].
pub const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock i/o failure for {name}: {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("timed out after {waited:?} waiting for lock {name}")]
    Timeout { name: String, waited: Duration },
}

/// Releases the underlying resource of a lease. Called at most once.
pub trait LeaseRelease: Send + Sync {
    fn release(&mut self);
}

/// Exclusive hold on a named resource; released on [`Lease::release`] or drop.
pub struct Lease {
    name: String,
    releaser: Option<Box<dyn LeaseRelease>>,
}

impl Lease {
    pub fn new(name: impl Into<String>, releaser: Box<dyn LeaseRelease>) -> Self {
        Self {
            name: name.into(),
            releaser: Some(releaser),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let Some(mut releaser) = self.releaser.take() {
            releaser.release();
            tracing::trace!(target: "flowhost::sync", lock = %self.name, "lease released");
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.release_inner();
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lease")
            .field("name", &self.name)
            .field("held", &self.releaser.is_some())
            .finish()
    }
}

/// Capability to acquire exclusive leases on named resources.
#[async_trait::async_trait]
pub trait LockProvider: Send + Sync {
    /// Non-blocking attempt; `Ok(None)` when another holder owns the name.
    async fn try_acquire(&self, name: &str) -> Result<Option<Lease>, LockError>;

    /// Wait up to `timeout` for the lease. `Ok(None)` on timeout, which callers
    /// treat as a retryable failure, never as permission to proceed.
    async fn wait(&self, name: &str, timeout: Duration) -> Result<Option<Lease>, LockError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(lease) = self.try_acquire(name).await? {
                return Ok(Some(lease));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(LOCK_POLL_INTERVAL.min(deadline.saturating_duration_since(Instant::now()))).await;
        }
    }
}

/// Lock name guarding a workflow instance.
pub fn instance_lock_name(instance_id: &str) -> String {
    format!("workflow-{instance_id}")
}
