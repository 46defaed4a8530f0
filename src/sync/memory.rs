use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use super::{Lease, LeaseRelease, LockError, LockProvider};

/// Process-local lock provider. Clones share the same lock table, so several
/// hosts in one process contend exactly as separate processes would.
#[derive(Clone, Default)]
pub struct MemoryLockProvider {
    held: Arc<Mutex<HashSet<String>>>,
}

impl MemoryLockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self, name: &str) -> bool {
        self.held.lock().map(|g| g.contains(name)).unwrap_or(false)
    }
}

struct MemoryRelease {
    name: String,
    held: Arc<Mutex<HashSet<String>>>,
}

impl LeaseRelease for MemoryRelease {
    fn release(&mut self) {
        if let Ok(mut g) = self.held.lock() {
            g.remove(&self.name);
        }
    }
}

#[async_trait::async_trait]
impl LockProvider for MemoryLockProvider {
    async fn try_acquire(&self, name: &str) -> Result<Option<Lease>, LockError> {
        let mut g = self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if !g.insert(name.to_string()) {
            return Ok(None);
        }
        Ok(Some(Lease::new(
            name,
            Box::new(MemoryRelease {
                name: name.to_string(),
                held: Arc::clone(&self.held),
            }),
        )))
    }
}
