use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::utils::paths::sanitize_folder_name;

/// One async lock per (title, version) pair, shared by install and uninstall
/// so the two never touch the same version directory at once. Pairs are keyed
/// by their sanitized directory names.
#[derive(Clone, Default)]
pub struct VersionLocks {
    inner: Arc<Mutex<HashMap<(String, String), Arc<AsyncMutex<()>>>>>,
}

impl VersionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, title: &str, version: &str) -> OwnedMutexGuard<()> {
        let lock = self.slot(title, version);
        lock.lock_owned().await
    }

    pub fn try_acquire(&self, title: &str, version: &str) -> Option<OwnedMutexGuard<()>> {
        self.slot(title, version).try_lock_owned().ok()
    }

    fn slot(&self, title: &str, version: &str) -> Arc<AsyncMutex<()>> {
        let mut map = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        // Drop slots nobody holds so the map tracks only live pairs.
        map.retain(|_, lock| Arc::strong_count(lock) > 1);
        map.entry((sanitize_folder_name(title), sanitize_folder_name(version)))
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }
}
