//! In-memory tree store for testing.
//!
//! Holds the last saved tree behind a `RwLock`. Nothing survives the
//! process. Writes can be made to fail on demand so callers can exercise
//! their persist-failure paths.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::sync::RwLock;

use crate::{ConfigTree, StorageError, TreeStore};

/// An in-memory tree store.
///
/// Clones share state, so a test can keep one handle to inspect what the
/// engine under test persisted.
///
/// # Examples
///
/// ```
/// # use watchtower_storage::{ConfigTree, MemoryStore, TreeStore};
/// # #[tokio::main]
/// # async fn main() {
/// let store = MemoryStore::new();
/// store.save(&ConfigTree::new()).await.unwrap();
/// assert!(store.load().await.unwrap().is_empty());
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    tree: Arc<RwLock<ConfigTree>>,
    fail_writes: Arc<AtomicBool>,
    saves: Arc<AtomicUsize>,
}

impl MemoryStore {
    /// Create a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-populated with `tree`.
    #[must_use]
    pub fn with_tree(tree: ConfigTree) -> Self {
        Self {
            tree: Arc::new(RwLock::new(tree)),
            ..Self::default()
        }
    }

    /// Make subsequent [`save`](TreeStore::save) calls fail (or succeed again).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Snapshot of the last successfully saved tree.
    pub async fn contents(&self) -> ConfigTree {
        self.tree.read().await.clone()
    }

    /// Number of successful saves so far.
    #[must_use]
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl TreeStore for MemoryStore {
    async fn load(&self) -> Result<ConfigTree, StorageError> {
        Ok(self.tree.read().await.clone())
    }

    async fn save(&self, tree: &ConfigTree) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StorageError::Write {
                path: "<memory>".to_owned(),
                reason: "write failure injected".to_owned(),
            });
        }
        *self.tree.write().await = tree.clone();
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
