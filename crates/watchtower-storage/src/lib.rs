//! Durable tree store for `Watchtower`.
//!
//! This crate defines the [`TreeStore`] trait, a whole-document persistence
//! interface for the nested config tree. It knows nothing about paths,
//! secrets, or concurrency; the config engine in `watchtower-core` owns the
//! in-memory tree and calls [`TreeStore::save`] after every mutation.
//!
//! Two implementations are provided:
//!
//! - [`FileStore`]: production default, a JSON document on disk
//! - [`MemoryStore`]: in-memory, for testing only

mod error;
mod file;
mod memory;
mod value;

pub use error::StorageError;
pub use file::FileStore;
pub use memory::MemoryStore;
pub use value::{ConfigTree, ConfigValue, tree_from_json_map};

/// A pluggable whole-tree storage backend.
///
/// Implementations must be safe to share across async tasks (`Send + Sync`).
/// The store itself provides no concurrency control; callers are expected to
/// serialize access.
#[async_trait::async_trait]
pub trait TreeStore: Send + Sync + 'static {
    /// Load the full tree.
    ///
    /// An empty document loads as an empty tree.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Read`] if the backend cannot be read, or
    /// [`StorageError::Format`] if the document is not a tree.
    async fn load(&self) -> Result<ConfigTree, StorageError>;

    /// Replace the persisted tree with `tree`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Write`] if the backend cannot be written.
    async fn save(&self, tree: &ConfigTree) -> Result<(), StorageError>;
}
