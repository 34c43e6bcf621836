//! JSON file tree store, the production default.
//!
//! The whole tree is one JSON object. Saves write a sibling temporary file,
//! flush it to disk, then rename it over the original, so a crash mid-write
//! leaves either the old or the new document and never a torn one.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::{ConfigTree, StorageError, TreeStore, tree_from_json_map};

/// A tree store backed by a single JSON file.
///
/// # Examples
///
/// ```no_run
/// # use watchtower_storage::FileStore;
/// # #[tokio::main]
/// # async fn main() {
/// let store = FileStore::open("/var/lib/watchtower/config.json").await.unwrap();
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    /// Open the store at `path`, creating an empty file if none exists.
    ///
    /// Parent directories are created as needed.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Open`] if the file does not exist and cannot
    /// be created.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let open_err = |e: std::io::Error| StorageError::Open {
            path: path.display().to_string(),
            reason: e.to_string(),
        };

        if !tokio::fs::try_exists(&path).await.map_err(open_err)? {
            warn!(path = %path.display(), "config file not found, creating it");
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await.map_err(open_err)?;
            }
            tokio::fs::File::create(&path).await.map_err(open_err)?;
        }

        Ok(Self { path })
    }

    /// Return the filesystem path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = OsString::from(self.path.as_os_str());
        name.push(".tmp");
        PathBuf::from(name)
    }

    fn display(&self) -> String {
        self.path.display().to_string()
    }
}

#[async_trait::async_trait]
impl TreeStore for FileStore {
    async fn load(&self) -> Result<ConfigTree, StorageError> {
        let content = tokio::fs::read(&self.path)
            .await
            .map_err(|e| StorageError::Read {
                path: self.display(),
                reason: e.to_string(),
            })?;

        if content.iter().all(u8::is_ascii_whitespace) {
            debug!(path = %self.path.display(), "config file is empty");
            return Ok(ConfigTree::new());
        }

        let document: serde_json::Value =
            serde_json::from_slice(&content).map_err(|e| StorageError::Format {
                path: self.display(),
                reason: e.to_string(),
            })?;

        match document {
            serde_json::Value::Object(map) => Ok(tree_from_json_map(map)),
            serde_json::Value::Null => Ok(ConfigTree::new()),
            other => Err(StorageError::Format {
                path: self.display(),
                reason: format!("top-level document must be an object, found {other}"),
            }),
        }
    }

    async fn save(&self, tree: &ConfigTree) -> Result<(), StorageError> {
        let write_err = |e: &dyn std::fmt::Display| StorageError::Write {
            path: self.display(),
            reason: e.to_string(),
        };

        let mut bytes = serde_json::to_vec_pretty(tree).map_err(|e| write_err(&e))?;
        bytes.push(b'\n');

        let temp = self.temp_path();
        let mut file = tokio::fs::File::create(&temp)
            .await
            .map_err(|e| write_err(&e))?;
        file.write_all(&bytes).await.map_err(|e| write_err(&e))?;
        file.sync_all().await.map_err(|e| write_err(&e))?;
        drop(file);

        tokio::fs::rename(&temp, &self.path)
            .await
            .map_err(|e| write_err(&e))?;

        debug!(path = %self.path.display(), bytes = bytes.len(), "config tree persisted");
        Ok(())
    }
}
