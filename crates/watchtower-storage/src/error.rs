//! Storage error types.
//!
//! Every error variant names the file it was operating on, so a failed
//! persist can be diagnosed from the log line alone.

/// Errors that can occur while loading or saving a config tree.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Failed to open or create the backing file.
    #[error("failed to open config store at '{path}': {reason}")]
    Open { path: String, reason: String },

    /// Failed to read the backing file.
    #[error("failed to read config store at '{path}': {reason}")]
    Read { path: String, reason: String },

    /// Failed to write the backing file.
    #[error("failed to write config store at '{path}': {reason}")]
    Write { path: String, reason: String },

    /// The stored document is not a valid config tree.
    #[error("malformed config document at '{path}': {reason}")]
    Format { path: String, reason: String },
}
