//! Error types for `watchtower-core`.
//!
//! Each error variant carries enough context to diagnose the problem without
//! a debugger. Crypto errors never include key material or plaintext, only
//! operation descriptions.

use watchtower_storage::StorageError;

/// Errors from cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// AES-256-GCM encryption failed.
    #[error("encryption failed: {reason}")]
    Encryption { reason: String },

    /// AES-256-GCM decryption failed (wrong key, corrupted ciphertext, or tampered tag).
    #[error("decryption failed: {reason}")]
    Decryption { reason: String },

    /// HKDF key derivation failed.
    #[error("key derivation failed: {reason}")]
    KeyDerivation { reason: String },

    /// Ciphertext is too short to contain an authentication tag.
    #[error("ciphertext too short: expected at least {expected} bytes, got {actual}")]
    CiphertextTooShort { expected: usize, actual: usize },

    /// The IV or ciphertext could not be decoded from base64, or the IV has the wrong length.
    #[error("failed to decode secret envelope: {reason}")]
    EnvelopeDecode { reason: String },
}

/// Errors from the config engine.
///
/// Every variant maps to a stable numeric code via [`ConfigError::code`].
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The path does not start with `/` or ends with `/`.
    #[error("malformed config path '{path}': must start with '/' and not end with '/'")]
    PathFormat { path: String },

    /// The leaf of the path does not exist.
    #[error("config path not found: {path}")]
    PathNotFound { path: String },

    /// A transit segment is missing (reads) or holds a non-tree value.
    #[error("cannot traverse config path '{path}' at segment '{segment}'")]
    PathTransitConflict { path: String, segment: String },

    /// The ciphertext or IV sibling of a secret is missing.
    #[error("secret at '{path}' is incomplete: ciphertext or IV is missing")]
    SecretPathIncomplete { path: String },

    /// The ciphertext or IV sibling of a secret is not a string.
    #[error("secret at '{path}' is malformed: ciphertext and IV must be strings")]
    SecretTypeMismatch { path: String },

    /// No secret key has been established yet.
    #[error("secret key is not ready")]
    KeyNotReady,

    /// A candidate secret key does not match the persisted digest.
    #[error("secret key does not match the stored digest")]
    KeyDigestMismatch,

    /// Encrypting a secret failed.
    #[error("failed to encrypt secret: {reason}")]
    EncryptFailure { reason: String },

    /// Decrypting a secret failed, including authentication failure.
    #[error("failed to decrypt secret: {reason}")]
    DecryptFailure { reason: String },

    /// The stored IV or ciphertext is not valid base64 of the expected size.
    #[error("failed to decode secret envelope: {reason}")]
    IvDecodeFailure { reason: String },

    /// Secrets must be strings.
    #[error("secret at '{path}' must be a string, got {kind}")]
    NonTextualSecretInput { path: String, kind: &'static str },

    /// A typed value could not be converted to or from the tree.
    #[error("failed to convert config value at '{path}': {reason}")]
    Serialization { path: String, reason: String },

    /// The caller-side deadline elapsed before the worker replied.
    #[error("config {operation} timed out after {timeout_ms}ms")]
    Timeout {
        operation: &'static str,
        timeout_ms: u64,
    },

    /// The config worker has stopped.
    #[error("config engine is not running")]
    Unavailable,

    /// The backing store could not be opened or loaded.
    #[error("config storage error: {0}")]
    Storage(#[from] StorageError),
}

impl ConfigError {
    /// Stable numeric code for this error kind. `0` is reserved for success.
    #[must_use]
    pub fn code(&self) -> u16 {
        match self {
            Self::PathFormat { .. } => 1,
            Self::PathNotFound { .. } => 2,
            Self::PathTransitConflict { .. } => 3,
            Self::SecretPathIncomplete { .. } => 4,
            Self::SecretTypeMismatch { .. } => 5,
            Self::EncryptFailure { .. } => 21,
            Self::DecryptFailure { .. } => 22,
            Self::IvDecodeFailure { .. } => 24,
            Self::KeyNotReady => 26,
            Self::NonTextualSecretInput { .. } => 27,
            Self::KeyDigestMismatch => 28,
            Self::Timeout { .. } => 40,
            Self::Unavailable => 41,
            Self::Serialization { .. } => 42,
            Self::Storage(_) => 43,
        }
    }

    /// Whether this error means "nothing is stored there" rather than a fault.
    #[must_use]
    pub fn is_absent(&self) -> bool {
        matches!(
            self,
            Self::PathNotFound { .. } | Self::PathTransitConflict { .. }
        )
    }
}

impl From<CryptoError> for ConfigError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::Encryption { reason } | CryptoError::KeyDerivation { reason } => {
                Self::EncryptFailure { reason }
            }
            CryptoError::Decryption { reason } => Self::DecryptFailure { reason },
            CryptoError::CiphertextTooShort { expected, actual } => Self::DecryptFailure {
                reason: format!("ciphertext too short: expected at least {expected} bytes, got {actual}"),
            },
            CryptoError::EnvelopeDecode { reason } => Self::IvDecodeFailure { reason },
        }
    }
}

/// Errors from ICMP packet encoding and parsing.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PacketError {
    /// The buffer is shorter than the header it must contain.
    #[error("packet too short: expected at least {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },

    /// The IPv4 header is not well formed.
    #[error("malformed IPv4 header: {reason}")]
    BadIpHeader { reason: String },

    /// The message is not an echo request or reply for the expected family.
    #[error("not an echo message: type {icmp_type} code {code}")]
    NotEcho { icmp_type: u8, code: u8 },

    /// The ICMPv4 checksum does not verify.
    #[error("bad ICMP checksum: computed {computed:#06x}, carried {carried:#06x}")]
    Checksum { computed: u16, carried: u16 },
}

/// Errors from starting the ICMP liveness detector.
#[derive(Debug, thiserror::Error)]
pub enum DetectorError {
    /// A raw ICMP socket could not be opened.
    #[error("failed to open {family} ICMP socket: {reason}")]
    Socket { family: &'static str, reason: String },

    /// The service roster could not be initialized in the config engine.
    #[error("failed to initialize service roster: {0}")]
    Roster(#[from] ConfigError),
}

/// Errors from notification and topology sinks.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    /// The sink could not deliver the message.
    #[error("{sink} delivery failed: {reason}")]
    Delivery { sink: &'static str, reason: String },
}
