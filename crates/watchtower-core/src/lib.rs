//! Core library for `Watchtower`.
//!
//! Contains the serialized config engine with its secret cipher, config path
//! traversal, and the ICMP liveness detector that keeps its service roster in
//! the config engine. This crate depends on `watchtower-storage` for the
//! durable tree store and knows nothing about HTTP, mail, or chat transports.

pub mod config;
pub mod crypto;
pub mod error;
pub mod icmp;
pub mod path;
pub mod tree;

pub use config::{ConfigStore, ConfigStoreOptions, SECRET_KEY_DIGEST_PATH};
pub use error::{ConfigError, CryptoError, DetectorError, NotifyError, PacketError};
pub use path::ConfigPath;
