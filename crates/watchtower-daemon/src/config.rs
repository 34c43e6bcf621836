//! Daemon configuration.
//!
//! Every setting comes from a `WATCHTOWER_*` environment variable and falls
//! back to a default when unset or unparsable.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use watchtower_core::ConfigStoreOptions;
use watchtower_core::crypto::KeyDerivation;
use watchtower_core::icmp::{DetectorConfig, ServiceIdentifier};
use zeroize::Zeroizing;

/// Daemon configuration.
#[derive(Clone)]
pub struct DaemonConfig {
    /// JSON file holding the config tree.
    pub config_file: PathBuf,
    /// Log filter used when `RUST_LOG` is unset.
    pub log_level: String,
    /// Passphrase applied at startup, if any.
    pub secret_key: Option<Zeroizing<String>>,
    /// Passphrase to AES key scheme.
    pub key_derivation: KeyDerivation,
    /// Deadline for a single config request.
    pub request_timeout: Duration,
    /// Detector timing and behaviour.
    pub detector: DetectorConfig,
    /// Services to start monitoring on boot, on top of the persisted roster.
    pub services: Vec<ServiceIdentifier>,
    /// Time between status log lines.
    pub status_interval: Duration,
    /// How long shutdown waits for background work.
    pub shutdown_timeout: Duration,
    /// Skip `mlockall` (development without `CAP_IPC_LOCK`).
    pub disable_mlock: bool,
}

impl fmt::Debug for DaemonConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DaemonConfig")
            .field("config_file", &self.config_file)
            .field("log_level", &self.log_level)
            .field("secret_key", &self.secret_key.as_ref().map(|_| "<redacted>"))
            .field("key_derivation", &self.key_derivation)
            .field("request_timeout", &self.request_timeout)
            .field("detector", &self.detector)
            .field("services", &self.services)
            .field("status_interval", &self.status_interval)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .field("disable_mlock", &self.disable_mlock)
            .finish()
    }
}

impl DaemonConfig {
    /// Load configuration from the process environment.
    ///
    /// Environment variables:
    /// - `WATCHTOWER_CONFIG_FILE`: config tree file (default: `./watchtower.json`)
    /// - `WATCHTOWER_LOG_LEVEL`: log filter (default: `info`)
    /// - `WATCHTOWER_SECRET_KEY`: passphrase to unlock secrets at startup (optional)
    /// - `WATCHTOWER_KEY_DERIVATION`: `hkdf` or `padded-legacy` (default: `hkdf`)
    /// - `WATCHTOWER_CONFIG_TIMEOUT_MS`: per-request deadline (default: `5000`)
    /// - `WATCHTOWER_ICMP_SEND_INTERVAL_MS` (default: `500`)
    /// - `WATCHTOWER_ICMP_CHECK_INTERVAL_MS` (default: `500`)
    /// - `WATCHTOWER_ICMP_LEAVE_TIMEOUT_MS` (default: `2000`)
    /// - `WATCHTOWER_ICMP_REFRESH_INTERVAL_MS` (default: `1000`)
    /// - `WATCHTOWER_ICMP_RECEIVE_FREEZE_MS` (default: `10`)
    /// - `WATCHTOWER_ICMP_ENABLE_IPV6`: probe IPv6 services (default: `true`)
    /// - `WATCHTOWER_ICMP_STRICT_REPLY`: require our echo identifier (default: `false`)
    /// - `WATCHTOWER_SERVICES`: `address=name` pairs, comma separated (optional)
    /// - `WATCHTOWER_STATUS_INTERVAL_SECS` (default: `30`)
    /// - `WATCHTOWER_SHUTDOWN_TIMEOUT_SECS` (default: `10`)
    /// - `WATCHTOWER_DISABLE_MLOCK`: skip `mlockall` (default: `false`)
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup` instead of the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let millis = |key: &str, default: u64| {
            Duration::from_millis(
                lookup(key)
                    .and_then(|v| v.trim().parse().ok())
                    .unwrap_or(default),
            )
        };
        let secs = |key: &str, default: u64| {
            Duration::from_secs(
                lookup(key)
                    .and_then(|v| v.trim().parse().ok())
                    .unwrap_or(default),
            )
        };
        let flag = |key: &str, default: bool| {
            lookup(key)
                .map(|v| v != "false" && v != "0")
                .unwrap_or(default)
        };

        let defaults = DetectorConfig::default();
        let detector = DetectorConfig {
            send_interval: millis("WATCHTOWER_ICMP_SEND_INTERVAL_MS", 500),
            check_interval: millis("WATCHTOWER_ICMP_CHECK_INTERVAL_MS", 500),
            leave_timeout: millis("WATCHTOWER_ICMP_LEAVE_TIMEOUT_MS", 2000),
            refresh_interval: millis("WATCHTOWER_ICMP_REFRESH_INTERVAL_MS", 1000),
            receive_freeze: millis("WATCHTOWER_ICMP_RECEIVE_FREEZE_MS", 10),
            enable_ipv6: flag("WATCHTOWER_ICMP_ENABLE_IPV6", defaults.enable_ipv6),
            strict_reply_match: flag("WATCHTOWER_ICMP_STRICT_REPLY", defaults.strict_reply_match),
            ..defaults
        };

        Self {
            config_file: lookup("WATCHTOWER_CONFIG_FILE")
                .map_or_else(|| PathBuf::from("./watchtower.json"), PathBuf::from),
            log_level: lookup("WATCHTOWER_LOG_LEVEL").unwrap_or_else(|| "info".to_owned()),
            secret_key: lookup("WATCHTOWER_SECRET_KEY")
                .filter(|v| !v.is_empty())
                .map(Zeroizing::new),
            key_derivation: lookup("WATCHTOWER_KEY_DERIVATION")
                .and_then(|v| v.parse().ok())
                .unwrap_or_default(),
            request_timeout: millis("WATCHTOWER_CONFIG_TIMEOUT_MS", 5000),
            detector,
            services: lookup("WATCHTOWER_SERVICES")
                .map(|v| parse_services(&v))
                .unwrap_or_default(),
            status_interval: secs("WATCHTOWER_STATUS_INTERVAL_SECS", 30),
            shutdown_timeout: secs("WATCHTOWER_SHUTDOWN_TIMEOUT_SECS", 10),
            disable_mlock: flag("WATCHTOWER_DISABLE_MLOCK", false),
        }
    }

    /// Options for the config engine.
    #[must_use]
    pub fn store_options(&self) -> ConfigStoreOptions {
        ConfigStoreOptions {
            request_timeout: self.request_timeout,
            key_derivation: self.key_derivation,
            ..ConfigStoreOptions::default()
        }
    }
}

/// Parse `10.0.0.1=db, fe80::1=router, 10.0.0.9`. An entry without a name
/// is named after its address. Empty entries are skipped; addresses are
/// validated later by the detector.
fn parse_services(raw: &str) -> Vec<ServiceIdentifier> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| match entry.split_once('=') {
            Some((address, name)) if !name.trim().is_empty() => {
                ServiceIdentifier::new(address.trim(), name.trim())
            }
            Some((address, _)) => ServiceIdentifier::new(address.trim(), address.trim()),
            None => ServiceIdentifier::new(entry, entry),
        })
        .collect()
}
