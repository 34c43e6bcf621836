//! Serialized config engine.
//!
//! One worker task owns the config tree, the active secret key and the list
//! of key update listeners. [`ConfigStore`] handles push requests onto a
//! bounded queue and wait on a per-request reply channel, so operations are
//! applied one at a time in arrival order and no caller ever touches the
//! tree directly.
//!
//! Every successful mutation is written through to the [`TreeStore`] before
//! the caller is answered. A failed write is logged and the in-memory tree
//! stays authoritative.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use watchtower_storage::{ConfigTree, ConfigValue, TreeStore};
use zeroize::Zeroizing;

use crate::crypto::{self, KeyDerivation, SecretKey};
use crate::error::ConfigError;
use crate::path::ConfigPath;
use crate::tree;

/// Where the digest of the accepted secret key is persisted.
pub const SECRET_KEY_DIGEST_PATH: &str = "/config/secKeyDigest";

/// Tuning for a [`ConfigStore`].
#[derive(Debug, Clone)]
pub struct ConfigStoreOptions {
    /// Capacity of the request queue. Callers wait when it is full.
    pub queue_capacity: usize,
    /// How long a caller waits for a reply before giving up.
    pub request_timeout: Duration,
    /// How often the worker checks for a pending shutdown.
    pub shutdown_check_interval: Duration,
    /// How passphrases become AES keys.
    pub key_derivation: KeyDerivation,
}

impl Default for ConfigStoreOptions {
    fn default() -> Self {
        Self {
            queue_capacity: 100,
            request_timeout: Duration::from_secs(5),
            shutdown_check_interval: Duration::from_secs(1),
            key_derivation: KeyDerivation::default(),
        }
    }
}

type Reply<T> = oneshot::Sender<Result<T, ConfigError>>;

enum Request {
    Get {
        path: String,
        reply: Reply<ConfigValue>,
    },
    Put {
        path: String,
        value: Option<ConfigValue>,
        reply: Reply<()>,
    },
    GetSecret {
        path: String,
        reply: Reply<String>,
    },
    PutSecret {
        path: String,
        value: Option<ConfigValue>,
        reply: Reply<()>,
    },
    SetSecretKey {
        passphrase: Zeroizing<String>,
        reply: Reply<()>,
    },
    RegisterListener {
        listener: mpsc::Sender<()>,
        reply: Reply<()>,
    },
    Snapshot {
        reply: Reply<ConfigTree>,
    },
}

/// Handle to the config engine.
///
/// Cheap to clone. All clones talk to the same worker.
#[derive(Clone)]
pub struct ConfigStore {
    requests: mpsc::Sender<Request>,
    shutdown: Arc<AtomicBool>,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
    request_timeout: Duration,
}

impl fmt::Debug for ConfigStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigStore")
            .field("request_timeout", &self.request_timeout)
            .field("shutdown_requested", &self.shutdown.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl ConfigStore {
    /// Load the tree from `store` and start the worker.
    ///
    /// A string at [`SECRET_KEY_DIGEST_PATH`] becomes the digest that later
    /// [`set_secret_key`](Self::set_secret_key) calls are checked against.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Storage`] if the tree cannot be loaded.
    pub async fn spawn(
        store: Arc<dyn TreeStore>,
        options: ConfigStoreOptions,
    ) -> Result<Self, ConfigError> {
        let tree = store.load().await?;
        let digest_path = ConfigPath::parse(SECRET_KEY_DIGEST_PATH)?;
        let key_digest = stored_digest(&tree, &digest_path);
        info!(
            top_level_keys = tree.len(),
            key_digest_present = key_digest.is_some(),
            "config tree loaded"
        );

        let (tx, rx) = mpsc::channel(options.queue_capacity.max(1));
        let shutdown = Arc::new(AtomicBool::new(false));
        let worker = Worker {
            tree,
            store,
            digest_path,
            key: None,
            key_digest,
            derivation: options.key_derivation,
            listeners: Vec::new(),
        };
        let handle = tokio::spawn(worker.run(
            rx,
            Arc::clone(&shutdown),
            options.shutdown_check_interval.max(Duration::from_millis(1)),
        ));

        Ok(Self {
            requests: tx,
            shutdown,
            worker: Arc::new(Mutex::new(Some(handle))),
            request_timeout: options.request_timeout,
        })
    }

    /// Read the value at `path`.
    ///
    /// # Errors
    ///
    /// [`ConfigError::PathFormat`], [`ConfigError::PathTransitConflict`] or
    /// [`ConfigError::PathNotFound`], plus the transport errors
    /// [`ConfigError::Timeout`] and [`ConfigError::Unavailable`].
    pub async fn get(&self, path: &str) -> Result<ConfigValue, ConfigError> {
        let (reply, rx) = oneshot::channel();
        let path = path.to_owned();
        self.call("get", Request::Get { path, reply }, rx).await
    }

    /// Set (`Some`) or delete (`None`) the value at `path`.
    ///
    /// Missing intermediate trees are created on the way down.
    ///
    /// # Errors
    ///
    /// [`ConfigError::PathFormat`] or [`ConfigError::PathTransitConflict`],
    /// plus the transport errors.
    pub async fn put(&self, path: &str, value: Option<ConfigValue>) -> Result<(), ConfigError> {
        let (reply, rx) = oneshot::channel();
        let path = path.to_owned();
        self.call("put", Request::Put { path, value, reply }, rx)
            .await
    }

    /// Decrypt the secret stored at `path`.
    ///
    /// # Errors
    ///
    /// [`ConfigError::KeyNotReady`] before a key is set, the path errors,
    /// [`ConfigError::SecretPathIncomplete`],
    /// [`ConfigError::SecretTypeMismatch`],
    /// [`ConfigError::IvDecodeFailure`] or [`ConfigError::DecryptFailure`].
    pub async fn get_secret(&self, path: &str) -> Result<String, ConfigError> {
        let (reply, rx) = oneshot::channel();
        let path = path.to_owned();
        self.call("get_secret", Request::GetSecret { path, reply }, rx)
            .await
    }

    /// Encrypt and store a string secret at `path`, or delete it with `None`.
    ///
    /// Deleting does not need a key.
    ///
    /// # Errors
    ///
    /// [`ConfigError::NonTextualSecretInput`] for a non-string value,
    /// [`ConfigError::KeyNotReady`], the path errors, or
    /// [`ConfigError::EncryptFailure`].
    pub async fn put_secret(
        &self,
        path: &str,
        value: Option<ConfigValue>,
    ) -> Result<(), ConfigError> {
        let (reply, rx) = oneshot::channel();
        let path = path.to_owned();
        self.call("put_secret", Request::PutSecret { path, value, reply }, rx)
            .await
    }

    /// Offer a passphrase as the secret key.
    ///
    /// The first key ever accepted fixes the digest. After that only the
    /// same passphrase is accepted. Every acceptance signals each registered
    /// key update listener once.
    ///
    /// # Errors
    ///
    /// [`ConfigError::KeyNotReady`] for an empty passphrase and
    /// [`ConfigError::KeyDigestMismatch`] if the passphrase does not match
    /// the stored digest.
    pub async fn set_secret_key(&self, passphrase: &str) -> Result<(), ConfigError> {
        let (reply, rx) = oneshot::channel();
        let passphrase = Zeroizing::new(passphrase.to_owned());
        self.call("set_secret_key", Request::SetSecretKey { passphrase, reply }, rx)
            .await
    }

    /// Register a channel to be signalled whenever a secret key is accepted.
    ///
    /// A full channel coalesces the signal. A closed channel is dropped from
    /// the list.
    ///
    /// # Errors
    ///
    /// Only the transport errors.
    pub async fn register_key_update_listener(
        &self,
        listener: mpsc::Sender<()>,
    ) -> Result<(), ConfigError> {
        let (reply, rx) = oneshot::channel();
        self.call("register_listener", Request::RegisterListener { listener, reply }, rx)
            .await
    }

    /// Clone of the whole tree as the worker currently sees it.
    ///
    /// # Errors
    ///
    /// Only the transport errors.
    pub async fn snapshot(&self) -> Result<ConfigTree, ConfigError> {
        let (reply, rx) = oneshot::channel();
        self.call("snapshot", Request::Snapshot { reply }, rx).await
    }

    /// Read the value at `path` and deserialize it into `T`.
    ///
    /// # Errors
    ///
    /// Everything [`get`](Self::get) returns, plus
    /// [`ConfigError::Serialization`] if the value does not fit `T`.
    pub async fn get_as<T: DeserializeOwned>(&self, path: &str) -> Result<T, ConfigError> {
        let value = self.get(path).await?;
        serde_json::from_value(value.to_json()).map_err(|e| ConfigError::Serialization {
            path: path.to_owned(),
            reason: e.to_string(),
        })
    }

    /// Serialize `value` and store it at `path`. A value that serializes to
    /// `null` deletes the path.
    ///
    /// # Errors
    ///
    /// Everything [`put`](Self::put) returns, plus
    /// [`ConfigError::Serialization`] if `value` cannot be serialized.
    pub async fn put_as<T: Serialize + ?Sized>(
        &self,
        path: &str,
        value: &T,
    ) -> Result<(), ConfigError> {
        let json = serde_json::to_value(value).map_err(|e| ConfigError::Serialization {
            path: path.to_owned(),
            reason: e.to_string(),
        })?;
        self.put(path, ConfigValue::from_json(json)).await
    }

    /// Ask the worker to stop once its queue is empty. Returns immediately.
    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Request shutdown and wait for the worker to drain and exit.
    pub async fn shutdown(&self) {
        self.request_shutdown();
        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "config worker did not exit cleanly");
            }
        }
    }

    async fn call<T>(
        &self,
        operation: &'static str,
        request: Request,
        reply: oneshot::Receiver<Result<T, ConfigError>>,
    ) -> Result<T, ConfigError> {
        let deadline = Instant::now() + self.request_timeout;
        let timed_out = |_| ConfigError::Timeout {
            operation,
            timeout_ms: u64::try_from(self.request_timeout.as_millis()).unwrap_or(u64::MAX),
        };

        tokio::time::timeout_at(deadline, self.requests.send(request))
            .await
            .map_err(timed_out)?
            .map_err(|_| ConfigError::Unavailable)?;

        tokio::time::timeout_at(deadline, reply)
            .await
            .map_err(timed_out)?
            .map_err(|_| ConfigError::Unavailable)?
    }
}

fn stored_digest(tree: &ConfigTree, digest_path: &ConfigPath) -> Option<String> {
    match tree::get(tree, digest_path) {
        Ok(ConfigValue::String(digest)) => Some(digest),
        Ok(other) => {
            warn!(
                kind = other.kind(),
                "stored secret key digest is not a string, ignoring it"
            );
            None
        }
        Err(_) => None,
    }
}

struct Worker {
    tree: ConfigTree,
    store: Arc<dyn TreeStore>,
    digest_path: ConfigPath,
    key: Option<SecretKey>,
    key_digest: Option<String>,
    derivation: KeyDerivation,
    listeners: Vec<mpsc::Sender<()>>,
}

impl Worker {
    async fn run(
        mut self,
        mut requests: mpsc::Receiver<Request>,
        shutdown: Arc<AtomicBool>,
        check_every: Duration,
    ) {
        let mut ticker = tokio::time::interval_at(Instant::now() + check_every, check_every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("config worker started");

        loop {
            tokio::select! {
                request = requests.recv() => match request {
                    Some(request) => self.handle(request).await,
                    None => {
                        info!("all config handles dropped, worker stopping");
                        return;
                    }
                },
                _ = ticker.tick() => {
                    if shutdown.load(Ordering::SeqCst) && requests.is_empty() {
                        info!("config worker drained, stopping");
                        return;
                    }
                }
            }
        }
    }

    async fn handle(&mut self, request: Request) {
        match request {
            Request::Get { path, reply } => {
                let result = ConfigPath::parse(&path).and_then(|p| tree::get(&self.tree, &p));
                debug!(path = %path, ok = result.is_ok(), "config get");
                let _ = reply.send(result);
            }
            Request::Put { path, value, reply } => {
                let deleting = value.is_none();
                let result =
                    ConfigPath::parse(&path).and_then(|p| tree::put(&mut self.tree, &p, value));
                debug!(path = %path, deleting, ok = result.is_ok(), "config put");
                if result.is_ok() {
                    self.persist().await;
                }
                let _ = reply.send(result);
            }
            Request::GetSecret { path, reply } => {
                let result = self.get_secret(&path);
                debug!(path = %path, ok = result.is_ok(), "[SEC-INFO] config get secret");
                let _ = reply.send(result);
            }
            Request::PutSecret { path, value, reply } => {
                let result = self.put_secret(&path, value);
                debug!(path = %path, ok = result.is_ok(), "[SEC-INFO] config put secret");
                if result.is_ok() {
                    self.persist().await;
                }
                let _ = reply.send(result);
            }
            Request::SetSecretKey { passphrase, reply } => {
                let result = self.set_secret_key(&passphrase);
                if result.is_ok() {
                    self.persist().await;
                    self.notify_key_listeners();
                }
                let _ = reply.send(result);
            }
            Request::RegisterListener { listener, reply } => {
                self.listeners.push(listener);
                debug!(listeners = self.listeners.len(), "key update listener registered");
                let _ = reply.send(Ok(()));
            }
            Request::Snapshot { reply } => {
                let _ = reply.send(Ok(self.tree.clone()));
            }
        }
    }

    fn get_secret(&self, raw: &str) -> Result<String, ConfigError> {
        let path = ConfigPath::parse(raw)?;
        let key = self.key.as_ref().ok_or(ConfigError::KeyNotReady)?;
        let envelope = tree::get_secret_envelope(&self.tree, &path)?;
        Ok(crypto::decrypt_secret(key, &envelope.ciphertext, &envelope.iv)?)
    }

    fn put_secret(&mut self, raw: &str, value: Option<ConfigValue>) -> Result<(), ConfigError> {
        let path = ConfigPath::parse(raw)?;
        let envelope = match value {
            None => None,
            Some(value) => {
                let plaintext =
                    value
                        .as_str()
                        .ok_or_else(|| ConfigError::NonTextualSecretInput {
                            path: raw.to_owned(),
                            kind: value.kind(),
                        })?;
                let key = self.key.as_ref().ok_or(ConfigError::KeyNotReady)?;
                Some(crypto::encrypt_secret(key, plaintext)?)
            }
        };
        tree::put_secret_envelope(&mut self.tree, &path, envelope)
    }

    fn set_secret_key(&mut self, passphrase: &str) -> Result<(), ConfigError> {
        if passphrase.is_empty() {
            warn!("secret key rejected: empty passphrase");
            return Err(ConfigError::KeyNotReady);
        }
        let digest = crypto::key_digest(passphrase);
        match &self.key_digest {
            Some(stored) if !crypto::digests_match(stored, &digest) => {
                warn!("secret key rejected: digest mismatch");
                return Err(ConfigError::KeyDigestMismatch);
            }
            Some(_) => info!("secret key matches stored digest"),
            None => info!("no stored key digest, adopting new secret key"),
        }

        let key = crypto::derive_key(passphrase, self.derivation)?;
        tree::put(&mut self.tree, &self.digest_path, Some(digest.clone().into()))?;
        self.key = Some(key);
        self.key_digest = Some(digest);
        Ok(())
    }

    fn notify_key_listeners(&mut self) {
        let before = self.listeners.len();
        self.listeners.retain(|listener| match listener.try_send(()) {
            Ok(()) | Err(TrySendError::Full(())) => true,
            Err(TrySendError::Closed(())) => false,
        });
        debug!(
            listeners = self.listeners.len(),
            dropped = before - self.listeners.len(),
            "key update listeners signalled"
        );
    }

    async fn persist(&self) {
        if let Err(e) = self.store.save(&self.tree).await {
            warn!(error = %e, "failed to persist config tree, keeping in-memory state");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use watchtower_storage::{MemoryStore, StorageError};

    async fn spawn_on(memory: &MemoryStore) -> ConfigStore {
        ConfigStore::spawn(Arc::new(memory.clone()), ConfigStoreOptions::default())
            .await
            .unwrap()
    }

    fn lookup<'t>(tree: &'t ConfigTree, keys: &[&str]) -> Option<&'t ConfigValue> {
        let (last, transit) = keys.split_last()?;
        let mut node = tree;
        for key in transit {
            node = node.get(*key)?.as_tree()?;
        }
        node.get(*last)
    }

    #[tokio::test(start_paused = true)]
    async fn malformed_paths_fail_every_operation() {
        let store = spawn_on(&MemoryStore::new()).await;
        store.set_secret_key("k").await.unwrap();

        for raw in ["", "/", "a/b", "/a/"] {
            assert_eq!(store.get(raw).await.unwrap_err().code(), 1);
            assert_eq!(store.put(raw, Some(1i64.into())).await.unwrap_err().code(), 1);
            assert_eq!(store.get_secret(raw).await.unwrap_err().code(), 1);
            assert_eq!(
                store.put_secret(raw, Some("s".into())).await.unwrap_err().code(),
                1
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn put_vivifies_and_persists_before_replying() {
        let memory = MemoryStore::new();
        let store = spawn_on(&memory).await;

        store.put("/a/b/c", Some(1i64.into())).await.unwrap();

        assert_eq!(store.get("/a/b/c").await.unwrap(), ConfigValue::Integer(1));
        let persisted = memory.contents().await;
        assert_eq!(
            lookup(&persisted, &["a", "b", "c"]),
            Some(&ConfigValue::Integer(1))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn scalar_blocks_deeper_put_until_removed() {
        let store = spawn_on(&MemoryStore::new()).await;
        store.put("/a", Some("x".into())).await.unwrap();

        let err = store.put("/a/b", Some(1i64.into())).await.unwrap_err();
        assert!(matches!(err, ConfigError::PathTransitConflict { .. }));
        assert!(matches!(
            store.get("/a/b").await,
            Err(ConfigError::PathTransitConflict { .. })
        ));

        store.put("/a", None).await.unwrap();
        store.put("/a/b", Some(1i64.into())).await.unwrap();
        assert_eq!(store.get("/a/b").await.unwrap(), ConfigValue::Integer(1));
    }

    #[tokio::test(start_paused = true)]
    async fn null_put_deletes() {
        let store = spawn_on(&MemoryStore::new()).await;
        store.put("/svc/port", Some(8080i64.into())).await.unwrap();
        store.put("/svc/port", None).await.unwrap();
        assert!(matches!(
            store.get("/svc/port").await,
            Err(ConfigError::PathNotFound { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn persist_failure_does_not_fail_the_request() {
        let memory = MemoryStore::new();
        let store = spawn_on(&memory).await;
        memory.set_fail_writes(true);

        store.put("/a", Some(true.into())).await.unwrap();
        assert_eq!(store.get("/a").await.unwrap(), ConfigValue::Bool(true));
        assert!(memory.contents().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn secrets_need_a_key() {
        let store = spawn_on(&MemoryStore::new()).await;
        assert!(matches!(
            store.put_secret("/smtp/password", Some("hunter2".into())).await,
            Err(ConfigError::KeyNotReady)
        ));
        assert!(matches!(
            store.get_secret("/smtp/password").await,
            Err(ConfigError::KeyNotReady)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn secret_roundtrip_stores_only_ciphertext() {
        let memory = MemoryStore::new();
        let store = spawn_on(&memory).await;
        store.set_secret_key("passphrase").await.unwrap();

        store
            .put_secret("/smtp/password", Some("hunter2".into()))
            .await
            .unwrap();
        assert_eq!(store.get_secret("/smtp/password").await.unwrap(), "hunter2");

        let persisted = memory.contents().await;
        assert!(lookup(&persisted, &["smtp", "password"]).is_none());
        let ciphertext = lookup(&persisted, &["smtp", "password_SEC"])
            .and_then(ConfigValue::as_str)
            .unwrap();
        assert!(!ciphertext.contains("hunter2"));
        assert!(lookup(&persisted, &["smtp", "password_SEC_IV"]).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn deleting_a_secret_needs_no_key() {
        let memory = MemoryStore::new();
        let store = spawn_on(&memory).await;
        store.set_secret_key("k").await.unwrap();
        store.put_secret("/s/token", Some("t".into())).await.unwrap();
        drop(store);

        let restarted = spawn_on(&memory).await;
        restarted.put_secret("/s/token", None).await.unwrap();
        let tree = restarted.snapshot().await.unwrap();
        assert!(lookup(&tree, &["s", "token_SEC"]).is_none());
        assert!(lookup(&tree, &["s", "token_SEC_IV"]).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn non_string_secret_is_rejected() {
        let store = spawn_on(&MemoryStore::new()).await;
        store.set_secret_key("k").await.unwrap();
        let err = store
            .put_secret("/s/token", Some(42i64.into()))
            .await
            .unwrap_err();
        assert_eq!(err.code(), 27);
    }

    #[tokio::test(start_paused = true)]
    async fn damaged_envelopes_are_reported() {
        let store = spawn_on(&MemoryStore::new()).await;
        store.set_secret_key("k").await.unwrap();

        store.put("/s/a_SEC", Some("abc".into())).await.unwrap();
        assert_eq!(store.get_secret("/s/a").await.unwrap_err().code(), 4);

        store.put("/s/a_SEC_IV", Some(1i64.into())).await.unwrap();
        assert_eq!(store.get_secret("/s/a").await.unwrap_err().code(), 5);

        store.put("/s/a_SEC_IV", Some("%%%".into())).await.unwrap();
        assert_eq!(store.get_secret("/s/a").await.unwrap_err().code(), 24);

        store.put_secret("/s/b", Some("v".into())).await.unwrap();
        store
            .put("/s/b_SEC", Some("AAAAAAAAAAAAAAAAAAAAAAAAAAAA".into()))
            .await
            .unwrap();
        assert_eq!(store.get_secret("/s/b").await.unwrap_err().code(), 22);
    }

    #[tokio::test(start_paused = true)]
    async fn key_digest_gates_later_keys() {
        let memory = MemoryStore::new();
        let store = spawn_on(&memory).await;
        let (tx, mut rx) = mpsc::channel(4);
        store.register_key_update_listener(tx).await.unwrap();

        store.set_secret_key("alpha").await.unwrap();
        store.put_secret("/s/x", Some("v".into())).await.unwrap();
        assert!(rx.try_recv().is_ok());

        assert!(matches!(
            store.set_secret_key("beta").await,
            Err(ConfigError::KeyDigestMismatch)
        ));
        assert!(rx.try_recv().is_err());
        assert_eq!(store.get_secret("/s/x").await.unwrap(), "v");

        store.set_secret_key("alpha").await.unwrap();
        assert!(rx.try_recv().is_ok());

        let persisted = memory.contents().await;
        assert_eq!(
            lookup(&persisted, &["config", "secKeyDigest"]).and_then(ConfigValue::as_str),
            Some(crypto::key_digest("alpha").as_str())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn persisted_digest_survives_restart() {
        let memory = MemoryStore::new();
        let store = spawn_on(&memory).await;
        store.set_secret_key("alpha").await.unwrap();
        store.put_secret("/s/x", Some("v".into())).await.unwrap();
        store.shutdown().await;

        let restarted = spawn_on(&memory).await;
        assert!(matches!(
            restarted.get_secret("/s/x").await,
            Err(ConfigError::KeyNotReady)
        ));
        assert!(matches!(
            restarted.set_secret_key("beta").await,
            Err(ConfigError::KeyDigestMismatch)
        ));
        restarted.set_secret_key("alpha").await.unwrap();
        assert_eq!(restarted.get_secret("/s/x").await.unwrap(), "v");
    }

    #[tokio::test(start_paused = true)]
    async fn empty_passphrase_is_never_adopted() {
        let memory = MemoryStore::new();
        let store = spawn_on(&memory).await;
        let (tx, mut rx) = mpsc::channel(1);
        store.register_key_update_listener(tx).await.unwrap();

        assert!(matches!(
            store.set_secret_key("").await,
            Err(ConfigError::KeyNotReady)
        ));
        assert!(rx.try_recv().is_err());
        assert!(lookup(&memory.contents().await, &["config", "secKeyDigest"]).is_none());
        assert!(matches!(
            store.put_secret("/s/x", Some("v".into())).await,
            Err(ConfigError::KeyNotReady)
        ));

        store.set_secret_key("alpha").await.unwrap();
        assert!(rx.try_recv().is_ok());
        store.put_secret("/s/x", Some("v".into())).await.unwrap();
        assert_eq!(store.get_secret("/s/x").await.unwrap(), "v");
    }

    #[tokio::test(start_paused = true)]
    async fn non_string_digest_is_ignored() {
        let mut config = ConfigTree::new();
        config.insert("secKeyDigest".to_owned(), ConfigValue::Integer(7));
        let mut tree = ConfigTree::new();
        tree.insert("config".to_owned(), config.into());

        let store = spawn_on(&MemoryStore::with_tree(tree)).await;
        store.set_secret_key("anything").await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn full_listener_coalesces_and_closed_listener_is_dropped() {
        let store = spawn_on(&MemoryStore::new()).await;
        let (busy_tx, mut busy_rx) = mpsc::channel(1);
        let (gone_tx, gone_rx) = mpsc::channel(1);
        store.register_key_update_listener(busy_tx).await.unwrap();
        store.register_key_update_listener(gone_tx).await.unwrap();
        drop(gone_rx);

        store.set_secret_key("k").await.unwrap();
        store.set_secret_key("k").await.unwrap();
        assert!(busy_rx.try_recv().is_ok());
        assert!(busy_rx.try_recv().is_err());

        store.set_secret_key("k").await.unwrap();
        assert!(busy_rx.try_recv().is_ok());
    }

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Endpoint {
        host: String,
        port: u16,
    }

    #[tokio::test(start_paused = true)]
    async fn typed_access() {
        let store = spawn_on(&MemoryStore::new()).await;
        let endpoint = Endpoint {
            host: "10.0.0.1".to_owned(),
            port: 25,
        };
        store.put_as("/smtp/endpoint", &endpoint).await.unwrap();
        assert_eq!(
            store.get_as::<Endpoint>("/smtp/endpoint").await.unwrap(),
            endpoint
        );

        let err = store.get_as::<Vec<String>>("/smtp/endpoint").await.unwrap_err();
        assert_eq!(err.code(), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_drains_queued_requests() {
        let memory = MemoryStore::new();
        let store = spawn_on(&memory).await;

        let writers: Vec<_> = (0..20i64)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move { store.put(&format!("/bulk/k{i}"), Some(i.into())).await })
            })
            .collect();
        tokio::task::yield_now().await;
        store.shutdown().await;

        for writer in writers {
            writer.await.unwrap().unwrap();
        }
        let persisted = memory.contents().await;
        let bulk = lookup(&persisted, &["bulk"]).and_then(ConfigValue::as_tree).unwrap();
        assert_eq!(bulk.len(), 20);

        assert!(matches!(
            store.get("/bulk/k0").await,
            Err(ConfigError::Unavailable)
        ));
    }

    struct StallingStore;

    #[async_trait::async_trait]
    impl TreeStore for StallingStore {
        async fn load(&self) -> Result<ConfigTree, StorageError> {
            Ok(ConfigTree::new())
        }

        async fn save(&self, _tree: &ConfigTree) -> Result<(), StorageError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_worker_times_out_callers() {
        let options = ConfigStoreOptions {
            request_timeout: Duration::from_millis(100),
            ..ConfigStoreOptions::default()
        };
        let store = ConfigStore::spawn(Arc::new(StallingStore), options)
            .await
            .unwrap();

        let err = store.put("/a", Some(1i64.into())).await.unwrap_err();
        assert_eq!(err.code(), 40);
        let err = store.get("/a").await.unwrap_err();
        assert!(matches!(err, ConfigError::Timeout { operation: "get", .. }));
    }
}
