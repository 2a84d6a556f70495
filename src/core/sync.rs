//! Chain synchronizer
//!
//! [`ChainSync`] owns an [`EntryStore`] and keeps the managed iptables chain
//! mirroring it. Keys move through `Absent → Active → (Expiring | Removed) →
//! Absent`; an `Active` key is one that is in the store *and* believed to have
//! a rule in the chain.
//!
//! iptables offers no cheap way to delete "the rule for this key" without
//! repeating its exact match arguments, so removal is a rebuild: flush the
//! whole chain, then re-append every entry still in the store. Expiry takes the
//! same path.
//!
//! # Consistency
//!
//! The chain and the store are reconciled after each mutation but not
//! atomically. Without [`SyncSettings::serialize_mutations`] a rebuild can
//! interleave with a concurrent [`ChainSync::add`]: if the new rule lands in the
//! chain before the flush but is recorded in the store after the rebuild took
//! its snapshot, the rule is lost while the store still lists the key. Enabling
//! `serialize_mutations` runs every mutating operation under one per-chain lock.
//!
//! Interface rules added with [`ChainSync::add_interface`] are not tracked and
//! do not survive a rebuild.
//!
//! # Example
//!
//! ```no_run
//! use chainward::core::runner::IptablesRunner;
//! use chainward::core::sync::{ChainSync, SyncSettings};
//! use chainward::elevation::ElevationMethod;
//!
//! # async fn example() -> chainward::Result<()> {
//! let runner = IptablesRunner::locate(None, ElevationMethod::None);
//! let sync = ChainSync::new(SyncSettings::new("ALLOWLIST"), runner)?;
//!
//! sync.add("203.0.113.7").await?;
//! sync.keep_alive("203.0.113.7").await?;
//! sync.remove("203.0.113.7").await?;
//! # Ok(())
//! # }
//! ```

use crate::audit::{AuditEvent, AuditLog, EventType};
use crate::core::error::{Error, Result};
use crate::core::runner::{ChainCommand, CommandRunner};
use crate::core::snapshot;
use crate::core::store::{EntryStore, StoreEvent};
use crate::validators;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard, broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Jump target used when the caller does not name one
pub const DEFAULT_TARGET: &str = "ACCEPT";

/// Default entry lifetime
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// What a rebuild does when re-appending a surviving entry fails
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RepopulatePolicy {
    /// Log the failure and report the removal as successful
    #[default]
    BestEffort,
    /// Report the removal as failed with every key that could not be re-appended
    Strict,
}

/// How a flush-and-repopulate ended
#[derive(Debug)]
enum Rebuild {
    Done,
    /// The flush failed, so nothing was re-appended
    FlushFailed(Error),
}

fn rebuild_error(result: &Result<Rebuild>) -> Option<String> {
    match result {
        Ok(Rebuild::Done) => None,
        Ok(Rebuild::FlushFailed(e)) | Err(e) => Some(e.to_string()),
    }
}

/// Notifications re-emitted to subscribers
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// An entry's TTL elapsed; the chain has been rebuilt without it
    Expired { key: String, target: String },
    /// An out-of-band failure (store fault, expiry-triggered rebuild failure)
    Error(Arc<Error>),
}

/// Runtime settings for a [`ChainSync`]
#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub chain: String,
    pub ttl: Duration,
    pub default_target: String,
    pub serialize_mutations: bool,
    pub repopulate_policy: RepopulatePolicy,
    pub snapshot_path: Option<PathBuf>,
    pub audit_path: Option<PathBuf>,
}

impl SyncSettings {
    pub fn new(chain: impl Into<String>) -> Self {
        Self {
            chain: chain.into(),
            ttl: DEFAULT_TTL,
            default_target: DEFAULT_TARGET.to_string(),
            serialize_mutations: false,
            repopulate_policy: RepopulatePolicy::default(),
            snapshot_path: None,
            audit_path: None,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn with_serialized_mutations(mut self, enabled: bool) -> Self {
        self.serialize_mutations = enabled;
        self
    }

    pub fn with_repopulate_policy(mut self, policy: RepopulatePolicy) -> Self {
        self.repopulate_policy = policy;
        self
    }
}

struct Inner<R> {
    settings: SyncSettings,
    store: EntryStore,
    runner: Arc<R>,
    mutation_lock: Mutex<()>,
    events: broadcast::Sender<SyncEvent>,
    audit: Option<AuditLog>,
}

/// Keeps one iptables chain in step with a TTL-indexed allow-list
///
/// Cloning is cheap and every clone drives the same chain. The store's sweep
/// and the expiry listener stop once the last clone is dropped.
pub struct ChainSync<R: CommandRunner> {
    inner: Arc<Inner<R>>,
}

impl<R: CommandRunner> Clone for ChainSync<R> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<R: CommandRunner> ChainSync<R> {
    /// Creates the synchronizer, its store, and the expiry listener.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` if the chain name or default target is invalid.
    pub fn new(settings: SyncSettings, runner: R) -> Result<Self> {
        validators::validate_chain_name(&settings.chain)
            .map_err(|m| Error::validation("chain", m))?;
        validators::validate_target(&settings.default_target)
            .map_err(|m| Error::validation("default_target", m))?;
        if settings.ttl.is_zero() {
            return Err(Error::validation("ttl", "TTL must be at least one second"));
        }

        let (store, store_events) = EntryStore::new(settings.ttl, settings.snapshot_path.clone());
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let audit = settings.audit_path.clone().map(AuditLog::new);

        info!(
            chain = %settings.chain,
            ttl_secs = settings.ttl.as_secs(),
            sweep_secs = store.sweep_interval().as_secs(),
            serialize = settings.serialize_mutations,
            "Chain synchronizer started"
        );

        let inner = Arc::new(Inner {
            settings,
            store,
            runner: Arc::new(runner),
            mutation_lock: Mutex::new(()),
            events,
            audit,
        });

        tokio::spawn(watch_store(Arc::downgrade(&inner), store_events));

        Ok(Self { inner })
    }

    pub fn chain(&self) -> &str {
        &self.inner.settings.chain
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.inner.settings
    }

    /// Receives `Expired` and `Error` notifications from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    /// Admits `key` with the default target, or refreshes its TTL.
    ///
    /// See [`ChainSync::add_with_target`].
    pub async fn add(&self, key: &str) -> Result<bool> {
        let target = self.inner.settings.default_target.clone();
        self.add_with_target(key, &target).await
    }

    /// Admits `key` jumping to `target`.
    ///
    /// Returns `true` if the key was newly admitted (one append command
    /// issued), `false` if it was already active and only its TTL was
    /// refreshed. A refresh keeps the existing target.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the key or target is invalid or the append fails.
    /// A failed append records nothing.
    ///
    /// A key whose TTL elapsed before the sweep got to it is expired first
    /// (rebuild and `Expired` notification) so the chain never holds two
    /// rules for it. If that flush fails, its error is returned and nothing
    /// is appended.
    pub async fn add_with_target(&self, key: &str, target: &str) -> Result<bool> {
        let key = validators::validate_key(key).map_err(|m| Error::validation("key", m))?;
        let target =
            validators::validate_target(target).map_err(|m| Error::validation("target", m))?;

        let _guard = self.lock_mutations().await;

        if let Some(current) = self.inner.store.get(&key) {
            self.inner.store.set(&key, &current);
            debug!(key = %key, "Refreshed entry");
            return Ok(false);
        }

        // Expired but not yet swept: its rule is still in the chain
        if let Some(stale_target) = self.inner.store.take_if_expired(&key) {
            debug!(key = %key, "Expiring stale entry before re-admission");
            let flush_error = self.expire(&key, &stale_target).await;
            self.emit(SyncEvent::Expired {
                key: key.clone(),
                target: stale_target,
            });
            if let Some(e) = flush_error {
                return Err(e);
            }
        }

        let command = ChainCommand::append(self.chain(), &key, &target);
        if let Err(e) = self.inner.runner.run(&command).await {
            warn!(key = %key, "Failed to admit entry: {e}");
            self.audit(
                EventType::Admit,
                false,
                serde_json::json!({ "key": key, "target": target }),
                Some(e.to_string()),
            )
            .await;
            return Err(e);
        }

        self.inner.store.set(&key, &target);
        info!(key = %key, target = %target, "Admitted entry");
        self.audit(
            EventType::Admit,
            true,
            serde_json::json!({ "key": key, "target": target }),
            None,
        )
        .await;

        Ok(true)
    }

    /// Appends a rule matching ingress interface `interface`.
    ///
    /// The rule is not tracked: it never expires and is dropped by the next
    /// rebuild or flush. With `allow_failure` a failing command is logged and
    /// reported as success.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the interface or target is invalid, or the command
    /// fails and `allow_failure` is not set.
    pub async fn add_interface(
        &self,
        interface: &str,
        target: &str,
        allow_failure: bool,
    ) -> Result<()> {
        let interface = validators::validate_interface(interface)
            .map_err(|m| Error::validation("interface", m))?;
        let target =
            validators::validate_target(target).map_err(|m| Error::validation("target", m))?;

        let _guard = self.lock_mutations().await;

        let command = ChainCommand::append_interface(self.chain(), &interface, &target);
        let result = self.inner.runner.run(&command).await;
        self.audit(
            EventType::AddInterface,
            result.is_ok(),
            serde_json::json!({ "interface": interface, "target": target }),
            result.as_ref().err().map(ToString::to_string),
        )
        .await;

        match result {
            Ok(()) => {
                info!(interface = %interface, target = %target, "Added interface rule");
                Ok(())
            }
            Err(e) if allow_failure => {
                warn!(interface = %interface, "Ignoring failed interface rule: {e}");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Removes `key` and rebuilds the chain from the remaining entries.
    ///
    /// Returns `Ok(false)` without touching anything if the key is not active.
    /// Otherwise the key is dropped from the store first; if the chain flush
    /// then fails the result is also `Ok(false)`, and the chain and store are
    /// out of step until the next successful rebuild.
    ///
    /// # Errors
    ///
    /// Under [`RepopulatePolicy::Strict`], returns `Error::Repopulate` if any
    /// surviving entry could not be re-appended.
    pub async fn remove(&self, key: &str) -> Result<bool> {
        let key = key.trim();
        let _guard = self.lock_mutations().await;

        if !self.inner.store.exists(key) {
            return Ok(false);
        }
        self.inner.store.delete(key);

        let result = self.rebuild(key).await;
        self.audit(
            EventType::Remove,
            matches!(result, Ok(Rebuild::Done)),
            serde_json::json!({ "key": key }),
            rebuild_error(&result),
        )
        .await;

        match result? {
            Rebuild::Done => {
                info!(key = %key, "Removed entry");
                Ok(true)
            }
            Rebuild::FlushFailed(_) => Ok(false),
        }
    }

    /// Alias for [`ChainSync::add`]: refreshes an active key, admits a new one.
    pub async fn keep_alive(&self, key: &str) -> Result<bool> {
        self.add(key).await
    }

    /// Flushes the chain, including untracked interface rules. The store is untouched.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the flush fails and `allow_failure` is not set.
    pub async fn flush(&self, allow_failure: bool) -> Result<()> {
        let _guard = self.lock_mutations().await;

        let result = self.flush_chain().await;
        self.audit(
            EventType::Flush,
            result.is_ok(),
            serde_json::json!({}),
            result.as_ref().err().map(ToString::to_string),
        )
        .await;

        match result {
            Err(e) if allow_failure => {
                warn!("Ignoring failed flush of {}: {e}", self.chain());
                Ok(())
            }
            other => other,
        }
    }

    /// Flushes the chain, then forgets every entry.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the flush fails; the store is left as it was.
    pub async fn flush_all(&self) -> Result<()> {
        let _guard = self.lock_mutations().await;

        let count = self.inner.store.len();
        let result = self.flush_chain().await;
        if result.is_ok() {
            self.inner.store.flush();
            info!("Flushed {} and cleared {count} entries", self.chain());
        }
        self.audit(
            EventType::FlushAll,
            result.is_ok(),
            serde_json::json!({ "entries": count }),
            result.as_ref().err().map(ToString::to_string),
        )
        .await;

        result
    }

    /// Active entries as `key → target`. Does not query the chain.
    pub fn list(&self) -> BTreeMap<String, String> {
        self.inner.store.list().into_iter().collect()
    }

    pub fn exists(&self, key: &str) -> bool {
        self.inner.store.exists(key)
    }

    /// Re-admits entries from a snapshot whose expiry has not passed yet.
    ///
    /// Restored entries start a fresh TTL. Entries that fail to append are
    /// logged and skipped. Returns how many entries were admitted.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the snapshot exists but cannot be read or verified.
    pub async fn restore(&self, path: &Path) -> Result<usize> {
        let now = chrono::Utc::now();
        let entries = snapshot::load(path)?;
        let total = entries.len();

        let mut admitted = 0;
        for entry in entries.into_iter().filter(|e| e.expires_at > now) {
            match self.add_with_target(&entry.key, &entry.target).await {
                Ok(true) => admitted += 1,
                Ok(false) => {}
                Err(e) => warn!(key = %entry.key, "Failed to restore entry: {e}"),
            }
        }

        info!("Restored {admitted} of {total} snapshot entries");
        self.audit(
            EventType::Restore,
            true,
            serde_json::json!({ "admitted": admitted, "total": total }),
            None,
        )
        .await;

        Ok(admitted)
    }

    async fn lock_mutations(&self) -> Option<MutexGuard<'_, ()>> {
        if self.inner.settings.serialize_mutations {
            Some(self.inner.mutation_lock.lock().await)
        } else {
            None
        }
    }

    async fn flush_chain(&self) -> Result<()> {
        let command = ChainCommand::flush(self.chain());
        self.inner.runner.run(&command).await
    }

    /// Flushes the chain and re-appends every entry left in the store.
    ///
    /// `removed` is only used for logging; it must already be gone from the store.
    /// A failed flush is an outcome, not an error: nothing was re-appended and
    /// the chain still holds the old rules.
    async fn rebuild(&self, removed: &str) -> Result<Rebuild> {
        if let Err(e) = self.flush_chain().await {
            error!(key = %removed, "Chain flush failed during rebuild: {e}");
            return Ok(Rebuild::FlushFailed(e));
        }

        let remaining = self.inner.store.list();
        debug!(
            key = %removed,
            "Rebuilding {} with {} entries",
            self.chain(),
            remaining.len()
        );

        // Issue every append before awaiting any of them
        let handles: Vec<(String, JoinHandle<Result<()>>)> = remaining
            .into_iter()
            .map(|(key, target)| {
                let runner = Arc::clone(&self.inner.runner);
                let command = ChainCommand::append(self.chain(), &key, &target);
                let handle = tokio::spawn(async move { runner.run(&command).await });
                (key, handle)
            })
            .collect();

        let mut failed = Vec::new();
        for (key, handle) in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(key = %key, "Failed to re-append entry after flush: {e}");
                    failed.push(key);
                }
                Err(e) => {
                    error!(key = %key, "Re-append task failed: {e}");
                    failed.push(key);
                }
            }
        }

        if failed.is_empty() {
            return Ok(Rebuild::Done);
        }

        match self.inner.settings.repopulate_policy {
            RepopulatePolicy::BestEffort => Ok(Rebuild::Done),
            RepopulatePolicy::Strict => Err(Error::Repopulate { failed }),
        }
    }

    async fn handle_expiry(&self, key: String, target: String) {
        let _guard = self.lock_mutations().await;
        if let Some(e) = self.expire(&key, &target).await {
            self.emit(SyncEvent::Error(Arc::new(e)));
        }
        self.emit(SyncEvent::Expired { key, target });
    }

    /// Rebuilds the chain without an expired key.
    ///
    /// The key must already be gone from the store, and callers hold the
    /// mutation guard. Returns the flush error if the chain could not be
    /// flushed; a strict repopulate failure is emitted as an event instead.
    async fn expire(&self, key: &str, target: &str) -> Option<Error> {
        let result = self.rebuild(key).await;

        self.audit(
            EventType::Expire,
            matches!(result, Ok(Rebuild::Done)),
            serde_json::json!({ "key": key, "target": target }),
            rebuild_error(&result),
        )
        .await;

        match result {
            Ok(Rebuild::Done) => {
                info!(key = %key, "Expired entry removed from chain");
                None
            }
            Ok(Rebuild::FlushFailed(e)) => Some(e),
            Err(e) => {
                self.emit(SyncEvent::Error(Arc::new(e)));
                None
            }
        }
    }

    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine
        let _ = self.inner.events.send(event);
    }

    async fn audit(
        &self,
        event_type: EventType,
        success: bool,
        details: serde_json::Value,
        error: Option<String>,
    ) {
        let Some(audit) = &self.inner.audit else {
            return;
        };
        let event = AuditEvent::new(event_type, self.chain(), success, details, error);
        if let Err(e) = audit.log(&event).await {
            warn!("Failed to write audit log: {}", e);
        }
    }
}

/// Forwards store notifications: expiries trigger a rebuild, faults are re-emitted.
///
/// Holds only a weak reference between events so dropping the last
/// [`ChainSync`] shuts everything down.
async fn watch_store<R: CommandRunner>(
    inner: Weak<Inner<R>>,
    mut store_events: mpsc::UnboundedReceiver<StoreEvent>,
) {
    while let Some(event) = store_events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let sync = ChainSync { inner };

        match event {
            StoreEvent::Expired { key, target } => sync.handle_expiry(key, target).await,
            StoreEvent::Error(e) => {
                error!("Entry store error: {e}");
                sync.emit(SyncEvent::Error(Arc::new(e)));
            }
        }
    }
    debug!("Store event channel closed");
}
