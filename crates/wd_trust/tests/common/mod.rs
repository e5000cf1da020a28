#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::mpsc::UnboundedReceiver;
use wd_crypto::KdfParams;
use wd_proto::Role;
use wd_store::{MemoryRecordStore, MemoryVault, RecordStore, StoreError, Watch};
use wd_trust::{AdminAlert, ChannelNotifier, ManualClock, TrustConfig, TrustCore};

pub const PASSCODE: &str = "246810";
pub const WRONG: &str = "000000";

pub fn test_config() -> TrustConfig {
    TrustConfig {
        kdf: KdfParams::insecure_fast(),
        ..TrustConfig::default()
    }
}

/// Shared backend plus one device's view of it.
pub struct Harness {
    pub store: Arc<MemoryRecordStore>,
    /// The backend `core` talks to; wraps `store`.
    pub backend: Arc<FaultyStore>,
    pub clock: Arc<ManualClock>,
    pub core: TrustCore,
    pub vault: Arc<MemoryVault>,
    pub alerts: UnboundedReceiver<AdminAlert>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: TrustConfig) -> Self {
        Self::build(config, Duration::ZERO)
    }

    /// Core whose reads from the shared store take `delay`, widening every
    /// read-then-write window.
    pub fn with_slow_reads(delay: Duration) -> Self {
        let config = TrustConfig {
            max_update_retries: 64,
            ..test_config()
        };
        Self::build(config, delay)
    }

    fn build(config: TrustConfig, read_delay: Duration) -> Self {
        let store = Arc::new(MemoryRecordStore::new());
        let backend = Arc::new(FaultyStore {
            inner: store.clone(),
            read_delay,
            failing_field_swaps: AtomicU32::new(0),
            contended_prefix: Mutex::new(None),
        });
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()));
        let (notifier, alerts) = ChannelNotifier::new();
        let vault = Arc::new(MemoryVault::new());
        let core = TrustCore::new(
            config,
            backend.clone() as Arc<dyn RecordStore>,
            vault.clone(),
            Arc::new(notifier),
            clock.clone(),
        )
        .unwrap();
        Self {
            store,
            backend,
            clock,
            core,
            vault,
            alerts,
        }
    }

    /// Another device against the same backend and clock, with an empty
    /// local vault.
    pub fn second_device(&self) -> TrustCore {
        let (notifier, _rx) = ChannelNotifier::new();
        TrustCore::new(
            self.core.config().clone(),
            self.store.clone() as Arc<dyn RecordStore>,
            Arc::new(MemoryVault::new()),
            Arc::new(notifier),
            self.clock.clone(),
        )
        .unwrap()
    }

    pub fn drain_alerts(&mut self) -> Vec<AdminAlert> {
        let mut out = Vec::new();
        while let Ok(a) = self.alerts.try_recv() {
            out.push(a);
        }
        out
    }

    /// Registered account with passcode set, claimed by device "A".
    pub async fn onboarded(&self, user_id: &str) {
        self.core.register_account(user_id, user_id).await.unwrap();
        self.core.setup_passcode(user_id, PASSCODE).await.unwrap();
        self.core.login(user_id, "A").await.unwrap();
    }

    pub async fn admin(&self, user_id: &str) {
        self.core.register_account(user_id, user_id).await.unwrap();
        self.core.grant_role(user_id, Role::Admin, None).await.unwrap();
    }
}

/// Delegating store with injectable slowness and failures.
pub struct FaultyStore {
    pub inner: Arc<MemoryRecordStore>,
    pub read_delay: Duration,
    failing_field_swaps: AtomicU32,
    contended_prefix: Mutex<Option<String>>,
}

impl FaultyStore {
    /// Make the next `n` field-level swaps fail without touching the data.
    pub fn fail_field_swaps(&self, n: u32) {
        self.failing_field_swaps.store(n, Ordering::SeqCst);
    }

    /// Every whole-record swap under `prefix` loses, as if another writer
    /// always got there first.
    pub fn contend(&self, prefix: &str) {
        *self.contended_prefix.lock() = Some(prefix.to_owned());
    }

    async fn pause(&self) {
        if !self.read_delay.is_zero() {
            tokio::time::sleep(self.read_delay).await;
        }
    }
}

#[async_trait]
impl RecordStore for FaultyStore {
    async fn get(&self, path: &str) -> Result<Option<Value>, StoreError> {
        self.pause().await;
        self.inner.get(path).await
    }

    async fn set(&self, path: &str, value: Value) -> Result<(), StoreError> {
        self.inner.set(path, value).await
    }

    async fn update(&self, path: &str, fields: Map<String, Value>) -> Result<Value, StoreError> {
        self.inner.update(path, fields).await
    }

    async fn remove(&self, path: &str) -> Result<bool, StoreError> {
        self.inner.remove(path).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Value)>, StoreError> {
        self.pause().await;
        self.inner.list(prefix).await
    }

    async fn remove_prefix(&self, prefix: &str) -> Result<usize, StoreError> {
        self.inner.remove_prefix(prefix).await
    }

    async fn compare_and_swap(
        &self,
        path: &str,
        expected: Option<&Value>,
        new: Option<Value>,
    ) -> Result<bool, StoreError> {
        let contended = self
            .contended_prefix
            .lock()
            .as_deref()
            .is_some_and(|prefix| path.starts_with(prefix));
        if contended {
            return Ok(false);
        }
        self.inner.compare_and_swap(path, expected, new).await
    }

    async fn swap_field(&self, path: &str, pointer: &str, expected: &Value, new: Value) -> Result<bool, StoreError> {
        let armed = self
            .failing_field_swaps
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if armed {
            return Err(StoreError::Io(std::io::Error::other("backend unavailable")));
        }
        self.inner.swap_field(path, pointer, expected, new).await
    }

    fn watch(&self, prefix: &str) -> Watch {
        self.inner.watch(prefix)
    }
}
