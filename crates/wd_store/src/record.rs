use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::broadcast;
use tracing::warn;

use crate::error::StoreError;

/// Change notification for a single path.
#[derive(Debug, Clone, PartialEq)]
pub enum RecordEvent {
    Set { path: String, value: Value },
    Removed { path: String },
}

impl RecordEvent {
    pub fn path(&self) -> &str {
        match self {
            RecordEvent::Set { path, .. } | RecordEvent::Removed { path } => path,
        }
    }
}

/// Path-addressed JSON document store with live change subscription.
///
/// `compare_and_swap` and `swap_field` are the only primitives that may be
/// used for state that several devices race to update.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get(&self, path: &str) -> Result<Option<Value>, StoreError>;

    async fn set(&self, path: &str, value: Value) -> Result<(), StoreError>;

    /// Shallow-merge `fields` into the object at `path`, creating it when
    /// absent. Returns the merged record.
    async fn update(&self, path: &str, fields: Map<String, Value>) -> Result<Value, StoreError>;

    /// Returns whether a record was present.
    async fn remove(&self, path: &str) -> Result<bool, StoreError>;

    /// All records whose path starts with `prefix`, in path order.
    async fn list(&self, prefix: &str) -> Result<Vec<(String, Value)>, StoreError>;

    async fn remove_prefix(&self, prefix: &str) -> Result<usize, StoreError>;

    /// Atomically replace the record at `path` with `new` (or remove it when
    /// `new` is `None`) only if it currently equals `expected` (`None` means
    /// absent). Returns whether the swap happened.
    async fn compare_and_swap(
        &self,
        path: &str,
        expected: Option<&Value>,
        new: Option<Value>,
    ) -> Result<bool, StoreError>;

    /// Atomically set the field at JSON `pointer` inside the record at
    /// `path` to `new` only if it currently equals `expected`.
    async fn swap_field(
        &self,
        path: &str,
        pointer: &str,
        expected: &Value,
        new: Value,
    ) -> Result<bool, StoreError>;

    /// Subscribe to changes under `prefix`.
    fn watch(&self, prefix: &str) -> Watch;
}

/// Typed helpers over any [`RecordStore`].
#[async_trait]
pub trait RecordStoreExt: RecordStore {
    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>, StoreError> {
        match self.get(path).await? {
            Some(v) => Ok(Some(serde_json::from_value(v)?)),
            None => Ok(None),
        }
    }

    async fn set_json<T: Serialize + Sync>(&self, path: &str, value: &T) -> Result<(), StoreError> {
        self.set(path, serde_json::to_value(value)?).await
    }

    async fn list_json<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<(String, T)>, StoreError> {
        self.list(prefix)
            .await?
            .into_iter()
            .map(|(p, v)| Ok((p, serde_json::from_value(v)?)))
            .collect()
    }
}

impl<S: RecordStore + ?Sized> RecordStoreExt for S {}

/// Prefix-filtered change stream.
pub struct Watch {
    prefix: String,
    rx: broadcast::Receiver<RecordEvent>,
}

impl Watch {
    pub fn new(prefix: &str, rx: broadcast::Receiver<RecordEvent>) -> Self {
        Self {
            prefix: prefix.to_owned(),
            rx,
        }
    }

    /// Next event under the prefix; `None` once the store is dropped.
    /// Lagged receivers skip ahead rather than fail: consumers re-read the
    /// record on every event anyway.
    pub async fn next(&mut self) -> Option<RecordEvent> {
        loop {
            match self.rx.recv().await {
                Ok(ev) if ev.path().starts_with(&self.prefix) => return Some(ev),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(prefix = %self.prefix, skipped, "record watch lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Apply a shallow merge; shared by the in-process backends.
pub(crate) fn merge_fields(path: &str, current: Option<Value>, fields: Map<String, Value>) -> Result<Value, StoreError> {
    let mut obj = match current {
        Some(Value::Object(obj)) => obj,
        Some(_) => return Err(StoreError::NotAnObject(path.to_owned())),
        None => Map::new(),
    };
    obj.extend(fields);
    Ok(Value::Object(obj))
}
