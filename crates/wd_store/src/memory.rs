//! In-process record store.
//!
//! All mutations run under one write lock, which makes `compare_and_swap`
//! and `swap_field` linearizable. Events are broadcast after the lock is
//! released.

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{Map, Value};
use tokio::sync::broadcast;

use crate::error::StoreError;
use crate::record::{merge_fields, RecordEvent, RecordStore, Watch};

const EVENT_CAPACITY: usize = 256;

pub struct MemoryRecordStore {
    records: RwLock<BTreeMap<String, Value>>,
    events: broadcast::Sender<RecordEvent>,
}

impl Default for MemoryRecordStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::from_snapshot(BTreeMap::new())
    }

    pub fn from_snapshot(records: BTreeMap<String, Value>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            records: RwLock::new(records),
            events,
        }
    }

    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.records.read().clone()
    }

    fn publish(&self, events: Vec<RecordEvent>) {
        for ev in events {
            // No subscribers is fine.
            let _ = self.events.send(ev);
        }
    }
}

fn prefixed<'a>(
    map: &'a BTreeMap<String, Value>,
    prefix: &'a str,
) -> impl Iterator<Item = (&'a String, &'a Value)> + 'a {
    map.range(prefix.to_owned()..)
        .take_while(move |(k, _)| k.starts_with(prefix))
}

// Mutations over a bare map, shared with the file backend. Each returns its
// result plus the events to publish once the change is durable.

pub(crate) fn apply_set(map: &mut BTreeMap<String, Value>, path: &str, value: Value) -> Vec<RecordEvent> {
    map.insert(path.to_owned(), value.clone());
    vec![RecordEvent::Set {
        path: path.to_owned(),
        value,
    }]
}

pub(crate) fn apply_update(
    map: &mut BTreeMap<String, Value>,
    path: &str,
    fields: Map<String, Value>,
) -> Result<(Value, Vec<RecordEvent>), StoreError> {
    let merged = merge_fields(path, map.get(path).cloned(), fields)?;
    map.insert(path.to_owned(), merged.clone());
    let ev = RecordEvent::Set {
        path: path.to_owned(),
        value: merged.clone(),
    };
    Ok((merged, vec![ev]))
}

pub(crate) fn apply_remove(map: &mut BTreeMap<String, Value>, path: &str) -> Vec<RecordEvent> {
    match map.remove(path) {
        Some(_) => vec![RecordEvent::Removed {
            path: path.to_owned(),
        }],
        None => Vec::new(),
    }
}

pub(crate) fn list_prefix(map: &BTreeMap<String, Value>, prefix: &str) -> Vec<(String, Value)> {
    prefixed(map, prefix).map(|(k, v)| (k.clone(), v.clone())).collect()
}

pub(crate) fn apply_remove_prefix(map: &mut BTreeMap<String, Value>, prefix: &str) -> Vec<RecordEvent> {
    let keys: Vec<String> = prefixed(map, prefix).map(|(k, _)| k.clone()).collect();
    keys.into_iter()
        .map(|path| {
            map.remove(&path);
            RecordEvent::Removed { path }
        })
        .collect()
}

pub(crate) fn apply_compare_and_swap(
    map: &mut BTreeMap<String, Value>,
    path: &str,
    expected: Option<&Value>,
    new: Option<Value>,
) -> Vec<RecordEvent> {
    if map.get(path) != expected {
        return Vec::new();
    }
    match new {
        Some(value) => apply_set(map, path, value),
        None => {
            map.remove(path);
            vec![RecordEvent::Removed {
                path: path.to_owned(),
            }]
        }
    }
}

pub(crate) fn apply_swap_field(
    map: &mut BTreeMap<String, Value>,
    path: &str,
    pointer: &str,
    expected: &Value,
    new: Value,
) -> Result<Vec<RecordEvent>, StoreError> {
    let record = map
        .get_mut(path)
        .ok_or_else(|| StoreError::NotFound(path.to_owned()))?;
    let field = record
        .pointer_mut(pointer)
        .ok_or_else(|| StoreError::InvalidPointer {
            path: path.to_owned(),
            pointer: pointer.to_owned(),
        })?;
    if field != expected {
        return Ok(Vec::new());
    }
    *field = new;
    Ok(vec![RecordEvent::Set {
        path: path.to_owned(),
        value: record.clone(),
    }])
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn get(&self, path: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.records.read().get(path).cloned())
    }

    async fn set(&self, path: &str, value: Value) -> Result<(), StoreError> {
        let events = apply_set(&mut self.records.write(), path, value);
        self.publish(events);
        Ok(())
    }

    async fn update(&self, path: &str, fields: Map<String, Value>) -> Result<Value, StoreError> {
        let (merged, events) = apply_update(&mut self.records.write(), path, fields)?;
        self.publish(events);
        Ok(merged)
    }

    async fn remove(&self, path: &str) -> Result<bool, StoreError> {
        let events = apply_remove(&mut self.records.write(), path);
        let existed = !events.is_empty();
        self.publish(events);
        Ok(existed)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Value)>, StoreError> {
        Ok(list_prefix(&self.records.read(), prefix))
    }

    async fn remove_prefix(&self, prefix: &str) -> Result<usize, StoreError> {
        let events = apply_remove_prefix(&mut self.records.write(), prefix);
        let count = events.len();
        self.publish(events);
        Ok(count)
    }

    async fn compare_and_swap(
        &self,
        path: &str,
        expected: Option<&Value>,
        new: Option<Value>,
    ) -> Result<bool, StoreError> {
        let events = apply_compare_and_swap(&mut self.records.write(), path, expected, new);
        let swapped = !events.is_empty();
        self.publish(events);
        Ok(swapped)
    }

    async fn swap_field(
        &self,
        path: &str,
        pointer: &str,
        expected: &Value,
        new: Value,
    ) -> Result<bool, StoreError> {
        let events = apply_swap_field(&mut self.records.write(), path, pointer, expected, new)?;
        let swapped = !events.is_empty();
        self.publish(events);
        Ok(swapped)
    }

    fn watch(&self, prefix: &str) -> Watch {
        Watch::new(prefix, self.events.subscribe())
    }
}
