//! Single-file JSON persistence for the record store.
//!
//! Used by the admin CLI and by local deployments without a hosted backend.
//! Several processes may open the same file. Every mutation takes an
//! exclusive OS lock on a sibling `.lock` file, re-reads the records from
//! disk, applies its condition to that fresh copy and rewrites the file
//! through a temp file before the lock is dropped. Readers never lock: the
//! rename makes each snapshot appear whole.
//!
//! Watches only see changes made through this handle.

use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use fs2::FileExt;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tempfile::NamedTempFile;
use tokio::sync::broadcast;
use tracing::debug;

use crate::error::StoreError;
use crate::memory::{
    apply_compare_and_swap, apply_remove, apply_remove_prefix, apply_set, apply_swap_field, apply_update,
    list_prefix,
};
use crate::record::{RecordEvent, RecordStore, Watch};

const EVENT_CAPACITY: usize = 256;

type Records = BTreeMap<String, Value>;

pub struct JsonFileRecordStore {
    path: PathBuf,
    lock_path: PathBuf,
    write_lock: Mutex<()>,
    events: broadcast::Sender<RecordEvent>,
}

impl JsonFileRecordStore {
    /// Open `path`, starting empty when the file does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let records = read_records(&path)?;
        debug!(path = %path.display(), records = records.len(), "record file opened");
        let mut lock_name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
        lock_name.push(".lock");
        let lock_path = path.with_file_name(lock_name);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            path,
            lock_path,
            write_lock: Mutex::new(()),
            events,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn dir(&self) -> PathBuf {
        match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }

    /// Run `op` against the on-disk records under the cross-process lock.
    /// The file is rewritten only when `op` produced events; those events are
    /// published after the write has landed.
    fn mutate<T>(
        &self,
        op: impl FnOnce(&mut Records) -> Result<(T, Vec<RecordEvent>), StoreError>,
    ) -> Result<T, StoreError> {
        let _local = self.write_lock.lock();
        std::fs::create_dir_all(self.dir())?;
        let lock = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.lock_path)?;
        FileExt::lock_exclusive(&lock)?;

        let result = self.mutate_locked(op);
        if let Err(e) = FileExt::unlock(&lock) {
            debug!(path = %self.lock_path.display(), error = %e, "record lock release failed; closing instead");
        }
        let (value, events) = result?;
        for ev in events {
            // No subscribers is fine.
            let _ = self.events.send(ev);
        }
        Ok(value)
    }

    fn mutate_locked<T>(
        &self,
        op: impl FnOnce(&mut Records) -> Result<(T, Vec<RecordEvent>), StoreError>,
    ) -> Result<(T, Vec<RecordEvent>), StoreError> {
        let mut records = read_records(&self.path)?;
        let (value, events) = op(&mut records)?;
        if !events.is_empty() {
            self.persist(&records)?;
        }
        Ok((value, events))
    }

    fn persist(&self, records: &Records) -> Result<(), StoreError> {
        let mut tmp = NamedTempFile::new_in(self.dir())?;
        serde_json::to_writer_pretty(&mut tmp, records)?;
        tmp.flush()?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }
}

fn read_records(path: &Path) -> Result<Records, StoreError> {
    match std::fs::read(path) {
        Ok(bytes) if bytes.is_empty() => Ok(BTreeMap::new()),
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
        Err(e) => Err(e.into()),
    }
}

#[async_trait]
impl RecordStore for JsonFileRecordStore {
    async fn get(&self, path: &str) -> Result<Option<Value>, StoreError> {
        Ok(read_records(&self.path)?.remove(path))
    }

    async fn set(&self, path: &str, value: Value) -> Result<(), StoreError> {
        self.mutate(|records| Ok(((), apply_set(records, path, value))))
    }

    async fn update(&self, path: &str, fields: Map<String, Value>) -> Result<Value, StoreError> {
        self.mutate(|records| apply_update(records, path, fields))
    }

    async fn remove(&self, path: &str) -> Result<bool, StoreError> {
        self.mutate(|records| {
            let events = apply_remove(records, path);
            Ok((!events.is_empty(), events))
        })
    }

    async fn list(&self, prefix: &str) -> Result<Vec<(String, Value)>, StoreError> {
        Ok(list_prefix(&read_records(&self.path)?, prefix))
    }

    async fn remove_prefix(&self, prefix: &str) -> Result<usize, StoreError> {
        self.mutate(|records| {
            let events = apply_remove_prefix(records, prefix);
            Ok((events.len(), events))
        })
    }

    async fn compare_and_swap(
        &self,
        path: &str,
        expected: Option<&Value>,
        new: Option<Value>,
    ) -> Result<bool, StoreError> {
        self.mutate(|records| {
            let events = apply_compare_and_swap(records, path, expected, new);
            Ok((!events.is_empty(), events))
        })
    }

    async fn swap_field(
        &self,
        path: &str,
        pointer: &str,
        expected: &Value,
        new: Value,
    ) -> Result<bool, StoreError> {
        self.mutate(|records| {
            let events = apply_swap_field(records, path, pointer, expected, new)?;
            Ok((!events.is_empty(), events))
        })
    }

    fn watch(&self, prefix: &str) -> Watch {
        Watch::new(prefix, self.events.subscribe())
    }
}
