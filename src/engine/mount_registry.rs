//! Mount Registry
//!
//! Persisted table of mount records keyed by data source name. Every change is
//! written to disk before it becomes visible in memory, so the file and the
//! in-memory view never diverge.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::engine::error::{EngineError, EngineResult};
use crate::engine::types::MountRecord;
use crate::persist;

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    mounts: Vec<MountRecord>,
}

/// Registry of all known mounts
#[derive(Debug)]
pub struct MountRegistry {
    path: PathBuf,
    records: Mutex<BTreeMap<String, MountRecord>>,
}

impl MountRegistry {
    /// Loads the registry, starting empty when the file does not exist yet.
    pub fn load(path: impl Into<PathBuf>) -> EngineResult<Self> {
        let path = path.into();
        let records = match persist::read_optional(&path)? {
            None => BTreeMap::new(),
            Some(bytes) => {
                let file: RegistryFile = serde_json::from_slice(&bytes).map_err(|e| {
                    EngineError::corrupt(format!(
                        "Mount registry {} is unreadable: {}",
                        path.display(),
                        e
                    ))
                })?;
                file.mounts
                    .into_iter()
                    .map(|record| (record.name.clone(), record))
                    .collect()
            }
        };

        tracing::debug!(path = %path.display(), mounts = records.len(), "Mount registry loaded");
        Ok(Self {
            path,
            records: Mutex::new(records),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, MountRecord>> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self, records: &BTreeMap<String, MountRecord>) -> EngineResult<()> {
        let file = RegistryFile {
            mounts: records.values().cloned().collect(),
        };
        let json = serde_json::to_vec_pretty(&file)
            .map_err(|e| EngineError::internal(format!("Registry serialization failed: {}", e)))?;
        persist::write_atomic(&self.path, &json)
    }

    /// Applies `change` to a copy of the table, persists it, then publishes it.
    fn commit<T>(
        &self,
        change: impl FnOnce(&mut BTreeMap<String, MountRecord>) -> T,
    ) -> EngineResult<T> {
        let mut guard = self.lock();
        let mut next = guard.clone();
        let out = change(&mut next);
        if next != *guard {
            self.write(&next)?;
            *guard = next;
        }
        Ok(out)
    }

    pub fn get(&self, name: &str) -> Option<MountRecord> {
        self.lock().get(name).cloned()
    }

    /// All records, ordered by name
    pub fn list(&self) -> Vec<MountRecord> {
        self.lock().values().cloned().collect()
    }

    pub fn upsert(&self, record: MountRecord) -> EngineResult<()> {
        self.commit(|records| {
            records.insert(record.name.clone(), record);
        })
    }

    /// Mutates an existing record in place. Returns the updated record, or
    /// `None` when no record exists for `name`.
    pub fn update(
        &self,
        name: &str,
        change: impl FnOnce(&mut MountRecord),
    ) -> EngineResult<Option<MountRecord>> {
        self.commit(|records| {
            records.get_mut(name).map(|record| {
                change(record);
                record.clone()
            })
        })
    }

    pub fn remove(&self, name: &str) -> EngineResult<Option<MountRecord>> {
        self.commit(|records| records.remove(name))
    }
}
