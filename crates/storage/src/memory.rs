//! In-memory store used by tests and the verify tooling.

use std::collections::BTreeMap;
use std::sync::RwLock;

use crate::{Column, KeyValueStore, StoreError, WriteBatch};

#[derive(Default)]
pub struct MemoryStore {
    columns: RwLock<BTreeMap<Column, BTreeMap<Vec<u8>, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned() -> StoreError {
    StoreError::Backend("memory store lock poisoned".to_string())
}

impl KeyValueStore for MemoryStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let columns = self.columns.read().map_err(|_| poisoned())?;
        Ok(columns
            .get(&column)
            .and_then(|entries| entries.get(key).cloned()))
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        let mut columns = self.columns.write().map_err(|_| poisoned())?;
        columns
            .entry(column)
            .or_default()
            .insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn scan_prefix(
        &self,
        column: Column,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let columns = self.columns.read().map_err(|_| poisoned())?;
        let Some(entries) = columns.get(&column) else {
            return Ok(Vec::new());
        };
        Ok(entries
            .range(prefix.to_vec()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        let mut columns = self.columns.write().map_err(|_| poisoned())?;
        for op in batch.iter() {
            match &op.value {
                Some(value) => {
                    columns
                        .entry(op.column)
                        .or_default()
                        .insert(op.key.to_vec(), value.clone());
                }
                None => {
                    if let Some(entries) = columns.get_mut(&op.column) {
                        entries.remove(op.key.as_slice());
                    }
                }
            }
        }
        Ok(())
    }
}
