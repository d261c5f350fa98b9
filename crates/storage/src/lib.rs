//! Key/value persistence seam for the chain state.
//!
//! The index, UTXO set, and file metadata all flow through one narrow
//! trait so the backend stays swappable; block and undo bodies live in
//! flat files and never pass through here. Mutations are expressed as
//! batches so a connect or disconnect lands atomically.

use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;

pub mod memory;

#[derive(Debug)]
pub enum StoreError {
    Backend(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Backend(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for StoreError {}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum Column {
    BlockIndex,
    BlockHeader,
    HeightIndex,
    TxIndex,
    Utxo,
    BlockUndo,
    Meta,
}

impl Column {
    pub fn as_str(self) -> &'static str {
        match self {
            Column::BlockIndex => "block_index",
            Column::BlockHeader => "block_header",
            Column::HeightIndex => "height_index",
            Column::TxIndex => "tx_index",
            Column::Utxo => "utxo",
            Column::BlockUndo => "block_undo",
            Column::Meta => "meta",
        }
    }
}

/// Keys on the hot paths are outpoints (36 bytes) and block hashes
/// (32 bytes); batches keep them inline at that size.
pub type KeyBytes = SmallVec<[u8; 36]>;

/// One batched mutation. A missing value deletes the key.
#[derive(Clone, Debug)]
pub struct WriteOp {
    pub column: Column,
    pub key: KeyBytes,
    pub value: Option<Vec<u8>>,
}

impl WriteOp {
    pub fn is_delete(&self) -> bool {
        self.value.is_none()
    }
}

#[derive(Clone, Debug, Default)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, column: Column, key: impl AsRef<[u8]>, value: impl Into<Vec<u8>>) {
        self.ops.push(WriteOp {
            column,
            key: KeyBytes::from_slice(key.as_ref()),
            value: Some(value.into()),
        });
    }

    pub fn delete(&mut self, column: Column, key: impl AsRef<[u8]>) {
        self.ops.push(WriteOp {
            column,
            key: KeyBytes::from_slice(key.as_ref()),
            value: None,
        });
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &WriteOp> {
        self.ops.iter()
    }

    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }
}

/// The storage surface the chain state consumes: point reads, seeding
/// writes, bounded prefix scans, and atomic batch commits.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;
    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError>;
    fn scan_prefix(
        &self,
        column: Column,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError>;
    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError>;
}

impl<T: KeyValueStore + ?Sized> KeyValueStore for Arc<T> {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.as_ref().get(column, key)
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.as_ref().put(column, key, value)
    }

    fn scan_prefix(
        &self,
        column: Column,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        self.as_ref().scan_prefix(column, prefix)
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        self.as_ref().write_batch(batch)
    }
}

impl<T: KeyValueStore + ?Sized> KeyValueStore for &T {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        (*self).get(column, key)
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        (*self).put(column, key, value)
    }

    fn scan_prefix(
        &self,
        column: Column,
        prefix: &[u8],
    ) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        (*self).scan_prefix(column, prefix)
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        (*self).write_batch(batch)
    }
}
