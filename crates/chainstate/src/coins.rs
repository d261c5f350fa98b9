//! Layered UTXO views.
//!
//! A [`CoinsCache`] sits over any [`CoinsView`] and tracks per-entry
//! FRESH/DIRTY state so that a coin created and spent inside the same
//! layer never touches the backing store. A layer flushes either into
//! its parent layer (as a [`CoinsDiff`]) or into a [`WriteBatch`] at
//! the bottom of the stack.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use candyd_primitives::encoding::{DecodeError, Decoder, Encoder};
use candyd_primitives::outpoint::OutPoint;
use candyd_primitives::Hash256;
use candyd_storage::{Column, KeyValueStore, StoreError, WriteBatch};

/// A UTXO entry: the output plus the creation context consensus needs.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Coin {
    pub value: i64,
    pub script_pubkey: Vec<u8>,
    pub height: u32,
    pub is_coinbase: bool,
}

impl Coin {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_i64_le(self.value);
        encoder.write_var_bytes(&self.script_pubkey);
        encoder.write_u32_le(self.height);
        encoder.write_u8(if self.is_coinbase { 1 } else { 0 });
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let value = decoder.read_i64_le()?;
        let script_pubkey = decoder.read_var_bytes()?;
        let height = decoder.read_u32_le()?;
        let is_coinbase = decoder.read_u8()? != 0;
        decoder.finish()?;
        Ok(Self {
            value,
            script_pubkey,
            height,
            is_coinbase,
        })
    }
}

pub const BEST_BLOCK_KEY: &[u8] = b"coins_best_block";

pub trait CoinsView {
    fn get_coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, StoreError>;
    fn best_block(&self) -> Result<Option<Hash256>, StoreError>;
}

/// Bottom view reading the UTXO column of the store.
pub struct StoreCoinsView<S> {
    store: S,
}

impl<S> StoreCoinsView<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

impl<S: KeyValueStore> CoinsView for StoreCoinsView<S> {
    fn get_coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, StoreError> {
        match self.store.get(Column::Utxo, &outpoint.key_bytes())? {
            Some(bytes) => Ok(Some(
                Coin::decode(&bytes).map_err(|err| StoreError::Backend(err.to_string()))?,
            )),
            None => Ok(None),
        }
    }

    fn best_block(&self) -> Result<Option<Hash256>, StoreError> {
        match self.store.get(Column::Meta, BEST_BLOCK_KEY)? {
            Some(bytes) if bytes.len() == 32 => {
                let mut hash = [0u8; 32];
                hash.copy_from_slice(&bytes);
                Ok(Some(hash))
            }
            Some(_) => Err(StoreError::Backend("corrupt best block entry".to_string())),
            None => Ok(None),
        }
    }
}

const FRESH: u8 = 1 << 0;
const DIRTY: u8 = 1 << 1;

#[derive(Clone, Debug)]
struct CacheEntry {
    /// `None` is a spent tombstone.
    coin: Option<Coin>,
    flags: u8,
}

#[derive(Debug)]
pub enum CoinsError {
    Store(StoreError),
    /// `add_coin` would replace an unspent coin without
    /// `overwrite_allowed`.
    IllegalOverwrite,
}

impl std::fmt::Display for CoinsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CoinsError::Store(err) => write!(f, "{err}"),
            CoinsError::IllegalOverwrite => {
                write!(f, "adding new coin that replaces a live entry")
            }
        }
    }
}

impl std::error::Error for CoinsError {}

impl From<StoreError> for CoinsError {
    fn from(err: StoreError) -> Self {
        CoinsError::Store(err)
    }
}

/// The dirty contents of a drained layer, ready to apply to the parent.
pub struct CoinsDiff {
    entries: Vec<(OutPoint, CacheEntry)>,
    best_block: Option<Hash256>,
}

pub struct CoinsCache<'a> {
    base: &'a dyn CoinsView,
    entries: HashMap<OutPoint, CacheEntry>,
    best_block: Option<Hash256>,
}

impl<'a> CoinsCache<'a> {
    pub fn new(base: &'a dyn CoinsView) -> Self {
        Self {
            base,
            entries: HashMap::new(),
            best_block: None,
        }
    }

    pub fn set_best_block(&mut self, hash: Hash256) {
        self.best_block = Some(hash);
    }

    fn fetch(&mut self, outpoint: &OutPoint) -> Result<bool, StoreError> {
        if self.entries.contains_key(outpoint) {
            return Ok(true);
        }
        match self.base.get_coin(outpoint)? {
            Some(coin) => {
                self.entries.insert(
                    outpoint.clone(),
                    CacheEntry {
                        coin: Some(coin),
                        flags: 0,
                    },
                );
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn get_coin(&mut self, outpoint: &OutPoint) -> Result<Option<Coin>, StoreError> {
        if !self.fetch(outpoint)? {
            return Ok(None);
        }
        Ok(self.entries[outpoint].coin.clone())
    }

    pub fn have_coin(&mut self, outpoint: &OutPoint) -> Result<bool, StoreError> {
        Ok(self.get_coin(outpoint)?.is_some())
    }

    /// Insert a new coin. `overwrite_allowed` must only be set when
    /// restoring from undo data, where an overwrite is legitimate.
    pub fn add_coin(
        &mut self,
        outpoint: OutPoint,
        coin: Coin,
        overwrite_allowed: bool,
    ) -> Result<(), CoinsError> {
        match self.entries.entry(outpoint) {
            Entry::Vacant(slot) => {
                let fresh = !overwrite_allowed;
                slot.insert(CacheEntry {
                    coin: Some(coin),
                    flags: DIRTY | if fresh { FRESH } else { 0 },
                });
            }
            Entry::Occupied(mut slot) => {
                let entry = slot.get_mut();
                let mut fresh = false;
                if !overwrite_allowed {
                    if entry.coin.is_some() {
                        return Err(CoinsError::IllegalOverwrite);
                    }
                    fresh = entry.flags & DIRTY == 0;
                }
                entry.coin = Some(coin);
                entry.flags |= DIRTY | if fresh { FRESH } else { 0 };
            }
        }
        Ok(())
    }

    /// Remove and return a coin. A coin created in this layer is erased
    /// without leaving a tombstone.
    pub fn spend_coin(&mut self, outpoint: &OutPoint) -> Result<Option<Coin>, StoreError> {
        if !self.fetch(outpoint)? {
            return Ok(None);
        }
        let entry = self.entries.get_mut(outpoint).expect("fetched above");
        if entry.coin.is_none() {
            return Ok(None);
        }
        let coin = entry.coin.take();
        if entry.flags & FRESH != 0 {
            self.entries.remove(outpoint);
        } else {
            entry.flags |= DIRTY;
        }
        Ok(coin)
    }

    /// Find any unspent output of the given transaction. Used to
    /// recover missing metadata from legacy undo records.
    pub fn find_coin_by_txid(&mut self, txid: &Hash256) -> Result<Option<Coin>, StoreError> {
        const MAX_OUTPUTS_SCANNED: u32 = 100_000;
        for index in 0..MAX_OUTPUTS_SCANNED {
            let outpoint = OutPoint { hash: *txid, index };
            if let Some(coin) = self.get_coin(&outpoint)? {
                return Ok(Some(coin));
            }
        }
        Ok(None)
    }

    /// Drain this layer's modifications. Consumes the layer so the
    /// borrow on the parent view ends before the diff is applied.
    pub fn into_diff(self) -> CoinsDiff {
        CoinsDiff {
            entries: self
                .entries
                .into_iter()
                .filter(|(_, entry)| entry.flags & DIRTY != 0)
                .collect(),
            best_block: self.best_block,
        }
    }

    /// Combine a child layer's modifications into this layer.
    pub fn apply_diff(&mut self, diff: CoinsDiff) -> Result<(), CoinsError> {
        for (outpoint, child) in diff.entries {
            match self.entries.entry(outpoint) {
                Entry::Vacant(slot) => {
                    // A coin born and spent in the child never existed
                    // for this layer.
                    if child.flags & FRESH != 0 && child.coin.is_none() {
                        continue;
                    }
                    slot.insert(CacheEntry {
                        coin: child.coin,
                        flags: DIRTY | (child.flags & FRESH),
                    });
                }
                Entry::Occupied(mut slot) => {
                    let entry = slot.get_mut();
                    if child.flags & FRESH != 0 && entry.coin.is_some() {
                        return Err(CoinsError::IllegalOverwrite);
                    }
                    if entry.flags & FRESH != 0 && child.coin.is_none() {
                        // Spent a coin this layer freshly created:
                        // erase it entirely.
                        slot.remove();
                    } else {
                        entry.coin = child.coin;
                        entry.flags |= DIRTY;
                    }
                }
            }
        }
        if let Some(hash) = diff.best_block {
            self.best_block = Some(hash);
        }
        Ok(())
    }

    /// Write this layer's modifications to the backing store batch and
    /// clear the layer.
    pub fn flush_to_batch(&mut self, batch: &mut WriteBatch) {
        for (outpoint, entry) in self.entries.drain() {
            if entry.flags & DIRTY == 0 {
                continue;
            }
            match entry.coin {
                Some(coin) => batch.put(Column::Utxo, outpoint.key_bytes(), coin.encode()),
                None => batch.delete(Column::Utxo, outpoint.key_bytes()),
            }
        }
        if let Some(hash) = self.best_block.take() {
            batch.put(Column::Meta, BEST_BLOCK_KEY.to_vec(), hash.to_vec());
        }
    }

    pub fn modified_count(&self) -> usize {
        self.entries.len()
    }
}

/// A cache is itself a view, so further layers can stack on top. Reads
/// pass through without memoizing.
impl CoinsView for CoinsCache<'_> {
    fn get_coin(&self, outpoint: &OutPoint) -> Result<Option<Coin>, StoreError> {
        match self.entries.get(outpoint) {
            Some(entry) => Ok(entry.coin.clone()),
            None => self.base.get_coin(outpoint),
        }
    }

    fn best_block(&self) -> Result<Option<Hash256>, StoreError> {
        match self.best_block {
            Some(hash) => Ok(Some(hash)),
            None => self.base.best_block(),
        }
    }
}
