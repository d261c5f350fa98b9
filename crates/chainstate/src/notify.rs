//! Ordered chain event notifications.
//!
//! Observers see conflict removals first, then connected-block
//! transactions, then the tip update, in that order within a single
//! activation step.

use candyd_primitives::block::Block;
use candyd_primitives::Hash256;

pub trait ChainNotifier: Send {
    /// Transactions evicted from the mempool because a connected block
    /// conflicted with them.
    fn transactions_removed(&mut self, _txids: &[Hash256]) {}

    fn block_connected(&mut self, _block: &Block, _height: i32) {}

    fn block_disconnected(&mut self, _block: &Block, _height: i32) {}

    fn tip_updated(&mut self, _hash: &Hash256, _height: i32) {}
}

/// Discards every event.
#[derive(Default)]
pub struct NullNotifier;

impl ChainNotifier for NullNotifier {}
