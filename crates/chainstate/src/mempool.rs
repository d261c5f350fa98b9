//! Mempool collaborator surface.
//!
//! The chain state only needs a narrow slice of the mempool: removal on
//! connect, resubmission on disconnect, and a full flush when an
//! opcode-set boundary is crossed. The real pool lives in the node.

use candyd_primitives::outpoint::OutPoint;
use candyd_primitives::transaction::Transaction;
use candyd_primitives::Hash256;

pub trait Mempool: Send {
    fn exists(&self, txid: &Hash256) -> bool;

    /// Remove the given transactions (and anything that conflicts with
    /// them) after a block connects.
    fn remove_for_block(&mut self, txids: &[Hash256]);

    /// Evict anything spending the given outpoint.
    fn remove_conflicts(&mut self, spent: &OutPoint);

    /// Offer a transaction from a disconnected block back to the pool.
    /// Returning false drops it silently.
    fn resubmit(&mut self, tx: &Transaction) -> bool;

    /// Re-check pool contents after a reorg changed the tip height.
    fn removed_for_reorg(&mut self, new_tip_height: i32);

    /// Drop everything: the set of valid opcodes just changed under us.
    fn clear(&mut self);
}

/// No-op pool used by tests and by tools that run without a mempool.
#[derive(Default)]
pub struct NullMempool;

impl Mempool for NullMempool {
    fn exists(&self, _txid: &Hash256) -> bool {
        false
    }

    fn remove_for_block(&mut self, _txids: &[Hash256]) {}

    fn remove_conflicts(&mut self, _spent: &OutPoint) {}

    fn resubmit(&mut self, _tx: &Transaction) -> bool {
        false
    }

    fn removed_for_reorg(&mut self, _new_tip_height: i32) {}

    fn clear(&mut self) {}
}
