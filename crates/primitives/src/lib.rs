//! Core block/transaction types and consensus serialization.

pub mod block;
pub mod encoding;
pub mod hash;
pub mod merkle;
pub mod outpoint;
pub mod transaction;

pub type Hash256 = [u8; 32];

pub use block::{Block, BlockHeader};
pub use hash::{sha256, sha256d};
pub use merkle::block_merkle_root;
pub use outpoint::OutPoint;
pub use transaction::{Transaction, TxIn, TxOut};
