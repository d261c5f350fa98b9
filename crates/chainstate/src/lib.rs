//! Chain state: block index, UTXO views, block validation, and chain
//! selection with finalization and parking.

pub mod blockindex;
pub mod coins;
pub mod connect;
pub mod filemeta;
pub mod flatfiles;
pub mod mempool;
pub mod notify;
pub mod state;
pub mod status;
pub mod undo;
pub mod validation;

pub use blockindex::{BlockId, BlockIndex, BlockIndexNode};
pub use coins::{Coin, CoinsCache, CoinsView, StoreCoinsView};
pub use state::{ChainState, ChainstateOptions};
pub use status::{BlockStatus, BlockValidity};
pub use validation::{ChainstateError, Rejection, RejectionKind};
