//! Block validity lattice and status flags.

/// How far a block index entry has been validated. Levels only ever
/// rise; a failure is recorded in the status flags, never by lowering
/// the level.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum BlockValidity {
    Unknown = 0,
    /// Parsed, version ok, hash satisfies claimed PoW, timestamp not in
    /// future.
    Header = 1,
    /// All parent headers found, difficulty matches, timestamp >= median
    /// previous, checkpoint. Implies all parents are also at least Tree.
    Tree = 2,
    /// Only first tx is coinbase, transactions valid, no duplicate
    /// txids, sigops, size, merkle root.
    Transactions = 3,
    /// Outputs do not overspend inputs, no double spends, coinbase
    /// output ok, no immature coinbase spends, BIP30.
    Chain = 4,
    /// Scripts and signatures ok.
    Scripts = 5,
}

impl BlockValidity {
    fn from_bits(bits: u32) -> Self {
        match bits {
            1 => BlockValidity::Header,
            2 => BlockValidity::Tree,
            3 => BlockValidity::Transactions,
            4 => BlockValidity::Chain,
            5 => BlockValidity::Scripts,
            _ => BlockValidity::Unknown,
        }
    }
}

const VALIDITY_MASK: u32 = 0x07;

/// Full block available in the block files.
const HAS_DATA_FLAG: u32 = 0x08;
/// Undo data available in the undo files.
const HAS_UNDO_FLAG: u32 = 0x10;

/// The block is invalid.
const FAILED_FLAG: u32 = 0x20;
/// The block has an invalid ancestor.
const FAILED_PARENT_FLAG: u32 = 0x40;

const INVALID_MASK: u32 = FAILED_FLAG | FAILED_PARENT_FLAG;

/// The block is parked; it will be reconsidered if its chain grows
/// enough.
const PARKED_FLAG: u32 = 0x80;
/// One of the block's ancestors is parked.
const PARKED_PARENT_FLAG: u32 = 0x100;

const PARKED_MASK: u32 = PARKED_FLAG | PARKED_PARENT_FLAG;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BlockStatus(u32);

impl BlockStatus {
    pub fn new() -> Self {
        Self(0)
    }

    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    pub fn validity(self) -> BlockValidity {
        BlockValidity::from_bits(self.0 & VALIDITY_MASK)
    }

    pub fn with_validity(self, validity: BlockValidity) -> Self {
        Self((self.0 & !VALIDITY_MASK) | validity as u32)
    }

    pub fn has_data(self) -> bool {
        self.0 & HAS_DATA_FLAG != 0
    }

    pub fn with_data(self, has_data: bool) -> Self {
        Self((self.0 & !HAS_DATA_FLAG) | if has_data { HAS_DATA_FLAG } else { 0 })
    }

    pub fn has_undo(self) -> bool {
        self.0 & HAS_UNDO_FLAG != 0
    }

    pub fn with_undo(self, has_undo: bool) -> Self {
        Self((self.0 & !HAS_UNDO_FLAG) | if has_undo { HAS_UNDO_FLAG } else { 0 })
    }

    pub fn has_failed(self) -> bool {
        self.0 & FAILED_FLAG != 0
    }

    pub fn with_failed(self, failed: bool) -> Self {
        Self((self.0 & !FAILED_FLAG) | if failed { FAILED_FLAG } else { 0 })
    }

    pub fn has_failed_parent(self) -> bool {
        self.0 & FAILED_PARENT_FLAG != 0
    }

    pub fn with_failed_parent(self, failed_parent: bool) -> Self {
        Self((self.0 & !FAILED_PARENT_FLAG) | if failed_parent { FAILED_PARENT_FLAG } else { 0 })
    }

    pub fn is_parked(self) -> bool {
        self.0 & PARKED_FLAG != 0
    }

    pub fn with_parked(self, parked: bool) -> Self {
        Self((self.0 & !PARKED_FLAG) | if parked { PARKED_FLAG } else { 0 })
    }

    pub fn has_parked_parent(self) -> bool {
        self.0 & PARKED_PARENT_FLAG != 0
    }

    pub fn with_parked_parent(self, parked_parent: bool) -> Self {
        Self((self.0 & !PARKED_PARENT_FLAG) | if parked_parent { PARKED_PARENT_FLAG } else { 0 })
    }

    pub fn is_invalid(self) -> bool {
        self.0 & INVALID_MASK != 0
    }

    pub fn with_cleared_failure_flags(self) -> Self {
        Self(self.0 & !INVALID_MASK)
    }

    pub fn is_on_parked_chain(self) -> bool {
        self.0 & PARKED_MASK != 0
    }

    pub fn with_cleared_parked_flags(self) -> Self {
        Self(self.0 & !PARKED_MASK)
    }

    /// Valid up to the given level, and not failed.
    pub fn is_valid(self, up_to: BlockValidity) -> bool {
        if self.is_invalid() {
            return false;
        }
        self.validity() >= up_to
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validity_roundtrip_through_flags() {
        let status = BlockStatus::new()
            .with_validity(BlockValidity::Transactions)
            .with_data(true)
            .with_undo(true);
        assert_eq!(status.validity(), BlockValidity::Transactions);
        assert!(status.has_data());
        assert!(status.has_undo());
        assert!(status.is_valid(BlockValidity::Tree));
        assert!(!status.is_valid(BlockValidity::Chain));

        let decoded = BlockStatus::from_bits(status.bits());
        assert_eq!(decoded, status);
    }

    #[test]
    fn failure_masks_validity() {
        let status = BlockStatus::new()
            .with_validity(BlockValidity::Scripts)
            .with_failed(true);
        assert!(status.is_invalid());
        assert!(!status.is_valid(BlockValidity::Header));
        assert!(status.with_cleared_failure_flags().is_valid(BlockValidity::Scripts));
    }

    #[test]
    fn parked_flags_are_independent_of_failure() {
        let status = BlockStatus::new().with_parked(true);
        assert!(status.is_on_parked_chain());
        assert!(!status.is_invalid());
        let status = status.with_parked_parent(true).with_parked(false);
        assert!(status.is_on_parked_chain());
        assert_eq!(status.with_cleared_parked_flags(), BlockStatus::new());
    }
}
