//! Undo journal for connected blocks.

use candyd_primitives::encoding::{DecodeError, Decoder, Encoder};

use crate::coins::Coin;

/// The coins a transaction consumed, in input order.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TxUndo {
    pub spent: Vec<Coin>,
}

/// Per-block undo record: one entry per non-coinbase transaction, in
/// block order.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct BlockUndo {
    pub tx_undos: Vec<TxUndo>,
}

impl BlockUndo {
    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        encoder.write_compact_size(self.tx_undos.len() as u64);
        for tx_undo in &self.tx_undos {
            encoder.write_compact_size(tx_undo.spent.len() as u64);
            for coin in &tx_undo.spent {
                encoder.write_i64_le(coin.value);
                encoder.write_var_bytes(&coin.script_pubkey);
                // Legacy records carry height zero here; disconnect
                // recovers the metadata from a sibling output.
                encoder.write_u32_le(coin.height);
                encoder.write_u8(if coin.is_coinbase { 1 } else { 0 });
            }
        }
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let tx_count = decoder.read_compact_size()?;
        if tx_count > decoder.remaining() as u64 {
            return Err(DecodeError::OversizedAllocation);
        }
        let mut tx_undos = Vec::with_capacity(tx_count as usize);
        for _ in 0..tx_count {
            let spent_count = decoder.read_compact_size()?;
            if spent_count > decoder.remaining() as u64 {
                return Err(DecodeError::OversizedAllocation);
            }
            let mut spent = Vec::with_capacity(spent_count as usize);
            for _ in 0..spent_count {
                let value = decoder.read_i64_le()?;
                let script_pubkey = decoder.read_var_bytes()?;
                let height = decoder.read_u32_le()?;
                let is_coinbase = decoder.read_u8()? != 0;
                spent.push(Coin {
                    value,
                    script_pubkey,
                    height,
                    is_coinbase,
                });
            }
            tx_undos.push(TxUndo { spent });
        }
        decoder.finish()?;
        Ok(Self { tx_undos })
    }
}
