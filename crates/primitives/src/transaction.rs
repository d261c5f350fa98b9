use crate::encoding::{DecodeError, Decoder, Encoder};
use crate::hash::sha256d;
use crate::outpoint::OutPoint;
use crate::Hash256;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxIn {
    pub prevout: OutPoint,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

pub const SEQUENCE_FINAL: u32 = 0xffff_ffff;

/// BIP68 relative lock-time interpretation of `TxIn::sequence`.
pub const SEQUENCE_LOCKTIME_DISABLE_FLAG: u32 = 1 << 31;
pub const SEQUENCE_LOCKTIME_TYPE_FLAG: u32 = 1 << 22;
pub const SEQUENCE_LOCKTIME_MASK: u32 = 0x0000_ffff;
pub const SEQUENCE_LOCKTIME_GRANULARITY: u32 = 9;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TxOut {
    pub value: i64,
    pub script_pubkey: Vec<u8>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Transaction {
    pub version: i32,
    pub vin: Vec<TxIn>,
    pub vout: Vec<TxOut>,
    pub lock_time: u32,
}

impl Transaction {
    /// A coinbase has exactly one input spending the null outpoint.
    pub fn is_coinbase(&self) -> bool {
        self.vin.len() == 1 && self.vin[0].prevout.is_null()
    }

    pub fn value_out(&self) -> Option<i64> {
        let mut total = 0i64;
        for output in &self.vout {
            total = total.checked_add(output.value)?;
        }
        Some(total)
    }

    pub fn encode_into(&self, encoder: &mut Encoder) {
        encoder.write_i32_le(self.version);
        encoder.write_compact_size(self.vin.len() as u64);
        for input in &self.vin {
            input.prevout.encode_into(encoder);
            encoder.write_var_bytes(&input.script_sig);
            encoder.write_u32_le(input.sequence);
        }
        encoder.write_compact_size(self.vout.len() as u64);
        for output in &self.vout {
            encoder.write_i64_le(output.value);
            encoder.write_var_bytes(&output.script_pubkey);
        }
        encoder.write_u32_le(self.lock_time);
    }

    pub fn consensus_encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::new();
        self.encode_into(&mut encoder);
        encoder.into_inner()
    }

    pub fn decode_from(decoder: &mut Decoder<'_>) -> Result<Self, DecodeError> {
        let version = decoder.read_i32_le()?;
        let input_count = decoder.read_compact_size()?;
        if input_count > decoder.remaining() as u64 {
            return Err(DecodeError::OversizedAllocation);
        }
        let mut vin = Vec::with_capacity(input_count as usize);
        for _ in 0..input_count {
            let prevout = OutPoint::decode_from(decoder)?;
            let script_sig = decoder.read_var_bytes()?;
            let sequence = decoder.read_u32_le()?;
            vin.push(TxIn {
                prevout,
                script_sig,
                sequence,
            });
        }
        let output_count = decoder.read_compact_size()?;
        if output_count > decoder.remaining() as u64 {
            return Err(DecodeError::OversizedAllocation);
        }
        let mut vout = Vec::with_capacity(output_count as usize);
        for _ in 0..output_count {
            let value = decoder.read_i64_le()?;
            let script_pubkey = decoder.read_var_bytes()?;
            vout.push(TxOut {
                value,
                script_pubkey,
            });
        }
        let lock_time = decoder.read_u32_le()?;
        Ok(Self {
            version,
            vin,
            vout,
            lock_time,
        })
    }

    pub fn consensus_decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let tx = Self::decode_from(&mut decoder)?;
        decoder.finish()?;
        Ok(tx)
    }

    pub fn txid(&self) -> Hash256 {
        sha256d(&self.consensus_encode())
    }

    pub fn serialized_size(&self) -> usize {
        self.consensus_encode().len()
    }

    /// A transaction is final if its lock time has passed or every input
    /// opted out with a final sequence number.
    pub fn is_final(&self, block_height: i64, block_time: i64) -> bool {
        if self.lock_time == 0 {
            return true;
        }
        let cutoff = if (self.lock_time as i64) < LOCKTIME_THRESHOLD {
            block_height
        } else {
            block_time
        };
        if (self.lock_time as i64) < cutoff {
            return true;
        }
        self.vin.iter().all(|input| input.sequence == SEQUENCE_FINAL)
    }
}

/// Lock-time values below this are block heights, above are timestamps.
pub const LOCKTIME_THRESHOLD: i64 = 500_000_000;

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tx() -> Transaction {
        Transaction {
            version: 1,
            vin: vec![TxIn {
                prevout: OutPoint {
                    hash: [7u8; 32],
                    index: 3,
                },
                script_sig: vec![0x51, 0x52],
                sequence: SEQUENCE_FINAL,
            }],
            vout: vec![
                TxOut {
                    value: 50_000,
                    script_pubkey: vec![0x76, 0xa9],
                },
                TxOut {
                    value: 1,
                    script_pubkey: Vec::new(),
                },
            ],
            lock_time: 0,
        }
    }

    #[test]
    fn transaction_roundtrip() {
        let tx = sample_tx();
        let bytes = tx.consensus_encode();
        let decoded = Transaction::consensus_decode(&bytes).expect("decode");
        assert_eq!(decoded, tx);
    }

    #[test]
    fn coinbase_detection() {
        let mut tx = sample_tx();
        assert!(!tx.is_coinbase());
        tx.vin[0].prevout = OutPoint::null();
        assert!(tx.is_coinbase());
    }

    #[test]
    fn finality_by_height_and_sequence() {
        let mut tx = sample_tx();
        tx.lock_time = 100;
        // Final sequence numbers opt out of lock-time enforcement.
        assert!(tx.is_final(100, 0));

        tx.vin[0].sequence = 0;
        assert!(!tx.is_final(100, 0));
        assert!(tx.is_final(101, 0));
    }
}
