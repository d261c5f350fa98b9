//! Merkle root computation with mutation detection.

use crate::hash::sha256d_pair;
use crate::transaction::Transaction;
use crate::Hash256;

/// Compute the merkle root of a list of hashes.
///
/// `mutated` is set when any level combines two identical nodes, the
/// CVE-2012-2459 malleability pattern (a trailing duplicated transaction
/// pair produces the same root as the honest block).
pub fn compute_merkle_root(mut hashes: Vec<Hash256>, mutated: &mut bool) -> Hash256 {
    *mutated = false;
    if hashes.is_empty() {
        return [0u8; 32];
    }
    while hashes.len() > 1 {
        let mut position = 0;
        while position + 1 < hashes.len() {
            if hashes[position] == hashes[position + 1] {
                *mutated = true;
            }
            position += 2;
        }
        if hashes.len() % 2 == 1 {
            let last = *hashes.last().expect("non-empty");
            hashes.push(last);
        }
        let mut next = Vec::with_capacity(hashes.len() / 2);
        for pair in hashes.chunks_exact(2) {
            next.push(sha256d_pair(&pair[0], &pair[1]));
        }
        hashes = next;
    }
    hashes[0]
}

pub fn block_merkle_root(transactions: &[Transaction], mutated: &mut bool) -> Hash256 {
    let hashes = transactions.iter().map(|tx| tx.txid()).collect();
    compute_merkle_root(hashes, mutated)
}
