//! The pool work descriptor and the coinbase commitment it carries.
//!
//! A work unit is a block header plus share/announcement targets and the
//! coinbase bytes followed by the intermediate merkle hashes needed to
//! rebuild the transaction root once the commitment is spliced in.

use crate::crypto::hash;
use crate::protocol::{BlockHeader, CoinbaseCommit, BLOCK_HDR_SZ, COINBASE_COMMIT_SZ};

/// `OP_RETURN 0x30` followed by the commitment magic, little-endian.
pub const COMMIT_PATTERN_PREFIX: [u8; 6] = [0x6a, 0x30, 0x09, 0xf9, 0x11, 0x02];
/// The placeholder byte filling the commitment body in a work template.
pub const COMMIT_PLACEHOLDER: u8 = 0xfc;
/// Prefix plus the 44 placeholder bytes completing the 48-byte commitment.
pub const COMMIT_PATTERN_SZ: usize = 50;
/// The commitment starts at the magic, two bytes into the pattern.
pub const COMMIT_PATTERN_OS: usize = 2;

pub const POOL_WORK_FIXED_SZ: usize = BLOCK_HDR_SZ + 32 + 4 + 4 + 4 + 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolWork {
    pub header: BlockHeader,
    pub content_hash: [u8; 32],
    pub share_target: u32,
    pub ann_target: u32,
    pub height: i32,
    /// Raw coinbase transaction bytes holding the commitment placeholder.
    pub coinbase: Vec<u8>,
    /// Intermediate hashes up the (external) transaction merkle tree.
    pub merkles: Vec<[u8; 32]>,
}

impl PoolWork {
    pub fn decode(b: &[u8]) -> Option<Self> {
        if b.len() < POOL_WORK_FIXED_SZ {
            return None;
        }
        let coinbase_len =
            u32::from_le_bytes(b[124..128].try_into().unwrap()) as usize;
        if b.len() < POOL_WORK_FIXED_SZ + coinbase_len {
            return None;
        }
        let tail = &b[POOL_WORK_FIXED_SZ + coinbase_len..];
        if tail.len() % 32 != 0 {
            return None;
        }
        Some(PoolWork {
            header: BlockHeader::from_bytes(b[..BLOCK_HDR_SZ].try_into().unwrap()),
            content_hash: b[80..112].try_into().unwrap(),
            share_target: u32::from_le_bytes(b[112..116].try_into().unwrap()),
            ann_target: u32::from_le_bytes(b[116..120].try_into().unwrap()),
            height: i32::from_le_bytes(b[120..124].try_into().unwrap()),
            coinbase: b[POOL_WORK_FIXED_SZ..POOL_WORK_FIXED_SZ + coinbase_len].to_vec(),
            merkles: tail.chunks_exact(32).map(|c| c.try_into().unwrap()).collect(),
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            POOL_WORK_FIXED_SZ + self.coinbase.len() + self.merkles.len() * 32,
        );
        out.extend_from_slice(&self.header.to_bytes());
        out.extend_from_slice(&self.content_hash);
        out.extend_from_slice(&self.share_target.to_le_bytes());
        out.extend_from_slice(&self.ann_target.to_le_bytes());
        out.extend_from_slice(&self.height.to_le_bytes());
        out.extend_from_slice(&(self.coinbase.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.coinbase);
        for m in &self.merkles {
            out.extend_from_slice(m);
        }
        out
    }

    pub fn merkle_count(&self) -> usize {
        self.merkles.len()
    }
}

/// Locate the commitment placeholder inside coinbase bytes, returning the
/// offset of the 48-byte commitment itself.
pub fn find_commitment(coinbase: &[u8]) -> Option<usize> {
    if coinbase.len() < COMMIT_PATTERN_SZ {
        return None;
    }
    (0..=coinbase.len() - COMMIT_PATTERN_SZ)
        .find(|&i| {
            coinbase[i..i + 6] == COMMIT_PATTERN_PREFIX
                && coinbase[i + 6..i + COMMIT_PATTERN_SZ]
                    .iter()
                    .all(|&b| b == COMMIT_PLACEHOLDER)
        })
        .map(|i| i + COMMIT_PATTERN_OS)
}

/// Splice a commitment over the placeholder; false when none is present.
pub fn insert_commitment(coinbase: &mut [u8], commit: &CoinbaseCommit) -> bool {
    match find_commitment(coinbase) {
        Some(off) => {
            coinbase[off..off + COINBASE_COMMIT_SZ].copy_from_slice(&commit.to_bytes());
            true
        }
        None => false,
    }
}

/// Fold the coinbase hash up through the intermediate merkle hashes to the
/// transaction root, double-SHA-256 at every step.
pub fn merkle_root(coinbase: &[u8], merkles: &[[u8; 32]]) -> [u8; 32] {
    let mut acc = hash::double_sha256(coinbase);
    let mut both = [0u8; 64];
    for m in merkles {
        both[..32].copy_from_slice(&acc);
        both[32..].copy_from_slice(m);
        acc = hash::double_sha256(&both);
    }
    acc
}
