//! Stateless verification of announcements and block shares. Everything
//! here is consensus-critical and must agree bit-for-bit with what the
//! miners produce.

use crate::ann::item::{ann_crypt, create_prog, mk_item, mk_item2};
use crate::ann::merkle::{is_item_valid, TABLE_SZ};
use crate::block::tree::hash_proof;
use crate::config::{ANN_RANDHASH_CYCLES, ANN_WAIT_PERIOD};
use crate::consensus::difficulty::{degrade_announcement_target, is_min_ann_diff_ok};
use crate::consensus::work::{ann_soft_nonce_max, work_check};
use crate::crypto::{hash, CycleState, Item};
use crate::protocol::{
    Announcement, CoinbaseCommit, HeaderAndProof, ANN_HDR_SZ, COINBASE_MAGIC, NUM_ANNS,
};
use crate::randprog::Program;
use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnError {
    #[error("announcement invalid")]
    Inval,

    #[error("announcement last-item prefix mismatch")]
    InvalItem4,

    #[error("announcement hash does not meet its work target")]
    InsufPow,

    #[error("soft nonce above the maximum for the work target")]
    SoftNonceHigh,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockError {
    #[error("packetcrypt proof invalid")]
    PcpInval,

    #[error("packetcrypt proof root does not match the coinbase commitment")]
    PcpMismatch,

    #[error("block hash does not meet the share target")]
    InsufPow,

    #[error("coinbase commitment malformed")]
    BadCoinbase,

    #[error("announcement {0} invalid")]
    AnnInvalid(usize),

    #[error("announcement {0} does not meet the committed work target")]
    AnnInsufPow(usize),
}

/// Whether a valid share met the full block target or only the share target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    Block,
    Share,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockCheck {
    pub status: BlockStatus,
    /// The final PacketCrypt work hash of the share.
    pub work_hash: [u8; 32],
}

/// Rebuild the two job hashes the miner derived: the announcement header
/// with a zeroed soft nonce followed by a 64-byte carrier holding either
/// the parent block hash or the embedded merkle root.
fn job_hashes(ann: &Announcement, parent_block_hash: &[u8; 32]) -> ([u8; 64], [u8; 64]) {
    let mut buf = [0u8; ANN_HDR_SZ + 64];
    buf[..ANN_HDR_SZ].copy_from_slice(&ann.as_bytes()[..ANN_HDR_SZ]);
    buf[1..4].fill(0); // soft nonce
    buf[ANN_HDR_SZ..ANN_HDR_SZ + 32].copy_from_slice(parent_block_hash);
    let ann_hash0 = hash::compress64(&buf);

    buf[ANN_HDR_SZ..].copy_from_slice(&ann.proof_root());
    let ann_hash1 = hash::compress64(&buf);
    (ann_hash0, ann_hash1)
}

/// Verify one announcement against the parent block hash it commits to.
/// Returns the 32-byte announcement work hash on success.
pub fn check_ann(
    ann: &Announcement,
    parent_block_hash: &[u8; 32],
    prog: &mut Program,
) -> Result<[u8; 32], AnnError> {
    let hdr = ann.header();
    let (ann_hash0, ann_hash1) = job_hashes(ann, parent_block_hash);

    let v1 = hdr.version > 0;
    let rand_hash_cycles = if v1 { 0 } else { ANN_RANDHASH_CYCLES };

    let mut v1_seed = [0u8; 64];
    if v1 {
        if hdr.soft_nonce > ann_soft_nonce_max(hdr.work_bits) {
            return Err(AnnError::SoftNonceHigh);
        }
        let mut buf = [0u8; 128];
        buf[..64].copy_from_slice(&ann.proof_root());
        buf[64..].copy_from_slice(&ann_hash0);
        v1_seed = hash::compress64(&buf);
        create_prog(prog, &v1_seed[..32].try_into().unwrap()).map_err(|_| AnnError::Inval)?;
    }

    let mut state = CycleState::init(&ann_hash1[..32].try_into().unwrap(), hdr.soft_nonce as u64);
    let mut item: Item = [0u8; 1024];
    let mut item_no = 0usize;
    for _ in 0..4 {
        item_no = (state.item_no() % TABLE_SZ as u64) as usize;
        item = if v1 {
            mk_item2(item_no as u64, &v1_seed[32..].try_into().unwrap(), prog)
                .map_err(|_| AnnError::Inval)?
        } else {
            // only the first half of the seed is used
            mk_item(item_no as u64, &ann_hash0[..32].try_into().unwrap())
        };
        state
            .update(&item, None, rand_hash_cycles, Some(&mut *prog))
            .map_err(|_| AnnError::Inval)?;
    }
    state.finalize();

    let decrypted;
    let ann = if v1 {
        let mut copy = ann.clone();
        ann_crypt(&mut copy, &state);
        if copy.last_ann_pfx().iter().any(|&b| b != 0) {
            return Err(AnnError::InvalItem4);
        }
        decrypted = copy;
        &decrypted
    } else {
        if item[..40] != *ann.last_ann_pfx() {
            return Err(AnnError::InvalItem4);
        }
        ann
    };

    if v1 {
        // the merkle branch proves the original item encoding, so rebuild
        // the item from the pre-root seed
        create_prog(prog, &ann_hash0[..32].try_into().unwrap()).map_err(|_| AnnError::Inval)?;
        item = mk_item2(item_no as u64, &ann_hash0[32..].try_into().unwrap(), prog)
            .map_err(|_| AnnError::Inval)?;
    }

    let item_hash = hash::compress64(&item);
    if !is_item_valid(ann.merkle_proof(), &item_hash, item_no as u16) {
        return Err(AnnError::Inval);
    }

    let mut work_hash = [0u8; 32];
    work_hash.copy_from_slice(&state.bytes()[..32]);
    if !work_check(&work_hash, hdr.work_bits) {
        return Err(AnnError::InsufPow);
    }
    Ok(work_hash)
}

enum PcHash {
    Block,
    Share,
    Insufficient,
}

fn is_work_ok(work_hash: &[u8; 32], commit: &CoinbaseCommit, target: u32) -> bool {
    let effective = crate::consensus::difficulty::get_effective_target(
        target,
        commit.ann_least_work_target,
        commit.num_anns,
    );
    work_check(work_hash, effective)
}

fn check_pc_hash(
    hap: &HeaderAndProof,
    commit: &CoinbaseCommit,
    share_target: u32,
) -> (PcHash, [u8; 32], [u64; NUM_ANNS]) {
    let hdr_hash = hash::compress32(&hap.header.to_bytes());
    let mut state = CycleState::init(&hdr_hash, u64::from(hap.nonce2));
    let mut indexes = [0u64; NUM_ANNS];
    for (j, idx) in indexes.iter_mut().enumerate() {
        // gets modded over the total ann count during proof hashing
        *idx = state.item_no();
        state
            .update(hap.announcements[j].as_item(), None, 0, None)
            .expect("zero-cycle update cannot fail");
    }
    state.smul();
    state.finalize();

    let mut work_hash = [0u8; 32];
    work_hash.copy_from_slice(&state.bytes()[..32]);

    let status = if is_work_ok(&work_hash, commit, hap.header.work_bits) {
        PcHash::Block
    } else if share_target != 0 && is_work_ok(&work_hash, commit, share_target) {
        PcHash::Share
    } else {
        PcHash::Insufficient
    };
    (status, work_hash, indexes)
}

/// Verify a header-and-proof against a commitment and the four parent block
/// hashes its announcements cite.
pub fn check_block(
    hap: &HeaderAndProof,
    block_height: u32,
    share_target: u32,
    commit: &CoinbaseCommit,
    block_hashes: &[[u8; 32]; NUM_ANNS],
    prog: &mut Program,
) -> Result<BlockCheck, BlockError> {
    if commit.magic != COINBASE_MAGIC {
        return Err(BlockError::BadCoinbase);
    }
    if !is_min_ann_diff_ok(commit.ann_least_work_target) {
        return Err(BlockError::BadCoinbase);
    }

    let (status, work_hash, ann_indexes) = check_pc_hash(hap, commit, share_target);

    let mut ann_hashes = [[0u8; 32]; NUM_ANNS];
    for i in 0..NUM_ANNS {
        let ann = &hap.announcements[i];
        if check_ann(ann, &block_hashes[i], prog).is_err() {
            return Err(BlockError::AnnInvalid(i));
        }
        let hdr = ann.header();
        let mut effective_ann_target = degrade_announcement_target(
            hdr.work_bits,
            block_height.wrapping_sub(hdr.parent_block_height),
        );
        if block_height < ANN_WAIT_PERIOD {
            effective_ann_target = hdr.work_bits;
        }
        if effective_ann_target > commit.ann_least_work_target {
            return Err(BlockError::AnnInsufPow(i));
        }
        ann_hashes[i] = hash::compress32(ann.as_bytes());
    }

    let pcp_hash = hash_proof(&ann_hashes, commit.num_anns, &ann_indexes, &hap.proof)
        .map_err(|_| BlockError::PcpInval)?;
    if pcp_hash != commit.merkle_root {
        return Err(BlockError::PcpMismatch);
    }

    match status {
        PcHash::Block => Ok(BlockCheck { status: BlockStatus::Block, work_hash }),
        PcHash::Share => Ok(BlockCheck { status: BlockStatus::Share, work_hash }),
        PcHash::Insufficient => Err(BlockError::InsufPow),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::BlockHeader;

    fn dummy_hap() -> HeaderAndProof {
        HeaderAndProof {
            header: BlockHeader::default(),
            nonce2: 0,
            announcements: Default::default(),
            proof: Vec::new(),
        }
    }

    #[test]
    fn test_check_block_rejects_bad_commitments() {
        let hap = dummy_hap();
        let hashes = [[0u8; 32]; NUM_ANNS];
        let mut prog = Program::new();

        let mut commit = CoinbaseCommit {
            magic: 0xdead_beef,
            ann_least_work_target: 0x2000_0fff,
            merkle_root: [0u8; 32],
            num_anns: 4,
        };
        assert_eq!(
            check_block(&hap, 10, 0, &commit, &hashes, &mut prog),
            Err(BlockError::BadCoinbase)
        );

        commit.magic = COINBASE_MAGIC;
        commit.ann_least_work_target = 0; // no representable work
        assert_eq!(
            check_block(&hap, 10, 0, &commit, &hashes, &mut prog),
            Err(BlockError::BadCoinbase)
        );

        commit.ann_least_work_target = 0x2080_0000; // over the cap
        assert_eq!(
            check_block(&hap, 10, 0, &commit, &hashes, &mut prog),
            Err(BlockError::BadCoinbase)
        );
    }

    #[test]
    fn test_check_block_rejects_garbage_announcements() {
        let hap = dummy_hap();
        let hashes = [[0u8; 32]; NUM_ANNS];
        let mut prog = Program::new();
        let commit = CoinbaseCommit {
            magic: COINBASE_MAGIC,
            ann_least_work_target: 0x2000_0fff,
            merkle_root: [0u8; 32],
            num_anns: 4,
        };
        // all-zero announcements cannot carry valid proof-of-work
        assert_eq!(
            check_block(&hap, 10, 0, &commit, &hashes, &mut prog),
            Err(BlockError::AnnInvalid(0))
        );
    }

    #[test]
    fn test_check_ann_rejects_garbage() {
        let ann = Announcement::default();
        let mut prog = Program::new();
        assert!(check_ann(&ann, &[0u8; 32], &mut prog).is_err());
    }
}
