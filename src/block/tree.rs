//! The PacketCryptProof tree: a sorted, range-labelled merkle tree over
//! announcement hashes.
//!
//! Every node carries a half-open `[start, end)` interval over the 64-bit
//! key space (the first 8 bytes of a hash, little-endian). Leaves abut:
//! each leaf's `end` is the next leaf's key, a synthetic zero entry anchors
//! `start = 0`, and sentinel padding anchors `end = 2^64 - 1`, so the root
//! provably covers the whole space and no announcement can be inserted or
//! dropped without moving the root.

use super::compress::{
    has_explicit_range, ProofTable, F_COMPUTABLE, F_FIRST_ENTRY, F_HAS_HASH, F_HAS_RANGE,
    F_HAS_START, F_LEAF, F_PAD_ENTRY, F_PAD_SIBLING, F_RIGHT,
};
use crate::crypto::hash;
use crate::protocol::NUM_ANNS;
use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProofError {
    #[error("proof fails a consensus invariant")]
    Invalid,

    #[error("proof drove the verifier into an inconsistent state")]
    Bug,
}

pub(crate) fn log2_floor(x: u64) -> u32 {
    debug_assert!(x != 0);
    63 - x.leading_zeros()
}

pub(crate) fn log2_ceil(x: u64) -> u32 {
    log2_floor(x) + u32::from(x & (x - 1) != 0)
}

/// A 48-byte tree node: hash plus its key range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeEntry {
    pub hash: [u8; 32],
    pub start: u64,
    pub end: u64,
}

impl TreeEntry {
    pub fn zeroed() -> Self {
        TreeEntry { hash: [0u8; 32], start: 0, end: 0 }
    }

    pub fn sentinel() -> Self {
        TreeEntry { hash: [0xff; 32], start: u64::MAX, end: u64::MAX }
    }

    /// The sort key: leading 8 hash bytes, little-endian.
    pub fn key(&self) -> u64 {
        u64::from_le_bytes(self.hash[..8].try_into().unwrap())
    }

    pub fn to_bytes(&self) -> [u8; 48] {
        let mut out = [0u8; 48];
        out[..32].copy_from_slice(&self.hash);
        out[32..40].copy_from_slice(&self.start.to_le_bytes());
        out[40..48].copy_from_slice(&self.end.to_le_bytes());
        out
    }

    pub fn is_sentinel(&self) -> bool {
        self.hash == [0xff; 32] && self.start == u64::MAX && self.end == u64::MAX
    }
}

fn hash_pair(left: &TreeEntry, right: &TreeEntry) -> [u8; 32] {
    let mut both = [0u8; 96];
    both[..48].copy_from_slice(&left.to_bytes());
    both[48..].copy_from_slice(&right.to_bytes());
    hash::compress32(&both)
}

/// Entries needed to hold a complete padded tree over `total` leaves.
fn entry_count(mut total: u64) -> u64 {
    let mut out = 0;
    while total > 1 {
        total += total & 1;
        out += total;
        total >>= 1;
    }
    out + 1
}

/// The tree itself. Storage is flat: index 0 is the synthetic zero entry,
/// announcement slots follow, then each internal layer up to the root.
/// Public indexes are announcement-relative; the zero entry is internal.
pub struct ProofTree {
    entries: Vec<TreeEntry>,
    root: [u8; 32],
    total_anns_zero_included: u64,
    capacity: u64,
}

impl ProofTree {
    pub fn new(max_anns: u64) -> Self {
        let slots = entry_count(max_anns + 1) as usize;
        ProofTree {
            entries: vec![TreeEntry::zeroed(); slots],
            root: [0u8; 32],
            total_anns_zero_included: max_anns + 1,
            capacity: max_anns,
        }
    }

    pub fn root(&self) -> &[u8; 32] {
        &self.root
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn ann_count(&self) -> u64 {
        self.total_anns_zero_included - 1
    }

    pub fn set_ann_count(&mut self, count: u64) {
        assert!(count <= self.capacity);
        self.total_anns_zero_included = count + 1;
    }

    /// Announcement entry `i` (zero entry excluded).
    pub fn entry(&self, i: u64) -> &TreeEntry {
        &self.entries[1 + i as usize]
    }

    pub fn entry_mut(&mut self, i: u64) -> &mut TreeEntry {
        &mut self.entries[1 + i as usize]
    }

    /// Sort announcement entries by key and strip what the tree cannot
    /// carry: keys of zero (they collide with the zero entry), keys of
    /// all-ones (they collide with sentinel padding) and duplicates (first
    /// occurrence wins). Each entry's `start` holds its pre-sort index so
    /// the caller can reorder its own buffers; returns the surviving count.
    pub fn prepare(&mut self) -> u64 {
        let total = (self.total_anns_zero_included - 1) as usize;
        let v = &mut self.entries[1..1 + total];
        for (i, e) in v.iter_mut().enumerate() {
            e.start = i as u64;
            e.end = u64::MAX;
        }
        v.sort_by_key(TreeEntry::key);

        let mut i = 0;
        while i < total && v[i].key() == 0 {
            i += 1;
        }

        let mut o = 0;
        while i < total {
            if i > o {
                v[o] = v[i];
            }
            i += 1;
            if i >= total || v[i].key() != v[o].key() {
                o += 1;
            }
        }

        while o > 0 && v[o - 1].key() == u64::MAX {
            o -= 1;
        }

        self.total_anns_zero_included = o as u64 + 1;
        o as u64
    }

    /// Label leaf ranges and fold the layers up to the root. `prepare` must
    /// have run first.
    pub fn compute(&mut self) {
        let count = self.total_anns_zero_included as usize;
        assert!(count >= 2, "compute needs at least one announcement");

        self.entries[count] = TreeEntry::sentinel();
        for i in 0..count {
            let start = self.entries[i].key();
            let end = self.entries[i + 1].key();
            self.entries[i].start = start;
            self.entries[i].end = end;
            assert!(end > start, "tree entries out of order");
        }

        let mut count_this_layer = count;
        let mut odx = count;
        let mut idx = 0;
        loop {
            if count_this_layer & 1 == 1 {
                self.entries[odx] = TreeEntry::sentinel();
                count_this_layer += 1;
                odx += 1;
            }
            for _ in (0..count_this_layer).step_by(2) {
                let left = self.entries[idx];
                let right = self.entries[idx + 1];
                assert!(left.end > left.start);
                assert!(right.end > right.start || right.is_sentinel());
                self.entries[odx] = TreeEntry {
                    hash: hash_pair(&left, &right),
                    start: left.start,
                    end: right.end,
                };
                odx += 1;
                idx += 2;
            }
            count_this_layer >>= 1;
            if count_this_layer <= 1 {
                break;
            }
        }
        assert_eq!(idx + 1, odx);
        assert_eq!(odx as u64, entry_count(count as u64));
        self.root = hash::compress32(&self.entries[odx - 1].to_bytes());
    }

    /// Walk up from flat index `ann_num`, collecting the sibling entry at
    /// each level.
    fn branch(&self, ann_num: u64, branch_height: u32) -> Vec<TreeEntry> {
        let mut out = Vec::with_capacity(branch_height as usize);
        let mut offset = ann_num;
        let mut base = 0u64;
        let mut count = self.total_anns_zero_included;
        for _ in 0..branch_height {
            let num = base + offset;
            out.push(self.entries[(num ^ 1) as usize]);
            offset >>= 1;
            count += count & 1;
            base += count;
            count >>= 1;
        }
        out
    }

    /// Build the compact proof for four announcement indexes. The indexes
    /// are announcement-relative; self-checks that an independent fold of
    /// the four branches reproduces the root.
    pub fn mk_proof(&self, ann_numbers: &[u64; NUM_ANNS]) -> Vec<u8> {
        let flat: [u64; NUM_ANNS] = ann_numbers.map(|n| n + 1);
        let bh = branch_height(self.total_anns_zero_included);
        let branches: Vec<Vec<TreeEntry>> = flat.iter().map(|&n| self.branch(n, bh)).collect();

        // fold each branch independently; all four must land on the root
        let mut roots = [[0u8; 32]; NUM_ANNS];
        for i in 0..NUM_ANNS {
            roots[i] = hash_branch(&self.entries[flat[i] as usize].hash, flat[i], &branches[i]);
            assert_eq!(roots[i], self.root, "tree branch does not refold to the root");
        }

        let tbl = ProofTable::new(self.total_anns_zero_included, &flat)
            .expect("proof table over our own tree");
        compress_proof(tbl, &flat, &branches, |i| *self.entry(ann_numbers[i]))
    }
}

pub(crate) fn branch_height(total_anns: u64) -> u32 {
    log2_ceil(total_anns)
}

/// Fold one leaf-to-root path, reconstructing interval labels as it goes.
fn hash_branch(ann_hash: &[u8; 32], ann_num: u64, branch: &[TreeEntry]) -> [u8; 32] {
    let mut e = [TreeEntry::zeroed(), TreeEntry::zeroed()];
    let mut num = ann_num;
    let slot = (num & 1) as usize;
    e[slot].hash = *ann_hash;
    e[slot].start = e[slot].key();
    e[slot].end = u64::MAX;
    for (i, b) in branch.iter().enumerate() {
        if (num >> i) & 1 == 1 {
            continue;
        }
        assert!(b.start > e[slot].start);
        e[slot].end = b.start;
        break;
    }
    for b in branch {
        e[1 - (num & 1) as usize] = *b;
        assert!(e[0].end > e[0].start || e[0].is_sentinel());
        assert!(e[1].end > e[1].start || e[1].is_sentinel());
        assert_eq!(e[1].start, e[0].end);
        num >>= 1;
        let parent = TreeEntry { hash: hash_pair(&e[0], &e[1]), start: e[0].start, end: e[1].end };
        e[(num & 1) as usize] = parent;
    }
    hash::compress32(&e[(num & 1) as usize].to_bytes())
}

/// Serialize the proof: explicit ranges and hashes in table order.
fn compress_proof(
    mut tbl: ProofTable,
    flat: &[u64; NUM_ANNS],
    branches: &[Vec<TreeEntry>],
    announcement: impl Fn(usize) -> TreeEntry,
) -> Vec<u8> {
    for i in 0..NUM_ANNS {
        let mut e = tbl.get_ann(flat[i]);
        tbl.entries[e].e = announcement(i);
        tbl.entries[e].flags |= F_HAS_HASH | F_HAS_START | F_HAS_RANGE;
        for b in &branches[i] {
            assert!(tbl.entries[e].flags & F_COMPUTABLE != 0);
            let sib = tbl.sibling(e).expect("non-root entry has a sibling");
            let sflags = tbl.entries[sib].flags;
            if sflags & (F_PAD_ENTRY | F_HAS_HASH) == 0 {
                tbl.entries[sib].e = *b;
                tbl.entries[sib].flags |= F_HAS_HASH | F_HAS_START | F_HAS_RANGE;
            } else if sflags & F_PAD_ENTRY != 0 {
                assert!(b.is_sentinel());
            } else {
                assert_eq!(tbl.entries[sib].e.hash, b.hash);
            }
            e = tbl.parent(sib).expect("sibling of a non-root entry has a parent");
        }
        assert_eq!(e, 0, "branch walk must end at the root");
    }

    let mut out = Vec::new();
    for entry in &tbl.entries {
        if has_explicit_range(entry) {
            assert!(entry.flags & (F_HAS_START | F_HAS_RANGE) == (F_HAS_START | F_HAS_RANGE));
            let range = entry.e.end.wrapping_sub(entry.e.start);
            assert!(range > 0);
            out.extend_from_slice(&range.to_le_bytes());
        }
        if entry.flags & (F_COMPUTABLE | F_PAD_ENTRY) == 0 {
            assert!(entry.flags & F_HAS_HASH != 0);
            out.extend_from_slice(&entry.e.hash);
        }
    }
    out
}

/// Verify a compact proof: rebuild the entry table, fill in the explicit
/// ranges and hashes, derive the leaf intervals from the announcement
/// hashes, then fold all four paths checking interval continuity at every
/// join. Returns the recomputed root. Consensus-critical.
pub fn hash_proof(
    ann_hashes: &[[u8; 32]; NUM_ANNS],
    total_anns: u64,
    ann_indexes: &[u64; NUM_ANNS],
    proof: &[u8],
) -> Result<[u8; 32], ProofError> {
    const INVAL: ProofError = ProofError::Invalid;
    const BUG: ProofError = ProofError::Bug;

    if total_anns == 0 {
        return Err(INVAL);
    }
    // bump for the zero entry
    let ann_idxs: [u64; NUM_ANNS] = ann_indexes.map(|n| (n % total_anns) + 1);
    let total = total_anns + 1;

    let mut tbl = ProofTable::new(total, &ann_idxs).ok_or(INVAL)?;

    for i in 0..NUM_ANNS {
        let e = tbl.get_ann(ann_idxs[i]);
        tbl.entries[e].e.hash = ann_hashes[i];
        tbl.entries[e].flags |= F_HAS_HASH;
    }

    // explicit ranges and hashes from the byte stream
    let mut cursor = proof;
    for i in 0..tbl.entries.len() {
        if has_explicit_range(&tbl.entries[i]) {
            if cursor.len() < 8 {
                return Err(INVAL);
            }
            tbl.entries[i].e.end = u64::from_le_bytes(cursor[..8].try_into().unwrap());
            tbl.entries[i].flags |= F_HAS_RANGE;
            cursor = &cursor[8..];
        }
        if tbl.entries[i].flags & (F_HAS_HASH | F_COMPUTABLE) == 0 {
            if cursor.len() < 32 {
                return Err(INVAL);
            }
            tbl.entries[i].e.hash = cursor[..32].try_into().unwrap();
            tbl.entries[i].flags |= F_HAS_HASH;
            cursor = &cursor[32..];
        }
    }
    if !cursor.is_empty() {
        return Err(INVAL);
    }

    // leaf intervals: right leaves carry an explicit range, left leaves
    // derive their end from the abutting right sibling
    for i in 0..NUM_ANNS {
        let e = tbl.get_ann(ann_idxs[i]);
        if tbl.entries[e].flags & (F_HAS_HASH | F_LEAF) != (F_HAS_HASH | F_LEAF) {
            return Err(BUG);
        }
        // already placed: duplicate announcement or neighboring leaves
        if tbl.entries[e].flags & F_HAS_START != 0 {
            continue;
        }
        let sib = tbl.sibling(e).ok_or(BUG)?;

        if tbl.entries[sib].flags & (F_PAD_ENTRY | F_HAS_START) == (F_PAD_ENTRY | F_HAS_START) {
            // revert the pad to a plain range for the shared path below
            tbl.entries[sib].e.end = 0;
            tbl.entries[sib].flags &= !F_HAS_START;
        }

        if tbl.entries[sib].flags & (F_HAS_HASH | F_LEAF) != (F_HAS_HASH | F_LEAF) {
            return Err(BUG);
        }
        if tbl.entries[sib].flags & F_HAS_START != 0 {
            return Err(BUG);
        }

        let e_start = tbl.entries[e].e.key();
        let s_start = tbl.entries[sib].e.key();
        tbl.entries[e].e.start = e_start;
        tbl.entries[sib].e.start = s_start;
        if tbl.entries[e].flags & F_RIGHT != 0 {
            tbl.entries[e].e.end = tbl.entries[e].e.end.wrapping_add(e_start);
            tbl.entries[sib].e.end = e_start;
        } else {
            tbl.entries[e].e.end = s_start;
            tbl.entries[sib].e.end = tbl.entries[sib].e.end.wrapping_add(s_start);
        }
        if tbl.entries[e].e.end <= tbl.entries[e].e.start {
            return Err(INVAL);
        }
        tbl.entries[e].flags |= F_HAS_START | F_HAS_RANGE;
        tbl.entries[sib].flags |= F_HAS_START | F_HAS_RANGE;
    }

    // fold each path upward as far as both children are known; the last
    // announcement closes the root
    for i in 0..NUM_ANNS {
        let mut e = tbl.get_ann(ann_idxs[i]);
        let need = F_HAS_HASH | F_HAS_RANGE | F_HAS_START;
        if tbl.entries[e].flags & need != need {
            return Err(BUG);
        }
        loop {
            let parent = match tbl.parent(e) {
                Some(p) => p,
                None => break,
            };
            if tbl.entries[parent].flags & F_HAS_HASH != 0 {
                break;
            }
            let sib = tbl.sibling(e).ok_or(BUG)?;
            if tbl.entries[sib].flags & F_HAS_HASH == 0 {
                break;
            }
            if tbl.entries[parent].flags & F_COMPUTABLE == 0 {
                return Err(BUG);
            }
            if tbl.entries[parent].flags & need != 0 {
                return Err(BUG);
            }
            let e_is_right = tbl.entries[e].flags & F_RIGHT != 0;

            if tbl.entries[sib].flags & F_HAS_RANGE == 0 {
                if tbl.entries[sib].flags & F_PAD_SIBLING == 0 || e_is_right {
                    return Err(BUG);
                }
                tbl.entries[sib].e.end = u64::MAX - tbl.entries[e].e.end;
                tbl.entries[sib].flags |= F_HAS_RANGE;
            }

            if tbl.entries[sib].flags & (F_HAS_HASH | F_HAS_RANGE)
                != (F_HAS_HASH | F_HAS_RANGE)
            {
                return Err(BUG);
            }

            if tbl.entries[sib].flags & F_HAS_START == 0 {
                if e_is_right {
                    // left.start = right.start - left.range; left.end = right.start
                    let start = tbl.entries[e].e.start.wrapping_sub(tbl.entries[sib].e.end);
                    tbl.entries[sib].e.start = start;
                    tbl.entries[sib].e.end = tbl.entries[e].e.start;
                } else {
                    // right.start = left.end; right.end = range + start
                    let start = tbl.entries[e].e.end;
                    tbl.entries[sib].e.start = start;
                    tbl.entries[sib].e.end = tbl.entries[sib].e.end.wrapping_add(start);
                }
                tbl.entries[sib].flags |= F_HAS_START;
                // no sum of ranges may exceed the key space or vanish
                if tbl.entries[sib].e.end <= tbl.entries[sib].e.start {
                    return Err(INVAL);
                }
            }

            let (left, right) = if e_is_right {
                (tbl.entries[sib].e, tbl.entries[e].e)
            } else {
                (tbl.entries[e].e, tbl.entries[sib].e)
            };

            // adjoining intervals must meet exactly
            if right.start != left.end {
                return Err(INVAL);
            }
            if right.end <= right.start && !right.is_sentinel() {
                return Err(BUG);
            }
            if left.end <= left.start && !left.is_sentinel() {
                return Err(BUG);
            }

            tbl.entries[parent].e =
                TreeEntry { hash: hash_pair(&left, &right), start: left.start, end: right.end };
            tbl.entries[parent].flags |= need;
            e = parent;
        }
    }

    let root = &tbl.entries[0];
    if root.flags != F_HAS_START | F_HAS_HASH | F_HAS_RANGE | F_COMPUTABLE | F_FIRST_ENTRY {
        return Err(BUG);
    }
    if root.e.start != 0 || root.e.end != u64::MAX {
        return Err(BUG);
    }
    Ok(hash::compress32(&root.e.to_bytes()))
}
