//! The proof entry table behind compact PacketCrypt proofs.
//!
//! For four leaf-to-root paths through a padded tree, the table enumerates
//! every entry those paths can reach, top-down, flagging which are
//! computable (announcements, or parents with both children present),
//! which are sentinel padding, and which must arrive explicitly in the
//! serialized proof. Serialization order is table order, so the layout
//! here is consensus-critical.

use super::tree::{branch_height, TreeEntry};
use crate::protocol::NUM_ANNS;

pub const F_COMPUTABLE: u16 = 1;
pub const F_PAD_ENTRY: u16 = 1 << 1;
pub const F_LEAF: u16 = 1 << 2;
pub const F_RIGHT: u16 = 1 << 3;
pub const F_PAD_SIBLING: u16 = 1 << 4;
pub const F_FIRST_ENTRY: u16 = 1 << 5;

pub const F_HAS_HASH: u16 = 1 << 8;
pub const F_HAS_RANGE: u16 = 1 << 9;
pub const F_HAS_START: u16 = 1 << 10;

const NO_CHILD: u16 = u16::MAX;

#[derive(Debug, Clone, Copy)]
pub struct ProofEntry {
    pub child_left: u16,
    pub child_right: u16,
    /// `u16::MAX` marks the root.
    pub parent: u16,
    pub flags: u16,
    pub e: TreeEntry,
}

pub struct ProofTable {
    pub branch_height: u32,
    pub entries: Vec<ProofEntry>,
}

struct Builder<'a> {
    entries: Vec<ProofEntry>,
    ann_numbers: &'a [u64; NUM_ANNS],
    ann_count: u64,
    capacity: usize,
}

impl Builder<'_> {
    /// Emit the entry covering `[bits, bits + 2^i_depth)` and recurse into
    /// any children on an announcement path. Returns the entry's index.
    fn mk_entries(&mut self, bits: u64, i_depth: u32, parent: u16) -> Result<u16, ()> {
        let e_num = self.entries.len();
        if e_num >= self.capacity {
            return Err(());
        }
        self.entries.push(ProofEntry {
            child_left: NO_CHILD,
            child_right: NO_CHILD,
            parent,
            flags: 0,
            e: TreeEntry::zeroed(),
        });
        let e_num = e_num as u16;

        let mask = if i_depth >= 64 { 0 } else { u64::MAX << i_depth };
        let mut flags = 0u16;
        if i_depth < 64 && (bits >> i_depth) & 1 == 1 {
            flags |= F_RIGHT;
        }
        if i_depth == 0 {
            flags |= F_LEAF;
        }
        if bits & mask == 0 {
            flags |= F_FIRST_ENTRY;
        }

        for i in 0..NUM_ANNS {
            if (self.ann_numbers[i] ^ bits) & mask != 0 {
                continue;
            }
            // on an announcement path
            self.entries[e_num as usize].flags = flags | F_COMPUTABLE;

            if flags & F_LEAF != 0 && bits == self.ann_numbers[i] {
                // this entry IS the announcement
                return Ok(e_num);
            }
            if flags & F_LEAF != 0 {
                return Err(());
            }

            let left = self.mk_entries(bits, i_depth - 1, e_num)?;
            let right = self.mk_entries(bits | (1u64 << (i_depth - 1)), i_depth - 1, e_num)?;
            self.entries[e_num as usize].child_left = left;
            self.entries[e_num as usize].child_right = right;
            if self.entries[right as usize].flags & F_PAD_ENTRY != 0 {
                self.entries[left as usize].flags |= F_PAD_SIBLING;
            }
            return Ok(e_num);
        }

        // not on any announcement path
        if bits >= self.ann_count {
            // beyond the leaf count: sentinel padding
            if flags & F_RIGHT == 0 {
                return Err(());
            }
            self.entries[e_num as usize].flags =
                flags | F_PAD_ENTRY | F_HAS_HASH | F_HAS_RANGE | F_HAS_START;
            self.entries[e_num as usize].e = TreeEntry::sentinel();
        } else {
            // a sibling whose data the proof must provide
            self.entries[e_num as usize].flags = flags;
        }
        Ok(e_num)
    }
}

impl ProofTable {
    /// Build the table for `ann_count` leaves (zero entry included) and
    /// four flat announcement indexes. `None` when an index is out of
    /// range or the paths blow the entry budget.
    pub fn new(ann_count: u64, ann_numbers: &[u64; NUM_ANNS]) -> Option<ProofTable> {
        // the zero entry guarantees at least two leaves in any real tree
        if ann_count < 2 {
            return None;
        }
        for &n in ann_numbers {
            if n >= ann_count {
                return None;
            }
        }
        let bh = branch_height(ann_count);
        let capacity = bh as usize * NUM_ANNS * 3;
        let mut builder = Builder {
            entries: Vec::with_capacity(capacity),
            ann_numbers,
            ann_count,
            capacity,
        };
        builder.mk_entries(0, bh, NO_CHILD).ok()?;
        Some(ProofTable { branch_height: bh, entries: builder.entries })
    }

    /// Descend from the root to the leaf holding flat index `ann_num`.
    pub fn get_ann(&self, ann_num: u64) -> usize {
        let mut path = ann_num.reverse_bits() >> (64 - self.branch_height);
        let mut e = 0usize;
        for _ in 0..self.branch_height {
            let next = if path & 1 == 1 {
                self.entries[e].child_right
            } else {
                self.entries[e].child_left
            };
            e = next as usize;
            path >>= 1;
        }
        assert!(self.entries[e].flags & F_LEAF != 0);
        e
    }

    pub fn parent(&self, idx: usize) -> Option<usize> {
        let p = self.entries[idx].parent;
        if p == NO_CHILD {
            debug_assert_eq!(idx, 0);
            return None;
        }
        Some(p as usize)
    }

    pub fn sibling(&self, idx: usize) -> Option<usize> {
        let p = self.parent(idx)?;
        let parent = &self.entries[p];
        let sib =
            if parent.child_left == idx as u16 { parent.child_right } else { parent.child_left };
        Some(sib as usize)
    }
}

/// Whether an entry's range travels explicitly in the proof stream: right
/// leaves always, otherwise anything that is neither a leaf, computable,
/// padding, nor adjacent to padding.
pub fn has_explicit_range(e: &ProofEntry) -> bool {
    if e.flags & (F_LEAF | F_RIGHT | F_PAD_ENTRY) == (F_LEAF | F_RIGHT) {
        return true;
    }
    e.flags & (F_LEAF | F_COMPUTABLE | F_PAD_ENTRY | F_PAD_SIBLING) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_out_of_range_index_is_rejected() {
        assert!(ProofTable::new(8, &[0, 1, 2, 8]).is_none());
        assert!(ProofTable::new(8, &[0, 1, 2, 7]).is_some());
    }

    #[test]
    fn test_root_and_leaves_are_wired() {
        let anns = [1u64, 3, 4, 6];
        let tbl = ProofTable::new(8, &anns).expect("table");
        assert_eq!(tbl.entries[0].parent, u16::MAX);
        assert!(tbl.entries[0].flags & F_COMPUTABLE != 0);
        for &n in &anns {
            let e = tbl.get_ann(n);
            let flags = tbl.entries[e].flags;
            assert!(flags & F_LEAF != 0 && flags & F_COMPUTABLE != 0);
            assert_eq!(flags & F_RIGHT != 0, n & 1 == 1);
            // walking parents reaches the root
            let mut cur = e;
            let mut hops = 0;
            while let Some(p) = tbl.parent(cur) {
                cur = p;
                hops += 1;
            }
            assert_eq!(cur, 0);
            assert_eq!(hops, tbl.branch_height);
        }
    }

    #[test]
    fn test_pad_entries_appear_past_the_leaf_count() {
        // 5 leaves in an 8-slot tree: indexes 5..8 pad out the right edge
        let tbl = ProofTable::new(5, &[4, 4, 4, 4]).expect("table");
        let pads =
            tbl.entries.iter().filter(|e| e.flags & F_PAD_ENTRY != 0).count();
        assert!(pads > 0);
        for e in &tbl.entries {
            if e.flags & F_PAD_ENTRY != 0 {
                assert!(e.e.is_sentinel());
                assert!(e.flags & F_RIGHT != 0);
            }
        }
    }

    #[test]
    fn test_sibling_is_symmetric() {
        let tbl = ProofTable::new(16, &[0, 5, 9, 15]).expect("table");
        for idx in 1..tbl.entries.len() {
            let sib = tbl.sibling(idx).expect("non-root sibling");
            assert_eq!(tbl.sibling(sib).expect("sibling back"), idx);
        }
    }
}
