//! Merkle root and proof blocks over announcement content.
//!
//! Content up to 32 bytes is stored inline in the header; longer content is
//! committed by a recursive halving tree whose leaves are 32-byte chunks.

use crate::crypto::hash;

fn log2_ceil(x: u32) -> u32 {
    debug_assert!(x != 0);
    (31 - x.leading_zeros()) + u32::from(x & (x - 1) != 0)
}

fn compute_cycle(buf: &[u8], chunk_length: usize) -> [u8; 32] {
    if buf.len() <= 32 || chunk_length == 32 {
        let mut out = [0u8; 32];
        out[..buf.len().min(32)].copy_from_slice(&buf[..buf.len().min(32)]);
        return out;
    }
    let half = chunk_length >> 1;
    if half >= buf.len() {
        return compute_cycle(buf, half);
    }
    let mut both = [0u8; 64];
    both[..32].copy_from_slice(&compute_cycle(&buf[..half], half));
    both[32..].copy_from_slice(&compute_cycle(&buf[half..], half));
    hash::compress32(&both)
}

/// The 32-byte content commitment for `buf`.
pub fn compute(buf: &[u8]) -> [u8; 32] {
    assert!(!buf.is_empty());
    compute_cycle(buf, 1 << log2_ceil(buf.len() as u32))
}

/// The 32-byte block of `content` that proof index `proof_idx` selects, or
/// `None` when the content fits inline. A short final block is zero-padded
/// into `scratch`.
pub fn proof_block<'a>(
    proof_idx: u32,
    content: &'a [u8],
    scratch: &'a mut [u8; 32],
) -> Option<&'a [u8]> {
    if content.len() <= 32 {
        return None;
    }
    let mut total_blocks = content.len() / 32;
    if total_blocks * 32 < content.len() {
        total_blocks += 1;
    }
    let idx = (proof_idx as usize % total_blocks) * 32;
    if idx + 32 > content.len() {
        let len = content.len() - idx;
        scratch.fill(0);
        scratch[..len].copy_from_slice(&content[idx..]);
        Some(&scratch[..])
    } else {
        Some(&content[idx..idx + 32])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_content_is_inline() {
        let mut expect = [0u8; 32];
        expect[..5].copy_from_slice(b"hello");
        assert_eq!(compute(b"hello"), expect);
    }

    #[test]
    fn test_longer_content_hashes() {
        let content = [7u8; 100];
        let root = compute(&content);
        assert_eq!(root, compute(&content));
        let mut other = content;
        other[99] ^= 1;
        assert_ne!(root, compute(&other));
    }

    #[test]
    fn test_padding_is_significant() {
        // 33 bytes vs the same 33 bytes explicitly zero-padded differ from
        // the 32-byte truncation
        let a = compute(&[1u8; 33]);
        let b = compute(&[1u8; 32]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_proof_block_selection() {
        let content: Vec<u8> = (0..100u8).collect();
        let mut scratch = [0u8; 32];
        assert!(proof_block(0, &[0u8; 32], &mut scratch).is_none());
        let b0 = proof_block(0, &content, &mut scratch).expect("block");
        assert_eq!(b0, &content[..32]);
        // 100 bytes -> 4 blocks; index wraps
        let b4 = proof_block(4, &content, &mut scratch).expect("block").to_vec();
        assert_eq!(b4, &content[..32]);
        // the tail block is zero-padded
        let b3 = proof_block(3, &content, &mut scratch).expect("block");
        assert_eq!(&b3[..4], &content[96..]);
        assert!(b3[4..].iter().all(|&b| b == 0));
    }
}
