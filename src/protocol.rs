//! Consensus-critical wire layouts.
//!
//! Every multi-byte integer is little-endian and every structure is packed;
//! none of these offsets may shift. Fixed buffers are wrapped in types with
//! accessor pairs rather than exposed as raw unions.

use crate::crypto::{Item, ITEM_SZ};

pub const BLOCK_HDR_SZ: usize = 80;
pub const ANN_HDR_SZ: usize = 88;
pub const ANN_SZ: usize = 1024;
pub const MERKLE_PROOF_SZ: usize = 896;
pub const LAST_ANN_PFX_SZ: usize = 40;
pub const COINBASE_COMMIT_SZ: usize = 48;
pub const NUM_ANNS: usize = 4;

/// Fixed part of a header-and-proof: header, pad, nonce2, four anns.
pub const HAP_FIXED_SZ: usize = BLOCK_HDR_SZ + 4 + 4 + ANN_SZ * NUM_ANNS;

pub const COINBASE_MAGIC: u32 = 0x0211_f909;

/// Bitcoin-compatible block header, bit-for-bit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockHeader {
    pub version: u32,
    pub hash_prev_block: [u8; 32],
    pub hash_merkle_root: [u8; 32],
    pub time_seconds: u32,
    pub work_bits: u32,
    pub nonce: u32,
}

impl BlockHeader {
    pub fn to_bytes(&self) -> [u8; BLOCK_HDR_SZ] {
        let mut out = [0u8; BLOCK_HDR_SZ];
        out[..4].copy_from_slice(&self.version.to_le_bytes());
        out[4..36].copy_from_slice(&self.hash_prev_block);
        out[36..68].copy_from_slice(&self.hash_merkle_root);
        out[68..72].copy_from_slice(&self.time_seconds.to_le_bytes());
        out[72..76].copy_from_slice(&self.work_bits.to_le_bytes());
        out[76..80].copy_from_slice(&self.nonce.to_le_bytes());
        out
    }

    pub fn from_bytes(b: &[u8; BLOCK_HDR_SZ]) -> Self {
        BlockHeader {
            version: u32::from_le_bytes(b[..4].try_into().unwrap()),
            hash_prev_block: b[4..36].try_into().unwrap(),
            hash_merkle_root: b[36..68].try_into().unwrap(),
            time_seconds: u32::from_le_bytes(b[68..72].try_into().unwrap()),
            work_bits: u32::from_le_bytes(b[72..76].try_into().unwrap()),
            nonce: u32::from_le_bytes(b[76..80].try_into().unwrap()),
        }
    }
}

/// Announcement header: 88 bytes at the head of every announcement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AnnounceHeader {
    pub version: u8,
    /// 24-bit; varies per hash without rebuilding the item table.
    pub soft_nonce: u32,
    /// Rolling this nonce requires regenerating the item table.
    pub hard_nonce: u32,
    pub work_bits: u32,
    pub parent_block_height: u32,
    pub content_type: u32,
    pub content_length: u32,
    pub content_hash: [u8; 32],
    pub signing_key: [u8; 32],
}

impl AnnounceHeader {
    pub fn to_bytes(&self) -> [u8; ANN_HDR_SZ] {
        let mut out = [0u8; ANN_HDR_SZ];
        out[0] = self.version;
        out[1..4].copy_from_slice(&self.soft_nonce.to_le_bytes()[..3]);
        out[4..8].copy_from_slice(&self.hard_nonce.to_le_bytes());
        out[8..12].copy_from_slice(&self.work_bits.to_le_bytes());
        out[12..16].copy_from_slice(&self.parent_block_height.to_le_bytes());
        out[16..20].copy_from_slice(&self.content_type.to_le_bytes());
        out[20..24].copy_from_slice(&self.content_length.to_le_bytes());
        out[24..56].copy_from_slice(&self.content_hash);
        out[56..88].copy_from_slice(&self.signing_key);
        out
    }

    pub fn from_bytes(b: &[u8; ANN_HDR_SZ]) -> Self {
        AnnounceHeader {
            version: b[0],
            soft_nonce: u32::from_le_bytes([b[1], b[2], b[3], 0]),
            hard_nonce: u32::from_le_bytes(b[4..8].try_into().unwrap()),
            work_bits: u32::from_le_bytes(b[8..12].try_into().unwrap()),
            parent_block_height: u32::from_le_bytes(b[12..16].try_into().unwrap()),
            content_type: u32::from_le_bytes(b[16..20].try_into().unwrap()),
            content_length: u32::from_le_bytes(b[20..24].try_into().unwrap()),
            content_hash: b[24..56].try_into().unwrap(),
            signing_key: b[56..88].try_into().unwrap(),
        }
    }
}

/// A 1024-byte announcement: header, merkle branch, last-item prefix.
#[derive(Clone, PartialEq, Eq)]
pub struct Announcement(pub(crate) [u8; ANN_SZ]);

impl Default for Announcement {
    fn default() -> Self {
        Announcement([0u8; ANN_SZ])
    }
}

impl std::fmt::Debug for Announcement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let h = self.header();
        write!(
            f,
            "Announcement {{ v{} soft {:#08x} hard {:#010x} bits {:#010x} parent {} }}",
            h.version, h.soft_nonce, h.hard_nonce, h.work_bits, h.parent_block_height
        )
    }
}

impl Announcement {
    pub fn from_bytes(b: [u8; ANN_SZ]) -> Self {
        Announcement(b)
    }

    pub fn as_bytes(&self) -> &[u8; ANN_SZ] {
        &self.0
    }

    /// Announcements double as CryptoCycle items in the block-mining loop.
    pub fn as_item(&self) -> &Item {
        const _: () = assert!(ANN_SZ == ITEM_SZ);
        &self.0
    }

    pub fn header(&self) -> AnnounceHeader {
        AnnounceHeader::from_bytes(self.0[..ANN_HDR_SZ].try_into().unwrap())
    }

    pub fn set_header(&mut self, hdr: &AnnounceHeader) {
        self.0[..ANN_HDR_SZ].copy_from_slice(&hdr.to_bytes());
    }

    pub fn version(&self) -> u8 {
        self.0[0]
    }

    pub fn soft_nonce(&self) -> u32 {
        u32::from_le_bytes([self.0[1], self.0[2], self.0[3], 0])
    }

    pub fn set_soft_nonce(&mut self, nonce: u32) {
        self.0[1..4].copy_from_slice(&nonce.to_le_bytes()[..3]);
    }

    pub fn work_bits(&self) -> u32 {
        u32::from_le_bytes(self.0[8..12].try_into().unwrap())
    }

    pub fn set_work_bits(&mut self, bits: u32) {
        self.0[8..12].copy_from_slice(&bits.to_le_bytes());
    }

    pub fn parent_block_height(&self) -> u32 {
        u32::from_le_bytes(self.0[12..16].try_into().unwrap())
    }

    pub fn content_length(&self) -> u32 {
        u32::from_le_bytes(self.0[20..24].try_into().unwrap())
    }

    pub fn merkle_proof(&self) -> &[u8] {
        &self.0[ANN_HDR_SZ..ANN_HDR_SZ + MERKLE_PROOF_SZ]
    }

    pub fn merkle_proof_mut(&mut self) -> &mut [u8] {
        &mut self.0[ANN_HDR_SZ..ANN_HDR_SZ + MERKLE_PROOF_SZ]
    }

    /// The last 64 bytes of the embedded branch carry the merkle root.
    pub fn proof_root(&self) -> [u8; 64] {
        self.0[ANN_HDR_SZ + MERKLE_PROOF_SZ - 64..ANN_HDR_SZ + MERKLE_PROOF_SZ]
            .try_into()
            .unwrap()
    }

    pub fn last_ann_pfx(&self) -> &[u8] {
        &self.0[ANN_SZ - LAST_ANN_PFX_SZ..]
    }

    pub fn last_ann_pfx_mut(&mut self) -> &mut [u8] {
        &mut self.0[ANN_SZ - LAST_ANN_PFX_SZ..]
    }
}

/// The 48-byte commitment embedded in the coinbase transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CoinbaseCommit {
    pub magic: u32,
    /// Target representing the least work of any announcement in the set.
    pub ann_least_work_target: u32,
    pub merkle_root: [u8; 32],
    pub num_anns: u64,
}

impl CoinbaseCommit {
    pub fn to_bytes(&self) -> [u8; COINBASE_COMMIT_SZ] {
        let mut out = [0u8; COINBASE_COMMIT_SZ];
        out[..4].copy_from_slice(&self.magic.to_le_bytes());
        out[4..8].copy_from_slice(&self.ann_least_work_target.to_le_bytes());
        out[8..40].copy_from_slice(&self.merkle_root);
        out[40..48].copy_from_slice(&self.num_anns.to_le_bytes());
        out
    }

    pub fn from_bytes(b: &[u8; COINBASE_COMMIT_SZ]) -> Self {
        CoinbaseCommit {
            magic: u32::from_le_bytes(b[..4].try_into().unwrap()),
            ann_least_work_target: u32::from_le_bytes(b[4..8].try_into().unwrap()),
            merkle_root: b[8..40].try_into().unwrap(),
            num_anns: u64::from_le_bytes(b[40..48].try_into().unwrap()),
        }
    }
}

/// A block header plus the four announcements and compact proof backing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderAndProof {
    pub header: BlockHeader,
    pub nonce2: u32,
    pub announcements: [Announcement; NUM_ANNS],
    pub proof: Vec<u8>,
}

impl HeaderAndProof {
    pub fn encoded_len(&self) -> usize {
        HAP_FIXED_SZ + self.proof.len()
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.header.to_bytes());
        out.extend_from_slice(&[0u8; 4]);
        out.extend_from_slice(&self.nonce2.to_le_bytes());
        for ann in &self.announcements {
            out.extend_from_slice(ann.as_bytes());
        }
        out.extend_from_slice(&self.proof);
    }

    pub fn decode(b: &[u8]) -> Option<Self> {
        if b.len() < HAP_FIXED_SZ {
            return None;
        }
        let header = BlockHeader::from_bytes(b[..BLOCK_HDR_SZ].try_into().unwrap());
        let nonce2 = u32::from_le_bytes(b[84..88].try_into().unwrap());
        let mut announcements: [Announcement; NUM_ANNS] = Default::default();
        for (i, ann) in announcements.iter_mut().enumerate() {
            let off = 88 + i * ANN_SZ;
            *ann = Announcement(b[off..off + ANN_SZ].try_into().unwrap());
        }
        Some(HeaderAndProof { header, nonce2, announcements, proof: b[HAP_FIXED_SZ..].to_vec() })
    }
}

/// The record written for every share found:
/// `length || pad || coinbase || header-and-proof`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Share {
    pub coinbase: CoinbaseCommit,
    pub hap: HeaderAndProof,
}

impl Share {
    pub fn encoded_len(&self) -> usize {
        8 + COINBASE_COMMIT_SZ + self.hap.encoded_len()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.extend_from_slice(&(self.encoded_len() as u32).to_le_bytes());
        out.extend_from_slice(&[0u8; 4]);
        out.extend_from_slice(&self.coinbase.to_bytes());
        self.hap.encode_into(&mut out);
        out
    }

    pub fn decode(b: &[u8]) -> Option<Self> {
        if b.len() < 8 + COINBASE_COMMIT_SZ + HAP_FIXED_SZ {
            return None;
        }
        let length = u32::from_le_bytes(b[..4].try_into().unwrap()) as usize;
        if length != b.len() {
            return None;
        }
        let coinbase = CoinbaseCommit::from_bytes(b[8..8 + COINBASE_COMMIT_SZ].try_into().unwrap());
        let hap = HeaderAndProof::decode(&b[8 + COINBASE_COMMIT_SZ..])?;
        Some(Share { coinbase, hap })
    }
}

/// In-process handoff record: an address and size instead of the content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FindRecord {
    pub ptr: u64,
    pub size: u64,
}

impl FindRecord {
    pub fn to_bytes(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[..8].copy_from_slice(&self.ptr.to_le_bytes());
        out[8..].copy_from_slice(&self.size.to_le_bytes());
        out
    }

    pub fn from_bytes(b: &[u8; 16]) -> Self {
        FindRecord {
            ptr: u64::from_le_bytes(b[..8].try_into().unwrap()),
            size: u64::from_le_bytes(b[8..].try_into().unwrap()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_header_round_trip() {
        let hdr = BlockHeader {
            version: 2,
            hash_prev_block: [0x11; 32],
            hash_merkle_root: [0x22; 32],
            time_seconds: 1_234_567,
            work_bits: 0x207f_ffff,
            nonce: 99,
        };
        let bytes = hdr.to_bytes();
        assert_eq!(BlockHeader::from_bytes(&bytes), hdr);
        assert_eq!(&bytes[72..76], &[0xff, 0xff, 0x7f, 0x20]);
    }

    #[test]
    fn test_announce_header_soft_nonce_is_24_bit() {
        let mut hdr = AnnounceHeader::default();
        hdr.version = 1;
        hdr.soft_nonce = 0x00ab_cdef;
        let bytes = hdr.to_bytes();
        assert_eq!(bytes[0], 1);
        assert_eq!(&bytes[1..4], &[0xef, 0xcd, 0xab]);
        assert_eq!(AnnounceHeader::from_bytes(&bytes).soft_nonce, 0x00ab_cdef);
    }

    #[test]
    fn test_announcement_accessors_match_offsets() {
        let mut ann = Announcement::default();
        ann.set_soft_nonce(0x123456);
        ann.set_work_bits(0x2000_0fff);
        assert_eq!(ann.soft_nonce(), 0x123456);
        assert_eq!(ann.work_bits(), 0x2000_0fff);
        assert_eq!(ann.merkle_proof().len(), MERKLE_PROOF_SZ);
        assert_eq!(ann.last_ann_pfx().len(), LAST_ANN_PFX_SZ);
    }

    #[test]
    fn test_share_round_trip() {
        let share = Share {
            coinbase: CoinbaseCommit {
                magic: COINBASE_MAGIC,
                ann_least_work_target: 0x2000_0fff,
                merkle_root: [7u8; 32],
                num_anns: 16,
            },
            hap: HeaderAndProof {
                header: BlockHeader::default(),
                nonce2: 5,
                announcements: Default::default(),
                proof: vec![1, 2, 3, 4, 5, 6, 7, 8],
            },
        };
        let bytes = share.encode();
        assert_eq!(bytes.len(), share.encoded_len());
        assert_eq!(Share::decode(&bytes).expect("decode"), share);
    }
}
