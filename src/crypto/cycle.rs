//! CryptoCycle: the keyed hashing/mixing primitive at the center of both
//! miners. A 2048-byte state carries a 48-byte control header followed by
//! payload; each `update` absorbs a 1024-byte item, re-randomizes the
//! header ("fuzzing") and runs a ChaCha20/Poly1305 pass whose control bits
//! are themselves taken from the evolving state.
//!
//! Header layout (bytes 0..48): 12-byte nonce, a 32-bit little-endian word
//! of packed control bits, then 32 bytes of key material which the crypt
//! pass overwrites with the Poly1305 authenticator.

use crate::randprog::{self, Program, ProgramError};
use chacha20::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use chacha20::ChaCha20;
use poly1305::universal_hash::{KeyInit, UniversalHash};
use poly1305::Poly1305;

pub const STATE_SZ: usize = 2048;
pub const ITEM_SZ: usize = 1024;

/// One absorbed block.
pub type Item = [u8; ITEM_SZ];

// control bit positions within the header data word
const ADDITIONAL_ZEROS: (u32, u32) = (0, 4);
const TRAILING_ZEROS: (u32, u32) = (8, 4);
const DECRYPT: (u32, u32) = (12, 1);
const ADD_LEN: (u32, u32) = (13, 3);
const TRUNCATED: (u32, u32) = (16, 1);
const LENGTH: (u32, u32) = (17, 7);
const FAILED: (u32, u32) = (24, 1);
const VERSION: (u32, u32) = (25, 7);

#[derive(Clone)]
pub struct CycleState {
    bytes: [u8; STATE_SZ],
}

fn poly_blocks(poly: &mut Poly1305, data: &[u8]) {
    debug_assert_eq!(data.len() % 16, 0);
    for chunk in data.chunks_exact(16) {
        poly.update(&[*poly1305::Block::from_slice(chunk)]);
    }
}

impl CycleState {
    /// Expand `seed` over the whole state, stamp the nonce, fuzz the header.
    pub fn init(seed: &[u8; 32], nonce: u64) -> Self {
        let mut state = CycleState { bytes: [0u8; STATE_SZ] };
        super::hash::expand(&mut state.bytes, seed, 0);
        state.bytes[..8].copy_from_slice(&nonce.to_le_bytes());
        state.make_fuzzable();
        state
    }

    pub fn bytes(&self) -> &[u8; STATE_SZ] {
        &self.bytes
    }

    /// The index of the next item to absorb.
    pub fn item_no(&self) -> u64 {
        u64::from_le_bytes(self.bytes[16..24].try_into().unwrap())
    }

    fn data_word(&self) -> u32 {
        u32::from_le_bytes(self.bytes[12..16].try_into().unwrap())
    }

    fn set_data_word(&mut self, v: u32) {
        self.bytes[12..16].copy_from_slice(&v.to_le_bytes());
    }

    fn field(&self, (begin, count): (u32, u32)) -> u32 {
        (self.data_word() >> begin) & ((1 << count) - 1)
    }

    fn set_field(&mut self, (begin, count): (u32, u32), val: u32) {
        let mask = (1u32 << count) - 1;
        let v = (self.data_word() & !(mask << begin)) | ((val & mask) << begin);
        self.set_data_word(v);
    }

    pub fn is_failed(&self) -> bool {
        self.field(FAILED) != 0
    }

    pub fn set_decrypt(&mut self, v: bool) {
        self.set_field(DECRYPT, v as u32);
    }

    /// Overwrite the control word with state-derived bytes, then force the
    /// bits that must hold for the pass to run: version 0, not failed, and
    /// a message length of at least 32 blocks (512 bytes).
    pub fn make_fuzzable(&mut self) {
        let (a, b) = (self.bytes[16], self.bytes[17]);
        let (c, d) = (self.bytes[18], self.bytes[19]);
        self.bytes[12..16].copy_from_slice(&[a, b, c, d]);
        self.set_field(VERSION, 0);
        self.set_field(FAILED, 0);
        let len = self.field(LENGTH);
        self.set_field(LENGTH, len | 32);
    }

    fn length_and_truncate(&mut self) -> usize {
        let len = self.field(LENGTH);
        let max_len = 125 - self.field(ADD_LEN);
        let final_len = len.min(max_len);
        self.set_field(TRUNCATED, (final_len != len) as u32);
        self.set_field(LENGTH, final_len);
        final_len as usize
    }

    /// One authenticated-encryption pass over the state, driven entirely by
    /// the header. Encrypting replaces the high key half with the Poly1305
    /// tag; decrypting authenticates first and leaves tag verification to
    /// the caller.
    pub fn crypt(&mut self) {
        if self.field(VERSION) != 0 || self.is_failed() {
            self.set_field(FAILED, 1);
            return;
        }

        let key: [u8; 32] = self.bytes[16..48].try_into().unwrap();
        let nonce: [u8; 12] = self.bytes[..12].try_into().unwrap();

        let mut block0 = [0u8; 64];
        ChaCha20::new(&key.into(), &nonce.into()).apply_keystream(&mut block0);
        let mut poly = Poly1305::new(poly1305::Key::from_slice(&block0[..32]));

        let aead_len = self.field(ADD_LEN) as usize * 16;
        let msg_len = self.length_and_truncate() * 16;
        let tzc = self.field(TRAILING_ZEROS) as usize;
        let azc = self.field(ADDITIONAL_ZEROS) as usize;
        let msg_start = 48 + aead_len;

        poly_blocks(&mut poly, &self.bytes[48..msg_start]);

        let decrypt = self.field(DECRYPT) != 0;
        if decrypt {
            poly_blocks(&mut poly, &self.bytes[msg_start..msg_start + msg_len]);
        }

        let mut cipher = ChaCha20::new(&key.into(), &nonce.into());
        cipher.seek(64u64);
        cipher.apply_keystream(&mut self.bytes[msg_start..msg_start + msg_len]);

        if !decrypt {
            if tzc > 0 {
                self.bytes[msg_start + msg_len - tzc..msg_start + msg_len].fill(0);
            }
            poly_blocks(&mut poly, &self.bytes[msg_start..msg_start + msg_len]);
        }

        let mut slen = [0u8; 16];
        slen[..8].copy_from_slice(&(aead_len as u64).wrapping_sub(azc as u64).to_le_bytes());
        slen[8..].copy_from_slice(&(msg_len as u64).wrapping_sub(tzc as u64).to_le_bytes());
        poly_blocks(&mut poly, &slen);

        let tag = poly.finalize();
        self.bytes[16..32].copy_from_slice(&tag);
    }

    fn banks(&self) -> [u32; 512] {
        let mut banks = [0u32; 512];
        for (w, chunk) in banks.iter_mut().zip(self.bytes.chunks_exact(4)) {
            *w = u32::from_le_bytes(chunk.try_into().unwrap());
        }
        banks
    }

    fn set_banks(&mut self, banks: &[u32; 512]) {
        for (w, chunk) in banks.iter().zip(self.bytes.chunks_exact_mut(4)) {
            chunk.copy_from_slice(&w.to_le_bytes());
        }
    }

    /// Run a program over this state's hash banks with an external memory
    /// window. Used directly by version-1 item generation.
    pub fn run_program(
        &mut self,
        words: &[u32],
        memory: &[u32],
        cycles: u32,
    ) -> Result<(), ProgramError> {
        let mut banks = self.banks();
        randprog::interpret(words, &mut banks, memory, cycles)?;
        self.set_banks(&banks);
        Ok(())
    }

    /// Absorb one item. With `rand_hash_cycles > 0` a program keyed by the
    /// item tail runs over the state's hash banks first, with the item as
    /// its memory window.
    pub fn update(
        &mut self,
        item: &Item,
        content_proof: Option<&[u8; 32]>,
        rand_hash_cycles: u32,
        prog: Option<&mut Program>,
    ) -> Result<(), ProgramError> {
        if rand_hash_cycles > 0 {
            let prog = prog.expect("RandHash cycles need a program buffer");
            let seed: [u8; 32] = item[992..1024].try_into().unwrap();
            prog.generate(&seed)?;
            let mut memory = [0u32; 256];
            for (w, chunk) in memory.iter_mut().zip(item.chunks_exact(4)) {
                *w = u32::from_le_bytes(chunk.try_into().unwrap());
            }
            self.run_program(prog.words(), &memory, rand_hash_cycles)?;
        }
        self.bytes[32..32 + ITEM_SZ].copy_from_slice(item);
        if let Some(proof) = content_proof {
            self.bytes[32 + ITEM_SZ..64 + ITEM_SZ].copy_from_slice(proof);
        }
        self.make_fuzzable();
        self.crypt();
        assert!(!self.is_failed(), "crypt failed on a fuzzable header");
        Ok(())
    }

    /// The elliptic-curve step: a double scalar multiplication that writes
    /// a shared secret over bytes 64..96. Exists to keep the inner loop
    /// asymmetric for hardware implementers.
    pub fn smul(&mut self) {
        let scalar: [u8; 32] = self.bytes[32..64].try_into().unwrap();
        let point = x25519_dalek::x25519(scalar, x25519_dalek::X25519_BASEPOINT_BYTES);
        let scalar2: [u8; 32] = self.bytes[..32].try_into().unwrap();
        let shared = x25519_dalek::x25519(scalar2, point);
        self.bytes[64..96].copy_from_slice(&shared);
    }

    /// Compress the whole state to 32 bytes written over its head.
    pub fn finalize(&mut self) {
        let digest = super::hash::compress32(&self.bytes);
        self.bytes[..32].copy_from_slice(&digest);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_deterministic_in_seed_and_nonce() {
        let seed = [9u8; 32];
        let a = CycleState::init(&seed, 1);
        let b = CycleState::init(&seed, 1);
        assert_eq!(a.bytes[..], b.bytes[..]);
        let c = CycleState::init(&seed, 2);
        assert_ne!(a.bytes[..], c.bytes[..]);
    }

    #[test]
    fn test_make_fuzzable_pins_version_and_length() {
        let mut s = CycleState::init(&[1u8; 32], 0);
        s.make_fuzzable();
        assert_eq!(s.field(VERSION), 0);
        assert!(!s.is_failed());
        assert!(s.field(LENGTH) >= 32);
    }

    #[test]
    fn test_crypt_round_trip_recovers_payload() {
        let seed = [42u8; 32];
        let plain = CycleState::init(&seed, 77);

        let mut enc = plain.clone();
        enc.crypt();

        // region bounds from a scratch copy that runs the same truncation
        let mut scratch = plain.clone();
        let aead_len = scratch.field(ADD_LEN) as usize * 16;
        let msg_len = scratch.length_and_truncate() * 16;
        let msg_start = 48 + aead_len;
        let tzc = scratch.field(TRAILING_ZEROS) as usize;

        // rebuild a decryption state: original header and key, encrypted body
        let mut dec = plain.clone();
        dec.bytes[msg_start..msg_start + msg_len]
            .copy_from_slice(&enc.bytes[msg_start..msg_start + msg_len]);
        dec.set_decrypt(true);
        dec.crypt();

        // payload bytes outside the zeroed tail must round-trip
        assert_eq!(
            dec.bytes[msg_start..msg_start + msg_len - tzc],
            plain.bytes[msg_start..msg_start + msg_len - tzc]
        );
        assert!(!dec.is_failed());
    }

    #[test]
    fn test_nonzero_version_sets_failed() {
        let mut s = CycleState::init(&[5u8; 32], 0);
        s.set_field(VERSION, 3);
        s.crypt();
        assert!(s.is_failed());
    }

    #[test]
    fn test_update_with_randhash_is_deterministic() {
        // program generation may reject an item's tail seed; scan for one
        // it accepts
        let seed = [7u8; 32];
        let mut done = false;
        for counter in 3u32..67 {
            let item = {
                let mut it = [0u8; ITEM_SZ];
                super::super::hash::expand(&mut it, &seed, counter);
                it
            };
            let mut a = CycleState::init(&seed, 5);
            let mut pa = Program::new();
            if a.update(&item, None, 4, Some(&mut pa)).is_err() {
                continue;
            }
            let mut b = CycleState::init(&seed, 5);
            let mut pb = Program::new();
            b.update(&item, None, 4, Some(&mut pb)).expect("same update succeeds");
            assert_eq!(a.bytes[..], b.bytes[..]);
            assert_eq!(a.item_no(), b.item_no());
            done = true;
            break;
        }
        assert!(done, "no item out of 64 was absorbable");
    }

    #[test]
    fn test_smul_writes_shared_secret() {
        let mut s = CycleState::init(&[11u8; 32], 9);
        let before: [u8; 32] = s.bytes[64..96].try_into().unwrap();
        s.smul();
        let after: [u8; 32] = s.bytes[64..96].try_into().unwrap();
        assert_ne!(before, after);
        // deterministic in the state prefix
        let mut t = CycleState::init(&[11u8; 32], 9);
        t.smul();
        assert_eq!(after[..], t.bytes[64..96]);
    }
}
