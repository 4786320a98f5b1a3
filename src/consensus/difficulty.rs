//! Difficulty arithmetic over 256-bit targets.
//!
//! Targets travel in bitcoin's compact "nBits" form; work is measured as
//! `2^256 / (target + 1)`. The effective target of a block scales with the
//! count and difficulty of the announcements committed to it:
//! `effective_work = block_work^3 / 1024 / ann_work / ann_count^2`.

use crate::config::ANN_WAIT_PERIOD;
use num_bigint::BigUint;
use num_traits::{One, ToPrimitive, Zero};

/// Highest target the compact form may express here (difficulty 1.0).
pub const MAX_COMPACT_TARGET: u32 = 0x207f_ffff;

fn big256() -> BigUint {
    BigUint::one() << 256u32
}

/// Decode a compact nBits value. The sign bit is ignored; targets are
/// non-negative by construction.
pub fn compact_to_big(compact: u32) -> BigUint {
    let size = compact >> 24;
    let word = compact & 0x007f_ffff;
    if size <= 3 {
        BigUint::from(word >> (8 * (3 - size)))
    } else {
        BigUint::from(word) << (8 * (size - 3))
    }
}

/// Encode a big integer in compact form with the canonical normalization:
/// a mantissa with its top bit set is shifted down and the size bumped.
pub fn big_to_compact(value: &BigUint) -> u32 {
    let mut size = ((value.bits() + 7) / 8) as u32;
    let mut compact = if size <= 3 {
        let word = value.iter_u64_digits().next().unwrap_or(0) as u32;
        word << (8 * (3 - size))
    } else {
        let shifted: BigUint = value >> (8 * (size - 3));
        shifted.iter_u64_digits().next().unwrap_or(0) as u32
    };
    if compact & 0x0080_0000 != 0 {
        compact >>= 8;
        size += 1;
    }
    compact | (size << 24)
}

/// `2^256 / (target + 1)`.
pub fn work_for_diff(target: &BigUint) -> BigUint {
    big256() / (target + BigUint::one())
}

/// `(2^256 - work) / work`, or `2^256` when `work` is zero.
pub fn diff_for_work(work: &BigUint) -> BigUint {
    if work.is_zero() {
        return big256();
    }
    (big256() - work) / work
}

fn effective_work(block_work: &BigUint, ann_work: &BigUint, ann_count: u64) -> BigUint {
    if ann_work.is_zero() || ann_count == 0 {
        // work *required*; with no announcements it is infinite
        return big256();
    }
    let cubed = block_work * block_work * block_work;
    let reduced: BigUint = cubed >> 10u32;
    let per_ann = reduced / ann_work;
    per_ann / (BigUint::from(ann_count) * BigUint::from(ann_count))
}

/// The share/block target implied by a block target, the weakest committed
/// announcement target and the announcement count.
pub fn get_effective_target(block_tar: u32, ann_tar: u32, ann_count: u64) -> u32 {
    let block_work = work_for_diff(&compact_to_big(block_tar));
    let ann_work = work_for_diff(&compact_to_big(ann_tar));
    let eff = effective_work(&block_work, &ann_work, ann_count);
    let res = big_to_compact(&diff_for_work(&eff));
    res.min(MAX_COMPACT_TARGET)
}

/// `ann_work * ann_count^2 / 1024`, saturating at `u64::MAX`. Expresses how
/// much the announcement set amplifies raw hashing.
pub fn get_hash_rate_multiplier(ann_tar: u32, ann_count: u64) -> u64 {
    let ann_work = work_for_diff(&compact_to_big(ann_tar));
    let product: BigUint =
        (ann_work * BigUint::from(ann_count) * BigUint::from(ann_count)) >> 10u32;
    product.to_u64().unwrap_or(u64::MAX)
}

/// Decay an announcement's target with age: not yet usable before the wait
/// period, unchanged exactly at it, then one doubling per block.
pub fn degrade_announcement_target(ann_tar: u32, ann_age_blocks: u32) -> u32 {
    if ann_age_blocks < ANN_WAIT_PERIOD {
        return 0xffff_ffff;
    }
    if ann_age_blocks == ANN_WAIT_PERIOD {
        return ann_tar;
    }
    let age = ann_age_blocks - ANN_WAIT_PERIOD;
    let shifted = compact_to_big(ann_tar) << age;
    let out = if shifted.bits() < 256 { big_to_compact(&shifted) } else { 0xffff_ffff };
    if out > MAX_COMPACT_TARGET {
        0xffff_ffff
    } else {
        out
    }
}

/// Sanity bound on a claimed minimum announcement target: representable,
/// non-zero, and carrying non-zero work under 2^256.
pub fn is_min_ann_diff_ok(target: u32) -> bool {
    if target == 0 || target > MAX_COMPACT_TARGET {
        return false;
    }
    let tar = compact_to_big(target);
    if tar.is_zero() {
        return false;
    }
    let work = work_for_diff(&tar);
    if work.is_zero() {
        return false;
    }
    work < big256()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_compact_round_trip() {
        for compact in [0x1d00_ffffu32, 0x1e00_ffff, 0x2000_0fff, 0x207f_ffff, 0x0301_0000] {
            let big = compact_to_big(compact);
            assert_eq!(big_to_compact(&big), compact, "compact {compact:#010x}");
        }
    }

    #[test]
    fn test_big_to_compact_normalizes_high_mantissa() {
        // 0x800000 would read as negative; the encoder bumps the exponent
        let v = BigUint::from(0x0080_0000u32);
        assert_eq!(big_to_compact(&v), 0x0400_8000);
    }

    #[test]
    fn test_work_for_diff_inverts() {
        let tar = compact_to_big(0x1d00_ffff);
        let work = work_for_diff(&tar);
        assert!(!work.is_zero());
        // more difficulty (lower target) means more work
        let easier = work_for_diff(&compact_to_big(0x207f_ffff));
        assert!(work > easier);
        // any acceptable minimum target carries work within 256 bits
        for tar in [0x1d00_ffffu32, 0x1f00_ffff, 0x207f_ffff] {
            assert!(is_min_ann_diff_ok(tar));
            let w = work_for_diff(&compact_to_big(tar));
            assert!(!w.is_zero() && w.bits() <= 256);
        }
    }

    #[test]
    fn test_effective_target_scenario() {
        let eff = get_effective_target(0x1e00_ffff, 0x2000_ffff, 1024);
        assert!(eff <= MAX_COMPACT_TARGET);
        assert!(compact_to_big(eff) > compact_to_big(0x1e00_ffff));
    }

    #[test]
    fn test_effective_target_matches_direct_formula() {
        for (block_tar, ann_tar, count) in [
            (0x1e00_ffffu32, 0x2000_ffffu32, 1024u64),
            (0x1f00_ffff, 0x2000_0fff, 16),
            (0x207f_ffff, 0x207f_ffff, 1),
        ] {
            let bw = work_for_diff(&compact_to_big(block_tar));
            let aw = work_for_diff(&compact_to_big(ann_tar));
            let direct = diff_for_work(
                &((&bw * &bw * &bw >> 10u32) / &aw / (BigUint::from(count) * count)),
            );
            let expect = big_to_compact(&direct).min(MAX_COMPACT_TARGET);
            assert_eq!(get_effective_target(block_tar, ann_tar, count), expect);
        }
    }

    #[test]
    fn test_effective_target_with_no_anns_is_impossible() {
        // infinite required work encodes as target zero
        assert_eq!(get_effective_target(0x1e00_ffff, 0x2000_ffff, 0), 0);
    }

    #[rstest]
    #[case(0, false)]
    #[case(0x2080_0000, false)]
    #[case(0x1f00_ffff, true)]
    #[case(0x207f_ffff, true)]
    fn test_is_min_ann_diff_ok(#[case] target: u32, #[case] ok: bool) {
        assert_eq!(is_min_ann_diff_ok(target), ok);
    }

    #[test]
    fn test_degrade_follows_age() {
        let tar = 0x2000_0fff;
        assert_eq!(degrade_announcement_target(tar, 0), 0xffff_ffff);
        assert_eq!(degrade_announcement_target(tar, 2), 0xffff_ffff);
        assert_eq!(degrade_announcement_target(tar, 3), tar);
        let aged = degrade_announcement_target(tar, 4);
        assert_ne!(aged, tar);
        assert!(compact_to_big(aged) == (compact_to_big(tar) << 1u32));
        // old enough and the target escapes the representable range
        assert_eq!(degrade_announcement_target(0x207f_ffff, 100), 0xffff_ffff);
    }

    #[test]
    fn test_hash_rate_multiplier_scales_quadratically() {
        let one = get_hash_rate_multiplier(0x2000_0fff, 1024);
        let two = get_hash_rate_multiplier(0x2000_0fff, 2048);
        assert_eq!(two / one, 4);
        assert_eq!(get_hash_rate_multiplier(0x0100_0001, u64::MAX), u64::MAX);
    }
}
