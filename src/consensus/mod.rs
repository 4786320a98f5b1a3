pub mod difficulty;
pub mod validate;
pub mod work;

pub use difficulty::{
    compact_to_big, degrade_announcement_target, get_effective_target, get_hash_rate_multiplier,
    is_min_ann_diff_ok,
};
pub use work::{ann_soft_nonce_max, work_check};
