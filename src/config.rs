use serde::{Deserialize, Serialize};

/// How many blocks an announcement must age before it is usable.
pub const ANN_WAIT_PERIOD: u32 = 3;

/// Announcements are picked four at a time in every block-mining hash.
pub const NUM_ANNS: usize = 4;

/// RandHash program executions per announcement hash cycle (version 0).
pub const ANN_RANDHASH_CYCLES: u32 = 4;

/// Memohash rounds when deriving a version-0 item.
pub const ANN_MEMOHASH_CYCLES: u32 = 2;

/// Program generator tunables. These numbers shape the statistical profile
/// of generated programs and are consensus-critical: both miners and
/// validators must derive identical programs from identical seeds.
pub mod gen {
    /// Op budget available to one generated program.
    pub const INITIAL_BUDGET: u32 = 400_000;

    /// Hard cap on emitted instruction words.
    pub const MAX_INSNS: usize = 2048;

    /// Hard cap on operations executed in one interpreter cycle.
    pub const MAX_OPS: u64 = 200_000;

    pub const MEMORY_COST: u32 = 20;
    pub const INPUT_COST: u32 = 2;
    pub const BRANCH_COST: u32 = 50;

    pub const LOOP_MIN_CYCLES: u32 = 2;
    pub fn loop_max_cycles(scope_depth: u32) -> u32 {
        7 + scope_depth * 29
    }

    /// Budget fraction granted to each arm of an if statement. Only one arm
    /// runs per pass, but a reduced grant keeps programs compact.
    pub fn if_body_budget(budget: u32, _scopes: u32) -> u32 {
        budget * 7 / 32
    }

    // one-in-N likelihoods
    pub const RANDOM_BRANCH_LIKELIHOOD: u32 = 2;
    pub const HIGHER_SCOPE_LIKELIHOOD: u32 = 4;
    pub const VAR_REUSE_LIKELIHOOD: u32 = 8;
    pub const IMMEDIATE_LIKELIHOOD: u32 = 4;

    pub fn should_loop(rand: u32) -> bool {
        (rand % 64) < 46
    }

    pub fn should_branch(rand: u32, insn_count: usize) -> bool {
        (rand as u64 % 64 + (insn_count as u64 * 25 / MAX_INSNS as u64)) < 50
    }
}

/// Announcement miner knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnMinerConfig {
    /// Differentiates this miner from others mining the same content so they
    /// do not find identical announcements.
    pub miner_id: u32,
    pub threads: usize,
    /// Write 16-byte pointer records instead of whole announcements.
    pub send_ptr: bool,
    /// Re-validate every announcement before it is written out. Never alters
    /// the produced bytes.
    pub paranoia: bool,
}

impl Default for AnnMinerConfig {
    fn default() -> Self {
        AnnMinerConfig {
            miner_id: 0,
            threads: 1,
            send_ptr: false,
            paranoia: cfg!(debug_assertions),
        }
    }
}

/// Block miner knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockMinerConfig {
    /// Capacity of the announcement table; memory is reserved up front.
    pub max_anns: usize,
    /// Used to construct worker nonces; issue ids at least `threads` apart.
    pub miner_id: u32,
    pub threads: usize,
    /// Write 16-byte pointer records instead of whole shares.
    pub send_ptr: bool,
    /// Keep `header.time` fixed rather than tracking the wall clock.
    pub deterministic_time: bool,
}

impl Default for BlockMinerConfig {
    fn default() -> Self {
        BlockMinerConfig {
            max_anns: 1024,
            miner_id: 0,
            threads: 1,
            send_ptr: false,
            deterministic_time: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loop_bounds_grow_with_depth() {
        assert_eq!(gen::loop_max_cycles(0), 7);
        assert_eq!(gen::loop_max_cycles(3), 94);
        assert!(gen::LOOP_MIN_CYCLES < gen::loop_max_cycles(0));
    }

    #[test]
    fn test_branch_likelihood_decays_with_program_size() {
        // an empty program branches whenever rand % 64 < 50
        assert!(gen::should_branch(49, 0));
        // a full program has 25 subtracted from its chances
        assert!(!gen::should_branch(25, gen::MAX_INSNS));
    }
}
