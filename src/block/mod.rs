pub mod compress;
pub mod miner;
pub mod tree;

pub use miner::{BlockMiner, LockResult};
pub use tree::{hash_proof, ProofTree, TreeEntry};
