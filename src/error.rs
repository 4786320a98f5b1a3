use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("program generation error: {0}")]
    Program(#[from] crate::randprog::ProgramError),

    #[error("announcement validation error: {0}")]
    Announcement(#[from] crate::consensus::validate::AnnError),

    #[error("block validation error: {0}")]
    Block(#[from] crate::consensus::validate::BlockError),

    #[error("miner state error: {0}")]
    MinerState(#[from] crate::block::miner::StateError),

    #[error("malformed input: {0}")]
    Malformed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
