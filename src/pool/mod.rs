pub mod state;
pub mod work;

pub use state::StateFile;
pub use work::PoolWork;
