pub mod cycle;
pub mod hash;

pub use cycle::{CycleState, Item, ITEM_SZ, STATE_SZ};
