pub mod futex;
pub mod slab;

pub use slab::{Block, PoolStats, SlabPool};
