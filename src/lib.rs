//! Passive Tree — skill-tree allocation and stat aggregation for games.
//!
//! Models a grid-based passive tree: a core board rooted at `core_main`,
//! extension and keystone boards attached at extension points, a point
//! economy with refunds, and the stat totals produced by whatever is
//! allocated on the active boards.

pub mod core;
pub mod schema;

pub use crate::core::config::EngineConfig;
pub use crate::core::engine::{AllocationEngine, AllocationError, EngineState};
pub use crate::core::tree::Tree;
