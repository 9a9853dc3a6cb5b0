//! Ops commands for node maintenance

pub mod compact;
pub mod repair;
pub mod verify;

pub use compact::{compact_node, CompactReport};
pub use repair::{repair_node, RepairReport};
pub use verify::verify_node;
