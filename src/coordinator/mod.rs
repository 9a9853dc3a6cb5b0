//! Replication coordinator: consistency levels, fan-out, hinted handoff
//! and read repair

pub mod consistency;
pub mod hints;
pub mod replication;
pub mod resolver;
pub mod transport;

pub use consistency::ConsistencyLevel;
pub use hints::{Hint, HintStore};
pub use replication::{Coordinator, HintReplayReport};
pub use resolver::{resolve, ReplicaResponse, Resolution};
pub use transport::{LocalNetwork, PeerHandler, PeerTransport};
