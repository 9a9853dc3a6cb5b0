//! Node API: the client-facing operations of one storage node and the
//! messages it exchanges with its peers

pub mod rpc;
pub mod server;

pub use rpc::{PeerRequest, PeerResponse, ReplicaFailure};
pub use server::{BackgroundTasks, StorageNode};
