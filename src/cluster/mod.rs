//! Ring placement and gossip membership

pub mod gossip;
pub mod membership;
pub mod partitioner;
pub mod ring_view;

pub use gossip::{EndpointState, GossipDigest, Liveness, MemberStatus};
pub use membership::Membership;
pub use partitioner::TokenRing;
pub use ring_view::{RingView, SharedRing};
