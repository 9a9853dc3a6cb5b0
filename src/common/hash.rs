//! Hashing utilities for ringkv
//!
//! - BLAKE3 truncated to 128 bits for partition tokens
//! - Deterministic virtual-node token generation

use crate::common::model::{NodeId, Token};

/// Compute the ring token of a partition key.
///
/// Pure and deterministic: the first 16 bytes of BLAKE3(key), big-endian.
pub fn token_for(key: &[u8]) -> Token {
    let hash = blake3::hash(key);
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&hash.as_bytes()[0..16]);
    Token(u128::from_be_bytes(bytes))
}

/// Tokens owned by a node's virtual nodes.
///
/// Derived from the node id so a restarted node claims the same ranges
/// without having to persist them.
pub fn vnode_tokens(node: &NodeId, num_vnodes: usize) -> Vec<Token> {
    let mut tokens: Vec<Token> = (0..num_vnodes)
        .map(|i| {
            let mut hasher = blake3::Hasher::new();
            hasher.update(node.as_str().as_bytes());
            hasher.update(b"#vnode#");
            hasher.update(&(i as u64).to_le_bytes());
            let hash = hasher.finalize();
            let mut bytes = [0u8; 16];
            bytes.copy_from_slice(&hash.as_bytes()[0..16]);
            Token(u128::from_be_bytes(bytes))
        })
        .collect();
    tokens.sort();
    tokens.dedup();
    tokens
}
