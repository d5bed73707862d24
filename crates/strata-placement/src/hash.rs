//! Hash distance between a container and a node.
//!
//! Both sides are hashed with BLAKE3-256; the distance is the XOR of the two
//! digests read as a big-endian 256-bit integer. Equal distances (only
//! possible for equal public keys) fall back to public-key byte order. This
//! choice is part of the compatibility contract: changing it moves data.

use std::fmt;

use strata_types::{ContainerId, NodeInfo};

pub const DIGEST_LEN: usize = 32;

/// XOR distance; derived `Ord` on the byte array is big-endian numeric order.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Distance([u8; DIGEST_LEN]);

impl Distance {
    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }
}

impl fmt::Debug for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Distance({}..)", hex::encode(&self.0[..8]))
    }
}

/// Digest of a container identifier, computed once per evaluation.
#[derive(Debug, Clone, Copy)]
pub struct Seed([u8; DIGEST_LEN]);

impl Seed {
    pub fn new(container: &ContainerId) -> Self {
        Seed(*blake3::hash(container.as_bytes()).as_bytes())
    }

    pub fn distance(&self, public_key: &[u8]) -> Distance {
        let node = blake3::hash(public_key);
        let mut out = [0u8; DIGEST_LEN];
        for (o, (a, b)) in out.iter_mut().zip(self.0.iter().zip(node.as_bytes())) {
            *o = a ^ b;
        }
        Distance(out)
    }
}

/// A node paired with its distance to the current seed.
#[derive(Debug, Clone, Copy)]
pub struct Ranked<'m> {
    pub node: &'m NodeInfo,
    pub distance: Distance,
}

/// Ranks nodes nearest-first and drops repeated public keys, keeping the
/// first occurrence.
pub fn rank<'m>(seed: &Seed, nodes: impl IntoIterator<Item = &'m NodeInfo>) -> Vec<Ranked<'m>> {
    let mut ranked: Vec<Ranked<'m>> = nodes
        .into_iter()
        .map(|node| Ranked { node, distance: seed.distance(&node.public_key) })
        .collect();
    ranked.sort_by(|a, b| {
        a.distance
            .cmp(&b.distance)
            .then_with(|| a.node.public_key.cmp(&b.node.public_key))
    });
    ranked.dedup_by(|a, b| a.node.public_key == b.node.public_key);
    ranked
}
