//! Compiled-plan cache keyed by policy content.
//!
//! Entries are only ever removed by the caller ([`PlanCache::invalidate`],
//! [`PlanCache::clear`]). When the cache is full new plans are still
//! compiled and returned, just not retained.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use strata_types::{CompileError, Filter, PlacementPolicy};

use crate::compile::{compile_with_digest, Plan};

/// BLAKE3 digest over a canonical, length-prefixed encoding of a policy.
///
/// Two policies with equal fields in equal order always share a digest.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PolicyDigest([u8; 32]);

impl PolicyDigest {
    pub fn of(policy: &PlacementPolicy) -> Self {
        let mut h = blake3::Hasher::new();
        put_len(&mut h, policy.replicas.len());
        for r in &policy.replicas {
            put_u32(&mut h, r.count);
            put_str(&mut h, &r.selector);
        }
        put_u32(&mut h, policy.container_backup_factor);
        put_len(&mut h, policy.selectors.len());
        for s in &policy.selectors {
            put_str(&mut h, &s.name);
            put_u32(&mut h, s.count);
            put_str(&mut h, &format!("{:?}", s.clause));
            put_str(&mut h, &s.attribute);
            put_str(&mut h, &s.filter);
        }
        put_len(&mut h, policy.filters.len());
        for f in &policy.filters {
            put_filter(&mut h, f);
        }
        put_u32(&mut h, policy.subnet_id);
        PolicyDigest(*h.finalize().as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

fn put_len(h: &mut blake3::Hasher, n: usize) {
    h.update(&(n as u64).to_le_bytes());
}

fn put_u32(h: &mut blake3::Hasher, v: u32) {
    h.update(&v.to_le_bytes());
}

fn put_str(h: &mut blake3::Hasher, s: &str) {
    put_len(h, s.len());
    h.update(s.as_bytes());
}

fn put_filter(h: &mut blake3::Hasher, f: &Filter) {
    put_str(h, &f.name);
    put_str(h, &f.key);
    put_str(h, f.op.keyword());
    put_str(h, &f.value);
    put_len(h, f.filters.len());
    for child in &f.filters {
        put_filter(h, child);
    }
}

impl fmt::Display for PolicyDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for PolicyDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PolicyDigest({self})")
    }
}

pub struct PlanCache {
    capacity: usize,
    plans: RwLock<HashMap<PolicyDigest, Arc<Plan>>>,
}

impl PlanCache {
    pub const DEFAULT_CAPACITY: usize = 1024;

    pub fn new(capacity: usize) -> Self {
        PlanCache { capacity, plans: RwLock::new(HashMap::new()) }
    }

    /// Cached plan for `policy`, compiling it on a miss. Compile errors are
    /// returned and never cached.
    pub fn get_or_compile(&self, policy: &PlacementPolicy) -> Result<Arc<Plan>, CompileError> {
        let digest = PolicyDigest::of(policy);
        if let Some(plan) = self.plans.read().get(&digest) {
            tracing::trace!(%digest, "plan cache hit");
            return Ok(Arc::clone(plan));
        }

        let plan = Arc::new(compile_with_digest(policy, digest)?);
        let mut plans = self.plans.write();
        // Another caller may have compiled the same policy meanwhile.
        if let Some(existing) = plans.get(&digest) {
            return Ok(Arc::clone(existing));
        }
        if plans.len() >= self.capacity {
            tracing::warn!(%digest, capacity = self.capacity, "plan cache full, plan not retained");
            return Ok(plan);
        }
        tracing::debug!(%digest, "plan cache miss, plan stored");
        plans.insert(digest, Arc::clone(&plan));
        Ok(plan)
    }

    pub fn get(&self, digest: &PolicyDigest) -> Option<Arc<Plan>> {
        self.plans.read().get(digest).cloned()
    }

    /// Drops the plan for `digest`. Returns whether one was cached.
    pub fn invalidate(&self, digest: &PolicyDigest) -> bool {
        let removed = self.plans.write().remove(digest).is_some();
        if removed {
            tracing::debug!(%digest, "plan invalidated");
        }
        removed
    }

    pub fn invalidate_policy(&self, policy: &PlacementPolicy) -> bool {
        self.invalidate(&PolicyDigest::of(policy))
    }

    pub fn clear(&self) {
        self.plans.write().clear();
    }

    pub fn len(&self) -> usize {
        self.plans.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for PlanCache {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}
