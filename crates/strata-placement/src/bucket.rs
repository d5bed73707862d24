//! Bucket building and per-selector node ranking.
//!
//! The eligible pool (valid, online, in the policy subnet) is ranked once
//! per evaluation by hash distance to the container. Each selector then
//! walks that ranking in order, so every output keeps the nearest-first
//! property without sorting again:
//!
//! * `Unspecified`: the filtered pool as one bucket.
//! * `Same`: the bucket holding the globally nearest qualifying node.
//! * `Distinct`: the first (nearest) node seen for each bucket value.

use std::collections::HashSet;

use strata_types::{Clause, ContainerId, EvalError, NetworkMap, NodeInfo, SubnetId};

use crate::compile::{CompiledSelector, Plan};
use crate::filter::FilterArena;
use crate::hash::{rank, Ranked, Seed};

/// A selector or replica that could not be filled from the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct Shortfall {
    pub requested: usize,
    pub available: usize,
}

impl Shortfall {
    /// `Some` when `available` does not reach `requested`.
    pub fn check(requested: usize, available: usize) -> Option<Shortfall> {
        (available < requested).then_some(Shortfall { requested, available })
    }
}

/// Nodes eligible for placement in one evaluation, nearest first.
pub struct Pool<'m> {
    ranked: Vec<Ranked<'m>>,
}

impl<'m> Pool<'m> {
    pub fn new(map: &'m NetworkMap, subnet: SubnetId, seed: &Seed) -> Self {
        let eligible = map.nodes().iter().filter(|node| {
            if !node.is_valid() {
                tracing::debug!(
                    public_key = %hex::encode(&node.public_key),
                    "node skipped: duplicate or empty attributes"
                );
                return false;
            }
            node.is_online() && node.in_subnet(subnet)
        });
        Pool { ranked: rank(seed, eligible) }
    }

    pub fn len(&self) -> usize {
        self.ranked.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranked.is_empty()
    }

    pub fn nodes(&self) -> impl Iterator<Item = &'m NodeInfo> + '_ {
        self.ranked.iter().map(|r| r.node)
    }
}

/// Every node the selector may use, nearest first. Callers truncate.
pub fn rank_selector<'m>(
    pool: &Pool<'m>,
    filters: &FilterArena,
    selector: &CompiledSelector,
) -> Vec<&'m NodeInfo> {
    let attribute = selector.attribute.as_str();
    let mut candidates = pool
        .nodes()
        .filter(|node| filters.matches(selector.filter, node))
        .filter_map(|node| {
            if attribute.is_empty() {
                Some((node, ""))
            } else {
                node.attribute(attribute).map(|bucket| (node, bucket))
            }
        })
        .peekable();

    let ranked: Vec<&'m NodeInfo> = match selector.clause {
        Clause::Unspecified => candidates.map(|(node, _)| node).collect(),
        Clause::Same => match candidates.peek().map(|&(_, bucket)| bucket) {
            Some(bucket) => candidates
                .filter(|&(_, b)| b == bucket)
                .map(|(node, _)| node)
                .collect(),
            None => Vec::new(),
        },
        Clause::Distinct => {
            let mut seen = HashSet::new();
            candidates
                .filter(|&(_, bucket)| seen.insert(bucket))
                .map(|(node, _)| node)
                .collect()
        }
    };

    tracing::trace!(
        selector = %selector.name,
        clause = ?selector.clause,
        pool = pool.len(),
        ranked = ranked.len(),
        "selector ranked"
    );
    ranked
}

/// Output of a single selector.
#[derive(Debug, Clone)]
pub struct Selection<'m> {
    /// At most `count` nodes, nearest first.
    pub nodes: Vec<&'m NodeInfo>,
    pub shortfall: Option<Shortfall>,
}

/// Runs the selector `name` of a compiled plan on its own, returning at most
/// the selector's `count` nodes.
pub fn select<'m>(
    plan: &Plan,
    name: &str,
    map: &'m NetworkMap,
    container: &ContainerId,
) -> Result<Selection<'m>, EvalError> {
    let id = plan
        .selector_id(name)
        .ok_or_else(|| EvalError::UnknownSelector(name.to_string()))?;
    let selector = &plan.selectors()[id];
    let pool = Pool::new(map, plan.subnet_id(), &Seed::new(container));
    let mut nodes = rank_selector(&pool, plan.filters(), selector);
    let count = selector.count as usize;
    let shortfall = Shortfall::check(count, nodes.len());
    nodes.truncate(count);
    Ok(Selection { nodes, shortfall })
}
