//! Replica planning: turns a compiled [`Plan`] into per-replica node groups.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use strata_types::{ContainerId, EvalError, NetworkMap, NodeInfo, PlacementPolicy};
use tokio_util::sync::CancellationToken;

use crate::bucket::{rank_selector, Pool, Shortfall};
use crate::compile::{compile, Plan};
use crate::hash::Seed;

/// Cancellation and deadline checked between selector and replica steps.
#[derive(Debug, Clone, Default)]
pub struct EvalOptions {
    pub cancel: Option<CancellationToken>,
    pub deadline: Option<Instant>,
}

impl EvalOptions {
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    fn check(&self) -> Result<(), EvalError> {
        if self.cancel.as_ref().is_some_and(|t| t.is_cancelled()) {
            return Err(EvalError::Cancelled);
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(EvalError::DeadlineExceeded);
        }
        Ok(())
    }
}

/// Nodes chosen for one replica, `primary` first then ranked alternates.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct NodeGroup {
    pub replica: usize,
    pub selector: Option<String>,
    pub primary: Vec<NodeInfo>,
    pub backups: Vec<NodeInfo>,
    /// Set when fewer than the replica's `count` nodes were available.
    pub shortfall: Option<Shortfall>,
}

impl NodeGroup {
    pub fn nodes(&self) -> impl Iterator<Item = &NodeInfo> {
        self.primary.iter().chain(&self.backups)
    }

    pub fn len(&self) -> usize {
        self.primary.len() + self.backups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_short(&self) -> bool {
        self.shortfall.is_some()
    }
}

/// Result of evaluating a plan: group `i` belongs to replica `i`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct Placement {
    pub container: ContainerId,
    pub epoch: u64,
    pub groups: Vec<NodeGroup>,
}

impl Placement {
    pub fn is_fully_placed(&self) -> bool {
        self.groups.iter().all(|g| !g.is_short())
    }

    pub fn shortfalls(&self) -> impl Iterator<Item = (usize, Shortfall)> + '_ {
        self.groups
            .iter()
            .filter_map(|g| g.shortfall.map(|s| (g.replica, s)))
    }

    /// Every placed node once, in group order.
    pub fn flatten_unique(&self) -> Vec<&NodeInfo> {
        let mut seen = HashSet::new();
        self.groups
            .iter()
            .flat_map(|g| g.nodes())
            .filter(|n| seen.insert(n.public_key.clone()))
            .collect()
    }
}

impl Plan {
    /// Evaluates the plan against one network map snapshot.
    ///
    /// Each replica asks for `count * (backup_factor + 1)` nodes; the first
    /// `count` are primary, the rest backups. Selector rankings are computed
    /// at most once per call even when several replicas share a selector.
    pub fn place(
        &self,
        map: &NetworkMap,
        container: &ContainerId,
        opts: &EvalOptions,
    ) -> Result<Placement, EvalError> {
        opts.check()?;
        let pool = Pool::new(map, self.subnet_id(), &Seed::new(container));
        let factor = self.backup_factor() as usize + 1;
        let mut ranked: Vec<Option<Vec<&NodeInfo>>> = vec![None; self.selectors().len()];
        let mut groups = Vec::with_capacity(self.replicas().len());

        for (index, replica) in self.replicas().iter().enumerate() {
            opts.check()?;
            let count = replica.count as usize;
            let want = count.saturating_mul(factor);

            let (selector, candidates): (Option<String>, Vec<&NodeInfo>) = match replica.selector {
                None => (None, pool.nodes().take(want).collect()),
                Some(id) => {
                    let selector = &self.selectors()[id];
                    if ranked[id].is_none() {
                        opts.check()?;
                    }
                    let list = ranked[id]
                        .get_or_insert_with(|| rank_selector(&pool, self.filters(), selector));
                    let take = list.len().min(want);
                    (Some(selector.name.clone()), list[..take].to_vec())
                }
            };

            let available = match replica.selector {
                None => pool.len(),
                Some(id) => ranked[id].as_ref().map_or(0, Vec::len),
            };
            let shortfall = Shortfall::check(count, available);
            if let Some(s) = shortfall {
                tracing::warn!(
                    replica = index,
                    selector = selector.as_deref().unwrap_or("*"),
                    requested = s.requested,
                    available = s.available,
                    "insufficient nodes for replica"
                );
            }

            let split = count.min(candidates.len());
            groups.push(NodeGroup {
                replica: index,
                selector,
                primary: candidates[..split].iter().map(|&n| n.clone()).collect(),
                backups: candidates[split..].iter().map(|&n| n.clone()).collect(),
                shortfall,
            });
        }

        tracing::debug!(
            container = %container,
            epoch = map.epoch(),
            pool = pool.len(),
            groups = groups.len(),
            "placement computed"
        );
        Ok(Placement { container: *container, epoch: map.epoch(), groups })
    }
}

/// Compiles `policy` and places `container` on `map` in one step.
pub fn plan(
    policy: &PlacementPolicy,
    map: &NetworkMap,
    container: &ContainerId,
) -> Result<Placement, EvalError> {
    compile(policy)?.place(map, container, &EvalOptions::default())
}

#[cfg(test)]
mod tests {
    use strata_types::{Clause, Filter, NodeState, Operation, Replica, Selector, MATCH_ALL};

    use super::*;

    const CID: ContainerId = ContainerId::from_bytes([7; 32]);

    fn map(n: u8) -> NetworkMap {
        let nodes = (0..n)
            .map(|i| {
                NodeInfo::new(vec![i; 33], NodeState::Online)
                    .with_attribute("Rack", format!("r{}", i % 3))
            })
            .collect();
        NetworkMap::new(3, nodes)
    }

    fn policy(backup_factor: u32) -> PlacementPolicy {
        PlacementPolicy {
            replicas: vec![
                Replica { count: 2, selector: "racks".into() },
                Replica { count: 1, selector: String::new() },
                Replica { count: 1, selector: "racks".into() },
            ],
            container_backup_factor: backup_factor,
            selectors: vec![Selector {
                name: "racks".into(),
                count: 2,
                clause: Clause::Distinct,
                attribute: "Rack".into(),
                filter: MATCH_ALL.into(),
            }],
            filters: vec![],
            subnet_id: 0,
        }
    }

    #[test]
    fn groups_follow_replica_order() {
        let placement = plan(&policy(0), &map(9), &CID).unwrap();
        assert_eq!(placement.groups.len(), 3);
        for (i, g) in placement.groups.iter().enumerate() {
            assert_eq!(g.replica, i);
        }
        assert_eq!(placement.groups[0].selector.as_deref(), Some("racks"));
        assert_eq!(placement.groups[1].selector, None);
        assert_eq!(placement.groups[0].primary.len(), 2);
        assert!(placement.groups[0].backups.is_empty());
        assert_eq!(placement.groups[1].primary.len(), 1);
        assert!(placement.is_fully_placed());
        assert_eq!(placement.epoch, 3);
    }

    #[test]
    fn backup_factor_adds_alternates() {
        // 9 nodes in 3 racks: distinct ranking yields 3 representatives.
        let placement = plan(&policy(1), &map(9), &CID).unwrap();
        let first = &placement.groups[0];
        assert_eq!(first.primary.len(), 2);
        assert_eq!(first.backups.len(), 1);

        let whole_map = &placement.groups[1];
        assert_eq!(whole_map.primary.len(), 1);
        assert_eq!(whole_map.backups.len(), 1);
        assert!(placement.is_fully_placed());
    }

    #[test]
    fn replica_count_sizes_group_not_selector_count() {
        let mut p = policy(0);
        p.selectors[0].count = 1;
        p.replicas[0].count = 3;
        let map = map(9);
        let placement = plan(&p, &map, &CID).unwrap();
        assert_eq!(placement.groups[0].primary.len(), 3);
        assert!(placement.groups[0].shortfall.is_none());

        let compiled = compile(&p).unwrap();
        let selection = crate::bucket::select(&compiled, "racks", &map, &CID).unwrap();
        assert_eq!(selection.nodes.len(), 1);
        assert_eq!(selection.nodes[0], &placement.groups[0].primary[0]);
    }

    #[test]
    fn shared_selector_ranks_identically() {
        let placement = plan(&policy(0), &map(9), &CID).unwrap();
        assert_eq!(placement.groups[0].primary[0], placement.groups[2].primary[0]);
    }

    #[test]
    fn short_group_is_flagged_not_failed() {
        let mut p = policy(0);
        p.replicas[0].count = 5;
        let placement = plan(&p, &map(9), &CID).unwrap();
        let g = &placement.groups[0];
        assert_eq!(g.len(), 3);
        assert_eq!(g.shortfall, Some(Shortfall { requested: 5, available: 3 }));
        assert!(!placement.is_fully_placed());
        assert_eq!(placement.shortfalls().collect::<Vec<_>>(), vec![(0, g.shortfall.unwrap())]);
    }

    #[test]
    fn empty_map_yields_empty_groups() {
        let placement = plan(&policy(2), &NetworkMap::default(), &CID).unwrap();
        assert!(placement.groups.iter().all(|g| g.is_empty() && g.is_short()));
    }

    #[test]
    fn flatten_unique_dedups_across_groups() {
        let placement = plan(&policy(0), &map(9), &CID).unwrap();
        let unique = placement.flatten_unique();
        let total: usize = placement.groups.iter().map(NodeGroup::len).sum();
        assert!(unique.len() < total);
        let keys: HashSet<_> = unique.iter().map(|n| n.public_key.clone()).collect();
        assert_eq!(keys.len(), unique.len());
    }

    #[test]
    fn filtered_selector() {
        let mut p = policy(0);
        p.filters.push(Filter::compare("rack0", "Rack", Operation::Eq, "r0"));
        p.selectors[0].filter = "rack0".into();
        p.selectors[0].clause = Clause::Unspecified;
        let placement = plan(&p, &map(9), &CID).unwrap();
        assert!(placement.groups[0].nodes().all(|n| n.attribute("Rack") == Some("r0")));
    }

    #[test]
    fn compile_errors_surface() {
        let mut p = policy(0);
        p.replicas[1].count = 0;
        assert!(matches!(plan(&p, &map(3), &CID), Err(EvalError::Compile(_))));
    }

    #[test]
    fn cancelled_before_start() {
        let plan = compile(&policy(0)).unwrap();
        let token = CancellationToken::new();
        token.cancel();
        let opts = EvalOptions::default().with_cancel(token);
        assert_eq!(plan.place(&map(9), &CID, &opts), Err(EvalError::Cancelled));
    }

    #[test]
    fn expired_deadline() {
        let plan = compile(&policy(0)).unwrap();
        let opts = EvalOptions::default().with_deadline(Instant::now() - Duration::from_millis(1));
        assert_eq!(plan.place(&map(9), &CID, &opts), Err(EvalError::DeadlineExceeded));
    }

    #[test]
    fn plan_is_reusable_across_snapshots() {
        let plan = compile(&policy(0)).unwrap();
        let small = plan.place(&map(1), &CID, &EvalOptions::default()).unwrap();
        let large = plan.place(&map(9), &CID, &EvalOptions::default()).unwrap();
        assert!(!small.is_fully_placed());
        assert!(large.is_fully_placed());
    }
}
