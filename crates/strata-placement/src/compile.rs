//! Policy compilation: decoded `PlacementPolicy` → immutable [`Plan`].
//!
//! Every name is resolved here, once. After a successful compile the plan
//! holds only indices, so evaluation never performs a string lookup and
//! can't hit an unknown reference.

use std::collections::HashMap;

use strata_types::{
    Clause, CompileError, Filter, ObjectKind, Operation, PlacementPolicy, SubnetId, MATCH_ALL,
};

use crate::cache::PolicyDigest;
use crate::filter::{CmpOp, FilterArena, FilterId, FilterNode};

pub type SelectorId = usize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledSelector {
    pub name: String,
    pub count: u32,
    pub clause: Clause,
    pub attribute: String,
    pub filter: FilterId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledReplica {
    pub count: u32,
    /// `None` selects from the whole eligible network map.
    pub selector: Option<SelectorId>,
}

/// Validated, reference-free form of a placement policy.
#[derive(Debug, Clone)]
pub struct Plan {
    digest: PolicyDigest,
    filters: FilterArena,
    filter_names: HashMap<String, FilterId>,
    selectors: Vec<CompiledSelector>,
    selector_names: HashMap<String, SelectorId>,
    replicas: Vec<CompiledReplica>,
    backup_factor: u32,
    subnet_id: SubnetId,
}

impl Plan {
    pub fn digest(&self) -> PolicyDigest {
        self.digest
    }

    pub fn filters(&self) -> &FilterArena {
        &self.filters
    }

    pub fn filter_id(&self, name: &str) -> Option<FilterId> {
        if name == MATCH_ALL {
            return Some(FilterArena::MATCH_ALL);
        }
        self.filter_names.get(name).copied()
    }

    pub fn selectors(&self) -> &[CompiledSelector] {
        &self.selectors
    }

    pub fn selector_id(&self, name: &str) -> Option<SelectorId> {
        self.selector_names.get(name).copied()
    }

    pub fn replicas(&self) -> &[CompiledReplica] {
        &self.replicas
    }

    pub fn backup_factor(&self) -> u32 {
        self.backup_factor
    }

    pub fn subnet_id(&self) -> SubnetId {
        self.subnet_id
    }
}

pub fn compile(policy: &PlacementPolicy) -> Result<Plan, CompileError> {
    compile_with_digest(policy, PolicyDigest::of(policy))
}

pub(crate) fn compile_with_digest(
    policy: &PlacementPolicy,
    digest: PolicyDigest,
) -> Result<Plan, CompileError> {
    let (filters, filter_names) = compile_filters(&policy.filters)?;

    let mut selectors = Vec::with_capacity(policy.selectors.len());
    let mut selector_names = HashMap::with_capacity(policy.selectors.len());
    for (id, s) in policy.selectors.iter().enumerate() {
        if selector_names.insert(s.name.clone(), id).is_some() {
            return Err(CompileError::DuplicateName {
                kind: ObjectKind::Selector,
                name: s.name.clone(),
            });
        }
        if s.count == 0 {
            return Err(CompileError::InvalidCount {
                kind: ObjectKind::Selector,
                name: s.name.clone(),
            });
        }
        let filter = if s.filter == MATCH_ALL {
            FilterArena::MATCH_ALL
        } else {
            *filter_names.get(&s.filter).ok_or_else(|| CompileError::UnresolvedReference {
                kind: ObjectKind::Selector,
                from: s.name.clone(),
                target: ObjectKind::Filter,
                name: s.filter.clone(),
            })?
        };
        selectors.push(CompiledSelector {
            name: s.name.clone(),
            count: s.count,
            clause: s.clause,
            attribute: s.attribute.clone(),
            filter,
        });
    }

    let mut replicas = Vec::with_capacity(policy.replicas.len());
    for (i, r) in policy.replicas.iter().enumerate() {
        if r.count == 0 {
            return Err(CompileError::InvalidCount {
                kind: ObjectKind::Replica,
                name: format!("#{i}"),
            });
        }
        let selector = if r.selector.is_empty() {
            None
        } else {
            Some(*selector_names.get(&r.selector).ok_or_else(|| {
                CompileError::UnresolvedReference {
                    kind: ObjectKind::Replica,
                    from: format!("#{i}"),
                    target: ObjectKind::Selector,
                    name: r.selector.clone(),
                }
            })?)
        };
        replicas.push(CompiledReplica { count: r.count, selector });
    }

    let plan = Plan {
        digest,
        filters,
        filter_names,
        selectors,
        selector_names,
        replicas,
        backup_factor: policy.container_backup_factor,
        subnet_id: policy.subnet_id,
    };
    tracing::debug!(
        digest = %plan.digest,
        filters = plan.filters.len(),
        selectors = plan.selectors.len(),
        replicas = plan.replicas.len(),
        "placement policy compiled"
    );
    Ok(plan)
}

// ---------------------------------------------------------------------------
// Filters
// ---------------------------------------------------------------------------

struct Lowering<'p> {
    names: &'p HashMap<String, FilterId>,
    nodes: Vec<FilterNode>,
    /// Top-level definitions referenced from the definition being lowered.
    refs: Vec<FilterId>,
    owner: &'p str,
}

impl<'p> Lowering<'p> {
    fn lower(&mut self, f: &Filter) -> Result<FilterNode, CompileError> {
        if f.op.is_composite() {
            let mut children = Vec::with_capacity(f.filters.len());
            for child in &f.filters {
                children.push(self.child(child)?);
            }
            return Ok(if f.op == Operation::Or {
                FilterNode::Any(children)
            } else {
                FilterNode::All(children)
            });
        }
        let owner = self.owner;
        let invalid = |reason| CompileError::InvalidFilter { name: owner.to_string(), reason };
        let Some(op) = CmpOp::from_operation(f.op) else {
            return Err(invalid("missing operation"));
        };
        if !f.filters.is_empty() {
            return Err(invalid("comparison filter has children"));
        }
        if f.key.is_empty() {
            return Err(invalid("comparison filter has no key"));
        }
        Ok(FilterNode::Compare { key: f.key.clone(), op, value: f.value.clone() })
    }

    fn child(&mut self, child: &Filter) -> Result<FilterId, CompileError> {
        if child.is_reference() {
            if child.name == MATCH_ALL {
                return Ok(FilterArena::MATCH_ALL);
            }
            let id = *self.names.get(&child.name).ok_or_else(|| {
                CompileError::UnresolvedReference {
                    kind: ObjectKind::Filter,
                    from: self.owner.to_string(),
                    target: ObjectKind::Filter,
                    name: child.name.clone(),
                }
            })?;
            self.refs.push(id);
            return Ok(id);
        }
        let node = self.lower(child)?;
        self.nodes.push(node);
        Ok(self.nodes.len() - 1)
    }
}

fn compile_filters(
    filters: &[Filter],
) -> Result<(FilterArena, HashMap<String, FilterId>), CompileError> {
    let mut names = HashMap::with_capacity(filters.len());
    for (i, f) in filters.iter().enumerate() {
        if f.name.is_empty() {
            return Err(CompileError::InvalidFilter {
                name: format!("#{i}"),
                reason: "top-level filter must be named",
            });
        }
        if f.name == MATCH_ALL {
            return Err(CompileError::InvalidFilter {
                name: f.name.clone(),
                reason: "name is reserved",
            });
        }
        if names.insert(f.name.clone(), i + 1).is_some() {
            return Err(CompileError::DuplicateName {
                kind: ObjectKind::Filter,
                name: f.name.clone(),
            });
        }
    }

    // Slots 1..=n are reserved for the definitions so references can point
    // at them before they are lowered.
    let mut nodes = vec![FilterNode::MatchAll; filters.len() + 1];
    let mut deps: Vec<Vec<FilterId>> = Vec::with_capacity(filters.len());
    for (i, f) in filters.iter().enumerate() {
        let mut lowering = Lowering {
            names: &names,
            nodes: std::mem::take(&mut nodes),
            refs: Vec::new(),
            owner: &f.name,
        };
        let lowered = lowering.lower(f);
        nodes = lowering.nodes;
        nodes[i + 1] = lowered?;
        deps.push(lowering.refs);
    }

    check_cycles(filters, &deps)?;
    Ok((FilterArena::from_nodes(nodes), names))
}

const WHITE: u8 = 0;
const GREY: u8 = 1;
const BLACK: u8 = 2;

/// Depth-first walk over definition → referenced definition edges with a
/// three-colour visited array; a grey hit is a cycle.
fn check_cycles(filters: &[Filter], deps: &[Vec<FilterId>]) -> Result<(), CompileError> {
    fn visit(
        def: usize,
        deps: &[Vec<FilterId>],
        colour: &mut [u8],
        stack: &mut Vec<usize>,
    ) -> Option<Vec<usize>> {
        colour[def] = GREY;
        stack.push(def);
        for &target in &deps[def] {
            let t = target - 1;
            match colour[t] {
                GREY => {
                    let start = stack.iter().position(|&d| d == t).unwrap_or(0);
                    let mut cycle = stack[start..].to_vec();
                    cycle.push(t);
                    return Some(cycle);
                }
                WHITE => {
                    if let Some(cycle) = visit(t, deps, colour, stack) {
                        return Some(cycle);
                    }
                }
                _ => {}
            }
        }
        stack.pop();
        colour[def] = BLACK;
        None
    }

    let mut colour = vec![WHITE; filters.len()];
    let mut stack = Vec::new();
    for def in 0..filters.len() {
        if colour[def] != WHITE {
            continue;
        }
        if let Some(cycle) = visit(def, deps, &mut colour, &mut stack) {
            let path: Vec<String> = cycle.iter().map(|&d| filters[d].name.clone()).collect();
            return Err(CompileError::CyclicReference { name: path[0].clone(), path });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use strata_types::{Replica, Selector};

    use super::*;

    fn selector(name: &str, filter: &str) -> Selector {
        Selector { name: name.into(), count: 1, filter: filter.into(), ..Default::default() }
    }

    fn policy() -> PlacementPolicy {
        PlacementPolicy {
            replicas: vec![
                Replica { count: 2, selector: "s1".into() },
                Replica { count: 1, selector: String::new() },
            ],
            container_backup_factor: 1,
            selectors: vec![selector("s1", "good"), selector("s2", MATCH_ALL)],
            filters: vec![
                Filter::compare("berlin", "City", Operation::Eq, "Berlin"),
                Filter::and(
                    "good",
                    vec![
                        Filter::reference("berlin"),
                        Filter::or(
                            "",
                            vec![
                                Filter::compare("", "Rating", Operation::Ge, "4"),
                                Filter::reference(MATCH_ALL),
                            ],
                        ),
                    ],
                ),
            ],
            subnet_id: 0,
        }
    }

    #[test]
    fn compiles_to_indices() {
        let plan = compile(&policy()).unwrap();
        assert_eq!(plan.filter_id("berlin"), Some(1));
        assert_eq!(plan.filter_id("good"), Some(2));
        assert_eq!(plan.filter_id(MATCH_ALL), Some(FilterArena::MATCH_ALL));
        assert_eq!(plan.selectors()[0].filter, 2);
        assert_eq!(plan.selectors()[1].filter, FilterArena::MATCH_ALL);
        assert_eq!(plan.replicas()[0].selector, Some(0));
        assert_eq!(plan.replicas()[1].selector, None);
        assert_eq!(plan.backup_factor(), 1);

        // "good" = All[berlin(1), Any[inline, match-all]]
        match plan.filters().get(2).unwrap() {
            FilterNode::All(children) => {
                assert_eq!(children[0], 1);
                assert!(matches!(plan.filters().get(children[1]), Some(FilterNode::Any(_))));
            }
            other => panic!("unexpected node {other:?}"),
        }
    }

    #[test]
    fn duplicate_filter_name() {
        let mut p = policy();
        p.filters.push(Filter::compare("berlin", "City", Operation::Ne, "x"));
        assert_eq!(
            compile(&p).unwrap_err(),
            CompileError::DuplicateName { kind: ObjectKind::Filter, name: "berlin".into() }
        );
    }

    #[test]
    fn duplicate_selector_name() {
        let mut p = policy();
        p.selectors.push(selector("s1", MATCH_ALL));
        assert_eq!(
            compile(&p).unwrap_err(),
            CompileError::DuplicateName { kind: ObjectKind::Selector, name: "s1".into() }
        );
    }

    #[test]
    fn unresolved_references() {
        let mut p = policy();
        p.selectors[1].filter = "missing".into();
        assert!(matches!(
            compile(&p).unwrap_err(),
            CompileError::UnresolvedReference { kind: ObjectKind::Selector, ref name, .. } if name == "missing"
        ));

        let mut p = policy();
        p.replicas[1].selector = "nope".into();
        assert!(matches!(
            compile(&p).unwrap_err(),
            CompileError::UnresolvedReference { kind: ObjectKind::Replica, target: ObjectKind::Selector, .. }
        ));

        let mut p = policy();
        p.filters[1].filters.push(Filter::reference("ghost"));
        assert!(matches!(
            compile(&p).unwrap_err(),
            CompileError::UnresolvedReference { kind: ObjectKind::Filter, ref from, .. } if from == "good"
        ));
    }

    #[test]
    fn self_reference_is_a_cycle() {
        let mut p = policy();
        p.filters.push(Filter::and(
            "loop",
            vec![Filter::or("", vec![Filter::reference("loop")])],
        ));
        match compile(&p).unwrap_err() {
            CompileError::CyclicReference { name, path } => {
                assert_eq!(name, "loop");
                assert_eq!(path, vec!["loop".to_string(), "loop".to_string()]);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn mutual_reference_is_a_cycle() {
        let mut p = policy();
        p.filters.push(Filter::and("a", vec![Filter::reference("b")]));
        p.filters.push(Filter::and("b", vec![Filter::reference("c")]));
        p.filters.push(Filter::and("c", vec![Filter::reference("a")]));
        match compile(&p).unwrap_err() {
            CompileError::CyclicReference { path, .. } => {
                assert_eq!(path, vec!["a", "b", "c", "a"]);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn shared_reference_is_not_a_cycle() {
        let mut p = policy();
        p.filters.push(Filter::or(
            "diamond",
            vec![Filter::reference("berlin"), Filter::reference("good")],
        ));
        assert!(compile(&p).is_ok());
    }

    #[test]
    fn zero_counts_rejected() {
        let mut p = policy();
        p.selectors[0].count = 0;
        assert_eq!(
            compile(&p).unwrap_err(),
            CompileError::InvalidCount { kind: ObjectKind::Selector, name: "s1".into() }
        );

        let mut p = policy();
        p.replicas[1].count = 0;
        assert_eq!(
            compile(&p).unwrap_err(),
            CompileError::InvalidCount { kind: ObjectKind::Replica, name: "#1".into() }
        );
    }

    #[test]
    fn malformed_filters_rejected() {
        let mut p = policy();
        let mut bad = Filter::compare("bad", "City", Operation::Eq, "x");
        bad.filters.push(Filter::compare("", "A", Operation::Eq, "1"));
        p.filters.push(bad);
        assert!(matches!(compile(&p).unwrap_err(), CompileError::InvalidFilter { .. }));

        let mut p = policy();
        p.filters.push(Filter::reference("noop"));
        assert!(matches!(compile(&p).unwrap_err(), CompileError::InvalidFilter { .. }));

        let mut p = policy();
        p.filters.push(Filter::and(MATCH_ALL, vec![]));
        assert!(matches!(compile(&p).unwrap_err(), CompileError::InvalidFilter { .. }));
    }
}
