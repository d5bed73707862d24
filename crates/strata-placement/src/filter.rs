//! Filter evaluation.
//!
//! Two entry points share the same comparison rules:
//!
//! * [`FilterArena`]: the compiled form, references already resolved to
//!   indices. Infallible; used by the planner.
//! * [`FilterTable`]: evaluates straight from decoded [`Filter`]s by name.
//!   Useful for tooling and for checking a single node against a policy
//!   that has not been compiled.
//!
//! Missing or malformed attribute data never errors: it is a non-match
//! (`NE` treats a missing attribute as a mismatch and so matches).

use std::cmp::Ordering;
use std::collections::HashMap;

use strata_types::{CompileError, EvalError, Filter, NodeInfo, Operation, MATCH_ALL};

/// Attribute comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl CmpOp {
    pub fn from_operation(op: Operation) -> Option<CmpOp> {
        Some(match op {
            Operation::Eq => CmpOp::Eq,
            Operation::Ne => CmpOp::Ne,
            Operation::Gt => CmpOp::Gt,
            Operation::Ge => CmpOp::Ge,
            Operation::Lt => CmpOp::Lt,
            Operation::Le => CmpOp::Le,
            _ => return None,
        })
    }

    /// `actual` is the node's attribute value, `None` when absent.
    pub fn matches(self, actual: Option<&str>, expected: &str) -> bool {
        let Some(actual) = actual else {
            return self == CmpOp::Ne;
        };
        match self {
            CmpOp::Eq => actual == expected,
            CmpOp::Ne => actual != expected,
            CmpOp::Gt => numeric_cmp(actual, expected) == Some(Ordering::Greater),
            CmpOp::Ge => matches!(
                numeric_cmp(actual, expected),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            CmpOp::Lt => numeric_cmp(actual, expected) == Some(Ordering::Less),
            CmpOp::Le => matches!(
                numeric_cmp(actual, expected),
                Some(Ordering::Less | Ordering::Equal)
            ),
        }
    }
}

/// Integers compare exactly; otherwise both sides must parse as finite floats.
fn numeric_cmp(a: &str, b: &str) -> Option<Ordering> {
    if let (Ok(x), Ok(y)) = (a.parse::<i128>(), b.parse::<i128>()) {
        return Some(x.cmp(&y));
    }
    let x: f64 = a.parse().ok()?;
    let y: f64 = b.parse().ok()?;
    if !x.is_finite() || !y.is_finite() {
        return None;
    }
    x.partial_cmp(&y)
}

// ---------------------------------------------------------------------------
// Compiled form
// ---------------------------------------------------------------------------

pub type FilterId = usize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterNode {
    MatchAll,
    Compare { key: String, op: CmpOp, value: String },
    /// OR. Empty matches nothing.
    Any(Vec<FilterId>),
    /// AND. Empty matches everything.
    All(Vec<FilterId>),
}

/// Flat storage for every filter of a compiled policy.
///
/// Slot `0` is always [`FilterNode::MatchAll`]; top-level definitions
/// follow in declaration order, then inline children. The reference graph is
/// acyclic by construction (checked in `compile`), so evaluation terminates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterArena {
    nodes: Vec<FilterNode>,
}

impl FilterArena {
    pub const MATCH_ALL: FilterId = 0;

    pub(crate) fn from_nodes(nodes: Vec<FilterNode>) -> Self {
        debug_assert_eq!(nodes.first(), Some(&FilterNode::MatchAll));
        FilterArena { nodes }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: FilterId) -> Option<&FilterNode> {
        self.nodes.get(id)
    }

    pub fn matches(&self, id: FilterId, node: &NodeInfo) -> bool {
        match &self.nodes[id] {
            FilterNode::MatchAll => true,
            FilterNode::Compare { key, op, value } => op.matches(node.attribute(key), value),
            FilterNode::Any(children) => children.iter().any(|&c| self.matches(c, node)),
            FilterNode::All(children) => children.iter().all(|&c| self.matches(c, node)),
        }
    }
}

// ---------------------------------------------------------------------------
// By-name evaluation
// ---------------------------------------------------------------------------

/// Name → definition table over decoded top-level filters.
///
/// On duplicate names the first definition wins; `compile` is the place that
/// rejects duplicates.
pub struct FilterTable<'p> {
    by_name: HashMap<&'p str, &'p Filter>,
}

impl<'p> FilterTable<'p> {
    pub fn new(filters: &'p [Filter]) -> Self {
        let mut by_name = HashMap::with_capacity(filters.len());
        for f in filters {
            by_name.entry(f.name.as_str()).or_insert(f);
        }
        FilterTable { by_name }
    }

    pub fn get(&self, name: &str) -> Option<&'p Filter> {
        self.by_name.get(name).copied()
    }

    /// Evaluate the filter called `name` against `node`. `*` is always true.
    pub fn evaluate(&self, name: &str, node: &NodeInfo) -> Result<bool, EvalError> {
        if name == MATCH_ALL {
            return Ok(true);
        }
        let filter = self
            .get(name)
            .ok_or_else(|| EvalError::UnknownFilterReference(name.to_string()))?;
        let mut path = vec![filter.name.as_str()];
        self.eval_definition(filter, node, &mut path)
    }

    fn eval_definition(
        &self,
        filter: &'p Filter,
        node: &NodeInfo,
        path: &mut Vec<&'p str>,
    ) -> Result<bool, EvalError> {
        match filter.op {
            Operation::Unspecified => Err(CompileError::InvalidFilter {
                name: filter.name.clone(),
                reason: "missing operation",
            }
            .into()),
            Operation::Or => {
                for child in &filter.filters {
                    if self.eval_child(child, node, path)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            Operation::And => {
                for child in &filter.filters {
                    if !self.eval_child(child, node, path)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            op => {
                let cmp = CmpOp::from_operation(op).ok_or_else(|| CompileError::InvalidFilter {
                    name: filter.name.clone(),
                    reason: "unknown operation",
                })?;
                Ok(cmp.matches(node.attribute(&filter.key), &filter.value))
            }
        }
    }

    fn eval_child(
        &self,
        child: &'p Filter,
        node: &NodeInfo,
        path: &mut Vec<&'p str>,
    ) -> Result<bool, EvalError> {
        if !child.is_reference() {
            return self.eval_definition(child, node, path);
        }
        if child.name == MATCH_ALL {
            return Ok(true);
        }
        let target = self
            .get(&child.name)
            .ok_or_else(|| EvalError::UnknownFilterReference(child.name.clone()))?;
        if path.contains(&target.name.as_str()) {
            let mut cycle: Vec<String> = path.iter().map(|s| s.to_string()).collect();
            cycle.push(target.name.clone());
            return Err(CompileError::CyclicReference { name: target.name.clone(), path: cycle }.into());
        }
        path.push(target.name.as_str());
        let result = self.eval_definition(target, node, path);
        path.pop();
        result
    }
}
