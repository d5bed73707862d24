//! Placement policy evaluation.
//!
//! A [`PlacementPolicy`](strata_types::PlacementPolicy) is compiled once into
//! an immutable [`Plan`] (names resolved to arena indices, cycles and counts
//! checked), then evaluated against any number of [`NetworkMap`] snapshots:
//!
//! ```text
//! policy ──compile──▶ Plan ──place(map, container)──▶ Placement
//!                      │                                 │
//!                      └─ filters ─▶ buckets ─▶ ranked ──┘
//! ```
//!
//! Evaluation is pure computation over borrowed inputs; a `Plan` is `Send +
//! Sync` and can be shared across threads behind an `Arc`.
//!
//! [`NetworkMap`]: strata_types::NetworkMap

pub mod bucket;
pub mod cache;
pub mod compile;
pub mod filter;
pub mod hash;
pub mod parse;
pub mod planner;

pub use bucket::{select, Pool, Selection, Shortfall};
pub use cache::{PlanCache, PolicyDigest};
pub use compile::{compile, Plan};
pub use filter::FilterTable;
pub use hash::Distance;
pub use parse::{parse_policy, ParseError};
pub use planner::{plan, EvalOptions, NodeGroup, Placement};
