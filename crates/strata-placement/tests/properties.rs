use std::collections::HashSet;

use proptest::prelude::*;
use strata_placement::{compile, plan, select, FilterTable};
use strata_types::{
    Clause, ContainerId, Filter, NetworkMap, NodeInfo, NodeState, Operation, PlacementPolicy,
    Replica, Selector, MATCH_ALL,
};

const CITIES: [&str; 4] = ["Berlin", "Paris", "Oslo", "Rome"];

fn arb_map() -> impl Strategy<Value = NetworkMap> {
    prop::collection::vec((prop::option::of(0..CITIES.len()), 0u32..10), 0..24).prop_map(|specs| {
        let nodes = specs
            .into_iter()
            .enumerate()
            .map(|(i, (city, rating))| {
                let mut node = NodeInfo::new(vec![i as u8; 33], NodeState::Online)
                    .with_attribute("Rating", rating.to_string());
                if let Some(c) = city {
                    node = node.with_attribute("City", CITIES[c]);
                }
                node
            })
            .collect();
        NetworkMap::new(1, nodes)
    })
}

fn arb_container() -> impl Strategy<Value = ContainerId> {
    any::<[u8; 32]>().prop_map(ContainerId::from_bytes)
}

fn arb_clause() -> impl Strategy<Value = Clause> {
    prop_oneof![Just(Clause::Unspecified), Just(Clause::Same), Just(Clause::Distinct)]
}

fn arb_comparison() -> impl Strategy<Value = Operation> {
    prop_oneof![
        Just(Operation::Eq),
        Just(Operation::Ne),
        Just(Operation::Gt),
        Just(Operation::Ge),
        Just(Operation::Lt),
        Just(Operation::Le),
    ]
}

fn selector_policy(count: u32, clause: Clause, attribute: &str, filter: &str) -> PlacementPolicy {
    PlacementPolicy {
        replicas: vec![Replica { count, selector: "s".into() }],
        selectors: vec![Selector {
            name: "s".into(),
            count,
            clause,
            attribute: attribute.into(),
            filter: filter.into(),
        }],
        filters: vec![Filter::compare("rated", "Rating", Operation::Ge, "4")],
        ..Default::default()
    }
}

proptest! {
    #[test]
    fn distinct_never_shares_a_bucket(map in arb_map(), cid in arb_container(), count in 1u32..8) {
        let compiled = compile(&selector_policy(count, Clause::Distinct, "City", MATCH_ALL)).unwrap();
        let selection = select(&compiled, "s", &map, &cid).unwrap();
        let cities: HashSet<_> = selection.nodes.iter().map(|n| n.attribute("City")).collect();
        prop_assert_eq!(cities.len(), selection.nodes.len());
        prop_assert!(!cities.contains(&None));
    }

    #[test]
    fn same_stays_in_one_bucket(map in arb_map(), cid in arb_container(), count in 1u32..8) {
        let compiled = compile(&selector_policy(count, Clause::Same, "City", "rated")).unwrap();
        let selection = select(&compiled, "s", &map, &cid).unwrap();
        let cities: HashSet<_> = selection.nodes.iter().map(|n| n.attribute("City")).collect();
        prop_assert!(cities.len() <= 1);
    }

    #[test]
    fn selection_never_exceeds_count(
        map in arb_map(),
        cid in arb_container(),
        count in 1u32..30,
        clause in arb_clause(),
        attribute in prop_oneof![Just(""), Just("City"), Just("Rating")],
    ) {
        let compiled = compile(&selector_policy(count, clause, attribute, MATCH_ALL)).unwrap();
        let selection = select(&compiled, "s", &map, &cid).unwrap();
        prop_assert!(selection.nodes.len() <= count as usize);
        prop_assert_eq!(selection.shortfall.is_some(), selection.nodes.len() < count as usize);
    }

    #[test]
    fn groups_follow_replica_order(
        map in arb_map(),
        cid in arb_container(),
        counts in prop::collection::vec(1u32..5, 1..6),
        cbf in 0u32..3,
    ) {
        let policy = PlacementPolicy {
            replicas: counts
                .iter()
                .enumerate()
                .map(|(i, &count)| Replica {
                    count,
                    selector: if i % 2 == 0 { "s".into() } else { String::new() },
                })
                .collect(),
            container_backup_factor: cbf,
            selectors: vec![Selector {
                name: "s".into(),
                count: 1,
                clause: Clause::Distinct,
                attribute: "City".into(),
                filter: MATCH_ALL.into(),
            }],
            ..Default::default()
        };
        let placement = plan(&policy, &map, &cid).unwrap();
        prop_assert_eq!(placement.groups.len(), counts.len());
        for (i, group) in placement.groups.iter().enumerate() {
            prop_assert_eq!(group.replica, i);
            prop_assert!(group.primary.len() <= counts[i] as usize);
            prop_assert!(group.len() <= (counts[i] * (cbf + 1)) as usize);
            prop_assert!(group.backups.is_empty() || group.primary.len() == counts[i] as usize);
        }
    }

    #[test]
    fn empty_composites(map in arb_map()) {
        let defs = [Filter::and("all", vec![]), Filter::or("none", vec![])];
        let table = FilterTable::new(&defs);
        for node in map.nodes() {
            prop_assert!(table.evaluate("all", node).unwrap());
            prop_assert!(!table.evaluate("none", node).unwrap());
        }
    }

    #[test]
    fn missing_attribute_only_satisfies_ne(op in arb_comparison(), value in "[a-z0-9]{0,8}") {
        let defs = [Filter::compare("f", "Missing", op, value)];
        let table = FilterTable::new(&defs);
        let node = NodeInfo::new(vec![1; 33], NodeState::Online).with_attribute("City", "Oslo");
        prop_assert_eq!(table.evaluate("f", &node).unwrap(), op == Operation::Ne);
    }
}
