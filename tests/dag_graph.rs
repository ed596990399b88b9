use resctl::dag::Dag;
use resctl_test_utils::builders::rn;

#[test]
fn children_and_parents_follow_refs() {
    let mut dag = Dag::new();
    assert!(dag.add(&rn("a"), &[]));
    assert!(dag.add(&rn("b"), &[rn("a")]));
    assert!(dag.add(&rn("c"), &[rn("a"), rn("b")]));

    assert_eq!(dag.children(&rn("a")), vec![rn("b"), rn("c")]);
    assert_eq!(dag.parents(&rn("c")), vec![rn("a"), rn("b")]);
    assert!(dag.parents(&rn("a")).is_empty());
}

#[test]
fn absent_refs_are_not_reported_until_added() {
    let mut dag = Dag::new();
    assert!(dag.add(&rn("b"), &[rn("a")]));

    assert!(!dag.contains(&rn("a")));
    assert!(dag.parents(&rn("b")).is_empty());

    assert!(dag.add(&rn("a"), &[]));
    assert_eq!(dag.parents(&rn("b")), vec![rn("a")]);
    assert_eq!(dag.children(&rn("a")), vec![rn("b")]);
}

#[test]
fn removed_node_keeps_children_linked_for_when_it_returns() {
    let mut dag = Dag::new();
    dag.add(&rn("a"), &[]);
    dag.add(&rn("b"), &[rn("a")]);

    dag.remove(&rn("a"));
    assert!(!dag.contains(&rn("a")));
    assert!(dag.parents(&rn("b")).is_empty());

    dag.add(&rn("a"), &[]);
    assert_eq!(dag.parents(&rn("b")), vec![rn("a")]);
}

#[test]
fn self_reference_is_rejected() {
    let mut dag = Dag::new();
    assert!(!dag.add(&rn("a"), &[rn("a")]));
    assert!(!dag.contains(&rn("a")));
}

#[test]
fn ref_closing_a_cycle_is_rejected_and_graph_left_intact() {
    let mut dag = Dag::new();
    assert!(dag.add(&rn("a"), &[]));
    assert!(dag.add(&rn("b"), &[rn("a")]));
    assert!(dag.add(&rn("c"), &[rn("b")]));

    // a -> b -> c, so a ref from a to c closes a cycle.
    assert!(!dag.add(&rn("a"), &[rn("c")]));
    assert!(!dag.contains(&rn("a")));
    assert!(dag.contains(&rn("b")));
    assert!(dag.contains(&rn("c")));
    assert_eq!(dag.parents(&rn("c")), vec![rn("b")]);
}

#[test]
fn re_adding_replaces_refs() {
    let mut dag = Dag::new();
    dag.add(&rn("a"), &[]);
    dag.add(&rn("x"), &[]);
    dag.add(&rn("b"), &[rn("a")]);

    dag.add(&rn("b"), &[rn("x")]);
    assert_eq!(dag.parents(&rn("b")), vec![rn("x")]);
    assert!(dag.children(&rn("a")).is_empty());
}

#[test]
fn descendants_are_transitive_and_unique() {
    let mut dag = Dag::new();
    dag.add(&rn("a"), &[]);
    dag.add(&rn("b"), &[rn("a")]);
    dag.add(&rn("c"), &[rn("a")]);
    dag.add(&rn("d"), &[rn("b"), rn("c")]);

    let mut desc = dag.descendants(&rn("a"));
    desc.sort();
    assert_eq!(desc, vec![rn("b"), rn("c"), rn("d")]);
    assert!(dag.descendants(&rn("d")).is_empty());
}
