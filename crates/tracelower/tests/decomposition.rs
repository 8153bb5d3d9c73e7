//! Decomposition pre-pass behavior: expansion, idempotence, partial failure.

use std::collections::BTreeMap;

use anyhow::bail;

use tracelower::decompose::{
    DecomposeOutcome, DecomposeStats, DecompositionTable, decompose,
};
use tracelower::graph::DType;
use tracelower::ops::{standard_decompositions, standard_table};
use tracelower::trace::{NodeKind, TensorMeta, TraceGraph, TraceNode};
use tracelower::{ArgValue, lower};

fn r(name: &str) -> ArgValue {
    ArgValue::Ref(name.to_string())
}

fn silu_trace() -> TraceGraph {
    TraceGraph::new(
        "silu",
        vec![
            TraceNode::input("x", TensorMeta::from_static(DType::F32, &[2, 3])),
            TraceNode::call("y", "aten.silu", vec![r("x")]),
            TraceNode::output(vec![r("y")]),
        ],
    )
}

#[test]
fn silu_expands_into_sigmoid_and_mul() {
    let outcome = decompose(&silu_trace(), standard_decompositions()).expect("decompose");
    let DecomposeOutcome::Rewritten { trace, stats } = outcome else {
        panic!("expected a rewrite");
    };
    assert_eq!(stats.expanded, 1);
    assert!(stats.incomplete.is_empty());

    let targets: Vec<&str> = trace
        .nodes
        .iter()
        .filter(|node| node.kind == NodeKind::Call)
        .filter_map(|node| node.target.as_deref())
        .collect();
    assert_eq!(targets, vec!["aten.sigmoid", "aten.mul"]);

    // The rewritten trace lowers through the stock table directly.
    lower(&trace, standard_table()).expect("lower rewritten trace");
}

#[test]
fn pass_is_idempotent() {
    let outcome = decompose(&silu_trace(), standard_decompositions()).expect("first pass");
    let DecomposeOutcome::Rewritten { trace, .. } = outcome else {
        panic!("expected a rewrite");
    };
    let again = decompose(&trace, standard_decompositions()).expect("second pass");
    assert!(matches!(again, DecomposeOutcome::Unchanged));
}

#[test]
fn trace_without_matches_is_untouched() {
    let trace = TraceGraph::new(
        "plain",
        vec![
            TraceNode::input("x", TensorMeta::from_static(DType::F32, &[2])),
            TraceNode::call("y", "aten.relu", vec![r("x")]),
            TraceNode::output(vec![r("y")]),
        ],
    );
    let outcome = decompose(&trace, standard_decompositions()).expect("decompose");
    assert!(matches!(outcome, DecomposeOutcome::Unchanged));
}

#[test]
fn failing_site_is_kept_verbatim() {
    let mut table = DecompositionTable::new();
    table.register("aten.gelu", |_rt, _site| -> anyhow::Result<ArgValue> {
        bail!("tanh approximation not recorded")
    });
    let trace = TraceGraph::new(
        "partial",
        vec![
            TraceNode::input("x", TensorMeta::from_static(DType::F32, &[2])),
            TraceNode::call("y", "aten.gelu", vec![r("x")]),
            TraceNode::output(vec![r("y")]),
        ],
    );
    let outcome = decompose(&trace, &table).expect("decompose");
    let DecomposeOutcome::Rewritten { trace: rewritten, stats } = outcome else {
        panic!("expected a rewrite attempt");
    };
    assert_eq!(
        stats,
        DecomposeStats {
            expanded: 0,
            incomplete: vec!["aten.gelu".to_string()],
        }
    );
    // The site survives untouched.
    assert_eq!(rewritten.nodes[1].target.as_deref(), Some("aten.gelu"));
}

#[test]
fn self_referential_expansion_hits_the_depth_limit() {
    let mut table = DecompositionTable::new();
    table.register("aten.loop", |rt, site| {
        rt.emit("aten.loop", vec![site.arg(0)?.clone()], BTreeMap::new())
    });
    let trace = TraceGraph::new(
        "loop",
        vec![
            TraceNode::input("x", TensorMeta::from_static(DType::F32, &[2])),
            TraceNode::call("y", "aten.loop", vec![r("x")]),
            TraceNode::output(vec![r("y")]),
        ],
    );
    let err = decompose(&trace, &table).unwrap_err();
    assert!(err.to_string().contains("expansion depth limit"));
}

#[test]
fn downstream_references_are_remapped() {
    let trace = TraceGraph::new(
        "chain",
        vec![
            TraceNode::input("x", TensorMeta::from_static(DType::F32, &[2, 3])),
            TraceNode::call("act", "aten.silu", vec![r("x")]),
            TraceNode::call("y", "aten.neg", vec![r("act")]),
            TraceNode::output(vec![r("y")]),
        ],
    );
    let outcome = decompose(&trace, standard_decompositions()).expect("decompose");
    let DecomposeOutcome::Rewritten { trace, .. } = outcome else {
        panic!("expected a rewrite");
    };
    trace.validate().expect("rewritten trace validates");
    lower(&trace, standard_table()).expect("lower rewritten trace");
}

#[test]
fn qualified_overload_suffixes_match_the_family() {
    // aten.silu.default resolves to the aten.silu entry.
    let trace = TraceGraph::new(
        "qualified",
        vec![
            TraceNode::input("x", TensorMeta::from_static(DType::F32, &[2])),
            TraceNode::call("y", "aten.silu.default", vec![r("x")]),
            TraceNode::output(vec![r("y")]),
        ],
    );
    let outcome = decompose(&trace, standard_decompositions()).expect("decompose");
    assert!(matches!(outcome, DecomposeOutcome::Rewritten { .. }));
}
