//! End-to-end lowering scenarios over the stock translation table.

use tracelower::graph::{DType, Dimension, Operation};
use tracelower::lower::{LowerError, lower};
use tracelower::ops::standard_table;
use tracelower::trace::{
    ExampleValue, NodeKind, TensorMeta, TraceDim, TraceError, TraceGraph, TraceNode,
};
use tracelower::{ArgValue, TensorLiteral};

fn sym(name: &str) -> TraceDim {
    TraceDim::Symbolic {
        name: Some(name.to_string()),
    }
}

fn r(name: &str) -> ArgValue {
    ArgValue::Ref(name.to_string())
}

#[test]
fn linear_chain_lowers_to_one_graph() {
    let trace = TraceGraph::new(
        "chain",
        vec![
            TraceNode::input("x", TensorMeta::from_static(DType::F32, &[2, 4])),
            TraceNode::call("h", "aten.relu", vec![r("x")]),
            TraceNode::call("y", "aten.tanh", vec![r("h")]),
            TraceNode::output(vec![r("y")]),
        ],
    );
    let lowered = lower(&trace, standard_table()).expect("lower chain");
    assert_eq!(lowered.graph.input_arity(), 1);
    assert_eq!(lowered.graph.output_arity(), 1);
    assert_eq!(lowered.graph.instructions.len(), 2);
    assert!(lowered.null_positions.is_empty());
    assert_eq!(lowered.input_signature.len(), 1);
}

#[test]
fn shared_symbol_appears_once_across_inputs() {
    let trace = TraceGraph::new(
        "shared",
        vec![
            TraceNode::input(
                "a",
                TensorMeta::new(DType::F32, vec![sym("batch"), TraceDim::Concrete(4)]),
            ),
            TraceNode::input(
                "b",
                TensorMeta::new(DType::F32, vec![sym("batch"), TraceDim::Concrete(4)]),
            ),
            TraceNode::call("y", "aten.add", vec![r("a"), r("b")]),
            TraceNode::output(vec![r("y")]),
        ],
    );
    let lowered = lower(&trace, standard_table()).expect("lower shared symbol");
    let first = &lowered.input_signature[0];
    let second = &lowered.input_signature[1];
    match (&first.shape.dims()[0], &second.shape.dims()[0]) {
        (Dimension::Dynamic(lhs), Dimension::Dynamic(rhs)) => assert_eq!(lhs, rhs),
        other => panic!("expected dynamic leading dims, got {other:?}"),
    }
}

#[test]
fn named_symbol_is_usable_as_a_reshape_extent() {
    let trace = TraceGraph::new(
        "reshape_sym",
        vec![
            TraceNode::input(
                "x",
                TensorMeta::new(
                    DType::F32,
                    vec![sym("n"), TraceDim::Concrete(2), TraceDim::Concrete(3)],
                ),
            ),
            TraceNode::call(
                "flat",
                "aten.reshape",
                vec![r("x"), ArgValue::Seq(vec![r("n"), ArgValue::Int(6)])],
            ),
            TraceNode::output(vec![r("flat")]),
        ],
    );
    let lowered = lower(&trace, standard_table()).expect("lower reshape");
    let instruction = &lowered.graph.instructions[0];
    match &instruction.op {
        Operation::Reshape(spec) => {
            assert!(matches!(spec.new_shape[0], Dimension::Dynamic(_)));
            assert_eq!(spec.new_shape[1], Dimension::Static(6));
        }
        other => panic!("expected a reshape, got {other:?}"),
    }
}

#[test]
fn unknown_operator_is_reported_with_its_position() {
    let trace = TraceGraph::new(
        "unknown",
        vec![
            TraceNode::input("x", TensorMeta::from_static(DType::F32, &[2])),
            TraceNode::call("y", "aten.polygamma.default", vec![r("x")]),
            TraceNode::output(vec![r("y")]),
        ],
    );
    let err = lower(&trace, standard_table()).unwrap_err();
    match err {
        LowerError::UnsupportedOperator {
            node_index,
            operator,
        } => {
            assert_eq!(node_index, 1);
            assert_eq!(operator, "aten.polygamma.default");
        }
        other => panic!("expected UnsupportedOperator, got {other}"),
    }
}

#[test]
fn call_method_nodes_are_rejected() {
    let mut node = TraceNode::call("y", "flatten", vec![r("x")]);
    node.kind = NodeKind::CallMethod;
    let trace = TraceGraph::new(
        "method",
        vec![
            TraceNode::input("x", TensorMeta::from_static(DType::F32, &[2])),
            node,
            TraceNode::output(vec![r("y")]),
        ],
    );
    let err = lower(&trace, standard_table()).unwrap_err();
    assert!(matches!(
        err,
        LowerError::UnsupportedNodeKind {
            kind: NodeKind::CallMethod,
            ..
        }
    ));
}

#[test]
fn unbound_scalar_input_fails_at_first_use() {
    // A non-tensor input with no recorded example stays unbound.
    let trace = TraceGraph::new(
        "unbound",
        vec![
            TraceNode::input("x", TensorMeta::from_static(DType::F32, &[2])),
            TraceNode::scalar_input("k", None),
            TraceNode::call("y", "aten.add", vec![r("x"), r("k")]),
            TraceNode::output(vec![r("y")]),
        ],
    );
    let err = lower(&trace, standard_table()).unwrap_err();
    assert!(matches!(err, LowerError::UnboundReference { .. }));
}

#[test]
fn opaque_arguments_are_rejected_by_name() {
    let trace = TraceGraph::new(
        "opaque",
        vec![
            TraceNode::input("x", TensorMeta::from_static(DType::F32, &[2])),
            TraceNode::call(
                "y",
                "aten.add",
                vec![
                    r("x"),
                    ArgValue::Opaque {
                        type_name: "torch.Generator".to_string(),
                    },
                ],
            ),
            TraceNode::output(vec![r("y")]),
        ],
    );
    let err = lower(&trace, standard_table()).unwrap_err();
    match err {
        LowerError::UnsupportedValueType { type_name, .. } => {
            assert_eq!(type_name, "torch.Generator");
        }
        other => panic!("expected UnsupportedValueType, got {other}"),
    }
}

#[test]
fn attribute_tensor_becomes_a_constant() {
    let weight = TensorLiteral::from_f32(
        &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
        &[2, 3],
        Default::default(),
    );
    let trace = TraceGraph::new(
        "attr",
        vec![
            TraceNode::input("x", TensorMeta::from_static(DType::F32, &[2, 3])),
            TraceNode::attribute(
                "w",
                "layer.weight",
                Some(ExampleValue::Tensor {
                    ty: weight.ty.clone(),
                    literal: Some(weight),
                }),
            ),
            TraceNode::call("y", "aten.mul", vec![r("x"), r("w")]),
            TraceNode::output(vec![r("y")]),
        ],
    );
    let lowered = lower(&trace, standard_table()).expect("lower attribute");
    assert!(matches!(
        lowered.graph.instructions[0].op,
        Operation::Constant(_)
    ));
}

#[test]
fn attribute_without_recorded_value_is_an_error() {
    let trace = TraceGraph::new(
        "attr_missing",
        vec![
            TraceNode::input("x", TensorMeta::from_static(DType::F32, &[2])),
            TraceNode::attribute("w", "layer.weight", None),
            TraceNode::call("y", "aten.mul", vec![r("x"), r("w")]),
            TraceNode::output(vec![r("y")]),
        ],
    );
    let err = lower(&trace, standard_table()).unwrap_err();
    assert!(matches!(err, LowerError::MissingAttribute { .. }));
}

#[test]
fn split_then_getitem_selects_one_chunk() {
    let trace = TraceGraph::new(
        "split",
        vec![
            TraceNode::input("x", TensorMeta::from_static(DType::F32, &[6, 2])),
            TraceNode::call(
                "parts",
                "aten.split",
                vec![r("x"), ArgValue::Int(2), ArgValue::Int(0)],
            ),
            TraceNode::call(
                "mid",
                "operator.getitem",
                vec![r("parts"), ArgValue::Int(1)],
            ),
            TraceNode::output(vec![r("mid")]),
        ],
    );
    let lowered = lower(&trace, standard_table()).expect("lower split");
    // Three slices are emitted; only the selected chunk reaches the output.
    assert_eq!(lowered.graph.instructions.len(), 3);
    assert_eq!(lowered.graph.output_arity(), 1);
}

#[test]
fn null_output_positions_are_recorded() {
    let trace = TraceGraph::new(
        "nulls",
        vec![
            TraceNode::input("x", TensorMeta::from_static(DType::F32, &[2])),
            TraceNode::call("y", "aten.neg", vec![r("x")]),
            TraceNode::output(vec![ArgValue::None, r("y"), ArgValue::None]),
        ],
    );
    let lowered = lower(&trace, standard_table()).expect("lower nulls");
    assert_eq!(lowered.null_positions, vec![0, 2]);
    assert_eq!(lowered.graph.output_arity(), 1);
}

#[test]
fn all_null_output_is_rejected() {
    let trace = TraceGraph::new(
        "empty",
        vec![
            TraceNode::input("x", TensorMeta::from_static(DType::F32, &[2])),
            TraceNode::call("y", "aten.neg", vec![r("x")]),
            TraceNode::output(vec![ArgValue::None]),
        ],
    );
    let err = lower(&trace, standard_table()).unwrap_err();
    assert!(matches!(err, LowerError::EmptyOutput));
}

#[test]
fn axis_operators_on_scalars_fail_cleanly() {
    // Axis-taking families must surface an error on rank-0 inputs, never
    // index an empty shape.
    let cases: Vec<(&str, Vec<ArgValue>)> = vec![
        ("aten.transpose", vec![r("x"), ArgValue::Int(0), ArgValue::Int(0)]),
        ("aten.sym_size", vec![r("x"), ArgValue::Int(0)]),
        ("aten.slice", vec![r("x"), ArgValue::Int(0)]),
    ];
    for (target, args) in cases {
        let trace = TraceGraph::new(
            "scalar_axis",
            vec![
                TraceNode::input("x", TensorMeta::from_static(DType::F32, &[])),
                TraceNode::call("y", target, args),
                TraceNode::output(vec![r("y")]),
            ],
        );
        let err = lower(&trace, standard_table()).unwrap_err();
        assert!(
            matches!(err, LowerError::LoweringFailed { .. }),
            "{target}: expected LoweringFailed, got {err}"
        );
    }
}

#[test]
fn validation_failures_surface_through_lowering() {
    let trace = TraceGraph::new(
        "no_output",
        vec![TraceNode::input(
            "x",
            TensorMeta::from_static(DType::F32, &[1]),
        )],
    );
    let err = lower(&trace, standard_table()).unwrap_err();
    assert!(matches!(
        err,
        LowerError::Trace(TraceError::MissingOutput)
    ));
}

#[test]
fn input_after_operation_is_rejected() {
    let trace = TraceGraph::new(
        "late_input",
        vec![
            TraceNode::input("x", TensorMeta::from_static(DType::F32, &[2])),
            TraceNode::call("y", "aten.neg", vec![r("x")]),
            TraceNode::input("z", TensorMeta::from_static(DType::F32, &[2])),
            TraceNode::output(vec![r("y")]),
        ],
    );
    let err = lower(&trace, standard_table()).unwrap_err();
    assert!(matches!(
        err,
        LowerError::Trace(TraceError::InputAfterOperation { .. })
    ));
}

#[test]
fn shape_errors_carry_the_failing_operator_and_args() {
    let trace = TraceGraph::new(
        "bad_matmul",
        vec![
            TraceNode::input("a", TensorMeta::from_static(DType::F32, &[2, 3])),
            TraceNode::input("b", TensorMeta::from_static(DType::F32, &[4, 5])),
            TraceNode::call("y", "aten.matmul", vec![r("a"), r("b")]),
            TraceNode::output(vec![r("y")]),
        ],
    );
    let err = lower(&trace, standard_table()).unwrap_err();
    match err {
        LowerError::LoweringFailed {
            node_index,
            operator,
            ..
        } => {
            assert_eq!(node_index, 2);
            assert_eq!(operator, "aten.matmul");
        }
        other => panic!("expected LoweringFailed, got {other}"),
    }
}
