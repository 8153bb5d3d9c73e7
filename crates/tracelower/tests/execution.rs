//! Compile-then-execute scenarios against the reference CPU backend.

use std::sync::Arc;

use tracelower::graph::{DType, Device};
use tracelower::ops::{standard_decompositions, standard_table};
use tracelower::runtime::{CallArg, CompileOptions, Executable, ExecuteError, compile};
use tracelower::trace::{ExampleValue, TensorMeta, TraceDim, TraceGraph, TraceNode};
use tracelower::{ArgValue, TensorLiteral};

use tracelower_backend_ref_cpu::CpuBackend;

fn r(name: &str) -> ArgValue {
    ArgValue::Ref(name.to_string())
}

fn sym(name: &str) -> TraceDim {
    TraceDim::Symbolic {
        name: Some(name.to_string()),
    }
}

fn f32s(values: &[f32], dims: &[usize]) -> TensorLiteral {
    TensorLiteral::from_f32(values, dims, Device::Cpu)
}

fn executable(trace: &TraceGraph) -> Executable<CpuBackend> {
    let options =
        CompileOptions::new(standard_table()).with_decompositions(standard_decompositions());
    let lowered = compile(trace, &options).expect("compile trace");
    Executable::new(lowered, Arc::new(CpuBackend::new()))
}

/// A small linear-then-activation model with a dynamic batch dimension,
/// executed twice with different batch sizes.
#[test]
fn dynamic_batch_runs_at_two_sizes() {
    let weight = f32s(&[1.0, 0.0, 0.0, 0.0, 1.0, 0.0], &[2, 3]);
    let trace = TraceGraph::new(
        "model",
        vec![
            TraceNode::input(
                "x",
                TensorMeta::new(DType::F32, vec![sym("batch"), TraceDim::Concrete(2)]),
            ),
            TraceNode::attribute(
                "w",
                "layer.weight",
                Some(ExampleValue::Tensor {
                    ty: weight.ty.clone(),
                    literal: Some(weight),
                }),
            ),
            TraceNode::call("h", "aten.matmul", vec![r("x"), r("w")]),
            TraceNode::call("y", "aten.relu", vec![r("h")]),
            TraceNode::output(vec![r("y")]),
        ],
    );
    let exe = executable(&trace);

    let small = exe
        .call(&[CallArg::Tensor(f32s(&[1.0, 2.0, -3.0, 4.0], &[2, 2]))])
        .expect("batch of 2");
    let out = small[0].as_ref().expect("concrete output");
    assert_eq!(out.ty.shape.static_dims(), Some(vec![2, 3]));
    // w embeds the two columns into three; relu clips the negative entry.
    assert_eq!(
        out.to_f32_vec().expect("f32 payload"),
        vec![1.0, 2.0, 0.0, 0.0, 4.0, 0.0]
    );

    let large = exe
        .call(&[CallArg::Tensor(f32s(&[0.0; 10], &[5, 2]))])
        .expect("batch of 5");
    let out = large[0].as_ref().expect("concrete output");
    assert_eq!(out.ty.shape.static_dims(), Some(vec![5, 3]));
}

#[test]
fn null_outputs_are_reinterleaved() {
    let trace = TraceGraph::new(
        "nulls",
        vec![
            TraceNode::input("x", TensorMeta::from_static(DType::F32, &[3])),
            TraceNode::call("y", "aten.neg", vec![r("x")]),
            TraceNode::output(vec![r("y"), ArgValue::None]),
        ],
    );
    let exe = executable(&trace);
    let results = exe
        .call(&[CallArg::Tensor(f32s(&[1.0, -2.0, 3.0], &[3]))])
        .expect("call");
    assert_eq!(results.len(), 2);
    assert_eq!(
        results[0].as_ref().expect("tensor").to_f32_vec().expect("f32 payload"),
        vec![-1.0, 2.0, -3.0]
    );
    assert!(results[1].is_none());
}

#[test]
fn symbol_conflicts_fail_before_the_backend_runs() {
    let trace = TraceGraph::new(
        "conflict",
        vec![
            TraceNode::input(
                "a",
                TensorMeta::new(DType::F32, vec![sym("n"), TraceDim::Concrete(2)]),
            ),
            TraceNode::input(
                "b",
                TensorMeta::new(DType::F32, vec![sym("n"), TraceDim::Concrete(2)]),
            ),
            TraceNode::call("y", "aten.add", vec![r("a"), r("b")]),
            TraceNode::output(vec![r("y")]),
        ],
    );
    let exe = executable(&trace);
    let err = exe
        .call(&[
            CallArg::Tensor(f32s(&[0.0; 4], &[2, 2])),
            CallArg::Tensor(f32s(&[0.0; 6], &[3, 2])),
        ])
        .unwrap_err();
    assert!(matches!(
        err,
        ExecuteError::SymbolMismatch {
            first: 2,
            second: 3,
            ..
        }
    ));
}

#[test]
fn non_tensor_call_args_are_dropped() {
    // The scalar was specialized into the graph at compile time; at call time
    // it is ignored and only tensor arguments are validated.
    let trace = TraceGraph::new(
        "scalars",
        vec![
            TraceNode::input("x", TensorMeta::from_static(DType::F32, &[2])),
            TraceNode::scalar_input("k", Some(ExampleValue::Float(2.0))),
            TraceNode::call("y", "aten.mul", vec![r("x"), r("k")]),
            TraceNode::output(vec![r("y")]),
        ],
    );
    let exe = executable(&trace);
    let results = exe
        .call(&[
            CallArg::Tensor(f32s(&[3.0, 4.0], &[2])),
            CallArg::Float(2.0),
        ])
        .expect("call");
    assert_eq!(
        results[0].as_ref().expect("tensor").to_f32_vec().expect("f32 payload"),
        vec![6.0, 8.0]
    );
}

#[test]
fn decomposed_linear_matches_manual_result() {
    let weight = f32s(&[1.0, 2.0, 3.0, 4.0], &[2, 2]);
    let bias = f32s(&[10.0, 20.0], &[2]);
    let trace = TraceGraph::new(
        "linear",
        vec![
            TraceNode::input("x", TensorMeta::from_static(DType::F32, &[1, 2])),
            TraceNode::attribute(
                "w",
                "fc.weight",
                Some(ExampleValue::Tensor {
                    ty: weight.ty.clone(),
                    literal: Some(weight),
                }),
            ),
            TraceNode::attribute(
                "b",
                "fc.bias",
                Some(ExampleValue::Tensor {
                    ty: bias.ty.clone(),
                    literal: Some(bias),
                }),
            ),
            TraceNode::call("y", "aten.linear", vec![r("x"), r("w"), r("b")]),
            TraceNode::output(vec![r("y")]),
        ],
    );
    let exe = executable(&trace);
    let results = exe
        .call(&[CallArg::Tensor(f32s(&[1.0, 1.0], &[1, 2]))])
        .expect("call");
    // x @ w.T + b = [1+2, 3+4] + [10, 20]
    assert_eq!(
        results[0].as_ref().expect("tensor").to_f32_vec().expect("f32 payload"),
        vec![13.0, 27.0]
    );
}

#[test]
fn softmax_decomposition_sums_to_one() {
    let trace = TraceGraph::new(
        "softmax",
        vec![
            TraceNode::input("x", TensorMeta::from_static(DType::F32, &[2, 3])),
            TraceNode::call(
                "y",
                "aten.softmax",
                vec![r("x"), ArgValue::Int(-1)],
            ),
            TraceNode::output(vec![r("y")]),
        ],
    );
    let exe = executable(&trace);
    let results = exe
        .call(&[CallArg::Tensor(f32s(
            &[1.0, 2.0, 3.0, 100.0, 100.0, 100.0],
            &[2, 3],
        ))])
        .expect("call");
    let out = results[0].as_ref().expect("tensor").to_f32_vec().expect("f32 payload");
    let first: f32 = out[..3].iter().sum();
    let second: f32 = out[3..].iter().sum();
    assert!((first - 1.0).abs() < 1e-5);
    assert!((second - 1.0).abs() < 1e-5);
    assert!(out[0] < out[1] && out[1] < out[2]);
}

#[test]
fn wrong_dtype_is_rejected_at_call_time() {
    let trace = TraceGraph::new(
        "dtype",
        vec![
            TraceNode::input("x", TensorMeta::from_static(DType::F32, &[2])),
            TraceNode::call("y", "aten.neg", vec![r("x")]),
            TraceNode::output(vec![r("y")]),
        ],
    );
    let exe = executable(&trace);
    let err = exe
        .call(&[CallArg::Tensor(TensorLiteral::scalar_i64(
            7,
            Device::Cpu,
        ))])
        .unwrap_err();
    assert!(matches!(err, ExecuteError::DTypeMismatch { .. }));
}

#[test]
fn tensor_arity_is_checked_first() {
    let trace = TraceGraph::new(
        "arity",
        vec![
            TraceNode::input("x", TensorMeta::from_static(DType::F32, &[2])),
            TraceNode::call("y", "aten.neg", vec![r("x")]),
            TraceNode::output(vec![r("y")]),
        ],
    );
    let exe = executable(&trace);
    let err = exe.call(&[]).unwrap_err();
    assert!(matches!(
        err,
        ExecuteError::TensorArity {
            expected: 1,
            actual: 0
        }
    ));
}
