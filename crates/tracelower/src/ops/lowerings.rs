//! Stock lowering entries for the common operator families.
//!
//! Each entry follows the uniform capability signature the engine dispatches
//! to; errors raised here are wrapped as `LoweringFailed` with the call's
//! argument snapshot.

use anyhow::{Context, Result, bail};

use crate::graph::{
    BinaryOp, CastSpec, ConcatSpec, Dimension, Operation, ReduceKind, ReduceSpec, ReshapeSpec,
    Shape, SliceSpec, TensorLiteral, TensorType, TransposeSpec, UnaryOp,
};
use crate::lower::table::{CallArgs, LowerScope};
use crate::lower::value::{TensorValue, Value};

use super::shape::{
    broadcast_shapes, concat_type, matmul_type, normalize_axis, permute_shape, reduce_shape,
    slice_extent,
};

/// Identity-ish family: clone/detach/contiguous/alias return the input value.
pub fn identity(_scope: &mut LowerScope<'_>, call: &CallArgs) -> Result<Value> {
    Ok(call.arg(0)?.clone())
}

pub fn unary(op: UnaryOp) -> impl Fn(&mut LowerScope<'_>, &CallArgs) -> Result<Value> {
    move |scope, call| {
        let input = call.tensor(0)?.clone();
        let out = scope.emit(
            Operation::ElementwiseUnary(op),
            vec![input.id],
            input.ty.clone(),
        )?;
        Ok(Value::Tensor(out))
    }
}

/// Binary family without the `alpha` keyword.
pub fn binary(op: BinaryOp) -> impl Fn(&mut LowerScope<'_>, &CallArgs) -> Result<Value> {
    move |scope, call| {
        let lhs = promote_operand(scope, call.arg(0)?)?;
        let rhs = promote_to(scope, call.arg(1)?, &lhs.ty)?;
        emit_binary(scope, op, &lhs, &rhs)
    }
}

/// add/sub carry an `alpha` scaling factor applied to the second operand.
pub fn binary_with_alpha(op: BinaryOp) -> impl Fn(&mut LowerScope<'_>, &CallArgs) -> Result<Value> {
    move |scope, call| {
        let lhs = promote_operand(scope, call.arg(0)?)?;
        let mut rhs = promote_to(scope, call.arg(1)?, &lhs.ty)?;
        let alpha = call.float_or(2, "alpha", 1.0)?;
        if alpha != 1.0 {
            let scale = scalar_constant(scope, alpha, &rhs.ty)?;
            rhs = must_tensor(emit_binary(scope, BinaryOp::Mul, &rhs, &scale)?);
        }
        emit_binary(scope, op, &lhs, &rhs)
    }
}

pub fn matmul(scope: &mut LowerScope<'_>, call: &CallArgs) -> Result<Value> {
    let lhs = call.tensor(0)?.clone();
    let rhs = call.tensor(1)?.clone();
    let ty = matmul_type(&lhs.ty, &rhs.ty)?;
    let out = scope.emit(Operation::MatMul, vec![lhs.id, rhs.id], ty)?;
    Ok(Value::Tensor(out))
}

/// `aten.t`: swaps the two axes of a matrix; rank 0/1 inputs pass through.
pub fn t(scope: &mut LowerScope<'_>, call: &CallArgs) -> Result<Value> {
    let input = call.tensor(0)?.clone();
    match input.ty.shape.rank() {
        0 | 1 => Ok(Value::Tensor(input)),
        2 => emit_permute(scope, &input, &[1, 0]),
        rank => bail!("aten.t expects rank <= 2, got {rank}"),
    }
}

pub fn transpose(scope: &mut LowerScope<'_>, call: &CallArgs) -> Result<Value> {
    let input = call.tensor(0)?.clone();
    let rank = input.ty.shape.rank();
    let dim0 = normalize_axis(call.int(1)?, rank)?;
    let dim1 = normalize_axis(call.int(2)?, rank)?;
    let mut perm: Vec<usize> = (0..rank).collect();
    perm.swap(dim0, dim1);
    emit_permute(scope, &input, &perm)
}

pub fn permute(scope: &mut LowerScope<'_>, call: &CallArgs) -> Result<Value> {
    let input = call.tensor(0)?.clone();
    let rank = input.ty.shape.rank();
    let perm = call
        .elements(1)?
        .iter()
        .map(|value| {
            value
                .as_int()
                .context("permutation entries must be ints")
                .and_then(|axis| normalize_axis(axis, rank))
        })
        .collect::<Result<Vec<_>>>()?;
    emit_permute(scope, &input, &perm)
}

/// reshape/view: extents may be ints, bound symbolic dims, or a single `-1`
/// inferred from the remaining extents.
pub fn reshape(scope: &mut LowerScope<'_>, call: &CallArgs) -> Result<Value> {
    let input = call.tensor(0)?.clone();
    let requested = call.elements(1)?;
    let mut dims = Vec::with_capacity(requested.len());
    let mut infer_at = None;
    for (index, value) in requested.iter().enumerate() {
        if value.as_int() == Some(-1) {
            if infer_at.is_some() {
                bail!("reshape accepts at most one inferred (-1) extent");
            }
            infer_at = Some(index);
            dims.push(Dimension::Static(0));
            continue;
        }
        let dim = value
            .as_dimension()
            .with_context(|| format!("reshape extent must be an int or dim, got {value}"))?;
        dims.push(dim);
    }

    if let Some(index) = infer_at {
        let total = input
            .ty
            .shape
            .element_count()
            .context("cannot infer a -1 extent from a symbolic input shape")?;
        let mut known = 1usize;
        for (other_index, dim) in dims.iter().enumerate() {
            if other_index == index {
                continue;
            }
            match dim {
                Dimension::Static(extent) => known *= extent,
                Dimension::Dynamic(_) => {
                    bail!("cannot combine -1 with symbolic extents in one reshape")
                }
            }
        }
        if known == 0 || total % known != 0 {
            bail!("reshape cannot infer extent: {total} elements, known product {known}");
        }
        dims[index] = Dimension::Static(total / known);
    }

    let ty = TensorType::new(input.ty.dtype, Shape::new(dims.clone()), input.ty.device);
    let out = scope.emit(
        Operation::Reshape(ReshapeSpec { new_shape: dims }),
        vec![input.id],
        ty,
    )?;
    Ok(Value::Tensor(out))
}

pub fn cat(scope: &mut LowerScope<'_>, call: &CallArgs) -> Result<Value> {
    let elements = call.elements(0)?;
    let tensors = elements
        .iter()
        .map(|value| {
            value
                .as_tensor()
                .with_context(|| format!("cat operands must be tensors, got {}", value.kind_name()))
        })
        .collect::<Result<Vec<_>>>()?;
    let rank = tensors
        .first()
        .context("cat requires at least one tensor")?
        .ty
        .shape
        .rank();
    let axis = normalize_axis(call.int_or(1, "dim", 0)?, rank)?;
    let types = tensors.iter().map(|tensor| &tensor.ty).collect::<Vec<_>>();
    let ty = concat_type(&types, axis)?;
    let operands = tensors.iter().map(|tensor| tensor.id).collect();
    let out = scope.emit(Operation::Concat(ConcatSpec { axis }), operands, ty)?;
    Ok(Value::Tensor(out))
}

pub fn reduce(kind: ReduceKind) -> impl Fn(&mut LowerScope<'_>, &CallArgs) -> Result<Value> {
    move |scope, call| {
        let input = call.tensor(0)?.clone();
        let rank = input.ty.shape.rank();
        let mut axes = match call.arg_or_kwarg(1, "dim") {
            None => (0..rank).collect::<Vec<_>>(),
            Some(Value::Int(axis)) => vec![normalize_axis(*axis, rank)?],
            Some(Value::Seq(elements)) | Some(Value::Tuple(elements)) => elements
                .iter()
                .map(|value| {
                    value
                        .as_int()
                        .context("reduction axes must be ints")
                        .and_then(|axis| normalize_axis(axis, rank))
                })
                .collect::<Result<Vec<_>>>()?,
            Some(other) => bail!("reduction dims must be an int or sequence, got {other}"),
        };
        axes.sort_unstable();
        axes.dedup();
        let keepdims = call.bool_or(2, "keepdim", false)?;
        let shape = reduce_shape(&input.ty.shape, &axes, keepdims);
        let ty = TensorType::new(input.ty.dtype, shape, input.ty.device);
        let out = scope.emit(
            Operation::Reduce(ReduceSpec {
                kind,
                axes,
                keepdims,
            }),
            vec![input.id],
            ty,
        )?;
        Ok(Value::Tensor(out))
    }
}

/// `aten.slice`: (self, dim, start, end, step). `end` of i64::MAX means "to
/// the end", matching what tracers record for an open bound.
pub fn slice(scope: &mut LowerScope<'_>, call: &CallArgs) -> Result<Value> {
    let input = call.tensor(0)?.clone();
    let rank = input.ty.shape.rank();
    let axis = normalize_axis(call.int_or(1, "dim", 0)?, rank)?;
    let step_raw = call.int_or(4, "step", 1)?;
    if step_raw < 1 {
        bail!("slice step must be positive, got {step_raw}");
    }
    let step = step_raw as usize;
    let start_raw = call.int_or(2, "start", 0)?;
    let stop_raw = call.arg_or_kwarg(3, "end").map(|value| {
        value
            .as_int()
            .context("slice end must be an int")
    });
    let stop_raw = match stop_raw {
        Some(result) => Some(result?),
        None => None,
    };

    match input.ty.shape.dims()[axis].clone() {
        Dimension::Static(extent) => {
            let start = resolve_bound(start_raw, extent)?;
            let stop = match stop_raw {
                None | Some(i64::MAX) => None,
                Some(bound) => Some(resolve_bound(bound, extent)?.min(extent)),
            };
            let out_extent = slice_extent(extent, start, stop, step);
            let mut dims = input.ty.shape.dims().to_vec();
            dims[axis] = Dimension::Static(out_extent);
            let ty = TensorType::new(input.ty.dtype, Shape::new(dims), input.ty.device);
            let out = scope.emit(
                Operation::Slice(SliceSpec {
                    axis,
                    start,
                    stop,
                    step,
                }),
                vec![input.id],
                ty,
            )?;
            Ok(Value::Tensor(out))
        }
        Dimension::Dynamic(_) => {
            // Slicing a symbolic axis is only representable when it is the
            // whole-axis identity.
            let trivial = start_raw == 0
                && step == 1
                && matches!(stop_raw, None | Some(i64::MAX));
            if !trivial {
                bail!("cannot slice a symbolic dimension with concrete bounds");
            }
            Ok(Value::Tensor(input))
        }
    }
}

/// `aten.split`: even chunks along one axis, returned as a tuple.
pub fn split(scope: &mut LowerScope<'_>, call: &CallArgs) -> Result<Value> {
    let input = call.tensor(0)?.clone();
    let rank = input.ty.shape.rank();
    let size = call.int(1)?;
    if size < 1 {
        bail!("split size must be positive, got {size}");
    }
    let size = size as usize;
    let axis = normalize_axis(call.int_or(2, "dim", 0)?, rank)?;
    let extent = input.ty.shape.dims()[axis]
        .as_static()
        .context("split requires a static extent along the split axis")?;

    let mut chunks = Vec::new();
    let mut start = 0usize;
    while start < extent {
        let stop = (start + size).min(extent);
        let mut dims = input.ty.shape.dims().to_vec();
        dims[axis] = Dimension::Static(stop - start);
        let ty = TensorType::new(input.ty.dtype, Shape::new(dims), input.ty.device);
        let out = scope.emit(
            Operation::Slice(SliceSpec {
                axis,
                start,
                stop: Some(stop),
                step: 1,
            }),
            vec![input.id],
            ty,
        )?;
        chunks.push(Value::Tensor(out));
        start = stop;
    }
    Ok(Value::Tuple(chunks))
}

/// `aten.to`: dtype casts lower to `Cast`; device moves are identity here.
pub fn to(scope: &mut LowerScope<'_>, call: &CallArgs) -> Result<Value> {
    let input = call.tensor(0)?.clone();
    let target = call
        .opt_arg(1)
        .or_else(|| call.kwarg("dtype"))
        .or_else(|| call.kwarg("device"));
    match target {
        Some(Value::DType(dtype)) => {
            if *dtype == input.ty.dtype {
                return Ok(Value::Tensor(input));
            }
            let ty = TensorType::new(*dtype, input.ty.shape.clone(), input.ty.device);
            let out = scope.emit(
                Operation::Cast(CastSpec { dtype: *dtype }),
                vec![input.id],
                ty,
            )?;
            Ok(Value::Tensor(out))
        }
        Some(Value::Device(_)) | None => Ok(Value::Tensor(input)),
        Some(other) => bail!("aten.to expects a dtype or device, got {}", other.kind_name()),
    }
}

/// `operator.getitem`: indexes a tuple or sequence value; no emission.
pub fn getitem(_scope: &mut LowerScope<'_>, call: &CallArgs) -> Result<Value> {
    let elements = call.elements(0)?;
    let index = call.int(1)?;
    let len = elements.len() as i64;
    let resolved = if index < 0 { index + len } else { index };
    if resolved < 0 || resolved >= len {
        bail!("getitem index {index} out of range for length {len}");
    }
    Ok(elements[resolved as usize].clone())
}

/// `aten.sym_size`: reads one dimension of a tensor as a usable value.
pub fn sym_size(_scope: &mut LowerScope<'_>, call: &CallArgs) -> Result<Value> {
    let input = call.tensor(0)?;
    let rank = input.ty.shape.rank();
    let axis = normalize_axis(call.int_or(1, "dim", 0)?, rank)?;
    Ok(Value::Dim(input.ty.shape.dims()[axis].clone()))
}

fn resolve_bound(bound: i64, extent: usize) -> Result<usize> {
    let extent_i = extent as i64;
    let resolved = if bound < 0 { bound + extent_i } else { bound };
    if resolved < 0 {
        bail!("slice bound {bound} out of range for extent {extent}");
    }
    Ok(resolved as usize)
}

fn emit_permute(scope: &mut LowerScope<'_>, input: &TensorValue, perm: &[usize]) -> Result<Value> {
    let shape = permute_shape(&input.ty.shape, perm)?;
    let ty = TensorType::new(input.ty.dtype, shape, input.ty.device);
    let out = scope.emit(
        Operation::Transpose(TransposeSpec {
            perm: perm.to_vec(),
        }),
        vec![input.id],
        ty,
    )?;
    Ok(Value::Tensor(out))
}

fn emit_binary(
    scope: &mut LowerScope<'_>,
    op: BinaryOp,
    lhs: &TensorValue,
    rhs: &TensorValue,
) -> Result<Value> {
    let shape = broadcast_shapes(&lhs.ty.shape, &rhs.ty.shape)?;
    let ty = TensorType::new(lhs.ty.dtype, shape, lhs.ty.device);
    let out = scope.emit(Operation::ElementwiseBinary(op), vec![lhs.id, rhs.id], ty)?;
    Ok(Value::Tensor(out))
}

/// First operand of a binary op: a tensor, or a scalar promoted to a rank-0
/// f32 constant.
fn promote_operand(scope: &mut LowerScope<'_>, value: &Value) -> Result<TensorValue> {
    match value {
        Value::Tensor(tensor) => Ok(tensor.clone()),
        Value::Int(_) | Value::Float(_) | Value::Dim(Dimension::Static(_)) => {
            let ty = TensorType::new(
                crate::graph::DType::F32,
                Shape::scalar(),
                crate::graph::Device::Cpu,
            );
            promote_to(scope, value, &ty)
        }
        other => bail!("operand must be a tensor or scalar, got {}", other.kind_name()),
    }
}

/// Promotes a scalar operand to a rank-0 constant of the reference dtype.
fn promote_to(scope: &mut LowerScope<'_>, value: &Value, like: &TensorType) -> Result<TensorValue> {
    if let Value::Tensor(tensor) = value {
        return Ok(tensor.clone());
    }
    let scalar = value
        .as_float()
        .with_context(|| format!("operand must be a tensor or scalar, got {}", value.kind_name()))?;
    let ty = TensorType::new(like.dtype, Shape::scalar(), like.device);
    scalar_literal(scalar, &ty).and_then(|literal| scope.constant(literal))
}

fn scalar_constant(
    scope: &mut LowerScope<'_>,
    value: f64,
    like: &TensorType,
) -> Result<TensorValue> {
    let ty = TensorType::new(like.dtype, Shape::scalar(), like.device);
    scalar_literal(value, &ty).and_then(|literal| scope.constant(literal))
}

fn scalar_literal(value: f64, ty: &TensorType) -> Result<TensorLiteral> {
    match ty.dtype {
        crate::graph::DType::F32 => Ok(TensorLiteral::scalar_f32(value as f32, ty.device)),
        crate::graph::DType::I64 => {
            if value.fract() != 0.0 {
                bail!("cannot promote non-integral scalar {value} to an i64 tensor");
            }
            Ok(TensorLiteral::scalar_i64(value as i64, ty.device))
        }
        other => bail!("scalar promotion to dtype {other:?} is not supported"),
    }
}

fn must_tensor(value: Value) -> TensorValue {
    match value {
        Value::Tensor(tensor) => tensor,
        // emit_binary only ever returns tensors.
        _ => unreachable!("binary emission produced a non-tensor"),
    }
}
