//! Reference CPU interpreter for lowered graphs.
//!
//! Straightforward dense evaluation: symbolic dimensions are resolved from
//! the actual input shapes before anything runs, then instructions execute in
//! order over a value map. Meant as the correctness baseline, not as a fast
//! backend.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Arc;

use log::trace;

use tracelower::backend::{BackendError, BackendResult, GraphBackend};
use tracelower::graph::{
    BinaryOp, ConcatSpec, DType, DimSymbol, Dimension, Graph, Instruction, Operation, ReduceKind,
    ReduceSpec, ReshapeSpec, Shape, SliceSpec, TensorLiteral, TensorType, TransposeSpec, UnaryOp,
    ValueId,
};

/// Dense host tensor handle.
#[derive(Debug, Clone)]
pub struct CpuTensor {
    pub ty: TensorType,
    pub data: TensorData,
}

#[derive(Debug, Clone)]
pub enum TensorData {
    F32(Arc<[f32]>),
    I64(Arc<[i64]>),
    Bool(Arc<[u8]>),
}

impl TensorData {
    pub fn len(&self) -> usize {
        match self {
            TensorData::F32(values) => values.len(),
            TensorData::I64(values) => values.len(),
            TensorData::Bool(values) => values.len(),
        }
    }
}

impl CpuTensor {
    fn dims(&self) -> BackendResult<Vec<usize>> {
        self.ty
            .shape
            .static_dims()
            .ok_or_else(|| BackendError::shape("cpu tensor carries a symbolic shape"))
    }

    fn as_f32(&self) -> BackendResult<&[f32]> {
        match &self.data {
            TensorData::F32(values) => Ok(values),
            _ => Err(BackendError::dtype(
                self.ty.dtype,
                "expected an f32 tensor",
            )),
        }
    }

    fn as_i64(&self) -> BackendResult<&[i64]> {
        match &self.data {
            TensorData::I64(values) => Ok(values),
            _ => Err(BackendError::dtype(self.ty.dtype, "expected an i64 tensor")),
        }
    }
}

/// The reference backend. Stateless; one instance can serve any number of
/// concurrent executions.
#[derive(Default)]
pub struct CpuBackend;

impl CpuBackend {
    pub fn new() -> Self {
        Self
    }
}

impl GraphBackend for CpuBackend {
    type TensorHandle = CpuTensor;

    fn backend_name(&self) -> &str {
        "ref-cpu"
    }

    fn materialize(&self, literal: &TensorLiteral) -> BackendResult<Self::TensorHandle> {
        literal_to_tensor(literal)
    }

    fn to_literal(&self, tensor: &Self::TensorHandle) -> BackendResult<TensorLiteral> {
        tensor_to_literal(tensor)
    }

    fn run_graph(
        &self,
        graph: &Graph,
        inputs: &[Self::TensorHandle],
    ) -> BackendResult<Vec<Self::TensorHandle>> {
        if inputs.len() != graph.inputs.len() {
            return Err(BackendError::ArityMismatch {
                expected: graph.inputs.len(),
                actual: inputs.len(),
            });
        }

        let symbols = resolve_symbols(graph, inputs)?;
        trace!(
            "running graph '{}' with {} resolved symbols",
            graph.name,
            symbols.len()
        );

        let mut values: HashMap<ValueId, CpuTensor> = HashMap::new();
        for ((id, _), tensor) in graph.inputs.iter().zip(inputs.iter()) {
            values.insert(*id, tensor.clone());
        }

        for instruction in &graph.instructions {
            let mut operands = Vec::with_capacity(instruction.operands.len());
            for operand in &instruction.operands {
                let tensor = values.get(operand).cloned().ok_or_else(|| {
                    BackendError::execution(format!("operand %{} missing", operand.0))
                })?;
                operands.push(tensor);
            }
            let result = execute_instruction(instruction, &operands, &symbols)?;
            values.insert(instruction.id, result);
        }

        let mut results = Vec::with_capacity(graph.outputs.len());
        for id in &graph.outputs {
            let tensor = values
                .get(id)
                .cloned()
                .ok_or_else(|| BackendError::execution(format!("output %{} missing", id.0)))?;
            results.push(tensor);
        }
        Ok(results)
    }
}

/// Binds every symbolic dimension in the declared inputs to the actual extent
/// observed at the same position; conflicting resolutions fail.
fn resolve_symbols(
    graph: &Graph,
    inputs: &[CpuTensor],
) -> BackendResult<BTreeMap<DimSymbol, usize>> {
    let mut symbols: BTreeMap<DimSymbol, usize> = BTreeMap::new();
    for ((_, declared), tensor) in graph.inputs.iter().zip(inputs.iter()) {
        let actual = tensor.dims()?;
        if actual.len() != declared.shape.rank() {
            return Err(BackendError::shape(format!(
                "declared rank {} but input has rank {}",
                declared.shape.rank(),
                actual.len()
            )));
        }
        for (dim, extent) in declared.shape.dims().iter().zip(actual.iter()) {
            match dim {
                Dimension::Static(expected) => {
                    if expected != extent {
                        return Err(BackendError::shape(format!(
                            "declared extent {expected} but input has {extent}"
                        )));
                    }
                }
                Dimension::Dynamic(symbol) => {
                    if let Some(first) = symbols.get(symbol) {
                        if first != extent {
                            return Err(BackendError::symbol_conflict(symbol, *first, *extent));
                        }
                    } else {
                        symbols.insert(symbol.clone(), *extent);
                    }
                }
            }
        }
    }
    Ok(symbols)
}

fn execute_instruction(
    instruction: &Instruction,
    operands: &[CpuTensor],
    symbols: &BTreeMap<DimSymbol, usize>,
) -> BackendResult<CpuTensor> {
    match &instruction.op {
        Operation::Constant(literal) => literal_to_tensor(literal),
        Operation::ElementwiseUnary(op) => op_unary(*op, one(operands)?),
        Operation::ElementwiseBinary(op) => op_binary(*op, two(operands)?),
        Operation::MatMul => op_matmul(two(operands)?),
        Operation::Transpose(spec) => op_transpose(spec, one(operands)?),
        Operation::Reshape(spec) => op_reshape(spec, one(operands)?, symbols),
        Operation::Concat(spec) => op_concat(spec, operands),
        Operation::Reduce(spec) => op_reduce(spec, one(operands)?),
        Operation::Slice(spec) => op_slice(spec, one(operands)?),
        Operation::Cast(_) => op_cast(instruction.output.dtype, one(operands)?),
    }
}

fn one(operands: &[CpuTensor]) -> BackendResult<&CpuTensor> {
    match operands {
        [tensor] => Ok(tensor),
        _ => Err(BackendError::execution("expected exactly one operand")),
    }
}

fn two(operands: &[CpuTensor]) -> BackendResult<(&CpuTensor, &CpuTensor)> {
    match operands {
        [lhs, rhs] => Ok((lhs, rhs)),
        _ => Err(BackendError::execution("expected exactly two operands")),
    }
}

fn literal_to_tensor(literal: &TensorLiteral) -> BackendResult<CpuTensor> {
    let data = match literal.ty.dtype {
        DType::F32 => {
            if literal.bytes.len() % 4 != 0 {
                return Err(BackendError::execution("f32 literal has a ragged payload"));
            }
            TensorData::F32(Arc::from(
                literal
                    .bytes
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect::<Vec<_>>(),
            ))
        }
        DType::I64 => {
            if literal.bytes.len() % 8 != 0 {
                return Err(BackendError::execution("i64 literal has a ragged payload"));
            }
            TensorData::I64(Arc::from(
                literal
                    .bytes
                    .chunks_exact(8)
                    .map(|c| {
                        i64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]])
                    })
                    .collect::<Vec<_>>(),
            ))
        }
        DType::Bool => TensorData::Bool(Arc::from(literal.bytes.to_vec())),
        other => {
            return Err(BackendError::dtype(
                other,
                "not supported by the reference cpu backend",
            ));
        }
    };
    Ok(CpuTensor {
        ty: literal.ty.clone(),
        data,
    })
}

fn tensor_to_literal(tensor: &CpuTensor) -> BackendResult<TensorLiteral> {
    let bytes: Vec<u8> = match &tensor.data {
        TensorData::F32(values) => values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        TensorData::I64(values) => values.iter().flat_map(|v| v.to_le_bytes()).collect(),
        TensorData::Bool(values) => values.to_vec(),
    };
    Ok(TensorLiteral::new(tensor.ty.clone(), Arc::from(bytes)))
}

fn static_type(dtype: DType, dims: &[usize], like: &CpuTensor) -> TensorType {
    TensorType::new(dtype, Shape::from_static(dims), like.ty.device)
}

fn op_unary(op: UnaryOp, input: &CpuTensor) -> BackendResult<CpuTensor> {
    let values = input.as_f32()?;
    let mapped: Vec<f32> = values
        .iter()
        .map(|&v| match op {
            UnaryOp::Abs => v.abs(),
            UnaryOp::Neg => -v,
            UnaryOp::Relu => v.max(0.0),
            UnaryOp::Sigmoid => 1.0 / (1.0 + (-v).exp()),
            UnaryOp::Exp => v.exp(),
            UnaryOp::Log => v.ln(),
            UnaryOp::Sqrt => v.sqrt(),
            UnaryOp::Tanh => v.tanh(),
        })
        .collect();
    Ok(CpuTensor {
        ty: input.ty.clone(),
        data: TensorData::F32(Arc::from(mapped)),
    })
}

fn op_binary(op: BinaryOp, (lhs, rhs): (&CpuTensor, &CpuTensor)) -> BackendResult<CpuTensor> {
    let lhs_dims = lhs.dims()?;
    let rhs_dims = rhs.dims()?;
    let out_dims = broadcast_dims(&lhs_dims, &rhs_dims)?;

    match (&lhs.data, &rhs.data) {
        (TensorData::F32(a), TensorData::F32(b)) => {
            let out = broadcast_eval(a, &lhs_dims, b, &rhs_dims, &out_dims, |x, y| match op {
                BinaryOp::Add => x + y,
                BinaryOp::Sub => x - y,
                BinaryOp::Mul => x * y,
                BinaryOp::Div => x / y,
                BinaryOp::Pow => x.powf(y),
                BinaryOp::Maximum => x.max(y),
                BinaryOp::Minimum => x.min(y),
            });
            Ok(CpuTensor {
                ty: static_type(DType::F32, &out_dims, lhs),
                data: TensorData::F32(Arc::from(out)),
            })
        }
        (TensorData::I64(a), TensorData::I64(b)) => {
            if matches!(op, BinaryOp::Pow) {
                return Err(BackendError::unimplemented("pow", "i64 operands"));
            }
            let out = broadcast_eval(a, &lhs_dims, b, &rhs_dims, &out_dims, |x, y| match op {
                BinaryOp::Add => x + y,
                BinaryOp::Sub => x - y,
                BinaryOp::Mul => x * y,
                BinaryOp::Div => x / y,
                BinaryOp::Maximum => x.max(y),
                BinaryOp::Minimum => x.min(y),
                BinaryOp::Pow => 0,
            });
            Ok(CpuTensor {
                ty: static_type(DType::I64, &out_dims, lhs),
                data: TensorData::I64(Arc::from(out)),
            })
        }
        _ => Err(BackendError::dtype(
            lhs.ty.dtype,
            "binary operands must share a numeric dtype",
        )),
    }
}

fn op_matmul((lhs, rhs): (&CpuTensor, &CpuTensor)) -> BackendResult<CpuTensor> {
    let a = lhs.as_f32()?;
    let b = rhs.as_f32()?;
    let lhs_dims = lhs.dims()?;
    let rhs_dims = rhs.dims()?;

    if rhs_dims.len() == 2 && lhs_dims.len() >= 2 {
        let k = lhs_dims[lhs_dims.len() - 1];
        let (rk, n) = (rhs_dims[0], rhs_dims[1]);
        if k != rk {
            return Err(BackendError::shape(format!(
                "matmul inner extents disagree: {k} vs {rk}"
            )));
        }
        let rows: usize = lhs_dims[..lhs_dims.len() - 1].iter().product();
        let mut out = vec![0.0f32; rows * n];
        for row in 0..rows {
            for col in 0..n {
                let mut acc = 0.0f32;
                for inner in 0..k {
                    acc += a[row * k + inner] * b[inner * n + col];
                }
                out[row * n + col] = acc;
            }
        }
        let mut out_dims = lhs_dims[..lhs_dims.len() - 1].to_vec();
        out_dims.push(n);
        return Ok(CpuTensor {
            ty: static_type(DType::F32, &out_dims, lhs),
            data: TensorData::F32(Arc::from(out)),
        });
    }

    if lhs_dims.len() == 3 && rhs_dims.len() == 3 {
        let (batch, m, k) = (lhs_dims[0], lhs_dims[1], lhs_dims[2]);
        let (rb, rk, n) = (rhs_dims[0], rhs_dims[1], rhs_dims[2]);
        if batch != rb || k != rk {
            return Err(BackendError::shape(format!(
                "batched matmul extents disagree: [{batch},{m},{k}] x [{rb},{rk},{n}]"
            )));
        }
        let mut out = vec![0.0f32; batch * m * n];
        for bi in 0..batch {
            for row in 0..m {
                for col in 0..n {
                    let mut acc = 0.0f32;
                    for inner in 0..k {
                        acc += a[bi * m * k + row * k + inner] * b[bi * k * n + inner * n + col];
                    }
                    out[bi * m * n + row * n + col] = acc;
                }
            }
        }
        return Ok(CpuTensor {
            ty: static_type(DType::F32, &[batch, m, n], lhs),
            data: TensorData::F32(Arc::from(out)),
        });
    }

    Err(BackendError::unimplemented(
        "matmul",
        format!("operand ranks {} x {}", lhs_dims.len(), rhs_dims.len()),
    ))
}

fn op_transpose(spec: &TransposeSpec, input: &CpuTensor) -> BackendResult<CpuTensor> {
    let dims = input.dims()?;
    if spec.perm.len() != dims.len() {
        return Err(BackendError::shape(format!(
            "permutation length {} does not match rank {}",
            spec.perm.len(),
            dims.len()
        )));
    }
    let out_dims: Vec<usize> = spec.perm.iter().map(|&axis| dims[axis]).collect();
    let in_strides = strides_of(&dims);
    let indices = index_space(&out_dims)
        .map(|out_index| {
            let mut flat = 0usize;
            for (pos, &axis) in spec.perm.iter().enumerate() {
                flat += out_index[pos] * in_strides[axis];
            }
            flat
        })
        .collect::<Vec<_>>();
    Ok(CpuTensor {
        ty: static_type(input.ty.dtype, &out_dims, input),
        data: gather(&input.data, &indices),
    })
}

fn op_reshape(
    spec: &ReshapeSpec,
    input: &CpuTensor,
    symbols: &BTreeMap<DimSymbol, usize>,
) -> BackendResult<CpuTensor> {
    let mut out_dims = Vec::with_capacity(spec.new_shape.len());
    for dim in &spec.new_shape {
        match dim {
            Dimension::Static(extent) => out_dims.push(*extent),
            Dimension::Dynamic(symbol) => {
                let extent = symbols.get(symbol).ok_or_else(|| {
                    BackendError::shape(format!("unresolved symbol '{}'", symbol.as_str()))
                })?;
                out_dims.push(*extent);
            }
        }
    }
    let out_count: usize = out_dims.iter().product();
    if out_count != input.data.len() {
        return Err(BackendError::shape(format!(
            "reshape to {out_dims:?} changes element count {} -> {out_count}",
            input.data.len()
        )));
    }
    Ok(CpuTensor {
        ty: static_type(input.ty.dtype, &out_dims, input),
        data: input.data.clone(),
    })
}

fn op_concat(spec: &ConcatSpec, operands: &[CpuTensor]) -> BackendResult<CpuTensor> {
    let first = operands
        .first()
        .ok_or_else(|| BackendError::execution("concat requires at least one operand"))?;
    let first_dims = first.dims()?;
    let axis = spec.axis;
    if axis >= first_dims.len() {
        return Err(BackendError::shape(format!(
            "concat axis {axis} out of range for rank {}",
            first_dims.len()
        )));
    }

    let mut total = 0usize;
    let mut parts = Vec::with_capacity(operands.len());
    for operand in operands {
        let dims = operand.dims()?;
        if dims.len() != first_dims.len() {
            return Err(BackendError::shape("concat operands must share rank"));
        }
        for (index, (&extent, &expected)) in dims.iter().zip(first_dims.iter()).enumerate() {
            if index != axis && extent != expected {
                return Err(BackendError::shape(format!(
                    "concat operands disagree on axis {index}"
                )));
            }
        }
        total += dims[axis];
        parts.push(dims[axis]);
    }

    let outer: usize = first_dims[..axis].iter().product();
    let inner: usize = first_dims[axis + 1..].iter().product();
    let mut out_dims = first_dims.clone();
    out_dims[axis] = total;

    // Gather indices into each operand, interleaved per outer block.
    let mut indices = Vec::with_capacity(outer * total * inner);
    let mut offsets = Vec::with_capacity(operands.len());
    let mut running = 0usize;
    for &part in &parts {
        offsets.push(running);
        running += part;
    }
    let _ = running;
    for outer_index in 0..outer {
        for (operand_index, &part) in parts.iter().enumerate() {
            let base = outer_index * part * inner;
            for local in 0..part * inner {
                indices.push((operand_index, base + local));
            }
        }
    }

    let data = gather_multi(operands, &indices)?;
    Ok(CpuTensor {
        ty: static_type(first.ty.dtype, &out_dims, first),
        data,
    })
}

fn op_reduce(spec: &ReduceSpec, input: &CpuTensor) -> BackendResult<CpuTensor> {
    let values = input.as_f32()?;
    let dims = input.dims()?;
    for &axis in &spec.axes {
        if axis >= dims.len() {
            return Err(BackendError::shape(format!(
                "reduce axis {axis} out of range for rank {}",
                dims.len()
            )));
        }
    }

    let out_dims: Vec<usize> = dims
        .iter()
        .enumerate()
        .filter_map(|(index, &extent)| {
            if spec.axes.contains(&index) {
                spec.keepdims.then_some(1)
            } else {
                Some(extent)
            }
        })
        .collect();
    let out_count: usize = out_dims.iter().product::<usize>().max(1);
    let init = match spec.kind {
        ReduceKind::Sum | ReduceKind::Mean => 0.0f32,
        ReduceKind::Max => f32::NEG_INFINITY,
    };
    let mut out = vec![init; out_count];
    let out_strides = strides_of(&out_dims);

    for (flat, index) in index_space(&dims).enumerate() {
        let mut out_flat = 0usize;
        let mut out_axis = 0usize;
        for (axis, &pos) in index.iter().enumerate() {
            if spec.axes.contains(&axis) {
                if spec.keepdims {
                    out_axis += 1;
                }
                continue;
            }
            out_flat += pos * out_strides[out_axis];
            out_axis += 1;
        }
        let value = values[flat];
        match spec.kind {
            ReduceKind::Sum | ReduceKind::Mean => out[out_flat] += value,
            ReduceKind::Max => {
                if value > out[out_flat] {
                    out[out_flat] = value;
                }
            }
        }
    }

    if spec.kind == ReduceKind::Mean {
        let reduced: usize = spec
            .axes
            .iter()
            .map(|&axis| dims[axis])
            .product::<usize>()
            .max(1);
        for value in &mut out {
            *value /= reduced as f32;
        }
    }

    Ok(CpuTensor {
        ty: static_type(DType::F32, &out_dims, input),
        data: TensorData::F32(Arc::from(out)),
    })
}

fn op_slice(spec: &SliceSpec, input: &CpuTensor) -> BackendResult<CpuTensor> {
    let dims = input.dims()?;
    if spec.axis >= dims.len() {
        return Err(BackendError::shape(format!(
            "slice axis {} out of range for rank {}",
            spec.axis,
            dims.len()
        )));
    }
    let extent = dims[spec.axis];
    let stop = spec.stop.unwrap_or(extent).min(extent);
    let start = spec.start.min(stop);
    let taken: Vec<usize> = (start..stop).step_by(spec.step.max(1)).collect();

    let outer: usize = dims[..spec.axis].iter().product();
    let inner: usize = dims[spec.axis + 1..].iter().product();
    let mut indices = Vec::with_capacity(outer * taken.len() * inner);
    for outer_index in 0..outer {
        for &pos in &taken {
            let base = (outer_index * extent + pos) * inner;
            for offset in 0..inner {
                indices.push(base + offset);
            }
        }
    }

    let mut out_dims = dims.clone();
    out_dims[spec.axis] = taken.len();
    Ok(CpuTensor {
        ty: static_type(input.ty.dtype, &out_dims, input),
        data: gather(&input.data, &indices),
    })
}

fn op_cast(target: DType, input: &CpuTensor) -> BackendResult<CpuTensor> {
    let dims = input.dims()?;
    let data = match (&input.data, target) {
        (TensorData::F32(values), DType::I64) => {
            TensorData::I64(Arc::from(values.iter().map(|&v| v as i64).collect::<Vec<_>>()))
        }
        (TensorData::I64(values), DType::F32) => {
            TensorData::F32(Arc::from(values.iter().map(|&v| v as f32).collect::<Vec<_>>()))
        }
        (TensorData::Bool(values), DType::F32) => TensorData::F32(Arc::from(
            values
                .iter()
                .map(|&v| if v != 0 { 1.0f32 } else { 0.0 })
                .collect::<Vec<_>>(),
        )),
        (TensorData::Bool(values), DType::I64) => TensorData::I64(Arc::from(
            values
                .iter()
                .map(|&v| i64::from(v != 0))
                .collect::<Vec<_>>(),
        )),
        (TensorData::F32(values), DType::Bool) => TensorData::Bool(Arc::from(
            values
                .iter()
                .map(|&v| u8::from(v != 0.0))
                .collect::<Vec<_>>(),
        )),
        (TensorData::I64(values), DType::Bool) => TensorData::Bool(Arc::from(
            values.iter().map(|&v| u8::from(v != 0)).collect::<Vec<_>>(),
        )),
        (data, target) if dtype_of(data) == target => data.clone(),
        (_, target) => {
            return Err(BackendError::dtype(
                target,
                "cast not supported by the reference cpu backend",
            ));
        }
    };
    Ok(CpuTensor {
        ty: static_type(target, &dims, input),
        data,
    })
}

fn dtype_of(data: &TensorData) -> DType {
    match data {
        TensorData::F32(_) => DType::F32,
        TensorData::I64(_) => DType::I64,
        TensorData::Bool(_) => DType::Bool,
    }
}

fn strides_of(dims: &[usize]) -> Vec<usize> {
    let mut strides = vec![1usize; dims.len()];
    for axis in (0..dims.len().saturating_sub(1)).rev() {
        strides[axis] = strides[axis + 1] * dims[axis + 1];
    }
    strides
}

/// Iterates every multi-index of a dense row-major layout.
fn index_space(dims: &[usize]) -> impl Iterator<Item = Vec<usize>> + '_ {
    let count: usize = dims.iter().product::<usize>();
    let strides = strides_of(dims);
    (0..count).map(move |flat| {
        dims.iter()
            .zip(&strides)
            .map(|(&extent, &stride)| (flat / stride) % extent.max(1))
            .collect()
    })
}

fn broadcast_dims(lhs: &[usize], rhs: &[usize]) -> BackendResult<Vec<usize>> {
    let rank = lhs.len().max(rhs.len());
    let mut out = Vec::with_capacity(rank);
    for offset in (1..=rank).rev() {
        let left = lhs.len().checked_sub(offset).map(|i| lhs[i]);
        let right = rhs.len().checked_sub(offset).map(|i| rhs[i]);
        let extent = match (left, right) {
            (Some(a), None) | (None, Some(a)) => a,
            (Some(1), Some(b)) => b,
            (Some(a), Some(1)) => a,
            (Some(a), Some(b)) if a == b => a,
            (Some(a), Some(b)) => {
                return Err(BackendError::shape(format!(
                    "cannot broadcast extents {a} and {b}"
                )));
            }
            (None, None) => 0,
        };
        out.push(extent);
    }
    Ok(out)
}

fn broadcast_eval<T: Copy, F: Fn(T, T) -> T>(
    lhs: &[T],
    lhs_dims: &[usize],
    rhs: &[T],
    rhs_dims: &[usize],
    out_dims: &[usize],
    op: F,
) -> Vec<T> {
    let lhs_strides = strides_of(lhs_dims);
    let rhs_strides = strides_of(rhs_dims);
    index_space(out_dims)
        .map(|index| {
            let a = lhs[broadcast_flat(&index, lhs_dims, &lhs_strides)];
            let b = rhs[broadcast_flat(&index, rhs_dims, &rhs_strides)];
            op(a, b)
        })
        .collect()
}

fn broadcast_flat(out_index: &[usize], dims: &[usize], strides: &[usize]) -> usize {
    let offset = out_index.len() - dims.len();
    let mut flat = 0usize;
    for (axis, &extent) in dims.iter().enumerate() {
        let pos = if extent == 1 { 0 } else { out_index[offset + axis] };
        flat += pos * strides[axis];
    }
    flat
}

fn gather(data: &TensorData, indices: &[usize]) -> TensorData {
    match data {
        TensorData::F32(values) => TensorData::F32(Arc::from(
            indices.iter().map(|&i| values[i]).collect::<Vec<_>>(),
        )),
        TensorData::I64(values) => TensorData::I64(Arc::from(
            indices.iter().map(|&i| values[i]).collect::<Vec<_>>(),
        )),
        TensorData::Bool(values) => TensorData::Bool(Arc::from(
            indices.iter().map(|&i| values[i]).collect::<Vec<_>>(),
        )),
    }
}

/// Gather across several source tensors; all must share the dtype.
fn gather_multi(operands: &[CpuTensor], indices: &[(usize, usize)]) -> BackendResult<TensorData> {
    match &operands[0].data {
        TensorData::F32(_) => {
            let slices = operands
                .iter()
                .map(|operand| operand.as_f32())
                .collect::<BackendResult<Vec<_>>>()?;
            Ok(TensorData::F32(Arc::from(
                indices
                    .iter()
                    .map(|&(part, index)| slices[part][index])
                    .collect::<Vec<_>>(),
            )))
        }
        TensorData::I64(_) => {
            let slices = operands
                .iter()
                .map(|operand| operand.as_i64())
                .collect::<BackendResult<Vec<_>>>()?;
            Ok(TensorData::I64(Arc::from(
                indices
                    .iter()
                    .map(|&(part, index)| slices[part][index])
                    .collect::<Vec<_>>(),
            )))
        }
        TensorData::Bool(_) => Err(BackendError::dtype(
            DType::Bool,
            "concat of bool tensors is not supported",
        )),
    }
}
