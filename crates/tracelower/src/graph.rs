//! Target graph representation produced by the lowering engine.
//!
//! A [`Graph`] is an immutable, topologically ordered list of SSA
//! [`Instruction`]s over declared tensor inputs. Graphs are built exclusively
//! through [`GraphBuilder`], which owns the construction scope: `finish()`
//! consumes the builder exactly once, and dropping an unfinished builder
//! releases the scope on abort paths.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize, ser::SerializeStruct};
use thiserror::Error;

/// Scalar element types supported by the target graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DType {
    F32,
    F64,
    I32,
    I64,
    Bool,
}

impl DType {
    pub fn is_float(self) -> bool {
        matches!(self, DType::F32 | DType::F64)
    }

    pub fn is_integer(self) -> bool {
        matches!(self, DType::I32 | DType::I64)
    }

    /// Storage size of one element in bytes.
    pub fn size_in_bytes(self) -> usize {
        match self {
            DType::Bool => 1,
            DType::I32 | DType::F32 => 4,
            DType::I64 | DType::F64 => 8,
        }
    }
}

/// Names a symbolic dynamic dimension (e.g. `?batch`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DimSymbol(Arc<str>);

impl DimSymbol {
    pub fn new(name: impl Into<String>) -> Self {
        Self(Arc::<str>::from(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Serialize for DimSymbol {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for DimSymbol {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let name = String::deserialize(deserializer)?;
        Ok(DimSymbol::new(name))
    }
}

/// A single axis extent, either fixed at compile time or symbolic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dimension {
    Static(usize),
    Dynamic(DimSymbol),
}

impl Dimension {
    pub fn as_static(&self) -> Option<usize> {
        match self {
            Dimension::Static(value) => Some(*value),
            Dimension::Dynamic(_) => None,
        }
    }
}

/// Logical tensor shape as an ordered list of dimensions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shape {
    dims: Vec<Dimension>,
}

impl Shape {
    pub fn new(dims: impl Into<Vec<Dimension>>) -> Self {
        Self { dims: dims.into() }
    }

    /// Shape with every dimension static.
    pub fn from_static(dims: &[usize]) -> Self {
        Self {
            dims: dims.iter().map(|&d| Dimension::Static(d)).collect(),
        }
    }

    pub fn scalar() -> Self {
        Self { dims: Vec::new() }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn dims(&self) -> &[Dimension] {
        &self.dims
    }

    pub fn into_dims(self) -> Vec<Dimension> {
        self.dims
    }

    /// Returns static extents when no dimension is symbolic.
    pub fn static_dims(&self) -> Option<Vec<usize>> {
        let mut dims = Vec::with_capacity(self.dims.len());
        for dim in &self.dims {
            dims.push(dim.as_static()?);
        }
        Some(dims)
    }

    /// Element count when the shape is fully static.
    pub fn element_count(&self) -> Option<usize> {
        let dims = self.static_dims()?;
        let mut count = 1usize;
        for dim in dims {
            count = count.checked_mul(dim)?;
        }
        Some(count)
    }

    /// True when any dimension is symbolic.
    pub fn has_dynamic(&self) -> bool {
        self.dims
            .iter()
            .any(|dim| matches!(dim, Dimension::Dynamic(_)))
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.dims.is_empty() {
            return f.write_str("[]");
        }
        let dims = self
            .dims
            .iter()
            .map(|dim| match dim {
                Dimension::Static(v) => v.to_string(),
                Dimension::Dynamic(sym) => format!("?{}", sym.as_str()),
            })
            .collect::<Vec<_>>();
        f.write_str(&dims.join("x"))
    }
}

/// Placement tag carried on tensor types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Device {
    #[default]
    Cpu,
    Accelerator(usize),
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => f.write_str("cpu"),
            Device::Accelerator(index) => write!(f, "accel:{index}"),
        }
    }
}

/// Tensor metadata coupling dtype, shape and placement.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorType {
    pub dtype: DType,
    pub shape: Shape,
    pub device: Device,
}

impl TensorType {
    pub fn new(dtype: DType, shape: Shape, device: Device) -> Self {
        Self {
            dtype,
            shape,
            device,
        }
    }

    /// Total byte length when the shape is fully static.
    pub fn byte_len(&self) -> Option<usize> {
        let elem_count = self.shape.element_count()?;
        elem_count.checked_mul(self.dtype.size_in_bytes())
    }
}

impl fmt::Display for TensorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tensor<{:?} x {} @ {}>", self.dtype, self.shape, self.device)
    }
}

/// Dense host literal payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorLiteral {
    pub ty: TensorType,
    pub bytes: Arc<[u8]>,
}

impl TensorLiteral {
    pub fn new(ty: TensorType, bytes: Arc<[u8]>) -> Self {
        Self { ty, bytes }
    }

    /// Rank-0 f32 literal.
    pub fn scalar_f32(value: f32, device: Device) -> Self {
        Self {
            ty: TensorType::new(DType::F32, Shape::scalar(), device),
            bytes: Arc::<[u8]>::from(value.to_le_bytes().to_vec()),
        }
    }

    /// Rank-0 i64 literal.
    pub fn scalar_i64(value: i64, device: Device) -> Self {
        Self {
            ty: TensorType::new(DType::I64, Shape::scalar(), device),
            bytes: Arc::<[u8]>::from(value.to_le_bytes().to_vec()),
        }
    }

    /// Dense f32 literal of the given static shape.
    pub fn from_f32(values: &[f32], dims: &[usize], device: Device) -> Self {
        let mut bytes = Vec::with_capacity(values.len() * 4);
        for value in values {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        Self {
            ty: TensorType::new(DType::F32, Shape::from_static(dims), device),
            bytes: Arc::<[u8]>::from(bytes),
        }
    }

    pub fn byte_len(&self) -> usize {
        self.bytes.len()
    }

    /// Reads the payload back as f32 values.
    pub fn to_f32_vec(&self) -> Option<Vec<f32>> {
        if self.ty.dtype != DType::F32 || self.bytes.len() % 4 != 0 {
            return None;
        }
        Some(
            self.bytes
                .chunks_exact(4)
                .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                .collect(),
        )
    }
}

impl Serialize for TensorLiteral {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        let mut state = serializer.serialize_struct("TensorLiteral", 2)?;
        state.serialize_field("ty", &self.ty)?;
        state.serialize_field("bytes", &self.bytes.as_ref())?;
        state.end()
    }
}

impl<'de> Deserialize<'de> for TensorLiteral {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        struct TensorLiteralHelper {
            ty: TensorType,
            bytes: Vec<u8>,
        }

        let helper = TensorLiteralHelper::deserialize(deserializer)?;
        Ok(TensorLiteral {
            ty: helper.ty,
            bytes: Arc::<[u8]>::from(helper.bytes),
        })
    }
}

/// Elementwise unary ops understood by the target graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UnaryOp {
    Abs,
    Neg,
    Relu,
    Sigmoid,
    Exp,
    Log,
    Sqrt,
    Tanh,
}

/// Elementwise binary ops with implicit trailing-aligned broadcasting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Maximum,
    Minimum,
}

/// Reduction families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReduceKind {
    Sum,
    Mean,
    Max,
}

/// Attribute payload for `Transpose`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransposeSpec {
    pub perm: Vec<usize>,
}

/// Attribute payload for `Reshape`; symbolic extents are resolved at run time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReshapeSpec {
    pub new_shape: Vec<Dimension>,
}

/// Attribute payload for `Concat`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcatSpec {
    pub axis: usize,
}

/// Attribute payload for `Reduce`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReduceSpec {
    pub kind: ReduceKind,
    pub axes: Vec<usize>,
    pub keepdims: bool,
}

/// Attribute payload for `Slice`: one axis, half-open, `stop = None` runs to
/// the end of the axis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SliceSpec {
    pub axis: usize,
    pub start: usize,
    pub stop: Option<usize>,
    pub step: usize,
}

/// Attribute payload for `Cast`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CastSpec {
    pub dtype: DType,
}

/// Declarative form of target graph operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    Constant(TensorLiteral),
    ElementwiseUnary(UnaryOp),
    ElementwiseBinary(BinaryOp),
    MatMul,
    Transpose(TransposeSpec),
    Reshape(ReshapeSpec),
    Concat(ConcatSpec),
    Reduce(ReduceSpec),
    Slice(SliceSpec),
    Cast(CastSpec),
}

impl Operation {
    /// Short label used by the text rendering and error messages.
    pub fn label(&self) -> &'static str {
        match self {
            Operation::Constant(_) => "constant",
            Operation::ElementwiseUnary(_) => "elementwise_unary",
            Operation::ElementwiseBinary(_) => "elementwise_binary",
            Operation::MatMul => "matmul",
            Operation::Transpose(_) => "transpose",
            Operation::Reshape(_) => "reshape",
            Operation::Concat(_) => "concat",
            Operation::Reduce(_) => "reduce",
            Operation::Slice(_) => "slice",
            Operation::Cast(_) => "cast",
        }
    }
}

/// Unique identifier for SSA values in a target graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValueId(pub u32);

/// Single SSA instruction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    pub id: ValueId,
    pub op: Operation,
    pub operands: Vec<ValueId>,
    pub output: TensorType,
}

/// Structural violations raised by [`GraphBuilder`].
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("operand %{} is not defined in this graph", (.id).0)]
    UnknownValue { id: ValueId },
    #[error("output %{} is not defined in this graph", (.id).0)]
    UnknownOutput { id: ValueId },
    #[error("graph must declare at least one output")]
    NoOutputs,
}

/// Immutable compiled graph: declared inputs, instruction body, outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    pub name: String,
    pub inputs: Vec<(ValueId, TensorType)>,
    pub instructions: Vec<Instruction>,
    pub outputs: Vec<ValueId>,
}

impl Graph {
    /// Stable structural digest, usable as a key in external per-signature
    /// compilation caches.
    pub fn digest(&self) -> u64 {
        // bincode is deterministic for a fixed type definition; hash failures
        // cannot occur for an in-memory graph.
        let bytes = bincode::serialize(self).unwrap_or_default();
        fnv1a_hash(&bytes)
    }

    pub fn input_arity(&self) -> usize {
        self.inputs.len()
    }

    pub fn output_arity(&self) -> usize {
        self.outputs.len()
    }

    /// Type of any value defined in the graph (input or instruction result).
    pub fn value_type(&self, id: ValueId) -> Option<&TensorType> {
        if let Some((_, ty)) = self.inputs.iter().find(|(input_id, _)| *input_id == id) {
            return Some(ty);
        }
        self.instructions
            .iter()
            .find(|instr| instr.id == id)
            .map(|instr| &instr.output)
    }
}

impl fmt::Display for Graph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "graph @{} {{", self.name)?;
        for (id, ty) in &self.inputs {
            writeln!(f, "  input %{} : {}", id.0, ty)?;
        }
        for instr in &self.instructions {
            let operands = instr
                .operands
                .iter()
                .map(|id| format!("%{}", id.0))
                .collect::<Vec<_>>()
                .join(", ");
            writeln!(
                f,
                "  %{} = {}({}) -> {}",
                instr.id.0,
                instr.op.label(),
                operands,
                instr.output
            )?;
        }
        let outputs = self
            .outputs
            .iter()
            .map(|id| format!("%{}", id.0))
            .collect::<Vec<_>>()
            .join(", ");
        writeln!(f, "  return {outputs}")?;
        f.write_str("}")
    }
}

/// Exactly-once construction scope for a [`Graph`].
///
/// The builder is created lazily by the lowering pass, mutated in place while
/// instructions are emitted, and consumed by [`GraphBuilder::finish`]. Abort
/// paths release it by ownership; there is no explicit close.
pub struct GraphBuilder {
    name: String,
    next_value_id: u32,
    inputs: Vec<(ValueId, TensorType)>,
    instructions: Vec<Instruction>,
    value_types: HashMap<ValueId, TensorType>,
}

impl GraphBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            next_value_id: 0,
            inputs: Vec::new(),
            instructions: Vec::new(),
            value_types: HashMap::new(),
        }
    }

    fn fresh_id(&mut self, ty: TensorType) -> ValueId {
        let id = ValueId(self.next_value_id);
        self.next_value_id += 1;
        self.value_types.insert(id, ty);
        id
    }

    /// Declares a graph input and returns its value id.
    pub fn add_input(&mut self, ty: TensorType) -> ValueId {
        let id = self.fresh_id(ty.clone());
        self.inputs.push((id, ty));
        id
    }

    /// Appends one instruction; every operand must already be defined.
    pub fn emit(
        &mut self,
        op: Operation,
        operands: Vec<ValueId>,
        output: TensorType,
    ) -> Result<ValueId, GraphError> {
        for operand in &operands {
            if !self.value_types.contains_key(operand) {
                return Err(GraphError::UnknownValue { id: *operand });
            }
        }
        let id = self.fresh_id(output.clone());
        self.instructions.push(Instruction {
            id,
            op,
            operands,
            output,
        });
        Ok(id)
    }

    pub fn value_type(&self, id: ValueId) -> Option<&TensorType> {
        self.value_types.get(&id)
    }

    pub fn input_arity(&self) -> usize {
        self.inputs.len()
    }

    /// Consumes the builder, sealing the graph with the given outputs.
    pub fn finish(self, outputs: Vec<ValueId>) -> Result<Graph, GraphError> {
        if outputs.is_empty() {
            return Err(GraphError::NoOutputs);
        }
        for output in &outputs {
            if !self.value_types.contains_key(output) {
                return Err(GraphError::UnknownOutput { id: *output });
            }
        }
        Ok(Graph {
            name: self.name,
            inputs: self.inputs,
            instructions: self.instructions,
            outputs,
        })
    }
}

const FNV1A_OFFSET: u64 = 0xcbf29ce484222325;
const FNV1A_PRIME: u64 = 0x100000001b3;

pub(crate) fn fnv1a_hash(bytes: &[u8]) -> u64 {
    let mut hash = FNV1A_OFFSET;
    for byte in bytes {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV1A_PRIME);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f32_type(dims: &[usize]) -> TensorType {
        TensorType::new(DType::F32, Shape::from_static(dims), Device::Cpu)
    }

    #[test]
    fn builder_tracks_value_types() {
        let mut builder = GraphBuilder::new("test");
        let input = builder.add_input(f32_type(&[2, 3]));
        let relu = builder
            .emit(
                Operation::ElementwiseUnary(UnaryOp::Relu),
                vec![input],
                f32_type(&[2, 3]),
            )
            .expect("emit relu");
        assert_eq!(builder.value_type(relu), Some(&f32_type(&[2, 3])));
        let graph = builder.finish(vec![relu]).expect("finish graph");
        assert_eq!(graph.input_arity(), 1);
        assert_eq!(graph.output_arity(), 1);
    }

    #[test]
    fn emit_rejects_foreign_value_ids() {
        let mut builder = GraphBuilder::new("test");
        let err = builder
            .emit(
                Operation::ElementwiseUnary(UnaryOp::Relu),
                vec![ValueId(7)],
                f32_type(&[1]),
            )
            .unwrap_err();
        assert!(matches!(err, GraphError::UnknownValue { id: ValueId(7) }));
    }

    #[test]
    fn finish_requires_outputs() {
        let mut builder = GraphBuilder::new("test");
        let _ = builder.add_input(f32_type(&[1]));
        assert!(matches!(
            builder.finish(Vec::new()),
            Err(GraphError::NoOutputs)
        ));
    }

    #[test]
    fn digest_is_stable_and_shape_sensitive() {
        let build = |dims: &[usize]| {
            let mut builder = GraphBuilder::new("digest");
            let input = builder.add_input(f32_type(dims));
            builder.finish(vec![input]).expect("finish")
        };
        assert_eq!(build(&[2, 3]).digest(), build(&[2, 3]).digest());
        assert_ne!(build(&[2, 3]).digest(), build(&[4, 3]).digest());
    }

    #[test]
    fn shape_element_count_handles_dynamic() {
        let shape = Shape::new(vec![
            Dimension::Dynamic(DimSymbol::new("n")),
            Dimension::Static(3),
        ]);
        assert_eq!(shape.element_count(), None);
        assert!(shape.has_dynamic());
        assert_eq!(Shape::from_static(&[4, 5]).element_count(), Some(20));
    }
}
