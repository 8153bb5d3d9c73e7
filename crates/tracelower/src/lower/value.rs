//! Engine-side value representation.

use std::fmt;

use crate::graph::{DType, Device, Dimension, TensorType, ValueId};

/// A tensor bound in the target graph: its SSA id plus its type.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorValue {
    pub id: ValueId,
    pub ty: TensorType,
}

impl TensorValue {
    pub fn new(id: ValueId, ty: TensorType) -> Self {
        Self { id, ty }
    }
}

/// Start/stop/step of a converted slice argument.
#[derive(Debug, Clone, PartialEq)]
pub struct SliceValue {
    pub start: Value,
    pub stop: Value,
    pub step: Value,
}

/// Closed tagged union over everything an operator argument or result can be.
/// Values are immutable once bound to a node name.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Tensor(TensorValue),
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    /// A bound symbolic (or static) dimension, usable as a normal extent
    /// argument in later calls.
    Dim(Dimension),
    Seq(Vec<Value>),
    Tuple(Vec<Value>),
    Slice(Box<SliceValue>),
    Device(Device),
    DType(DType),
    None,
    Ellipsis,
}

impl Value {
    /// Short label used in error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Tensor(_) => "tensor",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Bool(_) => "bool",
            Value::Str(_) => "str",
            Value::Dim(_) => "dim",
            Value::Seq(_) => "seq",
            Value::Tuple(_) => "tuple",
            Value::Slice(_) => "slice",
            Value::Device(_) => "device",
            Value::DType(_) => "dtype",
            Value::None => "none",
            Value::Ellipsis => "ellipsis",
        }
    }

    pub fn as_tensor(&self) -> Option<&TensorValue> {
        match self {
            Value::Tensor(tensor) => Some(tensor),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(value) => Some(*value),
            Value::Dim(Dimension::Static(extent)) => Some(*extent as i64),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(value) => Some(*value),
            Value::Int(value) => Some(*value as f64),
            _ => None,
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    /// Extent arguments accept plain ints and bound dimensions.
    pub fn as_dimension(&self) -> Option<Dimension> {
        match self {
            Value::Dim(dim) => Some(dim.clone()),
            Value::Int(value) if *value >= 0 => Some(Dimension::Static(*value as usize)),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Tensor(tensor) => write!(f, "%{}: {}", tensor.id.0, tensor.ty),
            Value::Int(value) => write!(f, "{value}"),
            Value::Float(value) => write!(f, "{value}"),
            Value::Bool(value) => write!(f, "{value}"),
            Value::Str(value) => write!(f, "{value:?}"),
            Value::Dim(Dimension::Static(extent)) => write!(f, "dim({extent})"),
            Value::Dim(Dimension::Dynamic(symbol)) => write!(f, "dim(?{})", symbol.as_str()),
            Value::Seq(elements) => write_joined(f, "[", elements, "]"),
            Value::Tuple(elements) => write_joined(f, "(", elements, ")"),
            Value::Slice(slice) => {
                write!(f, "slice({}, {}, {})", slice.start, slice.stop, slice.step)
            }
            Value::Device(device) => write!(f, "{device}"),
            Value::DType(dtype) => write!(f, "{dtype:?}"),
            Value::None => f.write_str("none"),
            Value::Ellipsis => f.write_str("..."),
        }
    }
}

fn write_joined(
    f: &mut fmt::Formatter<'_>,
    open: &str,
    elements: &[Value],
    close: &str,
) -> fmt::Result {
    f.write_str(open)?;
    for (index, element) in elements.iter().enumerate() {
        if index > 0 {
            f.write_str(", ")?;
        }
        write!(f, "{element}")?;
    }
    f.write_str(close)
}
