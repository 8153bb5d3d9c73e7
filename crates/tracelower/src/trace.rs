//! Source graph data model: the traced computation as an ordered node list.
//!
//! A [`TraceGraph`] is the engine's input format. It mirrors the trace
//! recorder's vocabulary, which is wider than what the engine lowers: the
//! engine accepts {Input, Call, AttributeAccess, Output} and rejects the rest
//! during the walk. The whole model derives serde so recorded traces can be
//! checked in as JSON fixtures.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::graph::{DType, Device, TensorLiteral, TensorType};

/// Kind of one traced instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Input,
    Call,
    CallMethod,
    CallModule,
    AttributeAccess,
    Output,
}

/// Argument tree recorded on a traced node.
///
/// `Ref` names an earlier node (or a named symbolic dimension marker);
/// everything else is a literal the recorder could represent. `Opaque` stands
/// in for a host object it could not; converting one is always an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value")]
pub enum ArgValue {
    Ref(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(String),
    Seq(Vec<ArgValue>),
    Tuple(Vec<ArgValue>),
    Slice {
        start: Box<ArgValue>,
        stop: Box<ArgValue>,
        step: Box<ArgValue>,
    },
    Device(Device),
    DType(DType),
    None,
    Ellipsis,
    Opaque {
        type_name: String,
    },
}

/// One declared shape dimension in input metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TraceDim {
    Concrete(usize),
    /// Dynamic extent. A named marker is shared across inputs; an unnamed one
    /// gets a generated stable symbol during lowering.
    Symbolic {
        name: Option<String>,
    },
}

/// Declared tensor metadata on an Input node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorMeta {
    pub dtype: DType,
    pub dims: Vec<TraceDim>,
    #[serde(default)]
    pub device: Device,
}

impl TensorMeta {
    pub fn new(dtype: DType, dims: Vec<TraceDim>) -> Self {
        Self {
            dtype,
            dims,
            device: Device::Cpu,
        }
    }

    /// Fully static metadata.
    pub fn from_static(dtype: DType, dims: &[usize]) -> Self {
        Self::new(dtype, dims.iter().map(|&d| TraceDim::Concrete(d)).collect())
    }
}

/// Example value recorded by the tracer, used for attribute binding and for
/// building representative inputs during decomposition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value")]
pub enum ExampleValue {
    Tensor {
        ty: TensorType,
        literal: Option<TensorLiteral>,
    },
    Int(i64),
    Float(f64),
    Bool(bool),
}

/// Optional per-node metadata.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NodeMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tensor: Option<TensorMeta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub example: Option<ExampleValue>,
}

/// One instruction in the traced computation graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceNode {
    pub name: String,
    pub kind: NodeKind,
    /// Operator identifier for Call nodes, attribute path for AttributeAccess.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default)]
    pub args: Vec<ArgValue>,
    #[serde(default)]
    pub kwargs: BTreeMap<String, ArgValue>,
    #[serde(default)]
    pub meta: NodeMeta,
}

impl TraceNode {
    /// Tensor-typed input declaration.
    pub fn input(name: impl Into<String>, tensor: TensorMeta) -> Self {
        Self {
            name: name.into(),
            kind: NodeKind::Input,
            target: None,
            args: Vec::new(),
            kwargs: BTreeMap::new(),
            meta: NodeMeta {
                tensor: Some(tensor),
                example: None,
            },
        }
    }

    /// Input without tensor metadata (e.g. a traced scalar argument).
    pub fn scalar_input(name: impl Into<String>, example: Option<ExampleValue>) -> Self {
        Self {
            name: name.into(),
            kind: NodeKind::Input,
            target: None,
            args: Vec::new(),
            kwargs: BTreeMap::new(),
            meta: NodeMeta {
                tensor: None,
                example,
            },
        }
    }

    pub fn call(name: impl Into<String>, target: impl Into<String>, args: Vec<ArgValue>) -> Self {
        Self {
            name: name.into(),
            kind: NodeKind::Call,
            target: Some(target.into()),
            args,
            kwargs: BTreeMap::new(),
            meta: NodeMeta::default(),
        }
    }

    pub fn with_kwargs(mut self, kwargs: BTreeMap<String, ArgValue>) -> Self {
        self.kwargs = kwargs;
        self
    }

    pub fn with_example(mut self, example: ExampleValue) -> Self {
        self.meta.example = Some(example);
        self
    }

    /// Attribute read bound to a recorded example value.
    pub fn attribute(
        name: impl Into<String>,
        target: impl Into<String>,
        example: Option<ExampleValue>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: NodeKind::AttributeAccess,
            target: Some(target.into()),
            args: Vec::new(),
            kwargs: BTreeMap::new(),
            meta: NodeMeta {
                tensor: None,
                example,
            },
        }
    }

    /// Output node; `elements` is the ordered result sequence.
    pub fn output(elements: Vec<ArgValue>) -> Self {
        Self {
            name: "output".to_string(),
            kind: NodeKind::Output,
            target: None,
            args: vec![ArgValue::Seq(elements)],
            kwargs: BTreeMap::new(),
            meta: NodeMeta::default(),
        }
    }
}

/// Structural violations in a trace, surfaced by [`TraceGraph::validate`] and
/// by the lowering walk.
#[derive(Debug, Error, PartialEq)]
pub enum TraceError {
    #[error("duplicate node name '{name}'")]
    DuplicateName { name: String },
    #[error("node '{node}' references '{reference}' which is not an earlier node")]
    UnknownReference { node: String, reference: String },
    #[error("trace has no output node")]
    MissingOutput,
    #[error("output node '{name}' is not the last node")]
    OutputNotLast { name: String },
    #[error("trace has more than one output node")]
    MultipleOutputs,
    #[error("input node '{name}' appears after the first operation")]
    InputAfterOperation { name: String },
    #[error("call node '{name}' has no operator target")]
    CallWithoutTarget { name: String },
}

/// The traced computation: an ordered, topologically sorted node list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceGraph {
    pub name: String,
    pub nodes: Vec<TraceNode>,
}

impl TraceGraph {
    pub fn new(name: impl Into<String>, nodes: Vec<TraceNode>) -> Self {
        Self {
            name: name.into(),
            nodes,
        }
    }

    /// Names of symbolic dimension markers declared on input metadata. These
    /// share the reference namespace with node names: a later call may consume
    /// a named dimension directly (e.g. as a reshape extent).
    pub fn symbol_names(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        for node in &self.nodes {
            if node.kind != NodeKind::Input {
                continue;
            }
            if let Some(tensor) = &node.meta.tensor {
                for dim in &tensor.dims {
                    if let TraceDim::Symbolic { name: Some(name) } = dim {
                        names.insert(name.clone());
                    }
                }
            }
        }
        names
    }

    /// Checks the structural invariants: unique names, references resolving
    /// to earlier nodes (or named symbols), inputs before operations, exactly
    /// one Output node in final position, Call nodes carrying a target.
    pub fn validate(&self) -> Result<(), TraceError> {
        let symbols = self.symbol_names();
        let mut seen: HashSet<&str> = HashSet::new();
        let mut past_inputs = false;
        let mut output_seen = false;

        for (index, node) in self.nodes.iter().enumerate() {
            if output_seen {
                return match node.kind {
                    NodeKind::Output => Err(TraceError::MultipleOutputs),
                    _ => Err(TraceError::OutputNotLast {
                        name: self.nodes[index - 1].name.clone(),
                    }),
                };
            }
            if !seen.insert(node.name.as_str()) || symbols.contains(&node.name) {
                return Err(TraceError::DuplicateName {
                    name: node.name.clone(),
                });
            }
            match node.kind {
                NodeKind::Input => {
                    if past_inputs {
                        return Err(TraceError::InputAfterOperation {
                            name: node.name.clone(),
                        });
                    }
                }
                NodeKind::Output => output_seen = true,
                NodeKind::Call => {
                    past_inputs = true;
                    if node.target.is_none() {
                        return Err(TraceError::CallWithoutTarget {
                            name: node.name.clone(),
                        });
                    }
                }
                _ => past_inputs = true,
            }
            for arg in node.args.iter().chain(node.kwargs.values()) {
                check_references(node, arg, &seen, &symbols)?;
            }
        }

        if !output_seen {
            return Err(TraceError::MissingOutput);
        }
        Ok(())
    }
}

fn check_references(
    node: &TraceNode,
    arg: &ArgValue,
    seen: &HashSet<&str>,
    symbols: &BTreeSet<String>,
) -> Result<(), TraceError> {
    match arg {
        ArgValue::Ref(name) => {
            // The node's own name is already in `seen`; a self-reference is
            // still a forward reference.
            if name == &node.name || (!seen.contains(name.as_str()) && !symbols.contains(name)) {
                return Err(TraceError::UnknownReference {
                    node: node.name.clone(),
                    reference: name.clone(),
                });
            }
        }
        ArgValue::Seq(elements) | ArgValue::Tuple(elements) => {
            for element in elements {
                check_references(node, element, seen, symbols)?;
            }
        }
        ArgValue::Slice { start, stop, step } => {
            check_references(node, start, seen, symbols)?;
            check_references(node, stop, seen, symbols)?;
            check_references(node, step, seen, symbols)?;
        }
        _ => {}
    }
    Ok(())
}
