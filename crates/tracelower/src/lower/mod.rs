//! The graph lowering engine: a single forward pass over a validated trace.
//!
//! Input nodes populate the symbolic dimension registry and defer graph
//! creation. The first non-Input node opens the construction scope, binding
//! declared inputs and registered symbols. Call nodes dispatch through the
//! translation table, attribute nodes bind recorded constants, and the Output
//! node seals the graph. Every failure aborts the whole compilation; the open
//! builder is released by ownership on every abort path.

pub mod binding;
pub mod symbolic;
pub mod table;
pub mod translate;
pub mod value;

mod output;

use std::sync::Arc;

use log::debug;
use thiserror::Error;

use crate::env;
use crate::graph::{Dimension, Graph, GraphBuilder, GraphError, Operation, TensorType};
use crate::trace::{ExampleValue, NodeKind, TraceDim, TraceError, TraceGraph, TraceNode};

use binding::Bindings;
use symbolic::SymbolicDims;
use table::TranslationTable;
use translate::translate_call;
use value::{TensorValue, Value};

/// The engine's output: a compiled graph plus the bookkeeping the execution
/// wrapper needs. One lowered graph corresponds to exactly one input shape
/// signature.
#[derive(Debug, Clone)]
pub struct LoweredGraph {
    pub graph: Arc<Graph>,
    /// Zero-based positions in the original output sequence that were null at
    /// compile time, re-interleaved into every execution result.
    pub null_positions: Vec<usize>,
    /// Declared tensor input types, in declaration order, used for fail-fast
    /// call-time validation.
    pub input_signature: Vec<TensorType>,
}

/// Failure taxonomy of the lowering pass. Every variant is fatal: no partial
/// graph is ever returned.
#[derive(Debug, Error)]
pub enum LowerError {
    #[error("node '{node}' references unbound name '{reference}'")]
    UnboundReference { node: String, reference: String },
    #[error("node '{node}' carries a value of unsupported type '{type_name}'")]
    UnsupportedValueType { node: String, type_name: String },
    #[error("node '{name}' has unsupported kind {kind:?}")]
    UnsupportedNodeKind { name: String, kind: NodeKind },
    #[error("node #{node_index}: operator '{operator}' has no translation entry")]
    UnsupportedOperator { node_index: usize, operator: String },
    #[error("node #{node_index}: lowering '{operator}' with args {args} failed: {cause:#}")]
    LoweringFailed {
        node_index: usize,
        operator: String,
        args: String,
        cause: anyhow::Error,
    },
    #[error("output sequence has no concrete elements")]
    EmptyOutput,
    #[error("attribute node '{name}' has no recorded value")]
    MissingAttribute { name: String },
    #[error(transparent)]
    Trace(#[from] TraceError),
    #[error(transparent)]
    Graph(#[from] GraphError),
}

struct StagedInput {
    name: String,
    ty: TensorType,
}

/// Lowers a trace into the target graph representation using the supplied
/// translation table.
pub fn lower(trace: &TraceGraph, table: &TranslationTable) -> Result<LoweredGraph, LowerError> {
    trace.validate()?;

    let mut staged: Vec<StagedInput> = Vec::new();
    let mut scalars: Vec<(String, Value)> = Vec::new();
    let mut symbols = SymbolicDims::new();
    let mut bindings = Bindings::new();
    let mut input_signature: Vec<TensorType> = Vec::new();
    let mut builder: Option<GraphBuilder> = None;

    for (node_index, node) in trace.nodes.iter().enumerate() {
        // Inputs are staged only while the scope is still closed; an Input
        // appearing later falls through to the unsupported-kind arm.
        if node.kind == NodeKind::Input && builder.is_none() {
            stage_input(node, &mut staged, &mut scalars, &mut symbols);
            continue;
        }

        // First non-Input node: open the construction scope, binding every
        // declared input and registered symbol.
        let mut open = match builder.take() {
            Some(open) => open,
            None => open_scope(
                trace,
                &staged,
                &symbols,
                &mut scalars,
                &mut bindings,
                &mut input_signature,
            ),
        };

        match node.kind {
            NodeKind::Call => {
                translate_call(&mut open, &mut bindings, table, node_index, node)?;
                builder = Some(open);
            }
            NodeKind::AttributeAccess => {
                bind_attribute(&mut open, &mut bindings, node)?;
                builder = Some(open);
            }
            NodeKind::Output => {
                let (graph, null_positions) = output::assemble(open, &bindings, node)?;
                if env::dump_graphs_enabled() {
                    debug!("lowered graph:\n{graph}");
                }
                return Ok(LoweredGraph {
                    graph: Arc::new(graph),
                    null_positions,
                    input_signature,
                });
            }
            // Dropping `open` here releases the unclosed scope.
            NodeKind::CallMethod | NodeKind::CallModule | NodeKind::Input => {
                return Err(LowerError::UnsupportedNodeKind {
                    name: node.name.clone(),
                    kind: node.kind,
                });
            }
        }
    }

    // validate() guarantees an Output node; a trace mutated after validation
    // still fails cleanly here.
    Err(LowerError::Trace(TraceError::MissingOutput))
}

fn stage_input(
    node: &TraceNode,
    staged: &mut Vec<StagedInput>,
    scalars: &mut Vec<(String, Value)>,
    symbols: &mut SymbolicDims,
) {
    if let Some(tensor) = &node.meta.tensor {
        let input_index = staged.len();
        let dims = tensor
            .dims
            .iter()
            .enumerate()
            .map(|(dim_index, dim)| match dim {
                TraceDim::Concrete(extent) => Dimension::Static(*extent),
                TraceDim::Symbolic { name } => {
                    Dimension::Dynamic(symbols.intern(name.as_deref(), input_index, dim_index))
                }
            })
            .collect::<Vec<_>>();
        staged.push(StagedInput {
            name: node.name.clone(),
            ty: TensorType::new(
                tensor.dtype,
                crate::graph::Shape::new(dims),
                tensor.device,
            ),
        });
        return;
    }

    // Non-tensor inputs are not declared as graph inputs; a recorded example
    // scalar specializes the value, otherwise the name stays unbound and the
    // first use surfaces UnboundReference.
    match &node.meta.example {
        Some(ExampleValue::Int(value)) => scalars.push((node.name.clone(), Value::Int(*value))),
        Some(ExampleValue::Float(value)) => {
            scalars.push((node.name.clone(), Value::Float(*value)));
        }
        Some(ExampleValue::Bool(value)) => scalars.push((node.name.clone(), Value::Bool(*value))),
        Some(ExampleValue::Tensor { .. }) | None => {}
    }
}

fn open_scope(
    trace: &TraceGraph,
    staged: &[StagedInput],
    symbols: &SymbolicDims,
    scalars: &mut Vec<(String, Value)>,
    bindings: &mut Bindings,
    input_signature: &mut Vec<TensorType>,
) -> GraphBuilder {
    let mut builder = GraphBuilder::new(trace.name.clone());
    for input in staged {
        let id = builder.add_input(input.ty.clone());
        bindings.bind(
            input.name.clone(),
            Value::Tensor(TensorValue::new(id, input.ty.clone())),
        );
        input_signature.push(input.ty.clone());
    }
    for symbol in symbols.symbols() {
        bindings.bind(
            symbol.as_str().to_string(),
            Value::Dim(Dimension::Dynamic(symbol.clone())),
        );
    }
    for (name, value) in scalars.drain(..) {
        bindings.bind(name, value);
    }
    debug!(
        "opened graph scope '{}': {} tensor inputs, {} symbolic dims",
        trace.name,
        staged.len(),
        symbols.len()
    );
    builder
}

fn bind_attribute(
    builder: &mut GraphBuilder,
    bindings: &mut Bindings,
    node: &TraceNode,
) -> Result<(), LowerError> {
    let value = match &node.meta.example {
        Some(ExampleValue::Int(value)) => Value::Int(*value),
        Some(ExampleValue::Float(value)) => Value::Float(*value),
        Some(ExampleValue::Bool(value)) => Value::Bool(*value),
        Some(ExampleValue::Tensor {
            literal: Some(literal),
            ..
        }) => {
            let ty = literal.ty.clone();
            let id = builder.emit(Operation::Constant(literal.clone()), Vec::new(), ty.clone())?;
            Value::Tensor(TensorValue::new(id, ty))
        }
        Some(ExampleValue::Tensor { literal: None, .. }) | None => {
            return Err(LowerError::MissingAttribute {
                name: node.name.clone(),
            });
        }
    };
    bindings.bind(node.name.clone(), value);
    Ok(())
}
