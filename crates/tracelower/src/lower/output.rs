//! Output assembly: converts the output sequence, records null positions and
//! seals the graph by consuming the builder.

use log::debug;

use crate::graph::{Graph, GraphBuilder};
use crate::lower::LowerError;
use crate::lower::binding::Bindings;
use crate::lower::value::Value;
use crate::trace::{ArgValue, TraceNode};

/// Consumes the construction scope. The Output node carries exactly one
/// positional argument: the ordered output sequence. `None` elements are
/// excluded and their zero-based positions recorded for re-interleaving at
/// execution time.
pub(super) fn assemble(
    builder: GraphBuilder,
    bindings: &Bindings,
    node: &TraceNode,
) -> Result<(Graph, Vec<usize>), LowerError> {
    let elements: &[ArgValue] = match node.args.as_slice() {
        [ArgValue::Seq(elements)] | [ArgValue::Tuple(elements)] => elements,
        // A bare reference or literal is a single-element result.
        [single] => std::slice::from_ref(single),
        _ => {
            return Err(LowerError::UnsupportedValueType {
                node: node.name.clone(),
                type_name: "output argument list".to_string(),
            });
        }
    };

    let mut outputs = Vec::with_capacity(elements.len());
    let mut null_positions = Vec::new();
    for (position, element) in elements.iter().enumerate() {
        match bindings.convert(&node.name, element)? {
            Value::None => null_positions.push(position),
            Value::Tensor(tensor) => outputs.push(tensor.id),
            other => {
                return Err(LowerError::UnsupportedValueType {
                    node: node.name.clone(),
                    type_name: format!("output element of kind {}", other.kind_name()),
                });
            }
        }
    }

    if outputs.is_empty() {
        return Err(LowerError::EmptyOutput);
    }

    let graph = builder.finish(outputs)?;
    debug!(
        "sealed graph '{}': {} inputs, {} outputs, {} nulls",
        graph.name,
        graph.input_arity(),
        graph.output_arity(),
        null_positions.len()
    );
    Ok((graph, null_positions))
}
