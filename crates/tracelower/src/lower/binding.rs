//! Name-to-value table and the single recursive argument converter.

use std::collections::HashMap;

use crate::lower::LowerError;
use crate::lower::value::{SliceValue, Value};
use crate::trace::ArgValue;

/// Stores the value bound to every processed node name (plus symbolic
/// dimension names once the graph scope opens). Bindings are write-once by
/// construction: node names are unique and each node binds exactly once.
#[derive(Default)]
pub struct Bindings {
    values: HashMap<String, Value>,
}

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bind(&mut self, name: impl Into<String>, value: Value) {
        self.values.insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Recursively converts a trace argument tree into an engine [`Value`].
    ///
    /// `node` is the name of the node whose argument is being converted, used
    /// for error context only.
    pub fn convert(&self, node: &str, arg: &ArgValue) -> Result<Value, LowerError> {
        match arg {
            ArgValue::Ref(name) => {
                self.values
                    .get(name)
                    .cloned()
                    .ok_or_else(|| LowerError::UnboundReference {
                        node: node.to_string(),
                        reference: name.clone(),
                    })
            }
            ArgValue::Int(value) => Ok(Value::Int(*value)),
            ArgValue::Float(value) => Ok(Value::Float(*value)),
            ArgValue::Bool(value) => Ok(Value::Bool(*value)),
            ArgValue::Str(value) => Ok(Value::Str(value.clone())),
            ArgValue::Seq(elements) => {
                let converted = elements
                    .iter()
                    .map(|element| self.convert(node, element))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Value::Seq(converted))
            }
            ArgValue::Tuple(elements) => {
                let converted = elements
                    .iter()
                    .map(|element| self.convert(node, element))
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Value::Tuple(converted))
            }
            ArgValue::Slice { start, stop, step } => Ok(Value::Slice(Box::new(SliceValue {
                start: self.convert(node, start)?,
                stop: self.convert(node, stop)?,
                step: self.convert(node, step)?,
            }))),
            ArgValue::Device(device) => Ok(Value::Device(*device)),
            ArgValue::DType(dtype) => Ok(Value::DType(*dtype)),
            ArgValue::None => Ok(Value::None),
            ArgValue::Ellipsis => Ok(Value::Ellipsis),
            ArgValue::Opaque { type_name } => Err(LowerError::UnsupportedValueType {
                node: node.to_string(),
                type_name: type_name.clone(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn convert_preserves_structure() {
        let mut bindings = Bindings::new();
        bindings.bind("x", Value::Int(7));
        let arg = ArgValue::Tuple(vec![
            ArgValue::Ref("x".into()),
            ArgValue::Seq(vec![ArgValue::Float(1.5), ArgValue::None]),
        ]);
        let value = bindings.convert("n", &arg).expect("convert");
        assert_eq!(
            value,
            Value::Tuple(vec![
                Value::Int(7),
                Value::Seq(vec![Value::Float(1.5), Value::None]),
            ])
        );
    }

    #[test]
    fn unbound_reference_names_the_node_and_target() {
        let bindings = Bindings::new();
        let err = bindings
            .convert("caller", &ArgValue::Ref("ghost".into()))
            .unwrap_err();
        assert!(matches!(
            err,
            LowerError::UnboundReference { node, reference }
                if node == "caller" && reference == "ghost"
        ));
    }

    #[test]
    fn opaque_argument_names_the_host_type() {
        let bindings = Bindings::new();
        let err = bindings
            .convert(
                "caller",
                &ArgValue::Opaque {
                    type_name: "torch.Generator".into(),
                },
            )
            .unwrap_err();
        assert!(matches!(
            err,
            LowerError::UnsupportedValueType { type_name, .. } if type_name == "torch.Generator"
        ));
    }
}
