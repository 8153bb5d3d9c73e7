//! The externally supplied operator translation table and the facade the
//! engine hands to each lowering function.
//!
//! The engine treats table entries as opaque capabilities: it looks up the
//! canonical operator family, invokes the entry with converted arguments and
//! an emission scope, and wraps any failure. The stock table in [`crate::ops`]
//! is just one possible table; callers can build their own.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::{Context, Result, bail};

use crate::graph::{GraphBuilder, Operation, TensorLiteral, TensorType, ValueId};
use crate::lower::value::{TensorValue, Value};

/// Lowering capability: converted args in, one result [`Value`] out (possibly
/// a tuple of several outputs). Failures are wrapped by the engine as
/// `LoweringFailed`.
pub type LowerFn = dyn Fn(&mut LowerScope<'_>, &CallArgs) -> Result<Value> + Send + Sync;

/// Canonical operator family → lowering capability.
#[derive(Default, Clone)]
pub struct TranslationTable {
    entries: HashMap<String, Arc<LowerFn>>,
}

impl TranslationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, family: impl Into<String>, entry: F)
    where
        F: Fn(&mut LowerScope<'_>, &CallArgs) -> Result<Value> + Send + Sync + 'static,
    {
        self.entries.insert(family.into(), Arc::new(entry));
    }

    pub fn lookup(&self, family: &str) -> Option<&Arc<LowerFn>> {
        self.entries.get(family)
    }

    pub fn contains(&self, family: &str) -> bool {
        self.entries.contains_key(family)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Copies every entry of `other` into `self`, overriding on collision.
    pub fn extend_from(&mut self, other: &TranslationTable) {
        for (family, entry) in &other.entries {
            self.entries.insert(family.clone(), Arc::clone(entry));
        }
    }
}

/// Emission facade over the open [`GraphBuilder`], scoped to one call.
pub struct LowerScope<'a> {
    builder: &'a mut GraphBuilder,
}

impl<'a> LowerScope<'a> {
    pub(crate) fn new(builder: &'a mut GraphBuilder) -> Self {
        Self { builder }
    }

    /// Emits one instruction and returns the produced tensor value.
    pub fn emit(
        &mut self,
        op: Operation,
        operands: Vec<ValueId>,
        output: TensorType,
    ) -> Result<TensorValue> {
        let id = self.builder.emit(op, operands, output.clone())?;
        Ok(TensorValue::new(id, output))
    }

    /// Emits a constant instruction for a host literal.
    pub fn constant(&mut self, literal: TensorLiteral) -> Result<TensorValue> {
        let ty = literal.ty.clone();
        self.emit(Operation::Constant(literal), Vec::new(), ty)
    }

    pub fn value_type(&self, id: ValueId) -> Option<&TensorType> {
        self.builder.value_type(id)
    }
}

/// Converted positional and keyword arguments of one call node.
pub struct CallArgs {
    pub args: Vec<Value>,
    pub kwargs: BTreeMap<String, Value>,
}

impl CallArgs {
    pub fn new(args: Vec<Value>, kwargs: BTreeMap<String, Value>) -> Self {
        Self { args, kwargs }
    }

    pub fn arg(&self, index: usize) -> Result<&Value> {
        self.args
            .get(index)
            .with_context(|| format!("missing positional argument {index}"))
    }

    pub fn opt_arg(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }

    pub fn kwarg(&self, name: &str) -> Option<&Value> {
        self.kwargs.get(name)
    }

    /// Positional argument or keyword fallback; absent and `None` both yield
    /// `None`.
    pub fn arg_or_kwarg(&self, index: usize, name: &str) -> Option<&Value> {
        self.args
            .get(index)
            .or_else(|| self.kwargs.get(name))
            .filter(|value| !value.is_none())
    }

    pub fn tensor(&self, index: usize) -> Result<&TensorValue> {
        let value = self.arg(index)?;
        match value {
            Value::Tensor(tensor) => Ok(tensor),
            other => bail!(
                "positional argument {index} must be a tensor, got {}",
                other.kind_name()
            ),
        }
    }

    pub fn int(&self, index: usize) -> Result<i64> {
        let value = self.arg(index)?;
        value.as_int().with_context(|| {
            format!(
                "positional argument {index} must be an int, got {}",
                value.kind_name()
            )
        })
    }

    pub fn int_or(&self, index: usize, name: &str, default: i64) -> Result<i64> {
        match self.arg_or_kwarg(index, name) {
            Some(value) => value.as_int().with_context(|| {
                format!("argument '{name}' must be an int, got {}", value.kind_name())
            }),
            None => Ok(default),
        }
    }

    pub fn float_or(&self, index: usize, name: &str, default: f64) -> Result<f64> {
        match self.arg_or_kwarg(index, name) {
            Some(value) => value.as_float().with_context(|| {
                format!(
                    "argument '{name}' must be a number, got {}",
                    value.kind_name()
                )
            }),
            None => Ok(default),
        }
    }

    pub fn bool_or(&self, index: usize, name: &str, default: bool) -> Result<bool> {
        match self.arg_or_kwarg(index, name) {
            Some(Value::Bool(value)) => Ok(*value),
            Some(other) => bail!(
                "argument '{name}' must be a bool, got {}",
                other.kind_name()
            ),
            None => Ok(default),
        }
    }

    /// Elements of a positional Seq/Tuple argument.
    pub fn elements(&self, index: usize) -> Result<&[Value]> {
        let value = self.arg(index)?;
        match value {
            Value::Seq(elements) | Value::Tuple(elements) => Ok(elements),
            other => bail!(
                "positional argument {index} must be a sequence, got {}",
                other.kind_name()
            ),
        }
    }

    /// Compact one-line rendering kept in `LoweringFailed` diagnostics.
    pub fn snapshot(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + self.kwargs.len());
        for arg in &self.args {
            parts.push(arg.to_string());
        }
        for (name, value) in &self.kwargs {
            parts.push(format!("{name}={value}"));
        }
        format!("({})", parts.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accessors_fall_back_to_kwargs_and_defaults() {
        let mut kwargs = BTreeMap::new();
        kwargs.insert("dim".to_string(), Value::Int(1));
        let call = CallArgs::new(vec![Value::Int(5)], kwargs);
        assert_eq!(call.int(0).expect("arg 0"), 5);
        assert_eq!(call.int_or(3, "dim", 0).expect("dim kwarg"), 1);
        assert_eq!(call.int_or(3, "other", -1).expect("default"), -1);
    }

    #[test]
    fn snapshot_renders_args_and_kwargs() {
        let mut kwargs = BTreeMap::new();
        kwargs.insert("alpha".to_string(), Value::Float(2.0));
        let call = CallArgs::new(vec![Value::Int(1), Value::None], kwargs);
        assert_eq!(call.snapshot(), "(1, none, alpha=2)");
    }
}
