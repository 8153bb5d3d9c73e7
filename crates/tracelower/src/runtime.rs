//! Execution wrapper around a compiled graph, plus the one-call compile
//! convenience.
//!
//! An [`Executable`] couples a [`LoweredGraph`] with a backend. It is
//! immutable and may be called concurrently; one executable corresponds to
//! exactly one input shape signature, and every call is validated against
//! that signature before anything reaches the backend.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::debug;
use thiserror::Error;

use crate::backend::{BackendError, GraphBackend};
use crate::decompose::{DecomposeError, DecomposeOutcome, DecompositionTable, decompose};
use crate::graph::{DType, DimSymbol, Dimension, TensorLiteral, TensorType};
use crate::lower::table::TranslationTable;
use crate::lower::{LowerError, LoweredGraph, lower};
use crate::trace::TraceGraph;

/// One call-site argument. Non-tensor arguments are dropped before execution;
/// they were already specialized into the graph at compile time.
#[derive(Debug, Clone)]
pub enum CallArg {
    Tensor(TensorLiteral),
    Int(i64),
    Float(f64),
    Bool(bool),
    None,
}

/// Call-time contract violations and wrapped backend failures.
#[derive(Debug, Error)]
pub enum ExecuteError {
    #[error("expected {expected} tensor arguments, got {actual}")]
    TensorArity { expected: usize, actual: usize },
    #[error("input {input}: expected dtype {expected:?}, got {actual:?}")]
    DTypeMismatch {
        input: usize,
        expected: DType,
        actual: DType,
    },
    #[error("input {input}: expected rank {expected}, got {actual}")]
    RankMismatch {
        input: usize,
        expected: usize,
        actual: usize,
    },
    #[error("input {input}, dim {dim}: expected extent {expected}, got {actual}")]
    ExtentMismatch {
        input: usize,
        dim: usize,
        expected: usize,
        actual: usize,
    },
    #[error("symbol '{symbol}' bound to {first} by an earlier input, got {second} at input {input}")]
    SymbolMismatch {
        symbol: String,
        first: usize,
        second: usize,
        input: usize,
    },
    #[error("input {input} has a non-concrete shape at call time")]
    NonConcreteInput { input: usize },
    #[error("backend returned {actual} results, graph declares {expected}")]
    ResultArity { expected: usize, actual: usize },
    #[error(transparent)]
    Backend(#[from] BackendError),
}

/// A compiled graph bound to a backend, callable concurrently.
pub struct Executable<B: GraphBackend> {
    lowered: LoweredGraph,
    backend: Arc<B>,
}

impl<B: GraphBackend> Executable<B> {
    pub fn new(lowered: LoweredGraph, backend: Arc<B>) -> Self {
        Self { lowered, backend }
    }

    pub fn lowered(&self) -> &LoweredGraph {
        &self.lowered
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Runs the compiled graph. Tensor arguments must match the compile-time
    /// shape signature exactly; the result restores the original output arity
    /// with `None` at the recorded null positions.
    pub fn call(&self, args: &[CallArg]) -> Result<Vec<Option<TensorLiteral>>, ExecuteError> {
        let tensors: Vec<&TensorLiteral> = args
            .iter()
            .filter_map(|arg| match arg {
                CallArg::Tensor(literal) => Some(literal),
                _ => None,
            })
            .collect();

        validate_signature(&self.lowered.input_signature, &tensors)?;

        let mut handles = Vec::with_capacity(tensors.len());
        for literal in &tensors {
            handles.push(self.backend.materialize(literal)?);
        }
        debug!(
            "executing graph '{}' on backend '{}'",
            self.lowered.graph.name,
            self.backend.backend_name()
        );
        let raw = self.backend.run_graph(&self.lowered.graph, &handles)?;
        if raw.len() != self.lowered.graph.output_arity() {
            return Err(ExecuteError::ResultArity {
                expected: self.lowered.graph.output_arity(),
                actual: raw.len(),
            });
        }

        let mut results = Vec::with_capacity(raw.len());
        for handle in &raw {
            results.push(self.backend.to_literal(handle)?);
        }
        Ok(reinterleave(results, &self.lowered.null_positions))
    }
}

/// Validates call-time tensors against the compiled signature: arity, dtype,
/// rank, static extents, and consistent resolution of every symbolic
/// dimension across all inputs. Mismatches fail fast; nothing is coerced.
fn validate_signature(
    signature: &[TensorType],
    tensors: &[&TensorLiteral],
) -> Result<(), ExecuteError> {
    if tensors.len() != signature.len() {
        return Err(ExecuteError::TensorArity {
            expected: signature.len(),
            actual: tensors.len(),
        });
    }

    let mut resolved: BTreeMap<DimSymbol, (usize, usize)> = BTreeMap::new();
    for (input, (declared, literal)) in signature.iter().zip(tensors.iter()).enumerate() {
        if literal.ty.dtype != declared.dtype {
            return Err(ExecuteError::DTypeMismatch {
                input,
                expected: declared.dtype,
                actual: literal.ty.dtype,
            });
        }
        let actual_dims = literal
            .ty
            .shape
            .static_dims()
            .ok_or(ExecuteError::NonConcreteInput { input })?;
        if actual_dims.len() != declared.shape.rank() {
            return Err(ExecuteError::RankMismatch {
                input,
                expected: declared.shape.rank(),
                actual: actual_dims.len(),
            });
        }
        for (dim, (declared_dim, actual)) in declared
            .shape
            .dims()
            .iter()
            .zip(actual_dims.iter())
            .enumerate()
        {
            match declared_dim {
                Dimension::Static(expected) => {
                    if expected != actual {
                        return Err(ExecuteError::ExtentMismatch {
                            input,
                            dim,
                            expected: *expected,
                            actual: *actual,
                        });
                    }
                }
                Dimension::Dynamic(symbol) => {
                    if let Some((first, _)) = resolved.get(symbol) {
                        if first != actual {
                            return Err(ExecuteError::SymbolMismatch {
                                symbol: symbol.as_str().to_string(),
                                first: *first,
                                second: *actual,
                                input,
                            });
                        }
                    } else {
                        resolved.insert(symbol.clone(), (*actual, input));
                    }
                }
            }
        }
    }
    Ok(())
}

/// Restores the original output arity by inserting `None` at the recorded
/// null positions; concrete results keep their relative order.
fn reinterleave(
    results: Vec<TensorLiteral>,
    null_positions: &[usize],
) -> Vec<Option<TensorLiteral>> {
    let total = results.len() + null_positions.len();
    let mut concrete = results.into_iter();
    let mut interleaved = Vec::with_capacity(total);
    for position in 0..total {
        if null_positions.contains(&position) {
            interleaved.push(None);
        } else {
            interleaved.push(concrete.next());
        }
    }
    interleaved
}

/// Options for the one-call [`compile`] convenience.
pub struct CompileOptions<'a> {
    pub table: &'a TranslationTable,
    pub decompositions: Option<&'a DecompositionTable>,
}

impl<'a> CompileOptions<'a> {
    pub fn new(table: &'a TranslationTable) -> Self {
        Self {
            table,
            decompositions: None,
        }
    }

    pub fn with_decompositions(mut self, decompositions: &'a DecompositionTable) -> Self {
        self.decompositions = Some(decompositions);
        self
    }
}

/// Compilation failure: either a fatal decomposition error or any lowering
/// failure.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error(transparent)]
    Decompose(#[from] DecomposeError),
    #[error(transparent)]
    Lower(#[from] LowerError),
}

/// Runs the decomposition pre-pass (when a table is supplied) and then the
/// lowering pass.
pub fn compile(trace: &TraceGraph, options: &CompileOptions<'_>) -> Result<LoweredGraph, CompileError> {
    let lowered = match options.decompositions {
        Some(decompositions) => match decompose(trace, decompositions)? {
            DecomposeOutcome::Unchanged => lower(trace, options.table)?,
            DecomposeOutcome::Rewritten { trace: rewritten, stats } => {
                debug!(
                    "decomposition expanded {} sites, kept {} verbatim",
                    stats.expanded,
                    stats.incomplete.len()
                );
                lower(&rewritten, options.table)?
            }
        },
        None => lower(trace, options.table)?,
    };
    Ok(lowered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Device, Shape};

    fn literal(dims: &[usize]) -> TensorLiteral {
        let count: usize = dims.iter().product();
        TensorLiteral::from_f32(&vec![0.0; count], dims, Device::Cpu)
    }

    #[test]
    fn reinterleave_restores_positions() {
        let results = vec![literal(&[1]), literal(&[2])];
        let interleaved = reinterleave(results, &[0, 2]);
        assert_eq!(interleaved.len(), 4);
        assert!(interleaved[0].is_none());
        assert!(interleaved[1].is_some());
        assert!(interleaved[2].is_none());
        assert!(interleaved[3].is_some());
    }

    #[test]
    fn signature_rejects_symbol_conflicts() {
        let symbol = DimSymbol::new("n");
        let declared = TensorType::new(
            DType::F32,
            Shape::new(vec![Dimension::Dynamic(symbol.clone()), Dimension::Static(3)]),
            Device::Cpu,
        );
        let signature = vec![declared.clone(), declared];
        let first = literal(&[2, 3]);
        let second = literal(&[5, 3]);
        let err = validate_signature(&signature, &[&first, &second]).unwrap_err();
        assert!(matches!(
            err,
            ExecuteError::SymbolMismatch { first: 2, second: 5, .. }
        ));
    }

    #[test]
    fn signature_rejects_static_extent_mismatch() {
        let declared = TensorType::new(DType::F32, Shape::from_static(&[2, 3]), Device::Cpu);
        let actual = literal(&[2, 4]);
        let err = validate_signature(&[declared], &[&actual]).unwrap_err();
        assert!(matches!(
            err,
            ExecuteError::ExtentMismatch { dim: 1, expected: 3, actual: 4, .. }
        ));
    }
}
