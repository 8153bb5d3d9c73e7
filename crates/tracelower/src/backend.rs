//! Execution boundary: the trait a target engine implements to run compiled
//! graphs.

use crate::graph::{DType, DimSymbol, Graph, TensorLiteral};

use thiserror::Error;

/// Execution-side failure surfaced to the runtime wrapper.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("{op} is not implemented: {reason}")]
    Unimplemented { op: &'static str, reason: String },
    #[error("dtype {dtype:?} not supported: {reason}")]
    DTypeNotSupported { dtype: DType, reason: String },
    #[error("shape mismatch: {message}")]
    ShapeMismatch { message: String },
    #[error("symbol '{symbol}' resolves to both {first} and {second}")]
    SymbolConflict {
        symbol: String,
        first: usize,
        second: usize,
    },
    #[error("expected {expected} inputs, got {actual}")]
    ArityMismatch { expected: usize, actual: usize },
    #[error("backend execution failure: {message}")]
    Execution { message: String },
}

impl BackendError {
    pub fn unimplemented(op: &'static str, reason: impl Into<String>) -> Self {
        BackendError::Unimplemented {
            op,
            reason: reason.into(),
        }
    }

    pub fn dtype(dtype: DType, reason: impl Into<String>) -> Self {
        BackendError::DTypeNotSupported {
            dtype,
            reason: reason.into(),
        }
    }

    pub fn shape(message: impl Into<String>) -> Self {
        BackendError::ShapeMismatch {
            message: message.into(),
        }
    }

    pub fn symbol_conflict(symbol: &DimSymbol, first: usize, second: usize) -> Self {
        BackendError::SymbolConflict {
            symbol: symbol.as_str().to_string(),
            first,
            second,
        }
    }

    pub fn execution(message: impl Into<String>) -> Self {
        BackendError::Execution {
            message: message.into(),
        }
    }
}

/// Convenience alias for results returned by backend routines.
pub type BackendResult<T> = Result<T, BackendError>;

/// A target engine that can materialise tensors and evaluate compiled graphs.
///
/// Implementations must be shareable across threads; a compiled graph may be
/// invoked concurrently by multiple callers.
pub trait GraphBackend: Send + Sync {
    type TensorHandle: Clone + Send + Sync + 'static;

    /// Human-readable backend identifier (e.g. `"ref-cpu"`).
    fn backend_name(&self) -> &str;

    /// Materialises a tensor handle from host literal data.
    fn materialize(&self, literal: &TensorLiteral) -> BackendResult<Self::TensorHandle>;

    /// Reads a tensor handle back into a dense host literal.
    fn to_literal(&self, tensor: &Self::TensorHandle) -> BackendResult<TensorLiteral>;

    /// Evaluates a compiled graph over already materialised inputs, in
    /// declaration order, returning outputs in graph output order.
    fn run_graph(
        &self,
        graph: &Graph,
        inputs: &[Self::TensorHandle],
    ) -> BackendResult<Vec<Self::TensorHandle>>;
}
