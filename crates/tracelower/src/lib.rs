//! tracelower: a traced-graph lowering engine.
//!
//! The engine walks a traced computation graph — a topologically ordered
//! node list of inputs, operator calls, attribute reads and outputs — and
//! incrementally builds an equivalent graph in the target representation,
//! using a per-operator translation table supplied by the caller. Symbolic
//! input dimensions are tracked and bound as usable values, unsupported
//! operators can be rewritten into supported primitives by an optional
//! decomposition pre-pass, and null output placeholders are recorded at
//! compile time and re-interleaved at execution time.

pub mod backend;
pub mod decompose;
pub mod graph;
pub mod lower;
pub mod ops;
pub mod runtime;
pub mod trace;

mod env;

pub use backend::{BackendError, BackendResult, GraphBackend};
pub use graph::{DType, Device, DimSymbol, Dimension, Graph, Shape, TensorLiteral, TensorType};
pub use lower::table::TranslationTable;
pub use lower::{LowerError, LoweredGraph, lower};
pub use runtime::{CallArg, CompileOptions, Executable, compile};
pub use trace::{ArgValue, NodeKind, TraceGraph, TraceNode};
