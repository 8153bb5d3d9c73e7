//! Optional pre-pass that rewrites unsupported operators into supported
//! primitives by re-tracing the node list.
//!
//! The pass scans Call nodes for canonical families present in the supplied
//! [`DecompositionTable`]. With no matches it returns
//! [`DecomposeOutcome::Unchanged`] without building anything. Otherwise it
//! builds representative example values for every input, then rebuilds the
//! node list: non-matching nodes are copied with references remapped,
//! matching calls are expanded through their [`DecomposeFn`] against a
//! [`Retracer`] that emits primitive calls. Expanded calls that again match
//! the table are expanded recursively up to a fixed depth.
//!
//! The pass is not total: a site whose capability fails is kept verbatim and
//! recorded in [`DecomposeStats::incomplete`]; if its operator is also absent
//! from the translation table it surfaces later as `UnsupportedOperator`.
//! Applying the pass to its own output finds no matches.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use log::debug;
use thiserror::Error;

use crate::graph::{DimSymbol, Dimension, Shape, TensorLiteral, TensorType};
use crate::lower::translate::canonical_family;
use crate::trace::{ArgValue, ExampleValue, NodeKind, TensorMeta, TraceDim, TraceGraph, TraceNode};

/// Maximum nesting of table-matching emissions inside one expansion.
const MAX_EXPANSION_DEPTH: usize = 8;

/// Decomposition capability: rewrites one call site into primitive emissions,
/// returning the argument tree that replaces references to the original node
/// (usually a `Ref` to the last emitted node, possibly a `Tuple`).
pub type DecomposeFn = dyn Fn(&mut Retracer<'_>, &Site<'_>) -> Result<ArgValue> + Send + Sync;

/// Canonical operator family → decomposition capability.
#[derive(Default, Clone)]
pub struct DecompositionTable {
    entries: HashMap<String, Arc<DecomposeFn>>,
}

impl DecompositionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, family: impl Into<String>, entry: F)
    where
        F: Fn(&mut Retracer<'_>, &Site<'_>) -> Result<ArgValue> + Send + Sync + 'static,
    {
        self.entries.insert(family.into(), Arc::new(entry));
    }

    pub fn lookup(&self, family: &str) -> Option<&Arc<DecomposeFn>> {
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
}

/// Fatal pass failures. Per-site capability errors are not fatal; they are
/// reported through [`DecomposeStats::incomplete`] instead.
#[derive(Debug, Error)]
pub enum DecomposeError {
    #[error("decomposing '{operator}' exceeded the expansion depth limit of {limit}")]
    RecursionLimit { operator: String, limit: usize },
}

/// What the pass did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DecomposeStats {
    /// Number of call sites successfully expanded.
    pub expanded: usize,
    /// Operator families whose capability failed; those sites were kept
    /// verbatim.
    pub incomplete: Vec<String>,
}

/// Result of one pass over a trace.
#[derive(Debug)]
pub enum DecomposeOutcome {
    /// No call node matched the table; the input trace is untouched.
    Unchanged,
    /// At least one site matched; `trace` is the rewritten node list.
    Rewritten {
        trace: TraceGraph,
        stats: DecomposeStats,
    },
}

/// One matched call site handed to a [`DecomposeFn`].
pub struct Site<'a> {
    operator: &'a str,
    args: &'a [ArgValue],
    kwargs: &'a BTreeMap<String, ArgValue>,
}

impl<'a> Site<'a> {
    /// Qualified operator identifier of the matched call.
    pub fn operator(&self) -> &str {
        self.operator
    }

    pub fn arg(&self, index: usize) -> Result<&ArgValue> {
        self.args.get(index).with_context(|| {
            format!(
                "'{}' is missing positional argument {index}",
                self.operator
            )
        })
    }

    pub fn opt_arg(&self, index: usize) -> Option<&ArgValue> {
        self.args.get(index)
    }

    pub fn kwarg(&self, name: &str) -> Option<&ArgValue> {
        self.kwargs.get(name)
    }

    /// Positional argument or keyword fallback; absent and `None` both yield
    /// `None`.
    pub fn arg_or_kwarg(&self, index: usize, name: &str) -> Option<&ArgValue> {
        self.args
            .get(index)
            .or_else(|| self.kwargs.get(name))
            .filter(|value| !matches!(value, ArgValue::None))
    }
}

/// Emission context for one expansion: appends primitive call nodes into a
/// per-site buffer that is spliced into the rewritten trace only when the
/// whole site succeeds.
pub struct Retracer<'a> {
    emitted: Vec<TraceNode>,
    examples: &'a BTreeMap<String, ExampleValue>,
    table: &'a DecompositionTable,
    used_names: &'a mut HashSet<String>,
    base: String,
    fresh: usize,
    depth: usize,
}

impl<'a> Retracer<'a> {
    /// Emits a call node with a fresh name and returns the argument tree that
    /// references it. An emitted call whose family again matches the table is
    /// expanded in place instead.
    pub fn emit(
        &mut self,
        target: &str,
        args: Vec<ArgValue>,
        kwargs: BTreeMap<String, ArgValue>,
    ) -> Result<ArgValue> {
        let family = canonical_family(target);
        if let Some(entry) = self.table.lookup(family) {
            if self.depth >= MAX_EXPANSION_DEPTH {
                return Err(DecomposeError::RecursionLimit {
                    operator: target.to_string(),
                    limit: MAX_EXPANSION_DEPTH,
                }
                .into());
            }
            let entry = Arc::clone(entry);
            let site = Site {
                operator: target,
                args: &args,
                kwargs: &kwargs,
            };
            self.depth += 1;
            let result = entry(self, &site);
            self.depth -= 1;
            return result;
        }

        let name = self.fresh_name();
        self.emitted
            .push(TraceNode::call(name.clone(), target, args).with_kwargs(kwargs));
        Ok(ArgValue::Ref(name))
    }

    /// Representative example behind a reference argument, when one exists.
    /// Emitted intermediates have no examples.
    pub fn example(&self, arg: &ArgValue) -> Option<&ExampleValue> {
        match arg {
            ArgValue::Ref(name) => self.examples.get(name),
            _ => None,
        }
    }

    fn fresh_name(&mut self) -> String {
        loop {
            let candidate = format!("{}__{}", self.base, self.fresh);
            self.fresh += 1;
            if self.used_names.insert(candidate.clone()) {
                return candidate;
            }
        }
    }
}

/// Runs the pass once over `trace`.
pub fn decompose(
    trace: &TraceGraph,
    table: &DecompositionTable,
) -> Result<DecomposeOutcome, DecomposeError> {
    if table.is_empty() || !trace.nodes.iter().any(|node| matches_table(node, table)) {
        return Ok(DecomposeOutcome::Unchanged);
    }

    let examples = representative_examples(trace);
    let mut used_names: HashSet<String> =
        trace.nodes.iter().map(|node| node.name.clone()).collect();
    let mut remap: HashMap<String, ArgValue> = HashMap::new();
    let mut nodes = Vec::with_capacity(trace.nodes.len());
    let mut stats = DecomposeStats::default();

    for original in &trace.nodes {
        let node = remap_node(original, &remap);
        let entry = match node.target.as_deref() {
            Some(target) if node.kind == NodeKind::Call => {
                table.lookup(canonical_family(target)).map(Arc::clone)
            }
            _ => None,
        };
        let Some(entry) = entry else {
            nodes.push(node);
            continue;
        };

        let family = node
            .target
            .as_deref()
            .map(canonical_family)
            .unwrap_or_default()
            .to_string();
        let operator = node.target.clone().unwrap_or_default();
        let mut retracer = Retracer {
            emitted: Vec::new(),
            examples: &examples,
            table,
            used_names: &mut used_names,
            base: node.name.clone(),
            fresh: 0,
            depth: 0,
        };
        let site = Site {
            operator: &operator,
            args: &node.args,
            kwargs: &node.kwargs,
        };
        match entry(&mut retracer, &site) {
            Ok(replacement) => {
                let emitted = retracer.emitted;
                debug!(
                    "expanded '{}' ({family}) into {} primitive nodes",
                    node.name,
                    emitted.len()
                );
                nodes.extend(emitted);
                remap.insert(node.name.clone(), replacement);
                stats.expanded += 1;
            }
            Err(err) => match err.downcast::<DecomposeError>() {
                Ok(fatal) => return Err(fatal),
                Err(err) => {
                    debug!("keeping '{}' verbatim: {err:#}", node.name);
                    stats.incomplete.push(family);
                    nodes.push(node);
                }
            },
        }
    }

    Ok(DecomposeOutcome::Rewritten {
        trace: TraceGraph::new(trace.name.clone(), nodes),
        stats,
    })
}

fn matches_table(node: &TraceNode, table: &DecompositionTable) -> bool {
    node.kind == NodeKind::Call
        && node
            .target
            .as_deref()
            .is_some_and(|target| table.contains(canonical_family(target)))
}

/// Representative example value for every Input node: recorded example first,
/// else a zero-filled descriptor of the declared shape/dtype, else a default
/// scalar.
fn representative_examples(trace: &TraceGraph) -> BTreeMap<String, ExampleValue> {
    let mut examples = BTreeMap::new();
    for node in &trace.nodes {
        if node.kind != NodeKind::Input {
            continue;
        }
        let example = if let Some(example) = &node.meta.example {
            example.clone()
        } else if let Some(tensor) = &node.meta.tensor {
            let ty = meta_to_type(tensor);
            let literal = ty
                .byte_len()
                .map(|len| TensorLiteral::new(ty.clone(), Arc::<[u8]>::from(vec![0u8; len])));
            ExampleValue::Tensor { ty, literal }
        } else {
            ExampleValue::Int(0)
        };
        examples.insert(node.name.clone(), example);
    }
    examples
}

fn meta_to_type(meta: &TensorMeta) -> TensorType {
    let dims = meta
        .dims
        .iter()
        .enumerate()
        .map(|(dim_index, dim)| match dim {
            TraceDim::Concrete(extent) => Dimension::Static(*extent),
            TraceDim::Symbolic { name: Some(name) } => Dimension::Dynamic(DimSymbol::new(name)),
            TraceDim::Symbolic { name: None } => {
                Dimension::Dynamic(DimSymbol::new(format!("d{dim_index}")))
            }
        })
        .collect::<Vec<_>>();
    TensorType::new(meta.dtype, Shape::new(dims), meta.device)
}

fn remap_node(node: &TraceNode, remap: &HashMap<String, ArgValue>) -> TraceNode {
    if remap.is_empty() {
        return node.clone();
    }
    let mut node = node.clone();
    for arg in &mut node.args {
        remap_arg(arg, remap);
    }
    for arg in node.kwargs.values_mut() {
        remap_arg(arg, remap);
    }
    node
}

fn remap_arg(arg: &mut ArgValue, remap: &HashMap<String, ArgValue>) {
    match arg {
        ArgValue::Ref(name) => {
            if let Some(replacement) = remap.get(name) {
                *arg = replacement.clone();
            }
        }
        ArgValue::Seq(elements) | ArgValue::Tuple(elements) => {
            for element in elements {
                remap_arg(element, remap);
            }
        }
        ArgValue::Slice { start, stop, step } => {
            remap_arg(start, remap);
            remap_arg(stop, remap);
            remap_arg(step, remap);
        }
        _ => {}
    }
}
