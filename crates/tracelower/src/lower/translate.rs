//! Per-call dispatch: canonicalize the operator, convert arguments, invoke
//! the looked-up lowering capability, bind the result.

use std::collections::BTreeMap;

use log::trace;

use crate::graph::GraphBuilder;
use crate::lower::LowerError;
use crate::lower::binding::Bindings;
use crate::lower::table::{CallArgs, LowerScope, TranslationTable};
use crate::trace::TraceNode;

/// Strips the overload-specific suffix from an operator identifier, yielding
/// the operator family used as the lookup key.
///
/// A dotted path with three or more segments drops its final segment
/// (`aten.add.Tensor` → `aten.add`); one or two segments are already the
/// family (`operator.getitem`, `relu`).
pub fn canonical_family(target: &str) -> &str {
    let segments = target.split('.').count();
    if segments >= 3 {
        match target.rfind('.') {
            Some(index) => &target[..index],
            None => target,
        }
    } else {
        target
    }
}

pub(super) fn translate_call(
    builder: &mut GraphBuilder,
    bindings: &mut Bindings,
    table: &TranslationTable,
    node_index: usize,
    node: &TraceNode,
) -> Result<(), LowerError> {
    let target = node
        .target
        .as_deref()
        .ok_or_else(|| LowerError::Trace(crate::trace::TraceError::CallWithoutTarget {
            name: node.name.clone(),
        }))?;
    let family = canonical_family(target);

    let mut args = Vec::with_capacity(node.args.len());
    for arg in &node.args {
        args.push(bindings.convert(&node.name, arg)?);
    }
    let mut kwargs = BTreeMap::new();
    for (name, arg) in &node.kwargs {
        kwargs.insert(name.clone(), bindings.convert(&node.name, arg)?);
    }
    let call = CallArgs::new(args, kwargs);

    let entry = table
        .lookup(family)
        .ok_or_else(|| LowerError::UnsupportedOperator {
            node_index,
            operator: target.to_string(),
        })?;

    trace!("lowering node #{node_index} '{}' via '{family}'", node.name);
    let mut scope = LowerScope::new(builder);
    let result = entry(&mut scope, &call).map_err(|cause| LowerError::LoweringFailed {
        node_index,
        operator: target.to_string(),
        args: call.snapshot(),
        cause,
    })?;

    bindings.bind(node.name.clone(), result);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_family_strips_overload_suffixes() {
        assert_eq!(canonical_family("aten.add.Tensor"), "aten.add");
        assert_eq!(canonical_family("aten.view.default"), "aten.view");
        assert_eq!(canonical_family("torch.ops.aten.relu.default"), "torch.ops.aten.relu");
    }

    #[test]
    fn canonical_family_keeps_short_identifiers() {
        assert_eq!(canonical_family("operator.getitem"), "operator.getitem");
        assert_eq!(canonical_family("relu"), "relu");
    }
}
