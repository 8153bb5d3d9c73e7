//! Stock decompositions: composite operators rewritten into the primitive
//! families the stock table lowers directly.

use std::collections::BTreeMap;

use anyhow::{Result, bail};

use crate::decompose::{Retracer, Site};
use crate::trace::ArgValue;

fn no_kwargs() -> BTreeMap<String, ArgValue> {
    BTreeMap::new()
}

fn scalar_of(arg: Option<&ArgValue>, default: f64) -> Result<f64> {
    match arg {
        None => Ok(default),
        Some(ArgValue::Int(value)) => Ok(*value as f64),
        Some(ArgValue::Float(value)) => Ok(*value),
        Some(other) => bail!("expected a scalar factor, got {other:?}"),
    }
}

/// `addmm(bias, mat1, mat2, beta=1, alpha=1)` → `beta*bias + alpha*(mat1 @ mat2)`.
pub fn addmm(rt: &mut Retracer<'_>, site: &Site<'_>) -> Result<ArgValue> {
    let bias = site.arg(0)?.clone();
    let mat1 = site.arg(1)?.clone();
    let mat2 = site.arg(2)?.clone();
    let beta = scalar_of(site.arg_or_kwarg(3, "beta"), 1.0)?;
    let alpha = scalar_of(site.arg_or_kwarg(4, "alpha"), 1.0)?;

    let mut product = rt.emit("aten.mm", vec![mat1, mat2], no_kwargs())?;
    if alpha != 1.0 {
        product = rt.emit(
            "aten.mul",
            vec![product, ArgValue::Float(alpha)],
            no_kwargs(),
        )?;
    }
    let mut scaled_bias = bias;
    if beta != 1.0 {
        scaled_bias = rt.emit(
            "aten.mul",
            vec![scaled_bias, ArgValue::Float(beta)],
            no_kwargs(),
        )?;
    }
    rt.emit("aten.add", vec![scaled_bias, product], no_kwargs())
}

/// `linear(input, weight, bias=None)` → `input @ weight.T (+ bias)`.
pub fn linear(rt: &mut Retracer<'_>, site: &Site<'_>) -> Result<ArgValue> {
    let input = site.arg(0)?.clone();
    let weight = site.arg(1)?.clone();
    let transposed = rt.emit("aten.t", vec![weight], no_kwargs())?;
    let product = rt.emit("aten.matmul", vec![input, transposed], no_kwargs())?;
    match site.arg_or_kwarg(2, "bias") {
        Some(bias) => rt.emit("aten.add", vec![product, bias.clone()], no_kwargs()),
        None => Ok(product),
    }
}

/// `silu(x)` → `x * sigmoid(x)`.
pub fn silu(rt: &mut Retracer<'_>, site: &Site<'_>) -> Result<ArgValue> {
    let input = site.arg(0)?.clone();
    let gate = rt.emit("aten.sigmoid", vec![input.clone()], no_kwargs())?;
    rt.emit("aten.mul", vec![input, gate], no_kwargs())
}

/// Numerically stable softmax over one axis:
/// `exp(x - amax(x)) / sum(exp(x - amax(x)))`.
pub fn softmax(rt: &mut Retracer<'_>, site: &Site<'_>) -> Result<ArgValue> {
    let input = site.arg(0)?.clone();
    let dim = site
        .arg_or_kwarg(1, "dim")
        .cloned()
        .unwrap_or(ArgValue::Int(-1));
    let dims = ArgValue::Seq(vec![dim]);

    let peak = rt.emit(
        "aten.amax",
        vec![input.clone(), dims.clone(), ArgValue::Bool(true)],
        no_kwargs(),
    )?;
    let shifted = rt.emit("aten.sub", vec![input, peak], no_kwargs())?;
    let exped = rt.emit("aten.exp", vec![shifted], no_kwargs())?;
    let total = rt.emit(
        "aten.sum",
        vec![exped.clone(), dims, ArgValue::Bool(true)],
        no_kwargs(),
    )?;
    rt.emit("aten.div", vec![exped, total], no_kwargs())
}
