//! Stock operator tables: lowering entries for the common operator families
//! and a handful of standard decompositions.
//!
//! Both tables are plain data the engine consumes; callers can build their
//! own from scratch or extend a copy of these.

pub mod decompositions;
pub mod lowerings;
pub mod shape;

use once_cell::sync::Lazy;

use crate::decompose::DecompositionTable;
use crate::graph::{BinaryOp, ReduceKind, UnaryOp};
use crate::lower::table::TranslationTable;

static STANDARD_TABLE: Lazy<TranslationTable> = Lazy::new(build_standard_table);
static STANDARD_DECOMPOSITIONS: Lazy<DecompositionTable> = Lazy::new(build_standard_decompositions);

/// Lowering entries for the common operator families.
pub fn standard_table() -> &'static TranslationTable {
    &STANDARD_TABLE
}

/// Standard decompositions of composite operators into stock primitives.
pub fn standard_decompositions() -> &'static DecompositionTable {
    &STANDARD_DECOMPOSITIONS
}

fn build_standard_table() -> TranslationTable {
    let mut table = TranslationTable::new();

    for family in ["aten.clone", "aten.detach", "aten.contiguous", "aten.alias"] {
        table.register(family, lowerings::identity);
    }

    table.register("aten.abs", lowerings::unary(UnaryOp::Abs));
    table.register("aten.neg", lowerings::unary(UnaryOp::Neg));
    table.register("aten.relu", lowerings::unary(UnaryOp::Relu));
    table.register("aten.sigmoid", lowerings::unary(UnaryOp::Sigmoid));
    table.register("aten.exp", lowerings::unary(UnaryOp::Exp));
    table.register("aten.log", lowerings::unary(UnaryOp::Log));
    table.register("aten.sqrt", lowerings::unary(UnaryOp::Sqrt));
    table.register("aten.tanh", lowerings::unary(UnaryOp::Tanh));

    table.register("aten.add", lowerings::binary_with_alpha(BinaryOp::Add));
    table.register("aten.sub", lowerings::binary_with_alpha(BinaryOp::Sub));
    table.register("aten.mul", lowerings::binary(BinaryOp::Mul));
    table.register("aten.div", lowerings::binary(BinaryOp::Div));
    table.register("aten.pow", lowerings::binary(BinaryOp::Pow));
    table.register("aten.maximum", lowerings::binary(BinaryOp::Maximum));
    table.register("aten.minimum", lowerings::binary(BinaryOp::Minimum));

    for family in ["aten.matmul", "aten.mm", "aten.bmm"] {
        table.register(family, lowerings::matmul);
    }

    table.register("aten.t", lowerings::t);
    table.register("aten.transpose", lowerings::transpose);
    table.register("aten.permute", lowerings::permute);

    table.register("aten.reshape", lowerings::reshape);
    table.register("aten.view", lowerings::reshape);

    table.register("aten.cat", lowerings::cat);

    table.register("aten.sum", lowerings::reduce(ReduceKind::Sum));
    table.register("aten.mean", lowerings::reduce(ReduceKind::Mean));
    table.register("aten.amax", lowerings::reduce(ReduceKind::Max));

    table.register("aten.slice", lowerings::slice);
    table.register("aten.split", lowerings::split);
    table.register("aten.to", lowerings::to);
    table.register("operator.getitem", lowerings::getitem);
    table.register("aten.sym_size", lowerings::sym_size);

    table
}

fn build_standard_decompositions() -> DecompositionTable {
    let mut table = DecompositionTable::new();
    table.register("aten.addmm", decompositions::addmm);
    table.register("aten.linear", decompositions::linear);
    table.register("aten.silu", decompositions::silu);
    table.register("aten.softmax", decompositions::softmax);
    table.register("aten._softmax", decompositions::softmax);
    table
}
