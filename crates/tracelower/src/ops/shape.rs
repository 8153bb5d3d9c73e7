//! Shape inference helpers shared by the stock lowering entries.

use anyhow::{Result, bail};

use crate::graph::{Dimension, Shape, TensorType};

/// Resolves a possibly negative axis against a rank. Rank 0 has no valid
/// axes; callers taking an axis on a scalar get an error, never a panic.
pub fn normalize_axis(axis: i64, rank: usize) -> Result<usize> {
    let rank_i = rank as i64;
    let resolved = if axis < 0 { axis + rank_i } else { axis };
    if resolved < 0 || resolved >= rank_i {
        bail!("axis {axis} out of range for rank {rank}");
    }
    Ok(resolved as usize)
}

/// Trailing-aligned broadcast of two shapes. A static 1 broadcasts against
/// anything; symbolic extents must match the other side exactly.
pub fn broadcast_shapes(lhs: &Shape, rhs: &Shape) -> Result<Shape> {
    let rank = lhs.rank().max(rhs.rank());
    let mut dims = Vec::with_capacity(rank);
    for offset in (1..=rank).rev() {
        let left = lhs.rank().checked_sub(offset).map(|i| &lhs.dims()[i]);
        let right = rhs.rank().checked_sub(offset).map(|i| &rhs.dims()[i]);
        let dim = match (left, right) {
            (Some(dim), None) | (None, Some(dim)) => dim.clone(),
            (Some(Dimension::Static(1)), Some(dim)) | (Some(dim), Some(Dimension::Static(1))) => {
                dim.clone()
            }
            (Some(left), Some(right)) => {
                if left != right {
                    bail!("cannot broadcast {lhs} with {rhs}");
                }
                left.clone()
            }
            (None, None) => unreachable!("offset bounded by max rank"),
        };
        dims.push(dim);
    }
    Ok(Shape::new(dims))
}

/// Result type of a matrix product. Supports 2-D x 2-D, batched lhs against a
/// 2-D rhs, and rank-3 x rank-3 with matching batch.
pub fn matmul_type(lhs: &TensorType, rhs: &TensorType) -> Result<TensorType> {
    let lhs_dims = lhs.shape.dims();
    let rhs_dims = rhs.shape.dims();
    if lhs_dims.len() < 2 || rhs_dims.len() < 2 {
        bail!(
            "matmul requires rank >= 2 operands, got {} x {}",
            lhs.shape,
            rhs.shape
        );
    }

    let inner_lhs = &lhs_dims[lhs_dims.len() - 1];
    let inner_rhs = &rhs_dims[rhs_dims.len() - 2];
    if let (Dimension::Static(a), Dimension::Static(b)) = (inner_lhs, inner_rhs) {
        if a != b {
            bail!(
                "matmul inner extents disagree: {} x {}",
                lhs.shape,
                rhs.shape
            );
        }
    }

    let dims = if rhs_dims.len() == 2 {
        // 2-D rhs against a (possibly batched) lhs.
        let mut dims = lhs_dims[..lhs_dims.len() - 1].to_vec();
        dims.push(rhs_dims[1].clone());
        dims
    } else if lhs_dims.len() == 3 && rhs_dims.len() == 3 {
        if lhs_dims[0] != rhs_dims[0] {
            bail!(
                "batched matmul batch extents disagree: {} x {}",
                lhs.shape,
                rhs.shape
            );
        }
        vec![
            lhs_dims[0].clone(),
            lhs_dims[1].clone(),
            rhs_dims[2].clone(),
        ]
    } else {
        bail!(
            "unsupported matmul operand ranks: {} x {}",
            lhs.shape,
            rhs.shape
        );
    };

    Ok(TensorType::new(lhs.dtype, Shape::new(dims), lhs.device))
}

/// Shape after reducing `axes` (already normalized, unique).
pub fn reduce_shape(shape: &Shape, axes: &[usize], keepdims: bool) -> Shape {
    let dims = shape
        .dims()
        .iter()
        .enumerate()
        .filter_map(|(index, dim)| {
            if axes.contains(&index) {
                keepdims.then_some(Dimension::Static(1))
            } else {
                Some(dim.clone())
            }
        })
        .collect::<Vec<_>>();
    Shape::new(dims)
}

/// Shape after applying a permutation.
pub fn permute_shape(shape: &Shape, perm: &[usize]) -> Result<Shape> {
    let rank = shape.rank();
    if perm.len() != rank {
        bail!("permutation length {} does not match rank {rank}", perm.len());
    }
    let mut seen = vec![false; rank];
    let mut dims = Vec::with_capacity(rank);
    for &axis in perm {
        if axis >= rank || seen[axis] {
            bail!("invalid permutation {perm:?} for rank {rank}");
        }
        seen[axis] = true;
        dims.push(shape.dims()[axis].clone());
    }
    Ok(Shape::new(dims))
}

/// Result type of concatenating tensors along `axis`. Non-concat axes must
/// agree; the concat axis must be static on every operand.
pub fn concat_type(types: &[&TensorType], axis: usize) -> Result<TensorType> {
    let first = types
        .first()
        .ok_or_else(|| anyhow::anyhow!("concat requires at least one tensor"))?;
    let rank = first.shape.rank();
    if axis >= rank {
        bail!("concat axis {axis} out of range for rank {rank}");
    }
    let mut total = 0usize;
    for ty in types {
        if ty.shape.rank() != rank {
            bail!("concat operands must share rank");
        }
        if ty.dtype != first.dtype {
            bail!("concat operands must share dtype");
        }
        for (index, (dim, expected)) in
            ty.shape.dims().iter().zip(first.shape.dims()).enumerate()
        {
            if index == axis {
                match dim {
                    Dimension::Static(extent) => total += extent,
                    Dimension::Dynamic(_) => {
                        bail!("concat axis must be static on every operand")
                    }
                }
            } else if dim != expected {
                bail!("concat operands disagree on non-concat axis {index}");
            }
        }
    }
    let mut dims = first.shape.dims().to_vec();
    dims[axis] = Dimension::Static(total);
    Ok(TensorType::new(first.dtype, Shape::new(dims), first.device))
}

/// Extent of a sliced axis given resolved bounds.
pub fn slice_extent(extent: usize, start: usize, stop: Option<usize>, step: usize) -> usize {
    let stop = stop.unwrap_or(extent).min(extent);
    if start >= stop {
        return 0;
    }
    (stop - start).div_ceil(step)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::DimSymbol;

    #[test]
    fn broadcast_aligns_trailing_dims() {
        let lhs = Shape::from_static(&[4, 1, 3]);
        let rhs = Shape::from_static(&[2, 3]);
        let result = broadcast_shapes(&lhs, &rhs).expect("broadcast");
        assert_eq!(result, Shape::from_static(&[4, 2, 3]));
    }

    #[test]
    fn broadcast_keeps_matching_symbols() {
        let symbol = DimSymbol::new("n");
        let lhs = Shape::new(vec![
            Dimension::Dynamic(symbol.clone()),
            Dimension::Static(3),
        ]);
        let rhs = Shape::from_static(&[1, 3]);
        let result = broadcast_shapes(&lhs, &rhs).expect("broadcast");
        assert_eq!(result.dims()[0], Dimension::Dynamic(symbol));
    }

    #[test]
    fn broadcast_rejects_conflicting_extents() {
        let lhs = Shape::from_static(&[2, 3]);
        let rhs = Shape::from_static(&[4, 3]);
        assert!(broadcast_shapes(&lhs, &rhs).is_err());
    }

    #[test]
    fn reduce_shape_with_and_without_keepdims() {
        let shape = Shape::from_static(&[2, 3, 4]);
        assert_eq!(
            reduce_shape(&shape, &[1], true),
            Shape::from_static(&[2, 1, 4])
        );
        assert_eq!(reduce_shape(&shape, &[1], false), Shape::from_static(&[2, 4]));
    }

    #[test]
    fn slice_extent_handles_steps_and_clamping() {
        assert_eq!(slice_extent(10, 2, Some(8), 2), 3);
        assert_eq!(slice_extent(10, 0, None, 1), 10);
        assert_eq!(slice_extent(10, 4, Some(100), 3), 2);
        assert_eq!(slice_extent(10, 8, Some(4), 1), 0);
    }

    #[test]
    fn normalize_axis_accepts_negatives() {
        assert_eq!(normalize_axis(-1, 3).expect("axis"), 2);
        assert!(normalize_axis(3, 3).is_err());
    }

    #[test]
    fn normalize_axis_rejects_every_axis_on_rank_zero() {
        assert!(normalize_axis(0, 0).is_err());
        assert!(normalize_axis(-1, 0).is_err());
    }
}
