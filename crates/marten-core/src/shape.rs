use std::fmt;

use crate::error::{Error, Result};

// Shape: N-dimensional shape representation
//
// A Shape describes the size of each dimension of a tensor:
//   - Scalar: Shape([])          0 dimensions, 1 element
//   - Vector: Shape([5])         1 dimension, 5 elements
//   - Matrix: Shape([3, 4])      2 dimensions, 12 elements
//
// Row-major strides give every size-1 axis a stride of 0. Moving along such
// an axis never leaves the sole element, so a broadcast view and a genuine
// size-1 axis share one stride rule and no element is ever duplicated in
// memory.

/// N-dimensional shape of a tensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Shape(Vec<usize>);

impl Shape {
    pub fn new(dims: Vec<usize>) -> Self {
        Shape(dims)
    }

    /// Shape from signed dims, as found in model files.
    pub fn from_i64(dims: &[i64]) -> Result<Self> {
        dims.iter()
            .map(|&d| {
                usize::try_from(d).map_err(|_| Error::msg(format!("negative dimension {d}")))
            })
            .collect::<Result<Vec<_>>>()
            .map(Shape)
    }

    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    /// Number of dimensions (0 for scalar).
    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Total number of elements. A scalar has one element; any zero-sized
    /// axis makes the whole tensor empty.
    pub fn elem_count(&self) -> usize {
        self.0.iter().product()
    }

    /// Row-major strides, with 0 for every size-1 axis.
    ///
    /// For shape [2, 1, 4] the strides are [4, 0, 1].
    pub fn stride_contiguous(&self) -> Vec<usize> {
        let mut strides = vec![0usize; self.rank()];
        let mut acc = 1usize;
        for i in (0..self.rank()).rev() {
            strides[i] = if self.0[i] == 1 { 0 } else { acc };
            acc *= self.0[i];
        }
        strides
    }

    /// Size of a specific dimension.
    pub fn dim(&self, d: usize) -> Result<usize> {
        self.0.get(d).copied().ok_or(Error::DimOutOfRange {
            dim: d as i64,
            rank: self.rank(),
        })
    }

    /// Left-pad with 1s up to `rank`. Shapes already at least that long are
    /// returned unchanged.
    pub fn pad_left(&self, rank: usize) -> Shape {
        if self.rank() >= rank {
            return self.clone();
        }
        let mut dims = vec![1; rank - self.rank()];
        dims.extend_from_slice(&self.0);
        Shape(dims)
    }

    // Broadcasting

    /// Align two shapes for an element-wise binary operation.
    ///
    /// Returns the left-padded `a`, left-padded `b` and the result shape.
    /// Equal shapes are returned as they are. Otherwise the shorter shape is
    /// padded with leading 1s and each result axis is the larger of the two
    /// sizes; an axis is compatible only if the sizes match or one is 1.
    ///
    ///   [2, 2] and [2]     -> [2, 2], [1, 2], result [2, 2]
    ///   [3] and [2, 2]     -> error
    pub fn align(a: &Shape, b: &Shape) -> Result<(Shape, Shape, Shape)> {
        if a == b {
            return Ok((a.clone(), b.clone(), a.clone()));
        }
        let rank = a.rank().max(b.rank());
        let pa = a.pad_left(rank);
        let pb = b.pad_left(rank);
        let mut result = Vec::with_capacity(rank);
        for (&da, &db) in pa.dims().iter().zip(pb.dims()) {
            if da == db || db == 1 {
                result.push(da);
            } else if da == 1 {
                result.push(db);
            } else {
                return Err(Error::BroadcastIncompatible {
                    lhs: a.clone(),
                    rhs: b.clone(),
                });
            }
        }
        Ok((pa, pb, Shape(result)))
    }

    /// The broadcast result shape of two shapes.
    pub fn broadcast_shape(lhs: &Shape, rhs: &Shape) -> Result<Shape> {
        Shape::align(lhs, rhs).map(|(_, _, out)| out)
    }

    /// Resolve a reshape target against an element count.
    ///
    /// At most one axis may be `-1`; its size is inferred from the others.
    /// Zero-copy semantics (`0` meaning "keep the input dim") are resolved by
    /// the caller, here `0` is a literal empty axis.
    pub fn resolve_reshape(spec: &[i64], elem_count: usize) -> Result<Shape> {
        let mut inferred = None;
        let mut known = 1usize;
        let mut dims = Vec::with_capacity(spec.len());
        for (i, &d) in spec.iter().enumerate() {
            match d {
                -1 => {
                    if inferred.is_some() {
                        return Err(Error::MultipleInferredAxes {
                            spec: spec.to_vec(),
                        });
                    }
                    inferred = Some(i);
                    dims.push(1);
                }
                d if d < 0 => {
                    return Err(Error::msg(format!(
                        "invalid reshape dimension {d} in {spec:?}"
                    )))
                }
                d => {
                    known *= d as usize;
                    dims.push(d as usize);
                }
            }
        }
        if let Some(axis) = inferred {
            if known == 0 || elem_count % known != 0 {
                return Err(Error::InferredAxisNotDivisible {
                    spec: spec.to_vec(),
                    elem_count,
                });
            }
            dims[axis] = elem_count / known;
        } else if known != elem_count {
            return Err(Error::ReshapeElementMismatch {
                src: elem_count,
                dst: known,
                dst_shape: Shape(dims),
            });
        }
        Ok(Shape(dims))
    }
}

/// Normalize a possibly negative axis against a rank.
pub fn normalize_axis(axis: i64, rank: usize) -> Result<usize> {
    let r = rank as i64;
    let a = if axis < 0 { axis + r } else { axis };
    if a < 0 || a >= r {
        return Err(Error::DimOutOfRange { dim: axis, rank });
    }
    Ok(a as usize)
}

/// Linear position in row-major order to a multi-index.
pub fn unravel_index(mut pos: usize, dims: &[usize]) -> Vec<usize> {
    let mut index = vec![0; dims.len()];
    for i in (0..dims.len()).rev() {
        if dims[i] > 0 {
            index[i] = pos % dims[i];
            pos /= dims[i];
        }
    }
    index
}

/// Multi-index to a storage offset under the given strides.
pub fn ravel_index(index: &[usize], strides: &[usize]) -> usize {
    index.iter().zip(strides).map(|(i, s)| i * s).sum()
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", d)?;
        }
        write!(f, "]")
    }
}

impl From<()> for Shape {
    /// Scalar shape (0 dimensions).
    fn from(_: ()) -> Self {
        Shape(vec![])
    }
}

impl From<usize> for Shape {
    fn from(d: usize) -> Self {
        Shape(vec![d])
    }
}

impl From<(usize, usize)> for Shape {
    fn from((d0, d1): (usize, usize)) -> Self {
        Shape(vec![d0, d1])
    }
}

impl From<(usize, usize, usize)> for Shape {
    fn from((d0, d1, d2): (usize, usize, usize)) -> Self {
        Shape(vec![d0, d1, d2])
    }
}

impl From<(usize, usize, usize, usize)> for Shape {
    fn from((d0, d1, d2, d3): (usize, usize, usize, usize)) -> Self {
        Shape(vec![d0, d1, d2, d3])
    }
}

impl From<Vec<usize>> for Shape {
    fn from(v: Vec<usize>) -> Self {
        Shape(v)
    }
}

impl From<&[usize]> for Shape {
    fn from(s: &[usize]) -> Self {
        Shape(s.to_vec())
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(s: [usize; N]) -> Self {
        Shape(s.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_shape() {
        let s = Shape::from(());
        assert_eq!(s.rank(), 0);
        assert_eq!(s.elem_count(), 1);
        assert_eq!(s.stride_contiguous(), Vec::<usize>::new());
    }

    #[test]
    fn test_empty_axis() {
        assert_eq!(Shape::from((3, 0)).elem_count(), 0);
    }

    #[test]
    fn test_3d_strides() {
        let s = Shape::from((2, 3, 4));
        assert_eq!(s.stride_contiguous(), vec![12, 4, 1]);
        assert_eq!(s.elem_count(), 24);
    }

    #[test]
    fn test_unit_axes_have_zero_stride() {
        assert_eq!(Shape::from((2, 1, 4)).stride_contiguous(), vec![4, 0, 1]);
        assert_eq!(Shape::from((1, 3)).stride_contiguous(), vec![0, 1]);
        assert_eq!(Shape::from((1, 1)).stride_contiguous(), vec![0, 0]);
    }

    #[test]
    fn test_align_pads_shorter() {
        let (a, b, out) = Shape::align(&Shape::from((2, 2)), &Shape::from(2)).unwrap();
        assert_eq!(a.dims(), &[2, 2]);
        assert_eq!(b.dims(), &[1, 2]);
        assert_eq!(out.dims(), &[2, 2]);
    }

    #[test]
    fn test_align_both_sides() {
        let out =
            Shape::broadcast_shape(&Shape::from((5, 3, 1)), &Shape::from((3, 4))).unwrap();
        assert_eq!(out.dims(), &[5, 3, 4]);
    }

    #[test]
    fn test_align_incompatible() {
        let err = Shape::align(&Shape::from(3), &Shape::from((2, 2))).unwrap_err();
        assert!(matches!(err, Error::BroadcastIncompatible { .. }));
    }

    #[test]
    fn test_resolve_reshape() {
        let s = Shape::resolve_reshape(&[2, -1], 6).unwrap();
        assert_eq!(s.dims(), &[2, 3]);
        assert!(matches!(
            Shape::resolve_reshape(&[-1, -1], 6),
            Err(Error::MultipleInferredAxes { .. })
        ));
        assert!(matches!(
            Shape::resolve_reshape(&[4, -1], 6),
            Err(Error::InferredAxisNotDivisible { .. })
        ));
        assert!(matches!(
            Shape::resolve_reshape(&[4, 2], 6),
            Err(Error::ReshapeElementMismatch { .. })
        ));
    }

    #[test]
    fn test_unravel_ravel() {
        let dims = [2, 3, 4];
        let strides = Shape::from((2, 3, 4)).stride_contiguous();
        for pos in 0..24 {
            let idx = unravel_index(pos, &dims);
            assert_eq!(ravel_index(&idx, &strides), pos);
        }
        assert_eq!(unravel_index(23, &dims), vec![1, 2, 3]);
    }

    #[test]
    fn test_normalize_axis() {
        assert_eq!(normalize_axis(-1, 3).unwrap(), 2);
        assert_eq!(normalize_axis(0, 3).unwrap(), 0);
        assert!(normalize_axis(3, 3).is_err());
        assert!(normalize_axis(-4, 3).is_err());
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", Shape::from((3, 4))), "[3, 4]");
    }
}
