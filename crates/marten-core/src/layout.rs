use crate::error::{Error, Result};
use crate::shape::Shape;

// Layout: shape + strides + offset
//
// The Layout decouples the logical shape of a tensor from how its data sits
// in storage. Transpose, slice, expand and most reshapes only rewrite the
// layout; the storage handle is shared.
//
//   transpose  permute shape and strides together
//   slice      move the offset to the first kept element, multiply the
//              stride by the step
//   expand     give every broadcast axis a stride of 0
//
// A layout is contiguous when it reads storage front to back with no gaps.
// Kernels that want flat memory call `Backend::to_contiguous` first.

/// Layout describes how a tensor's logical shape maps to flat storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    shape: Shape,
    strides: Vec<usize>,
    /// Offset into the storage buffer where this tensor's data starts.
    offset: usize,
}

impl Layout {
    /// Row-major layout for the given shape.
    pub fn contiguous(shape: Shape) -> Self {
        let strides = shape.stride_contiguous();
        Layout {
            shape,
            strides,
            offset: 0,
        }
    }

    /// Layout with explicit strides and offset (for views).
    pub fn new(shape: Shape, strides: Vec<usize>, offset: usize) -> Self {
        Layout {
            shape,
            strides,
            offset,
        }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    pub fn elem_count(&self) -> usize {
        self.shape.elem_count()
    }

    /// Row-major order over the non-unit axes, any offset.
    fn is_row_major(&self) -> bool {
        let expected = self.shape.stride_contiguous();
        self.dims()
            .iter()
            .zip(self.strides.iter().zip(&expected))
            .all(|(&d, (&s, &e))| d == 1 || s == e)
    }

    /// Reads storage front to back starting at 0.
    pub fn is_contiguous(&self) -> bool {
        self.offset == 0 && self.is_row_major()
    }

    /// Reinterpret the same elements under a new shape without moving data.
    /// Returns `None` when the layout is not row-major; the caller has to
    /// materialize first.
    pub fn reshaped(&self, shape: &Shape) -> Option<Layout> {
        if shape.elem_count() != self.elem_count() || !self.is_row_major() {
            return None;
        }
        Some(Layout::new(
            shape.clone(),
            shape.stride_contiguous(),
            self.offset,
        ))
    }

    /// Reorder axes: output axis `i` is input axis `perm[i]`.
    ///
    /// Example: [2, 3, 4] with perm [2, 0, 1] becomes [4, 2, 3].
    pub fn permute(&self, perm: &[usize]) -> Result<Layout> {
        let rank = self.rank();
        if perm.len() != rank {
            return Err(Error::RankMismatch {
                expected: rank,
                got: perm.len(),
            });
        }
        let mut seen = vec![false; rank];
        for &p in perm {
            if p >= rank || seen[p] {
                return Err(Error::msg(format!(
                    "invalid permutation {perm:?} for rank {rank}"
                )));
            }
            seen[p] = true;
        }
        let dims = perm.iter().map(|&p| self.dims()[p]).collect();
        let strides = perm.iter().map(|&p| self.strides[p]).collect();
        Ok(Layout::new(Shape::new(dims), strides, self.offset))
    }

    /// Swap two axes.
    pub fn transpose(&self, dim0: usize, dim1: usize) -> Result<Layout> {
        let rank = self.rank();
        if dim0 >= rank || dim1 >= rank {
            return Err(Error::DimOutOfRange {
                dim: dim0.max(dim1) as i64,
                rank,
            });
        }
        let mut perm: Vec<usize> = (0..rank).collect();
        perm.swap(dim0, dim1);
        self.permute(&perm)
    }

    /// Keep `len` elements along `dim`, starting at `start` and moving by `step`.
    ///
    /// Example: [4, 6] slice(dim=1, start=1, len=3, step=2) keeps columns
    /// 1, 3, 5: shape [4, 3], offset += 1, stride[1] *= 2.
    pub fn slice(&self, dim: usize, start: usize, len: usize, step: usize) -> Result<Layout> {
        let rank = self.rank();
        if dim >= rank {
            return Err(Error::DimOutOfRange {
                dim: dim as i64,
                rank,
            });
        }
        let size = self.dims()[dim];
        let step = step.max(1);
        if len > 0 && start + (len - 1) * step >= size {
            return Err(Error::msg(format!(
                "slice out of bounds: dim {dim}, start {start}, len {len}, step {step}, size {size}"
            )));
        }
        let mut dims = self.dims().to_vec();
        dims[dim] = len;
        let mut strides = self.strides.clone();
        let offset = self.offset + start * strides[dim];
        strides[dim] *= step;
        Ok(Layout::new(Shape::new(dims), strides, offset))
    }

    /// Contiguous slice along `dim`.
    pub fn narrow(&self, dim: usize, start: usize, len: usize) -> Result<Layout> {
        self.slice(dim, start, len, 1)
    }

    /// View this layout as `target` by repeating size-1 axes.
    ///
    /// The shape is first left-padded with 1s; every axis that grows gets
    /// stride 0.
    pub fn broadcast_as(&self, target: &Shape) -> Result<Layout> {
        let rank = target.rank();
        if self.rank() > rank {
            return Err(Error::BroadcastIncompatible {
                lhs: self.shape.clone(),
                rhs: target.clone(),
            });
        }
        let pad = rank - self.rank();
        let mut strides = vec![0usize; rank];
        for (i, &t) in target.dims().iter().enumerate() {
            if i < pad {
                continue;
            }
            let d = self.dims()[i - pad];
            if d == t {
                strides[i] = if d == 1 { 0 } else { self.strides[i - pad] };
            } else if d != 1 {
                return Err(Error::BroadcastIncompatible {
                    lhs: self.shape.clone(),
                    rhs: target.clone(),
                });
            }
        }
        Ok(Layout::new(target.clone(), strides, self.offset))
    }

    /// Storage offset of a multi-index:
    /// `offset + sum(index[i] * stride[i])`.
    pub fn flat_index(&self, index: &[usize]) -> usize {
        let mut flat = self.offset;
        for (i, &idx) in index.iter().enumerate() {
            flat += idx * self.strides[i];
        }
        flat
    }

    /// Storage offsets of every element, in logical row-major order.
    pub fn strided_indices(&self) -> StridedIter {
        StridedIter::new(self)
    }
}

// StridedIter: walks the logical elements of a layout in order and yields
// the storage index of each one. For a contiguous layout this counts
// 0, 1, 2, ...; for a transposed or broadcast one it jumps (or stays put on
// stride-0 axes).

/// Iterator that yields flat storage indices for each element of a Layout.
pub struct StridedIter {
    current: Vec<usize>,
    dims: Vec<usize>,
    strides: Vec<usize>,
    /// Storage index of `current`, kept incrementally.
    flat: usize,
    remaining: usize,
    started: bool,
}

impl StridedIter {
    fn new(layout: &Layout) -> Self {
        StridedIter {
            current: vec![0; layout.rank()],
            dims: layout.dims().to_vec(),
            strides: layout.strides().to_vec(),
            flat: layout.offset(),
            remaining: layout.elem_count(),
            started: false,
        }
    }

    /// Advance the multi-index by one, rightmost axis first.
    fn advance(&mut self) {
        for i in (0..self.dims.len()).rev() {
            self.current[i] += 1;
            self.flat += self.strides[i];
            if self.current[i] < self.dims[i] {
                return;
            }
            self.flat -= self.current[i] * self.strides[i];
            self.current[i] = 0;
        }
    }
}

impl Iterator for StridedIter {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.remaining == 0 {
            return None;
        }
        if self.started {
            self.advance();
        }
        self.started = true;
        self.remaining -= 1;
        Some(self.flat)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for StridedIter {}
