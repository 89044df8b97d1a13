use std::sync::Arc;

use crate::backend::{
    reduced_shape, Backend, BackendDevice, BackendKind, BinaryOp, ReduceOp, UnaryOp,
};
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::layout::Layout;
use crate::shape::{normalize_axis, unravel_index, Shape};

// Tensor: the backend-generic n-dimensional array
//
// A Tensor is a handle: shared storage + a layout describing which elements
// of that storage it sees, plus the logical dtype and the device that owns
// the storage. Cloning a handle is O(1) and shares storage; structural ops
// (reshape, transpose, slice, expand) return new handles over the same
// storage with a rewritten layout.
//
// Storage lifetime is explicit. `release` consumes the handle and, when it
// was the last one, hands the buffer back to the backend (pooling backends
// keep it for reuse). Dropping a handle without releasing frees the memory
// normally.
//
// Broadcasting is done once here: operands are aligned with `Shape::align`
// and expanded to the result shape with stride-0 layouts before any kernel
// sees them.

/// How `Tensor::pad` fills the new border.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PadMode {
    /// Fill with a constant value.
    #[default]
    Constant,
    /// Mirror the interior, excluding the edge element.
    Reflect,
    /// Repeat the edge element.
    Edge,
}

/// An n-dimensional array of f32 elements on a specific backend.
///
/// # Example
/// ```ignore
/// use marten_core::{DType, Tensor};
/// use marten_cpu::{CpuBackend, CpuDevice};
///
/// let a = Tensor::<CpuBackend>::from_slice(&[1.0, 2.0, 3.0, 4.0], (2, 2), &CpuDevice)?;
/// let b = Tensor::<CpuBackend>::from_slice(&[10.0, 20.0], 2, &CpuDevice)?;
/// let c = a.add(&b)?; // [[11, 22], [13, 24]]
/// ```
pub struct Tensor<B: Backend> {
    storage: Arc<B::Storage>,
    layout: Layout,
    dtype: DType,
    device: B::Device,
}

impl<B: Backend> Clone for Tensor<B> {
    fn clone(&self) -> Self {
        Tensor {
            storage: Arc::clone(&self.storage),
            layout: self.layout.clone(),
            dtype: self.dtype,
            device: self.device.clone(),
        }
    }
}

impl<B: Backend> std::fmt::Debug for Tensor<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Tensor(shape={}, dtype={}, device={})",
            self.layout.shape(),
            self.dtype,
            self.device.name(),
        )
    }
}

impl<B: Backend> Tensor<B> {
    // Internal constructors

    /// Wrap existing storage.
    pub fn from_storage(storage: B::Storage, layout: Layout, dtype: DType, device: B::Device) -> Self {
        Tensor {
            storage: Arc::new(storage),
            layout,
            dtype,
            device,
        }
    }

    /// New handle over the same storage.
    fn view(&self, layout: Layout) -> Self {
        Tensor {
            storage: Arc::clone(&self.storage),
            layout,
            dtype: self.dtype,
            device: self.device.clone(),
        }
    }

    /// Wrap a kernel result that was computed from `self`.
    fn fresh(&self, storage: B::Storage, shape: Shape) -> Self {
        Self::from_storage(
            storage,
            Layout::contiguous(shape),
            self.dtype,
            self.device.clone(),
        )
    }

    // Creation

    /// Create a tensor from host data; values are brought into `dtype`'s
    /// domain first.
    pub fn from_vec(
        data: Vec<f32>,
        shape: impl Into<Shape>,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Self> {
        let shape = shape.into();
        if data.len() != shape.elem_count() {
            return Err(Error::ElementCountMismatch {
                expected: shape.elem_count(),
                got: data.len(),
                shape,
            });
        }
        let data = if dtype == DType::F32 {
            data
        } else {
            data.into_iter().map(|v| dtype.quantize(v)).collect()
        };
        let storage = B::from_f32_slice(&data, device)?;
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(shape),
            dtype,
            device.clone(),
        ))
    }

    /// F32 tensor from a slice.
    pub fn from_slice(data: &[f32], shape: impl Into<Shape>, device: &B::Device) -> Result<Self> {
        Self::from_vec(data.to_vec(), shape, DType::F32, device)
    }

    pub fn full(
        shape: impl Into<Shape>,
        value: f32,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Self> {
        let shape = shape.into();
        let storage = B::full(shape.elem_count(), dtype.quantize(value), device)?;
        Ok(Self::from_storage(
            storage,
            Layout::contiguous(shape),
            dtype,
            device.clone(),
        ))
    }

    pub fn zeros(shape: impl Into<Shape>, dtype: DType, device: &B::Device) -> Result<Self> {
        Self::full(shape, 0.0, dtype, device)
    }

    /// Rank-0 tensor.
    pub fn scalar(value: f32, dtype: DType, device: &B::Device) -> Result<Self> {
        Self::full((), value, dtype, device)
    }

    // Accessors

    pub fn shape(&self) -> &Shape {
        self.layout.shape()
    }

    pub fn dims(&self) -> &[usize] {
        self.layout.dims()
    }

    pub fn rank(&self) -> usize {
        self.layout.rank()
    }

    pub fn elem_count(&self) -> usize {
        self.layout.elem_count()
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn device(&self) -> &B::Device {
        &self.device
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn storage(&self) -> &B::Storage {
        &self.storage
    }

    pub fn is_contiguous(&self) -> bool {
        self.layout.is_contiguous()
    }

    pub fn kind(&self) -> BackendKind {
        B::KIND
    }

    /// Whether two handles share one storage buffer.
    pub fn same_storage(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }

    // Host access

    /// All elements in logical row-major order.
    pub fn to_vec(&self) -> Result<Vec<f32>> {
        B::to_f32_vec(&self.storage, &self.layout)
    }

    /// Elements as integers, for shape and index tensors.
    pub fn to_i64_vec(&self) -> Result<Vec<i64>> {
        Ok(self.to_vec()?.into_iter().map(|v| v as i64).collect())
    }

    /// The single element of a one-element tensor.
    pub fn to_scalar(&self) -> Result<f32> {
        if self.elem_count() != 1 {
            return Err(Error::msg(format!(
                "not a scalar: tensor has shape {}",
                self.shape()
            )));
        }
        B::read_element(&self.storage, self.layout.offset())
    }

    fn check_index(&self, index: &[usize]) -> Result<()> {
        let in_bounds = index.len() == self.rank()
            && index.iter().zip(self.dims()).all(|(&i, &d)| i < d);
        if !in_bounds {
            return Err(Error::IndexOutOfBounds {
                index: index.to_vec(),
                shape: self.shape().clone(),
            });
        }
        Ok(())
    }

    /// Read one element by multi-index.
    pub fn get(&self, index: &[usize]) -> Result<f32> {
        self.check_index(index)?;
        B::read_element(&self.storage, self.layout.flat_index(index))
    }

    /// Read one element by row-major linear position.
    pub fn get_linear(&self, pos: usize) -> Result<f32> {
        if pos >= self.elem_count() {
            return Err(Error::IndexOutOfBounds {
                index: vec![pos],
                shape: self.shape().clone(),
            });
        }
        self.get(&unravel_index(pos, self.dims()))
    }

    /// Write one element by multi-index.
    ///
    /// Storage shared with other handles, or viewed through a strided
    /// layout, is copied first so the write is only visible through `self`.
    pub fn set(&mut self, index: &[usize], value: f32) -> Result<()> {
        self.check_index(index)?;
        if Arc::get_mut(&mut self.storage).is_none() || !self.layout.is_contiguous() {
            let fresh = B::to_contiguous(&self.storage, &self.layout)?;
            self.storage = Arc::new(fresh);
            self.layout = Layout::contiguous(self.shape().clone());
        }
        let offset = self.layout.flat_index(index);
        let value = self.dtype.quantize(value);
        let storage = Arc::get_mut(&mut self.storage)
            .ok_or_else(|| Error::msg("tensor storage is still shared"))?;
        B::write_element(storage, offset, value)
    }

    /// Write one element by row-major linear position.
    pub fn set_linear(&mut self, pos: usize, value: f32) -> Result<()> {
        if pos >= self.elem_count() {
            return Err(Error::IndexOutOfBounds {
                index: vec![pos],
                shape: self.shape().clone(),
            });
        }
        let index = unravel_index(pos, self.dims());
        self.set(&index, value)
    }

    /// Give up this handle. Returns `true` when it was the last handle and
    /// the buffer went back to the backend.
    pub fn release(self) -> bool {
        match Arc::try_unwrap(self.storage) {
            Ok(storage) => {
                B::release(storage, &self.device);
                true
            }
            Err(_) => false,
        }
    }

    /// Same elements in fresh row-major storage; a no-op for contiguous
    /// tensors.
    pub fn contiguous(&self) -> Result<Self> {
        if self.is_contiguous() {
            return Ok(self.clone());
        }
        let storage = B::to_contiguous(&self.storage, &self.layout)?;
        Ok(self.fresh(storage, self.shape().clone()))
    }

    /// Re-tag the dtype, converting values where the domains differ.
    pub fn to_dtype(&self, dtype: DType) -> Result<Self> {
        if dtype == self.dtype {
            return Ok(self.clone());
        }
        let mut out = match dtype {
            DType::F32 => self.clone(),
            DType::I32 | DType::I64 if self.dtype.is_int() => self.clone(),
            DType::I32 | DType::I64 => self.unary(UnaryOp::Trunc)?,
            DType::F16 | DType::U8 => {
                return Self::from_vec(self.to_vec()?, self.shape().clone(), dtype, &self.device)
            }
        };
        out.dtype = dtype;
        Ok(out)
    }

    // Structural ops

    /// Same elements under a new shape. A view when the layout allows it,
    /// a copy otherwise.
    pub fn reshape(&self, shape: impl Into<Shape>) -> Result<Self> {
        let shape = shape.into();
        if shape.elem_count() != self.elem_count() {
            return Err(Error::ReshapeElementMismatch {
                src: self.elem_count(),
                dst: shape.elem_count(),
                dst_shape: shape,
            });
        }
        if let Some(layout) = self.layout.reshaped(&shape) {
            return Ok(self.view(layout));
        }
        let c = self.contiguous()?;
        Ok(c.view(Layout::contiguous(shape)))
    }

    /// Reshape with at most one inferred (`-1`) axis.
    pub fn reshape_spec(&self, spec: &[i64]) -> Result<Self> {
        let shape = Shape::resolve_reshape(spec, self.elem_count())?;
        self.reshape(shape)
    }

    /// Reorder axes by `perm`; `None` reverses them.
    pub fn transpose(&self, perm: Option<&[usize]>) -> Result<Self> {
        let layout = match perm {
            Some(p) => self.layout.permute(p)?,
            None => {
                let rev: Vec<usize> = (0..self.rank()).rev().collect();
                self.layout.permute(&rev)?
            }
        };
        Ok(self.view(layout))
    }

    /// Insert size-1 axes at the given output positions.
    pub fn unsqueeze(&self, axes: &[i64]) -> Result<Self> {
        let out_rank = self.rank() + axes.len();
        let mut positions = axes
            .iter()
            .map(|&a| normalize_axis(a, out_rank))
            .collect::<Result<Vec<_>>>()?;
        positions.sort_unstable();
        positions.dedup();
        if positions.len() != axes.len() {
            return Err(Error::msg(format!("unsqueeze: repeated axis in {axes:?}")));
        }
        let mut src = self.dims().iter();
        let dims: Vec<usize> = (0..out_rank)
            .map(|i| {
                if positions.binary_search(&i).is_ok() {
                    1
                } else {
                    src.next().copied().unwrap_or(1)
                }
            })
            .collect();
        self.reshape(dims)
    }

    /// Remove size-1 axes. `None` removes all of them.
    pub fn squeeze(&self, axes: Option<&[i64]>) -> Result<Self> {
        let rank = self.rank();
        let remove: Vec<usize> = match axes {
            None => (0..rank).filter(|&i| self.dims()[i] == 1).collect(),
            Some(axes) => {
                let mut out = Vec::with_capacity(axes.len());
                for &a in axes {
                    let a = normalize_axis(a, rank)?;
                    if self.dims()[a] != 1 {
                        return Err(Error::msg(format!(
                            "squeeze: axis {a} of {} has size {}",
                            self.shape(),
                            self.dims()[a]
                        )));
                    }
                    out.push(a);
                }
                out
            }
        };
        let dims: Vec<usize> = (0..rank)
            .filter(|i| !remove.contains(i))
            .map(|i| self.dims()[i])
            .collect();
        self.reshape(dims)
    }

    /// Collapse into 2-D: `[prod(dims[..axis]), prod(dims[axis..])]`.
    pub fn flatten(&self, axis: i64) -> Result<Self> {
        let rank = self.rank();
        let axis = if axis == rank as i64 {
            rank
        } else {
            normalize_axis(axis, rank.max(1))?
        };
        let outer: usize = self.dims()[..axis].iter().product();
        let inner: usize = self.dims()[axis..].iter().product();
        self.reshape((outer, inner))
    }

    /// Slice with per-axis `starts`, `ends` and `steps`.
    ///
    /// Negative bounds count from the end; out-of-range bounds are clamped.
    /// Positive steps produce a view, negative steps gather the elements.
    pub fn slice(
        &self,
        starts: &[i64],
        ends: &[i64],
        axes: Option<&[i64]>,
        steps: Option<&[i64]>,
    ) -> Result<Self> {
        if starts.len() != ends.len() {
            return Err(Error::msg(format!(
                "slice: {} starts but {} ends",
                starts.len(),
                ends.len()
            )));
        }
        let rank = self.rank();
        let axes: Vec<usize> = match axes {
            Some(a) => a
                .iter()
                .map(|&x| normalize_axis(x, rank))
                .collect::<Result<_>>()?,
            None => (0..starts.len()).collect(),
        };
        let steps: Vec<i64> = match steps {
            Some(s) => s.to_vec(),
            None => vec![1; starts.len()],
        };
        if axes.len() != starts.len() || steps.len() != starts.len() {
            return Err(Error::msg("slice: axes and steps must match starts"));
        }

        let mut layout = self.layout.clone();
        let mut reversed: Vec<(usize, Vec<usize>)> = Vec::new();
        for (i, &axis) in axes.iter().enumerate() {
            let step = steps[i];
            if step == 0 {
                return Err(Error::msg("slice: step cannot be 0"));
            }
            let n = self.dims()[axis] as i64;
            let start = if starts[i] < 0 { starts[i] + n } else { starts[i] };
            let end = if ends[i] < 0 { ends[i] + n } else { ends[i] };
            if step > 0 {
                let start = start.clamp(0, n);
                let end = end.clamp(0, n);
                let len = if end > start {
                    (end - start + step - 1) / step
                } else {
                    0
                };
                layout = layout.slice(axis, start as usize, len as usize, step as usize)?;
            } else {
                let indices: Vec<usize> = if n == 0 {
                    Vec::new()
                } else {
                    let start = start.clamp(0, n - 1);
                    let end = end.clamp(-1, n - 1);
                    let mut idx = Vec::new();
                    let mut p = start;
                    while p > end {
                        idx.push(p as usize);
                        p += step;
                    }
                    idx
                };
                reversed.push((axis, indices));
            }
        }
        let mut out = self.view(layout);
        for (axis, indices) in reversed {
            out = out.index_select(&indices, axis)?;
        }
        Ok(out)
    }

    /// Broadcast to a shape compatible with `shape` (bidirectionally),
    /// without copying.
    pub fn expand(&self, shape: impl Into<Shape>) -> Result<Self> {
        let target = Shape::broadcast_shape(self.shape(), &shape.into())?;
        let layout = self.layout.broadcast_as(&target)?;
        Ok(self.view(layout))
    }

    /// Tile the tensor `repeats[i]` times along axis `i`.
    pub fn repeat(&self, repeats: &[usize]) -> Result<Self> {
        if repeats.len() != self.rank() {
            return Err(Error::RankMismatch {
                expected: self.rank(),
                got: repeats.len(),
            });
        }
        if repeats.iter().all(|&r| r == 1) {
            return Ok(self.clone());
        }
        // [d0, d1] -> [1, d0, 1, d1] -> expand [r0, d0, r1, d1] -> [r0*d0, r1*d1]
        let mut split = Vec::with_capacity(self.rank() * 2);
        let mut expanded = Vec::with_capacity(self.rank() * 2);
        let mut tiled = Vec::with_capacity(self.rank());
        for (&d, &r) in self.dims().iter().zip(repeats) {
            split.extend([1, d]);
            expanded.extend([r, d]);
            tiled.push(r * d);
        }
        let split = self.reshape(split)?;
        let layout = split.layout.broadcast_as(&Shape::new(expanded))?;
        split.view(layout).reshape(tiled)
    }

    /// Pick entries along `dim` by position.
    pub fn index_select(&self, indices: &[usize], dim: usize) -> Result<Self> {
        let size = self.shape().dim(dim)?;
        if let Some(&bad) = indices.iter().find(|&&i| i >= size) {
            let mut index = vec![0; self.rank()];
            index[dim] = bad;
            return Err(Error::IndexOutOfBounds {
                index,
                shape: self.shape().clone(),
            });
        }
        let mut dims = self.dims().to_vec();
        dims[dim] = indices.len();
        let storage = B::index_select(&self.storage, &self.layout, indices, dim)?;
        Ok(self.fresh(storage, Shape::new(dims)))
    }

    /// Gather along `axis` with an index tensor of any shape.
    ///
    /// Output shape is `dims[..axis] ++ indices.dims ++ dims[axis+1..]`.
    /// Negative indices count from the end.
    pub fn gather(&self, indices: &Self, axis: i64) -> Result<Self> {
        let axis = normalize_axis(axis, self.rank())?;
        let size = self.dims()[axis] as i64;
        let flat = indices
            .to_i64_vec()?
            .into_iter()
            .map(|i| {
                let j = if i < 0 { i + size } else { i };
                if j < 0 || j >= size {
                    let mut index = vec![0; self.rank()];
                    index[axis] = i.unsigned_abs() as usize;
                    return Err(Error::IndexOutOfBounds {
                        index,
                        shape: self.shape().clone(),
                    });
                }
                Ok(j as usize)
            })
            .collect::<Result<Vec<_>>>()?;
        let picked = self.index_select(&flat, axis)?;
        let mut dims = self.dims()[..axis].to_vec();
        dims.extend_from_slice(indices.dims());
        dims.extend_from_slice(&self.dims()[axis + 1..]);
        picked.reshape(dims)
    }

    /// Concatenate along `axis`. All inputs share rank and every other dim.
    pub fn cat(tensors: &[&Self], axis: i64) -> Result<Self> {
        let first = tensors
            .first()
            .ok_or_else(|| Error::msg("cat: no input tensors"))?;
        let rank = first.rank();
        let axis = normalize_axis(axis, rank)?;
        let mut dims = first.dims().to_vec();
        dims[axis] = 0;
        for t in tensors {
            if t.rank() != rank {
                return Err(Error::RankMismatch {
                    expected: rank,
                    got: t.rank(),
                });
            }
            for (i, (&a, &b)) in first.dims().iter().zip(t.dims()).enumerate() {
                if i != axis && a != b {
                    return Err(Error::ShapeMismatch {
                        expected: first.shape().clone(),
                        got: t.shape().clone(),
                    });
                }
            }
            dims[axis] += t.dims()[axis];
        }
        if tensors.len() == 1 {
            return Ok((*first).clone());
        }
        let parts: Vec<(&B::Storage, &Layout)> =
            tensors.iter().map(|t| (&*t.storage, &t.layout)).collect();
        let out_shape = Shape::new(dims);
        let storage = B::cat(&parts, &out_shape, axis)?;
        Ok(first.fresh(storage, out_shape))
    }

    /// Pad every axis by `(before, after)`. Negative amounts crop.
    pub fn pad(&self, pads: &[(i64, i64)], mode: PadMode, value: f32) -> Result<Self> {
        if pads.len() != self.rank() {
            return Err(Error::RankMismatch {
                expected: self.rank(),
                got: pads.len(),
            });
        }
        let mut out = self.clone();
        for (axis, &(before, after)) in pads.iter().enumerate() {
            if before < 0 || after < 0 {
                let n = out.dims()[axis] as i64;
                let start = (-before).max(0);
                let end = n - (-after).max(0);
                if end < start {
                    return Err(Error::msg(format!(
                        "pad: cropping ({before}, {after}) exceeds axis {axis} of size {n}"
                    )));
                }
                let layout = out
                    .layout
                    .narrow(axis, start as usize, (end - start) as usize)?;
                out = out.view(layout);
            }
        }
        for (axis, &(before, after)) in pads.iter().enumerate() {
            let (b, e) = (before.max(0) as usize, after.max(0) as usize);
            if b == 0 && e == 0 {
                continue;
            }
            let n = out.dims()[axis];
            out = match mode {
                PadMode::Constant => {
                    let mut parts = Vec::with_capacity(3);
                    let mut dims = out.dims().to_vec();
                    if b > 0 {
                        dims[axis] = b;
                        parts.push(Self::full(dims.clone(), value, out.dtype, &out.device)?);
                    }
                    parts.push(out.clone());
                    if e > 0 {
                        dims[axis] = e;
                        parts.push(Self::full(dims, value, out.dtype, &out.device)?);
                    }
                    let refs: Vec<&Self> = parts.iter().collect();
                    Self::cat(&refs, axis as i64)?
                }
                PadMode::Edge => {
                    if n == 0 {
                        return Err(Error::msg("pad: edge mode on an empty axis"));
                    }
                    let indices: Vec<usize> = std::iter::repeat(0)
                        .take(b)
                        .chain(0..n)
                        .chain(std::iter::repeat(n - 1).take(e))
                        .collect();
                    out.index_select(&indices, axis)?
                }
                PadMode::Reflect => {
                    if b >= n || e >= n {
                        return Err(Error::msg(format!(
                            "pad: reflect ({b}, {e}) needs an axis longer than the pad, got {n}"
                        )));
                    }
                    let indices: Vec<usize> = (1..=b)
                        .rev()
                        .chain(0..n)
                        .chain((0..e).map(|i| n - 2 - i))
                        .collect();
                    out.index_select(&indices, axis)?
                }
            };
        }
        Ok(out)
    }

    // Element-wise ops

    /// `op(alpha * self, beta * rhs)` with broadcasting.
    pub fn binary(&self, op: BinaryOp, rhs: &Self, alpha: f32, beta: f32) -> Result<Self> {
        let (_, _, out) = Shape::align(self.shape(), rhs.shape())?;
        let lhs_layout = self.layout.broadcast_as(&out)?;
        let rhs_layout = rhs.layout.broadcast_as(&out)?;
        let storage = B::binary_op(
            op,
            &self.storage,
            &lhs_layout,
            &rhs.storage,
            &rhs_layout,
            alpha,
            beta,
        )?;
        Ok(self.fresh(storage, out))
    }

    pub fn add(&self, rhs: &Self) -> Result<Self> {
        self.binary(BinaryOp::Add, rhs, 1.0, 1.0)
    }

    pub fn sub(&self, rhs: &Self) -> Result<Self> {
        self.binary(BinaryOp::Sub, rhs, 1.0, 1.0)
    }

    pub fn mul(&self, rhs: &Self) -> Result<Self> {
        self.binary(BinaryOp::Mul, rhs, 1.0, 1.0)
    }

    pub fn div(&self, rhs: &Self) -> Result<Self> {
        self.binary(BinaryOp::Div, rhs, 1.0, 1.0)
    }

    pub fn pow(&self, rhs: &Self) -> Result<Self> {
        self.binary(BinaryOp::Pow, rhs, 1.0, 1.0)
    }

    pub fn unary(&self, op: UnaryOp) -> Result<Self> {
        let storage = B::unary_op(op, &self.storage, &self.layout)?;
        Ok(self.fresh(storage, self.shape().clone()))
    }

    pub fn exp(&self) -> Result<Self> {
        self.unary(UnaryOp::Exp)
    }

    /// `self * mul + add`.
    pub fn affine(&self, mul: f32, add: f32) -> Result<Self> {
        let storage = B::affine(&self.storage, &self.layout, mul, add)?;
        Ok(self.fresh(storage, self.shape().clone()))
    }

    pub fn clamp(&self, min: f32, max: f32) -> Result<Self> {
        let storage = B::clamp(&self.storage, &self.layout, min, max)?;
        Ok(self.fresh(storage, self.shape().clone()))
    }

    // Reductions

    /// Reduce over `axes` (negative allowed). `None` reduces every axis.
    pub fn reduce(&self, op: ReduceOp, axes: Option<&[i64]>, keep_dim: bool) -> Result<Self> {
        let rank = self.rank();
        let mut axes: Vec<usize> = match axes {
            None => (0..rank).collect(),
            Some(a) => a
                .iter()
                .map(|&x| normalize_axis(x, rank))
                .collect::<Result<_>>()?,
        };
        axes.sort_unstable();
        axes.dedup();
        let (out_shape, _) = reduced_shape(self.shape(), &axes, keep_dim);
        let storage = B::reduce_op(op, &self.storage, &self.layout, &axes, keep_dim)?;
        Ok(self.fresh(storage, out_shape))
    }

    /// `exp(x - max) / sum(exp(x - max))` along one axis.
    pub fn softmax(&self, axis: i64) -> Result<Self> {
        let axes = [axis];
        let max = self.reduce(ReduceOp::Max, Some(&axes), true)?;
        let shifted = self.sub(&max)?;
        max.release();
        let e = shifted.exp()?;
        shifted.release();
        let sum = e.reduce(ReduceOp::Sum, Some(&axes), true)?;
        let out = e.div(&sum)?;
        e.release();
        sum.release();
        Ok(out)
    }

    // Matrix products

    /// Matrix product with numpy semantics: 1-D operands are promoted and
    /// the promoted axis removed again, batch axes broadcast.
    pub fn matmul(&self, rhs: &Self) -> Result<Self> {
        if self.rank() == 0 || rhs.rank() == 0 {
            return Err(Error::RankMismatch {
                expected: 1,
                got: 0,
            });
        }
        let a = if self.rank() == 1 {
            self.reshape((1, self.dims()[0]))?
        } else {
            self.clone()
        };
        let b = if rhs.rank() == 1 {
            rhs.reshape((rhs.dims()[0], 1))?
        } else {
            rhs.clone()
        };
        let (ar, br) = (a.rank(), b.rank());
        let (m, k1) = (a.dims()[ar - 2], a.dims()[ar - 1]);
        let (k2, n) = (b.dims()[br - 2], b.dims()[br - 1]);
        if k1 != k2 {
            return Err(Error::MatmulShapeMismatch { m, k1, k2, n });
        }
        let batch = Shape::broadcast_shape(
            &Shape::from(&a.dims()[..ar - 2]),
            &Shape::from(&b.dims()[..br - 2]),
        )?;
        let with = |x: usize, y: usize| {
            let mut d = batch.dims().to_vec();
            d.extend([x, y]);
            Shape::new(d)
        };
        let lhs_layout = a.layout.broadcast_as(&with(m, k1))?;
        let rhs_layout = b.layout.broadcast_as(&with(k2, n))?;
        let storage = B::matmul(&a.storage, &lhs_layout, &b.storage, &rhs_layout)?;
        let out = self.fresh(storage, with(m, n));

        let mut dims = batch.dims().to_vec();
        if self.rank() != 1 {
            dims.push(m);
        }
        if rhs.rank() != 1 {
            dims.push(n);
        }
        if dims == out.dims() {
            Ok(out)
        } else {
            out.reshape(dims)
        }
    }

    /// `alpha * op(A) @ op(B) + beta * C` for 2-D `A` and `B`; `C` broadcasts.
    pub fn gemm(
        &self,
        b: &Self,
        c: Option<&Self>,
        alpha: f32,
        beta: f32,
        trans_a: bool,
        trans_b: bool,
    ) -> Result<Self> {
        for t in [self, b] {
            if t.rank() != 2 {
                return Err(Error::RankMismatch {
                    expected: 2,
                    got: t.rank(),
                });
            }
        }
        let a = if trans_a {
            self.transpose(None)?
        } else {
            self.clone()
        };
        let b = if trans_b { b.transpose(None)? } else { b.clone() };
        let mut y = a.matmul(&b)?;
        if alpha != 1.0 {
            let scaled = y.affine(alpha, 0.0)?;
            y.release();
            y = scaled;
        }
        if let Some(c) = c {
            if beta != 0.0 {
                let biased = y.binary(BinaryOp::Add, c, 1.0, beta)?;
                y.release();
                y = biased;
            }
        }
        Ok(y)
    }
}
