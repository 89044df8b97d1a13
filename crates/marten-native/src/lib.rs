// Native Backend: data-parallel host kernels with a pooled allocator
//
// Same contract as the reference backend, tuned for throughput:
//
// - Dense (row-major) operands are processed as flat slices, split across
//   threads with rayon once they are large enough to pay for it.
// - Strided and broadcast operands fall back to a StridedIter walk.
// - Every output buffer comes from the device's HostPool, and `release`
//   hands buffers back to it, so steady-state forward passes do not touch
//   the system allocator.
//
// USAGE:
//   let device = NativeDevice::new();
//   let t = Tensor::<NativeBackend>::from_slice(&[1.0, 2.0], 2, &device)?;

pub mod pool;

use std::fmt;
use std::ops::Range;
use std::sync::Arc;

use rayon::prelude::*;

use marten_core::backend::{
    reduced_shape, Backend, BackendDevice, BackendKind, BackendStorage, BinaryOp, ReduceOp,
    UnaryOp,
};
use marten_core::error::{Error, Result};
use marten_core::layout::Layout;
use marten_core::shape::{ravel_index, unravel_index, Shape};

pub use pool::{HostPool, PoolStats};

/// Below this many elements a kernel runs on the calling thread.
const PAR_THRESHOLD: usize = 1 << 14;

// NativeDevice: owns the host pool

/// Handle to the native allocator. Clones share one pool.
#[derive(Clone, Default)]
pub struct NativeDevice {
    pool: Arc<HostPool>,
}

impl NativeDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pool(&self) -> &HostPool {
        &self.pool
    }

    pub fn alloc(&self, n: usize) -> Vec<f32> {
        self.pool.alloc(n)
    }

    pub fn reclaim(&self, buf: Vec<f32>) {
        self.pool.reclaim(buf);
    }

    /// Free all cached host memory.
    pub fn empty_cache(&self) {
        self.pool.empty_cache();
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    fn wrap(&self, data: Vec<f32>) -> NativeStorage {
        NativeStorage {
            data,
            device: self.clone(),
        }
    }
}

impl fmt::Debug for NativeDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativeDevice({:?})", self.pool.stats())
    }
}

impl PartialEq for NativeDevice {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.pool, &other.pool)
    }
}

impl BackendDevice for NativeDevice {
    fn name(&self) -> String {
        "native".to_string()
    }
}

// NativeStorage

/// Pooled host buffer. Keeps a handle to its device so kernels can allocate
/// outputs from the same pool.
pub struct NativeStorage {
    data: Vec<f32>,
    device: NativeDevice,
}

impl NativeStorage {
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    /// The slice a dense layout covers, or `None` for strided/broadcast views.
    fn dense(&self, layout: &Layout) -> Option<&[f32]> {
        dense_range(layout).map(|r| &self.data[r])
    }

    /// Elements of `layout` in logical order, in a pooled buffer.
    fn gather(&self, layout: &Layout) -> Vec<f32> {
        let mut out = self.device.alloc(layout.elem_count());
        match self.dense(layout) {
            Some(src) => out.copy_from_slice(src),
            None => {
                for (o, i) in out.iter_mut().zip(layout.strided_indices()) {
                    *o = self.data[i];
                }
            }
        }
        out
    }
}

impl fmt::Debug for NativeStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NativeStorage(len={})", self.data.len())
    }
}

impl BackendStorage for NativeStorage {
    fn len(&self) -> usize {
        self.data.len()
    }
}

fn dense_range(layout: &Layout) -> Option<Range<usize>> {
    layout
        .reshaped(layout.shape())
        .map(|l| l.offset()..l.offset() + l.elem_count())
}

/// `out[i] = f(src[i])`, in parallel for large inputs.
fn map_into<F>(out: &mut [f32], src: &[f32], f: F)
where
    F: Fn(f32) -> f32 + Sync + Send,
{
    if out.len() >= PAR_THRESHOLD {
        out.par_iter_mut()
            .zip(src.par_iter())
            .for_each(|(o, &x)| *o = f(x));
    } else {
        for (o, &x) in out.iter_mut().zip(src) {
            *o = f(x);
        }
    }
}

/// Apply `f` element-wise over any layout.
fn map_unary<F>(input: &NativeStorage, layout: &Layout, f: F) -> NativeStorage
where
    F: Fn(f32) -> f32 + Sync + Send,
{
    let dev = &input.device;
    let mut out = dev.alloc(layout.elem_count());
    match input.dense(layout) {
        Some(src) => map_into(&mut out, src, f),
        None => {
            for (o, i) in out.iter_mut().zip(layout.strided_indices()) {
                *o = f(input.data[i]);
            }
        }
    }
    dev.wrap(out)
}

/// Marker type selecting the native backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeBackend;

/// Type alias for a tensor on the native backend.
pub type NativeTensor = marten_core::Tensor<NativeBackend>;

impl Backend for NativeBackend {
    type Device = NativeDevice;
    type Storage = NativeStorage;

    const KIND: BackendKind = BackendKind::Native;

    fn from_f32_slice(data: &[f32], device: &NativeDevice) -> Result<NativeStorage> {
        let mut buf = device.alloc(data.len());
        buf.copy_from_slice(data);
        Ok(device.wrap(buf))
    }

    fn full(len: usize, value: f32, device: &NativeDevice) -> Result<NativeStorage> {
        Ok(device.wrap(device.pool.alloc_filled(len, value)))
    }

    fn to_f32_vec(input: &NativeStorage, layout: &Layout) -> Result<Vec<f32>> {
        Ok(match input.dense(layout) {
            Some(src) => src.to_vec(),
            None => layout.strided_indices().map(|i| input.data[i]).collect(),
        })
    }

    fn read_element(input: &NativeStorage, offset: usize) -> Result<f32> {
        input
            .data
            .get(offset)
            .copied()
            .ok_or_else(|| Error::msg(format!("storage offset {offset} out of range")))
    }

    fn write_element(input: &mut NativeStorage, offset: usize, value: f32) -> Result<()> {
        let slot = input
            .data
            .get_mut(offset)
            .ok_or_else(|| Error::msg(format!("storage offset {offset} out of range")))?;
        *slot = value;
        Ok(())
    }

    fn release(storage: NativeStorage, device: &NativeDevice) {
        device.reclaim(storage.data);
    }

    fn to_contiguous(input: &NativeStorage, layout: &Layout) -> Result<NativeStorage> {
        Ok(input.device.wrap(input.gather(layout)))
    }

    fn cat(
        inputs: &[(&NativeStorage, &Layout)],
        out_shape: &Shape,
        dim: usize,
    ) -> Result<NativeStorage> {
        let (first, _) = inputs
            .first()
            .ok_or_else(|| Error::msg("cat: no inputs"))?;
        let dev = &first.device;
        let dims = out_shape.dims();
        let outer: usize = dims[..dim].iter().product();
        let inner: usize = dims[dim + 1..].iter().product();
        let parts: Vec<(Vec<f32>, usize)> = inputs
            .iter()
            .map(|(s, l)| (s.gather(l), l.dims()[dim] * inner))
            .collect();
        let mut out = dev.alloc(out_shape.elem_count());
        let mut pos = 0;
        for o in 0..outer {
            for (data, chunk) in &parts {
                out[pos..pos + chunk].copy_from_slice(&data[o * chunk..(o + 1) * chunk]);
                pos += chunk;
            }
        }
        for (data, _) in parts {
            dev.reclaim(data);
        }
        Ok(dev.wrap(out))
    }

    fn index_select(
        input: &NativeStorage,
        layout: &Layout,
        indices: &[usize],
        dim: usize,
    ) -> Result<NativeStorage> {
        let dev = &input.device;
        let dims = layout.dims();
        let outer: usize = dims[..dim].iter().product();
        let inner: usize = dims[dim + 1..].iter().product();
        let size = dims[dim];
        let src = input.gather(layout);
        let mut out = dev.alloc(outer * indices.len() * inner);
        if inner > 0 {
            for (row, chunk) in out.chunks_mut(inner).enumerate() {
                let (o, j) = (row / indices.len(), row % indices.len());
                let start = (o * size + indices[j]) * inner;
                chunk.copy_from_slice(&src[start..start + inner]);
            }
        }
        dev.reclaim(src);
        Ok(dev.wrap(out))
    }

    fn unary_op(op: UnaryOp, input: &NativeStorage, layout: &Layout) -> Result<NativeStorage> {
        Ok(map_unary(input, layout, move |x| op.apply(x)))
    }

    fn affine(
        input: &NativeStorage,
        layout: &Layout,
        mul: f32,
        add: f32,
    ) -> Result<NativeStorage> {
        Ok(map_unary(input, layout, move |x| x * mul + add))
    }

    fn clamp(input: &NativeStorage, layout: &Layout, min: f32, max: f32) -> Result<NativeStorage> {
        Ok(map_unary(input, layout, move |x| x.max(min).min(max)))
    }

    fn binary_op(
        op: BinaryOp,
        lhs: &NativeStorage,
        lhs_layout: &Layout,
        rhs: &NativeStorage,
        rhs_layout: &Layout,
        alpha: f32,
        beta: f32,
    ) -> Result<NativeStorage> {
        if lhs_layout.shape() != rhs_layout.shape() {
            return Err(Error::ShapeMismatch {
                expected: lhs_layout.shape().clone(),
                got: rhs_layout.shape().clone(),
            });
        }
        let dev = &lhs.device;
        let n = lhs_layout.elem_count();
        let mut out = dev.alloc(n);
        let f = |a: f32, b: f32| op.apply(alpha * a, beta * b);
        match (lhs.dense(lhs_layout), rhs.dense(rhs_layout)) {
            (Some(a), Some(b)) if n >= PAR_THRESHOLD => {
                out.par_iter_mut()
                    .zip(a.par_iter().zip(b.par_iter()))
                    .for_each(|(o, (&x, &y))| *o = f(x, y));
            }
            (Some(a), Some(b)) => {
                for ((o, &x), &y) in out.iter_mut().zip(a).zip(b) {
                    *o = f(x, y);
                }
            }
            _ => {
                let pairs = lhs_layout
                    .strided_indices()
                    .zip(rhs_layout.strided_indices());
                for (o, (i, j)) in out.iter_mut().zip(pairs) {
                    *o = f(lhs.data[i], rhs.data[j]);
                }
            }
        }
        Ok(dev.wrap(out))
    }

    fn reduce_op(
        op: ReduceOp,
        input: &NativeStorage,
        layout: &Layout,
        axes: &[usize],
        keep_dim: bool,
    ) -> Result<NativeStorage> {
        if axes.is_empty() {
            return Self::to_contiguous(input, layout);
        }
        let dev = &input.device;
        let dims = layout.dims();
        let strides = layout.strides();
        let (kept_dims, kept_strides): (Vec<usize>, Vec<usize>) = (0..dims.len())
            .filter(|i| !axes.contains(i))
            .map(|i| (dims[i], strides[i]))
            .unzip();
        let red_dims: Vec<usize> = axes.iter().map(|&a| dims[a]).collect();
        let red_strides: Vec<usize> = axes.iter().map(|&a| strides[a]).collect();
        let (out_shape, group) = reduced_shape(layout.shape(), axes, keep_dim);
        let offset = layout.offset();
        let data = &input.data;

        let fold_one = |o: usize| {
            let base = offset + ravel_index(&unravel_index(o, &kept_dims), &kept_strides);
            let (red_dims, red_strides) = (&red_dims, &red_strides);
            op.fold((0..group).map(move |g| {
                data[base + ravel_index(&unravel_index(g, red_dims), red_strides)]
            }))
        };
        let mut out = dev.alloc(out_shape.elem_count());
        if out.len() * group >= PAR_THRESHOLD {
            out.par_iter_mut()
                .enumerate()
                .for_each(|(o, slot)| *slot = fold_one(o));
        } else {
            for (o, slot) in out.iter_mut().enumerate() {
                *slot = fold_one(o);
            }
        }
        Ok(dev.wrap(out))
    }

    fn matmul(
        lhs: &NativeStorage,
        lhs_layout: &Layout,
        rhs: &NativeStorage,
        rhs_layout: &Layout,
    ) -> Result<NativeStorage> {
        let rank = lhs_layout.rank();
        let (ld, rd) = (lhs_layout.dims(), rhs_layout.dims());
        let (m, k, n) = (ld[rank - 2], ld[rank - 1], rd[rank - 1]);
        if rd[rank - 2] != k {
            return Err(Error::MatmulShapeMismatch {
                m,
                k1: k,
                k2: rd[rank - 2],
                n,
            });
        }
        let dev = &lhs.device;
        let (ls, rs) = (lhs_layout.strides(), rhs_layout.strides());
        let batch_dims = &ld[..rank - 2];
        let batch: usize = batch_dims.iter().product();
        let mut out = dev.alloc(batch * m * n);
        if n == 0 {
            return Ok(dev.wrap(out));
        }

        // One output row per task: row r is batch r / m, row r % m.
        let row = |r: usize, dst: &mut [f32]| {
            let (b, i) = (r / m, r % m);
            let bidx = unravel_index(b, batch_dims);
            let lbase = lhs_layout.offset()
                + ravel_index(&bidx, &ls[..rank - 2])
                + i * ls[rank - 2];
            let rbase = rhs_layout.offset() + ravel_index(&bidx, &rs[..rank - 2]);
            dst.fill(0.0);
            for p in 0..k {
                let a = lhs.data[lbase + p * ls[rank - 1]];
                let rrow = rbase + p * rs[rank - 2];
                for (j, d) in dst.iter_mut().enumerate() {
                    *d += a * rhs.data[rrow + j * rs[rank - 1]];
                }
            }
        };
        if batch * m * n * k >= PAR_THRESHOLD {
            out.par_chunks_mut(n)
                .enumerate()
                .for_each(|(r, dst)| row(r, dst));
        } else {
            for (r, dst) in out.chunks_mut(n).enumerate() {
                row(r, dst);
            }
        }
        Ok(dev.wrap(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_returns_buffer_to_pool() {
        let dev = NativeDevice::new();
        let t = NativeTensor::from_slice(&[1.0, 2.0, 3.0], 3, &dev).unwrap();
        let u = t.exp().unwrap();
        assert!(t.release());
        assert_eq!(dev.pool_stats().cached_buffers, 1);
        // the next 3-element allocation is served from the cache
        let v = u.affine(2.0, 0.0).unwrap();
        assert_eq!(dev.pool_stats().hits, 1);
        assert_eq!(v.dims(), &[3]);
    }

    #[test]
    fn test_dense_range_with_offset() {
        let layout = Layout::contiguous(Shape::from((4, 3)));
        let rows = layout.narrow(0, 1, 2).unwrap();
        assert_eq!(dense_range(&rows), Some(3..9));
        assert_eq!(dense_range(&layout.transpose(0, 1).unwrap()), None);
    }

    #[test]
    fn test_large_parallel_add() {
        let dev = NativeDevice::new();
        let n = PAR_THRESHOLD * 2;
        let a: Vec<f32> = (0..n).map(|v| v as f32).collect();
        let x = NativeTensor::from_slice(&a, n, &dev).unwrap();
        let y = x.add(&x).unwrap().to_vec().unwrap();
        assert_eq!(y[n - 1], 2.0 * (n - 1) as f32);
    }
}
