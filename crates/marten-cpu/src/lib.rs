//! # marten-cpu
//!
//! The reference backend: plain scalar loops over strided layouts, no
//! parallelism, no pooling. Every other backend is tested against it.
//!
//! Kernels never require contiguous input. They walk the input layout with
//! [`Layout::strided_indices`], so transposed, sliced and broadcast views
//! are read in place.

use marten_core::backend::{
    reduced_shape, Backend, BackendDevice, BackendKind, BackendStorage, BinaryOp, ReduceOp,
    UnaryOp,
};
use marten_core::error::{Error, Result};
use marten_core::layout::Layout;
use marten_core::shape::{ravel_index, unravel_index, Shape};

/// The reference device. Stateless.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuDevice;

impl BackendDevice for CpuDevice {
    fn name(&self) -> String {
        "cpu".to_string()
    }
}

/// Host buffer of f32 elements.
#[derive(Debug, Clone)]
pub struct CpuStorage(pub Vec<f32>);

impl BackendStorage for CpuStorage {
    fn len(&self) -> usize {
        self.0.len()
    }
}

impl CpuStorage {
    fn read(&self, layout: &Layout) -> impl Iterator<Item = f32> + '_ {
        layout.strided_indices().map(move |i| self.0[i])
    }
}

/// Marker type selecting the reference backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuBackend;

/// Type alias for a tensor on the reference backend.
pub type CpuTensor = marten_core::Tensor<CpuBackend>;

impl Backend for CpuBackend {
    type Device = CpuDevice;
    type Storage = CpuStorage;

    const KIND: BackendKind = BackendKind::Cpu;

    fn from_f32_slice(data: &[f32], _device: &CpuDevice) -> Result<CpuStorage> {
        Ok(CpuStorage(data.to_vec()))
    }

    fn full(len: usize, value: f32, _device: &CpuDevice) -> Result<CpuStorage> {
        Ok(CpuStorage(vec![value; len]))
    }

    fn to_f32_vec(input: &CpuStorage, layout: &Layout) -> Result<Vec<f32>> {
        Ok(input.read(layout).collect())
    }

    fn read_element(input: &CpuStorage, offset: usize) -> Result<f32> {
        input
            .0
            .get(offset)
            .copied()
            .ok_or_else(|| Error::msg(format!("storage offset {offset} out of range")))
    }

    fn write_element(input: &mut CpuStorage, offset: usize, value: f32) -> Result<()> {
        let slot = input
            .0
            .get_mut(offset)
            .ok_or_else(|| Error::msg(format!("storage offset {offset} out of range")))?;
        *slot = value;
        Ok(())
    }

    fn release(storage: CpuStorage, _device: &CpuDevice) {
        drop(storage);
    }

    fn to_contiguous(input: &CpuStorage, layout: &Layout) -> Result<CpuStorage> {
        Ok(CpuStorage(input.read(layout).collect()))
    }

    fn cat(inputs: &[(&CpuStorage, &Layout)], out_shape: &Shape, dim: usize) -> Result<CpuStorage> {
        let dims = out_shape.dims();
        let outer: usize = dims[..dim].iter().product();
        let inner: usize = dims[dim + 1..].iter().product();
        let parts: Vec<(Vec<f32>, usize)> = inputs
            .iter()
            .map(|(s, l)| (s.read(l).collect(), l.dims()[dim] * inner))
            .collect();
        let mut out = Vec::with_capacity(out_shape.elem_count());
        for o in 0..outer {
            for (data, chunk) in &parts {
                out.extend_from_slice(&data[o * chunk..(o + 1) * chunk]);
            }
        }
        Ok(CpuStorage(out))
    }

    fn index_select(
        input: &CpuStorage,
        layout: &Layout,
        indices: &[usize],
        dim: usize,
    ) -> Result<CpuStorage> {
        let mut dims = layout.dims().to_vec();
        dims[dim] = indices.len();
        let count: usize = dims.iter().product();
        let mut out = Vec::with_capacity(count);
        for pos in 0..count {
            let mut idx = unravel_index(pos, &dims);
            idx[dim] = indices[idx[dim]];
            out.push(input.0[layout.flat_index(&idx)]);
        }
        Ok(CpuStorage(out))
    }

    fn unary_op(op: UnaryOp, input: &CpuStorage, layout: &Layout) -> Result<CpuStorage> {
        Ok(CpuStorage(input.read(layout).map(|x| op.apply(x)).collect()))
    }

    fn affine(input: &CpuStorage, layout: &Layout, mul: f32, add: f32) -> Result<CpuStorage> {
        Ok(CpuStorage(input.read(layout).map(|x| x * mul + add).collect()))
    }

    fn clamp(input: &CpuStorage, layout: &Layout, min: f32, max: f32) -> Result<CpuStorage> {
        Ok(CpuStorage(
            input.read(layout).map(|x| x.max(min).min(max)).collect(),
        ))
    }

    fn binary_op(
        op: BinaryOp,
        lhs: &CpuStorage,
        lhs_layout: &Layout,
        rhs: &CpuStorage,
        rhs_layout: &Layout,
        alpha: f32,
        beta: f32,
    ) -> Result<CpuStorage> {
        if lhs_layout.shape() != rhs_layout.shape() {
            return Err(Error::ShapeMismatch {
                expected: lhs_layout.shape().clone(),
                got: rhs_layout.shape().clone(),
            });
        }
        let out = lhs
            .read(lhs_layout)
            .zip(rhs.read(rhs_layout))
            .map(|(a, b)| op.apply(alpha * a, beta * b))
            .collect();
        Ok(CpuStorage(out))
    }

    fn reduce_op(
        op: ReduceOp,
        input: &CpuStorage,
        layout: &Layout,
        axes: &[usize],
        keep_dim: bool,
    ) -> Result<CpuStorage> {
        if axes.is_empty() {
            return Self::to_contiguous(input, layout);
        }
        let dims = layout.dims();
        let strides = layout.strides();
        let (kept_dims, kept_strides): (Vec<usize>, Vec<usize>) = (0..dims.len())
            .filter(|i| !axes.contains(i))
            .map(|i| (dims[i], strides[i]))
            .unzip();
        let red_dims: Vec<usize> = axes.iter().map(|&a| dims[a]).collect();
        let red_strides: Vec<usize> = axes.iter().map(|&a| strides[a]).collect();
        let (out_shape, group) = reduced_shape(layout.shape(), axes, keep_dim);

        let mut out = Vec::with_capacity(out_shape.elem_count());
        for o in 0..out_shape.elem_count() {
            let base = layout.offset() + ravel_index(&unravel_index(o, &kept_dims), &kept_strides);
            let (red_dims, red_strides) = (&red_dims, &red_strides);
            let values = (0..group).map(move |g| {
                input.0[base + ravel_index(&unravel_index(g, red_dims), red_strides)]
            });
            out.push(op.fold(values));
        }
        Ok(CpuStorage(out))
    }

    fn matmul(
        lhs: &CpuStorage,
        lhs_layout: &Layout,
        rhs: &CpuStorage,
        rhs_layout: &Layout,
    ) -> Result<CpuStorage> {
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
        let (ls, rs) = (lhs_layout.strides(), rhs_layout.strides());
        let batch_dims = &ld[..rank - 2];
        let batch: usize = batch_dims.iter().product();
        let mut out = Vec::with_capacity(batch * m * n);
        for b in 0..batch {
            let bidx = unravel_index(b, batch_dims);
            let lbase = lhs_layout.offset() + ravel_index(&bidx, &ls[..rank - 2]);
            let rbase = rhs_layout.offset() + ravel_index(&bidx, &rs[..rank - 2]);
            for i in 0..m {
                for j in 0..n {
                    let mut acc = 0.0f32;
                    for p in 0..k {
                        let x = lhs.0[lbase + i * ls[rank - 2] + p * ls[rank - 1]];
                        let y = rhs.0[rbase + p * rs[rank - 2] + j * rs[rank - 1]];
                        acc += x * y;
                    }
                    out.push(acc);
                }
            }
        }
        Ok(CpuStorage(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use marten_core::Tensor;

    #[test]
    fn test_strided_binary() {
        let a = CpuTensor::from_slice(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], (2, 3), &CpuDevice).unwrap();
        let t = a.transpose(None).unwrap();
        let b = CpuTensor::from_slice(&[1.0; 6], (3, 2), &CpuDevice).unwrap();
        let c = t.add(&b).unwrap();
        assert_eq!(c.to_vec().unwrap(), vec![2.0, 5.0, 3.0, 6.0, 4.0, 7.0]);
    }

    #[test]
    fn test_reduce_middle_axis() {
        let data: Vec<f32> = (0..24).map(|v| v as f32).collect();
        let t = Tensor::<CpuBackend>::from_slice(&data, (2, 3, 4), &CpuDevice).unwrap();
        let s = t.reduce(ReduceOp::Sum, Some(&[1]), false).unwrap();
        assert_eq!(s.dims(), &[2, 4]);
        // column sums of the first block: 0+4+8, 1+5+9, ...
        assert_eq!(&s.to_vec().unwrap()[..4], &[12.0, 15.0, 18.0, 21.0]);
    }

    #[test]
    fn test_batched_matmul() {
        let a = CpuTensor::from_slice(&[1.0, 2.0, 3.0, 4.0, 1.0, 0.0, 0.0, 1.0], (2, 2, 2), &CpuDevice)
            .unwrap();
        let b = CpuTensor::from_slice(&[5.0, 6.0, 7.0, 8.0], (2, 2), &CpuDevice).unwrap();
        let c = a.matmul(&b).unwrap();
        assert_eq!(c.dims(), &[2, 2, 2]);
        assert_eq!(
            c.to_vec().unwrap(),
            vec![19.0, 22.0, 43.0, 50.0, 5.0, 6.0, 7.0, 8.0]
        );
    }
}
