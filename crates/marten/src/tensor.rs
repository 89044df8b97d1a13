// AnyTensor: a tensor on whichever backend the model currently runs on
//
// The scheduler and the operator kernels never name a backend type. They
// hold `AnyTensor`, a closed enum with one variant per backend, and every
// method forwards to the generic `Tensor<B>` inside. Binary operations
// require both operands in the same variant; there is no implicit
// promotion, a mixed pair is `Error::BackendMismatch`.

use marten_core::{
    Backend, BackendKind, BinaryOp, DType, Error, PadMode, ReduceOp, Result, Shape, Tensor,
    UnaryOp,
};
use marten_cpu::{CpuBackend, CpuDevice, CpuTensor};
use marten_native::{NativeBackend, NativeDevice, NativeTensor};

#[cfg(feature = "gpu")]
use marten_gpu::{GpuBackend, GpuDevice, GpuTensor};

/// Run `$body` with `$t` bound to the inner `Tensor<B>`, whatever `B` is.
macro_rules! with_any {
    ($value:expr, $t:ident => $body:expr) => {
        match $value {
            AnyTensor::Cpu($t) => $body,
            AnyTensor::Native($t) => $body,
            #[cfg(feature = "gpu")]
            AnyTensor::Gpu($t) => $body,
        }
    };
}

/// Like `with_any!`, re-wrapping the resulting tensor in the same variant.
macro_rules! map_any {
    ($value:expr, $t:ident => $body:expr) => {
        with_any!($value, $t => Ok(AnyTensor::from($body?)))
    };
}

/// Where a tensor lives. Carries the allocator handle for pooled backends.
#[derive(Debug, Clone)]
pub enum Device {
    Cpu,
    Native(NativeDevice),
    #[cfg(feature = "gpu")]
    Gpu(GpuDevice),
}

impl Device {
    pub fn kind(&self) -> BackendKind {
        match self {
            Device::Cpu => BackendKind::Cpu,
            Device::Native(_) => BackendKind::Native,
            #[cfg(feature = "gpu")]
            Device::Gpu(_) => BackendKind::Gpu,
        }
    }
}

/// A tensor on one of the available backends.
#[derive(Debug, Clone)]
pub enum AnyTensor {
    Cpu(CpuTensor),
    Native(NativeTensor),
    #[cfg(feature = "gpu")]
    Gpu(GpuTensor),
}

impl From<CpuTensor> for AnyTensor {
    fn from(t: CpuTensor) -> Self {
        AnyTensor::Cpu(t)
    }
}

impl From<NativeTensor> for AnyTensor {
    fn from(t: NativeTensor) -> Self {
        AnyTensor::Native(t)
    }
}

#[cfg(feature = "gpu")]
impl From<GpuTensor> for AnyTensor {
    fn from(t: GpuTensor) -> Self {
        AnyTensor::Gpu(t)
    }
}

/// Backends that have a variant in [`AnyTensor`].
pub trait AnyBackend: Backend {
    fn peel(t: &AnyTensor) -> Option<&Tensor<Self>>;
}

impl AnyBackend for CpuBackend {
    fn peel(t: &AnyTensor) -> Option<&Tensor<Self>> {
        match t {
            AnyTensor::Cpu(t) => Some(t),
            _ => None,
        }
    }
}

impl AnyBackend for NativeBackend {
    fn peel(t: &AnyTensor) -> Option<&Tensor<Self>> {
        match t {
            AnyTensor::Native(t) => Some(t),
            _ => None,
        }
    }
}

#[cfg(feature = "gpu")]
impl AnyBackend for GpuBackend {
    fn peel(t: &AnyTensor) -> Option<&Tensor<Self>> {
        match t {
            AnyTensor::Gpu(t) => Some(t),
            _ => None,
        }
    }
}

/// `t` as a `Tensor<B>`, or a mismatch error naming both kinds.
fn same<B: AnyBackend>(t: &AnyTensor) -> Result<&Tensor<B>> {
    B::peel(t).ok_or_else(|| Error::BackendMismatch {
        lhs: B::KIND,
        rhs: t.kind(),
    })
}

fn cat_in<B: AnyBackend>(tensors: &[&AnyTensor], axis: i64) -> Result<Tensor<B>> {
    let parts = tensors
        .iter()
        .map(|t| same::<B>(t))
        .collect::<Result<Vec<_>>>()?;
    Tensor::cat(&parts, axis)
}

impl AnyTensor {
    // Creation

    pub fn from_vec(
        data: Vec<f32>,
        shape: impl Into<Shape>,
        dtype: DType,
        device: &Device,
    ) -> Result<Self> {
        Ok(match device {
            Device::Cpu => CpuTensor::from_vec(data, shape, dtype, &CpuDevice)?.into(),
            Device::Native(d) => NativeTensor::from_vec(data, shape, dtype, d)?.into(),
            #[cfg(feature = "gpu")]
            Device::Gpu(d) => GpuTensor::from_vec(data, shape, dtype, d)?.into(),
        })
    }

    /// F32 tensor on the reference backend.
    pub fn from_slice(data: &[f32], shape: impl Into<Shape>) -> Result<Self> {
        Ok(CpuTensor::from_slice(data, shape, &CpuDevice)?.into())
    }

    /// I64 tensor on the reference backend.
    pub fn from_i64(data: &[i64], shape: impl Into<Shape>) -> Result<Self> {
        let data = data.iter().map(|&v| v as f32).collect();
        Ok(CpuTensor::from_vec(data, shape, DType::I64, &CpuDevice)?.into())
    }

    pub fn full(shape: impl Into<Shape>, value: f32, dtype: DType, device: &Device) -> Result<Self> {
        Ok(match device {
            Device::Cpu => CpuTensor::full(shape, value, dtype, &CpuDevice)?.into(),
            Device::Native(d) => NativeTensor::full(shape, value, dtype, d)?.into(),
            #[cfg(feature = "gpu")]
            Device::Gpu(d) => GpuTensor::full(shape, value, dtype, d)?.into(),
        })
    }

    /// A tensor on the same backend as `self`.
    pub fn new_like(&self, data: Vec<f32>, shape: impl Into<Shape>, dtype: DType) -> Result<Self> {
        Self::from_vec(data, shape, dtype, &self.device())
    }

    // Accessors

    pub fn kind(&self) -> BackendKind {
        with_any!(self, t => t.kind())
    }

    pub fn device(&self) -> Device {
        match self {
            AnyTensor::Cpu(_) => Device::Cpu,
            AnyTensor::Native(t) => Device::Native(t.device().clone()),
            #[cfg(feature = "gpu")]
            AnyTensor::Gpu(t) => Device::Gpu(t.device().clone()),
        }
    }

    pub fn shape(&self) -> &Shape {
        with_any!(self, t => t.shape())
    }

    pub fn dims(&self) -> &[usize] {
        with_any!(self, t => t.dims())
    }

    pub fn rank(&self) -> usize {
        with_any!(self, t => t.rank())
    }

    pub fn elem_count(&self) -> usize {
        with_any!(self, t => t.elem_count())
    }

    pub fn dtype(&self) -> DType {
        with_any!(self, t => t.dtype())
    }

    /// Whether two handles share one storage buffer.
    pub fn same_storage(&self, other: &AnyTensor) -> bool {
        with_any!(self, t => same(other).map(|o| t.same_storage(o)).unwrap_or(false))
    }

    pub fn to_vec(&self) -> Result<Vec<f32>> {
        with_any!(self, t => t.to_vec())
    }

    pub fn to_i64_vec(&self) -> Result<Vec<i64>> {
        with_any!(self, t => t.to_i64_vec())
    }

    pub fn to_scalar(&self) -> Result<f32> {
        with_any!(self, t => t.to_scalar())
    }

    pub fn get(&self, index: &[usize]) -> Result<f32> {
        with_any!(self, t => t.get(index))
    }

    pub fn get_linear(&self, pos: usize) -> Result<f32> {
        with_any!(self, t => t.get_linear(pos))
    }

    pub fn set(&mut self, index: &[usize], value: f32) -> Result<()> {
        with_any!(self, t => t.set(index, value))
    }

    pub fn set_linear(&mut self, pos: usize, value: f32) -> Result<()> {
        with_any!(self, t => t.set_linear(pos, value))
    }

    /// Give up this handle; `true` when its buffer went back to the backend.
    pub fn release(self) -> bool {
        with_any!(self, t => t.release())
    }

    /// Copy to another backend through host memory. Same-kind targets
    /// return a new handle to the same storage.
    pub fn to_backend(&self, device: &Device) -> Result<AnyTensor> {
        if self.kind() == device.kind() {
            return Ok(self.clone());
        }
        Self::from_vec(self.to_vec()?, self.shape().clone(), self.dtype(), device)
    }

    // Structural ops

    pub fn contiguous(&self) -> Result<Self> {
        map_any!(self, t => t.contiguous())
    }

    pub fn to_dtype(&self, dtype: DType) -> Result<Self> {
        map_any!(self, t => t.to_dtype(dtype))
    }

    pub fn reshape(&self, shape: impl Into<Shape>) -> Result<Self> {
        let shape = shape.into();
        map_any!(self, t => t.reshape(shape))
    }

    pub fn reshape_spec(&self, spec: &[i64]) -> Result<Self> {
        map_any!(self, t => t.reshape_spec(spec))
    }

    pub fn transpose(&self, perm: Option<&[usize]>) -> Result<Self> {
        map_any!(self, t => t.transpose(perm))
    }

    pub fn unsqueeze(&self, axes: &[i64]) -> Result<Self> {
        map_any!(self, t => t.unsqueeze(axes))
    }

    pub fn squeeze(&self, axes: Option<&[i64]>) -> Result<Self> {
        map_any!(self, t => t.squeeze(axes))
    }

    pub fn flatten(&self, axis: i64) -> Result<Self> {
        map_any!(self, t => t.flatten(axis))
    }

    pub fn slice(
        &self,
        starts: &[i64],
        ends: &[i64],
        axes: Option<&[i64]>,
        steps: Option<&[i64]>,
    ) -> Result<Self> {
        map_any!(self, t => t.slice(starts, ends, axes, steps))
    }

    pub fn expand(&self, shape: impl Into<Shape>) -> Result<Self> {
        let shape = shape.into();
        map_any!(self, t => t.expand(shape))
    }

    pub fn repeat(&self, repeats: &[usize]) -> Result<Self> {
        map_any!(self, t => t.repeat(repeats))
    }

    pub fn gather(&self, indices: &AnyTensor, axis: i64) -> Result<Self> {
        map_any!(self, t => t.gather(same(indices)?, axis))
    }

    pub fn pad(&self, pads: &[(i64, i64)], mode: PadMode, value: f32) -> Result<Self> {
        map_any!(self, t => t.pad(pads, mode, value))
    }

    /// Concatenate along `axis`; every input must be on the first one's backend.
    pub fn cat(tensors: &[&AnyTensor], axis: i64) -> Result<Self> {
        let first = tensors
            .first()
            .ok_or_else(|| Error::msg("cat: no input tensors"))?;
        match first {
            AnyTensor::Cpu(_) => Ok(cat_in::<CpuBackend>(tensors, axis)?.into()),
            AnyTensor::Native(_) => Ok(cat_in::<NativeBackend>(tensors, axis)?.into()),
            #[cfg(feature = "gpu")]
            AnyTensor::Gpu(_) => Ok(cat_in::<GpuBackend>(tensors, axis)?.into()),
        }
    }

    // Math

    /// `op(alpha * self, beta * rhs)` with broadcasting.
    pub fn binary(&self, op: BinaryOp, rhs: &AnyTensor, alpha: f32, beta: f32) -> Result<Self> {
        map_any!(self, t => t.binary(op, same(rhs)?, alpha, beta))
    }

    pub fn add(&self, rhs: &AnyTensor) -> Result<Self> {
        self.binary(BinaryOp::Add, rhs, 1.0, 1.0)
    }

    pub fn sub(&self, rhs: &AnyTensor) -> Result<Self> {
        self.binary(BinaryOp::Sub, rhs, 1.0, 1.0)
    }

    pub fn mul(&self, rhs: &AnyTensor) -> Result<Self> {
        self.binary(BinaryOp::Mul, rhs, 1.0, 1.0)
    }

    pub fn div(&self, rhs: &AnyTensor) -> Result<Self> {
        self.binary(BinaryOp::Div, rhs, 1.0, 1.0)
    }

    pub fn pow(&self, rhs: &AnyTensor) -> Result<Self> {
        self.binary(BinaryOp::Pow, rhs, 1.0, 1.0)
    }

    pub fn unary(&self, op: UnaryOp) -> Result<Self> {
        map_any!(self, t => t.unary(op))
    }

    pub fn affine(&self, mul: f32, add: f32) -> Result<Self> {
        map_any!(self, t => t.affine(mul, add))
    }

    pub fn clamp(&self, min: f32, max: f32) -> Result<Self> {
        map_any!(self, t => t.clamp(min, max))
    }

    pub fn reduce(&self, op: ReduceOp, axes: Option<&[i64]>, keep_dim: bool) -> Result<Self> {
        map_any!(self, t => t.reduce(op, axes, keep_dim))
    }

    pub fn softmax(&self, axis: i64) -> Result<Self> {
        map_any!(self, t => t.softmax(axis))
    }

    pub fn matmul(&self, rhs: &AnyTensor) -> Result<Self> {
        map_any!(self, t => t.matmul(same(rhs)?))
    }

    pub fn gemm(
        &self,
        b: &AnyTensor,
        c: Option<&AnyTensor>,
        alpha: f32,
        beta: f32,
        trans_a: bool,
        trans_b: bool,
    ) -> Result<Self> {
        map_any!(self, t => t.gemm(same(b)?, c.map(same).transpose()?, alpha, beta, trans_a, trans_b))
    }
}
