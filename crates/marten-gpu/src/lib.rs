// GPU Backend: wgpu compute shaders with a recycling buffer pool
//
// Storage is one wgpu storage buffer of f32 per tensor. Every primitive is
// a WGSL kernel (see `shaders`) that reads strided operands directly, so
// transposes, slices and broadcasts reach the GPU without a copy.
//
// Kernels are submitted as soon as they are recorded and never waited on;
// queue order keeps them correct. Only host reads (`to_f32_vec`,
// `read_element`) block, on a staging buffer map.
//
// Output buffers come from the device's BufferPool and `release` hands
// them back, so a steady-state forward pass creates no new buffers.
//
// USAGE:
//   let device = GpuDevice::new()?;
//   let t = Tensor::<GpuBackend>::from_slice(&[1.0, 2.0], 2, &device)?;

mod pipeline;
pub mod pool;
mod shaders;

use std::fmt;
use std::ops::Range;
use std::sync::{mpsc, Arc};
use std::time::Duration;

use wgpu::{
    Buffer, BufferDescriptor, BufferUsages, CommandEncoderDescriptor, DeviceDescriptor, MapMode,
    PollType, PowerPreference, RequestAdapterOptions,
};

use marten_core::backend::{
    reduced_shape, Backend, BackendDevice, BackendKind, BackendStorage, BinaryOp, ReduceOp,
    UnaryOp,
};
use marten_core::error::{Error, Result};
use marten_core::layout::Layout;
use marten_core::shape::Shape;

use pipeline::{Kernel, PipelineCache};

pub use pool::{BufferPool, PoolStats};

const READBACK_TIMEOUT: Duration = Duration::from_secs(60);

// Op codes understood by the map kernel beyond the unary ops
const OP_AFFINE: u32 = 100;
const OP_CLAMP: u32 = 101;
const OP_COPY: u32 = 102;

// GpuDevice

struct Context {
    device: wgpu::Device,
    queue: wgpu::Queue,
    info: wgpu::AdapterInfo,
    pipelines: PipelineCache,
    pool: BufferPool,
}

/// Handle to one wgpu device and queue. Clones share the device, its
/// pipelines and its buffer pool.
#[derive(Clone)]
pub struct GpuDevice {
    ctx: Arc<Context>,
}

impl GpuDevice {
    /// Open the default high-performance adapter.
    pub fn new() -> Result<Self> {
        Self::with_power_preference(PowerPreference::HighPerformance)
    }

    pub fn with_power_preference(power_preference: PowerPreference) -> Result<Self> {
        let instance = wgpu::Instance::default();
        let adapter = pollster::block_on(instance.request_adapter(&RequestAdapterOptions {
            power_preference,
            compatible_surface: None,
            force_fallback_adapter: false,
        }))
        .map_err(|e| Error::msg(format!("no GPU adapter available: {e}")))?;

        let (device, queue) = pollster::block_on(adapter.request_device(&DeviceDescriptor {
            label: Some("marten"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            memory_hints: wgpu::MemoryHints::Performance,
            trace: wgpu::Trace::Off,
            experimental_features: wgpu::ExperimentalFeatures::default(),
        }))
        .map_err(|e| Error::msg(format!("failed to open GPU device: {e}")))?;

        let info = adapter.get_info();
        tracing::debug!(adapter = %info.name, backend = ?info.backend, "gpu device opened");
        Ok(GpuDevice {
            ctx: Arc::new(Context {
                device,
                queue,
                info,
                pipelines: PipelineCache::new(),
                pool: BufferPool::new(),
            }),
        })
    }

    pub fn adapter_name(&self) -> &str {
        &self.ctx.info.name
    }

    pub fn pool(&self) -> &BufferPool {
        &self.ctx.pool
    }

    /// Free all cached device buffers.
    pub fn empty_cache(&self) {
        self.ctx.pool.empty_cache();
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.ctx.pool.stats()
    }

    /// Number of kernels compiled so far.
    pub fn pipeline_count(&self) -> usize {
        self.ctx.pipelines.len()
    }

    fn same(&self, other: &GpuDevice) -> bool {
        Arc::ptr_eq(&self.ctx, &other.ctx)
    }

    fn wrap(&self, buffer: Buffer, len: usize) -> GpuStorage {
        GpuStorage {
            buffer,
            len,
            device: self.clone(),
        }
    }

    fn alloc(&self, len: usize) -> Buffer {
        self.ctx.pool.alloc(&self.ctx.device, byte_size(len))
    }

    fn upload(&self, data: &[f32]) -> GpuStorage {
        let buffer = self.alloc(data.len());
        if !data.is_empty() {
            self.ctx
                .queue
                .write_buffer(&buffer, 0, bytemuck::cast_slice(data));
        }
        self.wrap(buffer, data.len())
    }

    /// Blocking copy of `len` elements starting at element `offset`.
    fn download(&self, buffer: &Buffer, offset: usize, len: usize) -> Result<Vec<f32>> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let ctx = &self.ctx;
        let bytes = byte_size(len);
        let staging = ctx.device.create_buffer(&BufferDescriptor {
            label: Some("marten_staging"),
            size: bytes,
            usage: BufferUsages::MAP_READ | BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let mut encoder = ctx.device.create_command_encoder(&CommandEncoderDescriptor {
            label: Some("marten_readback"),
        });
        encoder.copy_buffer_to_buffer(buffer, byte_offset(offset), &staging, 0, bytes);
        ctx.queue.submit(std::iter::once(encoder.finish()));

        let slice = staging.slice(..);
        let (sender, receiver) = mpsc::channel();
        slice.map_async(MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        ctx.device
            .poll(PollType::Wait {
                submission_index: None,
                timeout: Some(READBACK_TIMEOUT),
            })
            .map_err(|e| readback_error(format!("device poll failed: {e}")))?;
        receiver
            .recv()
            .map_err(|_| readback_error("map callback was never invoked".to_string()))?
            .map_err(|e| readback_error(format!("buffer map failed: {e}")))?;

        let out = {
            let data = slice.get_mapped_range();
            bytemuck::cast_slice::<u8, f32>(&data).to_vec()
        };
        staging.unmap();
        Ok(out)
    }

    /// Run `kernel` over `len` output elements into a fresh pooled buffer.
    fn launch(&self, kernel: &Kernel, params: &[u32], inputs: &[&Buffer], len: usize) -> Result<GpuStorage> {
        check_addressable(len)?;
        let output = self.alloc(len);
        if len > 0 {
            let ctx = &self.ctx;
            let mut encoder = ctx.device.create_command_encoder(&CommandEncoderDescriptor {
                label: Some(kernel.name),
            });
            ctx.pipelines
                .record(&ctx.device, &mut encoder, kernel, params, inputs, &output, len);
            ctx.queue.submit(std::iter::once(encoder.finish()));
        }
        Ok(self.wrap(output, len))
    }
}

impl fmt::Debug for GpuDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GpuDevice({}, {:?})", self.ctx.info.name, self.ctx.info.backend)
    }
}

impl PartialEq for GpuDevice {
    fn eq(&self, other: &Self) -> bool {
        self.same(other)
    }
}

impl BackendDevice for GpuDevice {
    fn name(&self) -> String {
        format!("gpu:{:?}", self.ctx.info.backend)
    }
}

fn readback_error(reason: String) -> Error {
    tracing::warn!(%reason, "gpu readback failed");
    Error::msg(format!("gpu readback failed: {reason}"))
}

/// Buffer size for `len` f32 elements; bindings cannot be empty.
fn byte_size(len: usize) -> u64 {
    (len.max(1) * std::mem::size_of::<f32>()) as u64
}

/// Byte position of element `offset`.
fn byte_offset(offset: usize) -> u64 {
    (offset * std::mem::size_of::<f32>()) as u64
}

/// Kernels index with u32.
fn check_addressable(len: usize) -> Result<()> {
    if u32::try_from(len).is_err() {
        marten_core::bail!("{len} elements exceed the GPU index range");
    }
    Ok(())
}

// GpuStorage

/// Pooled device buffer plus its logical element count (the buffer itself
/// may be padded).
pub struct GpuStorage {
    buffer: Buffer,
    len: usize,
    device: GpuDevice,
}

impl GpuStorage {
    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    pub fn device(&self) -> &GpuDevice {
        &self.device
    }
}

impl fmt::Debug for GpuStorage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GpuStorage(len={})", self.len)
    }
}

impl BackendStorage for GpuStorage {
    fn len(&self) -> usize {
        self.len
    }
}

// Param packing helpers

fn push_all(params: &mut Vec<u32>, values: &[usize]) {
    params.extend(values.iter().map(|&v| v as u32));
}

/// Storage range of a row-major layout.
fn dense_range(layout: &Layout) -> Option<Range<usize>> {
    layout
        .reshaped(layout.shape())
        .map(|l| l.offset()..l.offset() + l.elem_count())
}

fn same_device(a: &GpuStorage, b: &GpuStorage) -> Result<()> {
    if !a.device.same(&b.device) {
        marten_core::bail!("operands live on different GPU devices");
    }
    Ok(())
}

fn unary_code(op: UnaryOp) -> u32 {
    match op {
        UnaryOp::Neg => 0,
        UnaryOp::Abs => 1,
        UnaryOp::Sign => 2,
        UnaryOp::Exp => 3,
        UnaryOp::Log => 4,
        UnaryOp::Sqrt => 5,
        UnaryOp::Reciprocal => 6,
        UnaryOp::Sin => 7,
        UnaryOp::Cos => 8,
        UnaryOp::Tan => 9,
        UnaryOp::Asin => 10,
        UnaryOp::Acos => 11,
        UnaryOp::Atan => 12,
        UnaryOp::Sinh => 13,
        UnaryOp::Cosh => 14,
        UnaryOp::Tanh => 15,
        UnaryOp::Asinh => 16,
        UnaryOp::Acosh => 17,
        UnaryOp::Atanh => 18,
        UnaryOp::Floor => 19,
        UnaryOp::Ceil => 20,
        UnaryOp::Round => 21,
        UnaryOp::Trunc => 22,
        UnaryOp::Sigmoid => 23,
        UnaryOp::Relu => 24,
    }
}

fn binary_code(op: BinaryOp) -> u32 {
    match op {
        BinaryOp::Add => 0,
        BinaryOp::Sub => 1,
        BinaryOp::Mul => 2,
        BinaryOp::Div => 3,
        BinaryOp::Pow => 4,
    }
}

fn reduce_code(op: ReduceOp) -> u32 {
    match op {
        ReduceOp::Sum => 0,
        ReduceOp::Product => 1,
        ReduceOp::Min => 2,
        ReduceOp::Max => 3,
        ReduceOp::Mean => 4,
        ReduceOp::SumSquare => 5,
        ReduceOp::LogSum => 6,
        ReduceOp::LogSumExp => 7,
    }
}

/// Element-wise map kernel over any layout.
fn map(input: &GpuStorage, layout: &Layout, op: u32, p0: f32, p1: f32) -> Result<GpuStorage> {
    let mut params = vec![
        layout.elem_count() as u32,
        layout.rank() as u32,
        layout.offset() as u32,
        op,
        p0.to_bits(),
        p1.to_bits(),
    ];
    push_all(&mut params, layout.dims());
    push_all(&mut params, layout.strides());
    input
        .device
        .launch(&pipeline::MAP, &params, &[&input.buffer], layout.elem_count())
}

// GpuBackend

#[derive(Debug, Clone, Copy, Default)]
pub struct GpuBackend;

pub type GpuTensor = marten_core::Tensor<GpuBackend>;

impl Backend for GpuBackend {
    type Device = GpuDevice;
    type Storage = GpuStorage;

    const KIND: BackendKind = BackendKind::Gpu;

    fn from_f32_slice(data: &[f32], device: &GpuDevice) -> Result<GpuStorage> {
        check_addressable(data.len())?;
        Ok(device.upload(data))
    }

    fn full(len: usize, value: f32, device: &GpuDevice) -> Result<GpuStorage> {
        check_addressable(len)?;
        Ok(device.upload(&vec![value; len]))
    }

    fn to_f32_vec(input: &GpuStorage, layout: &Layout) -> Result<Vec<f32>> {
        if let Some(range) = dense_range(layout) {
            return input.device.download(&input.buffer, range.start, range.len());
        }
        let packed = Self::to_contiguous(input, layout)?;
        let out = packed.device.download(&packed.buffer, 0, packed.len);
        Self::release(packed, &input.device);
        out
    }

    fn read_element(input: &GpuStorage, offset: usize) -> Result<f32> {
        if offset >= input.len {
            return Err(Error::msg(format!("storage offset {offset} out of range")));
        }
        input
            .device
            .download(&input.buffer, offset, 1)?
            .first()
            .copied()
            .ok_or_else(|| Error::msg("empty readback"))
    }

    fn write_element(input: &mut GpuStorage, offset: usize, value: f32) -> Result<()> {
        if offset >= input.len {
            return Err(Error::msg(format!("storage offset {offset} out of range")));
        }
        input.device.ctx.queue.write_buffer(
            &input.buffer,
            byte_size(offset),
            bytemuck::bytes_of(&value),
        );
        Ok(())
    }

    fn release(storage: GpuStorage, device: &GpuDevice) {
        device.ctx.pool.reclaim(storage.buffer);
    }

    fn to_contiguous(input: &GpuStorage, layout: &Layout) -> Result<GpuStorage> {
        map(input, layout, OP_COPY, 0.0, 0.0)
    }

    fn cat(inputs: &[(&GpuStorage, &Layout)], out_shape: &Shape, dim: usize) -> Result<GpuStorage> {
        let (first, _) = inputs
            .first()
            .ok_or_else(|| Error::msg("cat: no inputs"))?;
        let dev = &first.device;
        let len = out_shape.elem_count();
        check_addressable(len)?;
        let output = dev.alloc(len);
        let out_strides = out_shape.stride_contiguous();

        let ctx = &dev.ctx;
        let mut encoder = ctx.device.create_command_encoder(&CommandEncoderDescriptor {
            label: Some("cat"),
        });
        let mut start = 0usize;
        for (storage, layout) in inputs {
            same_device(first, storage)?;
            let n = layout.elem_count();
            if n > 0 {
                let mut params = vec![
                    n as u32,
                    layout.rank() as u32,
                    layout.offset() as u32,
                    (start * out_strides[dim]) as u32,
                ];
                push_all(&mut params, layout.dims());
                push_all(&mut params, layout.strides());
                push_all(&mut params, &out_strides);
                ctx.pipelines.record(
                    &ctx.device,
                    &mut encoder,
                    &pipeline::PLACE,
                    &params,
                    &[&storage.buffer],
                    &output,
                    n,
                );
            }
            start += layout.dims()[dim];
        }
        ctx.queue.submit(std::iter::once(encoder.finish()));
        Ok(dev.wrap(output, len))
    }

    fn index_select(
        input: &GpuStorage,
        layout: &Layout,
        indices: &[usize],
        dim: usize,
    ) -> Result<GpuStorage> {
        let mut out_dims = layout.dims().to_vec();
        out_dims[dim] = indices.len();
        let n: usize = out_dims.iter().product();
        let mut params = vec![
            n as u32,
            layout.rank() as u32,
            dim as u32,
            layout.offset() as u32,
        ];
        push_all(&mut params, &out_dims);
        push_all(&mut params, layout.strides());
        push_all(&mut params, indices);
        input
            .device
            .launch(&pipeline::GATHER, &params, &[&input.buffer], n)
    }

    fn unary_op(op: UnaryOp, input: &GpuStorage, layout: &Layout) -> Result<GpuStorage> {
        map(input, layout, unary_code(op), 0.0, 0.0)
    }

    fn affine(input: &GpuStorage, layout: &Layout, mul: f32, add: f32) -> Result<GpuStorage> {
        map(input, layout, OP_AFFINE, mul, add)
    }

    fn clamp(input: &GpuStorage, layout: &Layout, min: f32, max: f32) -> Result<GpuStorage> {
        map(input, layout, OP_CLAMP, min, max)
    }

    fn binary_op(
        op: BinaryOp,
        lhs: &GpuStorage,
        lhs_layout: &Layout,
        rhs: &GpuStorage,
        rhs_layout: &Layout,
        alpha: f32,
        beta: f32,
    ) -> Result<GpuStorage> {
        same_device(lhs, rhs)?;
        let n = lhs_layout.elem_count();
        let mut params = vec![
            n as u32,
            lhs_layout.rank() as u32,
            binary_code(op),
            alpha.to_bits(),
            beta.to_bits(),
            lhs_layout.offset() as u32,
            rhs_layout.offset() as u32,
        ];
        push_all(&mut params, lhs_layout.dims());
        push_all(&mut params, lhs_layout.strides());
        push_all(&mut params, rhs_layout.strides());
        lhs.device
            .launch(&pipeline::BINARY, &params, &[&lhs.buffer, &rhs.buffer], n)
    }

    fn reduce_op(
        op: ReduceOp,
        input: &GpuStorage,
        layout: &Layout,
        axes: &[usize],
        keep_dim: bool,
    ) -> Result<GpuStorage> {
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
        let n = out_shape.elem_count();

        let mut params = vec![
            n as u32,
            group as u32,
            reduce_code(op),
            layout.offset() as u32,
            f32::INFINITY.to_bits(),
            kept_dims.len() as u32,
            red_dims.len() as u32,
        ];
        push_all(&mut params, &kept_dims);
        push_all(&mut params, &kept_strides);
        push_all(&mut params, &red_dims);
        push_all(&mut params, &red_strides);
        input
            .device
            .launch(&pipeline::REDUCE, &params, &[&input.buffer], n)
    }

    fn matmul(
        lhs: &GpuStorage,
        lhs_layout: &Layout,
        rhs: &GpuStorage,
        rhs_layout: &Layout,
    ) -> Result<GpuStorage> {
        same_device(lhs, rhs)?;
        let ld = lhs_layout.dims();
        let rd = rhs_layout.dims();
        let rank = ld.len();
        let (m, k, n) = (ld[rank - 2], ld[rank - 1], rd[rd.len() - 1]);
        let batch: usize = ld[..rank - 2].iter().product();

        // the kernel wants row-major operands
        let lhs_packed = match dense_range(lhs_layout) {
            Some(_) => None,
            None => Some(Self::to_contiguous(lhs, lhs_layout)?),
        };
        let rhs_packed = match dense_range(rhs_layout) {
            Some(_) => None,
            None => Some(Self::to_contiguous(rhs, rhs_layout)?),
        };
        let (lbuf, loff) = match &lhs_packed {
            Some(p) => (&p.buffer, 0),
            None => (&lhs.buffer, lhs_layout.offset()),
        };
        let (rbuf, roff) = match &rhs_packed {
            Some(p) => (&p.buffer, 0),
            None => (&rhs.buffer, rhs_layout.offset()),
        };

        let params = [batch, m, k, n, loff, roff].map(|v| v as u32);
        let out = lhs
            .device
            .launch(&pipeline::MATMUL, &params, &[lbuf, rbuf], batch * m * n);
        for p in [lhs_packed, rhs_packed].into_iter().flatten() {
            Self::release(p, &lhs.device);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_size_never_zero() {
        assert_eq!(byte_size(0), 4);
        assert_eq!(byte_size(3), 12);
    }

    #[test]
    fn test_byte_offset_starts_at_zero() {
        assert_eq!(byte_offset(0), 0);
        assert_eq!(byte_offset(5), 20);
    }

    #[test]
    fn test_dense_range() {
        let l = Layout::contiguous(Shape::from((2, 3)));
        assert_eq!(dense_range(&l), Some(0..6));
        let t = l.transpose(0, 1).unwrap();
        assert_eq!(dense_range(&t), None);
    }

    #[test]
    fn test_unary_codes_are_distinct() {
        use UnaryOp::*;
        let ops = [
            Neg, Abs, Sign, Exp, Log, Sqrt, Reciprocal, Sin, Cos, Tan, Asin, Acos, Atan, Sinh,
            Cosh, Tanh, Asinh, Acosh, Atanh, Floor, Ceil, Round, Trunc, Sigmoid, Relu,
        ];
        let mut codes: Vec<u32> = ops.iter().map(|&op| unary_code(op)).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), ops.len());
        assert!(codes.iter().all(|&c| c < OP_AFFINE));
    }
}
