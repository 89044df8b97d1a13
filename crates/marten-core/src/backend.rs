use std::fmt;

use crate::error::Result;
use crate::layout::Layout;
use crate::shape::Shape;

// Backend: the tensor contract every compute backend satisfies
//
// A backend brings a device handle, a storage type and the primitive
// kernels. Everything else a graph needs (broadcasting, reshape, slicing,
// softmax, gemm, padding) is written once in `Tensor<B>` on top of these
// primitives, so all backends agree on shape semantics by construction.
//
// Storage holds f32 elements. Layouts passed to a kernel may be strided or
// broadcast (stride 0); binary operands arrive already expanded to the same
// shape. Every kernel returns fresh contiguous storage.
//
// Backends are a closed set, identified by `BackendKind`. The facade crate
// wraps one `Tensor<B>` per kind in an enum and refuses to mix kinds.

/// The closed set of backend variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Scalar reference implementation.
    Cpu,
    /// Native-compiled kernels with a pooled host allocator.
    Native,
    /// GPU compute shaders with a recycling buffer pool.
    Gpu,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BackendKind::Cpu => "cpu",
            BackendKind::Native => "native",
            BackendKind::Gpu => "gpu",
        };
        write!(f, "{s}")
    }
}

/// Identifies a compute device (e.g. "cpu", "native", "gpu:Vulkan").
pub trait BackendDevice: Clone + fmt::Debug + Send + Sync + 'static {
    fn name(&self) -> String;
}

/// A storage buffer holding tensor elements on a specific device.
pub trait BackendStorage: fmt::Debug + Send + Sync + 'static {
    /// Number of elements the buffer holds.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Element-wise binary operations.
///
/// Every binary kernel computes `op(alpha * lhs, beta * rhs)`; plain
/// arithmetic passes `alpha = beta = 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

impl BinaryOp {
    #[inline]
    pub fn apply(self, a: f32, b: f32) -> f32 {
        match self {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => a / b,
            BinaryOp::Pow => a.powf(b),
        }
    }
}

/// Element-wise unary operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Neg,
    Abs,
    Sign,
    Exp,
    Log,
    Sqrt,
    Reciprocal,
    Sin,
    Cos,
    Tan,
    Asin,
    Acos,
    Atan,
    Sinh,
    Cosh,
    Tanh,
    Asinh,
    Acosh,
    Atanh,
    Floor,
    Ceil,
    Round,
    Trunc,
    Sigmoid,
    Relu,
}

impl UnaryOp {
    #[inline]
    pub fn apply(self, x: f32) -> f32 {
        match self {
            UnaryOp::Neg => -x,
            UnaryOp::Abs => x.abs(),
            UnaryOp::Sign => {
                if x > 0.0 {
                    1.0
                } else if x < 0.0 {
                    -1.0
                } else {
                    0.0
                }
            }
            UnaryOp::Exp => x.exp(),
            UnaryOp::Log => x.ln(),
            UnaryOp::Sqrt => x.sqrt(),
            UnaryOp::Reciprocal => 1.0 / x,
            UnaryOp::Sin => x.sin(),
            UnaryOp::Cos => x.cos(),
            UnaryOp::Tan => x.tan(),
            UnaryOp::Asin => x.asin(),
            UnaryOp::Acos => x.acos(),
            UnaryOp::Atan => x.atan(),
            UnaryOp::Sinh => x.sinh(),
            UnaryOp::Cosh => x.cosh(),
            UnaryOp::Tanh => x.tanh(),
            UnaryOp::Asinh => x.asinh(),
            UnaryOp::Acosh => x.acosh(),
            UnaryOp::Atanh => x.atanh(),
            UnaryOp::Floor => x.floor(),
            UnaryOp::Ceil => x.ceil(),
            // ONNX rounds half to even
            UnaryOp::Round => x.round_ties_even(),
            UnaryOp::Trunc => x.trunc(),
            UnaryOp::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            UnaryOp::Relu => x.max(0.0),
        }
    }
}

/// Reductions over a set of axes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReduceOp {
    Sum,
    Product,
    Min,
    Max,
    Mean,
    SumSquare,
    LogSum,
    LogSumExp,
}

impl ReduceOp {
    /// Fold a group of values into one. Empty groups give the identity
    /// (0 for sums, 1 for products, +/-inf for min/max).
    pub fn fold(self, values: impl Iterator<Item = f32> + Clone) -> f32 {
        match self {
            ReduceOp::Sum => values.sum(),
            ReduceOp::Product => values.product(),
            ReduceOp::Min => values.fold(f32::INFINITY, f32::min),
            ReduceOp::Max => values.fold(f32::NEG_INFINITY, f32::max),
            ReduceOp::Mean => {
                let (sum, n) = values.fold((0.0f32, 0usize), |(s, n), v| (s + v, n + 1));
                sum / n as f32
            }
            ReduceOp::SumSquare => values.map(|v| v * v).sum(),
            ReduceOp::LogSum => values.sum::<f32>().ln(),
            ReduceOp::LogSumExp => {
                let max = values.clone().fold(f32::NEG_INFINITY, f32::max);
                if max.is_infinite() {
                    return max;
                }
                max + values.map(|v| (v - max).exp()).sum::<f32>().ln()
            }
        }
    }
}

/// Split a shape into the axes being reduced and the ones kept.
///
/// Returns the output shape (with or without the reduced axes) and, for
/// convenience, the number of elements folded into each output element.
pub fn reduced_shape(shape: &Shape, axes: &[usize], keep_dim: bool) -> (Shape, usize) {
    let mut out = Vec::with_capacity(shape.rank());
    let mut group = 1usize;
    for (i, &d) in shape.dims().iter().enumerate() {
        if axes.contains(&i) {
            group *= d;
            if keep_dim {
                out.push(1);
            }
        } else {
            out.push(d);
        }
    }
    (Shape::new(out), group)
}

/// The main Backend trait.
///
/// All operations take storage + layout and return new storage; nothing is
/// mutated in place except through `write_element`.
pub trait Backend: Clone + Send + Sync + fmt::Debug + 'static {
    type Device: BackendDevice;
    type Storage: BackendStorage;

    /// Which variant of the closed backend set this is.
    const KIND: BackendKind;

    //  Creation

    /// Upload host data.
    fn from_f32_slice(data: &[f32], device: &Self::Device) -> Result<Self::Storage>;

    /// Allocate `len` elements all set to `value`.
    fn full(len: usize, value: f32, device: &Self::Device) -> Result<Self::Storage>;

    //  Host access

    /// Download the elements of `layout` in logical order.
    fn to_f32_vec(input: &Self::Storage, layout: &Layout) -> Result<Vec<f32>>;

    /// Read one element by storage offset.
    fn read_element(input: &Self::Storage, offset: usize) -> Result<f32>;

    /// Overwrite one element by storage offset.
    fn write_element(input: &mut Self::Storage, offset: usize, value: f32) -> Result<()>;

    //  Lifetime

    /// Hand a dead buffer back to the backend. Pooling backends keep it for
    /// reuse; others free it.
    fn release(storage: Self::Storage, device: &Self::Device);

    //  Data movement

    /// Materialize a strided or broadcast layout into fresh row-major storage.
    fn to_contiguous(input: &Self::Storage, layout: &Layout) -> Result<Self::Storage>;

    /// Concatenate inputs along `dim`. `out_shape` is pre-validated.
    fn cat(
        inputs: &[(&Self::Storage, &Layout)],
        out_shape: &Shape,
        dim: usize,
    ) -> Result<Self::Storage>;

    /// Pick entries along `dim` by position; `indices` are already in range.
    fn index_select(
        input: &Self::Storage,
        layout: &Layout,
        indices: &[usize],
        dim: usize,
    ) -> Result<Self::Storage>;

    //  Element-wise

    fn unary_op(op: UnaryOp, input: &Self::Storage, layout: &Layout) -> Result<Self::Storage>;

    /// `input * mul + add`.
    fn affine(input: &Self::Storage, layout: &Layout, mul: f32, add: f32)
        -> Result<Self::Storage>;

    fn clamp(input: &Self::Storage, layout: &Layout, min: f32, max: f32)
        -> Result<Self::Storage>;

    /// `op(alpha * lhs, beta * rhs)`. Both layouts have the same shape.
    fn binary_op(
        op: BinaryOp,
        lhs: &Self::Storage,
        lhs_layout: &Layout,
        rhs: &Self::Storage,
        rhs_layout: &Layout,
        alpha: f32,
        beta: f32,
    ) -> Result<Self::Storage>;

    //  Reductions

    /// Reduce over `axes` (sorted, unique). An empty axis list reduces
    /// nothing and copies the input.
    fn reduce_op(
        op: ReduceOp,
        input: &Self::Storage,
        layout: &Layout,
        axes: &[usize],
        keep_dim: bool,
    ) -> Result<Self::Storage>;

    //  Matrix multiplication

    /// Batched matmul: `[..., m, k] @ [..., k, n]`. Batch axes are equal.
    fn matmul(
        lhs: &Self::Storage,
        lhs_layout: &Layout,
        rhs: &Self::Storage,
        rhs_layout: &Layout,
    ) -> Result<Self::Storage>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_sum_exp_is_stable() {
        let v = [1000.0f32, 1000.0];
        let r = ReduceOp::LogSumExp.fold(v.iter().copied());
        assert!((r - (1000.0 + 2f32.ln())).abs() < 1e-3);
    }

    #[test]
    fn test_reduce_identities() {
        let empty: [f32; 0] = [];
        assert_eq!(ReduceOp::Sum.fold(empty.iter().copied()), 0.0);
        assert_eq!(ReduceOp::Product.fold(empty.iter().copied()), 1.0);
        assert_eq!(ReduceOp::Max.fold(empty.iter().copied()), f32::NEG_INFINITY);
    }

    #[test]
    fn test_reduced_shape() {
        let s = Shape::from((2, 3, 4));
        let (out, group) = reduced_shape(&s, &[1], true);
        assert_eq!(out.dims(), &[2, 1, 4]);
        assert_eq!(group, 3);
        let (out, group) = reduced_shape(&s, &[0, 2], false);
        assert_eq!(out.dims(), &[3]);
        assert_eq!(group, 8);
    }

    #[test]
    fn test_round_half_even() {
        assert_eq!(UnaryOp::Round.apply(2.5), 2.0);
        assert_eq!(UnaryOp::Round.apply(3.5), 4.0);
        assert_eq!(UnaryOp::Sign.apply(-0.0), 0.0);
    }
}
