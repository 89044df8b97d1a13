//! # Marten
//!
//! An ONNX graph runtime: load a model, run it as a dataflow graph, move it
//! between tensor backends.
//!
//! This is the top-level facade crate that re-exports everything you need.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use marten::prelude::*;
//!
//! let model = Model::load_file("model.onnx", LoadOptions::default())?;
//! let x = AnyTensor::from_slice(&[1.0, 2.0, 3.0, 4.0], (2, 2))?;
//! let outputs = model.forward(&[x])?;
//! # Ok::<(), marten::Error>(())
//! ```
//!
//! ## Architecture
//!
//! | Crate | Purpose |
//! |-------|----------|
//! | `marten-core` | Tensor, Shape, DType, Layout, Backend trait, broadcasting |
//! | `marten-cpu` | Scalar reference backend |
//! | `marten-native` | Native backend with rayon kernels and a pooled host allocator |
//! | `marten-gpu` | wgpu compute backend with a recycling buffer pool (feature `gpu`) |
//!
//! ## Modules
//!
//! - [`onnx`] - ONNX protobuf decoding and encoding
//! - [`graph`] - Loader: validated node, edge and constant tables
//! - [`exec`] - Dataflow scheduler with release-after-last-use
//! - [`ops`] - Operator registry and the built-in operators
//! - [`model`] - Load, run and switch backends
//! - [`logging`] - `tracing` subscriber setup

/// Re-export core types.
pub use marten_core::{
    bail, Backend, BackendDevice, BackendKind, BackendStorage, BinaryOp, DType, Error, Layout,
    PadMode, ReduceOp, Result, Shape, Tensor, UnaryOp,
};

/// Re-export the reference backend.
pub use marten_cpu::{CpuBackend, CpuDevice, CpuStorage, CpuTensor};

/// Re-export the native backend.
pub use marten_native::{HostPool, NativeBackend, NativeDevice, NativeStorage, NativeTensor, PoolStats};

/// Re-export the GPU backend (requires the `gpu` feature).
#[cfg(feature = "gpu")]
pub use marten_gpu::{GpuBackend, GpuDevice, GpuStorage, GpuTensor};

/// Load options.
pub mod config;

/// Dataflow scheduler.
pub mod exec;

/// Graph loader.
pub mod graph;

/// Logging setup.
pub mod logging;

/// Model facade.
pub mod model;

/// ONNX wire format.
pub mod onnx;

/// Operator registry and built-in operators.
pub mod ops;

/// Backend-erased tensors.
pub mod tensor;

pub use config::LoadOptions;
pub use exec::ForwardTrace;
pub use graph::{Edge, Graph, Node, NodeId};
pub use model::Model;
pub use ops::{Inputs, NodeContext, OpConfig, OpDef, OperatorRegistry};
pub use tensor::{AnyBackend, AnyTensor, Device};

/// Convenient glob import: `use marten::prelude::*;`
pub mod prelude {
    pub use crate::{
        AnyTensor, BackendKind, DType, Device, Error, ForwardTrace, LoadOptions, Model,
        NativeDevice, OpConfig, OpDef, OperatorRegistry, Result, Shape,
    };

    #[cfg(feature = "gpu")]
    pub use crate::GpuDevice;
}
