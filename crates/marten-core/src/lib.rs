//! # marten-core
//!
//! Core tensor primitives and the backend contract for marten.
//!
//! This crate provides:
//! - [`Shape`] / [`Layout`]: shapes, stride-0 broadcasting, strided views
//! - [`DType`]: logical element types
//! - [`Backend`] trait: the primitive kernels every backend implements
//! - [`Tensor`]: the backend-generic array with broadcasting, reshape,
//!   slicing, padding, gather, softmax and matrix products built on top
//! - [`Error`]: the one error type shared by the whole workspace

pub mod backend;
pub mod dtype;
pub mod error;
pub mod layout;
pub mod shape;
pub mod tensor;

pub use backend::{Backend, BackendDevice, BackendKind, BackendStorage, BinaryOp, ReduceOp, UnaryOp};
pub use dtype::DType;
pub use error::{Error, Result};
pub use layout::Layout;
pub use shape::Shape;
pub use tensor::{PadMode, Tensor};
