//! Core tensor abstractions shared by the engine and its backends.
//!
//! Tensors are split into a reshape-able [`TensorHeader`] and a raw
//! [`Buffer`] so the storage manager can recycle both independently.

mod buffer;
mod device_tensor;
pub mod dtype;
pub mod shape;

pub use buffer::{Buffer, DeviceKind};
pub use device_tensor::{Tensor, TensorHeader};
pub use dtype::DType;
pub use shape::{normalize_axis, Dimension, Shape, SymbolicShape, MAX_RANK};
