//! Layer-by-layer execution engine for pre-compiled neural network graphs.
//!
//! An imported [`Graph`] is validated, rewritten by the optimizer pipeline,
//! analysed for CPU fallback and then executed by a [`Worker`] against one of
//! the registered [`Backend`]s, with intermediate tensors recycled through the
//! [`StorageManager`].

pub mod backend;
pub mod config;
mod env;
pub mod error;
pub mod fallback;
pub mod graph;
pub mod ops;
pub mod optimizer;
pub mod passes;
pub mod storage;
pub mod tensor;
pub mod worker;

pub use backend::registry::{create_backend, has_backend, list_backends, register_backend};
pub use backend::{Backend, BackendError, BackendResult, BackendType};
pub use config::EngineConfig;
pub use error::{EngineError, EngineResult, StructuralError};
pub use fallback::{CpuFallback, FallbackSet};
pub use graph::{Graph, Layer, LayerId, OpKind, Operation, TensorId};
pub use storage::{StorageManager, StorageStats};
pub use tensor::{DType, DeviceKind, Shape, Tensor};
pub use worker::{Binding, Dispatch, Execution, Worker, WorkerState};
