//! Backend capability boundary.
//!
//! A backend owns the arithmetic kernels for one execution target. The engine
//! computes output shapes, allocates outputs through the storage manager and
//! hands the backend already-pinned inputs plus pre-allocated outputs.

pub mod registry;

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::EngineError;
use crate::graph::{OpKind, Operation};
use crate::tensor::{DeviceKind, Tensor};

/// Execution target selected for a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendType {
    /// General-purpose host kernels; the universal fallback.
    Cpu,
    /// Accelerator compute kernels over linear buffers.
    GpuCompute,
    /// Accelerator pixel-shader emulation over textures.
    GpuPixel,
    /// Accelerator kernels recorded into command buffers.
    GpuCommandBuffer,
}

impl BackendType {
    /// Memory space the backend's kernels read and write.
    pub fn device(self) -> DeviceKind {
        match self {
            BackendType::Cpu => DeviceKind::Cpu,
            BackendType::GpuCompute | BackendType::GpuCommandBuffer => DeviceKind::GpuBuffer,
            BackendType::GpuPixel => DeviceKind::GpuTexture,
        }
    }

    pub fn is_cpu(self) -> bool {
        matches!(self, BackendType::Cpu)
    }
}

impl fmt::Display for BackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendType::Cpu => "cpu",
            BackendType::GpuCompute => "gpu-compute",
            BackendType::GpuPixel => "gpu-pixel",
            BackendType::GpuCommandBuffer => "gpu-command-buffer",
        };
        f.write_str(name)
    }
}

/// Failure reported by a kernel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    #[error("{op} is not implemented: {reason}")]
    Unimplemented { op: &'static str, reason: String },
    #[error("{op} failed: {message}")]
    Execution { op: &'static str, message: String },
}

impl BackendError {
    pub fn unimplemented(op: &'static str, reason: impl Into<String>) -> Self {
        BackendError::Unimplemented {
            op,
            reason: reason.into(),
        }
    }

    pub fn execution(op: &'static str, message: impl Into<String>) -> Self {
        BackendError::Execution {
            op,
            message: message.into(),
        }
    }

    /// Attaches the backend name when crossing into the engine's taxonomy.
    pub fn into_engine_error(self, backend: BackendType) -> EngineError {
        match self {
            BackendError::Unimplemented { op, reason } => {
                EngineError::unsupported(op, backend.to_string(), reason)
            }
            BackendError::Execution { op, message } => EngineError::kernel(op, message),
        }
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Kernel capability of one execution target.
pub trait Backend: Send + Sync {
    /// Returns the execution target this backend implements.
    fn backend_type(&self) -> BackendType;

    /// Memory space outputs are allocated in and inputs are pinned to.
    fn device(&self) -> DeviceKind {
        self.backend_type().device()
    }

    /// Reports whether a kernel for `kind` exists. The CPU backend must support every kind.
    fn supports(&self, kind: OpKind) -> bool;

    /// Runs `op`, reading `inputs` (`None` for absent optional inputs) and
    /// overwriting every element of the pre-shaped `outputs`.
    fn execute(
        &self,
        op: &Operation,
        inputs: &[Option<&Tensor>],
        outputs: &mut [Tensor],
    ) -> BackendResult<()>;

    /// Submits any recorded but not yet executed work.
    fn flush(&self) {}
}
