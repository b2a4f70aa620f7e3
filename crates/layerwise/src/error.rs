//! Error taxonomy surfaced by graph validation, storage and dispatch.

use thiserror::Error;

use crate::graph::{LayerId, TensorId};

/// Malformed graph detected during validation or optimization.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StructuralError {
    #[error("layer {layer} reads tensor {tensor} which has no producer")]
    MissingProducer { layer: LayerId, tensor: TensorId },
    #[error("layer {layer} reads tensor {tensor} before it is produced (cycle or unsorted graph)")]
    UseBeforeDefinition { layer: LayerId, tensor: TensorId },
    #[error("tensor {0} is defined more than once")]
    DuplicateTensor(TensorId),
    #[error("layer id {0} is used by more than one layer")]
    DuplicateLayerId(LayerId),
    #[error("graph output name '{0}' is declared more than once")]
    DuplicateOutputName(String),
    #[error("graph input name '{0}' is declared more than once")]
    DuplicateInputName(String),
    #[error("graph output '{name}' refers to unknown tensor {tensor}")]
    UnknownOutput { name: String, tensor: TensorId },
    #[error("constant {0} data does not match its shape or dtype")]
    MalformedConstant(TensorId),
    #[error("layer {layer} has {found} inputs, operation {op} expects {expected}")]
    Arity {
        layer: LayerId,
        op: &'static str,
        expected: String,
        found: usize,
    },
}

/// Errors returned by the engine. None of them are recovered locally.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Structural(#[from] StructuralError),
    #[error("operation {op} is not supported by the {backend} backend: {reason}")]
    UnsupportedOperation {
        op: &'static str,
        backend: String,
        reason: String,
    },
    #[error("tensor {0} has no live storage (disposed or never produced)")]
    MissingTensor(TensorId),
    #[error("kernel {op} failed: {message}")]
    Kernel { op: &'static str, message: String },
    #[error("graph has no {kind} named '{name}'")]
    UnknownBinding { kind: &'static str, name: String },
    #[error("input '{name}' expects {expected}, got {found}")]
    InputMismatch {
        name: String,
        expected: String,
        found: String,
    },
    #[error("no {0} backend is registered")]
    BackendUnavailable(String),
    #[error("worker is {state}, cannot {action}")]
    InvalidState {
        state: &'static str,
        action: &'static str,
    },
}

impl EngineError {
    pub fn kernel(op: &'static str, message: impl Into<String>) -> Self {
        EngineError::Kernel {
            op,
            message: message.into(),
        }
    }

    pub fn unsupported(
        op: &'static str,
        backend: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        EngineError::UnsupportedOperation {
            op,
            backend: backend.into(),
            reason: reason.into(),
        }
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
