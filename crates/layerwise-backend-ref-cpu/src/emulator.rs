//! Host-memory stand-in for accelerator backends.
//!
//! The emulator runs the reference kernels but enforces the residency contract
//! of a real device: data inputs must already live in its memory space and
//! host-read operands must be pinned to the CPU. Executions are queued until
//! [`Backend::flush`], which lets callers observe cooperative scheduling.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};

use layerwise::backend::{Backend, BackendError, BackendResult, BackendType};
use layerwise::fallback::InputUse;
use layerwise::graph::{OpKind, Operation};
use layerwise::tensor::{DeviceKind, Tensor};

use crate::cpu::execute_operation;

#[derive(Debug)]
pub struct DeviceEmulator {
    backend_type: BackendType,
    unsupported: HashSet<OpKind>,
    executed: AtomicUsize,
    pending: AtomicUsize,
    flushes: AtomicUsize,
}

impl DeviceEmulator {
    pub fn new(backend_type: BackendType) -> Self {
        Self {
            backend_type,
            unsupported: HashSet::new(),
            executed: AtomicUsize::new(0),
            pending: AtomicUsize::new(0),
            flushes: AtomicUsize::new(0),
        }
    }

    /// Removes kernels for `kinds`, forcing those layers onto the CPU.
    pub fn without(mut self, kinds: impl IntoIterator<Item = OpKind>) -> Self {
        self.unsupported.extend(kinds);
        self
    }

    /// Number of layers executed so far.
    pub fn executed_count(&self) -> usize {
        self.executed.load(Ordering::Relaxed)
    }

    /// Executions recorded since the last flush.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Relaxed)
    }

    pub fn flush_count(&self) -> usize {
        self.flushes.load(Ordering::Relaxed)
    }

    fn check_residency(
        &self,
        op: &Operation,
        inputs: &[Option<&Tensor>],
        outputs: &[Tensor],
    ) -> BackendResult<()> {
        let device = self.device();
        for (position, tensor) in inputs.iter().enumerate() {
            let Some(tensor) = tensor else { continue };
            let expected = match InputUse::of(op.kind(), position) {
                InputUse::Data => device,
                InputUse::HostRead => DeviceKind::Cpu,
                InputUse::Metadata => continue,
            };
            if tensor.device() != expected {
                return Err(BackendError::execution(
                    op.name(),
                    format!(
                        "input {position} resides on {}, expected {expected}",
                        tensor.device()
                    ),
                ));
            }
        }
        if let Some(out) = outputs.iter().find(|out| out.device() != device) {
            return Err(BackendError::execution(
                op.name(),
                format!("output allocated on {}, expected {device}", out.device()),
            ));
        }
        Ok(())
    }
}

impl Backend for DeviceEmulator {
    fn backend_type(&self) -> BackendType {
        self.backend_type
    }

    fn supports(&self, kind: OpKind) -> bool {
        !self.unsupported.contains(&kind)
    }

    fn execute(
        &self,
        op: &Operation,
        inputs: &[Option<&Tensor>],
        outputs: &mut [Tensor],
    ) -> BackendResult<()> {
        if !self.supports(op.kind()) {
            return Err(BackendError::unimplemented(
                op.name(),
                format!("no {} kernel", self.backend_type),
            ));
        }
        self.check_residency(op, inputs, outputs)?;
        execute_operation(op, inputs, outputs)?;
        self.executed.fetch_add(1, Ordering::Relaxed);
        self.pending.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn flush(&self) {
        let submitted = self.pending.swap(0, Ordering::Relaxed);
        self.flushes.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(backend = %self.backend_type, submitted, "flushed");
    }
}
