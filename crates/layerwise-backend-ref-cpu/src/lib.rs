//! Reference CPU kernels for the layerwise engine, plus host-memory
//! emulators of the accelerator backends.

pub mod cpu;
pub mod emulator;
mod linalg;

use std::sync::Arc;

use layerwise::backend::registry::register_backend;
use layerwise::backend::{Backend, BackendType};

pub use cpu::{execute_operation, CpuBackend};
pub use emulator::DeviceEmulator;

/// Accelerator backend types served by [`DeviceEmulator`].
pub const EMULATED_BACKENDS: [BackendType; 3] = [
    BackendType::GpuCompute,
    BackendType::GpuPixel,
    BackendType::GpuCommandBuffer,
];

/// Register the CPU backend with the global backend registry.
pub fn register_cpu_backend() {
    register_backend(BackendType::Cpu, || -> Arc<dyn Backend> { Arc::new(CpuBackend::new()) });
}

/// Register a [`DeviceEmulator`] for every accelerator backend type.
pub fn register_emulated_backends() {
    for ty in EMULATED_BACKENDS {
        register_backend(ty, move || -> Arc<dyn Backend> { Arc::new(DeviceEmulator::new(ty)) });
    }
}

/// Register the CPU backend and all emulated accelerators.
pub fn register_all() {
    register_cpu_backend();
    register_emulated_backends();
}
