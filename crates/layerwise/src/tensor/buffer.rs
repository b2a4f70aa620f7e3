//! Raw backing storage for tensors.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Memory space a buffer currently lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceKind {
    /// Host memory, directly readable by the engine.
    Cpu,
    /// Accelerator linear memory (compute and command-buffer backends).
    GpuBuffer,
    /// Accelerator texture memory (pixel-shader backend).
    GpuTexture,
}

impl DeviceKind {
    pub fn is_host(self) -> bool {
        matches!(self, DeviceKind::Cpu)
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceKind::Cpu => "cpu",
            DeviceKind::GpuBuffer => "gpu-buffer",
            DeviceKind::GpuTexture => "gpu-texture",
        };
        f.write_str(name)
    }
}

/// Block of 32-bit storage lanes resident in one memory space.
///
/// The capacity of a buffer is its lane count; a tensor may use a prefix of a
/// larger recycled buffer.
pub struct Buffer {
    device: DeviceKind,
    lanes: Vec<u32>,
}

impl Buffer {
    /// Allocates a zero-filled buffer of `capacity` lanes.
    pub fn zeroed(device: DeviceKind, capacity: usize) -> Self {
        Self {
            device,
            lanes: vec![0; capacity],
        }
    }

    pub(crate) fn from_lanes(device: DeviceKind, lanes: Vec<u32>) -> Self {
        Self { device, lanes }
    }

    pub fn device(&self) -> DeviceKind {
        self.device
    }

    /// Number of lanes this buffer can hold.
    pub fn capacity(&self) -> usize {
        self.lanes.len()
    }

    pub(crate) fn lanes(&self) -> &[u32] {
        &self.lanes
    }

    pub(crate) fn lanes_mut(&mut self) -> &mut [u32] {
        &mut self.lanes
    }

    /// Moves the buffer into another memory space.
    ///
    /// Host and accelerator memory share one address space in this engine, so
    /// a transfer only retags the block; backends that own real device memory
    /// copy through their own staging path before the tensor is handed back.
    pub(crate) fn transfer(&mut self, device: DeviceKind) {
        self.device = device;
    }
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("device", &self.device)
            .field("capacity", &self.lanes.len())
            .finish()
    }
}
