//! Shaped, typed tensors backed by a pooled [`Buffer`].

use std::fmt;

use anyhow::{bail, Result};

use super::buffer::{Buffer, DeviceKind};
use super::dtype::DType;
use super::shape::Shape;
use crate::error::EngineError;

/// Metadata wrapper of a tensor, recycled separately from its buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorHeader {
    shape: Shape,
    dtype: DType,
}

impl TensorHeader {
    pub fn new(shape: Shape, dtype: DType) -> Self {
        Self { shape, dtype }
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// Retargets a recycled header; the dimension storage is reused.
    pub fn reshape(&mut self, shape: &Shape) {
        self.shape.assign(shape.dims());
    }
}

/// Typed array value flowing between layers.
pub struct Tensor {
    header: TensorHeader,
    buffer: Buffer,
}

impl Tensor {
    /// Joins a header with a buffer large enough to hold it.
    pub fn from_parts(header: TensorHeader, buffer: Buffer) -> Self {
        debug_assert!(buffer.capacity() >= header.shape.num_elements());
        Self { header, buffer }
    }

    /// Splits the tensor back into its recyclable parts.
    pub fn into_parts(self) -> (TensorHeader, Buffer) {
        (self.header, self.buffer)
    }

    /// Constructs a host `F32` tensor, validating the length against the shape.
    pub fn from_f32(shape: Shape, data: Vec<f32>) -> Result<Self> {
        if data.len() != shape.num_elements() {
            bail!(
                "tensor data length ({}) does not match shape {}",
                data.len(),
                shape
            );
        }
        let lanes = data.into_iter().map(f32::to_bits).collect();
        Ok(Self {
            header: TensorHeader::new(shape, DType::F32),
            buffer: Buffer::from_lanes(DeviceKind::Cpu, lanes),
        })
    }

    /// Constructs a host integer-like tensor, wrapping values into `dtype`.
    pub fn from_i32(shape: Shape, dtype: DType, data: Vec<i32>) -> Result<Self> {
        if dtype.is_float() {
            bail!("from_i32 requires an integer dtype, got {:?}", dtype);
        }
        if data.len() != shape.num_elements() {
            bail!(
                "tensor data length ({}) does not match shape {}",
                data.len(),
                shape
            );
        }
        let lanes = data
            .into_iter()
            .map(|v| dtype.wrap_int(i64::from(v)) as u32)
            .collect();
        Ok(Self {
            header: TensorHeader::new(shape, dtype),
            buffer: Buffer::from_lanes(DeviceKind::Cpu, lanes),
        })
    }

    /// Zero-filled tensor in the requested memory space.
    pub fn zeros(shape: Shape, dtype: DType, device: DeviceKind) -> Self {
        let len = shape.num_elements();
        Self {
            header: TensorHeader::new(shape, dtype),
            buffer: Buffer::zeroed(device, len),
        }
    }

    pub fn shape(&self) -> &Shape {
        &self.header.shape
    }

    pub fn dtype(&self) -> DType {
        self.header.dtype
    }

    pub fn header(&self) -> &TensorHeader {
        &self.header
    }

    pub fn device(&self) -> DeviceKind {
        self.buffer.device()
    }

    /// Lane count of the backing buffer (may exceed [`Tensor::len`]).
    pub fn capacity(&self) -> usize {
        self.buffer.capacity()
    }

    /// Returns the total number of elements stored in the tensor.
    pub fn len(&self) -> usize {
        self.header.shape.num_elements()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Float view of the used prefix of the buffer.
    pub fn as_f32(&self) -> &[f32] {
        bytemuck::cast_slice(&self.buffer.lanes()[..self.len()])
    }

    pub fn as_f32_mut(&mut self) -> &mut [f32] {
        let len = self.len();
        bytemuck::cast_slice_mut(&mut self.buffer.lanes_mut()[..len])
    }

    /// Integer view of the used prefix of the buffer.
    pub fn as_i32(&self) -> &[i32] {
        bytemuck::cast_slice(&self.buffer.lanes()[..self.len()])
    }

    pub fn as_i32_mut(&mut self) -> &mut [i32] {
        let len = self.len();
        bytemuck::cast_slice_mut(&mut self.buffer.lanes_mut()[..len])
    }

    /// Copies the contents out as floats, converting integer dtypes.
    pub fn to_f32_vec(&self) -> Vec<f32> {
        if self.dtype().is_float() {
            self.as_f32().to_vec()
        } else {
            self.as_i32().iter().map(|&v| v as f32).collect()
        }
    }

    /// Copies the contents out as integers, truncating float dtypes.
    pub fn to_i32_vec(&self) -> Vec<i32> {
        if self.dtype().is_float() {
            self.as_f32().iter().map(|&v| v as i32).collect()
        } else {
            self.as_i32().to_vec()
        }
    }

    /// Reads integer values on the host, e.g. a shape or axes operand.
    pub fn host_ints(&self) -> Result<Vec<i64>, EngineError> {
        self.ensure_host_readable()?;
        Ok(if self.dtype().is_float() {
            self.as_f32().iter().map(|&v| v as i64).collect()
        } else {
            self.as_i32().iter().map(|&v| i64::from(v)).collect()
        })
    }

    /// Reads float values on the host, e.g. a scalar range bound.
    pub fn host_floats(&self) -> Result<Vec<f32>, EngineError> {
        self.ensure_host_readable()?;
        Ok(self.to_f32_vec())
    }

    fn ensure_host_readable(&self) -> Result<(), EngineError> {
        if self.device().is_host() {
            return Ok(());
        }
        Err(EngineError::kernel(
            "host-read",
            format!("tensor resident on {} is not host readable", self.device()),
        ))
    }

    /// Moves the buffer into `device`, returning whether a transfer happened.
    pub fn pin(&mut self, device: DeviceKind) -> bool {
        if self.device() == device {
            return false;
        }
        self.buffer.transfer(device);
        true
    }

    /// Deep copy into a fresh, exactly sized buffer.
    pub fn duplicate(&self) -> Self {
        let lanes = self.buffer.lanes()[..self.len()].to_vec();
        Self {
            header: self.header.clone(),
            buffer: Buffer::from_lanes(self.device(), lanes),
        }
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("shape", self.shape())
            .field("dtype", &self.dtype())
            .field("device", &self.device())
            .finish()
    }
}
