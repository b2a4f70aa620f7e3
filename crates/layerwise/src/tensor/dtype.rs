//! Enumerates the element types a layer can produce or consume.

use serde::{Deserialize, Serialize};

/// Logical element type carried by tensors and constants.
///
/// Every element occupies one 32-bit storage lane regardless of its logical
/// type: floats are stored as IEEE-754 bits and the integer-like types are
/// stored widened to `i32`. Buffers can therefore be recycled across dtypes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DType {
    /// 32-bit floating point following IEEE-754 semantics.
    F32,
    /// 32-bit signed integer, used for shapes, indices and counts.
    I32,
    /// 16-bit signed integer, widened to 32 bits in storage.
    I16,
    /// Unsigned byte, widened to 32 bits in storage.
    U8,
    /// Boolean stored as `0`/`1`.
    Bool,
}

impl DType {
    /// Returns `true` for the floating-point representation.
    pub fn is_float(self) -> bool {
        matches!(self, DType::F32)
    }

    /// Wraps an integer into the value range of this dtype.
    pub fn wrap_int(self, value: i64) -> i32 {
        match self {
            DType::I32 | DType::F32 => value as i32,
            DType::I16 => value as i16 as i32,
            DType::U8 => value as u8 as i32,
            DType::Bool => i32::from(value != 0),
        }
    }
}
