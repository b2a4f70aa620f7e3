//! Per-operation input classification tables.

use crate::graph::OpKind;

/// How a layer reads one of its inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputUse {
    /// Element values are consumed by the kernel on the executing device.
    Data,
    /// Element values are read on the host (shapes, counts, axes).
    HostRead,
    /// Only the shape or dtype is inspected; the contents are never read.
    Metadata,
}

impl InputUse {
    /// Classifies input `position` of `kind`.
    pub fn of(kind: OpKind, position: usize) -> Self {
        if host_read_inputs(kind).contains(&position) {
            InputUse::HostRead
        } else if is_data_dependency(kind, position) {
            InputUse::Data
        } else {
            InputUse::Metadata
        }
    }
}

/// Input positions of `kind` whose values are read on the host.
pub fn host_read_inputs(kind: OpKind) -> &'static [usize] {
    match kind {
        OpKind::ConstantOfShape => &[0],
        OpKind::Reshape | OpKind::Expand | OpKind::Gather | OpKind::TopK => &[1],
        OpKind::Slice => &[1, 2, 3, 4],
        OpKind::Pad => &[1, 2, 3],
        OpKind::Range => &[0, 1, 2],
        OpKind::ReduceSum | OpKind::ReduceMean => &[1],
        _ => &[],
    }
}

/// False when input `position` of `kind` only contributes its shape or type.
pub fn is_data_dependency(kind: OpKind, position: usize) -> bool {
    !matches!(
        (kind, position),
        (OpKind::Shape, 0)
            | (OpKind::Size, 0)
            | (OpKind::RandomNormalLike, 0)
            | (OpKind::RandomUniformLike, 0)
            | (OpKind::CastLike, 1)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_probes_are_metadata_reads() {
        assert_eq!(InputUse::of(OpKind::Shape, 0), InputUse::Metadata);
        assert_eq!(InputUse::of(OpKind::CastLike, 0), InputUse::Data);
        assert_eq!(InputUse::of(OpKind::CastLike, 1), InputUse::Metadata);
        assert_eq!(InputUse::of(OpKind::Reshape, 1), InputUse::HostRead);
        assert_eq!(InputUse::of(OpKind::Reshape, 0), InputUse::Data);
    }

    #[test]
    fn pad_constant_value_is_host_read() {
        assert_eq!(host_read_inputs(OpKind::Pad), &[1, 2, 3]);
        assert!(host_read_inputs(OpKind::Relu).is_empty());
    }
}
