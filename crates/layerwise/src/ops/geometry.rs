//! Parameter resolution shared by shape inference and kernels.

use crate::error::{EngineError, EngineResult};
use crate::graph::{AutoPad, ConvParams};
use crate::tensor::normalize_axis;

/// Fully resolved layout of a 2-D NCHW convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvGeometry {
    pub batch: usize,
    pub in_channels: usize,
    pub in_h: usize,
    pub in_w: usize,
    pub out_channels: usize,
    pub out_h: usize,
    pub out_w: usize,
    pub kernel_h: usize,
    pub kernel_w: usize,
    pub pad_top: usize,
    pub pad_left: usize,
    pub stride: [usize; 2],
    pub dilation: [usize; 2],
    pub group: usize,
}

impl ConvGeometry {
    pub fn resolve(params: &ConvParams, x: &[usize], kernel: &[usize]) -> EngineResult<Self> {
        let err = |msg: String| EngineError::kernel("Conv", msg);
        let [batch, in_channels, in_h, in_w] = *x else {
            return Err(err(format!("input must be rank 4 (NCHW), got {x:?}")));
        };
        let [out_channels, kernel_channels, kernel_h, kernel_w] = *kernel else {
            return Err(err(format!("kernel must be rank 4, got {kernel:?}")));
        };
        if [in_h, in_w, kernel_h, kernel_w].contains(&0) {
            return Err(err(format!("empty spatial extent: input {x:?}, kernel {kernel:?}")));
        }
        let group = params.group.max(1);
        if in_channels != kernel_channels * group || out_channels % group != 0 {
            return Err(err(format!(
                "channel mismatch: input {in_channels}, kernel {kernel_channels} x group {group}, output {out_channels}"
            )));
        }
        if params.strides.contains(&0) || params.dilations.contains(&0) {
            return Err(err("strides and dilations must be positive".to_string()));
        }
        let extent_h = (kernel_h - 1) * params.dilations[0] + 1;
        let extent_w = (kernel_w - 1) * params.dilations[1] + 1;
        let (pad_top, pad_bottom, pad_left, pad_right) = match params.auto_pad {
            AutoPad::NotSet => (params.pads[0], params.pads[2], params.pads[1], params.pads[3]),
            AutoPad::Valid => (0, 0, 0, 0),
            AutoPad::SameUpper | AutoPad::SameLower => {
                let upper = params.auto_pad == AutoPad::SameUpper;
                let (top, bottom) = same_padding(in_h, params.strides[0], extent_h, upper);
                let (left, right) = same_padding(in_w, params.strides[1], extent_w, upper);
                (top, bottom, left, right)
            }
        };
        let padded_h = in_h + pad_top + pad_bottom;
        let padded_w = in_w + pad_left + pad_right;
        if padded_h < extent_h || padded_w < extent_w {
            return Err(err(format!(
                "kernel extent {extent_h}x{extent_w} exceeds padded input {padded_h}x{padded_w}"
            )));
        }
        Ok(Self {
            batch,
            in_channels,
            in_h,
            in_w,
            out_channels,
            out_h: (padded_h - extent_h) / params.strides[0] + 1,
            out_w: (padded_w - extent_w) / params.strides[1] + 1,
            kernel_h,
            kernel_w,
            pad_top,
            pad_left,
            stride: params.strides,
            dilation: params.dilations,
            group,
        })
    }

    pub fn output_dims(&self) -> [usize; 4] {
        [self.batch, self.out_channels, self.out_h, self.out_w]
    }
}

fn same_padding(input: usize, stride: usize, extent: usize, upper: bool) -> (usize, usize) {
    let out = input.div_ceil(stride);
    let needed = ((out - 1) * stride + extent).saturating_sub(input);
    let small = needed / 2;
    let large = needed - small;
    if upper {
        (small, large)
    } else {
        (large, small)
    }
}

/// Resolved slice along one axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AxisSlice {
    pub start: i64,
    pub step: i64,
    pub len: usize,
}

/// Resolves ONNX `Slice` operands into per-axis ranges over `dims`.
pub fn resolve_slice(
    dims: &[usize],
    starts: &[i64],
    ends: &[i64],
    axes: Option<&[i64]>,
    steps: Option<&[i64]>,
) -> EngineResult<Vec<AxisSlice>> {
    let err = |msg: String| EngineError::kernel("Slice", msg);
    if starts.len() != ends.len() {
        return Err(err("starts and ends must have equal length".to_string()));
    }
    let mut slices: Vec<AxisSlice> = dims
        .iter()
        .map(|&dim| AxisSlice {
            start: 0,
            step: 1,
            len: dim,
        })
        .collect();
    for idx in 0..starts.len() {
        let axis = match axes {
            Some(axes) => *axes
                .get(idx)
                .ok_or_else(|| err("axes shorter than starts".to_string()))?,
            None => idx as i64,
        };
        let axis = normalize_axis(axis as isize, dims.len())
            .ok_or_else(|| err(format!("axis {axis} out of range for rank {}", dims.len())))?;
        let step = steps.map_or(Some(1), |steps| steps.get(idx).copied()).unwrap_or(1);
        if step == 0 {
            return Err(err("step must be non-zero".to_string()));
        }
        let dim = dims[axis] as i64;
        let resolve = |value: i64, lo: i64, hi: i64| {
            let value = if value < 0 { value + dim } else { value };
            value.clamp(lo, hi)
        };
        let (start, end) = if step > 0 {
            (resolve(starts[idx], 0, dim), resolve(ends[idx], 0, dim))
        } else {
            (resolve(starts[idx], -1, dim - 1), resolve(ends[idx], -1, dim - 1))
        };
        let len = if step > 0 {
            (end - start + step - 1).max(0) / step
        } else {
            (start - end - step - 1).max(0) / -step
        };
        slices[axis] = AxisSlice {
            start,
            step,
            len: len as usize,
        };
    }
    Ok(slices)
}

/// Resolves ONNX `Pad` amounts into `(begin, end)` per axis.
pub fn resolve_pads(
    rank: usize,
    pads: &[i64],
    axes: Option<&[i64]>,
) -> EngineResult<Vec<(usize, usize)>> {
    let err = |msg: String| EngineError::kernel("Pad", msg);
    let axes: Vec<usize> = match axes {
        Some(axes) => axes
            .iter()
            .map(|&axis| {
                normalize_axis(axis as isize, rank)
                    .ok_or_else(|| err(format!("axis {axis} out of range for rank {rank}")))
            })
            .collect::<EngineResult<_>>()?,
        None => (0..rank).collect(),
    };
    if pads.len() != axes.len() * 2 {
        return Err(err(format!(
            "expected {} pad values, got {}",
            axes.len() * 2,
            pads.len()
        )));
    }
    let mut resolved = vec![(0usize, 0usize); rank];
    for (idx, &axis) in axes.iter().enumerate() {
        let begin = pads[idx];
        let end = pads[idx + axes.len()];
        if begin < 0 || end < 0 {
            return Err(err("negative pads are not supported".to_string()));
        }
        resolved[axis] = (begin as usize, end as usize);
    }
    Ok(resolved)
}

/// Resolves a `Reshape` target, handling `0` (copy) and `-1` (infer).
pub fn resolve_reshape(input: &[usize], target: &[i64], allow_zero: bool) -> EngineResult<Vec<usize>> {
    let err = |msg: String| EngineError::kernel("Reshape", msg);
    let total: usize = input.iter().product();
    let mut dims = Vec::with_capacity(target.len());
    let mut infer_at = None;
    for (axis, &value) in target.iter().enumerate() {
        match value {
            -1 => {
                if infer_at.replace(axis).is_some() {
                    return Err(err("at most one -1 is allowed".to_string()));
                }
                dims.push(1);
            }
            0 if !allow_zero => {
                let copied = input
                    .get(axis)
                    .ok_or_else(|| err(format!("cannot copy axis {axis} of {input:?}")))?;
                dims.push(*copied);
            }
            v if v >= 0 => dims.push(v as usize),
            v => return Err(err(format!("invalid dimension {v}"))),
        }
    }
    let known: usize = dims.iter().product();
    if let Some(axis) = infer_at {
        if known == 0 || total % known != 0 {
            return Err(err(format!("cannot infer -1 reshaping {input:?} to {target:?}")));
        }
        dims[axis] = total / known;
    } else if known != total {
        return Err(err(format!("cannot reshape {input:?} to {target:?}")));
    }
    Ok(dims)
}

/// Resolves reduction axes; `None` or empty reduces over every axis.
pub fn resolve_axes(rank: usize, axes: Option<&[i64]>, op: &'static str) -> EngineResult<Vec<usize>> {
    match axes {
        Some(axes) if !axes.is_empty() => {
            let mut resolved = axes
                .iter()
                .map(|&axis| {
                    normalize_axis(axis as isize, rank).ok_or_else(|| {
                        EngineError::kernel(op, format!("axis {axis} out of range for rank {rank}"))
                    })
                })
                .collect::<EngineResult<Vec<_>>>()?;
            resolved.sort_unstable();
            resolved.dedup();
            Ok(resolved)
        }
        _ => Ok((0..rank).collect()),
    }
}

/// Resolved batched matrix product `a[..., m, k] · b[..., k, n]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatMulGeometry {
    pub m: usize,
    pub k: usize,
    pub n: usize,
    /// Broadcast batch dimensions of the output.
    pub batch: Vec<usize>,
    /// Batch dimensions of each operand (rank-1 operands have none).
    pub a_batch: Vec<usize>,
    pub b_batch: Vec<usize>,
    /// Output dimensions with rank-1 promotions removed again.
    pub output: Vec<usize>,
}

impl MatMulGeometry {
    pub fn resolve(a: &[usize], b: &[usize]) -> EngineResult<Self> {
        let err = |msg: String| EngineError::kernel("MatMul", msg);
        let rank_err = || err("operands must have rank >= 1".to_string());
        let (a_batch, m, k) = match a {
            [] => return Err(rank_err()),
            [k] => (Vec::new(), 1, *k),
            [batch @ .., m, k] => (batch.to_vec(), *m, *k),
        };
        let (b_batch, k_b, n) = match b {
            [] => return Err(rank_err()),
            [k] => (Vec::new(), *k, 1),
            [batch @ .., k, n] => (batch.to_vec(), *k, *n),
        };
        if k != k_b {
            return Err(err(format!("inner dimensions differ: {a:?} x {b:?}")));
        }
        let batch = super::broadcast::broadcast_shapes(&a_batch, &b_batch)
            .ok_or_else(|| err(format!("batch dimensions do not broadcast: {a:?} x {b:?}")))?;
        let mut output = batch.clone();
        if a.len() > 1 {
            output.push(m);
        }
        if b.len() > 1 {
            output.push(n);
        }
        Ok(Self {
            m,
            k,
            n,
            batch,
            a_batch,
            b_batch,
            output,
        })
    }
}
