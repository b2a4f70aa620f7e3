//! Output shape and dtype inference for every operation.
//!
//! Operations whose output extent depends on operand values (Reshape,
//! ConstantOfShape, Slice, ...) read those operands on the host, which is why
//! the scheduler pins them to CPU memory before a layer runs.

use smallvec::{smallvec, SmallVec};

use super::broadcast::broadcast_shapes;
use super::geometry::{
    resolve_axes, resolve_pads, resolve_reshape, resolve_slice, ConvGeometry, MatMulGeometry,
};
use crate::error::{EngineError, EngineResult};
use crate::graph::Operation;
use crate::tensor::{normalize_axis, DType, Shape, Tensor, MAX_RANK};

/// Shape and dtype of one output.
pub type OutputSpec = (Shape, DType);

fn operand<'a>(op: &Operation, inputs: &[Option<&'a Tensor>], position: usize) -> EngineResult<&'a Tensor> {
    inputs
        .get(position)
        .copied()
        .flatten()
        .ok_or_else(|| EngineError::kernel(op.name(), format!("missing required input {position}")))
}

fn optional_ints(inputs: &[Option<&Tensor>], position: usize) -> EngineResult<Option<Vec<i64>>> {
    match inputs.get(position).copied().flatten() {
        Some(tensor) => Ok(Some(tensor.host_ints()?)),
        None => Ok(None),
    }
}

fn host_scalar(op: &Operation, tensor: &Tensor) -> EngineResult<f32> {
    let values = tensor.host_floats()?;
    match values.as_slice() {
        [value] => Ok(*value),
        _ => Err(EngineError::kernel(
            op.name(),
            format!("expected a scalar operand, got shape {}", tensor.shape()),
        )),
    }
}

fn to_dims(op: &Operation, values: &[i64]) -> EngineResult<Vec<usize>> {
    values
        .iter()
        .map(|&v| {
            usize::try_from(v)
                .map_err(|_| EngineError::kernel(op.name(), format!("negative dimension {v}")))
        })
        .collect()
}

/// Computes the outputs `op` produces for `inputs`.
pub fn infer_outputs(
    op: &Operation,
    inputs: &[Option<&Tensor>],
) -> EngineResult<SmallVec<[OutputSpec; 2]>> {
    let err = |msg: String| EngineError::kernel(op.name(), msg);
    let single = |dims: Vec<usize>, dtype: DType| -> EngineResult<SmallVec<[OutputSpec; 2]>> {
        if dims.len() > MAX_RANK {
            return Err(err(format!("output rank {} exceeds {MAX_RANK}", dims.len())));
        }
        Ok(smallvec![(Shape::new(dims), dtype)])
    };

    match op {
        Operation::Add | Operation::Sub | Operation::Mul | Operation::Div => {
            let a = operand(op, inputs, 0)?;
            let b = operand(op, inputs, 1)?;
            let dims = broadcast_shapes(a.shape().dims(), b.shape().dims()).ok_or_else(|| {
                err(format!("shapes {} and {} do not broadcast", a.shape(), b.shape()))
            })?;
            single(dims, a.dtype())
        }
        Operation::ScaleBias { axis } => {
            let x = operand(op, inputs, 0)?;
            let channels = x
                .shape()
                .dim(*axis)
                .ok_or_else(|| err(format!("axis {axis} out of range for {}", x.shape())))?;
            for position in [1, 2] {
                let param = operand(op, inputs, position)?;
                if param.len() != channels {
                    return Err(err(format!(
                        "parameter {position} has {} values, expected {channels}",
                        param.len()
                    )));
                }
            }
            single(x.shape().dims().to_vec(), x.dtype())
        }
        Operation::ScalarMad { .. }
        | Operation::Relu
        | Operation::Sigmoid
        | Operation::Tanh
        | Operation::LeakyRelu { .. }
        | Operation::Identity => {
            let x = operand(op, inputs, 0)?;
            single(x.shape().dims().to_vec(), x.dtype())
        }
        Operation::Dense { .. } => {
            let x = operand(op, inputs, 0)?;
            let w = operand(op, inputs, 1)?;
            let [k, n] = *w.shape().dims() else {
                return Err(err(format!("weight must be rank 2, got {}", w.shape())));
            };
            let Some((&last, batch)) = x.shape().dims().split_last() else {
                return Err(err("input must have rank >= 1".to_string()));
            };
            if last != k {
                return Err(err(format!("input {} does not match weight {}", x.shape(), w.shape())));
            }
            if let Some(bias) = inputs.get(2).copied().flatten() {
                if bias.len() != n {
                    return Err(err(format!("bias has {} values, expected {n}", bias.len())));
                }
            }
            let mut dims = batch.to_vec();
            dims.push(n);
            single(dims, x.dtype())
        }
        Operation::MatMul => {
            let a = operand(op, inputs, 0)?;
            let b = operand(op, inputs, 1)?;
            let geometry = MatMulGeometry::resolve(a.shape().dims(), b.shape().dims())?;
            single(geometry.output, a.dtype())
        }
        Operation::Conv(params) => {
            let x = operand(op, inputs, 0)?;
            let kernel = operand(op, inputs, 1)?;
            let geometry = ConvGeometry::resolve(params, x.shape().dims(), kernel.shape().dims())?;
            if let Some(bias) = inputs.get(2).copied().flatten() {
                if bias.len() != geometry.out_channels {
                    return Err(err(format!(
                        "bias has {} values, expected {}",
                        bias.len(),
                        geometry.out_channels
                    )));
                }
            }
            single(geometry.output_dims().to_vec(), x.dtype())
        }
        Operation::Transpose { perm } => {
            let x = operand(op, inputs, 0)?;
            let dims = x.shape().dims();
            let perm: Vec<usize> = match perm {
                Some(perm) => perm.clone(),
                None => (0..dims.len()).rev().collect(),
            };
            let mut seen = vec![false; dims.len()];
            if perm.len() != dims.len()
                || perm.iter().any(|&axis| axis >= dims.len() || std::mem::replace(&mut seen[axis], true))
            {
                return Err(err(format!("invalid permutation {perm:?} for {}", x.shape())));
            }
            single(perm.iter().map(|&axis| dims[axis]).collect(), x.dtype())
        }
        Operation::Reshape { allow_zero } => {
            let x = operand(op, inputs, 0)?;
            let target = operand(op, inputs, 1)?.host_ints()?;
            single(resolve_reshape(x.shape().dims(), &target, *allow_zero)?, x.dtype())
        }
        Operation::Shape { start, end } => {
            let x = operand(op, inputs, 0)?;
            let rank = x.shape().rank() as isize;
            let clamp = |v: isize| (if v < 0 { v + rank } else { v }).clamp(0, rank);
            let start = clamp(*start);
            let end = clamp(end.unwrap_or(rank));
            single(vec![(end - start).max(0) as usize], DType::I32)
        }
        Operation::Size => {
            operand(op, inputs, 0)?;
            single(Vec::new(), DType::I32)
        }
        Operation::ConstantOfShape { value } => {
            let dims = operand(op, inputs, 0)?.host_ints()?;
            single(to_dims(op, &dims)?, value.dtype())
        }
        Operation::Expand => {
            let x = operand(op, inputs, 0)?;
            let target = to_dims(op, &operand(op, inputs, 1)?.host_ints()?)?;
            let dims = broadcast_shapes(x.shape().dims(), &target)
                .ok_or_else(|| err(format!("cannot expand {} to {target:?}", x.shape())))?;
            single(dims, x.dtype())
        }
        Operation::Slice => {
            let x = operand(op, inputs, 0)?;
            let starts = operand(op, inputs, 1)?.host_ints()?;
            let ends = operand(op, inputs, 2)?.host_ints()?;
            let axes = optional_ints(inputs, 3)?;
            let steps = optional_ints(inputs, 4)?;
            let slices = resolve_slice(
                x.shape().dims(),
                &starts,
                &ends,
                axes.as_deref(),
                steps.as_deref(),
            )?;
            single(slices.iter().map(|s| s.len).collect(), x.dtype())
        }
        Operation::Pad => {
            let x = operand(op, inputs, 0)?;
            let pads = operand(op, inputs, 1)?.host_ints()?;
            let axes = optional_ints(inputs, 3)?;
            let resolved = resolve_pads(x.shape().rank(), &pads, axes.as_deref())?;
            let dims = x
                .shape()
                .dims()
                .iter()
                .zip(&resolved)
                .map(|(&dim, &(begin, end))| dim + begin + end)
                .collect();
            single(dims, x.dtype())
        }
        Operation::Gather { axis } => {
            let data = operand(op, inputs, 0)?;
            let indices = operand(op, inputs, 1)?;
            let dims = data.shape().dims();
            let axis = normalize_axis(*axis, dims.len())
                .ok_or_else(|| err(format!("axis {axis} out of range for {}", data.shape())))?;
            let mut out = dims[..axis].to_vec();
            out.extend_from_slice(indices.shape().dims());
            out.extend_from_slice(&dims[axis + 1..]);
            single(out, data.dtype())
        }
        Operation::TopK { axis, .. } => {
            let x = operand(op, inputs, 0)?;
            let k = operand(op, inputs, 1)?.host_ints()?;
            let [k] = k.as_slice() else {
                return Err(err("k must hold exactly one value".to_string()));
            };
            let axis = normalize_axis(*axis, x.shape().rank())
                .ok_or_else(|| err(format!("axis {axis} out of range for {}", x.shape())))?;
            let mut dims = x.shape().dims().to_vec();
            if *k < 0 || *k as usize > dims[axis] {
                return Err(err(format!("k = {k} exceeds axis extent {}", dims[axis])));
            }
            dims[axis] = *k as usize;
            Ok(smallvec![
                (Shape::new(dims.clone()), x.dtype()),
                (Shape::new(dims), DType::I32)
            ])
        }
        Operation::Range => {
            let start_tensor = operand(op, inputs, 0)?;
            let start = host_scalar(op, start_tensor)?;
            let limit = host_scalar(op, operand(op, inputs, 1)?)?;
            let delta = host_scalar(op, operand(op, inputs, 2)?)?;
            if delta == 0.0 {
                return Err(err("delta must be non-zero".to_string()));
            }
            let count = ((limit - start) / delta).ceil().max(0.0) as usize;
            single(vec![count], start_tensor.dtype())
        }
        Operation::RandomNormalLike { .. } | Operation::RandomUniformLike { .. } => {
            let x = operand(op, inputs, 0)?;
            single(x.shape().dims().to_vec(), DType::F32)
        }
        Operation::Cast { to } => {
            let x = operand(op, inputs, 0)?;
            single(x.shape().dims().to_vec(), *to)
        }
        Operation::CastLike => {
            let x = operand(op, inputs, 0)?;
            let like = operand(op, inputs, 1)?;
            single(x.shape().dims().to_vec(), like.dtype())
        }
        Operation::ReduceSum { keepdims } | Operation::ReduceMean { keepdims } => {
            let x = operand(op, inputs, 0)?;
            let axes = optional_ints(inputs, 1)?;
            let axes = resolve_axes(x.shape().rank(), axes.as_deref(), op.name())?;
            let mut dims = Vec::with_capacity(x.shape().rank());
            for (axis, &dim) in x.shape().dims().iter().enumerate() {
                if !axes.contains(&axis) {
                    dims.push(dim);
                } else if *keepdims {
                    dims.push(1);
                }
            }
            single(dims, x.dtype())
        }
        Operation::Concat { axis } => {
            let first = operand(op, inputs, 0)?;
            let rank = first.shape().rank();
            let axis = normalize_axis(*axis, rank)
                .ok_or_else(|| err(format!("axis {axis} out of range for {}", first.shape())))?;
            let mut dims = first.shape().dims().to_vec();
            dims[axis] = 0;
            for (position, input) in inputs.iter().enumerate() {
                let input = input.ok_or_else(|| err(format!("missing input {position}")))?;
                let other = input.shape().dims();
                let compatible = other.len() == rank
                    && other
                        .iter()
                        .zip(first.shape().dims())
                        .enumerate()
                        .all(|(idx, (a, b))| idx == axis || a == b);
                if !compatible {
                    return Err(err(format!(
                        "input {position} shape {} does not match {}",
                        input.shape(),
                        first.shape()
                    )));
                }
                dims[axis] += other[axis];
            }
            single(dims, first.dtype())
        }
    }
}
