use layerwise::backend::{Backend, BackendError, BackendResult, BackendType};
use layerwise::error::EngineError;
use layerwise::graph::{FusedActivation, OpKind, Operation, ScalarValue};
use layerwise::ops::broadcast::BroadcastMap;
use layerwise::ops::geometry::{resolve_axes, resolve_pads, resolve_slice};
use layerwise::tensor::{normalize_axis, DType, Tensor};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

use crate::linalg::{op_conv, op_dense, op_matmul};

/// Reference kernels for every operation kind, run on the host.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpuBackend;

impl CpuBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Backend for CpuBackend {
    fn backend_type(&self) -> BackendType {
        BackendType::Cpu
    }

    fn supports(&self, _kind: OpKind) -> bool {
        true
    }

    fn execute(
        &self,
        op: &Operation,
        inputs: &[Option<&Tensor>],
        outputs: &mut [Tensor],
    ) -> BackendResult<()> {
        execute_operation(op, inputs, outputs)
    }
}

/// Runs `op` with the reference kernels, writing into pre-shaped `outputs`.
pub fn execute_operation(
    op: &Operation,
    inputs: &[Option<&Tensor>],
    outputs: &mut [Tensor],
) -> BackendResult<()> {
    let name = op.name();
    if outputs.len() != op.kind().output_count() {
        return Err(BackendError::execution(
            name,
            format!("expected {} outputs, got {}", op.kind().output_count(), outputs.len()),
        ));
    }

    match op {
        Operation::Add => op_binary(name, inputs, outputs, BinaryOp::Add),
        Operation::Sub => op_binary(name, inputs, outputs, BinaryOp::Sub),
        Operation::Mul => op_binary(name, inputs, outputs, BinaryOp::Mul),
        Operation::Div => op_binary(name, inputs, outputs, BinaryOp::Div),
        Operation::ScaleBias { axis } => op_scale_bias(name, *axis, inputs, outputs),
        Operation::ScalarMad { s, b } => op_unary(name, inputs, outputs, |v| v * s + b),
        Operation::Dense { activation } => op_dense(name, *activation, inputs, outputs),
        Operation::MatMul => op_matmul(name, inputs, outputs),
        Operation::Conv(params) => op_conv(name, params, inputs, outputs),
        Operation::Relu => op_unary(name, inputs, outputs, |v| v.max(0.0)),
        Operation::Sigmoid => op_unary(name, inputs, outputs, |v| 1.0 / (1.0 + (-v).exp())),
        Operation::Tanh => op_unary(name, inputs, outputs, f32::tanh),
        Operation::LeakyRelu { alpha } => {
            op_unary(name, inputs, outputs, |v| if v >= 0.0 { v } else { alpha * v })
        }
        Operation::Identity | Operation::Reshape { .. } => op_copy(name, inputs, outputs),
        Operation::Transpose { perm } => op_transpose(name, perm.as_deref(), inputs, outputs),
        Operation::Shape { start, end } => op_shape(name, *start, *end, inputs, outputs),
        Operation::Size => {
            let x = input(name, inputs, 0)?;
            single_output(name, outputs)?.as_i32_mut()[0] = x.len() as i32;
            Ok(())
        }
        Operation::ConstantOfShape { value } => {
            let out = single_output(name, outputs)?;
            match value {
                ScalarValue::Float(v) => out.as_f32_mut().fill(*v),
                ScalarValue::Int(v) => out.as_i32_mut().fill(*v),
            }
            Ok(())
        }
        Operation::Expand => op_expand(name, inputs, outputs),
        Operation::Slice => op_slice(name, inputs, outputs),
        Operation::Pad => op_pad(name, inputs, outputs),
        Operation::Gather { axis } => op_gather(name, *axis, inputs, outputs),
        Operation::TopK { axis, largest, .. } => op_top_k(name, *axis, *largest, inputs, outputs),
        Operation::Range => op_range(name, inputs, outputs),
        Operation::RandomNormalLike { mean, scale, seed } => {
            let mut rng = seeded(*seed);
            let out = single_output(name, outputs)?;
            for slot in out.as_f32_mut() {
                let sample: f32 = rng.sample(StandardNormal);
                *slot = mean + scale * sample;
            }
            Ok(())
        }
        Operation::RandomUniformLike { low, high, seed } => {
            let mut rng = seeded(*seed);
            let out = single_output(name, outputs)?;
            for slot in out.as_f32_mut() {
                *slot = low + (high - low) * rng.gen::<f32>();
            }
            Ok(())
        }
        Operation::Cast { .. } | Operation::CastLike => op_cast(name, inputs, outputs),
        Operation::ReduceSum { .. } => op_reduce(name, false, inputs, outputs),
        Operation::ReduceMean { .. } => op_reduce(name, true, inputs, outputs),
        Operation::Concat { axis } => op_concat(name, *axis, inputs, outputs),
    }
}

pub(crate) fn input<'a>(
    op: &'static str,
    inputs: &[Option<&'a Tensor>],
    position: usize,
) -> BackendResult<&'a Tensor> {
    inputs
        .get(position)
        .copied()
        .flatten()
        .ok_or_else(|| BackendError::execution(op, format!("missing input {position}")))
}

pub(crate) fn single_output<'a>(
    op: &'static str,
    outputs: &'a mut [Tensor],
) -> BackendResult<&'a mut Tensor> {
    match outputs {
        [out] => Ok(out),
        _ => Err(BackendError::execution(op, "operation expects a single output")),
    }
}

pub(crate) fn expect_float(op: &'static str, tensor: &Tensor) -> BackendResult<()> {
    if tensor.dtype().is_float() {
        Ok(())
    } else {
        Err(BackendError::unimplemented(
            op,
            format!("{:?} tensors are not supported", tensor.dtype()),
        ))
    }
}

pub(crate) fn apply_activation(values: &mut [f32], activation: FusedActivation) {
    match activation {
        FusedActivation::None => {}
        FusedActivation::Relu => values.iter_mut().for_each(|v| *v = v.max(0.0)),
    }
}

fn host(op: &'static str) -> impl Fn(EngineError) -> BackendError {
    move |err| BackendError::execution(op, err.to_string())
}

fn seeded(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

fn compute_strides(dims: &[usize]) -> Vec<usize> {
    let mut strides = vec![0; dims.len()];
    let mut acc = 1usize;
    for (i, dim) in dims.iter().enumerate().rev() {
        strides[i] = acc;
        acc *= *dim;
    }
    strides
}

fn unravel_index(mut index: usize, dims: &[usize], coord: &mut [usize]) {
    for (axis, &dim) in dims.iter().enumerate().rev() {
        coord[axis] = index % dim;
        index /= dim;
    }
}

#[derive(Debug, Clone, Copy)]
enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl BinaryOp {
    fn apply_f32(self, a: f32, b: f32) -> f32 {
        match self {
            BinaryOp::Add => a + b,
            BinaryOp::Sub => a - b,
            BinaryOp::Mul => a * b,
            BinaryOp::Div => a / b,
        }
    }

    fn apply_int(self, a: i64, b: i64) -> Option<i64> {
        match self {
            BinaryOp::Add => Some(a + b),
            BinaryOp::Sub => Some(a - b),
            BinaryOp::Mul => Some(a * b),
            BinaryOp::Div => a.checked_div(b),
        }
    }
}

fn op_binary(
    name: &'static str,
    inputs: &[Option<&Tensor>],
    outputs: &mut [Tensor],
    op: BinaryOp,
) -> BackendResult<()> {
    let a = input(name, inputs, 0)?;
    let b = input(name, inputs, 1)?;
    if a.dtype().is_float() != b.dtype().is_float() {
        return Err(BackendError::execution(
            name,
            format!("operand dtypes differ: {:?} and {:?}", a.dtype(), b.dtype()),
        ));
    }
    let out = single_output(name, outputs)?;
    let out_dims = out.shape().dims().to_vec();
    let a_map = BroadcastMap::new(a.shape().dims(), &out_dims);
    let b_map = BroadcastMap::new(b.shape().dims(), &out_dims);

    if out.dtype().is_float() {
        let (av, bv) = (a.as_f32(), b.as_f32());
        for (idx, slot) in out.as_f32_mut().iter_mut().enumerate() {
            *slot = op.apply_f32(av[a_map.offset(idx)], bv[b_map.offset(idx)]);
        }
    } else {
        let dtype = out.dtype();
        let (av, bv) = (a.as_i32(), b.as_i32());
        for (idx, slot) in out.as_i32_mut().iter_mut().enumerate() {
            let lhs = i64::from(av[a_map.offset(idx)]);
            let rhs = i64::from(bv[b_map.offset(idx)]);
            let value = op
                .apply_int(lhs, rhs)
                .ok_or_else(|| BackendError::execution(name, "integer division by zero"))?;
            *slot = dtype.wrap_int(value);
        }
    }
    Ok(())
}

fn op_unary(
    name: &'static str,
    inputs: &[Option<&Tensor>],
    outputs: &mut [Tensor],
    f: impl Fn(f32) -> f32,
) -> BackendResult<()> {
    let x = input(name, inputs, 0)?;
    expect_float(name, x)?;
    let out = single_output(name, outputs)?;
    for (slot, &value) in out.as_f32_mut().iter_mut().zip(x.as_f32()) {
        *slot = f(value);
    }
    Ok(())
}

fn op_scale_bias(
    name: &'static str,
    axis: isize,
    inputs: &[Option<&Tensor>],
    outputs: &mut [Tensor],
) -> BackendResult<()> {
    let x = input(name, inputs, 0)?;
    let scale = input(name, inputs, 1)?.as_f32();
    let bias = input(name, inputs, 2)?.as_f32();
    expect_float(name, x)?;
    let dims = x.shape().dims();
    let axis = normalize_axis(axis, dims.len())
        .ok_or_else(|| BackendError::execution(name, format!("axis {axis} out of range")))?;
    let channels = dims[axis];
    if scale.len() != channels || bias.len() != channels {
        return Err(BackendError::execution(
            name,
            format!("expected {channels} scale/bias values"),
        ));
    }
    let inner: usize = dims[axis + 1..].iter().product();
    let out = single_output(name, outputs)?;
    for (idx, (slot, &value)) in out.as_f32_mut().iter_mut().zip(x.as_f32()).enumerate() {
        let channel = (idx / inner) % channels;
        *slot = value * scale[channel] + bias[channel];
    }
    Ok(())
}

/// Bitwise copy; every dtype occupies one 32-bit lane.
fn op_copy(name: &'static str, inputs: &[Option<&Tensor>], outputs: &mut [Tensor]) -> BackendResult<()> {
    let x = input(name, inputs, 0)?;
    let out = single_output(name, outputs)?;
    if out.len() != x.len() {
        return Err(BackendError::execution(
            name,
            format!("cannot copy {} elements into {}", x.len(), out.len()),
        ));
    }
    out.as_i32_mut().copy_from_slice(x.as_i32());
    Ok(())
}

fn op_transpose(
    name: &'static str,
    perm: Option<&[usize]>,
    inputs: &[Option<&Tensor>],
    outputs: &mut [Tensor],
) -> BackendResult<()> {
    let x = input(name, inputs, 0)?;
    let input_dims = x.shape().dims();
    let perm: Vec<usize> = match perm {
        Some(perm) => perm.to_vec(),
        None => (0..input_dims.len()).rev().collect(),
    };
    if perm.len() != input_dims.len() {
        return Err(BackendError::execution(name, "transpose rank mismatch"));
    }
    let input_strides = compute_strides(input_dims);
    let values = x.as_i32();
    let out = single_output(name, outputs)?;
    let out_dims = out.shape().dims().to_vec();
    let mut coord = vec![0usize; out_dims.len()];
    for (idx, slot) in out.as_i32_mut().iter_mut().enumerate() {
        unravel_index(idx, &out_dims, &mut coord);
        let in_index: usize = coord
            .iter()
            .enumerate()
            .map(|(out_axis, &c)| c * input_strides[perm[out_axis]])
            .sum();
        *slot = values[in_index];
    }
    Ok(())
}

fn op_shape(
    name: &'static str,
    start: isize,
    end: Option<isize>,
    inputs: &[Option<&Tensor>],
    outputs: &mut [Tensor],
) -> BackendResult<()> {
    let dims = input(name, inputs, 0)?.shape().dims();
    let rank = dims.len() as isize;
    let clamp = |v: isize| (if v < 0 { v + rank } else { v }).clamp(0, rank) as usize;
    let (start, end) = (clamp(start), clamp(end.unwrap_or(rank)));
    let out = single_output(name, outputs)?;
    let selected = dims.get(start..end.max(start)).unwrap_or(&[]);
    for (slot, &dim) in out.as_i32_mut().iter_mut().zip(selected) {
        *slot = dim as i32;
    }
    Ok(())
}

fn op_expand(name: &'static str, inputs: &[Option<&Tensor>], outputs: &mut [Tensor]) -> BackendResult<()> {
    let x = input(name, inputs, 0)?;
    let out = single_output(name, outputs)?;
    let map = BroadcastMap::new(x.shape().dims(), out.shape().dims());
    let values = x.as_i32();
    for (idx, slot) in out.as_i32_mut().iter_mut().enumerate() {
        *slot = values[map.offset(idx)];
    }
    Ok(())
}

fn optional_ints(
    name: &'static str,
    inputs: &[Option<&Tensor>],
    position: usize,
) -> BackendResult<Option<Vec<i64>>> {
    match inputs.get(position).copied().flatten() {
        Some(tensor) => Ok(Some(tensor.host_ints().map_err(host(name))?)),
        None => Ok(None),
    }
}

fn op_slice(name: &'static str, inputs: &[Option<&Tensor>], outputs: &mut [Tensor]) -> BackendResult<()> {
    let x = input(name, inputs, 0)?;
    let starts = input(name, inputs, 1)?.host_ints().map_err(host(name))?;
    let ends = input(name, inputs, 2)?.host_ints().map_err(host(name))?;
    let axes = optional_ints(name, inputs, 3)?;
    let steps = optional_ints(name, inputs, 4)?;
    let dims = x.shape().dims();
    let slices = resolve_slice(dims, &starts, &ends, axes.as_deref(), steps.as_deref())
        .map_err(host(name))?;

    let strides = compute_strides(dims);
    let values = x.as_i32();
    let out = single_output(name, outputs)?;
    let out_dims = out.shape().dims().to_vec();
    let mut coord = vec![0usize; out_dims.len()];
    for (idx, slot) in out.as_i32_mut().iter_mut().enumerate() {
        unravel_index(idx, &out_dims, &mut coord);
        let in_index: i64 = coord
            .iter()
            .zip(&slices)
            .zip(&strides)
            .map(|((&c, slice), &stride)| (slice.start + c as i64 * slice.step) * stride as i64)
            .sum();
        *slot = values[in_index as usize];
    }
    Ok(())
}

fn op_pad(name: &'static str, inputs: &[Option<&Tensor>], outputs: &mut [Tensor]) -> BackendResult<()> {
    let x = input(name, inputs, 0)?;
    let pads = input(name, inputs, 1)?.host_ints().map_err(host(name))?;
    let fill = match inputs.get(2).copied().flatten() {
        Some(value) => value.host_floats().map_err(host(name))?.first().copied().unwrap_or(0.0),
        None => 0.0,
    };
    let axes = optional_ints(name, inputs, 3)?;
    let dims = x.shape().dims();
    let resolved = resolve_pads(dims.len(), &pads, axes.as_deref()).map_err(host(name))?;
    let fill_lane = if x.dtype().is_float() {
        fill.to_bits() as i32
    } else {
        x.dtype().wrap_int(fill as i64)
    };

    let strides = compute_strides(dims);
    let values = x.as_i32();
    let out = single_output(name, outputs)?;
    let out_dims = out.shape().dims().to_vec();
    let mut coord = vec![0usize; out_dims.len()];
    for (idx, slot) in out.as_i32_mut().iter_mut().enumerate() {
        unravel_index(idx, &out_dims, &mut coord);
        let mut in_index = Some(0usize);
        for (axis, &c) in coord.iter().enumerate() {
            let (begin, _) = resolved[axis];
            in_index = match (in_index, c.checked_sub(begin)) {
                (Some(acc), Some(pos)) if pos < dims[axis] => Some(acc + pos * strides[axis]),
                _ => None,
            };
        }
        *slot = in_index.map_or(fill_lane, |i| values[i]);
    }
    Ok(())
}

fn op_gather(
    name: &'static str,
    axis: isize,
    inputs: &[Option<&Tensor>],
    outputs: &mut [Tensor],
) -> BackendResult<()> {
    let data = input(name, inputs, 0)?;
    let indices = input(name, inputs, 1)?.host_ints().map_err(host(name))?;
    let dims = data.shape().dims();
    let axis = normalize_axis(axis, dims.len())
        .ok_or_else(|| BackendError::execution(name, format!("axis {axis} out of range")))?;
    let outer: usize = dims[..axis].iter().product();
    let inner: usize = dims[axis + 1..].iter().product();
    let extent = dims[axis];
    let values = data.as_i32();
    let out = single_output(name, outputs)?.as_i32_mut();

    let mut cursor = 0usize;
    for o in 0..outer {
        for &index in &indices {
            let resolved = if index < 0 { index + extent as i64 } else { index };
            if resolved < 0 || resolved as usize >= extent {
                return Err(BackendError::execution(
                    name,
                    format!("index {index} out of range for axis of extent {extent}"),
                ));
            }
            let src = (o * extent + resolved as usize) * inner;
            out[cursor..cursor + inner].copy_from_slice(&values[src..src + inner]);
            cursor += inner;
        }
    }
    Ok(())
}

fn op_top_k(
    name: &'static str,
    axis: isize,
    largest: bool,
    inputs: &[Option<&Tensor>],
    outputs: &mut [Tensor],
) -> BackendResult<()> {
    let x = input(name, inputs, 0)?;
    let dims = x.shape().dims();
    let axis = normalize_axis(axis, dims.len())
        .ok_or_else(|| BackendError::execution(name, format!("axis {axis} out of range")))?;
    let [values_out, indices_out] = outputs else {
        return Err(BackendError::execution(name, "expected values and indices outputs"));
    };
    let k = values_out.shape().dims()[axis];
    let extent = dims[axis];
    let outer: usize = dims[..axis].iter().product();
    let inner: usize = dims[axis + 1..].iter().product();

    let is_float = x.dtype().is_float();
    let lanes = x.as_i32();
    let key = |lane: i32| -> f64 {
        if is_float {
            f64::from(f32::from_bits(lane as u32))
        } else {
            f64::from(lane)
        }
    };
    let values = values_out.as_i32_mut();
    let indices = indices_out.as_i32_mut();
    let mut order: Vec<usize> = Vec::with_capacity(extent);
    for o in 0..outer {
        for i in 0..inner {
            let at = |j: usize| (o * extent + j) * inner + i;
            order.clear();
            order.extend(0..extent);
            // Stable sort keeps the lower index first among equal values.
            order.sort_by(|&a, &b| {
                let ordering = key(lanes[at(a)]).total_cmp(&key(lanes[at(b)]));
                if largest {
                    ordering.reverse()
                } else {
                    ordering
                }
            });
            for (rank, &j) in order.iter().take(k).enumerate() {
                let dst = (o * k + rank) * inner + i;
                values[dst] = lanes[at(j)];
                indices[dst] = j as i32;
            }
        }
    }
    Ok(())
}

fn op_range(name: &'static str, inputs: &[Option<&Tensor>], outputs: &mut [Tensor]) -> BackendResult<()> {
    let scalar = |position: usize| -> BackendResult<f32> {
        let values = input(name, inputs, position)?.host_floats().map_err(host(name))?;
        values
            .first()
            .copied()
            .ok_or_else(|| BackendError::execution(name, "expected a scalar operand"))
    };
    let (start, delta) = (scalar(0)?, scalar(2)?);
    let out = single_output(name, outputs)?;
    if out.dtype().is_float() {
        for (i, slot) in out.as_f32_mut().iter_mut().enumerate() {
            *slot = start + i as f32 * delta;
        }
    } else {
        let dtype = out.dtype();
        for (i, slot) in out.as_i32_mut().iter_mut().enumerate() {
            *slot = dtype.wrap_int((start + i as f32 * delta) as i64);
        }
    }
    Ok(())
}

fn op_cast(name: &'static str, inputs: &[Option<&Tensor>], outputs: &mut [Tensor]) -> BackendResult<()> {
    let x = input(name, inputs, 0)?;
    let out = single_output(name, outputs)?;
    let to = out.dtype();
    match (x.dtype().is_float(), to) {
        (true, DType::F32) => out.as_f32_mut().copy_from_slice(x.as_f32()),
        (true, DType::Bool) => {
            for (slot, &v) in out.as_i32_mut().iter_mut().zip(x.as_f32()) {
                *slot = i32::from(v != 0.0);
            }
        }
        (true, _) => {
            for (slot, &v) in out.as_i32_mut().iter_mut().zip(x.as_f32()) {
                *slot = to.wrap_int(v.trunc() as i64);
            }
        }
        (false, DType::F32) => {
            for (slot, &v) in out.as_f32_mut().iter_mut().zip(x.as_i32()) {
                *slot = v as f32;
            }
        }
        (false, _) => {
            for (slot, &v) in out.as_i32_mut().iter_mut().zip(x.as_i32()) {
                *slot = to.wrap_int(i64::from(v));
            }
        }
    }
    Ok(())
}

fn op_reduce(
    name: &'static str,
    mean: bool,
    inputs: &[Option<&Tensor>],
    outputs: &mut [Tensor],
) -> BackendResult<()> {
    let x = input(name, inputs, 0)?;
    let axes = optional_ints(name, inputs, 1)?;
    let dims = x.shape().dims();
    let axes = resolve_axes(dims.len(), axes.as_deref(), name).map_err(host(name))?;

    let kept: Vec<usize> = dims
        .iter()
        .enumerate()
        .map(|(axis, &dim)| if axes.contains(&axis) { 1 } else { dim })
        .collect();
    let kept_strides = compute_strides(&kept);
    let count: usize = axes.iter().map(|&axis| dims[axis]).product();

    let out = single_output(name, outputs)?;
    let mut sums = vec![0.0f64; out.len()];
    let is_float = x.dtype().is_float();
    let mut coord = vec![0usize; dims.len()];
    for idx in 0..x.len() {
        unravel_index(idx, dims, &mut coord);
        let dst: usize = coord
            .iter()
            .zip(&kept)
            .zip(&kept_strides)
            .map(|((&c, &k), &stride)| if k == 1 { 0 } else { c * stride })
            .sum();
        sums[dst] += if is_float {
            f64::from(x.as_f32()[idx])
        } else {
            f64::from(x.as_i32()[idx])
        };
    }
    if mean {
        sums.iter_mut().for_each(|s| *s /= count as f64);
    }

    if out.dtype().is_float() {
        for (slot, &s) in out.as_f32_mut().iter_mut().zip(&sums) {
            *slot = s as f32;
        }
    } else {
        let dtype = out.dtype();
        for (slot, &s) in out.as_i32_mut().iter_mut().zip(&sums) {
            *slot = dtype.wrap_int(s as i64);
        }
    }
    Ok(())
}

fn op_concat(
    name: &'static str,
    axis: isize,
    inputs: &[Option<&Tensor>],
    outputs: &mut [Tensor],
) -> BackendResult<()> {
    let out = single_output(name, outputs)?;
    let out_dims = out.shape().dims().to_vec();
    let axis = normalize_axis(axis, out_dims.len())
        .ok_or_else(|| BackendError::execution(name, format!("axis {axis} out of range")))?;
    let outer: usize = out_dims[..axis].iter().product();
    let inner: usize = out_dims[axis + 1..].iter().product();
    let out_block = out_dims[axis] * inner;
    let dst = out.as_i32_mut();

    let mut offset = 0usize;
    for position in 0..inputs.len() {
        let part = input(name, inputs, position)?;
        let block = part.shape().dims()[axis] * inner;
        let values = part.as_i32();
        for o in 0..outer {
            dst[o * out_block + offset..o * out_block + offset + block]
                .copy_from_slice(&values[o * block..(o + 1) * block]);
        }
        offset += block;
    }
    Ok(())
}
