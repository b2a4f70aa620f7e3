//! Closed-form rewrites for each registered pair.
//!
//! Every fuser receives the affine views of `l0` and `l1` and returns the
//! replacement layer, or an error when the constants do not have a form the
//! identity covers (the pair is then left alone).

use anyhow::{anyhow, bail, ensure, Result};

use crate::graph::{Constant, ConvParams, FusedActivation, OpKind, Operation};
use crate::ops::broadcast::broadcast_binary;
use crate::tensor::Shape;

use super::{Linear, Operand, Rewrite};

fn floats(constant: &Constant) -> Result<&[f32]> {
    constant
        .as_f32()
        .ok_or_else(|| anyhow!("constant {} is not a float tensor", constant.id))
}

fn mismatch(first: &Linear<'_>, second: &Linear<'_>) -> anyhow::Error {
    anyhow!("unexpected operand forms {first:?} -> {second:?}")
}

/// Combines two constants elementwise under broadcasting.
fn combine(a: &Constant, b: &Constant, f: impl Fn(f32, f32) -> f32) -> Result<(Shape, Vec<f32>)> {
    let (values, dims) = broadcast_binary(floats(a)?, a.shape.dims(), floats(b)?, b.shape.dims(), f)
        .ok_or_else(|| anyhow!("constants {} and {} do not broadcast", a.shape, b.shape))?;
    Ok((Shape::new(dims), values))
}

/// Expands `constant` to one value per channel of a `[..., channels]` tensor.
/// Only rank <= 1 constants qualify: higher ranks could broadcast the data.
fn per_feature(constant: &Constant, features: usize) -> Result<Vec<f32>> {
    let values = floats(constant)?;
    ensure!(
        constant.shape.rank() <= 1,
        "constant of shape {} is not a feature vector",
        constant.shape
    );
    match values.len() {
        1 => Ok(vec![values[0]; features]),
        len if len == features => Ok(values.to_vec()),
        len => bail!("constant has {len} values, expected 1 or {features}"),
    }
}

/// Expands `constant` to one value per channel of an NCHW tensor. The
/// constant must be constant along every axis but the channel axis.
fn per_channel(constant: &Constant, channels: usize) -> Result<Vec<f32>> {
    let values = floats(constant)?;
    let dims = constant.shape.dims();
    ensure!(dims.len() <= 4, "constant of shape {} exceeds rank 4", constant.shape);
    for (idx, &dim) in dims.iter().enumerate() {
        let axis = 4 - dims.len() + idx;
        let allowed = dim == 1 || (axis == 1 && dim == channels);
        ensure!(
            allowed,
            "constant of shape {} is not per-channel for {channels} channels",
            constant.shape
        );
    }
    if values.len() == 1 {
        Ok(vec![values[0]; channels])
    } else {
        Ok(values.to_vec())
    }
}

/// Scale/bias pair as per-channel vectors of equal length.
fn scale_bias_vectors(scale: &Constant, bias: &Constant) -> Result<(Vec<f32>, Vec<f32>)> {
    let (scale, bias) = (floats(scale)?.to_vec(), floats(bias)?.to_vec());
    ensure!(
        scale.len() == bias.len(),
        "scale has {} values, bias {}",
        scale.len(),
        bias.len()
    );
    Ok((scale, bias))
}

fn is_channel_axis(axis: isize) -> bool {
    axis == 1 || axis == -3
}

struct DenseWeights {
    k: usize,
    n: usize,
    weight: Vec<f32>,
    bias: Vec<f32>,
}

fn dense_weights(weight: &Constant, bias: Option<&Constant>) -> Result<DenseWeights> {
    let [k, n] = *weight.shape.dims() else {
        bail!("dense weight has shape {}, expected rank 2", weight.shape);
    };
    let bias = match bias {
        Some(bias) => {
            let values = floats(bias)?;
            ensure!(values.len() == n, "dense bias has {} values, expected {n}", values.len());
            values.to_vec()
        }
        None => vec![0.0; n],
    };
    Ok(DenseWeights {
        k,
        n,
        weight: floats(weight)?.to_vec(),
        bias,
    })
}

fn dense_rewrite(activation: FusedActivation, dense: DenseWeights) -> Rewrite {
    Rewrite {
        op: Operation::Dense { activation },
        inputs: vec![
            Operand::Data,
            Operand::New(Shape::new([dense.k, dense.n]), dense.weight),
            Operand::New(Shape::new([dense.n]), dense.bias),
        ],
    }
}

struct ConvWeights {
    dims: Vec<usize>,
    kernel: Vec<f32>,
    bias: Vec<f32>,
    /// Output channels.
    out: usize,
    /// Input channels per group.
    per_group: usize,
    /// Kernel taps per `(output, input)` channel pair.
    taps: usize,
    out_per_group: usize,
}

impl ConvWeights {
    fn load(params: &ConvParams, kernel: &Constant, bias: Option<&Constant>) -> Result<Self> {
        let [out, per_group, kh, kw] = *kernel.shape.dims() else {
            bail!("conv kernel has shape {}, expected rank 4", kernel.shape);
        };
        let group = params.group.max(1);
        ensure!(out % group == 0, "{out} output channels do not split into {group} groups");
        let bias = match bias {
            Some(bias) => {
                let values = floats(bias)?;
                ensure!(values.len() == out, "conv bias has {} values, expected {out}", values.len());
                values.to_vec()
            }
            None => vec![0.0; out],
        };
        Ok(Self {
            dims: kernel.shape.dims().to_vec(),
            kernel: floats(kernel)?.to_vec(),
            bias,
            out,
            per_group,
            taps: kh * kw,
            out_per_group: out / group,
        })
    }

    fn in_channels(&self) -> usize {
        self.per_group * (self.out / self.out_per_group)
    }

    /// Input channel read by kernel slice `(o, ci)`.
    fn input_channel(&self, o: usize, ci: usize) -> usize {
        (o / self.out_per_group) * self.per_group + ci
    }

    /// Kernel values of output channel `o` and group-local input channel `ci`.
    fn taps_mut(&mut self, o: usize, ci: usize) -> &mut [f32] {
        let start = (o * self.per_group + ci) * self.taps;
        &mut self.kernel[start..start + self.taps]
    }

    fn taps(&self, o: usize, ci: usize) -> &[f32] {
        let start = (o * self.per_group + ci) * self.taps;
        &self.kernel[start..start + self.taps]
    }

    fn scale_outputs(&mut self, scale: &[f32]) {
        let slice = self.per_group * self.taps;
        for (o, chunk) in self.kernel.chunks_mut(slice).enumerate() {
            chunk.iter_mut().for_each(|v| *v *= scale[o]);
        }
    }

    fn scale_inputs(&mut self, scale: &[f32]) {
        for o in 0..self.out {
            for ci in 0..self.per_group {
                let s = scale[self.input_channel(o, ci)];
                self.taps_mut(o, ci).iter_mut().for_each(|v| *v *= s);
            }
        }
    }

    /// Adds the response of the kernel to a per-input-channel constant image.
    fn absorb_input_offset(&mut self, offset: &[f32]) {
        for o in 0..self.out {
            let mut response = 0.0f32;
            for ci in 0..self.per_group {
                let c = offset[self.input_channel(o, ci)];
                response += self.taps(o, ci).iter().sum::<f32>() * c;
            }
            self.bias[o] += response;
        }
    }

    fn into_rewrite(self, params: &ConvParams, activation: FusedActivation) -> Rewrite {
        let params = ConvParams {
            activation,
            ..params.clone()
        };
        Rewrite {
            op: Operation::Conv(params),
            inputs: vec![
                Operand::Data,
                Operand::New(Shape::new(self.dims), self.kernel),
                Operand::New(Shape::new([self.out]), self.bias),
            ],
        }
    }
}

/// Add/Sub chains: `s1 * (s0 * x + t0 * c0) + t1 * c1`.
pub(super) fn add_sub(first: &Linear<'_>, second: &Linear<'_>) -> Result<Rewrite> {
    let (
        Linear::Elementwise {
            sign: s0,
            factor: t0,
            constant: c0,
            ..
        },
        Linear::Elementwise {
            kind: k1,
            sign: s1,
            factor: t1,
            constant: c1,
        },
    ) = (*first, *second)
    else {
        return Err(mismatch(first, second));
    };
    let (shape, offset) = combine(c0, c1, |a, b| s1 * t0 * a + t1 * b)?;
    let (op, inputs) = match (s0 * s1 > 0.0, k1) {
        // x - c stays a subtraction so the folded constant reads naturally.
        (true, OpKind::Sub) => {
            let negated = offset.into_iter().map(|v| -v).collect();
            (Operation::Sub, vec![Operand::Data, Operand::New(shape, negated)])
        }
        (true, _) => (Operation::Add, vec![Operand::Data, Operand::New(shape, offset)]),
        (false, _) => (Operation::Sub, vec![Operand::New(shape, offset), Operand::Data]),
    };
    Ok(Rewrite { op, inputs })
}

pub(super) fn mul_mul(first: &Linear<'_>, second: &Linear<'_>) -> Result<Rewrite> {
    let (Linear::Elementwise { constant: c0, .. }, Linear::Elementwise { constant: c1, .. }) =
        (*first, *second)
    else {
        return Err(mismatch(first, second));
    };
    let (shape, scale) = combine(c0, c1, |a, b| a * b)?;
    Ok(Rewrite {
        op: Operation::Mul,
        inputs: vec![Operand::Data, Operand::New(shape, scale)],
    })
}

pub(super) fn scalar_mad_scalar_mad(first: &Linear<'_>, second: &Linear<'_>) -> Result<Rewrite> {
    let (Linear::ScalarMad { s: s0, b: b0 }, Linear::ScalarMad { s: s1, b: b1 }) =
        (*first, *second)
    else {
        return Err(mismatch(first, second));
    };
    Ok(Rewrite {
        op: Operation::ScalarMad {
            s: s1 * s0,
            b: s1 * b0 + b1,
        },
        inputs: vec![Operand::Data],
    })
}

pub(super) fn scale_bias_scale_bias(first: &Linear<'_>, second: &Linear<'_>) -> Result<Rewrite> {
    let (
        Linear::ScaleBias {
            axis: a0,
            scale: s0,
            bias: b0,
        },
        Linear::ScaleBias {
            axis: a1,
            scale: s1,
            bias: b1,
        },
    ) = (*first, *second)
    else {
        return Err(mismatch(first, second));
    };
    ensure!(a0 == a1, "scale-bias axes differ ({a0} vs {a1})");
    let (s0, b0) = scale_bias_vectors(s0, b0)?;
    let (s1, b1) = scale_bias_vectors(s1, b1)?;
    ensure!(s0.len() == s1.len(), "channel counts differ");
    let scale: Vec<f32> = s0.iter().zip(&s1).map(|(a, b)| a * b).collect();
    let bias: Vec<f32> = b0
        .iter()
        .zip(&s1)
        .zip(&b1)
        .map(|((b0, s1), b1)| s1 * b0 + b1)
        .collect();
    let channels = scale.len();
    Ok(Rewrite {
        op: Operation::ScaleBias { axis: a0 },
        inputs: vec![
            Operand::Data,
            Operand::New(Shape::new([channels]), scale),
            Operand::New(Shape::new([channels]), bias),
        ],
    })
}

/// `(x * s0 + b0) · W + b1 = x · (diag(s0) W) + (b0 · W + b1)`.
pub(super) fn scale_bias_dense(first: &Linear<'_>, second: &Linear<'_>) -> Result<Rewrite> {
    let (
        Linear::ScaleBias {
            axis,
            scale,
            bias: offset,
        },
        Linear::Dense {
            activation,
            weight,
            bias,
        },
    ) = (*first, *second)
    else {
        return Err(mismatch(first, second));
    };
    ensure!(axis == -1, "scale-bias must act on the feature axis, got axis {axis}");
    let (s0, b0) = scale_bias_vectors(scale, offset)?;
    let mut dense = dense_weights(weight, bias)?;
    ensure!(s0.len() == dense.k, "scale has {} values, dense expects {}", s0.len(), dense.k);
    for (row, (s, b)) in dense.weight.chunks_mut(dense.n).zip(s0.iter().zip(&b0)) {
        for (col, w) in row.iter_mut().enumerate() {
            dense.bias[col] += b * *w;
            *w *= s;
        }
    }
    Ok(dense_rewrite(activation, dense))
}

/// `(x · W + b0) * s1 + b1 = x · (W diag(s1)) + (b0 * s1 + b1)`.
pub(super) fn dense_scale_bias(first: &Linear<'_>, second: &Linear<'_>) -> Result<Rewrite> {
    let (
        Linear::Dense {
            weight,
            bias,
            ..
        },
        Linear::ScaleBias {
            axis,
            scale,
            bias: offset,
        },
    ) = (*first, *second)
    else {
        return Err(mismatch(first, second));
    };
    ensure!(axis == -1, "scale-bias must act on the feature axis, got axis {axis}");
    let (s1, b1) = scale_bias_vectors(scale, offset)?;
    let mut dense = dense_weights(weight, bias)?;
    ensure!(s1.len() == dense.n, "scale has {} values, dense produces {}", s1.len(), dense.n);
    for row in dense.weight.chunks_mut(dense.n) {
        row.iter_mut().zip(&s1).for_each(|(w, s)| *w *= s);
    }
    for (b, (s, c)) in dense.bias.iter_mut().zip(s1.iter().zip(&b1)) {
        *b = *b * s + c;
    }
    Ok(dense_rewrite(FusedActivation::None, dense))
}

pub(super) fn dense_add(first: &Linear<'_>, second: &Linear<'_>) -> Result<Rewrite> {
    let (Linear::Dense { weight, bias, .. }, Linear::Elementwise { constant, .. }) =
        (*first, *second)
    else {
        return Err(mismatch(first, second));
    };
    let mut dense = dense_weights(weight, bias)?;
    let offset = per_feature(constant, dense.n)?;
    dense.bias.iter_mut().zip(&offset).for_each(|(b, c)| *b += c);
    Ok(dense_rewrite(FusedActivation::None, dense))
}

pub(super) fn dense_mul(first: &Linear<'_>, second: &Linear<'_>) -> Result<Rewrite> {
    let (Linear::Dense { weight, bias, .. }, Linear::Elementwise { constant, .. }) =
        (*first, *second)
    else {
        return Err(mismatch(first, second));
    };
    let mut dense = dense_weights(weight, bias)?;
    let scale = per_feature(constant, dense.n)?;
    for row in dense.weight.chunks_mut(dense.n) {
        row.iter_mut().zip(&scale).for_each(|(w, s)| *w *= s);
    }
    dense.bias.iter_mut().zip(&scale).for_each(|(b, s)| *b *= s);
    Ok(dense_rewrite(FusedActivation::None, dense))
}

/// `(x · W0 + b0) · W1 + b1 = x · (W0 W1) + (b0 · W1 + b1)`.
pub(super) fn dense_dense(first: &Linear<'_>, second: &Linear<'_>) -> Result<Rewrite> {
    let (
        Linear::Dense {
            weight: w0,
            bias: b0,
            ..
        },
        Linear::Dense {
            activation,
            weight: w1,
            bias: b1,
        },
    ) = (*first, *second)
    else {
        return Err(mismatch(first, second));
    };
    let inner = dense_weights(w0, b0)?;
    let outer = dense_weights(w1, b1)?;
    ensure!(
        inner.n == outer.k,
        "dense chain {}x{} then {}x{} does not compose",
        inner.k,
        inner.n,
        outer.k,
        outer.n
    );
    let (k, n, m) = (inner.k, inner.n, outer.n);
    let mut weight = vec![0.0f32; k * m];
    for row in 0..k {
        for mid in 0..n {
            let a = inner.weight[row * n + mid];
            let dst = &mut weight[row * m..(row + 1) * m];
            let src = &outer.weight[mid * m..(mid + 1) * m];
            dst.iter_mut().zip(src).for_each(|(d, s)| *d += a * s);
        }
    }
    let mut bias = outer.bias;
    for (mid, b) in inner.bias.iter().enumerate() {
        let src = &outer.weight[mid * m..(mid + 1) * m];
        bias.iter_mut().zip(src).for_each(|(d, s)| *d += b * s);
    }
    Ok(dense_rewrite(
        activation,
        DenseWeights {
            k,
            n: m,
            weight,
            bias,
        },
    ))
}

pub(super) fn conv_add(first: &Linear<'_>, second: &Linear<'_>) -> Result<Rewrite> {
    let (Linear::Conv { params, kernel, bias }, Linear::Elementwise { constant, .. }) =
        (*first, *second)
    else {
        return Err(mismatch(first, second));
    };
    let mut conv = ConvWeights::load(params, kernel, bias)?;
    let offset = per_channel(constant, conv.out)?;
    conv.bias.iter_mut().zip(&offset).for_each(|(b, c)| *b += c);
    Ok(conv.into_rewrite(params, FusedActivation::None))
}

pub(super) fn conv_mul(first: &Linear<'_>, second: &Linear<'_>) -> Result<Rewrite> {
    let (Linear::Conv { params, kernel, bias }, Linear::Elementwise { constant, .. }) =
        (*first, *second)
    else {
        return Err(mismatch(first, second));
    };
    let mut conv = ConvWeights::load(params, kernel, bias)?;
    let scale = per_channel(constant, conv.out)?;
    conv.scale_outputs(&scale);
    conv.bias.iter_mut().zip(&scale).for_each(|(b, s)| *b *= s);
    Ok(conv.into_rewrite(params, FusedActivation::None))
}

pub(super) fn conv_scale_bias(first: &Linear<'_>, second: &Linear<'_>) -> Result<Rewrite> {
    let (
        Linear::Conv { params, kernel, bias },
        Linear::ScaleBias {
            axis,
            scale,
            bias: offset,
        },
    ) = (*first, *second)
    else {
        return Err(mismatch(first, second));
    };
    ensure!(is_channel_axis(axis), "scale-bias axis {axis} is not the channel axis");
    let (s1, b1) = scale_bias_vectors(scale, offset)?;
    let mut conv = ConvWeights::load(params, kernel, bias)?;
    ensure!(s1.len() == conv.out, "scale has {} values, conv produces {}", s1.len(), conv.out);
    conv.scale_outputs(&s1);
    for (b, (s, c)) in conv.bias.iter_mut().zip(s1.iter().zip(&b1)) {
        *b = *b * s + c;
    }
    Ok(conv.into_rewrite(params, FusedActivation::None))
}

/// Padding taps read zeros rather than the added constant, so an additive
/// input offset only folds into the bias when no padding is applied.
fn ensure_unpadded(params: &ConvParams) -> Result<()> {
    ensure!(
        params.has_zero_padding(),
        "padded convolution ({:?}, pads {:?}) cannot absorb an input offset",
        params.auto_pad,
        params.pads
    );
    Ok(())
}

pub(super) fn add_conv(first: &Linear<'_>, second: &Linear<'_>) -> Result<Rewrite> {
    let (
        Linear::Elementwise { constant, .. },
        Linear::Conv {
            params,
            kernel,
            bias,
        },
    ) = (*first, *second)
    else {
        return Err(mismatch(first, second));
    };
    ensure_unpadded(params)?;
    let mut conv = ConvWeights::load(params, kernel, bias)?;
    let offset = per_channel(constant, conv.in_channels())?;
    conv.absorb_input_offset(&offset);
    Ok(conv.into_rewrite(params, params.activation))
}

/// Scaling input channels commutes with zero padding, so any padding works.
pub(super) fn mul_conv(first: &Linear<'_>, second: &Linear<'_>) -> Result<Rewrite> {
    let (
        Linear::Elementwise { constant, .. },
        Linear::Conv {
            params,
            kernel,
            bias,
        },
    ) = (*first, *second)
    else {
        return Err(mismatch(first, second));
    };
    let mut conv = ConvWeights::load(params, kernel, bias)?;
    let scale = per_channel(constant, conv.in_channels())?;
    conv.scale_inputs(&scale);
    Ok(conv.into_rewrite(params, params.activation))
}

pub(super) fn scale_bias_conv(first: &Linear<'_>, second: &Linear<'_>) -> Result<Rewrite> {
    let (
        Linear::ScaleBias {
            axis,
            scale,
            bias: offset,
        },
        Linear::Conv {
            params,
            kernel,
            bias,
        },
    ) = (*first, *second)
    else {
        return Err(mismatch(first, second));
    };
    ensure!(is_channel_axis(axis), "scale-bias axis {axis} is not the channel axis");
    ensure_unpadded(params)?;
    let (s0, b0) = scale_bias_vectors(scale, offset)?;
    let mut conv = ConvWeights::load(params, kernel, bias)?;
    ensure!(
        s0.len() == conv.in_channels(),
        "scale has {} values, conv reads {} channels",
        s0.len(),
        conv.in_channels()
    );
    // Offset first: it is defined on the unscaled kernel.
    conv.absorb_input_offset(&b0);
    conv.scale_inputs(&s0);
    Ok(conv.into_rewrite(params, params.activation))
}
