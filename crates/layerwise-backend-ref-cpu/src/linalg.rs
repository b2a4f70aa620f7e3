//! Matrix and convolution kernels, parallel over output rows or planes.

use layerwise::backend::{BackendError, BackendResult};
use layerwise::graph::{ConvParams, FusedActivation};
use layerwise::ops::broadcast::BroadcastMap;
use layerwise::ops::geometry::{ConvGeometry, MatMulGeometry};
use layerwise::tensor::Tensor;
use rayon::prelude::*;

use crate::cpu::{apply_activation, expect_float, input, single_output};

/// `x[..., K] · W[K, N] + bias[N]`.
pub(crate) fn op_dense(
    name: &'static str,
    activation: FusedActivation,
    inputs: &[Option<&Tensor>],
    outputs: &mut [Tensor],
) -> BackendResult<()> {
    let x = input(name, inputs, 0)?;
    let w = input(name, inputs, 1)?;
    expect_float(name, x)?;
    let bias = inputs.get(2).copied().flatten().map(Tensor::as_f32);
    let [k, n] = *w.shape().dims() else {
        return Err(BackendError::execution(name, "weight must be rank 2"));
    };
    if x.shape().dims().last().copied() != Some(k) {
        return Err(BackendError::execution(
            name,
            format!("input {} does not end in {k}", x.shape()),
        ));
    }
    if bias.is_some_and(|b| b.len() != n) {
        return Err(BackendError::execution(name, format!("bias must hold {n} values")));
    }

    let out = single_output(name, outputs)?.as_f32_mut();
    if n == 0 || out.is_empty() {
        return Ok(());
    }
    let (xv, wv) = (x.as_f32(), w.as_f32());
    out.par_chunks_mut(n).enumerate().for_each(|(row, dst)| {
        let src = &xv[row * k..(row + 1) * k];
        match bias {
            Some(bias) => dst.copy_from_slice(bias),
            None => dst.fill(0.0),
        }
        for (i, &xi) in src.iter().enumerate() {
            let weights = &wv[i * n..(i + 1) * n];
            for (acc, &wij) in dst.iter_mut().zip(weights) {
                *acc += xi * wij;
            }
        }
        apply_activation(dst, activation);
    });
    Ok(())
}

/// Batched matrix product with broadcast batch dimensions.
pub(crate) fn op_matmul(
    name: &'static str,
    inputs: &[Option<&Tensor>],
    outputs: &mut [Tensor],
) -> BackendResult<()> {
    let a = input(name, inputs, 0)?;
    let b = input(name, inputs, 1)?;
    expect_float(name, a)?;
    let geometry = MatMulGeometry::resolve(a.shape().dims(), b.shape().dims())
        .map_err(|err| BackendError::execution(name, err.to_string()))?;
    let MatMulGeometry { m, k, n, .. } = geometry;
    let a_map = BroadcastMap::new(&geometry.a_batch, &geometry.batch);
    let b_map = BroadcastMap::new(&geometry.b_batch, &geometry.batch);

    let out = single_output(name, outputs)?.as_f32_mut();
    let plane = m * n;
    if plane == 0 || out.is_empty() {
        return Ok(());
    }
    let (av, bv) = (a.as_f32(), b.as_f32());
    out.par_chunks_mut(plane).enumerate().for_each(|(batch, dst)| {
        let lhs = &av[a_map.offset(batch) * m * k..][..m * k];
        let rhs = &bv[b_map.offset(batch) * k * n..][..k * n];
        dst.fill(0.0);
        for i in 0..m {
            let row = &mut dst[i * n..(i + 1) * n];
            for p in 0..k {
                let lhs_ip = lhs[i * k + p];
                for (acc, &rhs_pj) in row.iter_mut().zip(&rhs[p * n..(p + 1) * n]) {
                    *acc += lhs_ip * rhs_pj;
                }
            }
        }
    });
    Ok(())
}

/// Direct grouped NCHW convolution.
pub(crate) fn op_conv(
    name: &'static str,
    params: &ConvParams,
    inputs: &[Option<&Tensor>],
    outputs: &mut [Tensor],
) -> BackendResult<()> {
    let x = input(name, inputs, 0)?;
    let kernel = input(name, inputs, 1)?;
    expect_float(name, x)?;
    let bias = inputs.get(2).copied().flatten().map(Tensor::as_f32);
    let g = ConvGeometry::resolve(params, x.shape().dims(), kernel.shape().dims())
        .map_err(|err| BackendError::execution(name, err.to_string()))?;
    if bias.is_some_and(|b| b.len() != g.out_channels) {
        return Err(BackendError::execution(
            name,
            format!("bias must hold {} values", g.out_channels),
        ));
    }

    let out = single_output(name, outputs)?.as_f32_mut();
    let plane = g.out_h * g.out_w;
    if plane == 0 || out.is_empty() {
        return Ok(());
    }
    let group_in = g.in_channels / g.group;
    let group_out = g.out_channels / g.group;
    let (xv, kv) = (x.as_f32(), kernel.as_f32());
    out.par_chunks_mut(plane).enumerate().for_each(|(index, dst)| {
        let (b, oc) = (index / g.out_channels, index % g.out_channels);
        let first_in = (oc / group_out) * group_in;
        dst.fill(bias.map_or(0.0, |bias| bias[oc]));
        for ic in 0..group_in {
            let src = &xv[((b * g.in_channels) + first_in + ic) * g.in_h * g.in_w..][..g.in_h * g.in_w];
            let taps = &kv[(oc * group_in + ic) * g.kernel_h * g.kernel_w..][..g.kernel_h * g.kernel_w];
            for oy in 0..g.out_h {
                for ox in 0..g.out_w {
                    let mut acc = 0.0f32;
                    for ky in 0..g.kernel_h {
                        let iy = (oy * g.stride[0] + ky * g.dilation[0]) as isize - g.pad_top as isize;
                        if iy < 0 || iy as usize >= g.in_h {
                            continue;
                        }
                        for kx in 0..g.kernel_w {
                            let ix = (ox * g.stride[1] + kx * g.dilation[1]) as isize
                                - g.pad_left as isize;
                            if ix < 0 || ix as usize >= g.in_w {
                                continue;
                            }
                            acc += src[iy as usize * g.in_w + ix as usize] * taps[ky * g.kernel_w + kx];
                        }
                    }
                    dst[oy * g.out_w + ox] += acc;
                }
            }
        }
        apply_activation(dst, params.activation);
    });
    Ok(())
}
