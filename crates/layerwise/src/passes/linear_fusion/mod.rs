//! Algebraic fusion of adjacent affine layers.
//!
//! A pair `l0 -> l1` is rewritten into a single layer when `l1`'s data input
//! is `l0`'s only output, nobody else reads that output, and a fuser is
//! registered for the exact `(kind(l0), kind(l1))` pair. The fused layer
//! keeps `l1`'s id and outputs; the constants it references are computed
//! from both layers' constants. Constants that become unused are left for
//! dead-code elimination.

mod fusers;

use std::collections::HashMap;

use anyhow::Result;

use crate::graph::{
    Constant, ConvParams, FusedActivation, Graph, Layer, OpKind, Operation, TensorId,
};
use crate::tensor::{Dimension, Shape};

use super::{GraphPass, OptimizeContext, PassResult};

/// Affine view of a layer whose parameters are all constants.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Linear<'g> {
    /// `sign * x + factor * c` for Add/Sub, `x * c` for Mul.
    Elementwise {
        kind: OpKind,
        sign: f32,
        factor: f32,
        constant: &'g Constant,
    },
    ScaleBias {
        axis: isize,
        scale: &'g Constant,
        bias: &'g Constant,
    },
    ScalarMad {
        s: f32,
        b: f32,
    },
    Dense {
        activation: FusedActivation,
        weight: &'g Constant,
        bias: Option<&'g Constant>,
    },
    Conv {
        params: &'g ConvParams,
        kernel: &'g Constant,
        bias: Option<&'g Constant>,
    },
}

/// Operand of a fused layer.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Operand {
    /// The data input of the first layer of the pair.
    Data,
    /// A freshly computed float constant.
    New(Shape, Vec<f32>),
}

/// Replacement produced by a fuser.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Rewrite {
    pub op: Operation,
    pub inputs: Vec<Operand>,
}

pub(crate) type Fuser = fn(&Linear<'_>, &Linear<'_>) -> Result<Rewrite>;

/// Splits `layer` into its data input and affine parameters.
fn classify<'g>(graph: &'g Graph, layer: &'g Layer) -> Option<(TensorId, Linear<'g>)> {
    let constant = |position: usize| layer.input(position).and_then(|id| graph.constant(id));
    let data = |position: usize| layer.input(position).filter(|id| !graph.is_constant(*id));
    // Optional parameters must be absent or constant.
    let optional = |position: usize| match layer.input(position) {
        None => Some(None),
        Some(id) => graph.constant(id).map(Some),
    };

    match &layer.op {
        Operation::Add | Operation::Sub | Operation::Mul => {
            let kind = layer.kind();
            let (x, c, constant_first) = match (data(0), constant(1), constant(0), data(1)) {
                (Some(x), Some(c), _, _) => (x, c, false),
                (_, _, Some(c), Some(x)) => (x, c, true),
                _ => return None,
            };
            let (sign, factor) = match (kind, constant_first) {
                (OpKind::Sub, false) => (1.0, -1.0),
                (OpKind::Sub, true) => (-1.0, 1.0),
                _ => (1.0, 1.0),
            };
            Some((
                x,
                Linear::Elementwise {
                    kind,
                    sign,
                    factor,
                    constant: c,
                },
            ))
        }
        Operation::ScaleBias { axis } => Some((
            data(0)?,
            Linear::ScaleBias {
                axis: *axis,
                scale: constant(1)?,
                bias: constant(2)?,
            },
        )),
        Operation::ScalarMad { s, b } => Some((data(0)?, Linear::ScalarMad { s: *s, b: *b })),
        Operation::Dense { activation } => Some((
            data(0)?,
            Linear::Dense {
                activation: *activation,
                weight: constant(1)?,
                bias: optional(2)?,
            },
        )),
        Operation::Conv(params) => Some((
            data(0)?,
            Linear::Conv {
                params,
                kernel: constant(1)?,
                bias: optional(2)?,
            },
        )),
        _ => None,
    }
}

/// Statically known channel extent (axis 1) of `id`: a declared graph input
/// or the output of a convolution with a constant kernel.
fn channel_extent(graph: &Graph, id: TensorId) -> Option<usize> {
    if let Some(input) = graph.inputs.iter().find(|input| input.id == id) {
        return match input.shape.dims().get(1)? {
            Dimension::Static(extent) => Some(*extent),
            Dimension::Dynamic(_) => None,
        };
    }
    let layer = &graph.layers[*graph.producer_index().get(&id)?];
    match layer.op {
        Operation::Conv(_) => graph
            .constant(layer.input(1)?)
            .and_then(|kernel| kernel.shape.dims().first().copied()),
        _ => None,
    }
}

/// An elementwise constant ahead of a convolution may broadcast the data up
/// to the kernel's channel count. Multi-valued constants therefore need `x`
/// to already carry exactly the channels the kernel reads.
fn keeps_data_channels(graph: &Graph, x: TensorId, first: &Linear<'_>, second: &Linear<'_>) -> bool {
    let (Linear::Elementwise { constant, .. }, Linear::Conv { params, kernel, .. }) = (first, second)
    else {
        return true;
    };
    if constant.shape.num_elements() <= 1 {
        return true;
    }
    let reads = kernel
        .shape
        .dims()
        .get(1)
        .map(|per_group| per_group * params.group.max(1));
    reads.is_some() && channel_extent(graph, x) == reads
}

/// Merges chains of affine layers into one layer.
pub struct LinearFusionPass {
    fusers: HashMap<(OpKind, OpKind), Fuser>,
}

impl LinearFusionPass {
    const NAME: &'static str = "linear-fusion";

    pub fn new() -> Self {
        use OpKind::*;

        let mut fusers: HashMap<(OpKind, OpKind), Fuser> = HashMap::new();
        for pair in [(Add, Add), (Add, Sub), (Sub, Add), (Sub, Sub)] {
            fusers.insert(pair, fusers::add_sub);
        }
        fusers.insert((Mul, Mul), fusers::mul_mul);
        fusers.insert((ScalarMad, ScalarMad), fusers::scalar_mad_scalar_mad);
        fusers.insert((ScaleBias, ScaleBias), fusers::scale_bias_scale_bias);
        fusers.insert((ScaleBias, Dense), fusers::scale_bias_dense);
        fusers.insert((Dense, ScaleBias), fusers::dense_scale_bias);
        fusers.insert((Dense, Add), fusers::dense_add);
        fusers.insert((Dense, Mul), fusers::dense_mul);
        fusers.insert((Dense, Dense), fusers::dense_dense);
        fusers.insert((Conv, Add), fusers::conv_add);
        fusers.insert((Conv, Mul), fusers::conv_mul);
        fusers.insert((Conv, ScaleBias), fusers::conv_scale_bias);
        fusers.insert((Add, Conv), fusers::add_conv);
        fusers.insert((Mul, Conv), fusers::mul_conv);
        fusers.insert((ScaleBias, Conv), fusers::scale_bias_conv);
        Self { fusers }
    }

    /// True when a fuser is registered for the ordered pair.
    pub fn supports(&self, first: OpKind, second: OpKind) -> bool {
        self.fusers.contains_key(&(first, second))
    }

    /// Finds the producer `l0` of `layers[idx]`'s data input if the pair may fuse.
    fn candidate(&self, graph: &Graph, idx: usize) -> Option<(usize, Fuser)> {
        let l1 = &graph.layers[idx];
        let (y0, _) = classify(graph, l1)?;
        let producer = *graph.producer_index().get(&y0)?;
        let l0 = &graph.layers[producer];
        let fuser = *self.fusers.get(&(l0.kind(), l1.kind()))?;

        if l0.sole_output() != Some(y0)
            || graph.is_output(y0)
            || l0.op.fused_activation() != FusedActivation::None
        {
            return None;
        }
        let single_reader = graph
            .consumers()
            .get(&y0)
            .is_some_and(|readers| readers.as_slice() == [idx]);
        single_reader.then_some((producer, fuser))
    }
}

impl Default for LinearFusionPass {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphPass for LinearFusionPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self, graph: &mut Graph, _cx: &mut OptimizeContext) -> PassResult {
        let mut fused = 0usize;
        let mut idx = 0usize;
        while idx < graph.layers.len() {
            let Some((producer, fuser)) = self.candidate(graph, idx) else {
                idx += 1;
                continue;
            };
            let (l0, l1) = (&graph.layers[producer], &graph.layers[idx]);
            let (Some((x, first)), Some((_, second))) = (classify(graph, l0), classify(graph, l1))
            else {
                idx += 1;
                continue;
            };
            if !keeps_data_channels(graph, x, &first, &second) {
                tracing::debug!(
                    first = %l0.id,
                    second = %l1.id,
                    "fusion skipped: constant may widen the data channels"
                );
                idx += 1;
                continue;
            }
            let rewrite = match fuser(&first, &second) {
                Ok(rewrite) => rewrite,
                Err(err) => {
                    tracing::debug!(
                        first = %l0.id,
                        second = %l1.id,
                        pair = %format!("{}->{}", l0.op.name(), l1.op.name()),
                        reason = %err,
                        "fusion skipped"
                    );
                    idx += 1;
                    continue;
                }
            };
            tracing::debug!(
                first = %l0.id,
                second = %l1.id,
                fused = rewrite.op.name(),
                "fused linear layers"
            );

            let (id, outputs) = (l1.id, l1.outputs.clone());
            let inputs = rewrite
                .inputs
                .into_iter()
                .map(|operand| match operand {
                    Operand::Data => Some(x),
                    Operand::New(shape, values) => Some(graph.add_constant_f32(shape, values)),
                })
                .collect();
            graph.layers[idx] = Layer {
                id,
                op: rewrite.op,
                inputs,
                outputs,
            };
            graph.layers.remove(producer);
            fused += 1;
            // The fused layer may now pair with its own producer.
            idx = producer;
        }

        PassResult {
            changed: fused > 0,
            iterations: 1,
            rewrites_applied: fused,
            erased_layers: fused,
        }
    }
}
