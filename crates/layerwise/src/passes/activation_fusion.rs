use crate::graph::{FusedActivation, Graph, Operation};

use super::{GraphPass, OptimizeContext, PassResult};

/// Folds a `Relu` into the `Conv` or `Dense` layer producing its input.
#[derive(Default)]
pub struct ActivationFusionPass;

impl ActivationFusionPass {
    const NAME: &'static str = "activation-fusion";
}

impl GraphPass for ActivationFusionPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self, graph: &mut Graph, _cx: &mut OptimizeContext) -> PassResult {
        let mut fused = 0usize;
        let mut idx = 0usize;
        while idx < graph.layers.len() {
            let relu = &graph.layers[idx];
            if !matches!(relu.op, Operation::Relu) {
                idx += 1;
                continue;
            }
            let (Some(source), Some(relu_out)) = (relu.input(0), relu.sole_output()) else {
                idx += 1;
                continue;
            };
            let consumers = graph.consumers();
            let single_reader = consumers.get(&source).is_some_and(|readers| readers.len() == 1);
            let producer = graph.producer_index().get(&source).copied();
            let Some(producer) = producer.filter(|_| single_reader && !graph.is_output(source))
            else {
                idx += 1;
                continue;
            };

            let target = &mut graph.layers[producer];
            let slot = match &mut target.op {
                Operation::Dense { activation } => activation,
                Operation::Conv(params) => &mut params.activation,
                _ => {
                    idx += 1;
                    continue;
                }
            };
            if *slot != FusedActivation::None {
                idx += 1;
                continue;
            }
            *slot = FusedActivation::Relu;
            target.outputs[0] = Some(relu_out);
            tracing::debug!(layer = %target.id, "fused relu activation");
            graph.layers.remove(idx);
            fused += 1;
        }
        PassResult {
            changed: fused > 0,
            iterations: 1,
            rewrites_applied: fused,
            erased_layers: fused,
        }
    }
}
