use crate::graph::{Graph, Layer, Operation, TensorId};

use super::{GraphPass, OptimizeContext, PassResult};

/// Bypasses layers that forward their first input unchanged: `Identity`,
/// identity transposes, `ScalarMad{1, 0}`, adding or subtracting a scalar
/// zero and multiplying or dividing by a scalar one.
#[derive(Default)]
pub struct NoOpRemovalPass;

impl NoOpRemovalPass {
    const NAME: &'static str = "noop-removal";
}

fn is_scalar_constant(graph: &Graph, id: Option<TensorId>, value: f32) -> bool {
    id.and_then(|id| graph.constant(id))
        .is_some_and(|constant| constant.shape.rank() == 0 && constant.is_single_value(value))
}

/// Input forwarded by `layer` when it is a no-op.
fn forwarded_input(graph: &Graph, layer: &Layer) -> Option<TensorId> {
    let source = layer.input(0)?;
    let forwards = match &layer.op {
        Operation::Identity => true,
        Operation::Transpose { perm: Some(perm) } => perm.iter().copied().eq(0..perm.len()),
        Operation::ScalarMad { s, b } => *s == 1.0 && *b == 0.0,
        Operation::Add | Operation::Sub => is_scalar_constant(graph, layer.input(1), 0.0),
        Operation::Mul | Operation::Div => is_scalar_constant(graph, layer.input(1), 1.0),
        _ => false,
    };
    forwards.then_some(source)
}

impl GraphPass for NoOpRemovalPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self, graph: &mut Graph, _cx: &mut OptimizeContext) -> PassResult {
        let mut removed = 0usize;
        let mut idx = 0usize;
        while idx < graph.layers.len() {
            let layer = &graph.layers[idx];
            let (Some(source), Some(output)) = (forwarded_input(graph, layer), layer.sole_output())
            else {
                idx += 1;
                continue;
            };
            tracing::trace!(layer = %layer.id, op = layer.op.name(), "removing no-op layer");
            graph.layers.remove(idx);
            graph.replace_uses(output, source);
            removed += 1;
        }

        PassResult {
            changed: removed > 0,
            iterations: 1,
            rewrites_applied: removed,
            erased_layers: removed,
        }
    }
}
