use crate::graph::Graph;

use super::{GraphPass, OptimizeContext, PassResult};

/// Clears output slots of multi-output layers that nothing reads, so the
/// worker can return their storage right after the layer runs.
#[derive(Default)]
pub struct PruneOutputsPass;

impl PruneOutputsPass {
    const NAME: &'static str = "prune-outputs";
}

impl GraphPass for PruneOutputsPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self, graph: &mut Graph, _cx: &mut OptimizeContext) -> PassResult {
        let live = graph.live_tensors();
        let mut pruned = 0usize;
        for layer in &mut graph.layers {
            if layer.outputs.len() < 2 {
                continue;
            }
            let keep_any = layer.output_ids().any(|id| live.contains(&id));
            if !keep_any {
                continue;
            }
            for output in &mut layer.outputs {
                if output.is_some_and(|id| !live.contains(&id)) {
                    *output = None;
                    pruned += 1;
                }
            }
        }
        PassResult {
            changed: pruned > 0,
            iterations: 1,
            rewrites_applied: pruned,
            erased_layers: 0,
        }
    }
}
