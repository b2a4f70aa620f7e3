use std::collections::{HashMap, HashSet};

use crate::graph::{Graph, TensorId};

use super::{GraphPass, OptimizeContext, PassResult};

/// Removes layers whose outputs never reach a graph output, then drops
/// constants nothing reads anymore.
#[derive(Default)]
pub struct DeadCodeEliminationPass;

impl DeadCodeEliminationPass {
    const NAME: &'static str = "dce";
}

impl GraphPass for DeadCodeEliminationPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self, graph: &mut Graph, _cx: &mut OptimizeContext) -> PassResult {
        let mut def_map: HashMap<TensorId, usize> = HashMap::with_capacity(graph.layers.len());
        for (idx, layer) in graph.layers.iter().enumerate() {
            for output in layer.output_ids() {
                def_map.insert(output, idx);
            }
        }

        let mut worklist: Vec<TensorId> = graph.outputs.iter().map(|output| output.id).collect();
        let mut live_layers: HashSet<usize> = HashSet::new();
        let mut seen: HashSet<TensorId> = HashSet::new();
        while let Some(value) = worklist.pop() {
            if !seen.insert(value) {
                continue;
            }
            let Some(&idx) = def_map.get(&value) else {
                continue;
            };
            if live_layers.insert(idx) {
                worklist.extend(graph.layers[idx].input_ids());
            }
        }

        let before = graph.layers.len();
        let mut idx = 0usize;
        graph.layers.retain(|_| {
            let keep = live_layers.contains(&idx);
            idx += 1;
            keep
        });
        let removed = before - graph.layers.len();
        let constants_removed = graph.remove_unused_constants();

        PassResult {
            changed: removed > 0 || constants_removed > 0,
            iterations: 1,
            rewrites_applied: constants_removed,
            erased_layers: removed,
        }
    }
}
