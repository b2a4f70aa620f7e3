use std::collections::HashMap;

use crate::graph::Graph;

use super::{GraphPass, OptimizeContext, PassResult};

/// Removes layers that repeat an earlier layer's operation on the same
/// inputs, rerouting their readers to the earlier outputs.
///
/// Layers are keyed by the serialized `(operation, inputs)` pair. Random
/// operations are never merged.
#[derive(Default)]
pub struct DuplicateLayerRemovalPass;

impl DuplicateLayerRemovalPass {
    const NAME: &'static str = "duplicate-removal";
}

impl GraphPass for DuplicateLayerRemovalPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self, graph: &mut Graph, _cx: &mut OptimizeContext) -> PassResult {
        let mut seen: HashMap<Vec<u8>, usize> = HashMap::new();
        let mut stats = PassResult {
            iterations: 1,
            ..PassResult::default()
        };

        let mut idx = 0usize;
        while idx < graph.layers.len() {
            let layer = &graph.layers[idx];
            if layer.kind().is_stochastic() {
                idx += 1;
                continue;
            }
            let key_bytes = match bincode::serialize(&(&layer.op, &layer.inputs)) {
                Ok(bytes) => bytes,
                Err(_) => {
                    idx += 1;
                    continue;
                }
            };

            let Some(&original_idx) = seen.get(&key_bytes) else {
                seen.insert(key_bytes, idx);
                idx += 1;
                continue;
            };

            let original = &graph.layers[original_idx];
            let replacements: Option<Vec<_>> = layer
                .outputs
                .iter()
                .zip(&original.outputs)
                .map(|(dup, orig)| match (dup, orig) {
                    (Some(dup), Some(orig)) => Some(Some((*dup, *orig))),
                    (None, _) => Some(None),
                    (Some(_), None) => None,
                })
                .collect();
            let Some(replacements) = replacements else {
                idx += 1;
                continue;
            };

            tracing::trace!(layer = %layer.id, original = %original.id, "removing duplicate layer");
            graph.layers.remove(idx);
            for (dup, orig) in replacements.into_iter().flatten() {
                graph.replace_uses(dup, orig);
            }
            stats.changed = true;
            stats.rewrites_applied += 1;
            stats.erased_layers += 1;
        }
        stats
    }
}
