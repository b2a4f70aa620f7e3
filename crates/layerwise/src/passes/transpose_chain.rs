use crate::graph::{Graph, Operation};

use super::{GraphPass, OptimizeContext, PassResult};

fn is_identity_perm(perm: &[usize]) -> bool {
    perm.iter().copied().eq(0..perm.len())
}

fn compose_perms(first: &[usize], second: &[usize]) -> Option<Vec<usize>> {
    if first.len() != second.len() {
        return None;
    }
    let mut result = Vec::with_capacity(first.len());
    for &axis in second {
        if axis >= first.len() {
            return None;
        }
        result.push(first[axis]);
    }
    Some(result)
}

/// Folds `transpose(transpose(x, p1), p2)` into `transpose(x, p1∘p2)`, or
/// into `x` itself when the composition is the identity.
///
/// The inner transpose is left in place; dead-code elimination removes it
/// once nothing else reads it.
#[derive(Default)]
pub struct TransposeChainPass;

impl TransposeChainPass {
    const NAME: &'static str = "transpose-chain";
}

impl GraphPass for TransposeChainPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self, graph: &mut Graph, _cx: &mut OptimizeContext) -> PassResult {
        let mut result = PassResult {
            iterations: 1,
            ..PassResult::default()
        };
        let mut idx = 0usize;
        while idx < graph.layers.len() {
            let producers = graph.producer_index();
            let outer = &graph.layers[idx];
            let Operation::Transpose { perm: Some(outer_perm) } = &outer.op else {
                idx += 1;
                continue;
            };
            let Some(inner_value) = outer.input(0) else {
                idx += 1;
                continue;
            };
            let Some(inner) = producers.get(&inner_value).map(|&p| &graph.layers[p]) else {
                idx += 1;
                continue;
            };
            let (Operation::Transpose { perm: Some(inner_perm) }, Some(base)) =
                (&inner.op, inner.input(0))
            else {
                idx += 1;
                continue;
            };
            let Some(composed) = compose_perms(inner_perm, outer_perm) else {
                idx += 1;
                continue;
            };

            if is_identity_perm(&composed) {
                let Some(output) = outer.sole_output() else {
                    idx += 1;
                    continue;
                };
                graph.layers.remove(idx);
                graph.replace_uses(output, base);
                result.erased_layers += 1;
            } else {
                let outer = &mut graph.layers[idx];
                outer.op = Operation::Transpose {
                    perm: Some(composed),
                };
                outer.inputs[0] = Some(base);
                idx += 1;
            }
            result.rewrites_applied += 1;
            result.changed = true;
        }
        result
    }
}
