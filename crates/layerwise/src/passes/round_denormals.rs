use crate::graph::{ConstantData, Graph};

use super::{GraphPass, OptimizeContext, PassResult};

/// Flushes subnormal values in float constants to zero; some accelerators
/// treat them as zero anyway and run slowly when they do not.
#[derive(Default)]
pub struct RoundDenormalsPass;

impl RoundDenormalsPass {
    const NAME: &'static str = "round-denormals";
}

impl GraphPass for RoundDenormalsPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self, graph: &mut Graph, _cx: &mut OptimizeContext) -> PassResult {
        let mut rounded = 0usize;
        for constant in &mut graph.constants {
            let ConstantData::Float(values) = &mut constant.data else {
                continue;
            };
            for value in values.iter_mut().filter(|v| v.is_subnormal()) {
                *value = 0.0;
                rounded += 1;
            }
        }
        if rounded > 0 {
            tracing::debug!(rounded, "flushed subnormal constant values");
        }
        PassResult {
            changed: rounded > 0,
            iterations: 1,
            rewrites_applied: rounded,
            erased_layers: 0,
        }
    }
}
