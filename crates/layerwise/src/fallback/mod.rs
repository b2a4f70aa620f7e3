//! Static analysis deciding which layers must run on the CPU backend.
//!
//! Some operations read one of their inputs on the host (a target shape, a
//! `k`, padding amounts). When an accelerator is selected, producing such a
//! value on the device would force a device-to-host readback in the middle of
//! the run, so the producer and all of its true data ancestors run on the CPU
//! instead.

mod tables;

use std::collections::HashSet;

use crate::backend::BackendType;
use crate::graph::{Graph, LayerId, TensorId};

pub use tables::{host_read_inputs, is_data_dependency, InputUse};

/// Layers (and the tensors that pulled them in) routed to the CPU backend.
///
/// Computed once per `(graph, backend)` pair and never mutated afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FallbackSet {
    tensors: HashSet<TensorId>,
    layers: HashSet<LayerId>,
}

impl FallbackSet {
    pub fn contains_layer(&self, layer: LayerId) -> bool {
        self.layers.contains(&layer)
    }

    /// True when `tensor` must be host-readable.
    pub fn contains_tensor(&self, tensor: TensorId) -> bool {
        self.tensors.contains(&tensor)
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty() && self.tensors.is_empty()
    }

    pub fn layers(&self) -> impl Iterator<Item = LayerId> + '_ {
        self.layers.iter().copied()
    }

    pub fn tensors(&self) -> impl Iterator<Item = TensorId> + '_ {
        self.tensors.iter().copied()
    }
}

/// Entry point of the analysis.
pub struct CpuFallback;

impl CpuFallback {
    /// Computes the fallback set of `graph` for `backend`.
    ///
    /// The seed pass collects every tensor read on the host. The backward pass
    /// then marks each layer producing a marked tensor and marks that layer's
    /// data-dependent inputs in turn. Walking layers last to first visits every
    /// consumer before its producers, so one sweep reaches the closure.
    pub fn calculate(graph: &Graph, backend: BackendType) -> FallbackSet {
        let mut set = FallbackSet::default();
        if backend.is_cpu() {
            return set;
        }

        for layer in &graph.layers {
            for &position in host_read_inputs(layer.kind()) {
                if let Some(tensor) = layer.input(position) {
                    set.tensors.insert(tensor);
                }
            }
        }
        let seeds = set.tensors.len();

        for layer in graph.layers.iter().rev() {
            if !layer.output_ids().any(|output| set.tensors.contains(&output)) {
                continue;
            }
            set.layers.insert(layer.id);
            for (position, input) in layer.inputs.iter().enumerate() {
                let Some(input) = input else {
                    continue;
                };
                if is_data_dependency(layer.kind(), position) {
                    set.tensors.insert(*input);
                }
            }
        }

        tracing::debug!(
            %backend,
            seeds,
            tensors = set.tensors.len(),
            layers = set.layers.len(),
            "computed cpu fallback set"
        );
        set
    }
}
