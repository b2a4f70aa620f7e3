//! Graph rewriting infrastructure: the pass trait, its context and the
//! pipeline that sequences passes into bounded fixed-point groups.

mod pipeline;

use std::collections::HashSet;
use std::sync::Arc;

use crate::backend::Backend;
use crate::config::EngineConfig;
use crate::graph::{Graph, LayerId};

pub use pipeline::{default_pipeline, Pipeline, PipelineBuilder, Step};

/// Result returned by a [`GraphPass`] after it runs.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PassResult {
    /// Whether the pass changed the graph.
    pub changed: bool,
    /// Number of sweeps executed while applying the pass.
    pub iterations: usize,
    /// Total number of rewrites applied by the pass.
    pub rewrites_applied: usize,
    /// Layers removed by the pass.
    pub erased_layers: usize,
}

impl PassResult {
    /// Merges two run results, accumulating statistics.
    pub fn merge(self, other: PassResult) -> PassResult {
        PassResult {
            changed: self.changed || other.changed,
            iterations: self.iterations + other.iterations,
            rewrites_applied: self.rewrites_applied + other.rewrites_applied,
            erased_layers: self.erased_layers + other.erased_layers,
        }
    }
}

/// Interface implemented by every graph rewrite.
pub trait GraphPass: Send + Sync {
    fn name(&self) -> &'static str;
    fn run(&self, graph: &mut Graph, cx: &mut OptimizeContext) -> PassResult;
}

/// Services shared by the passes of one optimizer run.
pub struct OptimizeContext {
    cpu: Option<Arc<dyn Backend>>,
    config: EngineConfig,
    failed_folds: HashSet<LayerId>,
}

impl OptimizeContext {
    /// `cpu` evaluates all-constant layers; without it constant folding is skipped.
    pub fn new(cpu: Option<Arc<dyn Backend>>, config: EngineConfig) -> Self {
        Self {
            cpu,
            config,
            failed_folds: HashSet::new(),
        }
    }

    pub fn cpu(&self) -> Option<&dyn Backend> {
        self.cpu.as_deref()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// True when folding `layer` already failed during this run.
    pub fn is_failed_fold(&self, layer: LayerId) -> bool {
        self.failed_folds.contains(&layer)
    }

    pub fn record_failed_fold(&mut self, layer: LayerId) {
        self.failed_folds.insert(layer);
    }
}
