use std::sync::Arc;

use crate::graph::Graph;
use crate::passes::{
    ActivationFusionPass, ConstantFoldingPass, DeadCodeEliminationPass, DuplicateLayerRemovalPass,
    LinearFusionPass, NoOpRemovalPass, PruneOutputsPass, RoundDenormalsPass,
    TransposeChainPass,
};

use super::{GraphPass, OptimizeContext, PassResult};

pub enum Step {
    Pass(Arc<dyn GraphPass>),
    FixedPoint { max_iters: usize, steps: Vec<Step> },
}

pub struct PipelineBuilder {
    steps: Vec<Step>,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self { steps: Vec::new() }
    }

    pub fn pass(&mut self, pass: Arc<dyn GraphPass>) {
        self.steps.push(Step::Pass(pass));
    }

    /// Repeats the steps added by `build` until none of them changes the
    /// graph, at most `max_iters` times.
    pub fn fixed_point<F>(&mut self, max_iters: usize, build: F)
    where
        F: FnOnce(&mut PipelineBuilder),
    {
        let mut inner = PipelineBuilder::new();
        build(&mut inner);
        self.steps.push(Step::FixedPoint {
            max_iters: max_iters.max(1),
            steps: inner.steps,
        });
    }

    pub fn finish(self) -> Pipeline {
        Pipeline { steps: self.steps }
    }
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Ordered list of passes applied to a graph before execution.
pub struct Pipeline {
    steps: Vec<Step>,
}

impl Pipeline {
    pub fn run(&self, graph: &mut Graph, cx: &mut OptimizeContext) -> PassResult {
        let log_stats = cx.config().log_pass_stats;
        let mut totals = PassResult::default();
        run_steps(&self.steps, graph, cx, &mut totals, log_stats);
        tracing::debug!(
            graph = %graph.name,
            changed = totals.changed,
            rewrites = totals.rewrites_applied,
            erased = totals.erased_layers,
            layers = graph.layers.len(),
            "optimizer finished"
        );
        totals
    }

    /// Names of the passes in execution order, fixed-point groups flattened.
    pub fn pass_names(&self) -> Vec<&'static str> {
        fn collect(steps: &[Step], names: &mut Vec<&'static str>) {
            for step in steps {
                match step {
                    Step::Pass(pass) => names.push(pass.name()),
                    Step::FixedPoint { steps, .. } => collect(steps, names),
                }
            }
        }
        let mut names = Vec::new();
        collect(&self.steps, &mut names);
        names
    }
}

/// Builds the standard pipeline for `cx`'s configuration.
pub fn default_pipeline(cx: &OptimizeContext) -> Pipeline {
    let config = cx.config();
    let mut builder = PipelineBuilder::new();

    builder.fixed_point(config.pre_max_iters, |p| {
        p.pass(Arc::new(ConstantFoldingPass));
        p.pass(Arc::new(NoOpRemovalPass));
        p.pass(Arc::new(DeadCodeEliminationPass));
    });

    builder.pass(Arc::new(TransposeChainPass));

    builder.fixed_point(config.post_max_iters, |p| {
        p.pass(Arc::new(LinearFusionPass::new()));
        p.pass(Arc::new(ActivationFusionPass));
        p.pass(Arc::new(DuplicateLayerRemovalPass));
        p.pass(Arc::new(DeadCodeEliminationPass));
    });

    builder.pass(Arc::new(PruneOutputsPass));

    if config.round_denormals {
        builder.pass(Arc::new(RoundDenormalsPass));
    }

    builder.finish()
}

fn run_steps(
    steps: &[Step],
    graph: &mut Graph,
    cx: &mut OptimizeContext,
    totals: &mut PassResult,
    log_stats: bool,
) -> bool {
    let mut changed_any = false;
    for step in steps {
        match step {
            Step::Pass(pass) => {
                let stats = pass.run(graph, cx);
                changed_any |= stats.changed;
                *totals = totals.merge(stats);
                if log_stats {
                    tracing::debug!(
                        pass = pass.name(),
                        changed = stats.changed,
                        iterations = stats.iterations,
                        rewrites = stats.rewrites_applied,
                        erased = stats.erased_layers,
                        layers = graph.layers.len(),
                        "optimizer pass"
                    );
                }
            }
            Step::FixedPoint { max_iters, steps } => {
                let mut iter = 0usize;
                loop {
                    if iter >= *max_iters {
                        break;
                    }
                    iter += 1;
                    let mut local = PassResult::default();
                    let changed = run_steps(steps, graph, cx, &mut local, log_stats);
                    *totals = totals.merge(local);
                    changed_any |= changed;
                    if !changed {
                        break;
                    }
                }
            }
        }
    }
    changed_any
}
