mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::{assert_close, cpu, random_vec, run_on_cpu, seeded_rng, tensor, GraphBuilder};
use layerwise::graph::{ConstantData, FusedActivation};
use layerwise::optimizer::{default_pipeline, PipelineBuilder};
use layerwise::passes::{
    ActivationFusionPass, ConstantFoldingPass, DeadCodeEliminationPass, DuplicateLayerRemovalPass,
    GraphPass, NoOpRemovalPass, OptimizeContext, PassResult, PruneOutputsPass, RoundDenormalsPass,
    TransposeChainPass,
};
use layerwise::tensor::{Dimension, SymbolicShape};
use layerwise::{DType, EngineConfig, Graph, OpKind, Operation};

fn with_cpu() -> OptimizeContext {
    OptimizeContext::new(Some(cpu()), EngineConfig::default())
}

fn without_cpu() -> OptimizeContext {
    OptimizeContext::new(None, EngineConfig::default())
}

fn kinds(graph: &Graph) -> Vec<OpKind> {
    graph.layers.iter().map(|layer| layer.kind()).collect()
}

#[test]
fn constant_subgraphs_fold_into_constants() {
    let mut b = GraphBuilder::new("fold");
    let x = b.input("x", &[2]);
    let c1 = b.constant(&[2], vec![1.0, 2.0]);
    let c2 = b.constant(&[2], vec![3.0, 4.0]);
    let sum = b.layer(Operation::Add, &[c1, c2]);
    let scale = b.layer(Operation::ScalarMad { s: 0.5, b: 0.0 }, &[sum]);
    let y = b.layer(Operation::Mul, &[x, scale]);
    b.output("y", y);
    let mut graph = b.finish();

    let stats = ConstantFoldingPass.run(&mut graph, &mut with_cpu());
    assert!(stats.changed);
    assert_eq!(stats.erased_layers, 2);
    assert_eq!(kinds(&graph), vec![OpKind::Mul]);
    let folded = graph.constant(scale).expect("folded constant");
    assert_eq!(folded.as_f32(), Some(&[2.0, 3.0][..]));

    let output = run_on_cpu(&graph, EngineConfig::unoptimized(), &[tensor(&[2], vec![1.0, -1.0])]);
    assert_eq!(output, vec![vec![2.0, -3.0]]);
}

#[test]
fn folding_without_cpu_backend_only_folds_static_probes() {
    let mut b = GraphBuilder::new("probes");
    let x = b.input("x", &[2, 3]);
    let dynamic = b.typed_input(
        "dyn",
        DType::F32,
        SymbolicShape::new(vec![Dimension::Dynamic("n".into())]),
    );
    let c1 = b.constant(&[1], vec![1.0]);
    let c2 = b.constant(&[1], vec![2.0]);
    let shape = b.layer(Operation::Shape { start: 0, end: None }, &[x]);
    let tail = b.layer(Operation::Shape { start: -1, end: None }, &[x]);
    let size = b.layer(Operation::Size, &[x]);
    let dynamic_shape = b.layer(Operation::Shape { start: 0, end: None }, &[dynamic]);
    let sum = b.layer(Operation::Add, &[c1, c2]);
    for (name, id) in [("shape", shape), ("tail", tail), ("size", size), ("dyn", dynamic_shape), ("sum", sum)] {
        b.output(name, id);
    }
    let mut graph = b.finish();

    ConstantFoldingPass.run(&mut graph, &mut without_cpu());
    assert_eq!(kinds(&graph), vec![OpKind::Shape, OpKind::Add]);
    let data = |id| graph.constant(id).map(|constant| constant.data.clone());
    assert_eq!(data(shape), Some(ConstantData::Int(vec![2, 3])));
    assert_eq!(data(tail), Some(ConstantData::Int(vec![3])));
    assert_eq!(data(size), Some(ConstantData::Int(vec![6])));
}

#[test]
fn random_layers_are_never_folded_or_merged() {
    let mut b = GraphBuilder::new("random");
    let like = b.constant(&[4], vec![0.0; 4]);
    let op = Operation::RandomNormalLike {
        mean: 0.0,
        scale: 1.0,
        seed: Some(1),
    };
    let first = b.layer(op.clone(), &[like]);
    let second = b.layer(op, &[like]);
    let sum = b.layer(Operation::Add, &[first, second]);
    b.output("sum", sum);
    let mut graph = b.finish();

    let mut cx = with_cpu();
    ConstantFoldingPass.run(&mut graph, &mut cx);
    DuplicateLayerRemovalPass.run(&mut graph, &mut cx);
    assert_eq!(
        kinds(&graph),
        vec![OpKind::RandomNormalLike, OpKind::RandomNormalLike, OpKind::Add]
    );
}

#[test]
fn noop_layers_are_bypassed() {
    let mut b = GraphBuilder::new("noops");
    let x = b.input("x", &[2, 2]);
    let zero = b.scalar(0.0);
    let one = b.scalar(1.0);
    let vector_zero = b.constant(&[1], vec![0.0]);
    let mut y = b.layer(Operation::Identity, &[x]);
    y = b.layer(Operation::ScalarMad { s: 1.0, b: 0.0 }, &[y]);
    y = b.layer(Operation::Add, &[y, zero]);
    y = b.layer(Operation::Div, &[y, one]);
    y = b.layer(
        Operation::Transpose {
            perm: Some(vec![0, 1]),
        },
        &[y],
    );
    // A rank-1 zero may broadcast a rank-0 operand, so it is kept.
    let kept = b.layer(Operation::Sub, &[y, vector_zero]);
    b.output("y", kept);
    let mut graph = b.finish();

    let stats = NoOpRemovalPass.run(&mut graph, &mut without_cpu());
    assert_eq!(stats.erased_layers, 5);
    assert_eq!(kinds(&graph), vec![OpKind::Sub]);
    assert_eq!(graph.layers[0].input(0), Some(x));
}

#[test]
fn dead_layers_and_their_constants_are_removed() {
    let mut b = GraphBuilder::new("dead");
    let x = b.input("x", &[3]);
    let weight = b.constant(&[3], vec![1.0, 2.0, 3.0]);
    let live = b.layer(Operation::Relu, &[x]);
    let dead = b.layer(Operation::Mul, &[x, weight]);
    b.layer(Operation::Sigmoid, &[dead]);
    b.output("live", live);
    let mut graph = b.finish();

    let stats = DeadCodeEliminationPass.run(&mut graph, &mut without_cpu());
    assert_eq!(stats.erased_layers, 2);
    assert_eq!(kinds(&graph), vec![OpKind::Relu]);
    assert!(graph.constants.is_empty());
}

#[test]
fn transpose_chains_collapse() {
    let mut b = GraphBuilder::new("transposes");
    let x = b.input("x", &[2, 3, 4]);
    let swap = |perm: Vec<usize>| Operation::Transpose { perm: Some(perm) };
    let a = b.layer(swap(vec![1, 2, 0]), &[x]);
    let rotated = b.layer(swap(vec![1, 2, 0]), &[a]);
    b.output("rotated", rotated);
    let m = b.input("m", &[2, 5]);
    let t = b.layer(swap(vec![1, 0]), &[m]);
    let identity = b.layer(swap(vec![1, 0]), &[t]);
    b.output("identity", identity);
    let graph = b.finish();

    let mut optimized = graph.clone();
    let mut cx = without_cpu();
    let stats = TransposeChainPass.run(&mut optimized, &mut cx);
    assert_eq!(stats.rewrites_applied, 2);
    DeadCodeEliminationPass.run(&mut optimized, &mut cx);

    assert_eq!(optimized.layers.len(), 1);
    assert_eq!(
        optimized.layers[0].op,
        Operation::Transpose {
            perm: Some(vec![2, 0, 1])
        }
    );
    assert_eq!(optimized.output_by_name("identity").map(|o| o.id), Some(m));

    let mut rng = seeded_rng(5);
    let inputs = [
        tensor(&[2, 3, 4], random_vec(&mut rng, 24)),
        tensor(&[2, 5], random_vec(&mut rng, 10)),
    ];
    assert_eq!(
        run_on_cpu(&optimized, EngineConfig::unoptimized(), &inputs),
        run_on_cpu(&graph, EngineConfig::unoptimized(), &inputs)
    );
}

#[test]
fn duplicate_layers_are_merged() {
    let mut b = GraphBuilder::new("dup");
    let x = b.input("x", &[3]);
    let r1 = b.layer(Operation::Relu, &[x]);
    let r2 = b.layer(Operation::Relu, &[x]);
    let z = b.layer(Operation::Add, &[r1, r2]);
    b.output("z", z);
    b.output("r2", r2);
    let mut graph = b.finish();

    let stats = DuplicateLayerRemovalPass.run(&mut graph, &mut without_cpu());
    assert_eq!(stats.erased_layers, 1);
    assert_eq!(kinds(&graph), vec![OpKind::Relu, OpKind::Add]);
    assert_eq!(graph.layers[1].inputs, vec![Some(r1), Some(r1)]);
    assert_eq!(graph.output_by_name("r2").map(|o| o.id), Some(r1));
}

#[test]
fn unused_outputs_of_multi_output_layers_are_pruned() {
    let mut b = GraphBuilder::new("topk");
    let x = b.input("x", &[5]);
    let k = b.int_constant(&[1], vec![2]);
    let outputs = b.layer_with(
        Operation::TopK {
            axis: -1,
            largest: true,
            sorted: true,
        },
        vec![Some(x), Some(k)],
    );
    b.output("values", outputs[0]);
    let mut graph = b.finish();

    let stats = PruneOutputsPass.run(&mut graph, &mut without_cpu());
    assert!(stats.changed);
    assert_eq!(graph.layers[0].outputs, vec![Some(outputs[0]), None]);

    let values = run_on_cpu(
        &graph,
        EngineConfig::default(),
        &[tensor(&[5], vec![3.0, 1.0, 4.0, 1.0, 5.0])],
    );
    assert_eq!(values, vec![vec![5.0, 4.0]]);
}

#[test]
fn subnormal_constants_round_to_zero() {
    let mut b = GraphBuilder::new("denormal");
    let x = b.input("x", &[3]);
    let c = b.constant(&[3], vec![1.0e-40, 0.5, -1.0e-39]);
    let y = b.layer(Operation::Mul, &[x, c]);
    b.output("y", y);
    let mut graph = b.finish();

    let stats = RoundDenormalsPass.run(&mut graph, &mut without_cpu());
    assert_eq!(stats.rewrites_applied, 2);
    assert_eq!(graph.constant(c).and_then(|c| c.as_f32()), Some(&[0.0, 0.5, 0.0][..]));
}

#[test]
fn relu_fuses_into_dense() {
    let mut rng = seeded_rng(9);
    let mut b = GraphBuilder::new("dense-relu");
    let x = b.input("x", &[2, 3]);
    let w = b.constant(&[3, 4], random_vec(&mut rng, 12));
    let y = b.layer(Operation::Dense { activation: FusedActivation::None }, &[x, w]);
    let z = b.layer(Operation::Relu, &[y]);
    b.output("z", z);
    let graph = b.finish();

    let mut fused = graph.clone();
    ActivationFusionPass.run(&mut fused, &mut without_cpu());
    assert_eq!(fused.layers.len(), 1);
    assert_eq!(fused.layers[0].op, Operation::Dense { activation: FusedActivation::Relu });
    assert_eq!(fused.layers[0].sole_output(), Some(z));

    let input = [tensor(&[2, 3], random_vec(&mut rng, 6))];
    let expected = run_on_cpu(&graph, EngineConfig::unoptimized(), &input);
    let actual = run_on_cpu(&fused, EngineConfig::unoptimized(), &input);
    assert_close(&actual[0], &expected[0], 1e-6);
}

#[test]
fn default_pipeline_order_follows_configuration() {
    let names = default_pipeline(&without_cpu()).pass_names();
    assert_eq!(
        names,
        vec![
            "constant-fold",
            "noop-removal",
            "dce",
            "transpose-chain",
            "linear-fusion",
            "activation-fusion",
            "duplicate-removal",
            "dce",
            "prune-outputs",
        ]
    );

    let config = EngineConfig {
        round_denormals: true,
        ..EngineConfig::default()
    };
    let cx = OptimizeContext::new(None, config);
    assert_eq!(default_pipeline(&cx).pass_names().last(), Some(&"round-denormals"));
}

#[derive(Default)]
struct AlwaysChanged {
    runs: AtomicUsize,
}

impl GraphPass for AlwaysChanged {
    fn name(&self) -> &'static str {
        "always-changed"
    }

    fn run(&self, _graph: &mut Graph, _cx: &mut OptimizeContext) -> PassResult {
        self.runs.fetch_add(1, Ordering::Relaxed);
        PassResult {
            changed: true,
            iterations: 1,
            ..PassResult::default()
        }
    }
}

#[test]
fn fixed_point_groups_are_bounded() {
    let pass = Arc::new(AlwaysChanged::default());
    let mut builder = PipelineBuilder::new();
    builder.fixed_point(3, |p| p.pass(pass.clone()));
    let pipeline = builder.finish();

    let mut graph = Graph::new("empty");
    let totals = pipeline.run(&mut graph, &mut without_cpu());
    assert_eq!(pass.runs.load(Ordering::Relaxed), 3);
    assert_eq!(totals.iterations, 3);
    assert!(totals.changed);
}

#[test]
fn optimized_graph_matches_unoptimized_results() {
    let mut rng = seeded_rng(21);
    let mut b = GraphBuilder::new("mixed");
    let x = b.input("x", &[3, 4]);
    let c1 = b.constant(&[4], random_vec(&mut rng, 4));
    let c2 = b.constant(&[4], random_vec(&mut rng, 4));
    let offset = b.layer(Operation::Add, &[c1, c2]);
    let shifted = b.layer(Operation::Add, &[x, offset]);
    let one = b.scalar(1.0);
    let same = b.layer(Operation::Mul, &[shifted, one]);
    let w = b.constant(&[4, 5], random_vec(&mut rng, 20));
    let bias = b.constant(&[5], random_vec(&mut rng, 5));
    let dense = b.layer(Operation::Dense { activation: FusedActivation::None }, &[same, w, bias]);
    let scale = b.constant(&[5], random_vec(&mut rng, 5));
    let scaled = b.layer(Operation::Mul, &[dense, scale]);
    let relu = b.layer(Operation::Relu, &[scaled]);
    let t = b.layer(Operation::Transpose { perm: Some(vec![1, 0]) }, &[relu]);
    let back = b.layer(Operation::Transpose { perm: Some(vec![1, 0]) }, &[t]);
    b.output("y", back);
    let graph = b.finish();

    let input = [tensor(&[3, 4], random_vec(&mut rng, 12))];
    let expected = run_on_cpu(&graph, EngineConfig::unoptimized(), &input);

    let worker = common::cpu_worker(graph, EngineConfig::default());
    assert!(worker.optimization().changed);
    // The folded offset stays an Add; Dense absorbs the Mul and the Relu.
    assert_eq!(kinds(worker.graph()), vec![OpKind::Add, OpKind::Dense]);

    let actual = run_on_cpu(worker.graph(), EngineConfig::unoptimized(), &input);
    assert_close(&actual[0], &expected[0], 1e-5);
}
