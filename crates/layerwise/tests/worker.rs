mod common;

use std::sync::Arc;

use common::{cpu, int_tensor, layer_ids, tensor, Event, GraphBuilder, Recording};
use layerwise::backend::Backend;
use layerwise::graph::{Constant, Layer, Output, ScalarValue};
use layerwise::tensor::{Dimension, SymbolicShape};
use layerwise::{
    BackendType, DType, EngineConfig, EngineError, EngineResult, Graph, LayerId, OpKind,
    Operation, Shape, StructuralError, TensorId, Worker, WorkerState,
};
use layerwise_backend_ref_cpu::DeviceEmulator;

fn dynamic_rows(cols: usize) -> SymbolicShape {
    SymbolicShape::new(vec![Dimension::Dynamic("n".into()), Dimension::Static(cols)])
}

/// Relu -> Sigmoid -> Add(relu, sigmoid), all on one input.
fn chain() -> Graph {
    let mut b = GraphBuilder::new("chain");
    let x = b.typed_input("x", DType::F32, dynamic_rows(2));
    let relu = b.layer(Operation::Relu, &[x]);
    let sigmoid = b.layer(Operation::Sigmoid, &[relu]);
    let sum = b.layer(Operation::Add, &[relu, sigmoid]);
    b.output("sum", sum);
    b.output("echo", x);
    b.finish()
}

/// `Relu(x)` next to `ConstantOfShape(Shape(x))`; the Shape layer falls back
/// to the CPU on accelerators.
fn mixed() -> Graph {
    let mut b = GraphBuilder::new("mixed");
    let x = b.typed_input("x", DType::F32, dynamic_rows(2));
    let relu = b.layer(Operation::Relu, &[x]);
    let shape = b.layer(Operation::Shape { start: 0, end: None }, &[x]);
    let filled = b.layer(
        Operation::ConstantOfShape {
            value: ScalarValue::Float(2.0),
        },
        &[shape],
    );
    b.output("relu", relu);
    b.output("filled", filled);
    b.finish()
}

fn gpu_worker(graph: Graph, gpu: &Arc<Recording>) -> Worker {
    Worker::new(
        graph,
        Arc::clone(gpu) as Arc<dyn Backend>,
        cpu(),
        EngineConfig::unoptimized(),
    )
    .expect("worker")
}

fn sample() -> layerwise::Tensor {
    tensor(&[2, 2], vec![-1.0, 0.0, 2.0, -3.0])
}

#[test]
fn layers_dispatch_in_stored_order() {
    let graph = chain();
    let expected_ids = layer_ids(&graph);
    let primary = Recording::new(cpu());
    let mut worker = Worker::new(
        graph,
        Arc::clone(&primary) as Arc<dyn Backend>,
        cpu(),
        EngineConfig::unoptimized(),
    )
    .expect("worker");
    assert_eq!(worker.state(), WorkerState::Prepared);

    worker.set_input("x", sample()).expect("input");
    worker.schedule().expect("run");

    assert_eq!(worker.state(), WorkerState::Idle);
    assert_eq!(
        primary.executed(),
        vec![OpKind::Relu, OpKind::Sigmoid, OpKind::Add]
    );
    let dispatched: Vec<LayerId> = worker.dispatched().iter().map(|d| d.layer).collect();
    assert_eq!(dispatched, expected_ids);
    assert_eq!(primary.flushes(), 1);

    let sum = worker.peek_output("sum").expect("sum").to_f32_vec();
    let expected: Vec<f32> = [0.0f32, 0.0, 2.0, 0.0]
        .iter()
        .map(|&r| r + 1.0 / (1.0 + (-r).exp()))
        .collect();
    common::assert_close(&sum, &expected, 1e-6);
}

#[test]
fn cooperative_run_yields_after_primary_layers() {
    let gpu = Recording::gpu();
    let mut worker = gpu_worker(mixed(), &gpu);
    worker.set_input("x", sample()).expect("input");

    {
        let mut run = worker.schedule_iterable().expect("run");
        assert_eq!(run.step().expect("step"), Some(LayerId(0)));
        assert_eq!(gpu.events(), vec![Event::Execute(OpKind::Relu), Event::Flush]);

        // The CPU Shape layer runs without yielding, up to the next primary layer.
        assert_eq!(run.step().expect("step"), Some(LayerId(2)));
        assert_eq!(run.position(), 3);
        assert_eq!(run.step().expect("step"), None);
        assert!(run.is_finished());
        assert_eq!(run.step().expect("step"), None);
    }

    assert_eq!(
        gpu.events(),
        vec![
            Event::Execute(OpKind::Relu),
            Event::Flush,
            Event::Execute(OpKind::ConstantOfShape),
            Event::Flush,
            Event::Flush,
        ]
    );
    assert_eq!(worker.state(), WorkerState::Idle);
    assert_eq!(
        worker.peek_output("filled").expect("filled").to_f32_vec(),
        vec![2.0; 4]
    );
}

#[test]
fn cooperative_run_works_as_an_iterator() {
    let gpu = Recording::gpu();
    let mut worker = gpu_worker(mixed(), &gpu);
    worker.set_input(0usize, sample()).expect("input");

    let yielded = worker
        .schedule_iterable()
        .expect("run")
        .collect::<EngineResult<Vec<LayerId>>>()
        .expect("steps");
    assert_eq!(yielded, vec![LayerId(0), LayerId(2)]);
    assert_eq!(
        worker.peek_output(0usize).expect("relu").to_f32_vec(),
        vec![0.0, 0.0, 2.0, 0.0]
    );
}

#[test]
fn cooperative_run_can_be_driven_to_completion() {
    let gpu = Recording::gpu();
    let mut worker = gpu_worker(mixed(), &gpu);
    let declared = worker.graph().input_by_name("x").expect("declared input");
    assert_eq!(declared.dtype, DType::F32);
    worker.set_input("x", sample()).expect("input");

    worker.schedule_iterable().expect("run").run_to_end().expect("steps");
    assert_eq!(worker.state(), WorkerState::Idle);
    assert_eq!(worker.dispatched().len(), 3);
}

#[test]
fn abandoned_run_restarts_from_the_first_layer() {
    let gpu = Recording::gpu();
    let mut worker = gpu_worker(mixed(), &gpu);
    worker.set_input("x", sample()).expect("input");

    {
        let mut run = worker.schedule_iterable().expect("run");
        assert_eq!(run.step().expect("step"), Some(LayerId(0)));
    }
    assert_eq!(worker.state(), WorkerState::Running);

    gpu.clear();
    worker.schedule().expect("restart");
    assert_eq!(worker.state(), WorkerState::Idle);
    assert_eq!(worker.dispatched().len(), 3);
    assert_eq!(
        gpu.executed(),
        vec![OpKind::Relu, OpKind::ConstantOfShape]
    );
    assert_eq!(
        worker.peek_output("relu").expect("relu").to_f32_vec(),
        vec![0.0, 0.0, 2.0, 0.0]
    );
}

#[test]
fn cooperative_run_stops_at_the_first_error() {
    let primary = Arc::new(DeviceEmulator::new(BackendType::GpuCompute).without([OpKind::Sigmoid]));
    let mut worker = Worker::new(chain(), primary, cpu(), EngineConfig::unoptimized()).expect("worker");
    worker.set_input("x", sample()).expect("input");

    let mut run = worker.schedule_iterable().expect("run");
    assert_eq!(run.step().expect("relu"), Some(LayerId(0)));
    assert!(run.step().is_err());
    assert!(run.is_finished());
    assert_eq!(run.step().expect("finished"), None);
}

#[test]
fn running_requires_every_input() {
    let mut worker = common::cpu_worker(chain(), EngineConfig::unoptimized());
    match worker.schedule() {
        Err(EngineError::MissingTensor(id)) => assert_eq!(id, TensorId(0)),
        other => panic!("expected a missing input, got {other:?}"),
    }
}

#[test]
fn inputs_are_checked_against_their_declaration() {
    let mut worker = common::cpu_worker(chain(), EngineConfig::unoptimized());

    // Any row count is accepted for the dynamic axis.
    worker.set_input("x", tensor(&[5, 2], vec![0.0; 10])).expect("five rows");
    worker.set_input("x", tensor(&[1, 2], vec![0.0; 2])).expect("one row");

    let wrong_cols = worker.set_input("x", tensor(&[2, 3], vec![0.0; 6]));
    assert!(matches!(wrong_cols, Err(EngineError::InputMismatch { ref name, .. }) if name == "x"));
    let wrong_rank = worker.set_input("x", tensor(&[4], vec![0.0; 4]));
    assert!(matches!(wrong_rank, Err(EngineError::InputMismatch { .. })));
    let wrong_dtype = worker.set_input("x", int_tensor(&[1, 2], vec![1, 2]));
    assert!(matches!(wrong_dtype, Err(EngineError::InputMismatch { .. })));

    let unknown = worker.set_input("y", sample());
    assert!(matches!(unknown, Err(EngineError::UnknownBinding { kind: "input", .. })));
    let out_of_range = worker.set_input(3usize, sample());
    assert!(matches!(out_of_range, Err(EngineError::UnknownBinding { kind: "input", .. })));
    assert!(matches!(
        worker.peek_output("missing"),
        Err(EngineError::UnknownBinding { kind: "output", .. })
    ));
}

#[test]
fn unsupported_kernels_are_reported_without_fallback() {
    let primary = Arc::new(DeviceEmulator::new(BackendType::GpuCompute).without([OpKind::Sigmoid]));
    let mut worker = Worker::new(chain(), primary, cpu(), EngineConfig::unoptimized()).expect("worker");
    assert!(worker.fallback().is_empty());
    worker.set_input("x", sample()).expect("input");

    match worker.schedule() {
        Err(EngineError::UnsupportedOperation { op, backend, .. }) => {
            assert_eq!(op, OpKind::Sigmoid.name());
            assert_eq!(backend, BackendType::GpuCompute.to_string());
        }
        other => panic!("expected an unsupported operation, got {other:?}"),
    }
}

#[test]
fn kernel_failures_surface_as_kernel_errors() {
    let mut b = GraphBuilder::new("gather");
    let x = b.input("x", &[3]);
    let indices = b.int_constant(&[2], vec![0, 7]);
    let picked = b.layer(Operation::Gather { axis: 0 }, &[x, indices]);
    b.output("picked", picked);
    let mut worker = common::cpu_worker(b.finish(), EngineConfig::unoptimized());
    worker.set_input("x", tensor(&[3], vec![1.0, 2.0, 3.0])).expect("input");

    match worker.schedule() {
        Err(EngineError::Kernel { op, .. }) => assert_eq!(op, OpKind::Gather.name()),
        other => panic!("expected a kernel failure, got {other:?}"),
    }
}

#[test]
fn outputs_can_be_taken_once_while_input_aliases_are_copied() {
    let mut worker = common::cpu_worker(chain(), EngineConfig::unoptimized());
    worker.set_input("x", sample()).expect("input");
    worker.schedule().expect("run");

    let sum = worker.take_output_ownership("sum").expect("sum");
    assert_eq!(sum.shape().dims(), &[2, 2]);
    assert!(matches!(
        worker.take_output_ownership("sum"),
        Err(EngineError::MissingTensor(_))
    ));
    assert!(worker.peek_output("sum").is_err());

    let first = worker.take_output_ownership("echo").expect("echo");
    let second = worker.take_output_ownership("echo").expect("echo again");
    assert_eq!(first.to_f32_vec(), sample().to_f32_vec());
    assert_eq!(second.to_f32_vec(), sample().to_f32_vec());

    // The next run produces the output again.
    worker.schedule().expect("second run");
    assert_eq!(
        worker.take_output_ownership("sum").expect("sum").to_f32_vec(),
        sum.to_f32_vec()
    );
}

#[test]
fn merged_outputs_can_each_be_taken() {
    let mut b = GraphBuilder::new("twins");
    let x = b.input("x", &[2]);
    let a = b.layer(Operation::Relu, &[x]);
    let twin = b.layer(Operation::Relu, &[x]);
    let forwarded = b.layer(Operation::Identity, &[a]);
    b.output("a", a);
    b.output("b", twin);
    b.output("c", forwarded);

    let mut worker = common::cpu_worker(b.finish(), EngineConfig::default());
    assert_eq!(worker.graph().layers.len(), 1);
    worker.set_input("x", tensor(&[2], vec![1.0, -1.0])).expect("input");
    worker.schedule().expect("run");

    for name in ["a", "b", "c"] {
        let taken = worker.take_output_ownership(name).expect(name);
        assert_eq!(taken.to_f32_vec(), vec![1.0, 0.0], "{name}");
    }
    assert_eq!(worker.peek_output("b").expect("b").to_f32_vec(), vec![1.0, 0.0]);
}

#[test]
fn disposed_worker_rejects_further_use() {
    let mut worker = common::cpu_worker(chain(), EngineConfig::unoptimized());
    worker.set_input("x", sample()).expect("input");
    worker.schedule().expect("run");
    worker.dispose();
    worker.dispose();
    assert_eq!(worker.state(), WorkerState::Disposed);

    assert!(matches!(
        worker.set_input("x", sample()),
        Err(EngineError::InvalidState { state: "disposed", .. })
    ));
    assert!(matches!(worker.schedule(), Err(EngineError::InvalidState { .. })));
    assert!(matches!(worker.schedule_iterable(), Err(EngineError::InvalidState { .. })));
    assert!(matches!(worker.peek_output("sum"), Err(EngineError::InvalidState { .. })));
    assert!(matches!(
        worker.take_output_ownership("sum"),
        Err(EngineError::InvalidState { .. })
    ));
}

const MLP_JSON: &str = r#"{
  "name": "mlp",
  "inputs": [{"id": 0, "name": "x", "dtype": "f32", "shape": ["batch", 2]}],
  "outputs": [{"name": "y", "id": 4}],
  "constants": [
    {"id": 1, "shape": [2, 2], "dtype": "f32", "data": {"float": [1.0, -1.0, 0.5, 2.0]}},
    {"id": 2, "shape": [2], "dtype": "f32", "data": {"float": [0.5, -4.0]}}
  ],
  "layers": [
    {"id": 0, "op": "dense", "inputs": [0, 1, 2], "outputs": [3]},
    {"id": 1, "op": "relu", "inputs": [3], "outputs": [4]}
  ]
}"#;

#[test]
fn json_graph_runs_with_and_without_optimization() {
    let graph = Graph::from_json(MLP_JSON).expect("valid graph json");
    assert_eq!(graph.layers.len(), 2);
    assert_eq!(
        graph.inputs[0].shape,
        SymbolicShape::new(vec![Dimension::Dynamic("batch".into()), Dimension::Static(2)])
    );
    let reparsed = Graph::from_json(&graph.to_json().expect("serialize")).expect("reparse");
    assert_eq!(reparsed, graph);

    for config in [EngineConfig::unoptimized(), EngineConfig::default()] {
        let mut worker = common::cpu_worker(graph.clone(), config);
        worker
            .set_input("x", tensor(&[2, 2], vec![1.0, 2.0, -1.0, 0.0]))
            .expect("input");
        worker.schedule().expect("run");
        assert_eq!(
            worker.peek_output("y").expect("y").to_f32_vec(),
            vec![2.5, 0.0, 0.0, 0.0]
        );
    }

    let optimized = common::cpu_worker(graph, EngineConfig::default());
    assert_eq!(optimized.graph().layers.len(), 1);
}

fn layer(id: u32, op: Operation, inputs: &[u32], outputs: &[u32]) -> Layer {
    Layer::new(
        LayerId(id),
        op,
        inputs.iter().map(|&i| Some(TensorId(i))).collect(),
        outputs.iter().map(|&o| TensorId(o)).collect(),
    )
}

fn two_layer_graph() -> Graph {
    let mut b = GraphBuilder::new("structure");
    let x = b.input("x", &[2]);
    let a = b.layer(Operation::Relu, &[x]);
    let c = b.layer(Operation::Relu, &[a]);
    b.output("c", c);
    b.finish()
}

#[test]
fn structural_errors_are_detected() {
    assert_eq!(two_layer_graph().validate(), Ok(()));

    let mut unsorted = two_layer_graph();
    unsorted.layers.swap(0, 1);
    assert!(matches!(
        unsorted.validate(),
        Err(StructuralError::UseBeforeDefinition { .. })
    ));

    let mut dangling = two_layer_graph();
    dangling.layers.push(layer(2, Operation::Relu, &[40], &[41]));
    assert_eq!(
        dangling.validate(),
        Err(StructuralError::MissingProducer {
            layer: LayerId(2),
            tensor: TensorId(40)
        })
    );

    let mut redefined = two_layer_graph();
    redefined.layers.push(layer(2, Operation::Relu, &[0], &[1]));
    assert_eq!(redefined.validate(), Err(StructuralError::DuplicateTensor(TensorId(1))));

    let mut same_layer_id = two_layer_graph();
    same_layer_id.layers.push(layer(1, Operation::Relu, &[0], &[9]));
    assert_eq!(same_layer_id.validate(), Err(StructuralError::DuplicateLayerId(LayerId(1))));

    let mut arity = two_layer_graph();
    arity.layers.push(layer(2, Operation::Relu, &[0, 1], &[9]));
    assert!(matches!(arity.validate(), Err(StructuralError::Arity { found: 2, .. })));

    let mut unknown_output = two_layer_graph();
    unknown_output.outputs.push(Output {
        name: "ghost".into(),
        id: TensorId(77),
    });
    assert!(matches!(
        unknown_output.validate(),
        Err(StructuralError::UnknownOutput { .. })
    ));

    let mut duplicate_name = two_layer_graph();
    duplicate_name.outputs.push(Output {
        name: "c".into(),
        id: TensorId(1),
    });
    assert_eq!(
        duplicate_name.validate(),
        Err(StructuralError::DuplicateOutputName("c".into()))
    );

    let mut malformed = two_layer_graph();
    malformed.constants.push(Constant {
        id: TensorId(50),
        shape: Shape::new([3]),
        dtype: DType::F32,
        data: layerwise::graph::ConstantData::Float(vec![1.0]),
    });
    assert_eq!(malformed.validate(), Err(StructuralError::MalformedConstant(TensorId(50))));

    let err = Worker::new(unsorted, cpu(), cpu(), EngineConfig::default())
        .err()
        .expect("construction fails");
    assert!(matches!(err, EngineError::Structural(StructuralError::UseBeforeDefinition { .. })));
}
