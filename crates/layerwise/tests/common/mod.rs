#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use layerwise::backend::{Backend, BackendResult, BackendType};
use layerwise::graph::{Constant, Input, Layer, OpKind, Output};
use layerwise::tensor::SymbolicShape;
use layerwise::{
    DType, EngineConfig, Graph, LayerId, Operation, Shape, Tensor, TensorId, Worker,
};
use layerwise_backend_ref_cpu::{CpuBackend, DeviceEmulator};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

pub fn seeded_rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

pub fn random_vec(rng: &mut StdRng, len: usize) -> Vec<f32> {
    (0..len).map(|_| rng.gen_range(-1.0f32..1.0)).collect()
}

pub fn tensor(dims: &[usize], values: Vec<f32>) -> Tensor {
    Tensor::from_f32(Shape::new(dims), values).expect("tensor data matches shape")
}

pub fn int_tensor(dims: &[usize], values: Vec<i32>) -> Tensor {
    Tensor::from_i32(Shape::new(dims), DType::I32, values).expect("tensor data matches shape")
}

pub fn assert_close(actual: &[f32], expected: &[f32], rel: f32) {
    assert_eq!(actual.len(), expected.len(), "length mismatch");
    for (idx, (&a, &e)) in actual.iter().zip(expected).enumerate() {
        let tolerance = rel * e.abs().max(1.0);
        assert!(
            (a - e).abs() <= tolerance,
            "element {idx}: got {a}, expected {e} (tolerance {tolerance})"
        );
    }
}

/// Incrementally assembles a topologically ordered graph.
pub struct GraphBuilder {
    graph: Graph,
}

impl GraphBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            graph: Graph::new(name),
        }
    }

    pub fn input(&mut self, name: &str, dims: &[usize]) -> TensorId {
        self.typed_input(name, DType::F32, SymbolicShape::fixed(dims))
    }

    pub fn typed_input(&mut self, name: &str, dtype: DType, shape: SymbolicShape) -> TensorId {
        let id = self.graph.next_tensor_id();
        self.graph.inputs.push(Input {
            id,
            name: name.to_string(),
            dtype,
            shape,
        });
        id
    }

    pub fn constant(&mut self, dims: &[usize], values: Vec<f32>) -> TensorId {
        self.graph.add_constant_f32(Shape::new(dims), values)
    }

    pub fn int_constant(&mut self, dims: &[usize], values: Vec<i32>) -> TensorId {
        let id = self.graph.next_tensor_id();
        self.graph
            .constants
            .push(Constant::from_i32(id, Shape::new(dims), DType::I32, values));
        id
    }

    pub fn scalar(&mut self, value: f32) -> TensorId {
        self.graph.add_constant_f32(Shape::scalar(), vec![value])
    }

    /// Appends a single-output layer.
    pub fn layer(&mut self, op: Operation, inputs: &[TensorId]) -> TensorId {
        let inputs = inputs.iter().copied().map(Some).collect();
        self.layer_with(op, inputs)[0]
    }

    /// Appends a layer with optional inputs; returns all of its outputs.
    pub fn layer_with(&mut self, op: Operation, inputs: Vec<Option<TensorId>>) -> Vec<TensorId> {
        let first = self.graph.next_tensor_id().0;
        let outputs: Vec<TensorId> = (0..op.kind().output_count() as u32)
            .map(|offset| TensorId(first + offset))
            .collect();
        let id = self.graph.next_layer_id();
        self.graph.layers.push(Layer::new(id, op, inputs, outputs.clone()));
        outputs
    }

    pub fn output(&mut self, name: &str, id: TensorId) {
        self.graph.outputs.push(Output {
            name: name.to_string(),
            id,
        });
    }

    pub fn finish(self) -> Graph {
        self.graph
    }
}

pub fn cpu() -> Arc<dyn Backend> {
    Arc::new(CpuBackend::new())
}

pub fn cpu_worker(graph: Graph, config: EngineConfig) -> Worker {
    Worker::new(graph, cpu(), cpu(), config).expect("worker construction")
}

/// Runs `graph` on the CPU and returns every graph output in declaration order.
pub fn run_on_cpu(graph: &Graph, config: EngineConfig, inputs: &[Tensor]) -> Vec<Vec<f32>> {
    let mut worker = cpu_worker(graph.clone(), config);
    for (index, input) in inputs.iter().enumerate() {
        worker.set_input(index, input.duplicate()).expect("input accepted");
    }
    worker.schedule().expect("run succeeds");
    (0..graph.outputs.len())
        .map(|index| worker.peek_output(index).expect("output").to_f32_vec())
        .collect()
}

/// Observable backend event, in the order the backend saw them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Execute(OpKind),
    Flush,
}

/// Wraps a backend and records every execution and flush.
pub struct Recording {
    inner: Arc<dyn Backend>,
    events: Mutex<Vec<Event>>,
}

impl Recording {
    pub fn new(inner: Arc<dyn Backend>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            events: Mutex::new(Vec::new()),
        })
    }

    pub fn gpu() -> Arc<Self> {
        Self::new(Arc::new(DeviceEmulator::new(BackendType::GpuCompute)))
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().expect("events lock").clone()
    }

    pub fn executed(&self) -> Vec<OpKind> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Execute(kind) => Some(kind),
                Event::Flush => None,
            })
            .collect()
    }

    pub fn flushes(&self) -> usize {
        self.events().iter().filter(|event| **event == Event::Flush).count()
    }

    pub fn clear(&self) {
        self.events.lock().expect("events lock").clear();
    }
}

impl Backend for Recording {
    fn backend_type(&self) -> BackendType {
        self.inner.backend_type()
    }

    fn supports(&self, kind: OpKind) -> bool {
        self.inner.supports(kind)
    }

    fn execute(
        &self,
        op: &Operation,
        inputs: &[Option<&Tensor>],
        outputs: &mut [Tensor],
    ) -> BackendResult<()> {
        self.events
            .lock()
            .expect("events lock")
            .push(Event::Execute(op.kind()));
        self.inner.execute(op, inputs, outputs)
    }

    fn flush(&self) {
        self.events.lock().expect("events lock").push(Event::Flush);
        self.inner.flush();
    }
}

pub fn layer_ids(graph: &Graph) -> Vec<LayerId> {
    graph.layers.iter().map(|layer| layer.id).collect()
}
