//! Layer-by-layer scheduler.
//!
//! A [`Worker`] owns the optimized graph, its fallback set and the storage
//! manager of one execution context. Layers run strictly in stored order;
//! each one is routed to the CPU backend when the fallback set names it and
//! to the primary backend otherwise.

mod dispatch;

use std::fmt;
use std::sync::Arc;

use crate::backend::registry::create_backend;
use crate::backend::{Backend, BackendType};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::fallback::{CpuFallback, FallbackSet};
use crate::graph::{Graph, LayerId, TensorId};
use crate::optimizer::{default_pipeline, OptimizeContext, PassResult};
use crate::storage::{StorageManager, StorageStats};
use crate::tensor::{DeviceKind, Tensor};

/// Lifecycle of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    /// Storage is prepared; no run has happened yet.
    Prepared,
    /// A run is in progress (or was abandoned mid-way).
    Running,
    Disposed,
}

impl WorkerState {
    fn name(self) -> &'static str {
        match self {
            WorkerState::Idle => "idle",
            WorkerState::Prepared => "prepared",
            WorkerState::Running => "running",
            WorkerState::Disposed => "disposed",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Graph input or output, addressed by name or by declaration index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding<'a> {
    Name(&'a str),
    Index(usize),
}

impl<'a> From<&'a str> for Binding<'a> {
    fn from(name: &'a str) -> Self {
        Binding::Name(name)
    }
}

impl From<usize> for Binding<'_> {
    fn from(index: usize) -> Self {
        Binding::Index(index)
    }
}

impl fmt::Display for Binding<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Binding::Name(name) => f.write_str(name),
            Binding::Index(index) => write!(f, "#{index}"),
        }
    }
}

/// One layer dispatch recorded during the latest run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dispatch {
    pub layer: LayerId,
    pub backend: BackendType,
}

/// Executes one graph against a primary backend with CPU fallback.
pub struct Worker {
    graph: Graph,
    primary: Arc<dyn Backend>,
    cpu: Arc<dyn Backend>,
    fallback: FallbackSet,
    storage: StorageManager,
    state: WorkerState,
    optimization: PassResult,
    dispatched: Vec<Dispatch>,
}

impl Worker {
    /// Validates and optimizes `graph`, computes its fallback set and
    /// prepares storage. `cpu` must implement every operation kind.
    pub fn new(
        mut graph: Graph,
        primary: Arc<dyn Backend>,
        cpu: Arc<dyn Backend>,
        config: EngineConfig,
    ) -> EngineResult<Self> {
        graph.validate()?;

        let mut optimization = PassResult::default();
        if config.optimize {
            let mut cx = OptimizeContext::new(Some(Arc::clone(&cpu)), config.clone());
            optimization = default_pipeline(&cx).run(&mut graph, &mut cx);
            graph.validate()?;
        }

        let fallback = CpuFallback::calculate(&graph, primary.backend_type());
        let mut storage = StorageManager::new();
        storage.prepare_storage(&mut graph, primary.device(), config.take_constant_ownership)?;

        tracing::info!(
            graph = %graph.name,
            backend = %primary.backend_type(),
            layers = graph.layers.len(),
            fallback_layers = fallback.layer_count(),
            "worker ready"
        );

        Ok(Self {
            graph,
            primary,
            cpu,
            fallback,
            storage,
            state: WorkerState::Prepared,
            optimization,
            dispatched: Vec::new(),
        })
    }

    /// Resolves the primary and CPU backends through the backend registry.
    pub fn with_backend_type(
        graph: Graph,
        backend: BackendType,
        config: EngineConfig,
    ) -> EngineResult<Self> {
        let cpu = create_backend(BackendType::Cpu)
            .ok_or_else(|| EngineError::BackendUnavailable(BackendType::Cpu.to_string()))?;
        let primary = if backend.is_cpu() {
            Arc::clone(&cpu)
        } else {
            create_backend(backend)
                .ok_or_else(|| EngineError::BackendUnavailable(backend.to_string()))?
        };
        Self::new(graph, primary, cpu, config)
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// The graph as executed, after optimization.
    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn fallback(&self) -> &FallbackSet {
        &self.fallback
    }

    pub fn backend_type(&self) -> BackendType {
        self.primary.backend_type()
    }

    /// Statistics of the optimizer run performed at construction.
    pub fn optimization(&self) -> PassResult {
        self.optimization
    }

    pub fn storage(&self) -> &StorageManager {
        &self.storage
    }

    pub fn storage_stats(&self) -> StorageStats {
        self.storage.stats()
    }

    /// Layers dispatched by the latest run, in dispatch order.
    pub fn dispatched(&self) -> &[Dispatch] {
        &self.dispatched
    }

    fn ensure_live(&self, action: &'static str) -> EngineResult<()> {
        if self.state == WorkerState::Disposed {
            return Err(EngineError::InvalidState {
                state: self.state.name(),
                action,
            });
        }
        Ok(())
    }

    fn input_index(&self, binding: Binding<'_>) -> EngineResult<usize> {
        let found = match binding {
            Binding::Name(name) => self.graph.inputs.iter().position(|input| input.name == name),
            Binding::Index(index) => (index < self.graph.inputs.len()).then_some(index),
        };
        found.ok_or_else(|| EngineError::UnknownBinding {
            kind: "input",
            name: binding.to_string(),
        })
    }

    fn output_id(&self, binding: Binding<'_>) -> EngineResult<TensorId> {
        let found = match binding {
            Binding::Name(name) => self.graph.output_by_name(name),
            Binding::Index(index) => self.graph.outputs.get(index),
        };
        found
            .map(|output| output.id)
            .ok_or_else(|| EngineError::UnknownBinding {
                kind: "output",
                name: binding.to_string(),
            })
    }

    /// Hands a tensor to the worker as the value of a graph input.
    ///
    /// The tensor's dtype must match the declaration and its shape must be
    /// accepted by the declared symbolic shape.
    pub fn set_input<'a>(&mut self, binding: impl Into<Binding<'a>>, tensor: Tensor) -> EngineResult<()> {
        self.ensure_live("set an input")?;
        let input = &self.graph.inputs[self.input_index(binding.into())?];
        if input.dtype != tensor.dtype() || !input.shape.accepts(tensor.shape()) {
            return Err(EngineError::InputMismatch {
                name: input.name.clone(),
                expected: format!("{:?} {:?}", input.dtype, input.shape.dims()),
                found: format!("{:?} {}", tensor.dtype(), tensor.shape()),
            });
        }
        let id = input.id;
        self.storage.set_input(id, tensor);
        Ok(())
    }

    fn begin_run(&mut self) -> EngineResult<()> {
        self.ensure_live("schedule")?;
        if self.state == WorkerState::Running {
            tracing::debug!(graph = %self.graph.name, "restarting abandoned run");
        }
        if let Some(missing) = self.graph.inputs.iter().find(|input| !self.storage.contains(input.id)) {
            return Err(EngineError::MissingTensor(missing.id));
        }
        self.storage.dispose_on_execute();
        self.dispatched.clear();
        self.state = WorkerState::Running;
        Ok(())
    }

    /// Runs layer `idx`; returns whether it ran on the primary backend.
    fn execute_layer(&mut self, idx: usize) -> EngineResult<bool> {
        let layer = &self.graph.layers[idx];
        let on_cpu = self.fallback.contains_layer(layer.id);
        let backend = if on_cpu { &self.cpu } else { &self.primary };
        let backend_type = backend.backend_type();

        let _span = tracing::debug_span!(
            "layer",
            id = %layer.id,
            op = layer.op.name(),
            backend = %backend_type
        )
        .entered();
        tracing::trace!("dispatching layer");

        self.dispatched.push(Dispatch {
            layer: layer.id,
            backend: backend_type,
        });
        dispatch::run_layer(layer, backend.as_ref(), &mut self.storage)?;
        Ok(!on_cpu)
    }

    fn finish_run(&mut self) {
        self.primary.flush();
        self.state = WorkerState::Idle;
        tracing::debug!(
            graph = %self.graph.name,
            layers = self.dispatched.len(),
            live = self.storage.live_count(),
            "run finished"
        );
    }

    /// Runs every layer without yielding.
    pub fn schedule(&mut self) -> EngineResult<()> {
        self.begin_run()?;
        for idx in 0..self.graph.layers.len() {
            self.execute_layer(idx)?;
        }
        self.finish_run();
        Ok(())
    }

    /// Starts a cooperative run that yields after every layer executed on the
    /// primary backend. Layers routed to the CPU run without yielding.
    pub fn schedule_iterable(&mut self) -> EngineResult<Execution<'_>> {
        self.begin_run()?;
        Ok(Execution {
            worker: self,
            cursor: 0,
            finished: false,
        })
    }

    /// Reads an output of the latest run, downloading it to host memory.
    ///
    /// The reference stays valid until the next run or [`Worker::dispose`].
    pub fn peek_output<'a>(&mut self, binding: impl Into<Binding<'a>>) -> EngineResult<&Tensor> {
        self.ensure_live("read an output")?;
        let id = self.output_id(binding.into())?;
        self.storage.pin(id, DeviceKind::Cpu)?;
        self.storage.get(id)
    }

    /// Moves an output of the latest run out of the worker.
    ///
    /// Outputs that alias a graph input or a constant are copied instead, as
    /// are outputs whose tensor backs more than one named output (the
    /// optimizer merges identical producers).
    pub fn take_output_ownership<'a>(
        &mut self,
        binding: impl Into<Binding<'a>>,
    ) -> EngineResult<Tensor> {
        self.ensure_live("take an output")?;
        let id = self.output_id(binding.into())?;
        self.storage.pin(id, DeviceKind::Cpu)?;
        let shared = self.graph.outputs.iter().filter(|output| output.id == id).count() > 1;
        if shared || self.graph.is_input(id) {
            return Ok(self.storage.get(id)?.duplicate());
        }
        self.storage.take(id)
    }

    /// Releases all storage, constants included. The worker is unusable afterwards.
    pub fn dispose(&mut self) {
        if self.state == WorkerState::Disposed {
            return;
        }
        self.storage.dispose();
        self.state = WorkerState::Disposed;
        tracing::debug!(graph = %self.graph.name, "worker disposed");
    }
}

/// Resumable cursor over a cooperative run.
///
/// Each [`Execution::step`] executes layers up to and including the next
/// primary-backend layer, flushes the backend and returns that layer's id.
/// `Ok(None)` marks the end of the run. Dropping the cursor early abandons the
/// run; the next `schedule*` call starts over.
pub struct Execution<'w> {
    worker: &'w mut Worker,
    cursor: usize,
    finished: bool,
}

impl Execution<'_> {
    pub fn step(&mut self) -> EngineResult<Option<LayerId>> {
        if self.finished {
            return Ok(None);
        }
        while self.cursor < self.worker.graph.layers.len() {
            let idx = self.cursor;
            self.cursor += 1;
            let on_primary = match self.worker.execute_layer(idx) {
                Ok(on_primary) => on_primary,
                Err(err) => {
                    self.finished = true;
                    return Err(err);
                }
            };
            if on_primary {
                self.worker.primary.flush();
                return Ok(Some(self.worker.graph.layers[idx].id));
            }
        }
        self.finished = true;
        self.worker.finish_run();
        Ok(None)
    }

    /// Number of layers executed so far.
    pub fn position(&self) -> usize {
        self.cursor
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Runs the remaining layers, still flushing at every yield point.
    pub fn run_to_end(mut self) -> EngineResult<()> {
        while self.step()?.is_some() {}
        Ok(())
    }
}

impl Iterator for Execution<'_> {
    type Item = EngineResult<LayerId>;

    fn next(&mut self) -> Option<Self::Item> {
        self.step().transpose()
    }
}

impl Drop for Execution<'_> {
    fn drop(&mut self) {
        if !self.finished {
            tracing::debug!(position = self.cursor, "cooperative run abandoned");
        }
    }
}
