use std::collections::{HashMap, HashSet};

use smallvec::SmallVec;

use crate::error::{EngineError, EngineResult};
use crate::graph::{Graph, LayerId, TensorId};
use crate::tensor::{Buffer, DType, DeviceKind, Shape, Tensor};

use super::buffer_pool::BufferPool;
use super::object_pool::TensorObjectPool;

/// Allocation counters, mostly useful to verify buffer reuse.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct StorageStats {
    /// Buffers served from a pool.
    pub pool_hits: usize,
    /// Buffers that had to be freshly allocated.
    pub fresh_allocations: usize,
    /// Tensors whose buffers went back to a pool.
    pub released: usize,
    /// Buffers moved between memory spaces.
    pub transfers: usize,
}

/// How a live tensor entered the table; decides what disposal does with it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ownership {
    /// Produced during a run; recycled into the pools when it dies.
    Owned,
    /// Graph input handed over by the caller; never recycled.
    Input,
    /// Compile-time constant; lives until [`StorageManager::dispose`].
    Constant,
}

struct Slot {
    tensor: Tensor,
    ownership: Ownership,
}

/// Tensor lifetime bookkeeping and pooled allocation for one execution context.
///
/// Live tensors sit in an arena indexed by [`TensorId`]. Disposing an id clears
/// its slot and moves the buffer and header into the pools, so a disposed id
/// cannot be read again until something stores it anew.
#[derive(Default)]
pub struct StorageManager {
    live: Vec<Option<Slot>>,
    dispose_after: HashMap<LayerId, SmallVec<[TensorId; 4]>>,
    unconnected: Vec<TensorId>,
    not_owned: HashSet<TensorId>,
    constants: HashSet<TensorId>,
    buffer_pools: HashMap<DeviceKind, BufferPool>,
    tensor_pool: TensorObjectPool,
    stats: StorageStats,
}

impl StorageManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Precomputes tensor lifetimes for `graph` and uploads its constants to `device`.
    ///
    /// A forward pass records the last layer reading each intermediate tensor;
    /// graph inputs and constants are not owned by the manager and are left
    /// out. A reverse pass turns that record into per-layer disposal lists.
    /// Layer outputs nothing reads, and graph outputs, are "unconnected": they
    /// outlive the run and are flushed when the next run starts.
    ///
    /// With `take_constants` the constant host data is moved out of `graph`
    /// instead of copied.
    pub fn prepare_storage(
        &mut self,
        graph: &mut Graph,
        device: DeviceKind,
        take_constants: bool,
    ) -> EngineResult<()> {
        self.dispose_after.clear();
        self.unconnected.clear();
        self.not_owned = graph.inputs.iter().map(|input| input.id).collect();
        let constant_ids: HashSet<TensorId> =
            graph.constants.iter().map(|constant| constant.id).collect();

        let mut last_consumer: HashMap<TensorId, LayerId> = HashMap::new();
        for layer in &graph.layers {
            for input in layer.input_ids() {
                if self.not_owned.contains(&input) || constant_ids.contains(&input) {
                    continue;
                }
                last_consumer.insert(input, layer.id);
            }
        }
        for output in &graph.outputs {
            last_consumer.remove(&output.id);
        }

        let mut scheduled: HashSet<TensorId> = HashSet::new();
        for layer in graph.layers.iter().rev() {
            for input in layer.input_ids() {
                if last_consumer.get(&input) == Some(&layer.id) && scheduled.insert(input) {
                    self.dispose_after.entry(layer.id).or_default().push(input);
                }
            }
        }

        let mut unconnected: HashSet<TensorId> = HashSet::new();
        for layer in &graph.layers {
            for output in layer.output_ids() {
                if !last_consumer.contains_key(&output) && unconnected.insert(output) {
                    self.unconnected.push(output);
                }
            }
        }
        for output in &graph.outputs {
            let owned = !self.not_owned.contains(&output.id) && !constant_ids.contains(&output.id);
            if owned && unconnected.insert(output.id) {
                self.unconnected.push(output.id);
            }
        }

        for id in self.constants.drain().collect::<Vec<_>>() {
            self.clear_slot(id);
        }
        for constant in &mut graph.constants {
            let mut tensor = if take_constants {
                constant.take_tensor()?
            } else {
                constant.to_tensor()?
            };
            tensor.pin(device);
            self.constants.insert(constant.id);
            self.put(constant.id, tensor, Ownership::Constant);
        }

        tracing::debug!(
            graph = %graph.name,
            disposal_points = self.dispose_after.len(),
            unconnected = self.unconnected.len(),
            constants = self.constants.len(),
            "prepared storage"
        );
        Ok(())
    }

    /// Tensors scheduled to die right after `layer` runs.
    pub fn disposals_after(&self, layer: LayerId) -> &[TensorId] {
        self.dispose_after
            .get(&layer)
            .map(|ids| ids.as_slice())
            .unwrap_or(&[])
    }

    /// Tensors flushed at the start of every run.
    pub fn unconnected(&self) -> &[TensorId] {
        &self.unconnected
    }

    /// Stores a caller-owned graph input; it is never recycled into the pools.
    pub fn set_input(&mut self, id: TensorId, tensor: Tensor) {
        self.not_owned.insert(id);
        self.put(id, tensor, Ownership::Input);
    }

    /// Hands out a tensor of `shape`/`dtype` in `device`, recycling pooled
    /// buffers and headers when possible. Contents are unspecified.
    pub fn allocate(&mut self, shape: &Shape, dtype: DType, device: DeviceKind) -> Tensor {
        let capacity = shape.num_elements();
        let pooled = if capacity == 0 {
            None
        } else {
            self.buffer_pools
                .get_mut(&device)
                .and_then(|pool| pool.adopt(capacity))
        };
        let buffer = match pooled {
            Some(buffer) => {
                self.stats.pool_hits += 1;
                tracing::trace!(capacity, found = buffer.capacity(), %device, "buffer pool hit");
                buffer
            }
            None => {
                self.stats.fresh_allocations += 1;
                tracing::trace!(capacity, %device, "buffer pool miss");
                Buffer::zeroed(device, capacity)
            }
        };
        let header = self.tensor_pool.adopt(shape, dtype);
        Tensor::from_parts(header, buffer)
    }

    /// Stores a layer output; a previous live tensor under `id` is recycled.
    pub fn store(&mut self, id: TensorId, tensor: Tensor) {
        self.put(id, tensor, Ownership::Owned);
    }

    /// Returns the live tensor for `id`.
    pub fn get(&self, id: TensorId) -> EngineResult<&Tensor> {
        self.live
            .get(id.index())
            .and_then(Option::as_ref)
            .map(|slot| &slot.tensor)
            .ok_or(EngineError::MissingTensor(id))
    }

    pub fn contains(&self, id: TensorId) -> bool {
        self.get(id).is_ok()
    }

    /// Moves the live tensor `id` into `device`.
    pub fn pin(&mut self, id: TensorId, device: DeviceKind) -> EngineResult<()> {
        let slot = self
            .live
            .get_mut(id.index())
            .and_then(Option::as_mut)
            .ok_or(EngineError::MissingTensor(id))?;
        if slot.tensor.pin(device) {
            self.stats.transfers += 1;
            tracing::trace!(tensor = %id, %device, "transferred tensor");
        }
        Ok(())
    }

    /// Removes `id` from the table and transfers ownership to the caller.
    pub fn take(&mut self, id: TensorId) -> EngineResult<Tensor> {
        let slot = self
            .live
            .get_mut(id.index())
            .and_then(Option::take)
            .ok_or(EngineError::MissingTensor(id))?;
        if slot.ownership == Ownership::Constant {
            // Constants stay resident; the caller gets a copy.
            let copy = slot.tensor.duplicate();
            self.live[id.index()] = Some(slot);
            return Ok(copy);
        }
        Ok(slot.tensor)
    }

    /// Recycles every tensor whose last consumer is `layer`.
    pub fn dispose_after_layer(&mut self, layer: LayerId) {
        let Some(ids) = self.dispose_after.get(&layer).cloned() else {
            return;
        };
        for id in ids {
            self.clear_slot(id);
        }
    }

    /// Flushes unconnected tensors left over from a previous run.
    pub fn dispose_on_execute(&mut self) {
        for idx in 0..self.unconnected.len() {
            let id = self.unconnected[idx];
            self.clear_slot(id);
        }
    }

    /// Recycles a tensor that is not stored under any id.
    pub fn release(&mut self, tensor: Tensor) {
        let (header, buffer) = tensor.into_parts();
        self.stats.released += 1;
        self.tensor_pool.release(header);
        self.buffer_pools
            .entry(buffer.device())
            .or_default()
            .release(buffer);
    }

    /// Tears down all pools and live tensors, constants included.
    pub fn dispose(&mut self) {
        self.live.clear();
        self.constants.clear();
        self.not_owned.clear();
        self.dispose_after.clear();
        self.unconnected.clear();
        for pool in self.buffer_pools.values_mut() {
            pool.dispose();
        }
        self.buffer_pools.clear();
        self.tensor_pool.dispose();
    }

    pub fn stats(&self) -> StorageStats {
        self.stats
    }

    /// Free buffers pooled for `device`.
    pub fn pooled_buffers(&self, device: DeviceKind) -> usize {
        self.buffer_pools.get(&device).map_or(0, BufferPool::len)
    }

    /// Number of ids that currently hold a tensor.
    pub fn live_count(&self) -> usize {
        self.live.iter().filter(|slot| slot.is_some()).count()
    }

    fn put(&mut self, id: TensorId, tensor: Tensor, ownership: Ownership) {
        let idx = id.index();
        if self.live.len() <= idx {
            self.live.resize_with(idx + 1, || None);
        }
        if let Some(previous) = self.live[idx].replace(Slot { tensor, ownership }) {
            if previous.ownership == Ownership::Owned {
                self.release(previous.tensor);
            }
        }
    }

    fn clear_slot(&mut self, id: TensorId) {
        let Some(slot) = self.live.get_mut(id.index()).and_then(Option::take) else {
            return;
        };
        match slot.ownership {
            Ownership::Owned => self.release(slot.tensor),
            // Inputs belong to the caller and constants are only torn down with
            // the manager; neither goes back to the pools.
            Ownership::Input | Ownership::Constant => {}
        }
    }
}
