mod common;

use common::{cpu_worker, tensor, GraphBuilder};
use layerwise::storage::{BufferPool, StorageManager, TensorObjectPool};
use layerwise::tensor::{Buffer, DeviceKind};
use layerwise::{DType, EngineConfig, EngineError, Graph, LayerId, Operation, Shape, TensorId};
use proptest::prelude::*;

proptest! {
    #[test]
    fn adopt_returns_best_fit_from_pool(
        capacities in proptest::collection::vec(1usize..64, 1..24),
        request in 1usize..64,
    ) {
        let mut pool = BufferPool::new();
        for &capacity in &capacities {
            pool.release(Buffer::zeroed(DeviceKind::Cpu, capacity));
        }
        let mut model = capacities.clone();
        model.sort_unstable();
        prop_assert_eq!(pool.free_capacities(), model.as_slice());

        let best = model.iter().copied().find(|&capacity| capacity >= request);
        match (pool.adopt(request), best) {
            (Some(buffer), Some(best)) => {
                prop_assert_eq!(buffer.capacity(), best);
                let idx = model.iter().position(|&capacity| capacity == best).unwrap();
                model.remove(idx);
                prop_assert_eq!(pool.free_capacities(), model.as_slice());
                prop_assert_eq!(pool.len(), capacities.len() - 1);
            }
            (None, None) => prop_assert_eq!(pool.len(), capacities.len()),
            (adopted, best) => prop_assert!(
                false,
                "pool returned {:?}, best fit was {:?}",
                adopted.map(|b| b.capacity()),
                best
            ),
        }
    }

    #[test]
    fn draining_pool_returns_every_buffer_once(capacities in proptest::collection::vec(1usize..16, 0..16)) {
        let mut pool = BufferPool::new();
        for &capacity in &capacities {
            pool.release(Buffer::zeroed(DeviceKind::GpuBuffer, capacity));
        }
        let mut drained = Vec::new();
        while let Some(buffer) = pool.adopt(1) {
            drained.push(buffer.capacity());
        }
        let mut expected = capacities.clone();
        expected.sort_unstable();
        prop_assert_eq!(drained, expected);
        prop_assert!(pool.is_empty());
    }
}

#[test]
fn object_pool_recycles_headers_per_dtype_in_fifo_order() {
    let mut pool = TensorObjectPool::new();
    let first = pool.adopt(&Shape::new([2]), DType::F32);
    let second = pool.adopt(&Shape::new([3, 3]), DType::F32);
    pool.release(first);
    pool.release(second);
    assert_eq!(pool.len(), 2);

    let reused = pool.adopt(&Shape::new([5, 1]), DType::F32);
    assert_eq!(reused.shape().dims(), &[5, 1]);
    assert_eq!(pool.len(), 1);
    // Integer requests never receive float headers.
    let int = pool.adopt(&Shape::new([4]), DType::I32);
    assert_eq!(int.dtype(), DType::I32);
    assert_eq!(pool.len(), 1);

    pool.dispose();
    assert!(pool.is_empty());
}

/// `x -> a = Relu(x) -> b = Relu(a) -> c = Add(a, b)`, plus a dead `d = Relu(b)`.
fn diamond() -> (Graph, [TensorId; 5]) {
    let mut b = GraphBuilder::new("diamond");
    let x = b.input("x", &[4]);
    let a = b.layer(Operation::Relu, &[x]);
    let bb = b.layer(Operation::Relu, &[a]);
    let c = b.layer(Operation::Add, &[a, bb]);
    let d = b.layer(Operation::Relu, &[bb]);
    b.output("c", c);
    (b.finish(), [x, a, bb, c, d])
}

#[test]
fn prepare_storage_schedules_disposal_at_last_consumer() {
    let (mut graph, [x, a, b, c, d]) = diamond();
    let mut storage = StorageManager::new();
    storage
        .prepare_storage(&mut graph, DeviceKind::Cpu, false)
        .expect("prepare");

    assert!(storage.disposals_after(LayerId(0)).is_empty());
    assert!(storage.disposals_after(LayerId(1)).is_empty());
    assert_eq!(storage.disposals_after(LayerId(2)), &[a]);
    assert_eq!(storage.disposals_after(LayerId(3)), &[b]);
    // Graph inputs are never disposed.
    assert!((0..4).all(|id| !storage.disposals_after(LayerId(id)).contains(&x)));

    let mut unconnected = storage.unconnected().to_vec();
    unconnected.sort();
    let mut expected = vec![c, d];
    expected.sort();
    assert_eq!(unconnected, expected);
}

#[test]
fn disposed_tensors_cannot_be_read_again() {
    let (mut graph, [_, a, b, _, _]) = diamond();
    let mut storage = StorageManager::new();
    storage
        .prepare_storage(&mut graph, DeviceKind::Cpu, false)
        .expect("prepare");

    let shape = Shape::new([4]);
    for id in [a, b] {
        let tensor = storage.allocate(&shape, DType::F32, DeviceKind::Cpu);
        storage.store(id, tensor);
    }
    storage.dispose_after_layer(LayerId(2));
    assert!(matches!(storage.get(a), Err(EngineError::MissingTensor(id)) if id == a));
    assert!(storage.get(b).is_ok());
    assert_eq!(storage.pooled_buffers(DeviceKind::Cpu), 1);

    storage.dispose_after_layer(LayerId(3));
    assert!(matches!(storage.get(b), Err(EngineError::MissingTensor(_))));
    assert!(matches!(storage.take(b), Err(EngineError::MissingTensor(_))));

    // Re-storing an id makes it readable again.
    let tensor = storage.allocate(&shape, DType::F32, DeviceKind::Cpu);
    storage.store(a, tensor);
    assert!(storage.get(a).is_ok());
    assert_eq!(storage.stats().pool_hits, 1);
}

#[test]
fn worker_run_leaves_only_inputs_outputs_and_unconnected_tensors() {
    let (graph, [x, a, b, c, d]) = diamond();
    let mut worker = cpu_worker(graph, EngineConfig::unoptimized());
    worker
        .set_input("x", tensor(&[4], vec![-1.0, 0.5, 2.0, -3.0]))
        .expect("input");
    worker.schedule().expect("run");

    let storage = worker.storage();
    assert!(storage.contains(x));
    assert!(!storage.contains(a));
    assert!(!storage.contains(b));
    assert!(storage.contains(c));
    assert!(storage.contains(d));
    assert_eq!(
        worker.peek_output("c").expect("c").to_f32_vec(),
        vec![0.0, 1.0, 4.0, 0.0]
    );
}

#[test]
fn buffers_are_recycled_across_runs() {
    let (graph, _) = diamond();
    let mut worker = cpu_worker(graph, EngineConfig::unoptimized());
    worker
        .set_input(0usize, tensor(&[4], vec![1.0, 2.0, 3.0, 4.0]))
        .expect("input");

    worker.schedule().expect("first run");
    let first = worker.storage_stats();
    // d reuses a's buffer, released after the Add.
    assert_eq!(first.fresh_allocations, 3);
    assert_eq!(first.pool_hits, 1);

    worker.schedule().expect("second run");
    let second = worker.storage_stats();
    assert_eq!(second.fresh_allocations, 3, "no new buffers on a warm run");
    assert_eq!(second.pool_hits, 5);
    assert_eq!(
        worker.peek_output("c").expect("c").to_f32_vec(),
        vec![2.0, 4.0, 6.0, 8.0]
    );
}

#[test]
fn constants_persist_until_dispose() {
    let mut b = GraphBuilder::new("bias");
    let x = b.input("x", &[2]);
    let bias = b.constant(&[2], vec![0.5, -0.5]);
    let y = b.layer(Operation::Add, &[x, bias]);
    b.output("y", y);
    b.output("bias", bias);
    let graph = b.finish();

    let mut worker = cpu_worker(graph, EngineConfig::unoptimized());
    for _ in 0..2 {
        worker.set_input("x", tensor(&[2], vec![1.0, 1.0])).expect("input");
        worker.schedule().expect("run");
        assert_eq!(
            worker.peek_output("y").expect("y").to_f32_vec(),
            vec![1.5, 0.5]
        );
    }

    // Taking a constant output hands out a copy; the constant stays resident.
    let copy = worker.take_output_ownership("bias").expect("bias");
    assert_eq!(copy.to_f32_vec(), vec![0.5, -0.5]);
    assert!(worker.storage().contains(bias));

    worker.dispose();
    assert!(!worker.storage().contains(bias));
}

#[test]
fn take_constant_ownership_moves_host_data() {
    let mut b = GraphBuilder::new("weights");
    let x = b.input("x", &[2]);
    let scale = b.constant(&[2], vec![2.0, 3.0]);
    let y = b.layer(Operation::Mul, &[x, scale]);
    b.output("y", y);
    let mut graph = b.finish();

    let mut storage = StorageManager::new();
    storage
        .prepare_storage(&mut graph, DeviceKind::GpuBuffer, true)
        .expect("prepare");
    assert!(graph.constants[0].data.is_empty());
    let resident = storage.get(scale).expect("constant");
    assert_eq!(resident.device(), DeviceKind::GpuBuffer);
    assert_eq!(resident.as_f32(), &[2.0, 3.0]);
}
