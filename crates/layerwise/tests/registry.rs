mod common;

use common::{tensor, GraphBuilder};
use layerwise::graph::ScalarValue;
use layerwise::tensor::{Dimension, SymbolicShape};
use layerwise::{
    create_backend, has_backend, list_backends, Backend, BackendType, DType, DeviceKind, EngineConfig,
    Operation, Worker,
};
use layerwise_backend_ref_cpu::{register_all, EMULATED_BACKENDS};

#[test]
fn registered_backends_can_be_created() {
    register_all();
    for ty in [BackendType::Cpu].into_iter().chain(EMULATED_BACKENDS) {
        assert!(has_backend(ty), "{ty} is registered");
        assert!(list_backends().contains(&ty));
        let backend = create_backend(ty).expect("registered backend");
        assert_eq!(backend.backend_type(), ty);
        assert_eq!(backend.device(), ty.device());
    }
    assert_eq!(BackendType::GpuPixel.device(), DeviceKind::GpuTexture);
}

#[test]
fn worker_resolves_backends_by_type() {
    register_all();
    let mut b = GraphBuilder::new("registry");
    let x = b.typed_input(
        "x",
        DType::F32,
        SymbolicShape::new(vec![Dimension::Dynamic("n".into())]),
    );
    let relu = b.layer(Operation::Relu, &[x]);
    let size = b.layer(Operation::Shape { start: 0, end: None }, &[relu]);
    let ones = b.layer(
        Operation::ConstantOfShape {
            value: ScalarValue::Float(1.0),
        },
        &[size],
    );
    let sum = b.layer(Operation::Add, &[relu, ones]);
    b.output("sum", sum);
    let graph = b.finish();

    for ty in [BackendType::Cpu].into_iter().chain(EMULATED_BACKENDS) {
        let mut worker =
            Worker::with_backend_type(graph.clone(), ty, EngineConfig::default()).expect("worker");
        assert_eq!(worker.backend_type(), ty);
        assert_eq!(worker.fallback().is_empty(), ty.is_cpu());

        worker
            .set_input("x", tensor(&[3], vec![-2.0, 0.5, 3.0]))
            .expect("input");
        worker.schedule().expect("run");
        assert_eq!(
            worker.take_output_ownership("sum").expect("sum").to_f32_vec(),
            vec![1.0, 1.5, 4.0],
            "{ty}"
        );
    }
}
