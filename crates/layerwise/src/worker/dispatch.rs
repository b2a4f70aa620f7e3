//! Execution of a single layer against a backend.

use smallvec::SmallVec;

use crate::backend::Backend;
use crate::error::{EngineError, EngineResult};
use crate::fallback::InputUse;
use crate::graph::Layer;
use crate::ops::infer_outputs;
use crate::storage::StorageManager;
use crate::tensor::{DeviceKind, Tensor};

/// Present inputs of `layer` borrowed from storage, `None` for absent ones.
fn gather_inputs<'s>(
    layer: &Layer,
    storage: &'s StorageManager,
) -> EngineResult<SmallVec<[Option<&'s Tensor>; 4]>> {
    layer
        .inputs
        .iter()
        .map(|input| input.map(|id| storage.get(id)).transpose())
        .collect()
}

/// Moves each input into the memory space it is read from.
fn pin_inputs(layer: &Layer, device: DeviceKind, storage: &mut StorageManager) -> EngineResult<()> {
    for (position, input) in layer.inputs.iter().enumerate() {
        let Some(id) = *input else {
            continue;
        };
        match InputUse::of(layer.kind(), position) {
            InputUse::HostRead => storage.pin(id, DeviceKind::Cpu)?,
            InputUse::Data => storage.pin(id, device)?,
            InputUse::Metadata => {
                storage.get(id)?;
            }
        }
    }
    Ok(())
}

/// Runs `layer` on `backend`: pins inputs, allocates outputs from the pools,
/// executes the kernel, stores outputs and disposes dead tensors.
pub(super) fn run_layer(
    layer: &Layer,
    backend: &dyn Backend,
    storage: &mut StorageManager,
) -> EngineResult<()> {
    let kind = layer.kind();
    if !backend.supports(kind) {
        return Err(EngineError::unsupported(
            kind.name(),
            backend.backend_type().to_string(),
            "no kernel registered",
        ));
    }
    let device = backend.device();
    pin_inputs(layer, device, storage)?;

    let specs = {
        let inputs = gather_inputs(layer, storage)?;
        infer_outputs(&layer.op, &inputs)?
    };
    if specs.len() != layer.outputs.len() {
        return Err(EngineError::kernel(
            kind.name(),
            format!(
                "operation produces {} outputs, layer declares {}",
                specs.len(),
                layer.outputs.len()
            ),
        ));
    }

    let mut outputs: SmallVec<[Tensor; 2]> = specs
        .iter()
        .map(|(shape, dtype)| storage.allocate(shape, *dtype, device))
        .collect();
    {
        let inputs = gather_inputs(layer, storage)?;
        backend
            .execute(&layer.op, &inputs, &mut outputs)
            .map_err(|err| err.into_engine_error(backend.backend_type()))?;
    }

    for (slot, tensor) in layer.outputs.iter().zip(outputs) {
        match slot {
            Some(id) => storage.store(*id, tensor),
            None => storage.release(tensor),
        }
    }
    storage.dispose_after_layer(layer.id);
    Ok(())
}
