use anyhow::{anyhow, bail, Context, Result};

use crate::backend::Backend;
use crate::graph::{Constant, Graph, Layer, Operation};
use crate::ops::infer_outputs;
use crate::tensor::{DType, DeviceKind, Shape, Tensor};

use super::{GraphPass, OptimizeContext, PassResult};

/// Replaces layers whose inputs are all constants by constants holding their
/// outputs, evaluated with the CPU backend. `Shape` and `Size` of statically
/// shaped graph inputs are folded as well. Random operations are never folded.
#[derive(Default)]
pub struct ConstantFoldingPass;

impl ConstantFoldingPass {
    const NAME: &'static str = "constant-fold";
}

/// Values of a `Shape`/`Size` probe on a statically shaped graph input.
fn fold_static_probe(graph: &Graph, layer: &Layer) -> Option<Vec<Tensor>> {
    let input = graph.inputs.iter().find(|input| Some(input.id) == layer.input(0))?;
    let dims = input.shape.static_dims()?;
    let tensor = match &layer.op {
        Operation::Shape { start, end } => {
            let rank = dims.len() as isize;
            let clamp = |v: isize| (if v < 0 { v + rank } else { v }).clamp(0, rank) as usize;
            let (start, end) = (clamp(*start), clamp(end.unwrap_or(rank)));
            let values: Vec<i32> = dims
                .get(start..end.max(start))?
                .iter()
                .map(|&d| d as i32)
                .collect();
            Tensor::from_i32(Shape::new([values.len()]), DType::I32, values).ok()?
        }
        Operation::Size => {
            let count = dims.iter().product::<usize>() as i32;
            Tensor::from_i32(Shape::scalar(), DType::I32, vec![count]).ok()?
        }
        _ => return None,
    };
    Some(vec![tensor])
}

/// Runs `layer` on the CPU over its constant inputs.
fn evaluate(graph: &Graph, layer: &Layer, cpu: &dyn Backend) -> Result<Vec<Tensor>> {
    let inputs = layer
        .inputs
        .iter()
        .map(|input| {
            input
                .map(|id| {
                    graph
                        .constant(id)
                        .ok_or_else(|| anyhow!("input {id} is not a constant"))?
                        .to_tensor()
                        .with_context(|| format!("materialising constant {id}"))
                })
                .transpose()
        })
        .collect::<Result<Vec<Option<Tensor>>>>()?;
    let borrowed: Vec<Option<&Tensor>> = inputs.iter().map(Option::as_ref).collect();

    let specs = infer_outputs(&layer.op, &borrowed)?;
    let mut outputs: Vec<Tensor> = specs
        .iter()
        .map(|(shape, dtype)| Tensor::zeros(shape.clone(), *dtype, DeviceKind::Cpu))
        .collect();
    cpu.execute(&layer.op, &borrowed, &mut outputs)?;
    if outputs.len() != layer.outputs.len() {
        bail!(
            "{} produced {} outputs, layer declares {}",
            layer.op.name(),
            outputs.len(),
            layer.outputs.len()
        );
    }
    Ok(outputs)
}

fn is_foldable(graph: &Graph, layer: &Layer) -> bool {
    !layer.kind().is_stochastic()
        && layer.inputs.iter().any(Option::is_some)
        && layer.input_ids().all(|id| graph.is_constant(id))
}

impl GraphPass for ConstantFoldingPass {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn run(&self, graph: &mut Graph, cx: &mut OptimizeContext) -> PassResult {
        let mut folded = 0usize;
        let mut idx = 0usize;
        while idx < graph.layers.len() {
            let layer = &graph.layers[idx];
            if cx.is_failed_fold(layer.id) {
                idx += 1;
                continue;
            }

            let outputs = if let Some(outputs) = fold_static_probe(graph, layer) {
                outputs
            } else if is_foldable(graph, layer) {
                let Some(cpu) = cx.cpu() else {
                    idx += 1;
                    continue;
                };
                match evaluate(graph, layer, cpu) {
                    Ok(outputs) => outputs,
                    Err(err) => {
                        tracing::debug!(layer = %layer.id, op = layer.op.name(), error = %err, "constant folding skipped");
                        let id = layer.id;
                        cx.record_failed_fold(id);
                        idx += 1;
                        continue;
                    }
                }
            } else {
                idx += 1;
                continue;
            };

            let layer = graph.layers.remove(idx);
            tracing::trace!(layer = %layer.id, op = layer.op.name(), "folded layer into constants");
            for (output, tensor) in layer.outputs.iter().zip(&outputs) {
                if let Some(id) = output {
                    graph.constants.push(Constant::from_tensor(*id, tensor));
                }
            }
            folded += 1;
        }

        PassResult {
            changed: folded > 0,
            iterations: 1,
            rewrites_applied: folded,
            erased_layers: folded,
        }
    }
}
