use std::collections::HashSet;

use crate::error::StructuralError;

use super::{ConstantData, Graph, TensorId};

impl Graph {
    /// Checks the structural invariants the optimizer and scheduler rely on.
    ///
    /// Every layer input must be a graph input, a constant, or an output of a
    /// strictly earlier layer; tensor ids, layer ids and interface names must be
    /// unique; constants must hold exactly as many values as their shape.
    pub fn validate(&self) -> Result<(), StructuralError> {
        let mut defined: HashSet<TensorId> = HashSet::new();
        let mut names: HashSet<&str> = HashSet::new();
        for input in &self.inputs {
            if !defined.insert(input.id) {
                return Err(StructuralError::DuplicateTensor(input.id));
            }
            if !names.insert(input.name.as_str()) {
                return Err(StructuralError::DuplicateInputName(input.name.clone()));
            }
        }
        for constant in &self.constants {
            if !defined.insert(constant.id) {
                return Err(StructuralError::DuplicateTensor(constant.id));
            }
            let float_data = matches!(constant.data, ConstantData::Float(_));
            if constant.data.len() != constant.shape.num_elements()
                || float_data != constant.dtype.is_float()
            {
                return Err(StructuralError::MalformedConstant(constant.id));
            }
        }

        // Everything any layer produces, to tell "produced later" from "never produced".
        let all_outputs: HashSet<TensorId> = self
            .layers
            .iter()
            .flat_map(|layer| layer.output_ids())
            .collect();

        let mut layer_ids = HashSet::new();
        for layer in &self.layers {
            if !layer_ids.insert(layer.id) {
                return Err(StructuralError::DuplicateLayerId(layer.id));
            }
            let kind = layer.kind();
            let (min, max) = kind.arity();
            let count = layer.inputs.len();
            if count < min || max.is_some_and(|max| count > max) {
                let expected = match max {
                    Some(max) if max == min => format!("{min}"),
                    Some(max) => format!("{min}..={max}"),
                    None => format!("at least {min}"),
                };
                return Err(StructuralError::Arity {
                    layer: layer.id,
                    op: kind.name(),
                    expected,
                    found: count,
                });
            }
            for input in layer.input_ids() {
                if defined.contains(&input) {
                    continue;
                }
                if all_outputs.contains(&input) {
                    return Err(StructuralError::UseBeforeDefinition {
                        layer: layer.id,
                        tensor: input,
                    });
                }
                return Err(StructuralError::MissingProducer {
                    layer: layer.id,
                    tensor: input,
                });
            }
            for output in layer.output_ids() {
                if !defined.insert(output) {
                    return Err(StructuralError::DuplicateTensor(output));
                }
            }
        }

        let mut output_names = HashSet::new();
        for output in &self.outputs {
            if !output_names.insert(output.name.as_str()) {
                return Err(StructuralError::DuplicateOutputName(output.name.clone()));
            }
            if !defined.contains(&output.id) {
                return Err(StructuralError::UnknownOutput {
                    name: output.name.clone(),
                    tensor: output.id,
                });
            }
        }
        Ok(())
    }
}
