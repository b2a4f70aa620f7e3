//! In-memory computation graph handed over by a model importer.
//!
//! Layers are stored in topological order: every layer input is a graph
//! input, a constant, or the output of a strictly earlier layer. Passes keep
//! that order when rewriting, so the scheduler never needs dependency tracking.

mod op;
mod validate;

use std::collections::{HashMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

pub use op::{AutoPad, ConvParams, FusedActivation, OpKind, Operation, ScalarValue};

use crate::error::StructuralError;
use crate::tensor::{DType, Shape, SymbolicShape, Tensor};

/// Identifier of a tensor value inside a graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TensorId(pub u32);

impl TensorId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for TensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}", self.0)
    }
}

/// Identifier of a layer, unique within a graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LayerId(pub u32);

impl fmt::Display for LayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Named graph input supplied by the caller on every run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Input {
    pub id: TensorId,
    pub name: String,
    pub dtype: DType,
    pub shape: SymbolicShape,
}

/// Named graph output, read back by the caller after a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Output {
    pub name: String,
    pub id: TensorId,
}

/// Host data of a compile-time constant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstantData {
    Float(Vec<f32>),
    Int(Vec<i32>),
}

impl ConstantData {
    pub fn len(&self) -> usize {
        match self {
            ConstantData::Float(values) => values.len(),
            ConstantData::Int(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Tensor whose contents are fixed when the graph is compiled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constant {
    pub id: TensorId,
    pub shape: Shape,
    pub dtype: DType,
    pub data: ConstantData,
}

impl Constant {
    pub fn from_f32(id: TensorId, shape: Shape, values: Vec<f32>) -> Self {
        debug_assert_eq!(shape.num_elements(), values.len());
        Self {
            id,
            shape,
            dtype: DType::F32,
            data: ConstantData::Float(values),
        }
    }

    pub fn from_i32(id: TensorId, shape: Shape, dtype: DType, values: Vec<i32>) -> Self {
        debug_assert_eq!(shape.num_elements(), values.len());
        Self {
            id,
            shape,
            dtype,
            data: ConstantData::Int(values),
        }
    }

    /// Captures a computed tensor (e.g. a folded layer output) as a constant.
    pub fn from_tensor(id: TensorId, tensor: &Tensor) -> Self {
        let data = if tensor.dtype().is_float() {
            ConstantData::Float(tensor.as_f32().to_vec())
        } else {
            ConstantData::Int(tensor.as_i32().to_vec())
        };
        Self {
            id,
            shape: tensor.shape().clone(),
            dtype: tensor.dtype(),
            data,
        }
    }

    /// Float view; `None` for integer constants.
    pub fn as_f32(&self) -> Option<&[f32]> {
        match &self.data {
            ConstantData::Float(values) => Some(values),
            ConstantData::Int(_) => None,
        }
    }

    pub fn to_f32_vec(&self) -> Vec<f32> {
        match &self.data {
            ConstantData::Float(values) => values.clone(),
            ConstantData::Int(values) => values.iter().map(|&v| v as f32).collect(),
        }
    }

    /// Materialises the constant as a host tensor.
    pub fn to_tensor(&self) -> Result<Tensor, StructuralError> {
        self.build_tensor(self.data.clone())
    }

    /// Moves the host data into a tensor, leaving the constant empty.
    pub fn take_tensor(&mut self) -> Result<Tensor, StructuralError> {
        let empty = match &self.data {
            ConstantData::Float(_) => ConstantData::Float(Vec::new()),
            ConstantData::Int(_) => ConstantData::Int(Vec::new()),
        };
        let data = std::mem::replace(&mut self.data, empty);
        self.build_tensor(data)
    }

    fn build_tensor(&self, data: ConstantData) -> Result<Tensor, StructuralError> {
        if matches!(data, ConstantData::Float(_)) != self.dtype.is_float() {
            return Err(StructuralError::MalformedConstant(self.id));
        }
        let built = match data {
            ConstantData::Float(values) => Tensor::from_f32(self.shape.clone(), values),
            ConstantData::Int(values) => Tensor::from_i32(self.shape.clone(), self.dtype, values),
        };
        built.map_err(|_| StructuralError::MalformedConstant(self.id))
    }

    /// True when the constant holds exactly one element equal to `value`.
    pub fn is_single_value(&self, value: f32) -> bool {
        self.data.len() == 1 && self.to_f32_vec()[0] == value
    }
}

/// One operation node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Layer {
    pub id: LayerId,
    #[serde(flatten)]
    pub op: Operation,
    /// Ordered inputs; `None` marks an absent optional input.
    pub inputs: Vec<Option<TensorId>>,
    /// Ordered outputs; `None` marks an output pruned by the optimizer.
    pub outputs: Vec<Option<TensorId>>,
}

impl Layer {
    pub fn new(id: LayerId, op: Operation, inputs: Vec<Option<TensorId>>, outputs: Vec<TensorId>) -> Self {
        Self {
            id,
            op,
            inputs,
            outputs: outputs.into_iter().map(Some).collect(),
        }
    }

    pub fn kind(&self) -> OpKind {
        self.op.kind()
    }

    /// Input at `position`, `None` when absent or out of range.
    pub fn input(&self, position: usize) -> Option<TensorId> {
        self.inputs.get(position).copied().flatten()
    }

    /// Present inputs in order.
    pub fn input_ids(&self) -> impl Iterator<Item = TensorId> + '_ {
        self.inputs.iter().filter_map(|id| *id)
    }

    /// Present outputs in order.
    pub fn output_ids(&self) -> impl Iterator<Item = TensorId> + '_ {
        self.outputs.iter().filter_map(|id| *id)
    }

    /// The single output of a one-output layer.
    pub fn sole_output(&self) -> Option<TensorId> {
        match self.outputs.as_slice() {
            [Some(id)] => Some(*id),
            _ => None,
        }
    }
}

/// Topologically sorted computation graph.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    #[serde(default)]
    pub name: String,
    pub inputs: Vec<Input>,
    pub outputs: Vec<Output>,
    #[serde(default)]
    pub constants: Vec<Constant>,
    pub layers: Vec<Layer>,
}

impl Graph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Parses a graph from its JSON interchange form.
    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Smallest tensor id not used anywhere in the graph.
    pub fn next_tensor_id(&self) -> TensorId {
        let mut max_id = None::<u32>;
        let mut bump = |id: TensorId| max_id = Some(max_id.map_or(id.0, |m| m.max(id.0)));
        self.inputs.iter().for_each(|input| bump(input.id));
        self.constants.iter().for_each(|constant| bump(constant.id));
        for layer in &self.layers {
            layer.input_ids().for_each(&mut bump);
            layer.output_ids().for_each(&mut bump);
        }
        TensorId(max_id.map_or(0, |m| m.wrapping_add(1)))
    }

    /// Smallest layer id not used by any layer.
    pub fn next_layer_id(&self) -> LayerId {
        let next = self
            .layers
            .iter()
            .map(|layer| layer.id.0.wrapping_add(1))
            .max()
            .unwrap_or(0);
        LayerId(next)
    }

    /// Registers a new constant under a fresh id.
    pub fn add_constant(&mut self, shape: Shape, data: ConstantData, dtype: DType) -> TensorId {
        let id = self.next_tensor_id();
        self.constants.push(Constant {
            id,
            shape,
            dtype,
            data,
        });
        id
    }

    pub fn add_constant_f32(&mut self, shape: Shape, values: Vec<f32>) -> TensorId {
        self.add_constant(shape, ConstantData::Float(values), DType::F32)
    }

    pub fn constant(&self, id: TensorId) -> Option<&Constant> {
        self.constants.iter().find(|constant| constant.id == id)
    }

    pub fn is_constant(&self, id: TensorId) -> bool {
        self.constant(id).is_some()
    }

    pub fn is_input(&self, id: TensorId) -> bool {
        self.inputs.iter().any(|input| input.id == id)
    }

    pub fn is_output(&self, id: TensorId) -> bool {
        self.outputs.iter().any(|output| output.id == id)
    }

    pub fn input_by_name(&self, name: &str) -> Option<&Input> {
        self.inputs.iter().find(|input| input.name == name)
    }

    pub fn output_by_name(&self, name: &str) -> Option<&Output> {
        self.outputs.iter().find(|output| output.name == name)
    }

    pub fn layer(&self, id: LayerId) -> Option<&Layer> {
        self.layers.iter().find(|layer| layer.id == id)
    }

    /// Maps each produced tensor to the index of its producing layer.
    pub fn producer_index(&self) -> HashMap<TensorId, usize> {
        let mut producers = HashMap::new();
        for (idx, layer) in self.layers.iter().enumerate() {
            for output in layer.output_ids() {
                producers.insert(output, idx);
            }
        }
        producers
    }

    /// Maps each tensor to the indices of the layers reading it, in order.
    pub fn consumers(&self) -> HashMap<TensorId, Vec<usize>> {
        let mut consumers: HashMap<TensorId, Vec<usize>> = HashMap::new();
        for (idx, layer) in self.layers.iter().enumerate() {
            for input in layer.input_ids() {
                let readers = consumers.entry(input).or_default();
                if readers.last() != Some(&idx) {
                    readers.push(idx);
                }
            }
        }
        consumers
    }

    /// Tensors read by any layer or exported as graph outputs.
    pub fn live_tensors(&self) -> HashSet<TensorId> {
        let mut live: HashSet<TensorId> = self.outputs.iter().map(|output| output.id).collect();
        for layer in &self.layers {
            live.extend(layer.input_ids());
        }
        live
    }

    /// Redirects every use of `from` (layer inputs and graph outputs) to `to`.
    pub fn replace_uses(&mut self, from: TensorId, to: TensorId) {
        if from == to {
            return;
        }
        for layer in &mut self.layers {
            for input in layer.inputs.iter_mut().flatten() {
                if *input == from {
                    *input = to;
                }
            }
        }
        for output in &mut self.outputs {
            if output.id == from {
                output.id = to;
            }
        }
    }

    /// Drops constants that nothing reads; returns how many were removed.
    pub fn remove_unused_constants(&mut self) -> usize {
        let live = self.live_tensors();
        let before = self.constants.len();
        self.constants.retain(|constant| live.contains(&constant.id));
        before - self.constants.len()
    }
}
