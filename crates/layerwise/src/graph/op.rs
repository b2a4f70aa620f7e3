//! Closed operation set carried by graph layers.

use serde::{Deserialize, Serialize};

use crate::tensor::DType;

/// Activation folded into a Conv or Dense layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FusedActivation {
    #[default]
    None,
    Relu,
}

/// Padding policy of a convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AutoPad {
    /// Explicit `pads` are used.
    #[default]
    NotSet,
    /// No padding at all; `pads` are ignored.
    Valid,
    /// Output extent `ceil(in / stride)`, extra padding at the end.
    SameUpper,
    /// Output extent `ceil(in / stride)`, extra padding at the start.
    SameLower,
}

/// Parameters of a 2-D NCHW convolution.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConvParams {
    #[serde(default = "ConvParams::unit_pair")]
    pub strides: [usize; 2],
    /// `[top, left, bottom, right]`.
    #[serde(default)]
    pub pads: [usize; 4],
    #[serde(default = "ConvParams::unit_pair")]
    pub dilations: [usize; 2],
    #[serde(default = "ConvParams::one")]
    pub group: usize,
    #[serde(default)]
    pub auto_pad: AutoPad,
    #[serde(default)]
    pub activation: FusedActivation,
}

impl ConvParams {
    fn unit_pair() -> [usize; 2] {
        [1, 1]
    }

    fn one() -> usize {
        1
    }

    /// True when no input position is ever read from padding.
    pub fn has_zero_padding(&self) -> bool {
        match self.auto_pad {
            AutoPad::Valid => true,
            AutoPad::NotSet => self.pads.iter().all(|&p| p == 0),
            AutoPad::SameUpper | AutoPad::SameLower => false,
        }
    }
}

impl Default for ConvParams {
    fn default() -> Self {
        Self {
            strides: [1, 1],
            pads: [0; 4],
            dilations: [1, 1],
            group: 1,
            auto_pad: AutoPad::NotSet,
            activation: FusedActivation::None,
        }
    }
}

/// Scalar fill value of `ConstantOfShape`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScalarValue {
    Int(i32),
    Float(f32),
}

impl ScalarValue {
    pub fn dtype(self) -> DType {
        match self {
            ScalarValue::Int(_) => DType::I32,
            ScalarValue::Float(_) => DType::F32,
        }
    }
}

/// Operation performed by a layer, with its immutable parameters.
///
/// Input positions follow the ONNX convention of the same-named operator;
/// optional positions may be left empty in [`crate::graph::Layer::inputs`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    Add,
    Sub,
    Mul,
    Div,
    /// `x * scale + bias` with 1-D `scale`/`bias` applied along `axis`.
    ScaleBias {
        #[serde(default = "default_channel_axis")]
        axis: isize,
    },
    /// `x * s + b` with scalar parameters.
    ScalarMad { s: f32, b: f32 },
    /// `x[..., K] · W[K, N] + bias[N]`.
    Dense {
        #[serde(default)]
        activation: FusedActivation,
    },
    MatMul,
    Conv(ConvParams),
    Relu,
    Sigmoid,
    Tanh,
    LeakyRelu { alpha: f32 },
    Identity,
    Transpose {
        #[serde(default)]
        perm: Option<Vec<usize>>,
    },
    Reshape {
        #[serde(default)]
        allow_zero: bool,
    },
    Shape {
        #[serde(default)]
        start: isize,
        #[serde(default)]
        end: Option<isize>,
    },
    Size,
    ConstantOfShape { value: ScalarValue },
    Expand,
    Slice,
    /// Constant-mode padding.
    Pad,
    Gather {
        #[serde(default)]
        axis: isize,
    },
    TopK {
        #[serde(default = "default_last_axis")]
        axis: isize,
        #[serde(default = "default_true")]
        largest: bool,
        #[serde(default = "default_true")]
        sorted: bool,
    },
    Range,
    RandomNormalLike {
        #[serde(default)]
        mean: f32,
        #[serde(default = "default_unit")]
        scale: f32,
        #[serde(default)]
        seed: Option<u64>,
    },
    RandomUniformLike {
        #[serde(default)]
        low: f32,
        #[serde(default = "default_unit")]
        high: f32,
        #[serde(default)]
        seed: Option<u64>,
    },
    Cast { to: DType },
    CastLike,
    ReduceSum {
        #[serde(default = "default_true")]
        keepdims: bool,
    },
    ReduceMean {
        #[serde(default = "default_true")]
        keepdims: bool,
    },
    Concat { axis: isize },
}

fn default_channel_axis() -> isize {
    1
}

fn default_last_axis() -> isize {
    -1
}

fn default_true() -> bool {
    true
}

fn default_unit() -> f32 {
    1.0
}

/// Parameter-free tag of an [`Operation`], used as a table key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OpKind {
    Add,
    Sub,
    Mul,
    Div,
    ScaleBias,
    ScalarMad,
    Dense,
    MatMul,
    Conv,
    Relu,
    Sigmoid,
    Tanh,
    LeakyRelu,
    Identity,
    Transpose,
    Reshape,
    Shape,
    Size,
    ConstantOfShape,
    Expand,
    Slice,
    Pad,
    Gather,
    TopK,
    Range,
    RandomNormalLike,
    RandomUniformLike,
    Cast,
    CastLike,
    ReduceSum,
    ReduceMean,
    Concat,
}

impl OpKind {
    pub fn name(self) -> &'static str {
        match self {
            OpKind::Add => "Add",
            OpKind::Sub => "Sub",
            OpKind::Mul => "Mul",
            OpKind::Div => "Div",
            OpKind::ScaleBias => "ScaleBias",
            OpKind::ScalarMad => "ScalarMad",
            OpKind::Dense => "Dense",
            OpKind::MatMul => "MatMul",
            OpKind::Conv => "Conv",
            OpKind::Relu => "Relu",
            OpKind::Sigmoid => "Sigmoid",
            OpKind::Tanh => "Tanh",
            OpKind::LeakyRelu => "LeakyRelu",
            OpKind::Identity => "Identity",
            OpKind::Transpose => "Transpose",
            OpKind::Reshape => "Reshape",
            OpKind::Shape => "Shape",
            OpKind::Size => "Size",
            OpKind::ConstantOfShape => "ConstantOfShape",
            OpKind::Expand => "Expand",
            OpKind::Slice => "Slice",
            OpKind::Pad => "Pad",
            OpKind::Gather => "Gather",
            OpKind::TopK => "TopK",
            OpKind::Range => "Range",
            OpKind::RandomNormalLike => "RandomNormalLike",
            OpKind::RandomUniformLike => "RandomUniformLike",
            OpKind::Cast => "Cast",
            OpKind::CastLike => "CastLike",
            OpKind::ReduceSum => "ReduceSum",
            OpKind::ReduceMean => "ReduceMean",
            OpKind::Concat => "Concat",
        }
    }

    /// Accepted input count as `(min, max)`; `None` max means variadic.
    pub fn arity(self) -> (usize, Option<usize>) {
        match self {
            OpKind::Add | OpKind::Sub | OpKind::Mul | OpKind::Div | OpKind::MatMul => (2, Some(2)),
            OpKind::ScaleBias => (3, Some(3)),
            OpKind::Dense => (2, Some(3)),
            OpKind::Conv => (2, Some(3)),
            OpKind::ScalarMad
            | OpKind::Relu
            | OpKind::Sigmoid
            | OpKind::Tanh
            | OpKind::LeakyRelu
            | OpKind::Identity
            | OpKind::Transpose
            | OpKind::Shape
            | OpKind::Size
            | OpKind::ConstantOfShape
            | OpKind::RandomNormalLike
            | OpKind::RandomUniformLike
            | OpKind::Cast => (1, Some(1)),
            OpKind::Reshape | OpKind::Expand | OpKind::Gather | OpKind::TopK => (2, Some(2)),
            OpKind::CastLike => (2, Some(2)),
            OpKind::Slice => (3, Some(5)),
            OpKind::Pad => (2, Some(4)),
            OpKind::Range => (3, Some(3)),
            OpKind::ReduceSum | OpKind::ReduceMean => (1, Some(2)),
            OpKind::Concat => (1, None),
        }
    }

    /// Number of output tensors the operation produces.
    pub fn output_count(self) -> usize {
        match self {
            OpKind::TopK => 2,
            _ => 1,
        }
    }

    /// Operations whose result is not a pure function of their inputs.
    pub fn is_stochastic(self) -> bool {
        matches!(self, OpKind::RandomNormalLike | OpKind::RandomUniformLike)
    }
}

impl Operation {
    pub fn kind(&self) -> OpKind {
        match self {
            Operation::Add => OpKind::Add,
            Operation::Sub => OpKind::Sub,
            Operation::Mul => OpKind::Mul,
            Operation::Div => OpKind::Div,
            Operation::ScaleBias { .. } => OpKind::ScaleBias,
            Operation::ScalarMad { .. } => OpKind::ScalarMad,
            Operation::Dense { .. } => OpKind::Dense,
            Operation::MatMul => OpKind::MatMul,
            Operation::Conv(_) => OpKind::Conv,
            Operation::Relu => OpKind::Relu,
            Operation::Sigmoid => OpKind::Sigmoid,
            Operation::Tanh => OpKind::Tanh,
            Operation::LeakyRelu { .. } => OpKind::LeakyRelu,
            Operation::Identity => OpKind::Identity,
            Operation::Transpose { .. } => OpKind::Transpose,
            Operation::Reshape { .. } => OpKind::Reshape,
            Operation::Shape { .. } => OpKind::Shape,
            Operation::Size => OpKind::Size,
            Operation::ConstantOfShape { .. } => OpKind::ConstantOfShape,
            Operation::Expand => OpKind::Expand,
            Operation::Slice => OpKind::Slice,
            Operation::Pad => OpKind::Pad,
            Operation::Gather { .. } => OpKind::Gather,
            Operation::TopK { .. } => OpKind::TopK,
            Operation::Range => OpKind::Range,
            Operation::RandomNormalLike { .. } => OpKind::RandomNormalLike,
            Operation::RandomUniformLike { .. } => OpKind::RandomUniformLike,
            Operation::Cast { .. } => OpKind::Cast,
            Operation::CastLike => OpKind::CastLike,
            Operation::ReduceSum { .. } => OpKind::ReduceSum,
            Operation::ReduceMean { .. } => OpKind::ReduceMean,
            Operation::Concat { .. } => OpKind::Concat,
        }
    }

    pub fn name(&self) -> &'static str {
        self.kind().name()
    }

    /// Activation already folded into the layer, if the operation supports one.
    pub fn fused_activation(&self) -> FusedActivation {
        match self {
            Operation::Dense { activation } => *activation,
            Operation::Conv(params) => params.activation,
            _ => FusedActivation::None,
        }
    }
}
