//! Operation semantics the engine needs independently of any backend:
//! broadcasting, parameter resolution and output shape inference.

pub mod broadcast;
pub mod geometry;
mod infer;

pub use infer::{infer_outputs, OutputSpec};
