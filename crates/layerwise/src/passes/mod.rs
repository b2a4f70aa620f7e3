//! Graph rewrite passes run by the default optimizer pipeline.

mod activation_fusion;
mod constant_fold;
mod dce;
mod duplicate_removal;
mod linear_fusion;
mod noop_removal;
mod prune_outputs;
mod round_denormals;
mod transpose_chain;

pub use crate::optimizer::{GraphPass, OptimizeContext, PassResult};

pub use activation_fusion::ActivationFusionPass;
pub use constant_fold::ConstantFoldingPass;
pub use dce::DeadCodeEliminationPass;
pub use duplicate_removal::DuplicateLayerRemovalPass;
pub use linear_fusion::LinearFusionPass;
pub use noop_removal::NoOpRemovalPass;
pub use prune_outputs::PruneOutputsPass;
pub use round_denormals::RoundDenormalsPass;
pub use transpose_chain::TransposeChainPass;
