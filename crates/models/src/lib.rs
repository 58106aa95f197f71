//! Burn models for domain-adaptive digit classification.
//!
//! This crate defines the architectures the training harness can select by name:
//! - `MultibranchLeNet`: LeNet-style feature extractor whose conv stages run two parallel
//!   branches mixed by gates learned per domain, with a class head and a domain head.
//!
//! Models are plain Burn modules. The `training` crate owns optimizers, losses, and the
//! epoch loop; it only talks to models through [`DomainAdaptiveModel`].

use burn::module::Module;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use thiserror::Error;

pub mod grl;
pub mod lenet;

pub use grl::reverse_gradient;
pub use lenet::{MultibranchLeNet, MultibranchLeNetConfig, BRANCH_NAMES};

/// Which dataset a batch comes from. Doubles as the domain-classifier label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Domain {
    Source,
    Target,
}

impl Domain {
    pub const COUNT: usize = 2;

    /// Domain label used by the domain head (source = 0, target = 1).
    pub fn index(self) -> usize {
        match self {
            Domain::Source => 0,
            Domain::Target => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Domain::Source => "source",
            Domain::Target => "target",
        }
    }
}

/// Outputs of a full forward pass.
#[derive(Debug, Clone)]
pub struct DomainOutput<B: Backend> {
    /// Class log-probabilities, shape `[batch, num_classes]`.
    pub class_log_probs: Tensor<B, 2>,
    /// Domain log-probabilities after gradient reversal, shape `[batch, 2]`.
    pub domain_log_probs: Tensor<B, 2>,
}

/// Capabilities the training procedure needs from an architecture.
pub trait DomainAdaptiveModel<B: Backend>: Module<B> {
    /// Run both heads. `lambda` scales the reversed gradient flowing from the domain head
    /// into the feature extractor.
    fn forward_domains(&self, images: Tensor<B, 4>, domain: Domain, lambda: f32)
        -> DomainOutput<B>;

    /// Class log-probabilities only.
    fn classify(&self, images: Tensor<B, 4>, domain: Domain) -> Tensor<B, 2>;

    fn branch_names(&self) -> &'static [&'static str];
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ModelError {
    #[error("unknown model '{name}' (available: {available})")]
    UnknownModel { name: String, available: String },
}

/// Registered architectures, selectable by their CLI name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModelKind {
    MultibranchLeNet,
}

impl ModelKind {
    pub const ALL: &'static [ModelKind] = &[ModelKind::MultibranchLeNet];

    pub fn name(self) -> &'static str {
        match self {
            ModelKind::MultibranchLeNet => "MultibranchLeNet",
        }
    }

    pub fn from_name(name: &str) -> Result<Self, ModelError> {
        Self::ALL
            .iter()
            .copied()
            .find(|kind| kind.name() == name)
            .ok_or_else(|| ModelError::UnknownModel {
                name: name.to_string(),
                available: Self::ALL
                    .iter()
                    .map(|kind| kind.name())
                    .collect::<Vec<_>>()
                    .join(", "),
            })
    }
}

impl std::fmt::Display for ModelKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

pub mod prelude {
    pub use super::{
        reverse_gradient, Domain, DomainAdaptiveModel, DomainOutput, ModelError, ModelKind,
        MultibranchLeNet, MultibranchLeNetConfig,
    };
}
