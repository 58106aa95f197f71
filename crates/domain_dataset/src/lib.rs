//! Per-domain datasets and Burn batch iteration for domain-adaptation training.
//!
//! This crate provides:
//! - The `DatasetProvider` seam the trainer loads domains through
//! - An image-folder provider (`<root>/<DOMAIN>/{train,test}/<class>/*.png`)
//! - A seeded synthetic provider for smoke runs and tests
//! - `BatchIter`, a resettable, reproducibly shuffled batch source

pub mod batch;
pub mod provider;
pub mod synthetic;
pub mod types;

pub use batch::{BatchIter, DomainBatch};
pub use provider::{DatasetProvider, ImageFolderProvider};
pub use synthetic::{SyntheticConfig, SyntheticProvider};
pub use types::*;
