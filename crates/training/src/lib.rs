#![recursion_limit = "256"]

pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod dann;
pub mod error;
pub mod orchestrator;
pub mod pairing;
pub mod run;

pub use checkpoint::{ensure_checkpoint_dir, load_params, CheckpointMeta};
pub use cli::{RunSelection, TrainArgs};
pub use config::{AdaptationSchedule, DatasetSource, ExperimentConfig, PairingPolicy};
pub use dann::{sgd, DannProcedure, EvalReport};
pub use error::{TrainError, TrainResult};
pub use orchestrator::{EpochRecord, EpochStats, Orchestrator, RunReport, RunState, TrainingProcedure};
pub use run::{load_domains, run_experiment, run_train, train_model};

/// Backend alias for training/eval (NdArray by default; WGPU if enabled).
#[cfg(feature = "backend-wgpu")]
pub type TrainBackend = burn_wgpu::Wgpu<f32>;
#[cfg(not(feature = "backend-wgpu"))]
pub type TrainBackend = burn_ndarray::NdArray<f32>;

pub type ADBackend = burn::backend::Autodiff<TrainBackend>;
