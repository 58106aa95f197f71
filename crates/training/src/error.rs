use domain_dataset::DatasetError;
use models::ModelError;
use std::path::PathBuf;
use thiserror::Error;

pub type TrainResult<T> = Result<T, TrainError>;

#[derive(Debug, Error)]
pub enum TrainError {
    #[error(transparent)]
    Model(#[from] ModelError),
    #[error(transparent)]
    Dataset(#[from] DatasetError),
    #[error("invalid config {path}: {msg}")]
    Config { path: PathBuf, msg: String },
    #[error("failed to create checkpoint directory {path}: {source}")]
    CheckpointDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to save checkpoint {path}: {msg}")]
    CheckpointWrite { path: PathBuf, msg: String },
    #[error("failed to load checkpoint {path}: {msg}")]
    CheckpointRead { path: PathBuf, msg: String },
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("source batch has no labels; the source domain must be labeled")]
    UnlabeledSource,
    #[error("loss is {value} at epoch {epoch}, step {step}")]
    NonFiniteLoss { epoch: usize, step: usize, value: f32 },
}
