//! Checkpoint directory layout and metadata.
//!
//! Layout under `<checkpoint_root>/<source>-<target>/`:
//! - `<model>_epoch_<NNNN>.bin`: model parameters (Burn `BinFileRecorder`, full precision)
//! - `<model>_epoch_<NNNN>.json`: [`CheckpointMeta`] sidecar
//! - `metrics.jsonl`: one line per finished epoch

use crate::cli::RunSelection;
use crate::error::{TrainError, TrainResult};
use burn::module::Module;
use burn::record::{BinFileRecorder, FullPrecisionSettings};
use burn::tensor::backend::Backend;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

pub const CHECKPOINT_SCHEMA_VERSION: u32 = 1;
pub const METRICS_FILE: &str = "metrics.jsonl";

/// `<root>/<source>-<target>`.
pub fn checkpoint_dir(root: &Path, selection: &RunSelection) -> PathBuf {
    root.join(format!("{}-{}", selection.source, selection.target))
}

/// Create the run's checkpoint directory. An existing directory is fine; anything else
/// that stops the directory from existing is fatal.
pub fn ensure_checkpoint_dir(root: &Path, selection: &RunSelection) -> TrainResult<PathBuf> {
    let dir = checkpoint_dir(root, selection);
    match fs::create_dir_all(&dir) {
        Ok(()) => Ok(dir),
        Err(e) if e.kind() == ErrorKind::AlreadyExists && dir.is_dir() => Ok(dir),
        Err(source) => Err(TrainError::CheckpointDir { path: dir, source }),
    }
}

/// File stem shared by the parameter file and its sidecar.
pub fn checkpoint_stem(model: &str, epoch: usize) -> String {
    format!("{model}_epoch_{epoch:04}")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub schema_version: u32,
    /// Identifies the training run that wrote this checkpoint; matches `metrics.jsonl` lines.
    pub run_id: String,
    pub epoch: usize,
    pub model: String,
    pub source: String,
    pub target: String,
    /// Parameter file name, relative to the checkpoint directory.
    pub params: String,
    pub train_loss: f32,
    pub source_accuracy: Option<f32>,
    pub target_accuracy: Option<f32>,
}

impl CheckpointMeta {
    pub fn write(&self, dir: &Path) -> TrainResult<PathBuf> {
        let path = dir
            .join(checkpoint_stem(&self.model, self.epoch))
            .with_extension("json");
        let json = serde_json::to_vec_pretty(self)?;
        fs::write(&path, json).map_err(|source| TrainError::Io {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }

    pub fn read(path: &Path) -> TrainResult<Self> {
        let raw = fs::read(path).map_err(|source| TrainError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_slice(&raw)?)
    }
}

/// Load parameters written by a training run into `model`, which supplies the architecture.
pub fn load_params<B: Backend, M: Module<B>>(
    model: M,
    path: &Path,
    device: &B::Device,
) -> TrainResult<M> {
    let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
    model
        .load_file(path.to_path_buf(), &recorder, device)
        .map_err(|e| TrainError::CheckpointRead {
            path: path.to_path_buf(),
            msg: e.to_string(),
        })
}

/// `run_<unix millis>`, taken when a run starts.
pub fn new_run_id() -> String {
    let started_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    format!("run_{started_ms}")
}

/// Append one JSON value as a line to `<dir>/metrics.jsonl`.
pub fn append_metrics<T: Serialize>(dir: &Path, record: &T) -> TrainResult<()> {
    let path = dir.join(METRICS_FILE);
    let line = serde_json::to_string(record)?;
    let io_err = |source| TrainError::Io {
        path: path.clone(),
        source,
    };
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(io_err)?;
    writeln!(file, "{line}").map_err(io_err)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn selection() -> RunSelection {
        RunSelection::new("MNIST", "MNIST_M", "MultibranchLeNet")
    }

    #[test]
    fn second_call_succeeds_with_one_directory() {
        let temp = tempfile::tempdir().unwrap();
        let first = ensure_checkpoint_dir(temp.path(), &selection()).unwrap();
        let second = ensure_checkpoint_dir(temp.path(), &selection()).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, temp.path().join("MNIST-MNIST_M"));
        let entries: Vec<_> = fs::read_dir(temp.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
        assert!(first.is_dir());
    }

    #[test]
    fn creates_missing_parents() {
        let temp = tempfile::tempdir().unwrap();
        let root = temp.path().join("models/models_checkpoints");
        let dir = ensure_checkpoint_dir(&root, &selection()).unwrap();
        assert!(dir.is_dir());
    }

    #[test]
    fn file_in_the_way_is_fatal() {
        let temp = tempfile::tempdir().unwrap();
        fs::write(temp.path().join("MNIST-MNIST_M"), b"not a dir").unwrap();
        let err = ensure_checkpoint_dir(temp.path(), &selection()).unwrap_err();
        assert!(matches!(err, TrainError::CheckpointDir { .. }));
    }

    #[test]
    fn stems_are_zero_padded() {
        assert_eq!(checkpoint_stem("MultibranchLeNet", 7), "MultibranchLeNet_epoch_0007");
    }

    #[test]
    fn meta_roundtrips_through_sidecar() {
        let temp = tempfile::tempdir().unwrap();
        let meta = CheckpointMeta {
            schema_version: CHECKPOINT_SCHEMA_VERSION,
            run_id: "run_1700000000000".into(),
            epoch: 2,
            model: "MultibranchLeNet".into(),
            source: "MNIST".into(),
            target: "MNIST_M".into(),
            params: "MultibranchLeNet_epoch_0002.bin".into(),
            train_loss: 1.25,
            source_accuracy: Some(0.5),
            target_accuracy: None,
        };
        let path = meta.write(temp.path()).unwrap();
        assert!(path.ends_with("MultibranchLeNet_epoch_0002.json"));
        assert_eq!(CheckpointMeta::read(&path).unwrap(), meta);
    }

    #[test]
    fn metrics_append_one_line_per_call() {
        let temp = tempfile::tempdir().unwrap();
        append_metrics(temp.path(), &serde_json::json!({"epoch": 1})).unwrap();
        append_metrics(temp.path(), &serde_json::json!({"epoch": 2})).unwrap();
        let raw = fs::read_to_string(temp.path().join(METRICS_FILE)).unwrap();
        assert_eq!(raw.lines().count(), 2);
    }
}
