//! Run hyperparameters.
//!
//! Defaults live here as constants. An optional `damnet.toml` (or the file named by
//! `DAMNET_CONFIG`) overrides individual fields; anything it leaves out keeps its default.

use crate::error::{TrainError, TrainResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const LR: f64 = 0.01;
pub const MOMENTUM: f64 = 0.9;
pub const N_EPOCHS: usize = 100;
pub const BATCH_SIZE: usize = 128;
pub const SEED: u64 = 42;
pub const ANNEAL_GAMMA: f32 = 10.0;

const DEFAULT_CONFIG_NAME: &str = "damnet.toml";
const CONFIG_ENV: &str = "DAMNET_CONFIG";

/// How a training pass pairs source and target batches when their counts differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PairingPolicy {
    /// The pass ends as soon as either domain runs out of batches.
    StopAtShortest,
    /// The shorter domain restarts until the longer one is exhausted.
    CycleShorter,
}

impl PairingPolicy {
    /// Steps in one pass given each domain's batch count.
    pub fn steps(self, source_batches: usize, target_batches: usize) -> usize {
        let shortest = source_batches.min(target_batches);
        match self {
            PairingPolicy::StopAtShortest => shortest,
            PairingPolicy::CycleShorter if shortest == 0 => 0,
            PairingPolicy::CycleShorter => source_batches.max(target_batches),
        }
    }
}

/// Gradient-reversal coefficient over the course of the run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AdaptationSchedule {
    Constant { lambda: f32 },
    /// `2 / (1 + exp(-gamma * p)) - 1`, ramping from 0 to ~1 as progress `p` goes 0 to 1.
    Annealed { gamma: f32 },
}

impl AdaptationSchedule {
    pub fn lambda(&self, progress: f32) -> f32 {
        match *self {
            AdaptationSchedule::Constant { lambda } => lambda,
            AdaptationSchedule::Annealed { gamma } => {
                let p = progress.clamp(0.0, 1.0);
                2.0 / (1.0 + (-gamma * p).exp()) - 1.0
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetSource {
    /// Class-per-directory images under `data_root`.
    ImageFolder,
    /// Generated domains; no files needed.
    Synthetic,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentConfig {
    pub learning_rate: f64,
    pub momentum: f64,
    pub epochs: usize,
    pub batch_size: usize,
    pub seed: u64,
    pub pairing: PairingPolicy,
    pub adaptation: AdaptationSchedule,
    /// Weight of the domain loss in the combined objective.
    pub domain_weight: f32,
    pub checkpoint_root: PathBuf,
    pub data_root: PathBuf,
    pub dataset: DatasetSource,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            learning_rate: LR,
            momentum: MOMENTUM,
            epochs: N_EPOCHS,
            batch_size: BATCH_SIZE,
            seed: SEED,
            pairing: PairingPolicy::StopAtShortest,
            adaptation: AdaptationSchedule::Annealed {
                gamma: ANNEAL_GAMMA,
            },
            domain_weight: 1.0,
            checkpoint_root: PathBuf::from("models/models_checkpoints"),
            data_root: PathBuf::from("data"),
            dataset: DatasetSource::ImageFolder,
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct ExperimentConfigFile {
    learning_rate: Option<f64>,
    momentum: Option<f64>,
    epochs: Option<usize>,
    batch_size: Option<usize>,
    seed: Option<u64>,
    pairing: Option<PairingPolicy>,
    adaptation: Option<AdaptationSchedule>,
    domain_weight: Option<f32>,
    checkpoint_root: Option<String>,
    data_root: Option<String>,
    dataset: Option<DatasetSource>,
}

impl ExperimentConfig {
    /// `DAMNET_CONFIG` if set (the file must exist), else `./damnet.toml` if present, else
    /// defaults.
    pub fn load() -> TrainResult<Self> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            let path = PathBuf::from(path);
            return Self::from_path(&path)?.ok_or_else(|| TrainError::Config {
                msg: format!("{CONFIG_ENV} points at a missing file"),
                path,
            });
        }
        Ok(Self::from_path(Path::new(DEFAULT_CONFIG_NAME))?.unwrap_or_default())
    }

    /// `Ok(None)` when the file does not exist.
    pub fn from_path(path: &Path) -> TrainResult<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(path).map_err(|source| TrainError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let cfg = Self::from_toml_str(&raw).map_err(|msg| TrainError::Config {
            path: path.to_path_buf(),
            msg,
        })?;
        Ok(Some(cfg))
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, String> {
        let file: ExperimentConfigFile = toml::from_str(raw).map_err(|e| e.to_string())?;
        let cfg = Self::from_file(file);
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: ExperimentConfigFile) -> Self {
        let defaults = Self::default();
        Self {
            learning_rate: file.learning_rate.unwrap_or(defaults.learning_rate),
            momentum: file.momentum.unwrap_or(defaults.momentum),
            epochs: file.epochs.unwrap_or(defaults.epochs),
            batch_size: file.batch_size.unwrap_or(defaults.batch_size),
            seed: file.seed.unwrap_or(defaults.seed),
            pairing: file.pairing.unwrap_or(defaults.pairing),
            adaptation: file.adaptation.unwrap_or(defaults.adaptation),
            domain_weight: file.domain_weight.unwrap_or(defaults.domain_weight),
            checkpoint_root: file
                .checkpoint_root
                .map(|v| expand_path(&v))
                .unwrap_or(defaults.checkpoint_root),
            data_root: file
                .data_root
                .map(|v| expand_path(&v))
                .unwrap_or(defaults.data_root),
            dataset: file.dataset.unwrap_or(defaults.dataset),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(format!("learning_rate must be positive, got {}", self.learning_rate));
        }
        if !(0.0..1.0).contains(&self.momentum) {
            return Err(format!("momentum must be in [0, 1), got {}", self.momentum));
        }
        if self.batch_size == 0 {
            return Err("batch_size must be at least 1".to_string());
        }
        if !self.domain_weight.is_finite() || self.domain_weight < 0.0 {
            return Err(format!("domain_weight must be >= 0, got {}", self.domain_weight));
        }
        Ok(())
    }
}

fn expand_path(raw: &str) -> PathBuf {
    if let Some(stripped) = raw.strip_prefix('~') {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(format!("{home}{stripped}"));
        }
    }
    PathBuf::from(raw)
}
