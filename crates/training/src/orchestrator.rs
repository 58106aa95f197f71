//! Epoch loop: train, evaluate, checkpoint, repeat.
//!
//! ```text
//! Init -> EpochRunning(1) -> Evaluating(1) -> EpochRunning(2) -> ... -> Evaluating(N) -> Done
//! ```
//!
//! Any error from the procedure aborts the run where it happened; nothing is retried.

use crate::checkpoint::{append_metrics, new_run_id, CheckpointMeta, CHECKPOINT_SCHEMA_VERSION};
use crate::cli::RunSelection;
use crate::dann::EvalReport;
use crate::error::TrainResult;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "epoch", rename_all = "snake_case")]
pub enum RunState {
    Init,
    EpochRunning(usize),
    Evaluating(usize),
    Done,
}

/// Summary of one training pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EpochStats {
    pub steps: usize,
    pub mean_loss: f32,
    pub mean_class_loss: f32,
    pub mean_domain_loss: f32,
    /// Gradient-reversal coefficient at the last step of the pass.
    pub lambda: f32,
    /// Combined loss of every step, in order.
    pub step_losses: Vec<f32>,
}

/// What the orchestrator needs from a training procedure. Epochs are numbered from 1.
pub trait TrainingProcedure {
    fn train_epoch(&mut self, epoch: usize) -> TrainResult<EpochStats>;

    /// Accuracy on held-out data of both domains, without gradient tracking.
    fn evaluate(&mut self, epoch: usize) -> TrainResult<EvalReport>;

    /// Persist current parameters into `dir`; returns the written file.
    fn save_checkpoint(&mut self, epoch: usize, dir: &Path) -> TrainResult<PathBuf>;
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EpochRecord {
    pub epoch: usize,
    pub train: EpochStats,
    pub eval: EvalReport,
    pub checkpoint: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    pub run_id: String,
    pub epochs: Vec<EpochRecord>,
    /// Every state entered, starting with `Init`.
    pub transitions: Vec<RunState>,
}

impl RunReport {
    pub fn final_state(&self) -> RunState {
        self.transitions.last().copied().unwrap_or(RunState::Init)
    }
}

#[derive(Serialize)]
struct MetricsLine<'a> {
    run_id: &'a str,
    epoch: usize,
    source: &'a str,
    target: &'a str,
    model: &'a str,
    steps: usize,
    mean_loss: f32,
    mean_class_loss: f32,
    mean_domain_loss: f32,
    lambda: f32,
    source_accuracy: Option<f32>,
    target_accuracy: Option<f32>,
}

pub struct Orchestrator {
    run_id: String,
    epochs: usize,
    checkpoint_dir: PathBuf,
    selection: RunSelection,
    state: RunState,
    transitions: Vec<RunState>,
}

impl Orchestrator {
    pub fn new(epochs: usize, checkpoint_dir: PathBuf, selection: RunSelection) -> Self {
        Self {
            run_id: new_run_id(),
            epochs,
            checkpoint_dir,
            selection,
            state: RunState::Init,
            transitions: vec![RunState::Init],
        }
    }

    /// Use a caller-chosen run id instead of the generated one.
    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = run_id.into();
        self
    }

    /// Tags every metrics line and sidecar this run writes.
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    fn enter(&mut self, state: RunState) {
        self.state = state;
        self.transitions.push(state);
    }

    pub fn run<P: TrainingProcedure>(mut self, procedure: &mut P) -> TrainResult<RunReport> {
        info!(run_id = %self.run_id, epochs = self.epochs, "run started");
        let mut records = Vec::with_capacity(self.epochs);
        for epoch in 1..=self.epochs {
            self.enter(RunState::EpochRunning(epoch));
            let train = procedure.train_epoch(epoch)?;
            if train.steps == 0 {
                warn!(epoch, "training pass had no paired batches");
            }
            info!(
                epoch,
                steps = train.steps,
                loss = train.mean_loss,
                class_loss = train.mean_class_loss,
                domain_loss = train.mean_domain_loss,
                lambda = train.lambda,
                "epoch trained"
            );

            self.enter(RunState::Evaluating(epoch));
            let eval = procedure.evaluate(epoch)?;
            info!(
                epoch,
                source_accuracy = ?eval.source_accuracy,
                target_accuracy = ?eval.target_accuracy,
                "epoch evaluated"
            );

            let checkpoint = procedure.save_checkpoint(epoch, &self.checkpoint_dir)?;
            self.write_metadata(epoch, &train, &eval, &checkpoint)?;
            info!(epoch, path = %checkpoint.display(), "saved checkpoint");

            records.push(EpochRecord {
                epoch,
                train,
                eval,
                checkpoint,
            });
        }
        self.enter(RunState::Done);
        Ok(RunReport {
            run_id: self.run_id,
            epochs: records,
            transitions: self.transitions,
        })
    }

    fn write_metadata(
        &self,
        epoch: usize,
        train: &EpochStats,
        eval: &EvalReport,
        checkpoint: &Path,
    ) -> TrainResult<()> {
        let params = checkpoint
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        CheckpointMeta {
            schema_version: CHECKPOINT_SCHEMA_VERSION,
            run_id: self.run_id.clone(),
            epoch,
            model: self.selection.model.clone(),
            source: self.selection.source.clone(),
            target: self.selection.target.clone(),
            params,
            train_loss: train.mean_loss,
            source_accuracy: eval.source_accuracy,
            target_accuracy: eval.target_accuracy,
        }
        .write(&self.checkpoint_dir)?;
        append_metrics(
            &self.checkpoint_dir,
            &MetricsLine {
                run_id: &self.run_id,
                epoch,
                source: &self.selection.source,
                target: &self.selection.target,
                model: &self.selection.model,
                steps: train.steps,
                mean_loss: train.mean_loss,
                mean_class_loss: train.mean_class_loss,
                mean_domain_loss: train.mean_domain_loss,
                lambda: train.lambda,
                source_accuracy: eval.source_accuracy,
                target_accuracy: eval.target_accuracy,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::METRICS_FILE;
    use crate::error::TrainError;

    #[derive(Default)]
    struct Recorder {
        calls: Vec<String>,
        fail_train_at: Option<usize>,
    }

    impl TrainingProcedure for Recorder {
        fn train_epoch(&mut self, epoch: usize) -> TrainResult<EpochStats> {
            self.calls.push(format!("train {epoch}"));
            if self.fail_train_at == Some(epoch) {
                return Err(TrainError::NonFiniteLoss {
                    epoch,
                    step: 0,
                    value: f32::NAN,
                });
            }
            Ok(EpochStats {
                steps: 1,
                mean_loss: 1.0 / epoch as f32,
                ..Default::default()
            })
        }

        fn evaluate(&mut self, epoch: usize) -> TrainResult<EvalReport> {
            self.calls.push(format!("eval {epoch}"));
            Ok(EvalReport {
                source_accuracy: Some(0.5),
                target_accuracy: None,
                ..Default::default()
            })
        }

        fn save_checkpoint(&mut self, epoch: usize, dir: &Path) -> TrainResult<PathBuf> {
            self.calls.push(format!("save {epoch}"));
            Ok(dir.join(format!("model_epoch_{epoch:04}.bin")))
        }
    }

    fn orchestrator(epochs: usize, dir: &Path) -> Orchestrator {
        Orchestrator::new(
            epochs,
            dir.to_path_buf(),
            RunSelection::new("MNIST", "MNIST_M", "model"),
        )
    }

    #[test]
    fn strict_alternation_for_n_epochs() {
        let temp = tempfile::tempdir().unwrap();
        let mut procedure = Recorder::default();
        let report = orchestrator(3, temp.path()).run(&mut procedure).unwrap();

        assert_eq!(
            procedure.calls,
            [
                "train 1", "eval 1", "save 1", "train 2", "eval 2", "save 2", "train 3",
                "eval 3", "save 3"
            ]
        );
        assert_eq!(
            report.transitions,
            [
                RunState::Init,
                RunState::EpochRunning(1),
                RunState::Evaluating(1),
                RunState::EpochRunning(2),
                RunState::Evaluating(2),
                RunState::EpochRunning(3),
                RunState::Evaluating(3),
                RunState::Done,
            ]
        );
        assert_eq!(report.final_state(), RunState::Done);
        assert_eq!(report.epochs.len(), 3);
    }

    #[test]
    fn zero_epochs_goes_straight_to_done() {
        let temp = tempfile::tempdir().unwrap();
        let mut procedure = Recorder::default();
        let report = orchestrator(0, temp.path()).run(&mut procedure).unwrap();
        assert!(procedure.calls.is_empty());
        assert_eq!(report.transitions, [RunState::Init, RunState::Done]);
    }

    #[test]
    fn training_failure_stops_before_evaluation() {
        let temp = tempfile::tempdir().unwrap();
        let mut procedure = Recorder {
            fail_train_at: Some(2),
            ..Default::default()
        };
        let err = orchestrator(3, temp.path()).run(&mut procedure).unwrap_err();
        assert!(matches!(err, TrainError::NonFiniteLoss { epoch: 2, .. }));
        assert_eq!(procedure.calls, ["train 1", "eval 1", "save 1", "train 2"]);
    }

    #[test]
    fn writes_sidecars_and_metrics() {
        let temp = tempfile::tempdir().unwrap();
        let mut procedure = Recorder::default();
        orchestrator(2, temp.path()).run(&mut procedure).unwrap();

        let meta = CheckpointMeta::read(&temp.path().join("model_epoch_0002.json")).unwrap();
        assert_eq!(meta.epoch, 2);
        assert_eq!(meta.params, "model_epoch_0002.bin");
        assert_eq!(meta.source_accuracy, Some(0.5));

        let metrics = std::fs::read_to_string(temp.path().join(METRICS_FILE)).unwrap();
        let lines: Vec<serde_json::Value> = metrics
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["epoch"], 2);
        assert_eq!(lines[0]["target"], "MNIST_M");
        assert_eq!(lines[0]["run_id"], lines[1]["run_id"]);
        assert_eq!(lines[0]["run_id"].as_str(), Some(meta.run_id.as_str()));
    }

    #[test]
    fn runs_sharing_a_directory_are_told_apart() {
        let temp = tempfile::tempdir().unwrap();
        let mut procedure = Recorder::default();
        let first = orchestrator(1, temp.path())
            .with_run_id("run_a")
            .run(&mut procedure)
            .unwrap();
        let second = orchestrator(1, temp.path())
            .with_run_id("run_b")
            .run(&mut procedure)
            .unwrap();
        assert_eq!(first.run_id, "run_a");
        assert_eq!(second.run_id, "run_b");

        let metrics = std::fs::read_to_string(temp.path().join(METRICS_FILE)).unwrap();
        let ids: Vec<String> = metrics
            .lines()
            .map(|l| {
                serde_json::from_str::<serde_json::Value>(l).unwrap()["run_id"]
                    .as_str()
                    .unwrap()
                    .to_string()
            })
            .collect();
        assert_eq!(ids, ["run_a", "run_b"]);

        let meta = CheckpointMeta::read(&temp.path().join("model_epoch_0001.json")).unwrap();
        assert_eq!(meta.run_id, "run_b");
    }
}
