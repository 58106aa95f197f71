//! Domain-adversarial training procedure.
//!
//! Each step runs the model on one source batch and one target batch. The objective is the
//! class NLL on source plus the domain NLL on both batches (source = 0, target = 1). The
//! domain head sits behind a gradient-reversal layer, so minimizing the sum trains the
//! domain head to separate domains while pushing shared features toward domain invariance.

use crate::checkpoint::checkpoint_stem;
use crate::config::ExperimentConfig;
use crate::error::{TrainError, TrainResult};
use crate::orchestrator::{EpochStats, TrainingProcedure};
use crate::pairing::PairedBatches;
use burn::module::AutodiffModule;
use burn::optim::adaptor::OptimizerAdaptor;
use burn::optim::momentum::MomentumConfig;
use burn::optim::{GradientsParams, Optimizer, Sgd, SgdConfig};
use burn::record::{BinFileRecorder, FullPrecisionSettings};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::{ElementConversion, Int, Tensor};
use domain_dataset::{BatchIter, DomainBatch, DomainDataset};
use models::{Domain, DomainAdaptiveModel};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Class accuracy per domain on the test splits. `None` when a split is empty or unlabeled.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EvalReport {
    pub source_accuracy: Option<f32>,
    pub target_accuracy: Option<f32>,
    pub source_samples: usize,
    pub target_samples: usize,
}

pub type SgdOptimizer<B, M> = OptimizerAdaptor<Sgd<<B as AutodiffBackend>::InnerBackend>, M, B>;

/// SGD with momentum, the optimizer the harness trains with. A zero momentum gives plain SGD.
pub fn sgd<B, M>(cfg: &ExperimentConfig) -> SgdOptimizer<B, M>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    let momentum = (cfg.momentum > 0.0).then(|| MomentumConfig::new().with_momentum(cfg.momentum));
    SgdConfig::new().with_momentum(momentum).init()
}

/// Mean negative log-likelihood of `targets` under `log_probs` (`[batch, classes]`).
pub fn nll_loss<B: Backend>(log_probs: Tensor<B, 2>, targets: Tensor<B, 1, Int>) -> Tensor<B, 1> {
    let [batch, _] = log_probs.dims();
    log_probs.gather(1, targets.reshape([batch, 1])).mean().neg()
}

pub fn domain_labels<B: Backend>(len: usize, domain: Domain, device: &B::Device) -> Tensor<B, 1, Int> {
    Tensor::<B, 1, Int>::full([len], domain.index() as i64, device)
}

pub(crate) fn finite_loss(value: f32, epoch: usize, step: usize) -> TrainResult<f32> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(TrainError::NonFiniteLoss { epoch, step, value })
    }
}

fn scalar<B: Backend>(tensor: &Tensor<B, 1>) -> f32 {
    tensor.clone().into_scalar().elem::<f32>()
}

#[derive(Debug, Clone, Copy)]
struct StepLosses {
    total: f32,
    class: f32,
    domain: f32,
}

/// Model plus optimizer state; owned exclusively by the procedure.
struct Learner<B, M, O>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    model: M,
    optim: O,
    _backend: std::marker::PhantomData<B>,
}

impl<B, M, O> Learner<B, M, O>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + DomainAdaptiveModel<B>,
    O: Optimizer<M, B>,
{
    fn step(
        &mut self,
        source: DomainBatch<B>,
        target: DomainBatch<B>,
        lambda: f32,
        cfg: &ExperimentConfig,
        epoch: usize,
        step: usize,
    ) -> TrainResult<StepLosses> {
        let labels = source.labels.ok_or(TrainError::UnlabeledSource)?;
        let device = source.images.device();
        let (n_source, n_target) = (source.images.dims()[0], target.images.dims()[0]);

        let src = self
            .model
            .forward_domains(source.images, Domain::Source, lambda);
        let tgt = self
            .model
            .forward_domains(target.images, Domain::Target, lambda);

        let class_loss = nll_loss(src.class_log_probs, labels);
        let domain_loss = nll_loss(
            src.domain_log_probs,
            domain_labels(n_source, Domain::Source, &device),
        ) + nll_loss(
            tgt.domain_log_probs,
            domain_labels(n_target, Domain::Target, &device),
        );
        let loss = class_loss.clone() + domain_loss.clone().mul_scalar(cfg.domain_weight);

        let losses = StepLosses {
            total: finite_loss(scalar(&loss), epoch, step)?,
            class: scalar(&class_loss),
            domain: scalar(&domain_loss),
        };

        // The step consumes this batch's gradients; nothing carries over to the next one.
        let grads = GradientsParams::from_grads(loss.backward(), &self.model);
        self.model = self
            .optim
            .step(cfg.learning_rate, self.model.clone(), grads);
        Ok(losses)
    }
}

/// Train/test iterators for both domains plus the learner.
pub struct DannProcedure<B, M, O>
where
    B: AutodiffBackend,
    M: AutodiffModule<B>,
{
    learner: Learner<B, M, O>,
    source_train: BatchIter,
    target_train: BatchIter,
    source_test: BatchIter,
    target_test: BatchIter,
    cfg: ExperimentConfig,
    model_name: String,
    device: B::Device,
    global_step: usize,
    steps_per_epoch: usize,
}

impl<B, M, O> DannProcedure<B, M, O>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + DomainAdaptiveModel<B>,
    M::InnerModule: DomainAdaptiveModel<B::InnerBackend>,
    O: Optimizer<M, B>,
{
    pub fn new(
        model: M,
        optim: O,
        source: &DomainDataset,
        target: &DomainDataset,
        cfg: &ExperimentConfig,
        model_name: impl Into<String>,
        device: B::Device,
    ) -> Self {
        let source_train = BatchIter::new(source.train.clone(), true, cfg.seed);
        let target_train = BatchIter::new(target.train.clone(), true, cfg.seed.wrapping_add(1));
        let steps_per_epoch = cfg.pairing.steps(
            source_train.batches_per_pass(cfg.batch_size),
            target_train.batches_per_pass(cfg.batch_size),
        );
        Self {
            learner: Learner {
                model,
                optim,
                _backend: std::marker::PhantomData,
            },
            source_train,
            target_train,
            source_test: BatchIter::new(source.test.clone(), false, cfg.seed),
            target_test: BatchIter::new(target.test.clone(), false, cfg.seed),
            cfg: cfg.clone(),
            model_name: model_name.into(),
            device,
            global_step: 0,
            steps_per_epoch,
        }
    }

    pub fn model(&self) -> &M {
        &self.learner.model
    }

    pub fn steps_per_epoch(&self) -> usize {
        self.steps_per_epoch
    }

}

/// Fraction of all scheduled steps already taken, in `[0, 1]`.
fn progress(step: usize, epochs: usize, steps_per_epoch: usize) -> f32 {
    let total = (epochs * steps_per_epoch).max(1);
    (step as f32 / total as f32).min(1.0)
}

impl<B, M, O> TrainingProcedure for DannProcedure<B, M, O>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + DomainAdaptiveModel<B>,
    M::InnerModule: DomainAdaptiveModel<B::InnerBackend>,
    O: Optimizer<M, B>,
{
    fn train_epoch(&mut self, epoch: usize) -> TrainResult<EpochStats> {
        let mut stats = EpochStats::default();
        let (mut class_sum, mut domain_sum) = (0.0f32, 0.0f32);
        let (epochs, steps_per_epoch) = (self.cfg.epochs, self.steps_per_epoch);
        let mut lambda = self
            .cfg
            .adaptation
            .lambda(progress(self.global_step, epochs, steps_per_epoch));
        let mut pairs = PairedBatches::new(
            &mut self.source_train,
            &mut self.target_train,
            self.cfg.batch_size,
            self.cfg.pairing,
        );
        while let Some((source, target)) = pairs.next_pair::<B>(&self.device)? {
            lambda = self
                .cfg
                .adaptation
                .lambda(progress(self.global_step, epochs, steps_per_epoch));
            let losses = self
                .learner
                .step(source, target, lambda, &self.cfg, epoch, stats.steps)?;
            debug!(
                epoch,
                step = stats.steps,
                loss = losses.total,
                class_loss = losses.class,
                domain_loss = losses.domain,
                lambda,
                "train step"
            );
            stats.step_losses.push(losses.total);
            class_sum += losses.class;
            domain_sum += losses.domain;
            stats.steps += 1;
            self.global_step += 1;
        }
        if stats.steps > 0 {
            let n = stats.steps as f32;
            stats.mean_loss = stats.step_losses.iter().sum::<f32>() / n;
            stats.mean_class_loss = class_sum / n;
            stats.mean_domain_loss = domain_sum / n;
        }
        stats.lambda = lambda;
        Ok(stats)
    }

    fn evaluate(&mut self, _epoch: usize) -> TrainResult<EvalReport> {
        let model = self.learner.model.valid();
        let batch_size = self.cfg.batch_size;
        let (source_accuracy, source_samples) = accuracy::<B::InnerBackend, _>(
            &model,
            &mut self.source_test,
            Domain::Source,
            batch_size,
            &self.device,
        )?;
        let (target_accuracy, target_samples) = accuracy::<B::InnerBackend, _>(
            &model,
            &mut self.target_test,
            Domain::Target,
            batch_size,
            &self.device,
        )?;
        Ok(EvalReport {
            source_accuracy,
            target_accuracy,
            source_samples,
            target_samples,
        })
    }

    fn save_checkpoint(&mut self, epoch: usize, dir: &Path) -> TrainResult<PathBuf> {
        let path = dir.join(checkpoint_stem(&self.model_name, epoch));
        let recorder = BinFileRecorder::<FullPrecisionSettings>::new();
        self.learner
            .model
            .clone()
            .save_file(path.clone(), &recorder)
            .map_err(|e| TrainError::CheckpointWrite {
                path: path.clone(),
                msg: e.to_string(),
            })?;
        Ok(path.with_extension("bin"))
    }
}

/// Fraction of correctly classified samples over one full pass of `iter`.
fn accuracy<B, M>(
    model: &M,
    iter: &mut BatchIter,
    domain: Domain,
    batch_size: usize,
    device: &B::Device,
) -> TrainResult<(Option<f32>, usize)>
where
    B: Backend,
    M: DomainAdaptiveModel<B>,
{
    iter.reset();
    let (mut correct, mut seen, mut labeled) = (0usize, 0usize, true);
    while let Some(batch) = iter.next_batch::<B>(batch_size, device)? {
        let n = batch.len();
        seen += n;
        let Some(labels) = batch.labels else {
            labeled = false;
            continue;
        };
        let predicted = model.classify(batch.images, domain).argmax(1).reshape([n]);
        let hits = predicted
            .equal(labels)
            .int()
            .sum()
            .into_scalar()
            .elem::<i64>();
        correct += hits.max(0) as usize;
    }
    let acc = (labeled && seen > 0).then(|| correct as f32 / seen as f32);
    Ok((acc, seen))
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::Autodiff;
    use burn_ndarray::NdArray;
    use domain_dataset::{DatasetProvider, SyntheticConfig, SyntheticProvider};
    use models::{MultibranchLeNet, MultibranchLeNetConfig};

    type ADBackend = Autodiff<NdArray<f32>>;

    fn datasets(train: usize) -> (DomainDataset, DomainDataset) {
        let provider = SyntheticProvider::new(SyntheticConfig {
            train_samples: train,
            test_samples: 4,
            num_classes: 10,
            seed: 3,
        });
        (
            provider.load("MNIST").unwrap(),
            provider.load("MNIST_M").unwrap(),
        )
    }

    type Lenet = MultibranchLeNet<ADBackend>;

    fn new_procedure(
        source: &DomainDataset,
        target: &DomainDataset,
        cfg: &ExperimentConfig,
    ) -> DannProcedure<ADBackend, Lenet, SgdOptimizer<ADBackend, Lenet>> {
        let device = Default::default();
        let model = Lenet::new(MultibranchLeNetConfig::default(), &device);
        DannProcedure::new(model, sgd(cfg), source, target, cfg, "MultibranchLeNet", device)
    }

    fn config() -> ExperimentConfig {
        ExperimentConfig {
            epochs: 1,
            batch_size: 2,
            ..Default::default()
        }
    }

    #[test]
    fn nll_picks_target_log_probs() {
        let device = Default::default();
        let log_probs = Tensor::<NdArray<f32>, 2>::from_floats([[-0.1, -2.0], [-3.0, -0.5]], &device);
        let targets = Tensor::<NdArray<f32>, 1, Int>::from_ints([0, 1], &device);
        let loss = scalar(&nll_loss(log_probs, targets));
        assert!((loss - 0.3).abs() < 1e-6, "loss = {loss}");
    }

    #[test]
    fn non_finite_loss_is_fatal() {
        assert!(finite_loss(0.5, 1, 0).is_ok());
        let err = finite_loss(f32::NAN, 2, 5).unwrap_err();
        assert!(matches!(err, TrainError::NonFiniteLoss { epoch: 2, step: 5, .. }));
        assert!(finite_loss(f32::INFINITY, 1, 0).is_err());
    }

    fn fixed_input_output(model: &Lenet) -> Vec<f32> {
        let device = Default::default();
        let input = Tensor::<ADBackend, 4>::ones([1, 3, 28, 28], &device);
        model
            .classify(input, Domain::Source)
            .into_data()
            .to_vec::<f32>()
            .unwrap()
    }

    #[test]
    fn each_step_uses_only_its_own_gradients() {
        let device = Default::default();
        let (source, target) = datasets(4);
        // Plain SGD keeps no optimizer state, so any carried-over gradient would show up.
        let cfg = ExperimentConfig {
            momentum: 0.0,
            ..config()
        };
        let batches = |ds: &DomainDataset| {
            let mut iter = BatchIter::new(ds.train.clone(), false, 0);
            let mut out = Vec::new();
            while let Some(batch) = iter.next_batch::<ADBackend>(2, &device).unwrap() {
                out.push(batch);
            }
            out.into_iter()
        };
        let learner = |model: Lenet| Learner::<ADBackend, Lenet, _> {
            model,
            optim: sgd::<ADBackend, Lenet>(&cfg),
            _backend: std::marker::PhantomData,
        };

        let (mut src, mut tgt) = (batches(&source), batches(&target));
        let mut continued = learner(Lenet::new(MultibranchLeNetConfig::default(), &device));
        continued
            .step(src.next().unwrap(), tgt.next().unwrap(), 0.5, &cfg, 1, 0)
            .unwrap();
        let mut fresh = learner(continued.model.clone());

        let (mut src_again, mut tgt_again) = (batches(&source), batches(&target));
        let (second_src, second_tgt) = (src_again.nth(1).unwrap(), tgt_again.nth(1).unwrap());
        continued
            .step(src.next().unwrap(), tgt.next().unwrap(), 0.5, &cfg, 1, 1)
            .unwrap();
        fresh.step(second_src, second_tgt, 0.5, &cfg, 1, 1).unwrap();

        let (a, b) = (fixed_input_output(&continued.model), fixed_input_output(&fresh.model));
        for (x, y) in a.iter().zip(&b) {
            assert!((x - y).abs() < 1e-6, "{x} vs {y}");
        }
    }

    #[test]
    fn diverging_step_aborts_with_non_finite_loss() {
        let (source, target) = datasets(6);
        let cfg = ExperimentConfig {
            learning_rate: 1e30,
            ..config()
        };
        let mut procedure = new_procedure(&source, &target, &cfg);
        let err = procedure.train_epoch(1).unwrap_err();
        match err {
            TrainError::NonFiniteLoss { epoch, step, value } => {
                assert_eq!(epoch, 1);
                assert!(step >= 1, "first step runs on the initial weights");
                assert!(!value.is_finite());
            }
            other => panic!("expected NonFiniteLoss, got {other}"),
        }
    }

    #[test]
    fn training_step_changes_parameters() {
        let device = Default::default();
        let (source, target) = datasets(2);
        let cfg = config();
        let model = Lenet::new(MultibranchLeNetConfig::default(), &device);
        let input = Tensor::<ADBackend, 4>::ones([1, 3, 28, 28], &device);
        let before = model
            .classify(input.clone(), Domain::Source)
            .into_data()
            .to_vec::<f32>()
            .unwrap();
        let mut procedure = DannProcedure::<ADBackend, Lenet, _>::new(
            model,
            sgd::<ADBackend, Lenet>(&cfg),
            &source,
            &target,
            &cfg,
            "MultibranchLeNet",
            device,
        );
        procedure.train_epoch(1).unwrap();
        let after = procedure
            .model()
            .classify(input, Domain::Source)
            .into_data()
            .to_vec::<f32>()
            .unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn unlabeled_source_is_rejected() {
        let (_, target) = datasets(2);
        let unlabeled: Vec<_> = target
            .train
            .iter()
            .map(|s| domain_dataset::DomainSample {
                pixels: s.pixels.clone(),
                label: None,
            })
            .collect();
        let source = DomainDataset::new("UNLABELED", 10, unlabeled, Vec::new());
        let cfg = config();
        let mut procedure = new_procedure(&source, &target, &cfg);
        let err = procedure.train_epoch(1).unwrap_err();
        assert!(matches!(err, TrainError::UnlabeledSource));
    }

    #[test]
    fn evaluation_reports_accuracy_in_range() {
        let (source, target) = datasets(2);
        let cfg = config();
        let mut procedure = new_procedure(&source, &target, &cfg);
        let report = procedure.evaluate(1).unwrap();
        assert_eq!(report.source_samples, 4);
        assert_eq!(report.target_samples, 4);
        for acc in [report.source_accuracy, report.target_accuracy] {
            let acc = acc.expect("labeled test split");
            assert!((0.0..=1.0).contains(&acc));
        }
    }
}
