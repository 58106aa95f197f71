use crate::checkpoint::ensure_checkpoint_dir;
use crate::cli::{RunSelection, TrainArgs};
use crate::config::{DatasetSource, ExperimentConfig};
use crate::dann::{sgd, DannProcedure};
use crate::error::TrainResult;
use crate::orchestrator::{Orchestrator, RunReport};
use crate::ADBackend;
use burn::module::AutodiffModule;
use burn::tensor::backend::{AutodiffBackend, Backend};
use domain_dataset::{
    DatasetProvider, DomainDataset, ImageFolderProvider, SyntheticConfig, SyntheticProvider,
};
use models::{DomainAdaptiveModel, ModelKind, MultibranchLeNet, MultibranchLeNetConfig};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// CLI entry point: logging, config, dataset provider, then the run itself.
pub fn run_train(args: TrainArgs) -> anyhow::Result<()> {
    init_tracing();

    let selection = RunSelection::from(args);
    let cfg = ExperimentConfig::load()?;
    let device = <ADBackend as Backend>::Device::default();

    info!(?device, "using device");
    info!("Running with the following configuration");
    for (key, value) in selection.entries() {
        info!("  {key}: {value}");
    }
    info!(
        epochs = cfg.epochs,
        batch_size = cfg.batch_size,
        learning_rate = cfg.learning_rate,
        momentum = cfg.momentum,
        "hyperparameters"
    );

    let provider: Box<dyn DatasetProvider> = match cfg.dataset {
        DatasetSource::ImageFolder => Box::new(ImageFolderProvider::new(&cfg.data_root)),
        DatasetSource::Synthetic => Box::new(SyntheticProvider::new(SyntheticConfig {
            seed: cfg.seed,
            ..Default::default()
        })),
    };

    let report = run_experiment::<ADBackend>(&selection, &cfg, provider.as_ref(), device)?;
    info!(epochs = report.epochs.len(), "training finished");
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    // A subscriber installed by the embedding process wins.
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Resolve the model, load both domains, prepare the checkpoint directory, then train.
///
/// An unknown model name fails before any dataset is read or directory created.
pub fn run_experiment<B: AutodiffBackend>(
    selection: &RunSelection,
    cfg: &ExperimentConfig,
    provider: &dyn DatasetProvider,
    device: B::Device,
) -> TrainResult<RunReport> {
    let kind = ModelKind::from_name(&selection.model)?;
    let (source, target) = load_domains(selection, provider)?;
    let checkpoint_dir = ensure_checkpoint_dir(&cfg.checkpoint_root, selection)?;
    info!(dir = %checkpoint_dir.display(), "checkpoint directory ready");

    B::seed(cfg.seed);
    match kind {
        ModelKind::MultibranchLeNet => {
            let model = MultibranchLeNet::<B>::new(
                MultibranchLeNetConfig {
                    num_classes: source.num_classes,
                    ..Default::default()
                },
                &device,
            );
            train_model::<B, _>(model, selection, cfg, &source, &target, checkpoint_dir, device)
        }
    }
}

pub fn load_domains(
    selection: &RunSelection,
    provider: &dyn DatasetProvider,
) -> TrainResult<(DomainDataset, DomainDataset)> {
    let source = provider.load(&selection.source)?;
    let target = provider.load(&selection.target)?;
    info!(
        source = %source.name,
        source_train = source.train.len(),
        target = %target.name,
        target_train = target.train.len(),
        "domains loaded"
    );
    Ok((source, target))
}

/// Train an already constructed model, checkpointing into `checkpoint_dir` (see
/// [`ensure_checkpoint_dir`]).
pub fn train_model<B, M>(
    model: M,
    selection: &RunSelection,
    cfg: &ExperimentConfig,
    source: &DomainDataset,
    target: &DomainDataset,
    checkpoint_dir: PathBuf,
    device: B::Device,
) -> TrainResult<RunReport>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + DomainAdaptiveModel<B>,
    M::InnerModule: DomainAdaptiveModel<B::InnerBackend>,
{
    let mut procedure = DannProcedure::<B, M, _>::new(
        model,
        sgd::<B, M>(cfg),
        source,
        target,
        cfg,
        selection.model.clone(),
        device,
    );
    info!(
        steps_per_epoch = procedure.steps_per_epoch(),
        pairing = ?cfg.pairing,
        "starting training"
    );
    Orchestrator::new(cfg.epochs, checkpoint_dir, selection.clone()).run(&mut procedure)
}
