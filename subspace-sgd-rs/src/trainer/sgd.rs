//! Plain SGD with trajectory sampling.

use candle_nn::Optimizer;

use crate::checkpoint::CheckpointStore;
use crate::config::{Algorithm, ExperimentConfig};
use crate::error::{Result, SubspaceError};
use crate::model::Classifier;
use crate::optimizer::ParamsSgd;
use crate::params::ParamLayout;
use crate::sampler::SampleManager;
use crate::scheduler::MultiStepScheduler;

use super::{finish_epoch, format_lr, train_sgd_epoch, Phase, RunSummary, TrainContext};

/// Run name of an SGD run, e.g. `Mlp-SGD-lr0.1`.
#[must_use]
pub fn run_name(model: &str, lr: f64) -> String {
    format!("{model}-SGD-lr{}", format_lr(lr))
}

/// Train with SGD, saving the initialisation and every trajectory sample as
/// numbered checkpoints under
/// `{results_dir}/{run_name}-{strategy}-f{frequency}`.
///
/// # Errors
///
/// Returns [`SubspaceError::RunExists`] if the sample directory already
/// exists, or any error raised while training.
pub fn train_sgd<M: Classifier + ?Sized>(
    config: &ExperimentConfig,
    ctx: &mut TrainContext<'_, M>,
) -> Result<RunSummary> {
    let lr = config.optimizer.learning_rate;
    let run_name = run_name(ctx.model.name(), lr);

    let sampling = &config.sampling;
    let sample_dir = config.results_dir.join(format!(
        "{run_name}-{}-f{}",
        sampling.strategy.as_str(),
        sampling.frequency
    ));
    if sample_dir.exists() {
        return Err(SubspaceError::RunExists(sample_dir));
    }

    SampleManager::check_cadence(sampling.frequency, ctx.train.len())?;
    let layout = ParamLayout::from_var_map(ctx.model.var_map())?;
    let store = CheckpointStore::create(&sample_dir, ctx.train.dataset().device())?;
    let mut sampler =
        SampleManager::to_disk(store, sampling.strategy, sampling.frequency, ctx.train.len())?;
    sampler.sample(&layout)?;

    let mut optimizer = ParamsSgd::from_settings(&config.optimizer).build(ctx.model.var_map())?;
    let mut scheduler = config.schedule.enabled.then(|| {
        MultiStepScheduler::new(
            lr,
            config
                .schedule
                .resolve_milestones(Algorithm::Sgd, config.data.dataset),
            config.schedule.gamma,
        )
    });

    tracing::info!("Run {run_name}: sampling into {}", sample_dir.display());
    let mut summary = RunSummary::new(run_name, Algorithm::Sgd, layout.num_params());
    let epochs = ctx.progress.epochs(config.epochs, &summary.run_name);

    for epoch in 0..config.epochs {
        let learning_rate = optimizer.learning_rate();
        let stats = train_sgd_epoch(ctx, &layout, &mut optimizer, epoch, Some(&mut sampler))?;
        let report = finish_epoch(ctx, epoch, Phase::Sgd, learning_rate, stats)?;
        summary.epochs.push(report);

        if let Some(scheduler) = scheduler.as_mut() {
            scheduler.step(&mut optimizer);
        }
        epochs.inc(1);
    }
    epochs.finish_and_clear();

    tracing::info!("Took {} samples", sampler.taken());
    summary.samples_taken = sampler.taken();
    summary.sample_dir = Some(sample_dir);
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::{DataLoader, SyntheticClusters};
    use crate::metrics::{RunLog, TEST_LOSS};
    use crate::trainer::testing::fixture;
    use crate::trainer::Progress;
    use tempfile::TempDir;

    fn config(results_dir: &std::path::Path) -> ExperimentConfig {
        ExperimentConfig::default()
            .with_epochs(2)
            .with_results_dir(results_dir)
            .with_progress(false)
    }

    #[test]
    fn test_run_name() {
        assert_eq!(run_name("Mlp", 0.1), "Mlp-SGD-lr0.1");
    }

    #[test]
    fn test_sgd_writes_init_and_samples() {
        let tmp = TempDir::new().unwrap();
        let config = config(tmp.path());
        let (model, train, evaluator) = fixture();
        let mut log = RunLog::new();
        let progress = Progress::hidden();
        let mut ctx = TrainContext {
            model: &model,
            train: &train,
            evaluator: &evaluator,
            log: &mut log,
            progress: &progress,
        };

        let summary = train_sgd(&config, &mut ctx).unwrap();
        // init + 2 per epoch
        assert_eq!(summary.samples_taken, 5);
        assert_eq!(summary.epochs.len(), 2);

        let dir = summary.sample_dir.unwrap();
        assert!(dir.ends_with("Mlp-SGD-lr0.1-per-epoch-f2"));
        let store = CheckpointStore::open(&dir, &candle_core::Device::Cpu).unwrap();
        assert_eq!(store.count(), 5);
        assert_eq!(log.history().values(TEST_LOSS).len(), 2);
    }

    #[test]
    fn test_sgd_refuses_existing_sample_dir() {
        let tmp = TempDir::new().unwrap();
        let config = config(tmp.path());
        std::fs::create_dir_all(tmp.path().join("Mlp-SGD-lr0.1-per-epoch-f2")).unwrap();

        let (model, train, evaluator) = fixture();
        let mut log = RunLog::new();
        let progress = Progress::hidden();
        let mut ctx = TrainContext {
            model: &model,
            train: &train,
            evaluator: &evaluator,
            log: &mut log,
            progress: &progress,
        };
        assert!(matches!(
            train_sgd(&config, &mut ctx),
            Err(SubspaceError::RunExists(_))
        ));
    }

    #[test]
    fn test_empty_training_set_leaves_no_sample_dir() {
        let tmp = TempDir::new().unwrap();
        let config = config(tmp.path());
        let (model, _, evaluator) = fixture();
        let empty = SyntheticClusters {
            input_dim: 4,
            num_classes: 3,
            noise: 0.3,
            seed: 11,
        }
        .generate(0, 0, &candle_core::Device::Cpu)
        .unwrap();
        let train = DataLoader::new(empty, 8, true, 11);
        let mut log = RunLog::new();
        let progress = Progress::hidden();
        let mut ctx = TrainContext {
            model: &model,
            train: &train,
            evaluator: &evaluator,
            log: &mut log,
            progress: &progress,
        };

        assert!(matches!(
            train_sgd(&config, &mut ctx),
            Err(SubspaceError::Config(_))
        ));
        assert!(!tmp.path().join("Mlp-SGD-lr0.1-per-epoch-f2").exists());
    }
}
