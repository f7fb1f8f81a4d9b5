//! SGD restricted to a fixed subspace.

use candle_nn::Optimizer;

use crate::checkpoint::CheckpointStore;
use crate::config::{Algorithm, ExperimentConfig};
use crate::error::{Result, SubspaceError};
use crate::model::Classifier;
use crate::optimizer::ParamsSgd;
use crate::params::ParamLayout;
use crate::pca::get_subspace;
use crate::scheduler::MultiStepScheduler;

use super::{finish_epoch, format_lr, train_psgd_epoch, Phase, RunSummary, TrainContext};

/// Run name of a PSGD run, e.g. `Mlp-PSGD-lr0.1-d10-s40`.
#[must_use]
pub fn run_name(model: &str, lr: f64, dim: usize, samples: usize) -> String {
    format!("{model}-PSGD-lr{}-d{dim}-s{samples}", format_lr(lr))
}

/// Train inside the subspace spanned by an earlier SGD trajectory.
///
/// The basis comes from checkpoints `0..=subspace.samples` of
/// `subspace.sample_dir`. Training restarts from checkpoint 0 projected onto
/// the subspace, and every gradient is projected before the update, so the
/// parameters never leave `span(Q)`.
///
/// # Errors
///
/// Returns an error if the sample directory or a checkpoint is missing, the
/// decomposition fails, or training fails.
pub fn train_psgd<M: Classifier + ?Sized>(
    config: &ExperimentConfig,
    ctx: &mut TrainContext<'_, M>,
) -> Result<RunSummary> {
    let lr = config.optimizer.learning_rate;
    let subspace = &config.subspace;
    let run_name = run_name(ctx.model.name(), lr, subspace.dim, subspace.samples);

    let sample_dir = subspace.sample_dir.as_ref().ok_or_else(|| {
        SubspaceError::Config("subspace.sample_dir is required for psgd".into())
    })?;
    let store = CheckpointStore::open(sample_dir, ctx.train.dataset().device())?;
    let layout = ParamLayout::from_var_map(ctx.model.var_map())?;

    let (basis, pca_time) = get_subspace(&store, &layout, subspace.samples, subspace.dim)?;

    store.load_into(0, &layout)?;
    layout.set_params(&basis.project(&layout.param_vec()?)?)?;

    let mut optimizer = ParamsSgd::from_settings(&config.optimizer)
        .without_weight_decay()
        .build(ctx.model.var_map())?;
    let mut scheduler = config.schedule.enabled.then(|| {
        MultiStepScheduler::new(
            lr,
            config
                .schedule
                .resolve_milestones(Algorithm::Psgd, config.data.dataset),
            config.schedule.gamma,
        )
    });

    tracing::info!(
        "Run {run_name}: {} parameters in a {}-dimensional subspace",
        layout.num_params(),
        basis.dim()
    );
    let mut summary = RunSummary::new(run_name, Algorithm::Psgd, layout.num_params());
    summary.pca_seconds.push(pca_time.as_secs_f64());
    let epochs = ctx.progress.epochs(config.epochs, &summary.run_name);

    for epoch in 0..config.epochs {
        let learning_rate = optimizer.learning_rate();
        let stats = train_psgd_epoch(ctx, &layout, &mut optimizer, epoch, &basis)?;
        let report = finish_epoch(ctx, epoch, Phase::Psgd, learning_rate, stats)?;
        summary.epochs.push(report);

        if let Some(scheduler) = scheduler.as_mut() {
            scheduler.step(&mut optimizer);
        }
        epochs.inc(1);
    }
    epochs.finish_and_clear();

    Ok(summary)
}
