//! Blended SGD: SGD blocks alternating with PSGD blocks.
//!
//! Each cycle runs `sgd_epochs` epochs of SGD, sampling the trajectory into a
//! bounded in-memory window, followed by `psgd_epochs` epochs of PSGD in the
//! subspace of the last `window` samples. The run stops after exactly
//! `epochs` epochs, which may cut the last cycle short.

use std::time::Instant;

use candle_nn::Optimizer;

use crate::config::{Algorithm, BlendConfig, ExperimentConfig};
use crate::error::Result;
use crate::model::Classifier;
use crate::optimizer::{MomentumSgd, ParamsSgd};
use crate::params::ParamLayout;
use crate::pca::SubspaceBasis;
use crate::sampler::SampleManager;

use super::{
    finish_epoch, format_lr, train_psgd_epoch, train_sgd_epoch, Phase, RunSummary, TrainContext,
};

/// Run name of a BSGD run, e.g. `Mlp-BSGD-lr0.1`.
#[must_use]
pub fn run_name(model: &str, lr: f64) -> String {
    format!("{model}-BSGD-lr{}", format_lr(lr))
}

/// Phase assignment of every epoch of a blended run.
///
/// ```rust
/// use subspace_sgd_rs::trainer::{BlendSchedule, Phase};
///
/// let schedule = BlendSchedule::new(2, 1, 5);
/// let phases: Vec<Phase> = schedule.phases().collect();
/// assert_eq!(phases, [Phase::Sgd, Phase::Sgd, Phase::Psgd, Phase::Sgd, Phase::Sgd]);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlendSchedule {
    sgd_epochs: usize,
    psgd_epochs: usize,
    total_epochs: usize,
}

impl BlendSchedule {
    /// Cycles of `sgd_epochs` SGD then `psgd_epochs` PSGD, `total_epochs`
    /// epochs overall. Zero block lengths are treated as one.
    #[must_use]
    pub fn new(sgd_epochs: usize, psgd_epochs: usize, total_epochs: usize) -> Self {
        Self {
            sgd_epochs: sgd_epochs.max(1),
            psgd_epochs: psgd_epochs.max(1),
            total_epochs,
        }
    }

    /// Schedule described by a [`BlendConfig`].
    #[must_use]
    pub fn from_config(blend: &BlendConfig, total_epochs: usize) -> Self {
        Self::new(blend.sgd_epochs, blend.psgd_epochs, total_epochs)
    }

    const fn cycle(&self) -> usize {
        self.sgd_epochs + self.psgd_epochs
    }

    /// Phase of `epoch` (counting from 0).
    #[must_use]
    pub const fn phase(&self, epoch: usize) -> Phase {
        if epoch % self.cycle() < self.sgd_epochs {
            Phase::Sgd
        } else {
            Phase::Psgd
        }
    }

    /// Whether `epoch` opens a PSGD block, i.e. needs a fresh subspace.
    #[must_use]
    pub const fn starts_psgd_block(&self, epoch: usize) -> bool {
        epoch % self.cycle() == self.sgd_epochs
    }

    /// Total number of epochs.
    #[must_use]
    pub const fn total_epochs(&self) -> usize {
        self.total_epochs
    }

    /// Phases of all epochs in order.
    pub fn phases(&self) -> impl Iterator<Item = Phase> + '_ {
        (0..self.total_epochs).map(|epoch| self.phase(epoch))
    }
}

/// Train with alternating SGD and PSGD blocks.
///
/// The SGD optimizer (with weight decay) persists across cycles. Every PSGD
/// block rebuilds the basis from the last `blend.window` samples, projects
/// the parameters onto it and runs with a fresh optimizer without weight
/// decay. When fewer than `window` samples exist the block runs SGD instead.
///
/// # Errors
///
/// Returns an error if a decomposition or training step fails.
pub fn train_bsgd<M: Classifier + ?Sized>(
    config: &ExperimentConfig,
    ctx: &mut TrainContext<'_, M>,
) -> Result<RunSummary> {
    let lr = config.optimizer.learning_rate;
    let blend = &config.blend;
    let schedule = BlendSchedule::from_config(blend, config.epochs);
    let run_name = run_name(ctx.model.name(), lr);

    let layout = ParamLayout::from_var_map(ctx.model.var_map())?;
    let mut sampler = SampleManager::in_memory(
        blend.window,
        config.sampling.strategy,
        config.sampling.frequency,
        ctx.train.len(),
    )?;
    sampler.sample(&layout)?;

    let sgd_params = ParamsSgd::from_settings(&config.optimizer);
    let mut sgd_optimizer = sgd_params.build(ctx.model.var_map())?;
    let mut block: Option<(SubspaceBasis, MomentumSgd)> = None;

    tracing::info!(
        "Run {run_name}: {} SGD + {} PSGD epochs per cycle, window {}, dim {}",
        blend.sgd_epochs,
        blend.psgd_epochs,
        blend.window,
        blend.dim
    );
    let mut summary = RunSummary::new(run_name, Algorithm::Bsgd, layout.num_params());
    let epochs = ctx.progress.epochs(schedule.total_epochs(), &summary.run_name);

    for epoch in 0..schedule.total_epochs() {
        if schedule.starts_psgd_block(epoch) {
            block = None;
            if sampler.available() < blend.window {
                tracing::warn!(
                    "Only {} samples for a window of {}; running SGD instead of PSGD",
                    sampler.available(),
                    blend.window
                );
            } else {
                let w = sampler.last_samples(blend.window, &layout)?;
                let start = Instant::now();
                let basis = SubspaceBasis::from_samples(&w, blend.dim)?;
                summary.pca_seconds.push(start.elapsed().as_secs_f64());
                tracing::info!("W: {:?}", w.dims());
                tracing::info!("Q: {:?}", basis.q().dims());

                layout.set_params(&basis.project(&layout.param_vec()?)?)?;
                let optimizer = sgd_params
                    .without_weight_decay()
                    .build(ctx.model.var_map())?;
                block = Some((basis, optimizer));
            }
        }

        let (phase, learning_rate, stats) = match (schedule.phase(epoch), block.as_mut()) {
            (Phase::Psgd, Some((basis, optimizer))) => {
                let learning_rate = optimizer.learning_rate();
                let stats = train_psgd_epoch(ctx, &layout, optimizer, epoch, basis)?;
                (Phase::Psgd, learning_rate, stats)
            }
            _ => {
                let learning_rate = sgd_optimizer.learning_rate();
                let stats =
                    train_sgd_epoch(ctx, &layout, &mut sgd_optimizer, epoch, Some(&mut sampler))?;
                (Phase::Sgd, learning_rate, stats)
            }
        };
        summary
            .epochs
            .push(finish_epoch(ctx, epoch, phase, learning_rate, stats)?);
        epochs.inc(1);
    }
    epochs.finish_and_clear();

    summary.samples_taken = sampler.taken();
    Ok(summary)
}
