//! Training drivers.
//!
//! Three drivers share one minibatch loop:
//!
//! - [`sgd::train_sgd`] runs plain SGD and writes trajectory samples to disk.
//! - [`psgd::train_psgd`] restricts SGD to a fixed subspace built from those
//!   samples.
//! - [`bsgd::train_bsgd`] alternates SGD blocks with PSGD blocks whose
//!   subspace is rebuilt from the most recent samples.
//!
//! [`Trainer`] picks the device, loads data, builds the model and dispatches
//! on [`ExperimentConfig::algorithm`].

pub mod bsgd;
pub mod psgd;
pub mod sgd;

use std::path::{Path, PathBuf};
use std::time::Instant;

use candle_core::Device;
use candle_nn::Optimizer;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};

use crate::config::{Algorithm, DeviceKind, ExperimentConfig};
use crate::dataset::{load_datasets, DataLoader};
use crate::error::Result;
use crate::evaluator::{Evaluation, Evaluator};
use crate::metrics::{RunLog, EPOCH_TIME, LOSS};
use crate::model::{Classifier, Mlp};
use crate::optimizer::MomentumSgd;
use crate::params::ParamLayout;
use crate::pca::SubspaceBasis;
use crate::sampler::SampleManager;

pub use bsgd::{BlendSchedule, train_bsgd};
pub use psgd::train_psgd;
pub use sgd::train_sgd;

/// How an epoch updated the parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Unrestricted SGD.
    Sgd,
    /// SGD with gradients projected onto a subspace.
    Psgd,
}

/// Outcome of one training epoch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochStats {
    /// Optimizer steps taken.
    pub steps: usize,
    /// Mean minibatch loss.
    pub mean_loss: f64,
    /// Wall-clock seconds.
    pub seconds: f64,
}

/// Per-epoch entry of a [`RunSummary`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpochReport {
    /// Epoch number, counting from 1.
    pub epoch: usize,
    /// Update rule used.
    pub phase: Phase,
    /// Learning rate during the epoch.
    pub learning_rate: f64,
    /// Training statistics.
    pub train: EpochStats,
    /// Test-set evaluation after the epoch.
    pub test: Evaluation,
}

/// Result of a complete run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    /// Run name, e.g. `Mlp-SGD-lr0.1`.
    pub run_name: String,
    /// Driver that produced the run.
    pub algorithm: Algorithm,
    /// Number of scalar model parameters.
    pub num_params: usize,
    /// One entry per epoch.
    pub epochs: Vec<EpochReport>,
    /// Seconds spent in each subspace decomposition.
    pub pca_seconds: Vec<f64>,
    /// Directory holding trajectory samples (SGD only).
    pub sample_dir: Option<PathBuf>,
    /// Trajectory samples taken, including the initialisation.
    pub samples_taken: usize,
}

impl RunSummary {
    pub(crate) fn new(run_name: String, algorithm: Algorithm, num_params: usize) -> Self {
        Self {
            run_name,
            algorithm,
            num_params,
            epochs: Vec::new(),
            pca_seconds: Vec::new(),
            sample_dir: None,
            samples_taken: 0,
        }
    }

    /// Evaluation after the last epoch.
    #[must_use]
    pub fn final_evaluation(&self) -> Option<Evaluation> {
        self.epochs.last().map(|e| e.test)
    }

    /// Write the summary as pretty-printed JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Read a summary written by [`RunSummary::save`].
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// Everything a driver needs besides its configuration.
pub struct TrainContext<'a, M: Classifier + ?Sized> {
    /// Model being trained.
    pub model: &'a M,
    /// Training minibatches.
    pub train: &'a DataLoader,
    /// Test-set evaluator.
    pub evaluator: &'a Evaluator,
    /// Metric stream.
    pub log: &'a mut RunLog,
    /// Progress display.
    pub progress: &'a Progress,
}

/// Nested epoch/minibatch progress bars, hidden when disabled.
#[derive(Debug)]
pub struct Progress {
    multi: Option<MultiProgress>,
}

impl Progress {
    /// Visible progress bars when `enabled`.
    #[must_use]
    pub fn new(enabled: bool) -> Self {
        Self {
            multi: enabled.then(MultiProgress::new),
        }
    }

    /// Progress bars that draw nothing.
    #[must_use]
    pub fn hidden() -> Self {
        Self::new(false)
    }

    /// Outer bar over `epochs`.
    #[must_use]
    pub fn epochs(&self, epochs: usize, run_name: &str) -> ProgressBar {
        self.bar(
            epochs,
            "{msg} [{elapsed_precise}] [{wide_bar:.cyan/blue}] epoch {pos}/{len}",
        )
        .with_message(run_name.to_string())
    }

    /// Inner bar over the minibatches of one epoch.
    #[must_use]
    pub fn batches(&self, batches: usize) -> ProgressBar {
        self.bar(
            batches,
            "{spinner:.green} [{wide_bar:.green/white}] {pos:>5}/{len:5} loss {msg}",
        )
    }

    fn bar(&self, len: usize, template: &str) -> ProgressBar {
        let Some(multi) = &self.multi else {
            return ProgressBar::hidden();
        };
        let style = ProgressStyle::default_bar()
            .template(template)
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-");
        multi.add(ProgressBar::new(len as u64).with_style(style))
    }
}

/// Run one SGD epoch, advancing `sampler` after every step when given.
///
/// # Errors
///
/// Returns an error if a forward/backward pass, the optimizer step or
/// sampling fails.
pub fn train_sgd_epoch<M: Classifier + ?Sized>(
    ctx: &mut TrainContext<'_, M>,
    layout: &ParamLayout,
    optimizer: &mut MomentumSgd,
    epoch: usize,
    sampler: Option<&mut SampleManager>,
) -> Result<EpochStats> {
    run_epoch(ctx, layout, optimizer, epoch, None, sampler)
}

/// Run one PSGD epoch: every gradient is replaced by its projection onto
/// `basis` before the optimizer step.
///
/// # Errors
///
/// Returns an error if a forward/backward pass, the projection or the
/// optimizer step fails.
pub fn train_psgd_epoch<M: Classifier + ?Sized>(
    ctx: &mut TrainContext<'_, M>,
    layout: &ParamLayout,
    optimizer: &mut MomentumSgd,
    epoch: usize,
    basis: &SubspaceBasis,
) -> Result<EpochStats> {
    run_epoch(ctx, layout, optimizer, epoch, Some(basis), None)
}

#[allow(clippy::cast_precision_loss)]
fn run_epoch<M: Classifier + ?Sized>(
    ctx: &mut TrainContext<'_, M>,
    layout: &ParamLayout,
    optimizer: &mut MomentumSgd,
    epoch: usize,
    basis: Option<&SubspaceBasis>,
    mut sampler: Option<&mut SampleManager>,
) -> Result<EpochStats> {
    let start = Instant::now();
    let bar = ctx.progress.batches(ctx.train.len());
    let mut steps = 0usize;
    let mut loss_sum = 0.0f64;

    for batch in ctx.train.iter(epoch) {
        let batch = batch?;
        let logits = ctx.model.forward(&batch.inputs)?;
        let loss = candle_nn::loss::cross_entropy(&logits, &batch.labels)?;

        let mut grads = loss.backward()?;
        if let Some(basis) = basis {
            let grad = layout.grad_vec(&grads)?;
            layout.set_grads(&mut grads, &basis.project(&grad)?)?;
        }
        optimizer.step(&grads)?;

        let loss = f64::from(loss.to_scalar::<f32>()?);
        ctx.log.log(LOSS, loss)?;
        loss_sum += loss;
        steps += 1;

        if let Some(sampler) = sampler.as_deref_mut() {
            sampler.step(layout)?;
        }

        bar.set_message(format!("{loss:.4}"));
        bar.inc(1);
    }
    bar.finish_and_clear();

    let seconds = start.elapsed().as_secs_f64();
    ctx.log.log(EPOCH_TIME, seconds)?;
    let mean_loss = if steps == 0 { 0.0 } else { loss_sum / steps as f64 };
    tracing::debug!(epoch, steps, mean_loss, seconds, "epoch finished");

    Ok(EpochStats {
        steps,
        mean_loss,
        seconds,
    })
}

/// Resolve the configured device, falling back to CPU when CUDA is
/// unavailable.
#[must_use]
pub fn select_device(kind: DeviceKind, ordinal: usize) -> Device {
    match kind {
        DeviceKind::Cpu => Device::Cpu,
        DeviceKind::Cuda if cfg!(feature = "cuda") => match Device::cuda_if_available(ordinal) {
            Ok(device @ Device::Cuda(_)) => {
                tracing::info!("Training device: CUDA (device {})", ordinal);
                device
            }
            Ok(_) => {
                tracing::warn!("CUDA not available; falling back to CPU");
                Device::Cpu
            }
            Err(err) => {
                tracing::warn!("CUDA init failed ({err}); falling back to CPU");
                Device::Cpu
            }
        },
        DeviceKind::Cuda => {
            tracing::warn!("CUDA feature disabled; falling back to CPU. Enable with --features cuda.");
            Device::Cpu
        }
    }
}

/// Experiment orchestrator.
///
/// # Example
///
/// ```no_run
/// use subspace_sgd_rs::{ExperimentConfig, Trainer};
///
/// # fn main() -> subspace_sgd_rs::Result<()> {
/// let config = ExperimentConfig::from_file("sgd.yaml")?;
/// let mut trainer = Trainer::new(config)?;
/// let summary = trainer.train()?;
/// println!("{} finished after {} epochs", summary.run_name, summary.epochs.len());
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct Trainer {
    config: ExperimentConfig,
    device: Device,
    log: RunLog,
}

impl Trainer {
    /// Create a new trainer.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(config: ExperimentConfig) -> Result<Self> {
        config.validate()?;
        let device = select_device(config.device, config.cuda_device);
        Ok(Self {
            config,
            device,
            log: RunLog::new(),
        })
    }

    /// Replace the metric stream, e.g. to add sinks.
    #[must_use]
    pub fn with_run_log(mut self, log: RunLog) -> Self {
        self.log = log;
        self
    }

    /// Configuration in use.
    #[must_use]
    pub const fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    /// Compute device.
    #[must_use]
    pub const fn device(&self) -> &Device {
        &self.device
    }

    /// Name of the run this configuration produces, e.g. `Mlp-SGD-lr0.1`.
    #[must_use]
    pub fn run_name(&self) -> String {
        let lr = self.config.optimizer.learning_rate;
        match self.config.algorithm {
            Algorithm::Sgd => sgd::run_name(Mlp::NAME, lr),
            Algorithm::Psgd => psgd::run_name(
                Mlp::NAME,
                lr,
                self.config.subspace.dim,
                self.config.subspace.samples,
            ),
            Algorithm::Bsgd => bsgd::run_name(Mlp::NAME, lr),
        }
    }

    /// Metrics logged so far.
    #[must_use]
    pub const fn run_log(&self) -> &RunLog {
        &self.log
    }

    /// Load data, build the model and run the configured driver. The summary
    /// is also written to `{results_dir}/{run_name}.json`.
    ///
    /// # Errors
    ///
    /// Returns an error if data loading, model construction or training
    /// fails.
    pub fn train(&mut self) -> Result<RunSummary> {
        let config = &self.config;
        tracing::info!("Starting {} training", config.algorithm);
        tracing::info!("  Epochs: {}", config.epochs);
        tracing::info!("  Learning rate: {}", config.optimizer.learning_rate);

        let (train, test) = load_datasets(&config.data, config.model.num_classes, &self.device)?;
        tracing::info!(
            "Loaded {} training and {} test examples",
            train.len(),
            test.len()
        );

        let model = Mlp::new(train.input_dim(), &config.model, &self.device)?;
        tracing::info!("Model {} with {} parameters", model.name(), model.parameter_count());

        let batch_size = config.data.batch_size;
        let train = DataLoader::new(train, batch_size, config.data.shuffle, config.data.seed);
        let evaluator = Evaluator::new(test, batch_size);
        let progress = Progress::new(config.progress);

        std::fs::create_dir_all(&config.results_dir)?;

        let mut ctx = TrainContext {
            model: &model,
            train: &train,
            evaluator: &evaluator,
            log: &mut self.log,
            progress: &progress,
        };
        let summary = match config.algorithm {
            Algorithm::Sgd => train_sgd(config, &mut ctx)?,
            Algorithm::Psgd => train_psgd(config, &mut ctx)?,
            Algorithm::Bsgd => train_bsgd(config, &mut ctx)?,
        };
        self.log.flush()?;

        let path = config.results_dir.join(format!("{}.json", summary.run_name));
        summary.save(&path)?;
        tracing::info!("Run summary written to {}", path.display());

        Ok(summary)
    }
}

/// Log the closing line of an epoch and turn it into a report.
pub(crate) fn finish_epoch<M: Classifier + ?Sized>(
    ctx: &mut TrainContext<'_, M>,
    epoch: usize,
    phase: Phase,
    learning_rate: f64,
    train: EpochStats,
) -> Result<EpochReport> {
    let test = ctx.evaluator.eval_model(ctx.model, ctx.log)?;
    tracing::info!(
        "Epoch {} ({:?}): train loss {:.4}, test loss {:.4}, test accuracy {:.2}%",
        epoch + 1,
        phase,
        train.mean_loss,
        test.loss,
        test.accuracy * 100.0
    );
    Ok(EpochReport {
        epoch: epoch + 1,
        phase,
        learning_rate,
        train,
        test,
    })
}

/// Format a learning rate the way run names expect (`0.1`, `0.05`).
pub(crate) fn format_lr(lr: f64) -> String {
    format!("{lr}")
}

#[cfg(test)]
pub(crate) mod testing {
    use candle_core::Device;

    use crate::config::ModelConfig;
    use crate::dataset::{DataLoader, SyntheticClusters};
    use crate::evaluator::Evaluator;
    use crate::model::Mlp;

    pub fn fixture() -> (Mlp, DataLoader, Evaluator) {
        let generator = SyntheticClusters {
            input_dim: 4,
            num_classes: 3,
            noise: 0.3,
            seed: 11,
        };
        let train = generator.generate(48, 0, &Device::Cpu).unwrap();
        let test = generator.generate(24, 1, &Device::Cpu).unwrap();
        let model = Mlp::new(
            4,
            &ModelConfig {
                hidden_dims: vec![8],
                num_classes: 3,
            },
            &Device::Cpu,
        )
        .unwrap();
        (model, DataLoader::new(train, 8, true, 11), Evaluator::new(test, 8))
    }
}
