//! Configuration parsing and validation.
//!
//! An experiment is described by a single YAML document. Every section has
//! defaults, so a file only needs the fields it changes.
//!
//! ```yaml
//! algorithm: psgd
//! epochs: 10
//! optimizer:
//!   learning_rate: 0.1
//!   momentum: 0.9
//! subspace:
//!   samples: 40
//!   dim: 10
//!   sample_dir: ./runs/Mlp-SGD-lr0.1-per-epoch-f2
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SubspaceError};

/// Main configuration for a training run.
///
/// # Example
///
/// ```rust
/// use subspace_sgd_rs::{Algorithm, ExperimentConfig};
///
/// # fn main() -> subspace_sgd_rs::Result<()> {
/// let config = ExperimentConfig::from_preset("bsgd")?;
/// assert_eq!(config.algorithm, Algorithm::Bsgd);
/// config.validate()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentConfig {
    /// Training algorithm.
    #[serde(default)]
    pub algorithm: Algorithm,

    /// Total number of training epochs.
    #[serde(default = "default_epochs")]
    pub epochs: usize,

    /// Model architecture.
    #[serde(default)]
    pub model: ModelConfig,

    /// Data source and loader settings.
    #[serde(default)]
    pub data: DataConfig,

    /// Optimizer hyperparameters.
    #[serde(default)]
    pub optimizer: OptimizerSettings,

    /// Learning-rate milestones.
    #[serde(default)]
    pub schedule: ScheduleConfig,

    /// Trajectory sampling during SGD.
    #[serde(default)]
    pub sampling: SamplingConfig,

    /// Fixed subspace used by PSGD.
    #[serde(default)]
    pub subspace: SubspaceConfig,

    /// SGD/PSGD alternation used by BSGD.
    #[serde(default)]
    pub blend: BlendConfig,

    /// Directory receiving sample directories and metric logs.
    #[serde(default = "default_results_dir")]
    pub results_dir: PathBuf,

    /// Compute device.
    #[serde(default)]
    pub device: DeviceKind,

    /// CUDA ordinal used when `device` is `cuda`.
    #[serde(default)]
    pub cuda_device: usize,

    /// Show progress bars.
    #[serde(default = "default_true")]
    pub progress: bool,
}

fn default_epochs() -> usize {
    20
}
fn default_results_dir() -> PathBuf {
    PathBuf::from("./runs")
}
fn default_true() -> bool {
    true
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            algorithm: Algorithm::default(),
            epochs: default_epochs(),
            model: ModelConfig::default(),
            data: DataConfig::default(),
            optimizer: OptimizerSettings::default(),
            schedule: ScheduleConfig::default(),
            sampling: SamplingConfig::default(),
            subspace: SubspaceConfig::default(),
            blend: BlendConfig::default(),
            results_dir: default_results_dir(),
            device: DeviceKind::default(),
            cuda_device: 0,
            progress: true,
        }
    }
}

/// Training algorithm.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Algorithm {
    /// Plain SGD with trajectory sampling.
    #[default]
    Sgd,
    /// SGD restricted to a fixed PCA subspace.
    Psgd,
    /// Blocks of SGD alternating with PSGD in a recomputed subspace.
    Bsgd,
}

impl Algorithm {
    /// Upper-case label used in run names.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Self::Sgd => "SGD",
            Self::Psgd => "PSGD",
            Self::Bsgd => "BSGD",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl FromStr for Algorithm {
    type Err = SubspaceError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "sgd" => Ok(Self::Sgd),
            "psgd" => Ok(Self::Psgd),
            "bsgd" => Ok(Self::Bsgd),
            other => Err(SubspaceError::Config(format!(
                "unknown algorithm `{other}` (expected sgd, psgd or bsgd)"
            ))),
        }
    }
}

/// Compute device kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    /// Host CPU.
    #[default]
    Cpu,
    /// CUDA GPU (requires the `cuda` feature).
    Cuda,
}

/// Multi-layer perceptron classifier settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Widths of the hidden layers.
    #[serde(default = "default_hidden_dims")]
    pub hidden_dims: Vec<usize>,

    /// Number of output classes.
    #[serde(default = "default_num_classes")]
    pub num_classes: usize,
}

fn default_hidden_dims() -> Vec<usize> {
    vec![32]
}
fn default_num_classes() -> usize {
    4
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            hidden_dims: default_hidden_dims(),
            num_classes: default_num_classes(),
        }
    }
}

/// Named benchmark the run imitates; only affects default lr milestones.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatasetKind {
    /// CIFAR-10 schedule.
    Cifar10,
    /// CIFAR-100 schedule.
    Cifar100,
    /// No dataset-specific schedule.
    #[default]
    Custom,
}

/// Where training and test data come from.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum DataSource {
    /// Gaussian clusters, one per class.
    Synthetic {
        /// Number of training examples.
        train_samples: usize,
        /// Number of test examples.
        test_samples: usize,
        /// Feature dimension.
        input_dim: usize,
        /// Standard deviation of each cluster around its centre.
        noise: f32,
    },
    /// Pre-tensorised data: safetensors files with `inputs` and `labels`.
    Safetensors {
        /// Training file.
        train_path: PathBuf,
        /// Test file.
        test_path: PathBuf,
    },
}

impl Default for DataSource {
    fn default() -> Self {
        Self::Synthetic {
            train_samples: 512,
            test_samples: 128,
            input_dim: 8,
            noise: 1.0,
        }
    }
}

/// Data loading settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// Data source.
    #[serde(default)]
    pub source: DataSource,

    /// Benchmark the run imitates.
    #[serde(default)]
    pub dataset: DatasetKind,

    /// Minibatch size.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Reshuffle training data every epoch.
    #[serde(default = "default_true")]
    pub shuffle: bool,

    /// Seed for data generation and shuffling.
    #[serde(default = "default_seed")]
    pub seed: u64,
}

fn default_batch_size() -> usize {
    32
}
fn default_seed() -> u64 {
    42
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            source: DataSource::default(),
            dataset: DatasetKind::default(),
            batch_size: default_batch_size(),
            shuffle: true,
            seed: default_seed(),
        }
    }
}

/// SGD hyperparameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerSettings {
    /// Learning rate.
    #[serde(default = "default_lr")]
    pub learning_rate: f64,

    /// Momentum factor.
    #[serde(default = "default_momentum")]
    pub momentum: f64,

    /// L2 weight decay. Applied by SGD phases only.
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,
}

fn default_lr() -> f64 {
    0.1
}
fn default_momentum() -> f64 {
    0.9
}
fn default_weight_decay() -> f64 {
    1e-4
}

impl Default for OptimizerSettings {
    fn default() -> Self {
        Self {
            learning_rate: default_lr(),
            momentum: default_momentum(),
            weight_decay: default_weight_decay(),
        }
    }
}

/// Multi-step learning-rate schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Apply the schedule (SGD and PSGD only).
    #[serde(default)]
    pub enabled: bool,

    /// Epochs at which the rate is multiplied by `gamma`. When unset the
    /// milestones depend on the algorithm and the dataset kind.
    #[serde(default)]
    pub milestones: Option<Vec<usize>>,

    /// Decay factor.
    #[serde(default = "default_gamma")]
    pub gamma: f64,
}

fn default_gamma() -> f64 {
    0.1
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            milestones: None,
            gamma: default_gamma(),
        }
    }
}

impl ScheduleConfig {
    /// Milestones for the given algorithm and dataset.
    #[must_use]
    pub fn resolve_milestones(&self, algorithm: Algorithm, dataset: DatasetKind) -> Vec<usize> {
        if let Some(milestones) = &self.milestones {
            return milestones.clone();
        }
        match (algorithm, dataset) {
            (Algorithm::Psgd, _) => vec![30],
            (Algorithm::Bsgd, _) | (Algorithm::Sgd, DatasetKind::Custom) => Vec::new(),
            (Algorithm::Sgd, DatasetKind::Cifar10) => vec![100, 150],
            (Algorithm::Sgd, DatasetKind::Cifar100) => vec![150],
        }
    }
}

/// When to snapshot parameters during SGD.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SampleStrategy {
    /// Every `frequency` optimizer steps.
    Interval,
    /// `frequency` evenly spaced snapshots per epoch.
    #[default]
    PerEpoch,
}

impl SampleStrategy {
    /// Name used in sample directory names.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Interval => "interval",
            Self::PerEpoch => "per-epoch",
        }
    }
}

/// Trajectory sampling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingConfig {
    /// Sampling strategy.
    #[serde(default)]
    pub strategy: SampleStrategy,

    /// Strategy parameter (step interval or samples per epoch).
    #[serde(default = "default_frequency")]
    pub frequency: usize,
}

fn default_frequency() -> usize {
    2
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            strategy: SampleStrategy::default(),
            frequency: default_frequency(),
        }
    }
}

/// Fixed subspace used by PSGD.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubspaceConfig {
    /// Number of sampled checkpoints after the initialisation.
    #[serde(default = "default_samples")]
    pub samples: usize,

    /// Subspace dimension.
    #[serde(default = "default_dim")]
    pub dim: usize,

    /// Directory of checkpoints written by an SGD run.
    #[serde(default)]
    pub sample_dir: Option<PathBuf>,
}

fn default_samples() -> usize {
    40
}
fn default_dim() -> usize {
    10
}

impl Default for SubspaceConfig {
    fn default() -> Self {
        Self {
            samples: default_samples(),
            dim: default_dim(),
            sample_dir: None,
        }
    }
}

/// SGD/PSGD alternation used by BSGD.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlendConfig {
    /// SGD epochs per cycle.
    #[serde(default = "default_sgd_epochs")]
    pub sgd_epochs: usize,

    /// PSGD epochs per cycle.
    #[serde(default = "default_psgd_epochs")]
    pub psgd_epochs: usize,

    /// Number of most recent samples entering the PCA.
    #[serde(default = "default_window")]
    pub window: usize,

    /// Subspace dimension.
    #[serde(default = "default_blend_dim")]
    pub dim: usize,
}

fn default_sgd_epochs() -> usize {
    10
}
fn default_psgd_epochs() -> usize {
    1
}
fn default_window() -> usize {
    10
}
fn default_blend_dim() -> usize {
    5
}

impl Default for BlendConfig {
    fn default() -> Self {
        Self {
            sgd_epochs: default_sgd_epochs(),
            psgd_epochs: default_psgd_epochs(),
            window: default_window(),
            dim: default_blend_dim(),
        }
    }
}

impl BlendConfig {
    /// Set SGD epochs per cycle.
    #[must_use]
    pub const fn with_sgd_epochs(mut self, epochs: usize) -> Self {
        self.sgd_epochs = epochs;
        self
    }

    /// Set PSGD epochs per cycle.
    #[must_use]
    pub const fn with_psgd_epochs(mut self, epochs: usize) -> Self {
        self.psgd_epochs = epochs;
        self
    }

    /// Set the PCA window.
    #[must_use]
    pub const fn with_window(mut self, window: usize) -> Self {
        self.window = window;
        self
    }

    /// Set the subspace dimension.
    #[must_use]
    pub const fn with_dim(mut self, dim: usize) -> Self {
        self.dim = dim;
        self
    }
}

impl ExperimentConfig {
    /// Load configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid YAML for
    /// this schema.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Create a configuration from a preset.
    ///
    /// Available presets: `"sgd"`, `"psgd"` and `"bsgd"`. The `psgd` preset
    /// reads the samples written by the `sgd` preset.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown preset name.
    pub fn from_preset(preset: &str) -> Result<Self> {
        match preset {
            "sgd" => Ok(Self::default()),
            "psgd" => {
                let base = Self::default();
                let sample_dir = base.results_dir.join(format!(
                    "Mlp-SGD-lr{}-{}-f{}",
                    base.optimizer.learning_rate,
                    base.sampling.strategy.as_str(),
                    base.sampling.frequency
                ));
                Ok(Self {
                    algorithm: Algorithm::Psgd,
                    epochs: 10,
                    subspace: SubspaceConfig {
                        sample_dir: Some(sample_dir),
                        ..SubspaceConfig::default()
                    },
                    ..base
                })
            }
            "bsgd" => Ok(Self {
                algorithm: Algorithm::Bsgd,
                epochs: 22,
                ..Self::default()
            }),
            other => Err(SubspaceError::Config(format!(
                "unknown preset `{other}` (expected sgd, psgd or bsgd)"
            ))),
        }
    }

    /// Set the algorithm.
    #[must_use]
    pub const fn with_algorithm(mut self, algorithm: Algorithm) -> Self {
        self.algorithm = algorithm;
        self
    }

    /// Set the number of epochs.
    #[must_use]
    pub const fn with_epochs(mut self, epochs: usize) -> Self {
        self.epochs = epochs;
        self
    }

    /// Set the results directory.
    #[must_use]
    pub fn with_results_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.results_dir = dir.into();
        self
    }

    /// Enable or disable progress bars.
    #[must_use]
    pub const fn with_progress(mut self, progress: bool) -> Self {
        self.progress = progress;
        self
    }

    /// Validate configuration.
    ///
    /// # Errors
    ///
    /// Returns [`SubspaceError::Config`] describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        fn fail<T>(msg: &str) -> Result<T> {
            Err(SubspaceError::Config(msg.into()))
        }

        if self.epochs == 0 {
            return fail("epochs must be > 0");
        }
        if self.model.num_classes < 2 {
            return fail("model.num_classes must be >= 2");
        }
        if self.model.hidden_dims.iter().any(|&d| d == 0) {
            return fail("model.hidden_dims must be > 0");
        }
        if self.data.batch_size == 0 {
            return fail("data.batch_size must be > 0");
        }
        if let DataSource::Synthetic {
            train_samples,
            test_samples,
            input_dim,
            noise,
        } = &self.data.source
        {
            if *train_samples == 0 || *test_samples == 0 {
                return fail("synthetic data needs train_samples and test_samples > 0");
            }
            if *input_dim == 0 {
                return fail("synthetic data needs input_dim > 0");
            }
            if !noise.is_finite() || *noise < 0.0 {
                return fail("synthetic data noise must be finite and >= 0");
            }
        }
        if !(self.optimizer.learning_rate > 0.0) {
            return fail("optimizer.learning_rate must be > 0");
        }
        if !(0.0..1.0).contains(&self.optimizer.momentum) {
            return fail("optimizer.momentum must be in [0, 1)");
        }
        if self.optimizer.weight_decay < 0.0 {
            return fail("optimizer.weight_decay must be >= 0");
        }
        if !(self.schedule.gamma > 0.0 && self.schedule.gamma <= 1.0) {
            return fail("schedule.gamma must be in (0, 1]");
        }
        if self.sampling.frequency == 0 {
            return fail("sampling.frequency must be > 0");
        }

        match self.algorithm {
            Algorithm::Sgd => {}
            Algorithm::Psgd => {
                if self.subspace.sample_dir.is_none() {
                    return fail("subspace.sample_dir is required for psgd");
                }
                if self.subspace.dim == 0 {
                    return fail("subspace.dim must be > 0");
                }
                if self.subspace.dim > self.subspace.samples + 1 {
                    return fail("subspace.dim must be <= subspace.samples + 1");
                }
            }
            Algorithm::Bsgd => {
                if self.blend.sgd_epochs == 0 || self.blend.psgd_epochs == 0 {
                    return fail("blend.sgd_epochs and blend.psgd_epochs must be > 0");
                }
                if self.blend.window < 2 {
                    return fail("blend.window must be >= 2");
                }
                if self.blend.dim == 0 || self.blend.dim > self.blend.window {
                    return fail("blend.dim must be in 1..=blend.window");
                }
            }
        }

        Ok(())
    }
}
