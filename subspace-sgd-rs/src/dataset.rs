//! Dataset loading and minibatch iteration.
//!
//! A [`Dataset`] is a pair of tensors: `inputs` (`N × D`, f32) and `labels`
//! (`N`, u32). [`DataLoader`] slices it into minibatches, reshuffling with a
//! seeded RNG every epoch so runs are reproducible.

use std::collections::HashMap;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};

use crate::config::{DataConfig, DataSource};
use crate::error::{Result, SubspaceError};

const INPUTS_KEY: &str = "inputs";
const LABELS_KEY: &str = "labels";

/// Labelled examples held as two tensors.
#[derive(Debug, Clone)]
pub struct Dataset {
    inputs: Tensor,
    labels: Tensor,
}

impl Dataset {
    /// Create a dataset, checking that the tensors agree.
    ///
    /// # Errors
    ///
    /// Returns [`SubspaceError::Dataset`] if `inputs` is not rank 2, `labels`
    /// is not a rank-1 u32 tensor, or their lengths differ.
    pub fn new(inputs: Tensor, labels: Tensor) -> Result<Self> {
        if inputs.rank() != 2 {
            return Err(SubspaceError::Dataset(format!(
                "inputs must be rank 2, got shape {:?}",
                inputs.dims()
            )));
        }
        if labels.rank() != 1 || labels.dtype() != DType::U32 {
            return Err(SubspaceError::Dataset(format!(
                "labels must be a rank-1 u32 tensor, got {:?} {:?}",
                labels.dtype(),
                labels.dims()
            )));
        }
        if inputs.dim(0)? != labels.dim(0)? {
            return Err(SubspaceError::Dataset(format!(
                "{} inputs but {} labels",
                inputs.dim(0)?,
                labels.dim(0)?
            )));
        }
        let inputs = inputs.to_dtype(DType::F32)?;
        Ok(Self { inputs, labels })
    }

    /// Load a dataset stored as safetensors with `inputs` and `labels`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing, unreadable, or lacks either key.
    pub fn load_safetensors<P: AsRef<Path>>(path: P, device: &Device) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(SubspaceError::Dataset(format!(
                "dataset file not found: {}",
                path.display()
            )));
        }
        let mut tensors = candle_core::safetensors::load(path, device)?;
        let inputs = tensors.remove(INPUTS_KEY).ok_or_else(|| {
            SubspaceError::Dataset(format!("{} has no `{INPUTS_KEY}` tensor", path.display()))
        })?;
        let labels = tensors.remove(LABELS_KEY).ok_or_else(|| {
            SubspaceError::Dataset(format!("{} has no `{LABELS_KEY}` tensor", path.display()))
        })?;
        Self::new(inputs, labels)
    }

    /// Save the dataset in the layout read by [`Dataset::load_safetensors`].
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn save_safetensors<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut tensors = HashMap::new();
        tensors.insert(INPUTS_KEY.to_string(), self.inputs.clone());
        tensors.insert(LABELS_KEY.to_string(), self.labels.clone());
        candle_core::safetensors::save(&tensors, path)?;
        Ok(())
    }

    /// Number of examples.
    #[must_use]
    pub fn len(&self) -> usize {
        self.labels.dims()[0]
    }

    /// Whether the dataset has no examples.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Feature dimension.
    #[must_use]
    pub fn input_dim(&self) -> usize {
        self.inputs.dims()[1]
    }

    /// Input features.
    #[must_use]
    pub const fn inputs(&self) -> &Tensor {
        &self.inputs
    }

    /// Class labels.
    #[must_use]
    pub const fn labels(&self) -> &Tensor {
        &self.labels
    }

    /// Device holding the tensors.
    #[must_use]
    pub fn device(&self) -> &Device {
        self.inputs.device()
    }
}

/// Gaussian clusters, one per class, with centres drawn from the seed.
///
/// Train and test splits generated from the same generator share centres.
#[derive(Debug, Clone)]
pub struct SyntheticClusters {
    /// Feature dimension.
    pub input_dim: usize,
    /// Number of classes.
    pub num_classes: usize,
    /// Standard deviation around each centre.
    pub noise: f32,
    /// RNG seed.
    pub seed: u64,
}

impl SyntheticClusters {
    /// Generate `n` examples. Different `stream` values give disjoint draws.
    ///
    /// # Errors
    ///
    /// Returns an error if `noise` is not a valid standard deviation.
    #[allow(clippy::cast_possible_truncation)]
    pub fn generate(&self, n: usize, stream: u64, device: &Device) -> Result<Dataset> {
        let unit = Normal::new(0.0f32, 1.0)
            .map_err(|e| SubspaceError::Dataset(format!("normal distribution: {e}")))?;

        let mut centre_rng = ChaCha8Rng::seed_from_u64(self.seed);
        let centres: Vec<f32> = (0..self.num_classes * self.input_dim)
            .map(|_| 3.0 * unit.sample(&mut centre_rng))
            .collect();

        let mut rng = ChaCha8Rng::seed_from_u64(self.seed.wrapping_add(stream.wrapping_mul(7919) + 1));
        let mut inputs = Vec::with_capacity(n * self.input_dim);
        let mut labels = Vec::with_capacity(n);
        for i in 0..n {
            let class = i % self.num_classes;
            let centre = &centres[class * self.input_dim..(class + 1) * self.input_dim];
            inputs.extend(
                centre
                    .iter()
                    .map(|c| c + self.noise * unit.sample(&mut rng)),
            );
            labels.push(class as u32);
        }

        let inputs = Tensor::from_vec(inputs, (n, self.input_dim), device)?;
        let labels = Tensor::from_vec(labels, n, device)?;
        Dataset::new(inputs, labels)
    }
}

/// Build the train and test datasets described by `config`.
///
/// # Errors
///
/// Returns an error if the data cannot be generated or loaded.
pub fn load_datasets(
    config: &DataConfig,
    num_classes: usize,
    device: &Device,
) -> Result<(Dataset, Dataset)> {
    match &config.source {
        DataSource::Synthetic {
            train_samples,
            test_samples,
            input_dim,
            noise,
        } => {
            let generator = SyntheticClusters {
                input_dim: *input_dim,
                num_classes,
                noise: *noise,
                seed: config.seed,
            };
            let train = generator.generate(*train_samples, 0, device)?;
            let test = generator.generate(*test_samples, 1, device)?;
            Ok((train, test))
        }
        DataSource::Safetensors {
            train_path,
            test_path,
        } => {
            let train = Dataset::load_safetensors(train_path, device)?;
            let test = Dataset::load_safetensors(test_path, device)?;
            if train.input_dim() != test.input_dim() {
                return Err(SubspaceError::Dataset(format!(
                    "train has {} features but test has {}",
                    train.input_dim(),
                    test.input_dim()
                )));
            }
            Ok((train, test))
        }
    }
}

/// A minibatch.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Input features, `B × D`.
    pub inputs: Tensor,
    /// Labels, `B`.
    pub labels: Tensor,
}

impl Batch {
    /// Number of examples in the batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.labels.dims()[0]
    }

    /// Whether the batch is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Minibatch iterator factory over a [`Dataset`].
///
/// # Example
///
/// ```rust
/// use candle_core::Device;
/// use subspace_sgd_rs::dataset::{DataLoader, SyntheticClusters};
///
/// # fn main() -> subspace_sgd_rs::Result<()> {
/// let generator = SyntheticClusters { input_dim: 4, num_classes: 3, noise: 0.5, seed: 7 };
/// let dataset = generator.generate(10, 0, &Device::Cpu)?;
/// let loader = DataLoader::new(dataset, 4, true, 7);
/// assert_eq!(loader.len(), 3);
/// for batch in loader.iter(0) {
///     assert!(batch?.len() <= 4);
/// }
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct DataLoader {
    dataset: Dataset,
    batch_size: usize,
    shuffle: bool,
    seed: u64,
}

impl DataLoader {
    /// Create a loader. A `batch_size` of zero is treated as one.
    #[must_use]
    pub fn new(dataset: Dataset, batch_size: usize, shuffle: bool, seed: u64) -> Self {
        Self {
            dataset,
            batch_size: batch_size.max(1),
            shuffle,
            seed,
        }
    }

    /// Number of batches per epoch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    /// Whether an epoch yields no batches.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Underlying dataset.
    #[must_use]
    pub const fn dataset(&self) -> &Dataset {
        &self.dataset
    }

    /// Batches for `epoch`, shuffled deterministically when enabled.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn iter(&self, epoch: usize) -> Batches<'_> {
        let mut order: Vec<u32> = (0..self.dataset.len() as u32).collect();
        if self.shuffle {
            let mut rng = ChaCha8Rng::seed_from_u64(self.seed.wrapping_add(epoch as u64));
            order.shuffle(&mut rng);
        }
        Batches {
            loader: self,
            order,
            position: 0,
        }
    }
}

/// Iterator over the minibatches of one epoch.
pub struct Batches<'a> {
    loader: &'a DataLoader,
    order: Vec<u32>,
    position: usize,
}

impl Iterator for Batches<'_> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.position >= self.order.len() {
            return None;
        }
        let end = (self.position + self.loader.batch_size).min(self.order.len());
        let chunk = &self.order[self.position..end];
        self.position = end;

        let dataset = &self.loader.dataset;
        let build = || -> Result<Batch> {
            let index = Tensor::from_slice(chunk, chunk.len(), dataset.device())?;
            Ok(Batch {
                inputs: dataset.inputs.index_select(&index, 0)?,
                labels: dataset.labels.index_select(&index, 0)?,
            })
        };
        Some(build())
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.order.len() - self.position).div_ceil(self.loader.batch_size);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Batches<'_> {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn clusters() -> SyntheticClusters {
        SyntheticClusters {
            input_dim: 3,
            num_classes: 2,
            noise: 0.1,
            seed: 11,
        }
    }

    #[test]
    fn test_synthetic_shapes_and_labels() {
        let data = clusters().generate(7, 0, &Device::Cpu).unwrap();
        assert_eq!(data.len(), 7);
        assert_eq!(data.input_dim(), 3);
        let labels: Vec<u32> = data.labels().to_vec1().unwrap();
        assert_eq!(labels, vec![0, 1, 0, 1, 0, 1, 0]);
    }

    #[test]
    fn test_synthetic_is_deterministic() {
        let a = clusters().generate(5, 0, &Device::Cpu).unwrap();
        let b = clusters().generate(5, 0, &Device::Cpu).unwrap();
        let a: Vec<Vec<f32>> = a.inputs().to_vec2().unwrap();
        let b: Vec<Vec<f32>> = b.inputs().to_vec2().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_streams_differ() {
        let a = clusters().generate(4, 0, &Device::Cpu).unwrap();
        let b = clusters().generate(4, 1, &Device::Cpu).unwrap();
        let a: Vec<Vec<f32>> = a.inputs().to_vec2().unwrap();
        let b: Vec<Vec<f32>> = b.inputs().to_vec2().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_dataset_rejects_mismatched_lengths() {
        let inputs = Tensor::zeros((3, 2), DType::F32, &Device::Cpu).unwrap();
        let labels = Tensor::zeros(4, DType::U32, &Device::Cpu).unwrap();
        assert!(matches!(
            Dataset::new(inputs, labels),
            Err(SubspaceError::Dataset(_))
        ));
    }

    #[test]
    fn test_dataset_rejects_float_labels() {
        let inputs = Tensor::zeros((3, 2), DType::F32, &Device::Cpu).unwrap();
        let labels = Tensor::zeros(3, DType::F32, &Device::Cpu).unwrap();
        assert!(Dataset::new(inputs, labels).is_err());
    }

    #[test]
    fn test_loader_covers_every_example_once() {
        let data = clusters().generate(10, 0, &Device::Cpu).unwrap();
        let loader = DataLoader::new(data, 3, true, 5);
        assert_eq!(loader.len(), 4);

        let mut seen = 0;
        let mut sizes = Vec::new();
        for batch in loader.iter(2) {
            let batch = batch.unwrap();
            sizes.push(batch.len());
            seen += batch.len();
        }
        assert_eq!(seen, 10);
        assert_eq!(sizes, vec![3, 3, 3, 1]);
    }

    #[test]
    fn test_shuffle_depends_on_epoch() {
        let data = clusters().generate(32, 0, &Device::Cpu).unwrap();
        let loader = DataLoader::new(data, 32, true, 5);
        let first = |epoch| -> Vec<Vec<f32>> {
            let batch = loader.iter(epoch).next().unwrap().unwrap();
            batch.inputs.to_vec2().unwrap()
        };
        assert_eq!(first(0), first(0));
        assert_ne!(first(0), first(1));
    }

    #[test]
    fn test_unshuffled_keeps_order() {
        let data = clusters().generate(4, 0, &Device::Cpu).unwrap();
        let loader = DataLoader::new(data, 4, false, 0);
        let batch = loader.iter(3).next().unwrap().unwrap();
        let labels: Vec<u32> = batch.labels.to_vec1().unwrap();
        assert_eq!(labels, vec![0, 1, 0, 1]);
    }

    #[test]
    fn test_safetensors_round_trip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("train.safetensors");
        let data = clusters().generate(6, 0, &Device::Cpu).unwrap();
        data.save_safetensors(&path).unwrap();

        let loaded = Dataset::load_safetensors(&path, &Device::Cpu).unwrap();
        assert_eq!(loaded.len(), 6);
        assert_eq!(loaded.input_dim(), 3);
    }

    #[test]
    fn test_missing_safetensors_file() {
        let result = Dataset::load_safetensors("/nonexistent/data.safetensors", &Device::Cpu);
        assert!(matches!(result, Err(SubspaceError::Dataset(_))));
    }
}
