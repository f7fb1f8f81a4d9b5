//! Trajectory sampling during SGD.
//!
//! [`SampleManager`] is advanced once per optimizer step and snapshots the
//! parameters when its strategy says so. Snapshots go either to a
//! [`CheckpointStore`] (for a later PSGD run) or to a bounded in-memory ring
//! (for BSGD, which only ever looks at the most recent window).

use std::collections::VecDeque;
use std::path::Path;

use candle_core::Tensor;

use crate::checkpoint::CheckpointStore;
use crate::config::SampleStrategy;
use crate::error::{Result, SubspaceError};
use crate::params::ParamLayout;
use crate::pca::sample_matrix;

#[derive(Debug)]
enum SampleSink {
    Disk(CheckpointStore),
    Memory {
        capacity: usize,
        samples: VecDeque<Tensor>,
    },
}

/// Decides when to snapshot parameters and where to keep them.
#[derive(Debug)]
pub struct SampleManager {
    strategy: SampleStrategy,
    frequency: usize,
    steps_per_epoch: usize,
    steps: usize,
    taken: usize,
    sink: SampleSink,
}

impl SampleManager {
    /// Sample into a checkpoint directory. Sample `i` becomes checkpoint `i`.
    ///
    /// # Errors
    ///
    /// Returns [`SubspaceError::Config`] if `frequency` or `steps_per_epoch`
    /// is zero.
    pub fn to_disk(
        store: CheckpointStore,
        strategy: SampleStrategy,
        frequency: usize,
        steps_per_epoch: usize,
    ) -> Result<Self> {
        Self::new(strategy, frequency, steps_per_epoch, SampleSink::Disk(store))
    }

    /// Keep the `capacity` most recent samples in memory.
    ///
    /// # Errors
    ///
    /// Returns [`SubspaceError::Config`] if `capacity`, `frequency` or
    /// `steps_per_epoch` is zero.
    pub fn in_memory(
        capacity: usize,
        strategy: SampleStrategy,
        frequency: usize,
        steps_per_epoch: usize,
    ) -> Result<Self> {
        if capacity == 0 {
            return Err(SubspaceError::Config(
                "sample capacity must be > 0".into(),
            ));
        }
        Self::new(
            strategy,
            frequency,
            steps_per_epoch,
            SampleSink::Memory {
                capacity,
                samples: VecDeque::with_capacity(capacity),
            },
        )
    }

    fn new(
        strategy: SampleStrategy,
        frequency: usize,
        steps_per_epoch: usize,
        sink: SampleSink,
    ) -> Result<Self> {
        Self::check_cadence(frequency, steps_per_epoch)?;
        Ok(Self {
            strategy,
            frequency,
            steps_per_epoch,
            steps: 0,
            taken: 0,
            sink,
        })
    }

    /// Check the arguments shared by both constructors, so callers can fail
    /// before creating a sample directory.
    ///
    /// # Errors
    ///
    /// Returns [`SubspaceError::Config`] if `frequency` or `steps_per_epoch`
    /// is zero.
    pub fn check_cadence(frequency: usize, steps_per_epoch: usize) -> Result<()> {
        if frequency == 0 {
            return Err(SubspaceError::Config(
                "sampling.frequency must be > 0".into(),
            ));
        }
        if steps_per_epoch == 0 {
            return Err(SubspaceError::Config(
                "cannot sample an epoch without steps".into(),
            ));
        }
        Ok(())
    }

    /// Snapshot the current parameters.
    ///
    /// # Errors
    ///
    /// Returns an error if reading the parameters or writing the checkpoint
    /// fails.
    pub fn sample(&mut self, layout: &ParamLayout) -> Result<()> {
        match &mut self.sink {
            SampleSink::Disk(store) => {
                store.save(self.taken, layout)?;
            }
            SampleSink::Memory { capacity, samples } => {
                if samples.len() == *capacity {
                    samples.pop_front();
                }
                samples.push_back(layout.param_vec()?.detach());
            }
        }
        self.taken += 1;
        tracing::debug!(step = self.steps, sample = self.taken, "sampled parameters");
        Ok(())
    }

    /// Count one optimizer step and sample if due. Returns whether a sample
    /// was taken.
    ///
    /// # Errors
    ///
    /// Returns an error if sampling fails.
    pub fn step(&mut self, layout: &ParamLayout) -> Result<bool> {
        self.steps += 1;
        if self.is_due() {
            self.sample(layout)?;
            return Ok(true);
        }
        Ok(false)
    }

    fn is_due(&self) -> bool {
        match self.strategy {
            SampleStrategy::Interval => self.steps % self.frequency == 0,
            SampleStrategy::PerEpoch => {
                let position = (self.steps - 1) % self.steps_per_epoch + 1;
                let spacing = (self.steps_per_epoch / self.frequency).max(1);
                position % spacing == 0 && position / spacing <= self.frequency
            }
        }
    }

    /// Optimizer steps counted so far.
    #[must_use]
    pub const fn steps(&self) -> usize {
        self.steps
    }

    /// Samples taken so far, including any evicted from memory.
    #[must_use]
    pub const fn taken(&self) -> usize {
        self.taken
    }

    /// Samples that [`SampleManager::last_samples`] can still return.
    #[must_use]
    pub fn available(&self) -> usize {
        match &self.sink {
            SampleSink::Disk(_) => self.taken,
            SampleSink::Memory { samples, .. } => samples.len(),
        }
    }

    /// Checkpoint directory, for disk-backed managers.
    #[must_use]
    pub fn dir(&self) -> Option<&Path> {
        match &self.sink {
            SampleSink::Disk(store) => Some(store.dir()),
            SampleSink::Memory { .. } => None,
        }
    }

    /// The `k` most recent samples as the columns of an `n × k` matrix,
    /// oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`SubspaceError::Training`] if fewer than `k` samples are
    /// available, or an error if a checkpoint cannot be read.
    pub fn last_samples(&self, k: usize, layout: &ParamLayout) -> Result<Tensor> {
        let available = self.available();
        if k == 0 || k > available {
            return Err(SubspaceError::Training(format!(
                "requested {k} samples, {available} available"
            )));
        }
        let columns = match &self.sink {
            SampleSink::Disk(store) => (self.taken - k..self.taken)
                .map(|i| store.load_param_vec(i, layout))
                .collect::<Result<Vec<_>>>()?,
            SampleSink::Memory { samples, .. } => {
                samples.iter().skip(samples.len() - k).cloned().collect()
            }
        };
        sample_matrix(&columns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{Device, Var};
    use candle_nn::VarMap;
    use tempfile::TempDir;

    fn layout() -> (VarMap, ParamLayout) {
        let map = VarMap::new();
        map.data().lock().unwrap().insert(
            "w".to_string(),
            Var::from_tensor(&Tensor::new(&[0.0f32, 0.0], &Device::Cpu).unwrap()).unwrap(),
        );
        let layout = ParamLayout::from_var_map(&map).unwrap();
        (map, layout)
    }

    fn set(layout: &ParamLayout, x: f32) {
        layout
            .set_params(&Tensor::new(&[x, -x], &Device::Cpu).unwrap())
            .unwrap();
    }

    fn due_steps(manager: &mut SampleManager, layout: &ParamLayout, steps: usize) -> Vec<usize> {
        (1..=steps)
            .filter(|_| manager.step(layout).unwrap())
            .collect()
    }

    #[test]
    fn test_interval_strategy() {
        let (_map, layout) = layout();
        let mut manager =
            SampleManager::in_memory(100, SampleStrategy::Interval, 3, 10).unwrap();
        assert_eq!(due_steps(&mut manager, &layout, 10), vec![3, 6, 9]);
        assert_eq!(manager.taken(), 3);
        assert_eq!(manager.steps(), 10);
    }

    #[test]
    fn test_per_epoch_strategy_spacing() {
        let (_map, layout) = layout();
        let mut manager =
            SampleManager::in_memory(100, SampleStrategy::PerEpoch, 2, 10).unwrap();
        assert_eq!(due_steps(&mut manager, &layout, 20), vec![5, 10, 15, 20]);
    }

    #[test]
    fn test_per_epoch_strategy_caps_samples_per_epoch() {
        let (_map, layout) = layout();
        // spacing 2 would also hit step 10
        let mut manager =
            SampleManager::in_memory(100, SampleStrategy::PerEpoch, 4, 10).unwrap();
        assert_eq!(due_steps(&mut manager, &layout, 10), vec![2, 4, 6, 8]);

        let mut manager =
            SampleManager::in_memory(100, SampleStrategy::PerEpoch, 2, 7).unwrap();
        assert_eq!(due_steps(&mut manager, &layout, 7), vec![3, 6]);
    }

    #[test]
    fn test_per_epoch_strategy_more_samples_than_steps() {
        let (_map, layout) = layout();
        let mut manager =
            SampleManager::in_memory(100, SampleStrategy::PerEpoch, 8, 4).unwrap();
        assert_eq!(due_steps(&mut manager, &layout, 4), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_memory_ring_keeps_most_recent() {
        let (_map, layout) = layout();
        let mut manager =
            SampleManager::in_memory(2, SampleStrategy::Interval, 1, 1).unwrap();
        for x in [1.0, 2.0, 3.0] {
            set(&layout, x);
            manager.sample(&layout).unwrap();
        }
        assert_eq!(manager.taken(), 3);
        assert_eq!(manager.available(), 2);

        let w: Vec<Vec<f32>> = manager.last_samples(2, &layout).unwrap().to_vec2().unwrap();
        assert_eq!(w, vec![vec![2.0, 3.0], vec![-2.0, -3.0]]);
        assert!(manager.last_samples(3, &layout).is_err());
    }

    #[test]
    fn test_memory_samples_are_snapshots() {
        let (_map, layout) = layout();
        let mut manager =
            SampleManager::in_memory(4, SampleStrategy::Interval, 1, 1).unwrap();
        set(&layout, 1.0);
        manager.sample(&layout).unwrap();
        set(&layout, 5.0);
        manager.sample(&layout).unwrap();
        let w: Vec<Vec<f32>> = manager.last_samples(2, &layout).unwrap().to_vec2().unwrap();
        assert_eq!(w[0], vec![1.0, 5.0]);
    }

    #[test]
    fn test_disk_sink_numbers_checkpoints() {
        let tmp = TempDir::new().unwrap();
        let store = CheckpointStore::create(tmp.path(), &Device::Cpu).unwrap();
        let (_map, layout) = layout();
        let mut manager =
            SampleManager::to_disk(store, SampleStrategy::Interval, 2, 4).unwrap();

        manager.sample(&layout).unwrap();
        set(&layout, 1.0);
        due_steps(&mut manager, &layout, 4);

        assert_eq!(manager.taken(), 3);
        assert_eq!(manager.dir(), Some(tmp.path()));
        for i in 0..3 {
            assert!(tmp.path().join(format!("checkpoint_{i}.safetensors")).exists());
        }
        let w: Vec<Vec<f32>> = manager.last_samples(3, &layout).unwrap().to_vec2().unwrap();
        assert_eq!(w[0], vec![0.0, 1.0, 1.0]);
    }

    #[test]
    fn test_zero_parameters_rejected() {
        assert!(SampleManager::in_memory(0, SampleStrategy::Interval, 1, 1).is_err());
        assert!(SampleManager::in_memory(1, SampleStrategy::Interval, 0, 1).is_err());
        assert!(SampleManager::in_memory(1, SampleStrategy::PerEpoch, 1, 0).is_err());
    }
}
