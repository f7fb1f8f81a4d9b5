//! Learning rate schedulers.

use candle_nn::Optimizer;

/// Step decay at fixed epochs.
///
/// After `epoch` calls to [`MultiStepScheduler::step`] the learning rate is
/// `base_lr · gamma^k`, where `k` is the number of milestones `<= epoch`.
#[derive(Debug, Clone)]
pub struct MultiStepScheduler {
    base_lr: f64,
    milestones: Vec<usize>,
    gamma: f64,
    epoch: usize,
}

impl MultiStepScheduler {
    /// Create a new scheduler. Milestones may be given in any order.
    #[must_use]
    pub fn new(base_lr: f64, mut milestones: Vec<usize>, gamma: f64) -> Self {
        milestones.sort_unstable();
        Self {
            base_lr,
            milestones,
            gamma,
            epoch: 0,
        }
    }

    /// Learning rate in effect at `epoch`.
    #[must_use]
    pub fn lr_at(&self, epoch: usize) -> f64 {
        let decays = self.milestones.iter().take_while(|&&m| m <= epoch).count();
        let decays = i32::try_from(decays).unwrap_or(i32::MAX);
        self.base_lr * self.gamma.powi(decays)
    }

    /// Learning rate for the current epoch.
    #[must_use]
    pub fn get_lr(&self) -> f64 {
        self.lr_at(self.epoch)
    }

    /// Epochs stepped so far.
    #[must_use]
    pub const fn epoch(&self) -> usize {
        self.epoch
    }

    /// Finish an epoch and update the optimizer. Returns the new rate.
    pub fn step<O: Optimizer>(&mut self, optimizer: &mut O) -> f64 {
        self.epoch += 1;
        let lr = self.get_lr();
        if (lr - optimizer.learning_rate()).abs() > f64::EPSILON {
            tracing::info!(epoch = self.epoch, lr, "learning rate decayed");
        }
        optimizer.set_learning_rate(lr);
        lr
    }
}
