//! SGD with momentum and weight decay.
//!
//! `candle_nn::SGD` has neither momentum nor weight decay, so [`MomentumSgd`]
//! implements the usual heavy-ball update on top of the
//! [`candle_nn::Optimizer`] trait:
//!
//! ```text
//! d   = g + weight_decay · p
//! buf = d                     (first step)
//! buf = momentum · buf + d    (afterwards)
//! p   = p - lr · buf
//! ```

use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use candle_nn::{Optimizer, VarMap};

use crate::config::OptimizerSettings;
use crate::error::Result;

/// Hyper-parameters of [`MomentumSgd`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParamsSgd {
    /// Learning rate
    pub lr: f64,
    /// Momentum factor
    pub momentum: f64,
    /// L2 penalty
    pub weight_decay: f64,
}

impl Default for ParamsSgd {
    fn default() -> Self {
        Self {
            lr: 0.1,
            momentum: 0.0,
            weight_decay: 0.0,
        }
    }
}

impl ParamsSgd {
    /// All three settings from the experiment configuration.
    #[must_use]
    pub const fn from_settings(settings: &OptimizerSettings) -> Self {
        Self {
            lr: settings.learning_rate,
            momentum: settings.momentum,
            weight_decay: settings.weight_decay,
        }
    }

    /// Same settings with weight decay disabled.
    #[must_use]
    pub const fn without_weight_decay(mut self) -> Self {
        self.weight_decay = 0.0;
        self
    }

    /// Build an optimizer over every variable of `var_map`.
    ///
    /// # Errors
    ///
    /// Returns an error if the optimizer cannot be created.
    pub fn build(self, var_map: &VarMap) -> Result<MomentumSgd> {
        Ok(MomentumSgd::new(var_map.all_vars(), self)?)
    }
}

#[derive(Debug)]
struct VarState {
    var: Var,
    buffer: Option<Tensor>,
}

/// Stochastic gradient descent with momentum buffers.
#[derive(Debug)]
pub struct MomentumSgd {
    states: Vec<VarState>,
    params: ParamsSgd,
}

impl MomentumSgd {
    /// Current hyper-parameters.
    #[must_use]
    pub const fn params(&self) -> &ParamsSgd {
        &self.params
    }
}

impl Optimizer for MomentumSgd {
    type Config = ParamsSgd;

    fn new(vars: Vec<Var>, params: ParamsSgd) -> candle_core::Result<Self> {
        let states = vars
            .into_iter()
            .filter(|v| v.dtype().is_float())
            .map(|var| VarState { var, buffer: None })
            .collect();
        Ok(Self { states, params })
    }

    fn step(&mut self, grads: &GradStore) -> candle_core::Result<()> {
        let ParamsSgd {
            lr,
            momentum,
            weight_decay,
        } = self.params;

        for state in &mut self.states {
            let Some(grad) = grads.get(state.var.as_tensor()) else {
                continue;
            };
            let mut d = grad.detach();
            if weight_decay != 0.0 {
                d = (d + (state.var.as_tensor().detach() * weight_decay)?)?;
            }
            if momentum != 0.0 {
                let buf = match state.buffer.take() {
                    Some(buf) => ((buf * momentum)? + &d)?,
                    None => d,
                };
                d = buf.clone();
                state.buffer = Some(buf);
            }
            let next = state.var.as_tensor().detach().sub(&(d * lr)?)?;
            state.var.set(&next)?;
        }
        Ok(())
    }

    fn learning_rate(&self) -> f64 {
        self.params.lr
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.params.lr = lr;
    }
}
