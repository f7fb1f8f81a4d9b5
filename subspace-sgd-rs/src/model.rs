//! Classifier models.
//!
//! Training drivers only need a forward pass and access to the parameter
//! store; [`Classifier`] captures exactly that so any candle model can be
//! plugged in. [`Mlp`] is the built-in multi-layer perceptron.

use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{linear, Linear, VarBuilder, VarMap};

use crate::config::ModelConfig;
use crate::error::{Result, SubspaceError};

/// A model trained by the subspace drivers.
pub trait Classifier {
    /// Short architecture name used in run names.
    fn name(&self) -> &str;

    /// Compute class logits for a batch of inputs.
    ///
    /// # Errors
    ///
    /// Returns an error if a tensor operation fails.
    fn forward(&self, inputs: &Tensor) -> Result<Tensor>;

    /// Trainable parameters.
    fn var_map(&self) -> &VarMap;
}

/// Fully connected ReLU network.
///
/// Parameters are named `fc{i}.weight` / `fc{i}.bias`, counting from 1.
///
/// # Example
///
/// ```rust
/// use candle_core::{DType, Device, Tensor};
/// use subspace_sgd_rs::config::ModelConfig;
/// use subspace_sgd_rs::model::{Classifier, Mlp};
///
/// # fn main() -> subspace_sgd_rs::Result<()> {
/// let config = ModelConfig { hidden_dims: vec![16], num_classes: 3 };
/// let model = Mlp::new(5, &config, &Device::Cpu)?;
/// let logits = model.forward(&Tensor::zeros((2, 5), DType::F32, &Device::Cpu)?)?;
/// assert_eq!(logits.dims(), &[2, 3]);
/// # Ok(())
/// # }
/// ```
pub struct Mlp {
    layers: Vec<Linear>,
    var_map: VarMap,
}

impl Mlp {
    /// Name used in run names.
    pub const NAME: &'static str = "Mlp";

    /// Build a freshly initialised network.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is degenerate or parameter
    /// allocation fails.
    pub fn new(input_dim: usize, config: &ModelConfig, device: &Device) -> Result<Self> {
        if input_dim == 0 {
            return Err(SubspaceError::Config("model input_dim must be > 0".into()));
        }
        if config.num_classes < 2 {
            return Err(SubspaceError::Config(
                "model.num_classes must be >= 2".into(),
            ));
        }

        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, device);

        let mut widths = Vec::with_capacity(config.hidden_dims.len() + 2);
        widths.push(input_dim);
        widths.extend_from_slice(&config.hidden_dims);
        widths.push(config.num_classes);

        let layers = widths
            .windows(2)
            .enumerate()
            .map(|(i, w)| linear(w[0], w[1], vb.pp(format!("fc{}", i + 1))))
            .collect::<candle_core::Result<Vec<_>>>()?;

        Ok(Self { layers, var_map })
    }

    /// Total number of scalar parameters.
    #[must_use]
    pub fn parameter_count(&self) -> usize {
        self.var_map.all_vars().iter().map(|v| v.elem_count()).sum()
    }
}

impl Classifier for Mlp {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn forward(&self, inputs: &Tensor) -> Result<Tensor> {
        let last = self.layers.len() - 1;
        let mut xs = inputs.clone();
        for (i, layer) in self.layers.iter().enumerate() {
            xs = layer.forward(&xs)?;
            if i < last {
                xs = xs.relu()?;
            }
        }
        Ok(xs)
    }

    fn var_map(&self) -> &VarMap {
        &self.var_map
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mlp_parameter_count() {
        let config = ModelConfig {
            hidden_dims: vec![4],
            num_classes: 2,
        };
        let model = Mlp::new(3, &config, &Device::Cpu).unwrap();
        // 3*4 + 4 + 4*2 + 2
        assert_eq!(model.parameter_count(), 26);
    }

    #[test]
    fn test_mlp_parameter_names() {
        let config = ModelConfig {
            hidden_dims: vec![4, 4],
            num_classes: 2,
        };
        let model = Mlp::new(3, &config, &Device::Cpu).unwrap();
        let data = model.var_map().data().lock().unwrap();
        let mut names: Vec<&String> = data.keys().collect();
        names.sort();
        assert_eq!(
            names,
            vec![
                "fc1.bias",
                "fc1.weight",
                "fc2.bias",
                "fc2.weight",
                "fc3.bias",
                "fc3.weight"
            ]
        );
    }

    #[test]
    fn test_mlp_without_hidden_layers() {
        let config = ModelConfig {
            hidden_dims: vec![],
            num_classes: 3,
        };
        let model = Mlp::new(2, &config, &Device::Cpu).unwrap();
        let xs = Tensor::ones((5, 2), DType::F32, &Device::Cpu).unwrap();
        assert_eq!(model.forward(&xs).unwrap().dims(), &[5, 3]);
    }

    #[test]
    fn test_mlp_rejects_single_class() {
        let config = ModelConfig {
            hidden_dims: vec![4],
            num_classes: 1,
        };
        assert!(Mlp::new(3, &config, &Device::Cpu).is_err());
    }
}
