//! Flat views of model parameters and gradients.
//!
//! PCA and projection work on a single parameter vector, while candle keeps
//! one tensor per parameter. [`ParamLayout`] fixes an order (parameter names
//! sorted lexicographically) and converts between the two representations.

use std::collections::HashMap;

use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use candle_nn::VarMap;

use crate::error::{Result, SubspaceError};

/// One named parameter inside the flat vector.
#[derive(Debug, Clone)]
struct Slot {
    name: String,
    var: Var,
    offset: usize,
    len: usize,
}

/// Fixed ordering of a model's parameters.
///
/// The layout holds handles to the model's variables, so reads always see the
/// current values and writes update the model in place.
#[derive(Debug, Clone)]
pub struct ParamLayout {
    slots: Vec<Slot>,
    num_params: usize,
}

impl ParamLayout {
    /// Snapshot the variables of `var_map` in name order.
    ///
    /// # Errors
    ///
    /// Returns an error if the map lock is poisoned or the map is empty.
    pub fn from_var_map(var_map: &VarMap) -> Result<Self> {
        let data = var_map
            .data()
            .lock()
            .map_err(|_| SubspaceError::Training("parameter map lock poisoned".into()))?;
        let mut named: Vec<(String, Var)> = data
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        drop(data);

        if named.is_empty() {
            return Err(SubspaceError::Training("model has no parameters".into()));
        }
        named.sort_by(|a, b| a.0.cmp(&b.0));

        let mut offset = 0;
        let slots = named
            .into_iter()
            .map(|(name, var)| {
                let len = var.elem_count();
                let slot = Slot {
                    name,
                    var,
                    offset,
                    len,
                };
                offset += len;
                slot
            })
            .collect();

        Ok(Self {
            slots,
            num_params: offset,
        })
    }

    /// Length of the flat vector.
    #[must_use]
    pub const fn num_params(&self) -> usize {
        self.num_params
    }

    /// Parameter names in layout order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.slots.iter().map(|s| s.name.as_str())
    }

    /// Current parameters as one flat vector. The result owns its storage, so
    /// later updates to the model do not show through.
    ///
    /// # Errors
    ///
    /// Returns an error if a tensor operation fails.
    pub fn param_vec(&self) -> Result<Tensor> {
        let parts = self
            .slots
            .iter()
            .map(|s| s.var.as_tensor().flatten_all())
            .collect::<candle_core::Result<Vec<_>>>()?;
        let flat = Tensor::cat(&parts, 0)?;
        // cat of a single tensor shares its storage
        if parts.len() == 1 {
            return Ok(flat.copy()?);
        }
        Ok(flat)
    }

    /// Gradients as one flat vector. Parameters without a gradient contribute
    /// zeros.
    ///
    /// # Errors
    ///
    /// Returns an error if a tensor operation fails.
    pub fn grad_vec(&self, grads: &GradStore) -> Result<Tensor> {
        let parts = self
            .slots
            .iter()
            .map(|s| match grads.get(s.var.as_tensor()) {
                Some(g) => g.flatten_all(),
                None => s.var.as_tensor().zeros_like()?.flatten_all(),
            })
            .collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Tensor::cat(&parts, 0)?)
    }

    /// Overwrite every parameter from a flat vector.
    ///
    /// # Errors
    ///
    /// Returns [`SubspaceError::DimensionMismatch`] if `flat` has the wrong
    /// length.
    pub fn set_params(&self, flat: &Tensor) -> Result<()> {
        self.check_len(flat)?;
        for slot in &self.slots {
            let value = flat
                .narrow(0, slot.offset, slot.len)?
                .reshape(slot.var.dims())?
                .to_dtype(slot.var.dtype())?;
            slot.var.set(&value)?;
        }
        Ok(())
    }

    /// Replace every gradient in `grads` with the matching slice of `flat`.
    ///
    /// # Errors
    ///
    /// Returns [`SubspaceError::DimensionMismatch`] if `flat` has the wrong
    /// length.
    pub fn set_grads(&self, grads: &mut GradStore, flat: &Tensor) -> Result<()> {
        self.check_len(flat)?;
        for slot in &self.slots {
            let grad = flat
                .narrow(0, slot.offset, slot.len)?
                .reshape(slot.var.dims())?
                .to_dtype(slot.var.dtype())?;
            grads.insert(slot.var.as_tensor(), grad);
        }
        Ok(())
    }

    /// Current parameters keyed by name, ready for serialization.
    #[must_use]
    pub fn tensor_map(&self) -> HashMap<String, Tensor> {
        self.slots
            .iter()
            .map(|s| (s.name.clone(), s.var.as_tensor().clone()))
            .collect()
    }

    /// Flatten a name-keyed map in layout order.
    ///
    /// # Errors
    ///
    /// Returns an error if a parameter is missing or has the wrong shape.
    pub fn param_vec_from_map(&self, map: &HashMap<String, Tensor>) -> Result<Tensor> {
        let parts = self
            .slots
            .iter()
            .map(|slot| {
                let tensor = self.lookup(map, slot)?;
                Ok(tensor
                    .to_device(slot.var.device())?
                    .to_dtype(slot.var.dtype())?
                    .flatten_all()?)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Tensor::cat(&parts, 0)?)
    }

    /// Overwrite every parameter from a name-keyed map.
    ///
    /// # Errors
    ///
    /// Returns an error if a parameter is missing or has the wrong shape.
    pub fn load_map(&self, map: &HashMap<String, Tensor>) -> Result<()> {
        for slot in &self.slots {
            let tensor = self
                .lookup(map, slot)?
                .to_device(slot.var.device())?
                .to_dtype(slot.var.dtype())?;
            slot.var.set(&tensor)?;
        }
        Ok(())
    }

    fn lookup<'m>(&self, map: &'m HashMap<String, Tensor>, slot: &Slot) -> Result<&'m Tensor> {
        let tensor = map.get(&slot.name).ok_or_else(|| {
            SubspaceError::Checkpoint(format!("parameter `{}` missing", slot.name))
        })?;
        if tensor.dims() != slot.var.dims() {
            return Err(SubspaceError::ShapeMismatch {
                name: slot.name.clone(),
                expected: slot.var.dims().to_vec(),
                actual: tensor.dims().to_vec(),
            });
        }
        Ok(tensor)
    }

    fn check_len(&self, flat: &Tensor) -> Result<()> {
        let actual = flat.elem_count();
        if flat.rank() != 1 || actual != self.num_params {
            return Err(SubspaceError::DimensionMismatch {
                expected: self.num_params,
                actual,
            });
        }
        Ok(())
    }
}
