//! Indexed parameter checkpoints on disk.
//!
//! A store is a directory of `checkpoint_{i}.safetensors` files, one per
//! trajectory sample. Index 0 holds the initial parameters.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};

use crate::error::{Result, SubspaceError};
use crate::params::ParamLayout;

/// Directory of numbered safetensors checkpoints.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
    device: Device,
}

impl CheckpointStore {
    /// Create the directory (and parents) and return a store over it.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn create<P: AsRef<Path>>(dir: P, device: &Device) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        tracing::debug!("Created checkpoint store at {}", dir.display());
        Ok(Self {
            dir,
            device: device.clone(),
        })
    }

    /// Open an existing store.
    ///
    /// # Errors
    ///
    /// Returns [`SubspaceError::Checkpoint`] if `dir` is not a directory.
    pub fn open<P: AsRef<Path>>(dir: P, device: &Device) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        if !dir.is_dir() {
            return Err(SubspaceError::Checkpoint(format!(
                "sample directory not found: {}",
                dir.display()
            )));
        }
        Ok(Self {
            dir,
            device: device.clone(),
        })
    }

    /// Store directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Location of checkpoint `index`.
    #[must_use]
    pub fn path(&self, index: usize) -> PathBuf {
        self.dir.join(format!("checkpoint_{index}.safetensors"))
    }

    /// Whether checkpoint `index` exists.
    #[must_use]
    pub fn contains(&self, index: usize) -> bool {
        self.path(index).is_file()
    }

    /// Number of checkpoints stored contiguously from index 0.
    #[must_use]
    pub fn count(&self) -> usize {
        (0..).take_while(|&i| self.contains(i)).count()
    }

    /// Write the current parameters as checkpoint `index`, replacing any
    /// existing file.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or the write fails.
    pub fn save(&self, index: usize, layout: &ParamLayout) -> Result<PathBuf> {
        let path = self.path(index);
        candle_core::safetensors::save(&layout.tensor_map(), &path)?;
        tracing::debug!("Saved checkpoint {index} to {}", path.display());
        Ok(path)
    }

    /// Read checkpoint `index` as a name-keyed map.
    ///
    /// # Errors
    ///
    /// Returns [`SubspaceError::CheckpointNotFound`] if the file is missing.
    pub fn load(&self, index: usize) -> Result<HashMap<String, Tensor>> {
        let path = self.path(index);
        if !path.is_file() {
            return Err(SubspaceError::CheckpointNotFound { index, path });
        }
        Ok(candle_core::safetensors::load(&path, &self.device)?)
    }

    /// Read checkpoint `index` flattened in layout order.
    ///
    /// # Errors
    ///
    /// Returns an error if the checkpoint is missing or does not match `layout`.
    pub fn load_param_vec(&self, index: usize, layout: &ParamLayout) -> Result<Tensor> {
        layout.param_vec_from_map(&self.load(index)?)
    }

    /// Overwrite the model parameters with checkpoint `index`.
    ///
    /// # Errors
    ///
    /// Returns an error if the checkpoint is missing or does not match `layout`.
    pub fn load_into(&self, index: usize, layout: &ParamLayout) -> Result<()> {
        layout.load_map(&self.load(index)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Var;
    use candle_nn::VarMap;
    use tempfile::TempDir;

    fn layout(values: &[f32]) -> (VarMap, ParamLayout) {
        let map = VarMap::new();
        map.data().lock().unwrap().insert(
            "w".to_string(),
            Var::from_tensor(&Tensor::new(values, &Device::Cpu).unwrap()).unwrap(),
        );
        let layout = ParamLayout::from_var_map(&map).unwrap();
        (map, layout)
    }

    #[test]
    fn test_save_and_load_param_vec() {
        let tmp = TempDir::new().unwrap();
        let store = CheckpointStore::create(tmp.path().join("samples"), &Device::Cpu).unwrap();
        let (_map, layout) = layout(&[1.0, 2.0, 3.0]);

        let path = store.save(0, &layout).unwrap();
        assert!(path.ends_with("checkpoint_0.safetensors"));
        let flat: Vec<f32> = store.load_param_vec(0, &layout).unwrap().to_vec1().unwrap();
        assert_eq!(flat, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_load_into_restores_parameters() {
        let tmp = TempDir::new().unwrap();
        let store = CheckpointStore::create(tmp.path(), &Device::Cpu).unwrap();
        let (_map, layout) = layout(&[1.0, 2.0]);
        store.save(0, &layout).unwrap();

        layout
            .set_params(&Tensor::new(&[9.0f32, 9.0], &Device::Cpu).unwrap())
            .unwrap();
        store.load_into(0, &layout).unwrap();
        let flat: Vec<f32> = layout.param_vec().unwrap().to_vec1().unwrap();
        assert_eq!(flat, vec![1.0, 2.0]);
    }

    #[test]
    fn test_count_is_contiguous() {
        let tmp = TempDir::new().unwrap();
        let store = CheckpointStore::create(tmp.path(), &Device::Cpu).unwrap();
        let (_map, layout) = layout(&[0.0]);
        assert_eq!(store.count(), 0);
        store.save(0, &layout).unwrap();
        store.save(1, &layout).unwrap();
        store.save(3, &layout).unwrap();
        assert_eq!(store.count(), 2);
        assert!(store.contains(3));
        assert!(!store.contains(2));
    }

    #[test]
    fn test_missing_checkpoint() {
        let tmp = TempDir::new().unwrap();
        let store = CheckpointStore::create(tmp.path(), &Device::Cpu).unwrap();
        match store.load(7) {
            Err(SubspaceError::CheckpointNotFound { index, path }) => {
                assert_eq!(index, 7);
                assert!(path.ends_with("checkpoint_7.safetensors"));
            }
            other => panic!("expected CheckpointNotFound, got {other:?}"),
        }
    }

    #[test]
    fn test_open_requires_directory() {
        let tmp = TempDir::new().unwrap();
        assert!(CheckpointStore::open(tmp.path().join("missing"), &Device::Cpu).is_err());
        assert!(CheckpointStore::open(tmp.path(), &Device::Cpu).is_ok());
    }
}
