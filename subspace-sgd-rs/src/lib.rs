//! # subspace-sgd-rs
//!
//! Stochastic gradient descent restricted to low-dimensional subspaces of
//! parameter space.
//!
//! Training trajectories are sampled during ordinary SGD, stacked into a
//! sample matrix and decomposed with PCA. The leading principal directions
//! span a subspace in which training can continue:
//!
//! - **SGD** trains normally and writes trajectory samples as checkpoints.
//! - **PSGD** trains inside the fixed subspace of those checkpoints by
//!   projecting the initialisation and every gradient.
//! - **BSGD** alternates SGD blocks with PSGD blocks whose subspace is
//!   rebuilt from the most recent in-memory samples.
//!
//! ## Quick Start (CLI)
//!
//! ```bash
//! # Write a starting configuration
//! subspace-sgd init sgd.yaml --preset sgd
//!
//! # Validate and train
//! subspace-sgd validate sgd.yaml
//! subspace-sgd train sgd.yaml
//!
//! # Train in the subspace of the SGD run
//! subspace-sgd init psgd.yaml --preset psgd
//! subspace-sgd train psgd.yaml
//! ```
//!
//! ## Quick Start (Library)
//!
//! ```no_run
//! use subspace_sgd_rs::{ExperimentConfig, Trainer};
//!
//! # fn main() -> subspace_sgd_rs::Result<()> {
//! let config = ExperimentConfig::from_preset("bsgd")?.with_epochs(11);
//! let mut trainer = Trainer::new(config)?;
//! let summary = trainer.train()?;
//! if let Some(eval) = summary.final_evaluation() {
//!     println!("test accuracy {:.2}%", eval.accuracy * 100.0);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Working With Subspaces Directly
//!
//! ```rust
//! use candle_core::{Device, Tensor};
//! use subspace_sgd_rs::pca::SubspaceBasis;
//!
//! # fn main() -> subspace_sgd_rs::Result<()> {
//! // 3 samples of a 4-parameter model, one per column
//! let w = Tensor::new(
//!     &[[0.0f32, 1.0, 3.0], [2.0, 1.0, 0.0], [1.0, 4.0, 2.0], [0.0, 0.0, 5.0]],
//!     &Device::Cpu,
//! )?;
//! let basis = SubspaceBasis::from_samples(&w, 2)?;
//! let g = Tensor::new(&[1.0f32, 1.0, 1.0, 1.0], &Device::Cpu)?;
//! let projected = basis.project(&g)?;
//! assert_eq!(projected.dims(), &[4]);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::pedantic)]

pub mod checkpoint;
pub mod config;
pub mod dataset;
pub mod error;
pub mod evaluator;
pub mod metrics;
pub mod model;
pub mod optimizer;
pub mod params;
pub mod pca;
pub mod sampler;
pub mod scheduler;
pub mod trainer;

pub use config::{Algorithm, ExperimentConfig};
pub use error::{Result, SubspaceError};
pub use trainer::{RunSummary, Trainer};
