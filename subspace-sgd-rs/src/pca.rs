//! Subspace extraction from sampled parameter trajectories.
//!
//! Samples are stacked as the columns of `W` (`n × m`, `n` parameters, `m`
//! samples). Since `m ≪ n`, the decomposition is done on the small Gram matrix
//! `WcᵀWc` (`m × m`) instead of the `n × n` covariance:
//!
//! ```text
//! Wc      = W - colmean(W)
//! WcᵀWc   = V Λ Vᵀ           (eigenvalues ascending)
//! S       = sqrt(Λ)
//! Q       = Wc V[:, m-d..] / S[m-d..]
//! ```
//!
//! The columns of `Q` are the `d` leading left singular vectors of `Wc`, hence
//! orthonormal. Projection onto the subspace is `Q (Qᵀ v)`.

use std::time::{Duration, Instant};

use candle_core::{DType, Device, Tensor};
use nalgebra::{DMatrix, SymmetricEigen};

use crate::checkpoint::CheckpointStore;
use crate::error::{Result, SubspaceError};
use crate::params::ParamLayout;

/// Relative singular-value floor below which a direction is degenerate.
const SINGULAR_VALUE_FLOOR: f64 = 1e-6;

/// Stack flat parameter vectors as the columns of a sample matrix.
///
/// # Errors
///
/// Returns an error if `columns` is empty or the vectors differ in length.
pub fn sample_matrix(columns: &[Tensor]) -> Result<Tensor> {
    if columns.is_empty() {
        return Err(SubspaceError::Decomposition("no samples to stack".into()));
    }
    Ok(Tensor::stack(columns, 1)?)
}

/// Subtract from every column its mean over the parameter axis.
///
/// # Errors
///
/// Returns an error if `w` is not a matrix.
pub fn center(w: &Tensor) -> Result<Tensor> {
    let means = w.mean_keepdim(0)?;
    Ok(w.broadcast_sub(&means)?)
}

/// Spectral decomposition of a sample matrix.
///
/// Returns `(S, V)`: the singular values of the centred matrix in ascending
/// order (length `m`) and the matching right singular vectors as the columns
/// of `V` (`m × m`).
///
/// # Errors
///
/// Returns [`SubspaceError::Decomposition`] if `w` is not a matrix with at
/// least two columns, or if the Gram matrix is not finite.
pub fn pca(w: &Tensor) -> Result<(Tensor, Tensor)> {
    let spectrum = decompose(w)?;
    let device = w.device();
    let m = spectrum.singular.len();
    #[allow(clippy::cast_possible_truncation)]
    let s: Vec<f32> = spectrum.singular.iter().map(|&x| x as f32).collect();
    #[allow(clippy::cast_possible_truncation)]
    let v: Vec<f32> = spectrum.vectors.iter().map(|&x| x as f32).collect();
    Ok((
        Tensor::from_vec(s, m, device)?,
        Tensor::from_vec(v, (m, m), device)?,
    ))
}

/// Centred samples and Gram spectrum, all in f64.
///
/// Trajectory samples share one large initialisation and differ by small
/// steps, so the small eigenvalues of `WcᵀWc` do not survive f32 rounding.
struct Spectrum {
    wc: Tensor,
    /// Ascending singular values.
    singular: Vec<f64>,
    /// Row-major `m × m`, columns in the order of `singular`.
    vectors: Vec<f64>,
}

fn decompose(w: &Tensor) -> Result<Spectrum> {
    if w.rank() != 2 {
        return Err(SubspaceError::Decomposition(format!(
            "sample matrix must be rank 2, got shape {:?}",
            w.dims()
        )));
    }
    let (_, m) = w.dims2()?;
    if m < 2 {
        return Err(SubspaceError::Decomposition(format!(
            "need at least 2 samples, got {m}"
        )));
    }

    let wc = center(&w.to_dtype(DType::F64)?)?;
    let gram = wc.t()?.contiguous()?.matmul(&wc)?;
    let rows: Vec<Vec<f64>> = gram.to_device(&Device::Cpu)?.to_vec2()?;
    if rows.iter().flatten().any(|x| !x.is_finite()) {
        return Err(SubspaceError::Decomposition(
            "Gram matrix contains non-finite values".into(),
        ));
    }

    let eigen = SymmetricEigen::new(DMatrix::from_fn(m, m, |i, j| rows[i][j]));
    let mut order: Vec<usize> = (0..m).collect();
    order.sort_by(|&a, &b| eigen.eigenvalues[a].total_cmp(&eigen.eigenvalues[b]));

    let singular = order
        .iter()
        .map(|&k| eigen.eigenvalues[k].max(0.0).sqrt())
        .collect();
    let vectors = (0..m)
        .flat_map(|row| order.iter().map(move |&k| (row, k)))
        .map(|(row, k)| eigen.eigenvectors[(row, k)])
        .collect();

    Ok(Spectrum {
        wc,
        singular,
        vectors,
    })
}

/// Orthonormal basis of a low-dimensional subspace of parameter space.
///
/// # Example
///
/// ```rust
/// use candle_core::{Device, Tensor};
/// use subspace_sgd_rs::pca::SubspaceBasis;
///
/// # fn main() -> subspace_sgd_rs::Result<()> {
/// // 4 parameters, 3 samples
/// let w = Tensor::new(
///     &[[0.0f32, 1.0, 2.0], [1.0, 0.0, 4.0], [2.0, 3.0, 1.0], [5.0, 1.0, 0.0]],
///     &Device::Cpu,
/// )?;
/// let basis = SubspaceBasis::from_samples(&w, 2)?;
/// assert_eq!(basis.dim(), 2);
/// assert!(basis.orthonormality_error()? < 1e-4);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct SubspaceBasis {
    q: Tensor,
    q_t: Tensor,
    singular_values: Vec<f32>,
}

impl SubspaceBasis {
    /// Basis spanned by the `dim` leading principal directions of `w`.
    ///
    /// # Errors
    ///
    /// Returns [`SubspaceError::Config`] if `dim` is zero or exceeds the
    /// number of samples, and [`SubspaceError::Decomposition`] if any selected
    /// direction has a vanishing singular value.
    pub fn from_samples(w: &Tensor, dim: usize) -> Result<Self> {
        let m = w.dims().get(1).copied().unwrap_or(0);
        if m < 2 {
            return Err(SubspaceError::Config(format!(
                "need at least 2 samples for a subspace, got {m}"
            )));
        }
        if dim == 0 || dim > m {
            return Err(SubspaceError::Config(format!(
                "subspace dimension {dim} must be in 1..={m}"
            )));
        }

        let Spectrum {
            wc,
            singular,
            vectors,
        } = decompose(w)?;
        let idx = m - dim;

        let s_max = singular.last().copied().unwrap_or(0.0);
        let selected = &singular[idx..];
        if s_max <= 0.0 || selected.iter().any(|&x| x <= SINGULAR_VALUE_FLOOR * s_max) {
            return Err(SubspaceError::Decomposition(format!(
                "degenerate sample matrix: singular values {selected:?} for dim {dim}"
            )));
        }

        let device = w.device();
        let v = Tensor::from_vec(vectors, (m, m), device)?;
        let v_sel = v.narrow(1, idx, dim)?.contiguous()?;
        let s_sel = Tensor::from_slice(selected, (1, dim), device)?;
        let q = wc
            .matmul(&v_sel)?
            .broadcast_div(&s_sel)?
            .to_dtype(DType::F32)?;
        let q_t = q.t()?.contiguous()?;
        #[allow(clippy::cast_possible_truncation)]
        let selected = selected.iter().map(|&x| x as f32).collect();

        Ok(Self {
            q,
            q_t,
            singular_values: selected,
        })
    }

    /// Subspace dimension `d`.
    #[must_use]
    pub fn dim(&self) -> usize {
        self.q.dims()[1]
    }

    /// Ambient dimension `n`.
    #[must_use]
    pub fn num_params(&self) -> usize {
        self.q.dims()[0]
    }

    /// The `n × d` basis matrix.
    #[must_use]
    pub const fn q(&self) -> &Tensor {
        &self.q
    }

    /// Singular values of the selected directions, ascending.
    #[must_use]
    pub fn singular_values(&self) -> &[f32] {
        &self.singular_values
    }

    /// Coordinates `Qᵀ v` of a flat vector.
    ///
    /// # Errors
    ///
    /// Returns [`SubspaceError::DimensionMismatch`] if `v` has the wrong length.
    pub fn coordinates(&self, v: &Tensor) -> Result<Tensor> {
        if v.rank() != 1 || v.elem_count() != self.num_params() {
            return Err(SubspaceError::DimensionMismatch {
                expected: self.num_params(),
                actual: v.elem_count(),
            });
        }
        let v = v.to_dtype(self.q.dtype())?.unsqueeze(1)?;
        Ok(self.q_t.matmul(&v)?.squeeze(1)?)
    }

    /// Orthogonal projection `Q (Qᵀ v)` of a flat vector.
    ///
    /// # Errors
    ///
    /// Returns [`SubspaceError::DimensionMismatch`] if `v` has the wrong length.
    pub fn project(&self, v: &Tensor) -> Result<Tensor> {
        let coords = self.coordinates(v)?.unsqueeze(1)?;
        Ok(self.q.matmul(&coords)?.squeeze(1)?)
    }

    /// Largest absolute entry of `QᵀQ - I`.
    ///
    /// # Errors
    ///
    /// Returns an error if a tensor operation fails.
    pub fn orthonormality_error(&self) -> Result<f32> {
        let gram: Vec<Vec<f32>> = self.q_t.matmul(&self.q)?.to_dtype(DType::F32)?.to_vec2()?;
        let worst = gram
            .iter()
            .enumerate()
            .flat_map(|(i, row)| {
                row.iter()
                    .enumerate()
                    .map(move |(j, &x)| if i == j { (x - 1.0).abs() } else { x.abs() })
            })
            .fold(0.0f32, f32::max);
        Ok(worst)
    }
}

/// Build the PSGD basis from the checkpoints of an SGD run.
///
/// Loads checkpoints `0..=samples` (checkpoint 0 is the initialisation),
/// stacks them and keeps the `dim` leading directions. Returns the basis and
/// the time spent in the decomposition.
///
/// # Errors
///
/// Returns an error if a checkpoint is missing or does not match `layout`,
/// or if the decomposition fails.
pub fn get_subspace(
    store: &CheckpointStore,
    layout: &ParamLayout,
    samples: usize,
    dim: usize,
) -> Result<(SubspaceBasis, Duration)> {
    let columns = (0..=samples)
        .map(|i| store.load_param_vec(i, layout))
        .collect::<Result<Vec<_>>>()?;
    let w = sample_matrix(&columns)?;

    let start = Instant::now();
    let basis = SubspaceBasis::from_samples(&w, dim)?;
    let elapsed = start.elapsed();

    tracing::info!("PCA time consumed: {:.3}s", elapsed.as_secs_f64());
    tracing::info!("W: {:?}", w.dims());
    tracing::info!("Q: {:?}", basis.q().dims());

    Ok((basis, elapsed))
}
