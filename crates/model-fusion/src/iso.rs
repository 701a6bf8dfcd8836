//! Isotropic merging in a common subspace (Iso-C) and in common plus
//! task-specific subspaces (Iso-CTS)
//!
//! Both work one parameter at a time:
//! - Iso-C sums the task vectors and flattens the singular value spectrum of
//!   the sum, keeping its singular directions.
//! - Iso-CTS builds a shared basis from each task's leading directions, gives
//!   every task a residual basis orthogonal to the shared one and to the
//!   residual bases of earlier tasks, and reconstructs each part isotropically.
//!
//! Excluded keys, tensors with fewer than two dimensions, and keys whose
//! decomposition degenerates fall back to plain summation.

use crate::linalg::{
    from_matrix, hstack, isotropic_reconstruct, matrix_dims, orthonormal_basis, project, to_matrix,
    Svd, RANK_RTOL,
};
use crate::state_dict::StateDict;
use crate::task_vector::check_parameter_names_match;
use crate::{MergeError, Result, WeightTensor};
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::debug;

/// Iso-C configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IsoCConfig {
    /// Scaling factor applied to the merged task vector
    pub scaling_factor: f32,
    /// Keys merged by plain summation instead of decomposition
    pub exclude_keys: HashSet<String>,
}

impl Default for IsoCConfig {
    fn default() -> Self {
        Self {
            scaling_factor: 1.0,
            exclude_keys: HashSet::new(),
        }
    }
}

impl IsoCConfig {
    /// Create config with a specific scaling factor
    pub fn with_scaling(scaling_factor: f32) -> Self {
        Self {
            scaling_factor,
            ..Default::default()
        }
    }

    /// Add keys that bypass the decomposition
    pub fn exclude<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude_keys.extend(keys.into_iter().map(Into::into));
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        validate_scaling(self.scaling_factor)
    }
}

/// Iso-CTS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IsoCtsConfig {
    /// Scaling factor applied to the merged task vector
    pub scaling_factor: f32,
    /// Share of each task's rank seeding the common subspace (0.0 - 1.0)
    pub common_space_fraction: f64,
    /// Keys merged by plain summation instead of decomposition
    pub exclude_keys: HashSet<String>,
}

impl Default for IsoCtsConfig {
    fn default() -> Self {
        Self {
            scaling_factor: 1.5,
            common_space_fraction: 0.8,
            exclude_keys: HashSet::new(),
        }
    }
}

impl IsoCtsConfig {
    /// Create config with a specific common space fraction
    pub fn with_fraction(common_space_fraction: f64) -> Self {
        Self {
            common_space_fraction,
            ..Default::default()
        }
    }

    /// Add keys that bypass the decomposition
    pub fn exclude<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude_keys.extend(keys.into_iter().map(Into::into));
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        validate_scaling(self.scaling_factor)?;
        validate_fraction(self.common_space_fraction)
    }
}

pub(crate) fn validate_scaling(scaling_factor: f32) -> Result<()> {
    if !scaling_factor.is_finite() {
        return Err(MergeError::ConfigError(format!(
            "scaling_factor must be finite, got {scaling_factor}"
        )));
    }
    Ok(())
}

fn validate_fraction(common_space_fraction: f64) -> Result<()> {
    if !(0.0..=1.0).contains(&common_space_fraction) {
        return Err(MergeError::ConfigError(format!(
            "common_space_fraction must be within [0, 1], got {common_space_fraction}"
        )));
    }
    Ok(())
}

/// Number of leading directions a task contributes to the common subspace,
/// `floor(rank * fraction)`, for a fraction within `[0, 1]`
pub fn common_directions(rank: usize, common_space_fraction: f64) -> usize {
    let product = rank as f64 * common_space_fraction;
    // absorb representation error such as 0.29 * 100 = 28.999999999999996
    (product + 1e-9).floor() as usize
}

/// Iso-C for one matrix: isotropic reconstruction of the summed deltas
pub fn iso_c_matrix(deltas: &[DMatrix<f64>]) -> Result<DMatrix<f64>> {
    let total = sum_matrices(deltas)?;
    let svd = Svd::compute(&total)?;
    Ok(svd.isotropic(svd.relative_rank()))
}

/// Iso-CTS decomposition of one parameter
#[derive(Debug, Clone)]
pub struct CommonTaskSplit {
    /// Isotropic reconstruction of the summed deltas inside the common subspace
    pub common: DMatrix<f64>,
    /// Per-task isotropic reconstructions inside their residual subspaces
    pub task_specific: Vec<DMatrix<f64>>,
    /// Dimension of the common subspace
    pub common_rank: usize,
    /// Dimension of each task's residual subspace
    pub task_ranks: Vec<usize>,
}

impl CommonTaskSplit {
    /// Shared component plus every task-specific component
    pub fn merged(&self) -> DMatrix<f64> {
        self.task_specific
            .iter()
            .fold(self.common.clone(), |acc, part| acc + part)
    }
}

/// Iso-CTS for one matrix
pub fn iso_cts_matrix(
    deltas: &[DMatrix<f64>],
    common_space_fraction: f64,
) -> Result<CommonTaskSplit> {
    validate_fraction(common_space_fraction)?;
    let total = sum_matrices(deltas)?;
    let rows = total.nrows();
    let svds = deltas.iter().map(Svd::compute).collect::<Result<Vec<_>>>()?;
    let scale = svds.iter().map(Svd::max_singular_value).fold(0.0, f64::max);

    let mut candidates = DMatrix::zeros(rows, 0);
    for svd in &svds {
        let take = common_directions(svd.relative_rank(), common_space_fraction);
        candidates = hstack(&candidates, &svd.leading_left(take));
    }
    let common_basis = orthonormal_basis(&candidates, RANK_RTOL)?;
    let common = isotropic_reconstruct(&project(&common_basis, &total), scale * RANK_RTOL)?;

    let mut residual_bases = DMatrix::zeros(rows, 0);
    let mut task_specific = Vec::with_capacity(deltas.len());
    let mut task_ranks = Vec::with_capacity(deltas.len());
    for (delta, svd) in deltas.iter().zip(&svds) {
        let tol = svd.max_singular_value() * RANK_RTOL;
        let residual = delta - project(&common_basis, delta);

        let residual_svd = Svd::compute(&residual)?;
        let directions = residual_svd.leading_left(residual_svd.rank(tol));
        let fresh = &directions - project(&residual_bases, &directions);
        let basis = orthonormal_basis(&fresh, RANK_RTOL)?;

        task_specific.push(isotropic_reconstruct(&project(&basis, &residual), tol)?);
        task_ranks.push(basis.ncols());
        residual_bases = hstack(&residual_bases, &basis);
    }

    Ok(CommonTaskSplit {
        common,
        task_specific,
        common_rank: common_basis.ncols(),
        task_ranks,
    })
}

fn sum_matrices(deltas: &[DMatrix<f64>]) -> Result<DMatrix<f64>> {
    let (first, rest) = deltas
        .split_first()
        .ok_or_else(|| MergeError::InvalidWeights("No task vectors provided".into()))?;
    if let Some(bad) = rest.iter().find(|d| d.shape() != first.shape()) {
        return Err(MergeError::InvalidWeights(format!(
            "task vector matrices differ in shape: {}x{} vs {}x{}",
            first.nrows(),
            first.ncols(),
            bad.nrows(),
            bad.ncols()
        )));
    }
    Ok(rest.iter().fold(first.clone(), |acc, d| acc + d))
}

fn sum_tensors(tensors: &[&WeightTensor]) -> Result<WeightTensor> {
    let (first, rest) = tensors
        .split_first()
        .ok_or_else(|| MergeError::InvalidWeights("No tensors provided".into()))?;
    rest.iter().try_fold((*first).clone(), |acc, t| acc.add(t))
}

/// Run `solve` on every decomposable key, summing the rest.
///
/// `solve` receives the per-task matrices of one key; a
/// `DegenerateSubspace` error from it is absorbed into the summation
/// fallback for that key only.
fn merge_by_key<F>(
    task_vectors: &[StateDict],
    exclude_keys: &HashSet<String>,
    mut solve: F,
) -> Result<StateDict>
where
    F: FnMut(&str, &[DMatrix<f64>]) -> Result<DMatrix<f64>>,
{
    let reference = task_vectors
        .first()
        .ok_or_else(|| MergeError::InvalidWeights("No task vectors provided".into()))?;
    check_parameter_names_match(task_vectors)?;

    let mut merged = StateDict::new();
    for key in reference.keys() {
        let tensors = task_vectors
            .iter()
            .map(|tv| tv.require(key))
            .collect::<Result<Vec<_>>>()?;
        let summed = sum_tensors(&tensors)?;

        if exclude_keys.contains(key) {
            debug!(key, "excluded key, summing task vectors");
            merged.insert(summed);
            continue;
        }
        if matrix_dims(&summed).is_none() {
            merged.insert(summed);
            continue;
        }

        let matrices = tensors
            .iter()
            .map(|t| to_matrix(t))
            .collect::<Result<Vec<_>>>()?;
        match solve(key, &matrices) {
            Ok(m) => merged.insert(from_matrix(&m, &summed)),
            Err(MergeError::DegenerateSubspace(reason)) => {
                debug!(key, %reason, "degenerate subspace, summing task vectors");
                merged.insert(summed);
            }
            Err(e) => return Err(e),
        }
    }

    Ok(merged)
}

/// Iso-C merger
#[derive(Debug, Clone, Default)]
pub struct IsoCMerger {
    /// Configuration
    config: IsoCConfig,
}

impl IsoCMerger {
    /// Create new Iso-C merger
    pub fn new(config: IsoCConfig) -> Self {
        Self { config }
    }

    /// Configuration
    pub fn config(&self) -> &IsoCConfig {
        &self.config
    }

    /// Merge task vectors into one, key by key
    pub fn merge_task_vectors(&self, task_vectors: &[StateDict]) -> Result<StateDict> {
        merge_by_key(task_vectors, &self.config.exclude_keys, |key, deltas| {
            let merged = iso_c_matrix(deltas)?;
            debug!(key, rows = merged.nrows(), cols = merged.ncols(), "iso-c");
            Ok(merged)
        })
    }
}

/// Iso-CTS merger
#[derive(Debug, Clone, Default)]
pub struct IsoCtsMerger {
    /// Configuration
    config: IsoCtsConfig,
}

impl IsoCtsMerger {
    /// Create new Iso-CTS merger
    pub fn new(config: IsoCtsConfig) -> Self {
        Self { config }
    }

    /// Configuration
    pub fn config(&self) -> &IsoCtsConfig {
        &self.config
    }

    /// Merge task vectors into one, key by key
    pub fn merge_task_vectors(&self, task_vectors: &[StateDict]) -> Result<StateDict> {
        self.config.validate()?;
        let fraction = self.config.common_space_fraction;
        merge_by_key(task_vectors, &self.config.exclude_keys, |key, deltas| {
            let split = iso_cts_matrix(deltas, fraction)?;
            debug!(
                key,
                common_rank = split.common_rank,
                task_ranks = ?split.task_ranks,
                "iso-cts"
            );
            Ok(split.merged())
        })
    }
}
