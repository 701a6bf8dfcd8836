//! Training-free model fusion
//!
//! This crate merges fine-tuned models that share a pretrained ancestor by
//! arithmetic on their task vectors (fine-tuned minus pretrained weights):
//! - Task Arithmetic: scaled sum of task vectors
//! - Iso-C: isotropic merging in the common subspace of the summed task vectors
//! - Iso-CTS: isotropic merging in a common subspace plus orthogonal
//!   task-specific subspaces
//!
//! Any of them can be restricted to a range of encoder layers or to one
//! named module, with every other parameter taken from the plain average of
//! the fine-tuned models.
//!
//! ```ignore
//! use model_fusion::{FusionDriver, IsoCtsConfig, MergeStrategy, RegionConfig};
//!
//! let driver = FusionDriver::new(
//!     MergeStrategy::IsoCts(IsoCtsConfig::with_fraction(0.8)),
//!     RegionConfig::from_env()?,
//! )?;
//! let merged = driver.run(&pool)?;
//! ```

mod driver;
mod error;
mod iso;
mod linalg;
mod linear;
mod pool;
mod region;
mod state_dict;
mod task_arithmetic;
mod task_vector;
mod weights;

pub use driver::{load_task_vectors, run_merge, FusionDriver, TaskVectorMerge};
pub use error::{MergeError, Result};
pub use iso::{
    common_directions, iso_c_matrix, iso_cts_matrix, CommonTaskSplit, IsoCConfig, IsoCMerger,
    IsoCtsConfig, IsoCtsMerger,
};
pub use linalg::{isotropic_reconstruct, project, Svd, RANK_RTOL};
pub use linear::SimpleAverage;
pub use pool::{InMemoryModelPool, ModelPool, PRETRAINED_MODEL_NAME};
pub use region::{
    layer_index, LayerPreset, LayerRange, LayerSelection, RegionConfig, RegionPolicy,
    RegionRestrictor,
};
pub use state_dict::{
    state_dict_add, state_dict_avg, state_dict_interpolate, state_dict_mul, state_dict_sub,
    state_dict_sum, StateDict,
};
pub use task_arithmetic::{TaskArithmeticConfig, TaskArithmeticMerger};
pub use task_vector::{check_parameter_names_match, extract_task_vectors, task_vector};
pub use weights::{ModelWeights, WeightTensor};

use serde::{Deserialize, Serialize};

/// Merge strategy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Scaled sum of task vectors
    TaskArithmetic(TaskArithmeticConfig),
    /// Isotropic merging in the common subspace
    IsoC(IsoCConfig),
    /// Isotropic merging in common and task-specific subspaces
    IsoCts(IsoCtsConfig),
}

impl Default for MergeStrategy {
    fn default() -> Self {
        Self::TaskArithmetic(TaskArithmeticConfig::default())
    }
}
