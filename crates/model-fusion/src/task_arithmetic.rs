//! Task Arithmetic: the scaled sum of task vectors added to the pretrained
//! parameters

use crate::iso::validate_scaling;
use crate::state_dict::{state_dict_add, state_dict_mul, state_dict_sum, StateDict};
use crate::task_vector::extract_task_vectors;
use crate::Result;
use serde::{Deserialize, Serialize};

/// Task Arithmetic configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskArithmeticConfig {
    /// Scaling factor for the summed task vector
    pub scaling_factor: f32,
}

impl Default for TaskArithmeticConfig {
    fn default() -> Self {
        Self {
            scaling_factor: 0.3,
        }
    }
}

impl TaskArithmeticConfig {
    /// Create config with a specific scaling factor
    pub fn with_scaling(scaling_factor: f32) -> Self {
        Self { scaling_factor }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        validate_scaling(self.scaling_factor)
    }
}

/// Task Arithmetic merger
#[derive(Debug, Clone, Default)]
pub struct TaskArithmeticMerger {
    /// Configuration
    config: TaskArithmeticConfig,
}

impl TaskArithmeticMerger {
    /// Create new Task Arithmetic merger
    pub fn new(config: TaskArithmeticConfig) -> Self {
        Self { config }
    }

    /// Configuration
    pub fn config(&self) -> &TaskArithmeticConfig {
        &self.config
    }

    /// Unweighted sum of the task vectors
    pub fn merge_task_vectors(&self, task_vectors: &[StateDict]) -> Result<StateDict> {
        state_dict_sum(task_vectors)
    }

    /// `pretrained + scaling_factor * Σ (finetuned_i - pretrained)` on bare
    /// parameter sets
    pub fn merge_state_dicts(
        &self,
        pretrained: &StateDict,
        finetuned: &[StateDict],
    ) -> Result<StateDict> {
        self.config.validate()?;
        let task_vectors = extract_task_vectors(pretrained, finetuned)?;
        let merged = self.merge_task_vectors(&task_vectors)?;
        let scaled = state_dict_mul(&merged, self.config.scaling_factor);
        state_dict_add(pretrained, &scaled)
    }
}
