//! Unweighted weight averaging ("model soup")

use crate::pool::ModelPool;
use crate::state_dict::{state_dict_add, state_dict_avg, state_dict_mul, StateDict};
use crate::{MergeError, ModelWeights, Result};
use tracing::debug;

/// Plain average of every fine-tuned model in a pool
#[derive(Debug, Clone, Copy, Default)]
pub struct SimpleAverage;

impl SimpleAverage {
    /// Create new averaging driver
    pub fn new() -> Self {
        Self
    }

    /// Average bare parameter sets
    pub fn average(&self, models: &[StateDict]) -> Result<StateDict> {
        state_dict_avg(models)
    }

    /// Load every fine-tuned model from the pool and average them.
    ///
    /// Models are accumulated one at a time, so at most two parameter sets
    /// are alive at once. The result is loaded into a pretrained handle.
    pub fn run(&self, pool: &dyn ModelPool) -> Result<ModelWeights> {
        let names = pool.model_names();
        if names.is_empty() {
            return Err(MergeError::EmptyModelPool);
        }

        let mut sum: Option<StateDict> = None;
        for name in &names {
            let model = pool.load_model(name)?;
            sum = Some(match sum {
                None => model.into_state_dict(),
                Some(acc) => state_dict_add(&acc, model.state_dict())?,
            });
            debug!(model = %name, "accumulated for average");
        }

        let sum = sum.ok_or(MergeError::EmptyModelPool)?;
        let averaged = state_dict_mul(&sum, 1.0 / names.len() as f32);

        let mut model = pool.load_pretrained_model()?;
        model.load_state_dict(averaged)?;
        model.name = "average".into();
        Ok(model)
    }
}
