//! Merge pipeline shared by every algorithm
//!
//! 1. Load the pretrained model and compute one task vector per fine-tuned
//!    model, dropping each fine-tuned model right after.
//! 2. Combine the task vectors with the algorithm's rule.
//! 3. `pretrained + scaling_factor * merged_task_vector`.
//! 4. Apply the region restriction, if any, against the plain average.
//! 5. Load the result into the pretrained handle and return it.

use crate::iso::{IsoCMerger, IsoCtsMerger};
use crate::linear::SimpleAverage;
use crate::pool::ModelPool;
use crate::region::{RegionConfig, RegionRestrictor};
use crate::state_dict::{state_dict_add, state_dict_mul, StateDict};
use crate::task_arithmetic::TaskArithmeticMerger;
use crate::task_vector::{check_parameter_names_match, task_vector};
use crate::{MergeError, MergeStrategy, ModelWeights, Result};
use tracing::{debug, info};

/// An algorithm that turns task vectors into one merged task vector
pub trait TaskVectorMerge {
    /// Short algorithm name used in logs
    fn name(&self) -> &'static str;

    /// Factor applied to the merged task vector
    fn scaling_factor(&self) -> f32;

    /// Validate the merger's configuration
    fn validate(&self) -> Result<()>;

    /// Combine task vectors that share one key set
    fn merge_task_vectors(&self, task_vectors: &[StateDict]) -> Result<StateDict>;

    /// Merge every model of the pool without region restriction
    fn run(&self, pool: &dyn ModelPool) -> Result<ModelWeights> {
        run_merge(self, pool, &RegionConfig::default())
    }

    /// Merge every model of the pool, keeping merged values only inside
    /// `region`
    fn run_with_region(&self, pool: &dyn ModelPool, region: &RegionConfig) -> Result<ModelWeights> {
        run_merge(self, pool, region)
    }
}

impl TaskVectorMerge for TaskArithmeticMerger {
    fn name(&self) -> &'static str {
        "task_arithmetic"
    }

    fn scaling_factor(&self) -> f32 {
        self.config().scaling_factor
    }

    fn validate(&self) -> Result<()> {
        self.config().validate()
    }

    fn merge_task_vectors(&self, task_vectors: &[StateDict]) -> Result<StateDict> {
        TaskArithmeticMerger::merge_task_vectors(self, task_vectors)
    }
}

impl TaskVectorMerge for IsoCMerger {
    fn name(&self) -> &'static str {
        "iso_c"
    }

    fn scaling_factor(&self) -> f32 {
        self.config().scaling_factor
    }

    fn validate(&self) -> Result<()> {
        self.config().validate()
    }

    fn merge_task_vectors(&self, task_vectors: &[StateDict]) -> Result<StateDict> {
        IsoCMerger::merge_task_vectors(self, task_vectors)
    }
}

impl TaskVectorMerge for IsoCtsMerger {
    fn name(&self) -> &'static str {
        "iso_cts"
    }

    fn scaling_factor(&self) -> f32 {
        self.config().scaling_factor
    }

    fn validate(&self) -> Result<()> {
        self.config().validate()
    }

    fn merge_task_vectors(&self, task_vectors: &[StateDict]) -> Result<StateDict> {
        IsoCtsMerger::merge_task_vectors(self, task_vectors)
    }
}

/// Load the pretrained model and the task vector of every pool model, in
/// pool order
pub fn load_task_vectors(pool: &dyn ModelPool) -> Result<(ModelWeights, Vec<StateDict>)> {
    let names = pool.model_names();
    if names.is_empty() {
        return Err(MergeError::EmptyModelPool);
    }

    let pretrained = pool.load_pretrained_model()?;
    let mut task_vectors = Vec::with_capacity(names.len());
    for (i, name) in names.iter().enumerate() {
        let finetuned = pool.load_model(name)?;
        task_vectors.push(task_vector(
            pretrained.state_dict(),
            finetuned.state_dict(),
            i,
        )?);
        drop(finetuned);
        debug!(model = %name, "task vector extracted");
    }
    check_parameter_names_match(&task_vectors)?;

    Ok((pretrained, task_vectors))
}

/// Full merge pipeline for any algorithm
pub fn run_merge<M>(
    merger: &M,
    pool: &dyn ModelPool,
    region: &RegionConfig,
) -> Result<ModelWeights>
where
    M: TaskVectorMerge + ?Sized,
{
    merger.validate()?;
    region.validate()?;
    info!(
        algorithm = merger.name(),
        models = pool.len(),
        scaling_factor = merger.scaling_factor(),
        "Fusing models"
    );

    let (mut model, task_vectors) = load_task_vectors(pool)?;
    let merged_tv = merger.merge_task_vectors(&task_vectors)?;
    drop(task_vectors);

    let scaled = state_dict_mul(&merged_tv, merger.scaling_factor());
    let mut merged = state_dict_add(model.state_dict(), &scaled)?;

    let restrictor = RegionRestrictor::from_config(region, || pool.num_encoder_layers())?;
    if let Some(restrictor) = restrictor {
        info!(policy = ?restrictor.policy(), "Restricting merge region");
        let average = SimpleAverage::new().run(pool)?;
        merged = restrictor.apply(merged, average.state_dict())?;
    }

    model.load_state_dict(merged)?;
    model.name = "merged".into();
    info!(
        algorithm = merger.name(),
        params = model.total_params(),
        "Fusion complete"
    );
    Ok(model)
}

impl MergeStrategy {
    /// Validate the carried configuration
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::TaskArithmetic(config) => config.validate(),
            Self::IsoC(config) => config.validate(),
            Self::IsoCts(config) => config.validate(),
        }
    }

    /// Merger for this strategy
    pub fn merger(&self) -> Box<dyn TaskVectorMerge> {
        match self {
            Self::TaskArithmetic(config) => Box::new(TaskArithmeticMerger::new(config.clone())),
            Self::IsoC(config) => Box::new(IsoCMerger::new(config.clone())),
            Self::IsoCts(config) => Box::new(IsoCtsMerger::new(config.clone())),
        }
    }
}

/// Algorithm plus region restriction, validated once at construction
#[derive(Debug, Clone)]
pub struct FusionDriver {
    strategy: MergeStrategy,
    region: RegionConfig,
}

impl FusionDriver {
    /// Create new driver
    pub fn new(strategy: MergeStrategy, region: RegionConfig) -> Result<Self> {
        strategy.validate()?;
        region.validate()?;
        Ok(Self { strategy, region })
    }

    /// Strategy in use
    pub fn strategy(&self) -> &MergeStrategy {
        &self.strategy
    }

    /// Region restriction in use
    pub fn region(&self) -> &RegionConfig {
        &self.region
    }

    /// Merge the pool
    pub fn run(&self, pool: &dyn ModelPool) -> Result<ModelWeights> {
        let merger = self.strategy.merger();
        run_merge(merger.as_ref(), pool, &self.region)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::InMemoryModelPool;
    use crate::{IsoCtsConfig, TaskArithmeticConfig, WeightTensor};

    fn scalar_model(name: &str, entries: &[(&str, f32)]) -> ModelWeights {
        let mut m = ModelWeights::new(name);
        for &(k, v) in entries {
            m.add_layer(WeightTensor::scalar(k, v));
        }
        m
    }

    #[test]
    fn test_load_task_vectors_in_pool_order() {
        let pool = InMemoryModelPool::new(scalar_model("base", &[("w", 1.0)]))
            .with_model("b", scalar_model("b", &[("w", 3.0)]))
            .with_model("a", scalar_model("a", &[("w", 2.0)]));

        let (pretrained, tvs) = load_task_vectors(&pool).unwrap();
        assert_eq!(pretrained.name, "base");
        assert_eq!(tvs[0].get("w").unwrap().data, vec![2.0]);
        assert_eq!(tvs[1].get("w").unwrap().data, vec![1.0]);
    }

    #[test]
    fn test_empty_pool_fails() {
        let pool = InMemoryModelPool::new(scalar_model("base", &[("w", 1.0)]));
        assert!(matches!(
            TaskArithmeticMerger::default().run(&pool),
            Err(MergeError::EmptyModelPool)
        ));
    }

    #[test]
    fn test_mismatched_model_fails_whole_run() {
        let pool = InMemoryModelPool::new(scalar_model("base", &[("w", 1.0)]))
            .with_model("ok", scalar_model("ok", &[("w", 2.0)]))
            .with_model("bad", scalar_model("bad", &[("v", 2.0)]));

        assert!(matches!(
            TaskArithmeticMerger::default().run(&pool),
            Err(MergeError::ParameterNameMismatch { model_index: 1, .. })
        ));
    }

    #[test]
    fn test_driver_rejects_invalid_config() {
        let strategy = MergeStrategy::IsoCts(IsoCtsConfig::with_fraction(2.0));
        let region = RegionConfig::default();
        assert!(FusionDriver::new(strategy, region).is_err());

        let region = RegionConfig {
            layers: Some(crate::LayerSelection::Single(0)),
            module_filter: Some("mlp".into()),
        };
        let strategy = MergeStrategy::TaskArithmetic(TaskArithmeticConfig::default());
        assert!(FusionDriver::new(strategy, region).is_err());
    }

    #[test]
    fn test_run_validates_merger_config() {
        let pool = InMemoryModelPool::new(scalar_model("base", &[("w", 1.0)]))
            .with_model("a", scalar_model("a", &[("w", 2.0)]));

        let merger = TaskArithmeticMerger::new(TaskArithmeticConfig::with_scaling(f32::NAN));
        assert!(matches!(merger.run(&pool), Err(MergeError::ConfigError(_))));

        let merger = IsoCtsMerger::new(IsoCtsConfig::with_fraction(2.0));
        assert!(matches!(
            merger.run_with_region(&pool, &RegionConfig::default()),
            Err(MergeError::ConfigError(_))
        ));

        let merger = IsoCMerger::new(crate::IsoCConfig::with_scaling(f32::INFINITY));
        assert!(matches!(merger.run(&pool), Err(MergeError::ConfigError(_))));
    }

    #[test]
    fn test_strategy_names() {
        let names: Vec<&str> = [
            MergeStrategy::TaskArithmetic(Default::default()),
            MergeStrategy::IsoC(Default::default()),
            MergeStrategy::IsoCts(Default::default()),
        ]
        .iter()
        .map(|s| s.merger().name())
        .collect();
        assert_eq!(names, vec!["task_arithmetic", "iso_c", "iso_cts"]);
    }
}
