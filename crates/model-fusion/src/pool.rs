//! Model pools: where the pretrained model and the fine-tuned models come from

use crate::{MergeError, ModelWeights, Result};
use indexmap::IndexMap;

/// Name under which a pool also serves its pretrained model
pub const PRETRAINED_MODEL_NAME: &str = "_pretrained_";

/// Source of the models taking part in a merge.
///
/// Every `load_*` call hands out an independent copy; callers may mutate or
/// drop it freely.
pub trait ModelPool {
    /// Fine-tuned model names, in merge order
    fn model_names(&self) -> Vec<String>;

    /// Load the shared pretrained ancestor
    fn load_pretrained_model(&self) -> Result<ModelWeights>;

    /// Load a fine-tuned model by name
    fn load_model(&self, name: &str) -> Result<ModelWeights>;

    /// Encoder depth of the pretrained model
    fn num_encoder_layers(&self) -> Result<usize> {
        Ok(self.load_pretrained_model()?.num_encoder_layers())
    }

    /// Number of fine-tuned models
    fn len(&self) -> usize {
        self.model_names().len()
    }

    /// Whether the pool has no fine-tuned models
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Pool holding every model in memory
#[derive(Debug, Clone)]
pub struct InMemoryModelPool {
    pretrained: ModelWeights,
    models: IndexMap<String, ModelWeights>,
}

impl InMemoryModelPool {
    /// Create a pool around a pretrained model
    pub fn new(pretrained: ModelWeights) -> Self {
        Self {
            pretrained,
            models: IndexMap::new(),
        }
    }

    /// Add a fine-tuned model, builder style
    pub fn with_model(mut self, name: impl Into<String>, model: ModelWeights) -> Self {
        self.add_model(name, model);
        self
    }

    /// Add or replace a fine-tuned model
    pub fn add_model(&mut self, name: impl Into<String>, model: ModelWeights) {
        self.models.insert(name.into(), model);
    }
}

impl ModelPool for InMemoryModelPool {
    fn model_names(&self) -> Vec<String> {
        self.models.keys().cloned().collect()
    }

    fn load_pretrained_model(&self) -> Result<ModelWeights> {
        Ok(self.pretrained.clone())
    }

    fn load_model(&self, name: &str) -> Result<ModelWeights> {
        if name == PRETRAINED_MODEL_NAME {
            return self.load_pretrained_model();
        }
        self.models
            .get(name)
            .cloned()
            .ok_or_else(|| MergeError::ModelNotFound(name.to_string()))
    }

    fn len(&self) -> usize {
        self.models.len()
    }
}
