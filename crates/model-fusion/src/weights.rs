//! Weight tensors and model handles

use crate::state_dict::StateDict;
use crate::{MergeError, Result};
use serde::{Deserialize, Serialize};

/// Weight tensor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeightTensor {
    /// Parameter name (dotted path)
    pub name: String,
    /// Tensor shape; empty for scalars
    pub shape: Vec<usize>,
    /// Flattened row-major data
    pub data: Vec<f32>,
}

impl WeightTensor {
    /// Create new weight tensor
    pub fn new(name: impl Into<String>, shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        let name = name.into();
        let expected_size: usize = shape.iter().product();
        if data.len() != expected_size {
            return Err(MergeError::ShapeMismatch {
                key: name,
                expected: vec![expected_size],
                got: vec![data.len()],
            });
        }

        Ok(Self { name, shape, data })
    }

    /// Create a zero-dimensional tensor
    pub fn scalar(name: impl Into<String>, value: f32) -> Self {
        Self {
            name: name.into(),
            shape: Vec::new(),
            data: vec![value],
        }
    }

    /// Create zero tensor
    pub fn zeros(name: impl Into<String>, shape: Vec<usize>) -> Self {
        let size: usize = shape.iter().product();
        Self {
            name: name.into(),
            shape,
            data: vec![0.0; size],
        }
    }

    /// Number of elements
    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// Number of dimensions
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Element-wise add
    pub fn add(&self, other: &Self) -> Result<Self> {
        self.zip_with(other, |a, b| a + b)
    }

    /// Element-wise subtract
    pub fn sub(&self, other: &Self) -> Result<Self> {
        self.zip_with(other, |a, b| a - b)
    }

    /// Scalar multiply
    pub fn scale(&self, factor: f32) -> Self {
        self.map(|x| x * factor)
    }

    /// Linear interpolation, `self * (1 - t) + other * t`
    pub fn lerp(&self, other: &Self, t: f32) -> Result<Self> {
        self.zip_with(other, |a, b| a * (1.0 - t) + b * t)
    }

    /// Largest absolute element-wise difference
    pub fn max_abs_diff(&self, other: &Self) -> Result<f32> {
        self.check_compatible(other)?;
        Ok(self
            .data
            .iter()
            .zip(&other.data)
            .map(|(a, b)| (a - b).abs())
            .fold(0.0, f32::max))
    }

    fn map(&self, f: impl Fn(f32) -> f32) -> Self {
        Self {
            name: self.name.clone(),
            shape: self.shape.clone(),
            data: self.data.iter().map(|&x| f(x)).collect(),
        }
    }

    fn zip_with(&self, other: &Self, f: impl Fn(f32, f32) -> f32) -> Result<Self> {
        self.check_compatible(other)?;
        let data: Vec<f32> = self
            .data
            .iter()
            .zip(&other.data)
            .map(|(&a, &b)| f(a, b))
            .collect();
        Ok(Self {
            name: self.name.clone(),
            shape: self.shape.clone(),
            data,
        })
    }

    /// Check compatibility for operations
    fn check_compatible(&self, other: &Self) -> Result<()> {
        if self.shape != other.shape {
            return Err(MergeError::ShapeMismatch {
                key: self.name.clone(),
                expected: self.shape.clone(),
                got: other.shape.clone(),
            });
        }
        Ok(())
    }
}

/// A named model and its parameters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelWeights {
    /// Model name
    pub name: String,
    /// Parameters by dotted name
    params: StateDict,
}

impl ModelWeights {
    /// Create new model weights
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: StateDict::new(),
        }
    }

    /// Create a model from an existing parameter set
    pub fn from_state_dict(name: impl Into<String>, params: StateDict) -> Self {
        Self {
            name: name.into(),
            params,
        }
    }

    /// Add layer weights
    pub fn add_layer(&mut self, tensor: WeightTensor) {
        self.params.insert(tensor);
    }

    /// Get layer weights
    pub fn get_layer(&self, name: &str) -> Option<&WeightTensor> {
        self.params.get(name)
    }

    /// Parameter set of this model
    pub fn state_dict(&self) -> &StateDict {
        &self.params
    }

    /// Consume the model and keep its parameters
    pub fn into_state_dict(self) -> StateDict {
        self.params
    }

    /// Replace every parameter of the model.
    ///
    /// The incoming set must carry exactly the current keys with the current
    /// shapes; on error the model is left untouched.
    pub fn load_state_dict(&mut self, state: StateDict) -> Result<()> {
        self.params.check_same_keys(&state)?;
        for (key, tensor) in self.params.iter() {
            if let Some(incoming) = state.get(key) {
                if incoming.shape != tensor.shape {
                    return Err(MergeError::ShapeMismatch {
                        key: key.to_string(),
                        expected: tensor.shape.clone(),
                        got: incoming.shape.clone(),
                    });
                }
            }
        }
        self.params = state;
        Ok(())
    }

    /// Total parameters
    pub fn total_params(&self) -> usize {
        self.params.iter().map(|(_, t)| t.numel()).sum()
    }

    /// Number of encoder blocks, inferred from `layers.<i>.` in parameter names
    pub fn num_encoder_layers(&self) -> usize {
        self.params
            .keys()
            .filter_map(crate::region::layer_index)
            .max()
            .map_or(0, |max| max + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weight_tensor() {
        let tensor = WeightTensor::new("test", vec![2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0])
            .unwrap();

        assert_eq!(tensor.numel(), 6);
        assert_eq!(tensor.ndim(), 2);
        assert_eq!(tensor.shape, vec![2, 3]);
    }

    #[test]
    fn test_size_mismatch() {
        let err = WeightTensor::new("bad", vec![2, 2], vec![1.0; 3]).unwrap_err();
        assert!(matches!(err, MergeError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_scalar() {
        let tensor = WeightTensor::scalar("w", 1.5);
        assert_eq!(tensor.ndim(), 0);
        assert_eq!(tensor.numel(), 1);
    }

    #[test]
    fn test_serialized_fields() {
        let tensor = WeightTensor::new("w", vec![2], vec![1.0, 2.0]).unwrap();
        let expected = serde_json::json!({ "name": "w", "shape": [2], "data": [1.0, 2.0] });
        assert_eq!(serde_json::to_value(&tensor).unwrap(), expected);

        let model = ModelWeights::from_state_dict("m", [tensor].into_iter().collect());
        let value = serde_json::to_value(&model).unwrap();
        let mut fields: Vec<&String> = value.as_object().unwrap().keys().collect();
        fields.sort_unstable();
        assert_eq!(fields, vec!["name", "params"]);
    }

    #[test]
    fn test_add_sub() {
        let a = WeightTensor::new("a", vec![3], vec![1.0, 2.0, 3.0]).unwrap();
        let b = WeightTensor::new("b", vec![3], vec![4.0, 5.0, 6.0]).unwrap();

        let sum = a.add(&b).unwrap();
        assert_eq!(sum.data, vec![5.0, 7.0, 9.0]);

        let diff = b.sub(&a).unwrap();
        assert_eq!(diff.data, vec![3.0, 3.0, 3.0]);
    }

    #[test]
    fn test_shape_checked() {
        let a = WeightTensor::zeros("a", vec![2, 2]);
        let b = WeightTensor::zeros("a", vec![4]);
        assert!(a.add(&b).is_err());
    }

    #[test]
    fn test_scale_and_lerp() {
        let a = WeightTensor::new("x", vec![3], vec![0.0, 0.0, 0.0]).unwrap();
        let b = WeightTensor::new("x", vec![3], vec![1.0, 2.0, 3.0]).unwrap();

        assert_eq!(b.scale(2.0).data, vec![2.0, 4.0, 6.0]);
        assert_eq!(a.lerp(&b, 0.5).unwrap().data, vec![0.5, 1.0, 1.5]);
    }

    #[test]
    fn test_load_state_dict_validates() {
        let name = "encoder.layers.0.mlp.weight";
        let mut model = ModelWeights::new("vit");
        model.add_layer(WeightTensor::zeros(name, vec![2, 2]));

        let mut wrong_shape = StateDict::new();
        wrong_shape.insert(WeightTensor::zeros(name, vec![4]));
        assert!(model.load_state_dict(wrong_shape).is_err());

        let mut wrong_key = StateDict::new();
        let renamed = WeightTensor::zeros("encoder.layers.1.mlp.weight", vec![2, 2]);
        wrong_key.insert(renamed);
        assert!(matches!(
            model.load_state_dict(wrong_key),
            Err(MergeError::KeySetMismatch { .. })
        ));

        let mut ok = StateDict::new();
        ok.insert(WeightTensor::new(name, vec![2, 2], vec![1.0; 4]).unwrap());
        model.load_state_dict(ok).unwrap();
        assert_eq!(model.get_layer(name).unwrap().data, vec![1.0; 4]);
    }

    #[test]
    fn test_num_encoder_layers() {
        let mut model = ModelWeights::new("vit");
        for i in 0..12 {
            model.add_layer(WeightTensor::zeros(
                format!("vision_model.encoder.layers.{i}.self_attn.q_proj.weight"),
                vec![2, 2],
            ));
        }
        let norm = WeightTensor::zeros("vision_model.post_layernorm.weight", vec![2]);
        model.add_layer(norm);

        assert_eq!(model.num_encoder_layers(), 12);
        assert_eq!(model.total_params(), 12 * 4 + 2);
        assert_eq!(ModelWeights::new("empty").num_encoder_layers(), 0);
    }
}
