//! Ordered parameter sets and the arithmetic used to combine them
//!
//! Every binary operation requires both operands to carry the same key set
//! and returns a fresh [`StateDict`] in the key order of the left operand.

use crate::{MergeError, Result, WeightTensor};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// Ordered mapping from parameter name to tensor
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateDict {
    tensors: IndexMap<String, WeightTensor>,
}

impl StateDict {
    /// Empty parameter set
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a tensor under its own name, replacing any previous value
    pub fn insert(&mut self, tensor: WeightTensor) {
        self.tensors.insert(tensor.name.clone(), tensor);
    }

    /// Tensor by name
    pub fn get(&self, key: &str) -> Option<&WeightTensor> {
        self.tensors.get(key)
    }

    /// Whether `key` is present
    pub fn contains_key(&self, key: &str) -> bool {
        self.tensors.contains_key(key)
    }

    /// Parameter names in insertion order
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    /// `(name, tensor)` pairs in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&str, &WeightTensor)> {
        self.tensors.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Number of parameters
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Tensor by name, or `KeySetMismatch` naming the missing key
    pub(crate) fn require(&self, key: &str) -> Result<&WeightTensor> {
        self.tensors.get(key).ok_or_else(|| MergeError::KeySetMismatch {
            key: key.to_string(),
        })
    }

    /// Fail with the first key not shared by both sets
    pub fn check_same_keys(&self, other: &Self) -> Result<()> {
        let missing = self
            .keys()
            .find(|k| !other.contains_key(k))
            .or_else(|| other.keys().find(|k| !self.contains_key(k)));

        match missing {
            Some(key) => Err(MergeError::KeySetMismatch {
                key: key.to_string(),
            }),
            None => Ok(()),
        }
    }

    /// Sorted symmetric difference of the two key sets
    pub fn key_difference(&self, other: &Self) -> Vec<String> {
        let mut diff: Vec<String> = self
            .keys()
            .filter(|k| !other.contains_key(k))
            .chain(other.keys().filter(|k| !self.contains_key(k)))
            .map(str::to_string)
            .collect();
        diff.sort();
        diff
    }

    fn zip_with(
        &self,
        other: &Self,
        f: impl Fn(&WeightTensor, &WeightTensor) -> Result<WeightTensor>,
    ) -> Result<Self> {
        self.check_same_keys(other)?;
        let mut out = Self::new();
        for (key, tensor) in self.iter() {
            out.insert(f(tensor, other.require(key)?)?);
        }
        Ok(out)
    }
}

impl FromIterator<WeightTensor> for StateDict {
    fn from_iter<I: IntoIterator<Item = WeightTensor>>(iter: I) -> Self {
        let mut dict = Self::new();
        for tensor in iter {
            dict.insert(tensor);
        }
        dict
    }
}

/// Element-wise `a + b`
pub fn state_dict_add(a: &StateDict, b: &StateDict) -> Result<StateDict> {
    a.zip_with(b, WeightTensor::add)
}

/// Element-wise `a - b`
pub fn state_dict_sub(a: &StateDict, b: &StateDict) -> Result<StateDict> {
    a.zip_with(b, WeightTensor::sub)
}

/// Every tensor scaled by `scalar`
pub fn state_dict_mul(a: &StateDict, scalar: f32) -> StateDict {
    a.iter().map(|(_, t)| t.scale(scalar)).collect()
}

/// `a * (1 - t) + b * t`
pub fn state_dict_interpolate(a: &StateDict, b: &StateDict, t: f32) -> Result<StateDict> {
    a.zip_with(b, |x, y| x.lerp(y, t))
}

/// Key-wise sum of one or more parameter sets
pub fn state_dict_sum(dicts: &[StateDict]) -> Result<StateDict> {
    let (first, rest) = dicts
        .split_first()
        .ok_or_else(|| MergeError::InvalidWeights("No parameter sets provided".into()))?;

    rest.iter()
        .try_fold(first.clone(), |acc, next| state_dict_add(&acc, next))
}

/// Key-wise unweighted mean of one or more parameter sets
pub fn state_dict_avg(dicts: &[StateDict]) -> Result<StateDict> {
    let sum = state_dict_sum(dicts)?;
    Ok(state_dict_mul(&sum, 1.0 / dicts.len() as f32))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dict(entries: &[(&str, f32)]) -> StateDict {
        entries
            .iter()
            .map(|&(k, v)| WeightTensor::scalar(k, v))
            .collect()
    }

    #[test]
    fn test_add_sub_mul() {
        let a = dict(&[("w", 1.0), ("b", 2.0)]);
        let b = dict(&[("w", 0.5), ("b", -1.0)]);

        let sum = state_dict_add(&a, &b).unwrap();
        assert_eq!(sum.get("w").unwrap().data, vec![1.5]);
        assert_eq!(sum.get("b").unwrap().data, vec![1.0]);

        let diff = state_dict_sub(&a, &b).unwrap();
        assert_eq!(diff.get("w").unwrap().data, vec![0.5]);
        assert_eq!(diff.get("b").unwrap().data, vec![3.0]);

        let scaled = state_dict_mul(&a, 2.0);
        assert_eq!(scaled.get("b").unwrap().data, vec![4.0]);
    }

    #[test]
    fn test_inputs_untouched() {
        let a = dict(&[("w", 1.0)]);
        let b = dict(&[("w", 3.0)]);
        let _ = state_dict_add(&a, &b).unwrap();
        assert_eq!(a.get("w").unwrap().data, vec![1.0]);
        assert_eq!(b.get("w").unwrap().data, vec![3.0]);
    }

    #[test]
    fn test_key_order_follows_left_operand() {
        let a = dict(&[("z", 1.0), ("a", 1.0)]);
        let b = dict(&[("a", 1.0), ("z", 1.0)]);
        let sum = state_dict_add(&a, &b).unwrap();
        assert_eq!(sum.keys().collect::<Vec<_>>(), vec!["z", "a"]);
    }

    #[test]
    fn test_key_set_mismatch_names_key() {
        let a = dict(&[("w", 1.0), ("b", 2.0)]);
        let b = dict(&[("w", 1.0)]);

        match state_dict_add(&a, &b) {
            Err(MergeError::KeySetMismatch { key }) => assert_eq!(key, "b"),
            other => panic!("expected KeySetMismatch, got {:?}", other),
        }

        match state_dict_sub(&b, &a) {
            Err(MergeError::KeySetMismatch { key }) => assert_eq!(key, "b"),
            other => panic!("expected KeySetMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_key_difference_sorted() {
        let a = dict(&[("w", 1.0), ("c", 1.0)]);
        let b = dict(&[("w", 1.0), ("a", 1.0)]);
        assert_eq!(
            a.key_difference(&b),
            vec!["a".to_string(), "c".to_string()]
        );
    }

    #[test]
    fn test_interpolate() {
        let a = dict(&[("w", 0.0)]);
        let b = dict(&[("w", 2.0)]);
        let mid = state_dict_interpolate(&a, &b, 0.25).unwrap();
        assert_eq!(mid.get("w").unwrap().data, vec![0.5]);
    }

    #[test]
    fn test_sum_and_avg() {
        let dicts = vec![
            dict(&[("w", 1.0)]),
            dict(&[("w", 2.0)]),
            dict(&[("w", 6.0)]),
        ];
        let sum = state_dict_sum(&dicts).unwrap();
        assert_eq!(sum.get("w").unwrap().data, vec![9.0]);
        let avg = state_dict_avg(&dicts).unwrap();
        assert_eq!(avg.get("w").unwrap().data, vec![3.0]);
        assert!(state_dict_avg(&[]).is_err());
    }
}
