//! Task vectors: per-parameter deltas between fine-tuned models and their
//! shared pretrained ancestor

use crate::state_dict::{state_dict_sub, StateDict};
use crate::{MergeError, Result};

/// Compute one task vector per fine-tuned parameter set, in input order
pub fn extract_task_vectors(
    pretrained: &StateDict,
    finetuned: &[StateDict],
) -> Result<Vec<StateDict>> {
    if finetuned.is_empty() {
        return Err(MergeError::InvalidWeights(
            "No fine-tuned models provided".into(),
        ));
    }

    let task_vectors = finetuned
        .iter()
        .enumerate()
        .map(|(i, model)| task_vector(pretrained, model, i))
        .collect::<Result<Vec<_>>>()?;

    check_parameter_names_match(&task_vectors)?;
    Ok(task_vectors)
}

/// Task vector of a single fine-tuned model.
///
/// `model_index` is only used to label a naming mismatch.
pub fn task_vector(
    pretrained: &StateDict,
    finetuned: &StateDict,
    model_index: usize,
) -> Result<StateDict> {
    let differing_keys = pretrained.key_difference(finetuned);
    if !differing_keys.is_empty() {
        return Err(MergeError::ParameterNameMismatch {
            model_index,
            differing_keys,
        });
    }
    state_dict_sub(finetuned, pretrained)
}

/// Verify every task vector carries the key set of the first one
pub fn check_parameter_names_match(task_vectors: &[StateDict]) -> Result<()> {
    let Some((reference, rest)) = task_vectors.split_first() else {
        return Ok(());
    };

    for (offset, tv) in rest.iter().enumerate() {
        let differing_keys = reference.key_difference(tv);
        if !differing_keys.is_empty() {
            return Err(MergeError::ParameterNameMismatch {
                model_index: offset + 1,
                differing_keys,
            });
        }
    }
    Ok(())
}
