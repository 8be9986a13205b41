//! Tensor-to-schema compatibility checks
//!
//! A transmitted tensor matches a declared [`TensorDef`] when the dtypes are
//! equal, the ranks are equal, and every declared dimension is either the
//! wildcard or equal to the transmitted one. Buffer contents are never read;
//! only the buffer length is checked against the declared shape and dtype.

use crate::canonical::WILDCARD_DIM;
use crate::error::{Error, Result};
use crate::types::*;

/// Expected tensor list for a call against a synapse.
///
/// Forward carries the inputs; Backward carries the inputs followed by the
/// gradients of the outputs.
pub fn expected_defs(kind: CallKind, synapse: &Synapse) -> Vec<&TensorDef> {
    match kind {
        CallKind::Forward => synapse.indef.iter().collect(),
        CallKind::Backward => synapse.indef.iter().chain(synapse.outdef.iter()).collect(),
    }
}

/// Check one transmitted tensor against its declared definition.
pub fn check_tensor(position: usize, tensor: &Tensor, declared: &TensorDef) -> Result<()> {
    let actual = &tensor.tensor_def;
    if actual.dtype != declared.dtype {
        return Err(Error::SchemaMismatch(format!(
            "tensor {}: dtype {:?}, expected {:?}",
            position, actual.dtype, declared.dtype
        )));
    }
    if actual.shape.len() != declared.shape.len() {
        return Err(Error::SchemaMismatch(format!(
            "tensor {}: rank {}, expected {}",
            position,
            actual.shape.len(),
            declared.shape.len()
        )));
    }
    for (axis, (&dim, &want)) in actual.shape.iter().zip(declared.shape.iter()).enumerate() {
        if dim < 0 {
            return Err(Error::SchemaMismatch(format!(
                "tensor {}: axis {} has negative size {}",
                position, axis, dim
            )));
        }
        if want != WILDCARD_DIM && dim != want {
            return Err(Error::SchemaMismatch(format!(
                "tensor {}: axis {} is {}, expected {}",
                position, axis, dim, want
            )));
        }
    }

    if let Some(width) = actual.dtype.element_size() {
        let expected_len = actual
            .element_count()
            .and_then(|n| n.checked_mul(width))
            .ok_or_else(|| Error::SchemaMismatch(format!("tensor {}: shape overflows", position)))?;
        if tensor.buffer.len() != expected_len {
            return Err(Error::SchemaMismatch(format!(
                "tensor {}: buffer is {} bytes, shape implies {}",
                position,
                tensor.buffer.len(),
                expected_len
            )));
        }
    }
    Ok(())
}

/// Check a whole call: exact count, then each position.
pub fn check_call(kind: CallKind, synapse: &Synapse, tensors: &[Tensor]) -> Result<()> {
    let expected = expected_defs(kind, synapse);
    if tensors.len() != expected.len() {
        return Err(Error::SchemaMismatch(format!(
            "{} expects {} tensors, got {}",
            kind,
            expected.len(),
            tensors.len()
        )));
    }
    tensors
        .iter()
        .zip(expected)
        .enumerate()
        .try_for_each(|(i, (tensor, declared))| check_tensor(i, tensor, declared))
}
