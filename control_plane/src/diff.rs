use crate::apisix::{ApisixResource, RemoteId};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error)]
#[error("unable to canonicalize object for comparison: {0}")]
pub struct DiffError(#[from] serde_json::Error);

fn canonical<T: Serialize>(object: &T) -> Result<Value, DiffError> {
    Ok(serde_json::to_value(object)?)
}

/// Whether `desired` differs structurally from `observed`.
///
/// Both sides are compared as JSON values, so field order is irrelevant while
/// the serializer decides whether an absent and an empty field are the same.
pub fn has_diff<T: Serialize>(desired: &T, observed: Option<&T>) -> Result<bool, DiffError> {
    match observed {
        None => Ok(true),
        Some(observed) => Ok(canonical(desired)? != canonical(observed)?),
    }
}

/// Copies the remote identifier of `observed` into `desired`, or clears it.
pub fn pad_id<T: ApisixResource>(desired: &mut T, observed: Option<&T>) {
    let id = observed.map_or(RemoteId::Unassigned, |observed| observed.id().clone());
    desired.set_id(id);
}
