//! Range partitioning.
//!
//! Splits `[0, n)` into `k` contiguous sub-ranges whose lengths differ by at
//! most one, and slices partition-flagged job arguments to match.

use crate::error::{PoolError, Result};
use serde_json::Value;
use std::ops::Range;

/// Sub-range of `[0, len)` assigned to part `index` of `parts`.
///
/// Part `i` covers `[floor(i*len/parts), floor((i+1)*len/parts))`.
pub fn partition(len: usize, index: usize, parts: usize) -> Range<usize> {
    debug_assert!(parts > 0 && index < parts);
    // u128 keeps i*len from overflowing for very large ranges.
    let bound = |i: usize| ((i as u128 * len as u128) / parts as u128) as usize;
    bound(index)..bound(index + 1)
}

/// All `parts` sub-ranges of `[0, len)` in index order.
pub fn partitions(len: usize, parts: usize) -> Vec<Range<usize>> {
    (0..parts).map(|i| partition(len, i, parts)).collect()
}

/// Check that every positional index in `flagged` refers to an array.
pub fn validate_flagged(args: &[Value], flagged: &[usize]) -> Result<()> {
    for &idx in flagged {
        match args.get(idx) {
            Some(Value::Array(_)) => {}
            Some(other) => {
                return Err(PoolError::InvalidArgument(format!(
                    "argument {} is flagged for partitioning but is not an array ({})",
                    idx,
                    kind_of(other)
                )));
            }
            None => {
                return Err(PoolError::InvalidArgument(format!(
                    "partition index {} out of range for {} arguments",
                    idx,
                    args.len()
                )));
            }
        }
    }
    Ok(())
}

/// Positional arguments for worker `index` of `parts`.
///
/// Flagged arguments are replaced by their own `partition(len, index, parts)`
/// slice; everything else is copied.
pub fn slice_args(args: &[Value], flagged: &[usize], index: usize, parts: usize) -> Vec<Value> {
    args.iter()
        .enumerate()
        .map(|(pos, arg)| match arg {
            Value::Array(items) if flagged.contains(&pos) => {
                let range = partition(items.len(), index, parts);
                Value::Array(items[range].to_vec())
            }
            _ => arg.clone(),
        })
        .collect()
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
