//! Reducers for result maps.
//!
//! A job resolves to one outcome per worker. These helpers turn that map
//! into something a caller actually wants, failing on the first error.

use crate::error::TaskError;
use crate::pool::ResultMap;
use serde_json::Value;
use std::collections::BTreeMap;

/// Fail with the first error in index order, otherwise do nothing.
pub fn raise_first_error(results: &ResultMap) -> Result<(), TaskError> {
    match results.values().find_map(|r| r.as_ref().err()) {
        Some(err) => Err(err.clone()),
        None => Ok(()),
    }
}

/// Plain values keyed by worker index, or the first error.
pub fn collect_ok(results: ResultMap) -> Result<BTreeMap<usize, Value>, TaskError> {
    raise_first_error(&results)?;
    results
        .into_iter()
        .map(|(index, outcome)| outcome.map(|value| (index, value)))
        .collect()
}

/// Values in worker index order, or the first error.
pub fn list_in_order(results: ResultMap) -> Result<Vec<Value>, TaskError> {
    Ok(collect_ok(results)?.into_values().collect())
}

/// Concatenate array results in worker index order.
///
/// Non-array values are appended as single elements; `null` contributes
/// nothing.
pub fn concat_in_order(results: ResultMap) -> Result<Vec<Value>, TaskError> {
    let mut out = Vec::new();
    for value in list_in_order(results)? {
        match value {
            Value::Array(items) => out.extend(items),
            Value::Null => {}
            other => out.push(other),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(entries: Vec<(usize, Result<Value, TaskError>)>) -> ResultMap {
        entries.into_iter().collect()
    }

    #[test]
    fn test_list_in_order_sorts_by_index() {
        let results = map(vec![(1, Ok(json!("b"))), (0, Ok(json!("a")))]);
        assert_eq!(list_in_order(results).unwrap(), vec![json!("a"), json!("b")]);
    }

    #[test]
    fn test_concat_in_order() {
        let results = map(vec![(1, Ok(json!([3]))), (0, Ok(json!([1, 2])))]);
        assert_eq!(
            concat_in_order(results).unwrap(),
            vec![json!(1), json!(2), json!(3)]
        );

        let mixed = map(vec![(0, Ok(json!(null))), (1, Ok(json!(7))), (2, Ok(json!([8])))]);
        assert_eq!(concat_in_order(mixed).unwrap(), vec![json!(7), json!(8)]);
    }

    #[test]
    fn test_first_error_wins() {
        let results = map(vec![
            (0, Ok(json!(1))),
            (1, Err(TaskError::Routine("first".into()))),
            (2, Err(TaskError::SiblingFailed)),
        ]);
        assert_eq!(
            raise_first_error(&results),
            Err(TaskError::Routine("first".into()))
        );
        assert_eq!(
            concat_in_order(results.clone()),
            Err(TaskError::Routine("first".into()))
        );
        assert!(collect_ok(results).is_err());
    }

    #[test]
    fn test_collect_ok_keeps_indices() {
        let results = map(vec![(2, Ok(json!("x"))), (0, Ok(json!("y")))]);
        let values = collect_ok(results).unwrap();
        assert_eq!(values.keys().copied().collect::<Vec<_>>(), vec![0, 2]);
    }

    #[test]
    fn test_empty_map() {
        assert!(raise_first_error(&ResultMap::new()).is_ok());
        assert!(list_in_order(ResultMap::new()).unwrap().is_empty());
    }
}
