//! Registry of objects published by workers during a job.
//!
//! Each entry is keyed by the publishing worker's index and a name. Workers
//! read every other worker's entry for a name, never their own. The sharer
//! has no locking of its own; the pool exposes it through an
//! [`ObjectServer`](crate::proxy::ObjectServer), which serializes access.

use crate::error::TaskError;
use crate::proxy::RemoteObject;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Objects shared by workers, keyed by `(index, name)`.
#[derive(Debug, Default, Clone)]
pub struct ObjectSharer {
    objects: BTreeMap<(usize, String), Value>,
}

impl ObjectSharer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `obj` under `(index, name)`, replacing any previous value.
    pub fn publish(&mut self, index: usize, name: impl Into<String>, obj: Value) {
        self.objects.insert((index, name.into()), obj);
    }

    /// All objects named `name` except the one published by `exclude`.
    pub fn lookup(&self, name: &str, exclude: Option<usize>) -> BTreeMap<usize, Value> {
        self.objects
            .iter()
            .filter(|((idx, n), _)| n == name && Some(*idx) != exclude)
            .map(|((idx, _), obj)| (*idx, obj.clone()))
            .collect()
    }

    pub fn clear(&mut self) {
        self.objects.clear();
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

/// Calls a worker can make on the sharer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SharerRequest {
    Publish {
        index: usize,
        name: String,
        value: Value,
    },
    Lookup {
        name: String,
        exclude: Option<usize>,
    },
    Clear,
}

impl SharerRequest {
    /// Operation name, used in timeout errors.
    pub fn op(&self) -> &'static str {
        match self {
            Self::Publish { .. } => "publish",
            Self::Lookup { .. } => "lookup",
            Self::Clear => "clear",
        }
    }

    /// Pin a publish to the worker the request came from.
    pub fn pinned_to(self, worker: usize) -> Self {
        match self {
            Self::Publish { name, value, .. } => Self::Publish {
                index: worker,
                name,
                value,
            },
            other => other,
        }
    }
}

/// Replies to [`SharerRequest`]s.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SharerResponse {
    Done,
    /// `(index, object)` pairs in index order.
    Objects { objects: Vec<(usize, Value)> },
}

impl SharerResponse {
    /// Objects carried by a lookup reply; empty for anything else.
    pub fn into_objects(self) -> BTreeMap<usize, Value> {
        match self {
            Self::Objects { objects } => objects.into_iter().collect(),
            Self::Done => BTreeMap::new(),
        }
    }
}

impl RemoteObject for ObjectSharer {
    type Request = SharerRequest;
    type Response = SharerResponse;

    fn method_name(request: &Self::Request) -> &'static str {
        request.op()
    }

    fn handle(&mut self, request: SharerRequest) -> Result<SharerResponse, TaskError> {
        match request {
            SharerRequest::Publish { index, name, value } => {
                self.publish(index, name, value);
                Ok(SharerResponse::Done)
            }
            SharerRequest::Lookup { name, exclude } => Ok(SharerResponse::Objects {
                objects: self.lookup(&name, exclude).into_iter().collect(),
            }),
            SharerRequest::Clear => {
                self.clear();
                Ok(SharerResponse::Done)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_pinned_to_rewrites_publish_only() {
        let publish = SharerRequest::Publish {
            index: 9,
            name: "n".into(),
            value: json!(1),
        };
        assert_eq!(
            publish.pinned_to(2),
            SharerRequest::Publish {
                index: 2,
                name: "n".into(),
                value: json!(1),
            }
        );
        assert_eq!(SharerRequest::Clear.pinned_to(2), SharerRequest::Clear);
    }

    #[test]
    fn test_publish_and_lookup_excludes_self() {
        let mut sharer = ObjectSharer::new();
        for i in 0..4 {
            sharer.publish(i, "index", json!(i));
        }
        sharer.publish(0, "other", json!("x"));

        let seen = sharer.lookup("index", Some(2));
        assert_eq!(seen.keys().copied().collect::<Vec<_>>(), vec![0, 1, 3]);
        assert_eq!(seen[&3], json!(3));

        assert_eq!(sharer.lookup("index", None).len(), 4);
        assert!(sharer.lookup("missing", None).is_empty());
    }

    #[test]
    fn test_publish_overwrites_own_entry() {
        let mut sharer = ObjectSharer::new();
        sharer.publish(1, "mesh", json!([1]));
        sharer.publish(1, "mesh", json!([1, 2]));
        assert_eq!(sharer.len(), 1);
        assert_eq!(sharer.lookup("mesh", None)[&1], json!([1, 2]));
    }

    #[test]
    fn test_clear() {
        let mut sharer = ObjectSharer::new();
        sharer.publish(0, "a", json!(null));
        assert!(!sharer.is_empty());
        sharer.clear();
        assert!(sharer.is_empty());
    }

    #[test]
    fn test_handle_requests() {
        let mut sharer = ObjectSharer::new();
        let resp = sharer
            .handle(SharerRequest::Publish {
                index: 0,
                name: "n".into(),
                value: json!(10),
            })
            .unwrap();
        assert_eq!(resp, SharerResponse::Done);

        let resp = sharer
            .handle(SharerRequest::Lookup {
                name: "n".into(),
                exclude: Some(1),
            })
            .unwrap();
        let objects = resp.into_objects();
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[&0], json!(10));

        sharer.handle(SharerRequest::Clear).unwrap();
        assert!(sharer.is_empty());
    }

    #[test]
    fn test_request_wire_format() {
        let req = SharerRequest::Lookup {
            name: "index".into(),
            exclude: Some(2),
        };
        let line = serde_json::to_string(&req).unwrap();
        assert!(line.contains("\"op\":\"lookup\""));
        let parsed: SharerRequest = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed, req);
    }
}
