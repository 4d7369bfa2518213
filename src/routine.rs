//! Routine registry.
//!
//! Worker processes do not share the dispatcher's memory, so routines are
//! sent by name. Every process that takes part in a pool (the dispatcher and
//! each worker) builds the same [`Registry`] at startup; a job names the
//! routine and the worker looks it up locally.

use crate::error::{PoolError, Result};
use crate::worker::Worker;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// A dispatchable routine. Receives the worker it runs on and the job's
/// arguments (already sliced for partitioned arguments).
pub type Routine = Arc<dyn Fn(&Worker, Args) -> anyhow::Result<Value> + Send + Sync>;

/// Positional and named arguments of a job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Args {
    #[serde(default)]
    pub positional: Vec<Value>,
    #[serde(default)]
    pub named: Map<String, Value>,
}

impl Args {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a positional argument.
    pub fn arg(mut self, value: impl Serialize) -> Result<Self> {
        self.positional.push(serde_json::to_value(value)?);
        Ok(self)
    }

    /// Set a named argument.
    pub fn kwarg(mut self, name: impl Into<String>, value: impl Serialize) -> Result<Self> {
        self.named.insert(name.into(), serde_json::to_value(value)?);
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.positional.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positional.is_empty()
    }

    /// Deserialize positional argument `idx`.
    pub fn get<T: DeserializeOwned>(&self, idx: usize) -> anyhow::Result<T> {
        let value = self.positional.get(idx).ok_or_else(|| {
            anyhow::anyhow!(
                "missing positional argument {} ({} given)",
                idx,
                self.positional.len()
            )
        })?;
        T::deserialize(value)
            .map_err(|e| anyhow::anyhow!("positional argument {}: {}", idx, e))
    }

    /// Deserialize named argument `name`, if present.
    pub fn named<T: DeserializeOwned>(&self, name: &str) -> anyhow::Result<Option<T>> {
        self.named
            .get(name)
            .map(|value| {
                T::deserialize(value).map_err(|e| anyhow::anyhow!("named argument '{}': {}", name, e))
            })
            .transpose()
    }

    /// Deserialize named argument `name`, falling back to `default`.
    pub fn named_or<T: DeserializeOwned>(&self, name: &str, default: T) -> anyhow::Result<T> {
        Ok(self.named(name)?.unwrap_or(default))
    }
}

/// Named routines known to every process of a pool.
#[derive(Clone, Default)]
pub struct Registry {
    routines: BTreeMap<String, Routine>,
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("routines", &self.routines.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `routine` under `name`, replacing any previous entry.
    pub fn register<F>(&mut self, name: impl Into<String>, routine: F) -> &mut Self
    where
        F: Fn(&Worker, Args) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.routines.insert(name.into(), Arc::new(routine));
        self
    }

    /// Builder-style [`register`](Self::register).
    pub fn with<F>(mut self, name: impl Into<String>, routine: F) -> Self
    where
        F: Fn(&Worker, Args) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.register(name, routine);
        self
    }

    pub fn get(&self, name: &str) -> Option<Routine> {
        self.routines.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.routines.contains_key(name)
    }

    /// Fail with [`PoolError::UnknownRoutine`] unless `name` is registered.
    pub fn require(&self, name: &str) -> Result<Routine> {
        self.get(name)
            .ok_or_else(|| PoolError::UnknownRoutine(name.to_string()))
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> Vec<&str> {
        self.routines.keys().map(String::as_str).collect()
    }

    pub fn len(&self) -> usize {
        self.routines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routines.is_empty()
    }

    /// Merge every routine from `other` into this registry.
    pub fn extend(&mut self, other: &Registry) {
        for (name, routine) in &other.routines {
            self.routines.insert(name.clone(), Arc::clone(routine));
        }
    }
}
