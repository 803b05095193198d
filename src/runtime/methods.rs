//! Method registry for method-invocation activities
//!
//! Methods are registered by target and name, with overloads distinguished by
//! arity. Resolutions go through a [`BoundedCache`] owned by the registry, and
//! the registry itself is injected into the executor rather than living in
//! process-wide state.

use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::cache::{BoundedCache, CacheStats};
use super::error::ActivityResult;

/// A callable method
pub type MethodFn = Arc<dyn Fn(&[Value]) -> ActivityResult<Value> + Send + Sync>;

/// Resolution key: target, method name, and argument count
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodKey {
    /// Target type or object name
    pub target: String,
    /// Method name
    pub method: String,
    /// Number of parameters
    pub arity: usize,
}

/// Registered methods plus a bounded resolution cache
pub struct MethodRegistry {
    methods: HashMap<(String, String), Vec<(usize, MethodFn)>>,
    resolutions: BoundedCache<MethodKey, MethodFn>,
}

impl MethodRegistry {
    /// Create an empty registry whose resolution cache holds `cache_capacity` entries
    pub fn new(cache_capacity: usize) -> Self {
        Self {
            methods: HashMap::new(),
            resolutions: BoundedCache::new(cache_capacity),
        }
    }

    /// Register a method overload
    ///
    /// Registering the same (target, method, arity) again replaces it.
    pub fn register<F>(
        &mut self,
        target: impl Into<String>,
        method: impl Into<String>,
        arity: usize,
        f: F,
    ) -> &mut Self
    where
        F: Fn(&[Value]) -> ActivityResult<Value> + Send + Sync + 'static,
    {
        let overloads = self
            .methods
            .entry((target.into(), method.into()))
            .or_default();
        overloads.retain(|(a, _)| *a != arity);
        overloads.push((arity, Arc::new(f)));
        self.resolutions.clear();
        self
    }

    /// Whether any overload of `target.method` exists
    pub fn has_method(&self, target: &str, method: &str) -> bool {
        self.methods
            .contains_key(&(target.to_string(), method.to_string()))
    }

    /// Resolve the overload taking `arity` parameters
    pub fn resolve(&self, target: &str, method: &str, arity: usize) -> Option<MethodFn> {
        let key = MethodKey {
            target: target.to_string(),
            method: method.to_string(),
            arity,
        };
        self.resolutions
            .get_or_try_insert_with(&key, || self.lookup(&key).ok_or(()))
            .ok()
    }

    fn lookup(&self, key: &MethodKey) -> Option<MethodFn> {
        self.methods
            .get(&(key.target.clone(), key.method.clone()))?
            .iter()
            .find(|(arity, _)| *arity == key.arity)
            .map(|(_, f)| f.clone())
    }

    /// Resolution cache counters
    pub fn cache_stats(&self) -> CacheStats {
        self.resolutions.stats()
    }

    /// Number of cached resolutions
    pub fn cached_resolutions(&self) -> usize {
        self.resolutions.len()
    }
}

impl Default for MethodRegistry {
    fn default() -> Self {
        Self::new(super::DEFAULT_METHOD_CACHE_CAPACITY)
    }
}

impl fmt::Debug for MethodRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self
            .methods
            .keys()
            .map(|(target, method)| format!("{}.{}", target, method))
            .collect();
        names.sort();
        f.debug_struct("MethodRegistry")
            .field("methods", &names)
            .field("cache_capacity", &self.resolutions.capacity())
            .finish()
    }
}
