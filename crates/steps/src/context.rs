//! The case context threaded through every step.

use std::sync::Arc;

use serde_json::{Map, Value};

/// Immutable variable mapping of a case.
///
/// Cloning is cheap. [`Context::merged`] produces a new context and
/// leaves `self` untouched, so a failed step can never leak a partial
/// update into the context the engine persists.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Context(Arc<Map<String, Value>>);

impl Context {
    pub fn new(variables: Map<String, Value>) -> Self {
        Self(Arc::new(variables))
    }

    /// Look up a variable. Dotted names (`client.income`) descend into
    /// nested objects when no top-level variable has the full name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        if let Some(value) = self.0.get(name) {
            return Some(value);
        }
        let mut parts = name.split('.');
        let mut current = self.0.get(parts.next()?)?;
        for part in parts {
            current = current.as_object()?.get(part)?;
        }
        Some(current)
    }

    /// A new context with `delta` applied in order; later keys win.
    pub fn merged(&self, delta: &Map<String, Value>) -> Self {
        if delta.is_empty() {
            return self.clone();
        }
        let mut next = (*self.0).clone();
        for (key, value) in delta {
            next.insert(key.clone(), value.clone());
        }
        Self::new(next)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    pub fn to_value(&self) -> Value {
        Value::Object((*self.0).clone())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Map<String, Value>> for Context {
    fn from(map: Map<String, Value>) -> Self {
        Self::new(map)
    }
}

impl From<Context> for Map<String, Value> {
    fn from(ctx: Context) -> Self {
        Arc::try_unwrap(ctx.0).unwrap_or_else(|shared| (*shared).clone())
    }
}
