//! Function registry
//!
//! The host registers functions at startup; reconcilers only read from the
//! registry, so it is shared as `Arc<FunctionRegistry>` without locking.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

/// Outcome of one function invocation
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FunctionResult {
    /// Whether the assertion held
    pub passed: bool,
    /// Observed value, for display
    pub actual: Option<String>,
    /// Explanation
    pub message: Option<String>,
    /// Extracted value (extractor functions)
    pub value: Option<String>,
}

impl FunctionResult {
    /// Passing result
    pub fn pass() -> Self {
        Self {
            passed: true,
            ..Default::default()
        }
    }

    /// Failing result with a message
    pub fn fail(message: impl Into<String>) -> Self {
        Self {
            passed: false,
            message: Some(message.into()),
            ..Default::default()
        }
    }

    /// Passing result carrying an extracted value
    pub fn extracted(value: impl Into<String>) -> Self {
        let value = value.into();
        Self {
            passed: true,
            actual: Some(value.clone()),
            value: Some(value),
            message: None,
        }
    }

    /// Attach the observed value
    pub fn with_actual(mut self, actual: impl Into<String>) -> Self {
        self.actual = Some(actual.into());
        self
    }

    /// Attach a message
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// An in-process assertion or extractor
pub trait AssertionFunction: Send + Sync {
    /// Evaluate against a resource snapshot with decoded parameters
    fn call(&self, resource: &Value, params: &Value) -> FunctionResult;
}

impl<F> AssertionFunction for F
where
    F: Fn(&Value, &Value) -> FunctionResult + Send + Sync,
{
    fn call(&self, resource: &Value, params: &Value) -> FunctionResult {
        self(resource, params)
    }
}

/// Mapping from function name to implementation
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: BTreeMap<String, Arc<dyn AssertionFunction>>,
}

impl FunctionRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-loaded with the built-in catalog
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::builtin::register_builtins(&mut registry);
        registry
    }

    /// Register (or replace) a function
    pub fn register(&mut self, name: impl Into<String>, function: impl AssertionFunction + 'static) {
        self.functions.insert(name.into(), Arc::new(function));
    }

    /// Look up a function
    pub fn get(&self, name: &str) -> Option<Arc<dyn AssertionFunction>> {
        self.functions.get(name).cloned()
    }

    /// True if a function with this name exists
    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Registered names in sorted order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.functions.keys().map(String::as_str)
    }

    /// Invoke a function by name; unknown names fail immediately
    pub fn invoke(&self, name: &str, resource: &Value, params: &Value) -> FunctionResult {
        match self.functions.get(name) {
            Some(f) => f.call(resource, params),
            None => FunctionResult::fail(format!("unknown function '{name}'")),
        }
    }
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("functions", &self.functions.keys().collect::<Vec<_>>())
            .finish()
    }
}
