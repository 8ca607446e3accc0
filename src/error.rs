//! Error taxonomy for one dispatch pass.

use serde::Serialize;

/// Any of these terminates the whole dispatch pass. There is no retry and no
/// per-call isolation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    /// A `method` value that is not exactly `module.methodName`.
    #[error("The method name is invalid. Expected 'module.methodName' (got '{value}')")]
    InvalidMethodName { value: String },

    /// A call reached execution without a `method` parameter.
    #[error("call {index} has no 'method' parameter")]
    MissingMethod { index: usize },

    /// The referenced module is not enabled in the registry.
    #[error("module '{module}' is not activated")]
    ModuleNotActivated { module: String },

    /// Opaque failure surfaced by a backend invocation (singleton or batched).
    #[error("{module}.{method} failed: {message}")]
    BackendCall {
        module: String,
        method: String,
        message: String,
    },

    /// A batched invocation returned a different number of values than calls.
    #[error("{module}.{method} returned {got} value(s) for a batch of {expected}")]
    BatchResultMismatch {
        module: String,
        method: String,
        expected: usize,
        got: usize,
    },

    /// A grouping rule source produced overlapping or out-of-range groups.
    #[error("invalid execution plan: {message}")]
    InvalidPlan { message: String },

    /// A result slot was never written.
    #[error("no result was produced for call {index}")]
    Incomplete { index: usize },
}

/// Error shape handed to the response formatter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorReport {
    pub module: Option<String>,
    pub method: Option<String>,
    pub message: String,
}

impl DispatchError {
    pub(crate) fn backend(module: &str, method: &str, err: &anyhow::Error) -> Self {
        DispatchError::BackendCall {
            module: module.to_string(),
            method: method.to_string(),
            message: format!("{err:#}"),
        }
    }

    pub fn report(&self) -> ErrorReport {
        let (module, method) = match self {
            DispatchError::ModuleNotActivated { module } => (Some(module.clone()), None),
            DispatchError::BackendCall { module, method, .. }
            | DispatchError::BatchResultMismatch { module, method, .. } => {
                (Some(module.clone()), Some(method.clone()))
            }
            DispatchError::InvalidMethodName { .. }
            | DispatchError::MissingMethod { .. }
            | DispatchError::InvalidPlan { .. }
            | DispatchError::Incomplete { .. } => (None, None),
        };
        ErrorReport {
            module,
            method,
            message: self.to_string(),
        }
    }
}
