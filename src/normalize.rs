use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::DispatchError;
use crate::request::{ParamValue, RawRequest};

/// Parameter naming the API method of a call (`module.methodName`).
pub const METHOD_PARAM: &str = "method";
/// Parameter carrying the caller credential of a call.
pub const TOKEN_AUTH_PARAM: &str = "token_auth";

/// Flat parameters of one logical call.
pub type CallParams = BTreeMap<String, String>;

/// `module.methodName`, split.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct MethodRef {
    pub module: String,
    pub method: String,
}

impl MethodRef {
    /// Accepts exactly two dot-separated segments.
    pub fn parse(value: &str) -> Result<Self, DispatchError> {
        let mut parts = value.split('.');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(module), Some(method), None) => Ok(Self {
                module: module.to_string(),
                method: method.to_string(),
            }),
            _ => Err(DispatchError::InvalidMethodName {
                value: value.to_string(),
            }),
        }
    }
}

impl std::fmt::Display for MethodRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.module, self.method)
    }
}

/// One logical API call extracted from a bulk request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CallRequest {
    pub index: usize,
    pub params: CallParams,
}

impl CallRequest {
    pub fn method(&self) -> Option<&str> {
        self.params.get(METHOD_PARAM).map(String::as_str)
    }

    /// `None` when the call has no `method` parameter.
    pub fn method_ref(&self) -> Option<Result<MethodRef, DispatchError>> {
        self.method().map(MethodRef::parse)
    }

    /// The call credential; a missing `token_auth` reads as empty.
    pub fn token_auth(&self) -> &str {
        self.params
            .get(TOKEN_AUTH_PARAM)
            .map(String::as_str)
            .unwrap_or("")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedRequest {
    pub calls: Vec<CallRequest>,
    /// Distinct modules referenced by the calls, in first-occurrence order.
    pub modules: Vec<String>,
}

/// Number of logical calls encoded in `raw`: the longest list, at least one.
pub fn call_count(raw: &RawRequest) -> usize {
    raw.params()
        .values()
        .filter_map(|v| match v {
            ParamValue::List(list) => Some(list.len()),
            ParamValue::Scalar(_) => None,
        })
        .fold(1, usize::max)
}

/// Expand `raw` into one flat parameter map per call.
///
/// List parameters shorter than the call count stretch their last element over
/// the remaining calls; scalars are broadcast to every call.
pub fn normalize(raw: &RawRequest) -> Result<NormalizedRequest, DispatchError> {
    let count = call_count(raw);
    let mut calls = Vec::with_capacity(count);
    let mut modules: Vec<String> = Vec::new();

    for index in 0..count {
        let mut params = CallParams::new();
        for (key, value) in raw.params() {
            let picked = match value {
                ParamValue::Scalar(v) => Some(v),
                ParamValue::List(list) => list.get(index.min(list.len().saturating_sub(1))),
            };
            if let Some(v) = picked {
                params.insert(key.clone(), v.clone());
            }
        }

        let call = CallRequest { index, params };
        if let Some(parsed) = call.method_ref() {
            let method_ref = parsed?;
            if !modules.contains(&method_ref.module) {
                modules.push(method_ref.module);
            }
        }
        calls.push(call);
    }

    Ok(NormalizedRequest { calls, modules })
}
