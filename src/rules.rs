use std::collections::{BTreeMap, HashMap};

use serde::Serialize;
use serde_json::Value as JsonValue;

use crate::normalize::{CallRequest, MethodRef};

/// Backend entry point that a group or split is submitted to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Target {
    pub module: String,
    pub method: String,
}

impl Target {
    pub fn new(module: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            method: method.into(),
        }
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.module, self.method)
    }
}

/// Declares that calls to `method_name` may be merged into one invocation of
/// `target`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupingRule {
    pub method_name: String,
    pub target: Target,
    pub merge_capable: bool,
}

/// Call indices bound to one rule, ascending.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Group {
    pub indices: Vec<usize>,
    pub target: Target,
}

/// Per-module grouping hook: each module decides which of its calls merge.
pub trait GroupingRuleSource {
    fn analyze_bulk_requests(&self, calls: &[CallRequest]) -> Vec<Group>;
}

/// Table-driven rule source for one module.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkAnalyzer {
    module: String,
    rules: BTreeMap<String, GroupingRule>,
}

impl BulkAnalyzer {
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            rules: BTreeMap::new(),
        }
    }

    pub fn with_rule(mut self, rule: GroupingRule) -> Self {
        self.rules.insert(rule.method_name.clone(), rule);
        self
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn rule(&self, method_name: &str) -> Option<&GroupingRule> {
        self.rules.get(method_name)
    }

    fn matching_rule(&self, call: &CallRequest) -> Option<&GroupingRule> {
        let Some(Ok(MethodRef { module, method })) = call.method_ref() else {
            return None;
        };
        if module != self.module {
            return None;
        }
        self.rules.get(&method).filter(|rule| rule.merge_capable)
    }
}

impl GroupingRuleSource for BulkAnalyzer {
    fn analyze_bulk_requests(&self, calls: &[CallRequest]) -> Vec<Group> {
        let mut groups: Vec<(String, Group)> = Vec::new();

        for call in calls {
            let Some(rule) = self.matching_rule(call) else {
                continue;
            };
            match groups.iter_mut().find(|(name, _)| *name == rule.method_name) {
                Some((_, group)) => group.indices.push(call.index),
                None => groups.push((
                    rule.method_name.clone(),
                    Group {
                        indices: vec![call.index],
                        target: rule.target.clone(),
                    },
                )),
            }
        }

        groups.into_iter().map(|(_, group)| group).collect()
    }
}

/// Immutable module → rule source table for one dispatch.
#[derive(Default)]
pub struct RuleBook {
    sources: BTreeMap<String, Box<dyn GroupingRuleSource + Send + Sync>>,
}

impl RuleBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_analyzer(mut self, analyzer: BulkAnalyzer) -> Self {
        let module = analyzer.module().to_string();
        self.sources.insert(module, Box::new(analyzer));
        self
    }

    /// Register a custom rule source for `module`.
    pub fn with_source(
        mut self,
        module: impl Into<String>,
        source: Box<dyn GroupingRuleSource + Send + Sync>,
    ) -> Self {
        self.sources.insert(module.into(), source);
        self
    }

    pub fn source_for(&self, module: &str) -> Option<&(dyn GroupingRuleSource + Send + Sync)> {
        self.sources.get(module).map(|s| s.as_ref())
    }

    pub fn modules(&self) -> impl Iterator<Item = &str> {
        self.sources.keys().map(String::as_str)
    }
}

/// Line up batched results with the requests they answer.
///
/// Backends implementing a merged call often get results back keyed by some
/// field rather than in request order. Each result object is indexed by its
/// `result_key` field; each request is then looked up by its `request_key`
/// value (or, when `request_key` is `None`, by the request value itself, which
/// must be a string). Requests without a matching result map to `None`.
///
/// # Examples
///
/// A `Backend::call_batch` whose remote answers one row per site, in any
/// order, turns the rows back into one value per call:
///
/// ```
/// use bulkapi::rules::map_results_by_key;
/// use serde_json::{json, Value};
///
/// let calls = vec![json!({"idSite": "3"}), json!({"idSite": "1"}), json!({"idSite": "9"})];
/// let rows = vec![
///     json!({"idSite": 1, "visits": 10}),
///     json!({"idSite": 3, "visits": 30}),
/// ];
///
/// let values: Vec<Value> = map_results_by_key(&calls, &rows, Some("idSite"), "idSite")
///     .into_iter()
///     .map(|row| row.unwrap_or(Value::Null))
///     .collect();
///
/// assert_eq!(values[0]["visits"], 30);
/// assert_eq!(values[1]["visits"], 10);
/// assert_eq!(values[2], Value::Null);
/// ```
pub fn map_results_by_key(
    requests: &[JsonValue],
    results: &[JsonValue],
    request_key: Option<&str>,
    result_key: &str,
) -> Vec<Option<JsonValue>> {
    let mut by_key: HashMap<String, &JsonValue> = HashMap::new();
    for result in results {
        if let Some(key) = result.get(result_key).and_then(key_text) {
            by_key.insert(key, result);
        }
    }

    requests
        .iter()
        .map(|request| {
            let lookup = match request_key {
                Some(field) => request.get(field).and_then(key_text),
                None => key_text(request),
            };
            lookup.and_then(|k| by_key.get(&k).map(|v| (*v).clone()))
        })
        .collect()
}

fn key_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}
