use std::collections::BTreeMap;

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use serde_json::Value as JsonValue;
use url::form_urlencoded;

/// Request parameter that switches on bulk normalization.
pub const BULK_PARAM: &str = "bulk";

/// A parameter as it arrived: a single value or a sequence of values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ParamValue {
    Scalar(String),
    List(Vec<String>),
}

/// One incoming request before normalization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct RawRequest {
    params: BTreeMap<String, ParamValue>,
}

impl RawRequest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a GET-style query string.
    ///
    /// - newlines and tabs are removed before decoding
    /// - `#` is ordinary data, not a fragment marker
    /// - `key[]=v` appends `v` to the list parameter `key`
    /// - `key[N]=v` puts `v` at position `N` of the list `key`; elements are
    ///   ordered by `N` and gaps close up
    /// - any other key is a scalar; the last occurrence of a name wins
    /// - scalar values are trimmed, list elements are kept verbatim
    ///
    /// Decoding itself cannot fail; the `Result` matches the other
    /// constructors.
    pub fn from_query(query: &str) -> Result<Self> {
        let cleaned: String = query
            .trim()
            .chars()
            .filter(|c| *c != '\n' && *c != '\t')
            .collect();
        let cleaned = cleaned.trim_start_matches('?');

        let mut req = Self::new();
        let mut lists: BTreeMap<String, BTreeMap<usize, String>> = BTreeMap::new();
        for (key, value) in form_urlencoded::parse(cleaned.as_bytes()) {
            if key.is_empty() {
                continue;
            }
            if let Some(name) = key.strip_suffix("[]") {
                req.params.remove(name);
                let slots = lists.entry(name.to_string()).or_default();
                let next = slots.keys().next_back().map_or(0, |last| last + 1);
                slots.insert(next, value.into_owned());
            } else if let Some((name, pos)) = indexed_key(&key) {
                req.params.remove(name);
                lists
                    .entry(name.to_string())
                    .or_default()
                    .insert(pos, value.into_owned());
            } else {
                lists.remove(&*key);
                req.set(key.to_string(), value.trim());
            }
        }
        for (name, slots) in lists {
            req.params
                .insert(name, ParamValue::List(slots.into_values().collect()));
        }
        Ok(req)
    }

    /// Build a request from a JSON mapping whose values are strings, numbers,
    /// booleans or sequences of those.
    pub fn from_json(value: &JsonValue) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| anyhow!("request must be a mapping of parameter names to values"))?;

        let mut req = Self::new();
        for (key, v) in obj {
            match v {
                JsonValue::Array(items) => {
                    let mut list = Vec::with_capacity(items.len());
                    for item in items {
                        list.push(scalar_text(key, item)?);
                    }
                    req.params.insert(key.clone(), ParamValue::List(list));
                }
                other => {
                    let text = scalar_text(key, other)?;
                    req.set(key.clone(), text.trim());
                }
            }
        }
        Ok(req)
    }

    /// Parse a request file (YAML or JSON; YAML is a superset).
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let yaml: serde_yaml::Value =
            serde_yaml::from_str(text).context("parse request yaml into Value")?;
        let json: JsonValue =
            serde_json::to_value(&yaml).context("convert request yaml value to json value")?;
        Self::from_json(&json)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.params
            .insert(key.into(), ParamValue::Scalar(value.into()));
        self
    }

    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        let value = value.into();
        match self.params.entry(key.into()) {
            std::collections::btree_map::Entry::Occupied(mut slot) => match slot.get_mut() {
                ParamValue::List(list) => list.push(value),
                scalar => *scalar = ParamValue::List(vec![value]),
            },
            std::collections::btree_map::Entry::Vacant(slot) => {
                slot.insert(ParamValue::List(vec![value]));
            }
        }
        self
    }

    pub fn get(&self, key: &str) -> Option<&ParamValue> {
        self.params.get(key)
    }

    pub fn params(&self) -> &BTreeMap<String, ParamValue> {
        &self.params
    }

    /// True when `bulk=true` is present.
    pub fn is_bulk(&self) -> bool {
        matches!(self.params.get(BULK_PARAM), Some(ParamValue::Scalar(v)) if v == "true")
    }
}

/// Split `name[N]` into `name` and `N`. Other bracket forms stay literal keys.
fn indexed_key(key: &str) -> Option<(&str, usize)> {
    let (name, rest) = key.split_once('[')?;
    let pos = rest.strip_suffix(']')?.parse().ok()?;
    (!name.is_empty()).then_some((name, pos))
}

fn scalar_text(key: &str, value: &JsonValue) -> Result<String> {
    match value {
        JsonValue::String(s) => Ok(s.clone()),
        JsonValue::Number(n) => Ok(n.to_string()),
        JsonValue::Bool(b) => Ok(b.to_string()),
        JsonValue::Null => Ok(String::new()),
        _ => Err(anyhow!(
            "parameter '{key}' must be a string, number, boolean or a list of those"
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_collects_bracketed_keys_into_lists() {
        let req = RawRequest::from_query(
            "bulk=true&method[]=Actions.get&method[]=Goals.get&idSite=1&format=json",
        )
        .unwrap();
        assert!(req.is_bulk());
        assert_eq!(
            req.get("method"),
            Some(&ParamValue::List(vec![
                "Actions.get".to_string(),
                "Goals.get".to_string()
            ]))
        );
        assert_eq!(req.get("idSite"), Some(&ParamValue::Scalar("1".to_string())));
    }

    #[test]
    fn query_strips_newlines_tabs_and_trims_scalars() {
        let req = RawRequest::from_query("\n\tmethod=Actions.get\n&date=%20yesterday%20").unwrap();
        assert_eq!(
            req.get("method"),
            Some(&ParamValue::Scalar("Actions.get".to_string()))
        );
        assert_eq!(
            req.get("date"),
            Some(&ParamValue::Scalar("yesterday".to_string()))
        );
    }

    #[test]
    fn query_decodes_percent_escapes_and_plus() {
        let req = RawRequest::from_query("?segment=a%3Db&label=two+words").unwrap();
        assert_eq!(
            req.get("segment"),
            Some(&ParamValue::Scalar("a=b".to_string()))
        );
        assert_eq!(
            req.get("label"),
            Some(&ParamValue::Scalar("two words".to_string()))
        );
    }

    #[test]
    fn query_keeps_hash_as_plain_data() {
        let req = RawRequest::from_query("method=A.m&label=a#b&idSite=1").unwrap();
        assert_eq!(
            req.get("label"),
            Some(&ParamValue::Scalar("a#b".to_string()))
        );
        assert_eq!(req.get("idSite"), Some(&ParamValue::Scalar("1".to_string())));
        assert_eq!(req.params().len(), 3);
    }

    #[test]
    fn query_indexed_keys_form_lists_ordered_by_index() {
        let req = RawRequest::from_query("bulk=true&method[1]=B.n&method[0]=A.m").unwrap();
        assert_eq!(
            req.get("method"),
            Some(&ParamValue::List(vec!["A.m".to_string(), "B.n".to_string()]))
        );
        assert!(req.get("method[0]").is_none());

        let normalized = crate::normalize::normalize(&req).unwrap();
        assert_eq!(normalized.calls.len(), 2);
        assert_eq!(normalized.calls[1].method(), Some("B.n"));
    }

    #[test]
    fn query_appends_after_the_highest_index() {
        let req = RawRequest::from_query("idSite[3]=3&idSite[]=4&idSite[0]=0&filter[name]=x")
            .unwrap();
        assert_eq!(
            req.get("idSite"),
            Some(&ParamValue::List(vec![
                "0".to_string(),
                "3".to_string(),
                "4".to_string()
            ]))
        );
        assert_eq!(
            req.get("filter[name]"),
            Some(&ParamValue::Scalar("x".to_string()))
        );
    }

    #[test]
    fn query_last_occurrence_of_a_name_wins() {
        let req = RawRequest::from_query("idSite=1&idSite[]=2").unwrap();
        assert_eq!(req.get("idSite"), Some(&ParamValue::List(vec!["2".to_string()])));
        let req = RawRequest::from_query("idSite[]=2&idSite=1").unwrap();
        assert_eq!(req.get("idSite"), Some(&ParamValue::Scalar("1".to_string())));
    }

    #[test]
    fn bulk_flag_requires_literal_true() {
        let req = RawRequest::from_query("bulk=1&method=A.b").unwrap();
        assert!(!req.is_bulk());
        let req = RawRequest::from_query("method=A.b").unwrap();
        assert!(!req.is_bulk());
    }

    #[test]
    fn json_mapping_stringifies_numbers_and_bools() {
        let value = serde_json::json!({
            "bulk": true,
            "idSite": [1, 2],
            "method": "Actions.get"
        });
        let req = RawRequest::from_json(&value).unwrap();
        assert!(req.is_bulk());
        assert_eq!(
            req.get("idSite"),
            Some(&ParamValue::List(vec!["1".to_string(), "2".to_string()]))
        );
    }

    #[test]
    fn json_rejects_nested_objects() {
        let value = serde_json::json!({ "method": { "nested": "x" } });
        let err = RawRequest::from_json(&value).unwrap_err();
        assert!(err.to_string().contains("method"), "{err:#}");
    }

    #[test]
    fn yaml_request_file_parses() {
        let req = RawRequest::from_yaml_str(
            "bulk: \"true\"\nmethod:\n  - A.m\n  - A.m\ntoken_auth: t1\n",
        )
        .unwrap();
        assert!(req.is_bulk());
        assert_eq!(req.params().len(), 3);
    }
}
