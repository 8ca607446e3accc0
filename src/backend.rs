use std::collections::{BTreeSet, HashMap};
use std::env;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde_json::{json, Value as JsonValue};

use crate::auth::{fingerprint, Authenticator};
use crate::config::BackendSpec;
use crate::normalize::{CallParams, TOKEN_AUTH_PARAM};
use crate::remote::{self, InvokeRequest};
use crate::rules::Target;

/// Answers whether a module may be called at all.
pub trait ModuleRegistry {
    fn is_active(&self, module: &str) -> bool;
}

/// Registry with a fixed set of active modules.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StaticRegistry {
    active: BTreeSet<String>,
}

impl StaticRegistry {
    pub fn new<I, S>(active: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            active: active.into_iter().map(Into::into).collect(),
        }
    }
}

impl ModuleRegistry for StaticRegistry {
    fn is_active(&self, module: &str) -> bool {
        self.active.contains(module)
    }
}

/// Executes API methods. Calls are synchronous and may block.
pub trait Backend: Send + Sync {
    /// Run one call.
    fn call(&self, target: &Target, params: &CallParams) -> Result<JsonValue>;

    /// Run a merged call; the returned values must line up with `params`.
    fn call_batch(&self, target: &Target, params: &[&CallParams]) -> Result<Vec<JsonValue>>;
}

/// Build a backend from the `backend` section of the configuration.
pub fn build_backend(spec: &BackendSpec) -> Result<ConfiguredBackend> {
    let kind = spec.kind.trim().to_lowercase();
    match kind.as_str() {
        "echo" => Ok(ConfiguredBackend::Echo(EchoBackend::new())),
        "http" => Ok(ConfiguredBackend::Http(HttpBackend::from_spec(spec)?)),
        other => Err(anyhow!(
            "unsupported backend kind '{other}' (supported: echo, http)"
        )),
    }
}

/// The backend selected by configuration. It is also the authenticator, since
/// the active credential has to reach the calls it authorizes.
#[derive(Debug)]
pub enum ConfiguredBackend {
    Echo(EchoBackend),
    Http(HttpBackend),
}

impl Backend for ConfiguredBackend {
    fn call(&self, target: &Target, params: &CallParams) -> Result<JsonValue> {
        match self {
            ConfiguredBackend::Echo(b) => b.call(target, params),
            ConfiguredBackend::Http(b) => b.call(target, params),
        }
    }

    fn call_batch(&self, target: &Target, params: &[&CallParams]) -> Result<Vec<JsonValue>> {
        match self {
            ConfiguredBackend::Echo(b) => b.call_batch(target, params),
            ConfiguredBackend::Http(b) => b.call_batch(target, params),
        }
    }
}

impl Authenticator for ConfiguredBackend {
    fn reload_credential(&self, token: &str) {
        match self {
            ConfiguredBackend::Echo(b) => b.reload_credential(token),
            ConfiguredBackend::Http(b) => b.reload_credential(token),
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Answers every call with a description of the call itself.
///
/// Useful for dry runs: the output shows which target each call reached and
/// under which credential fingerprint.
#[derive(Debug, Default)]
pub struct EchoBackend {
    identity: Mutex<Option<String>>,
}

impl EchoBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn identity(&self) -> Option<String> {
        lock(&self.identity).clone()
    }
}

/// Echo payload for one call. The credential itself is never echoed, only
/// its fingerprint as `identity`.
pub fn echo_value(target: &Target, params: &CallParams, identity: Option<&str>) -> JsonValue {
    let visible: CallParams = params
        .iter()
        .filter(|(k, _)| k.as_str() != TOKEN_AUTH_PARAM)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    json!({
        "module": target.module,
        "method": target.method,
        "params": visible,
        "identity": identity,
    })
}

impl Backend for EchoBackend {
    fn call(&self, target: &Target, params: &CallParams) -> Result<JsonValue> {
        Ok(echo_value(target, params, self.identity().as_deref()))
    }

    fn call_batch(&self, target: &Target, params: &[&CallParams]) -> Result<Vec<JsonValue>> {
        let identity = self.identity();
        Ok(params
            .iter()
            .map(|p| echo_value(target, p, identity.as_deref()))
            .collect())
    }
}

impl Authenticator for EchoBackend {
    fn reload_credential(&self, token: &str) {
        *lock(&self.identity) = Some(fingerprint(token));
    }
}

/// Calls a remote API server over the `/v1/invoke` protocol.
#[derive(Debug)]
pub struct HttpBackend {
    endpoint: String,
    headers: HashMap<String, String>,
    client: reqwest::blocking::Client,
    token: Mutex<Option<String>>,
}

impl HttpBackend {
    pub fn from_spec(spec: &BackendSpec) -> Result<Self> {
        let cfg = &spec.config;

        let endpoint = cfg_str(cfg, "endpoint")
            .map(|s| s.trim_end_matches('/').to_string())
            .ok_or_else(|| anyhow!("http backend requires config.endpoint"))?;

        let mut headers = HashMap::new();
        if let Some(h) = cfg.get("headers") {
            let obj = h.as_object().ok_or_else(|| {
                anyhow!("http backend config.headers must be an object of string values")
            })?;
            for (k, v) in obj {
                let v = v
                    .as_str()
                    .ok_or_else(|| anyhow!("http backend config.headers values must be strings"))?;
                headers.insert(k.clone(), v.to_string());
            }
        }

        let secs = match cfg_u64(cfg, "timeout_secs") {
            Some(secs) => secs,
            None => timeout_secs()?,
        };
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(secs))
            .build()
            .context("failed to build http client")?;

        Ok(Self {
            endpoint,
            headers,
            client,
            token: Mutex::new(None),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn invoke(&self, target: &Target, batch: bool, params: &[&CallParams]) -> Result<Vec<JsonValue>> {
        let req = InvokeRequest::new(target, batch, params);
        let token = lock(&self.token).clone();
        remote::invoke_remote(
            &self.client,
            &self.endpoint,
            &self.headers,
            token.as_deref(),
            &req,
        )
    }
}

impl Backend for HttpBackend {
    fn call(&self, target: &Target, params: &CallParams) -> Result<JsonValue> {
        let mut results = self.invoke(target, false, &[params])?;
        if results.len() != 1 {
            return Err(anyhow!(
                "remote returned {} result(s) for a single call",
                results.len()
            ));
        }
        Ok(results.remove(0))
    }

    fn call_batch(&self, target: &Target, params: &[&CallParams]) -> Result<Vec<JsonValue>> {
        self.invoke(target, true, params)
    }
}

impl Authenticator for HttpBackend {
    fn reload_credential(&self, token: &str) {
        *lock(&self.token) = Some(token.to_string());
    }
}

/// Default request timeout, overridable through `BULKAPI_TIMEOUT_SECS`.
pub fn timeout_secs() -> Result<u64> {
    let raw = env::var("BULKAPI_TIMEOUT_SECS").ok();
    let secs = match raw {
        None => 30_u64,
        Some(v) => {
            let parsed: u64 = v.parse().map_err(|_| {
                anyhow!("invalid BULKAPI_TIMEOUT_SECS: '{v}' (must be a positive integer)")
            })?;
            if parsed == 0 {
                return Err(anyhow!(
                    "invalid BULKAPI_TIMEOUT_SECS: '{v}' (must be a positive integer)"
                ));
            }
            parsed
        }
    };
    Ok(secs)
}

fn cfg_str<'a>(cfg: &'a HashMap<String, JsonValue>, key: &str) -> Option<&'a str> {
    cfg.get(key).and_then(|v| v.as_str())
}

fn cfg_u64(cfg: &HashMap<String, JsonValue>, key: &str) -> Option<u64> {
    cfg.get(key).and_then(|v| {
        if let Some(u) = v.as_u64() {
            Some(u)
        } else if let Some(s) = v.as_str() {
            s.parse::<u64>().ok()
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(kind: &str, config: JsonValue) -> BackendSpec {
        BackendSpec {
            kind: kind.to_string(),
            config: serde_json::from_value(config).unwrap(),
        }
    }

    fn params(pairs: &[(&str, &str)]) -> CallParams {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn static_registry_checks_membership() {
        let reg = StaticRegistry::new(["Actions"]);
        assert!(reg.is_active("Actions"));
        assert!(!reg.is_active("Goals"));
    }

    #[test]
    fn echo_backend_reflects_target_params_and_identity() {
        let backend = EchoBackend::new();
        let target = Target::new("A", "m");
        let p = params(&[("idSite", "1")]);

        let before = backend.call(&target, &p).unwrap();
        assert_eq!(before["identity"], JsonValue::Null);

        backend.reload_credential("t1");
        let after = backend.call_batch(&target, &[&p, &p]).unwrap();
        assert_eq!(after.len(), 2);
        assert_eq!(after[0]["module"], "A");
        assert_eq!(after[1]["params"]["idSite"], "1");
        assert_eq!(after[0]["identity"], fingerprint("t1"));
    }

    #[test]
    fn echo_value_hides_the_credential() {
        let p = params(&[("idSite", "1"), ("token_auth", "secret")]);
        let v = echo_value(&Target::new("A", "m"), &p, Some("abc"));
        assert_eq!(v["params"], serde_json::json!({ "idSite": "1" }));
        assert!(!v.to_string().contains("secret"));
    }

    #[test]
    fn build_backend_rejects_unknown_kind() {
        let err = build_backend(&spec("carrier-pigeon", serde_json::json!({}))).unwrap_err();
        assert!(err.to_string().contains("unsupported backend kind"), "{err:#}");
    }

    #[test]
    fn http_backend_requires_endpoint() {
        let err = build_backend(&spec("http", serde_json::json!({}))).unwrap_err();
        assert!(err.to_string().contains("config.endpoint"), "{err:#}");
    }

    #[test]
    fn http_backend_rejects_non_string_headers() {
        let err = build_backend(&spec(
            "http",
            serde_json::json!({ "endpoint": "http://127.0.0.1:1", "headers": { "X-A": 1 } }),
        ))
        .unwrap_err();
        assert!(err.to_string().contains("headers values"), "{err:#}");
    }

    #[test]
    fn http_backend_trims_trailing_slash() {
        let backend = HttpBackend::from_spec(&spec(
            "http",
            serde_json::json!({ "endpoint": "http://127.0.0.1:9/", "timeout_secs": 5 }),
        ))
        .unwrap();
        assert_eq!(backend.endpoint(), "http://127.0.0.1:9");
    }
}
