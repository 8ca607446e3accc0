use std::collections::HashMap;
use std::io::Read;

use anyhow::{anyhow, Context, Result};
use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tiny_http::{Header, Method, Request, Response, Server};
use tracing::{info, warn};

use crate::auth::fingerprint;
use crate::backend::echo_value;
use crate::normalize::CallParams;
use crate::rules::Target;

pub const PROTOCOL_VERSION: &str = "0.1";
const MAX_REQUEST_BYTES: usize = 5 * 1024 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InvokeRequest {
    pub protocol_version: String,
    pub module: String,
    pub method: String,
    pub batch: bool,
    pub params: Vec<CallParams>,
}

impl InvokeRequest {
    pub fn new(target: &Target, batch: bool, params: &[&CallParams]) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION.to_string(),
            module: target.module.clone(),
            method: target.method.clone(),
            batch,
            params: params.iter().map(|p| (*p).clone()).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvokeResponse {
    pub ok: bool,
    #[serde(default)]
    pub results: Vec<serde_json::Value>,
    #[serde(default)]
    pub error: Option<RemoteError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteError {
    pub code: String,
    pub message: String,
}

impl InvokeResponse {
    pub fn ok(results: Vec<serde_json::Value>) -> Self {
        Self {
            ok: true,
            results,
            error: None,
        }
    }

    pub fn err(code: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            results: Vec::new(),
            error: Some(RemoteError {
                code: code.to_string(),
                message: message.into(),
            }),
        }
    }
}

/// POST one invocation to `{endpoint}/v1/invoke` and return its results.
pub fn invoke_remote(
    client: &Client,
    endpoint: &str,
    headers: &HashMap<String, String>,
    token: Option<&str>,
    req: &InvokeRequest,
) -> Result<Vec<serde_json::Value>> {
    let url = format!("{}/v1/invoke", endpoint.trim_end_matches('/'));
    let mut builder = client.post(url).json(req);
    for (k, v) in headers {
        builder = builder.header(k, v);
    }
    if let Some(token) = token.filter(|t| !t.is_empty()) {
        builder = builder.bearer_auth(token);
    }

    let response = builder.send().map_err(|err| {
        if err.is_timeout() {
            anyhow!("REMOTE_TIMEOUT: {err}")
        } else {
            anyhow!("REMOTE_UNREACHABLE: {err}")
        }
    })?;

    if response.status() != StatusCode::OK {
        return Err(anyhow!("REMOTE_BAD_STATUS: {}", response.status()));
    }

    let parsed: InvokeResponse = response
        .json()
        .map_err(|err| anyhow!("REMOTE_INVALID_JSON: {err}"))?;
    if parsed.ok {
        Ok(parsed.results)
    } else {
        let err = parsed.error.unwrap_or(RemoteError {
            code: "REMOTE_EXECUTION_ERROR".to_string(),
            message: "remote execution failed".to_string(),
        });
        Err(anyhow!("{}: {}", err.code, err.message))
    }
}

/// Serve the echo backend over HTTP until the process exits.
///
/// `POST /v1/invoke` answers each call with its own description; calls whose
/// method is `fail` are answered with an execution error so clients can
/// exercise their failure path. `GET /v1/health` reports the protocol version.
pub fn run_echo_server(bind_addr: &str) -> Result<()> {
    let server = Server::http(bind_addr)
        .map_err(|err| anyhow!("failed to bind echo server at {bind_addr}: {err}"))?;
    info!(bind = %bind_addr, "echo backend listening");
    for request in server.incoming_requests() {
        if let Err(err) = handle(request) {
            warn!(error = %format!("{err:#}"), "failed to answer request");
        }
    }
    Ok(())
}

fn handle(mut request: Request) -> Result<()> {
    let method = request.method().clone();
    let url = request.url().to_string();
    match (method, url.as_str()) {
        (Method::Get, "/v1/health") => {
            let body = serde_json::to_vec(&serde_json::json!({
                "ok": true,
                "protocol_version": PROTOCOL_VERSION
            }))?;
            request.respond(json_response(200, body))?;
        }
        (Method::Post, "/v1/invoke") => {
            let mut body: Vec<u8> = Vec::new();
            request
                .as_reader()
                .take((MAX_REQUEST_BYTES + 1) as u64)
                .read_to_end(&mut body)
                .context("failed to read request body")?;
            if body.len() > MAX_REQUEST_BYTES {
                let resp = InvokeResponse::err(
                    "REMOTE_SCHEMA_VIOLATION",
                    "request payload exceeds 5 MiB limit",
                );
                request.respond(json_response(413, serde_json::to_vec(&resp)?))?;
                return Ok(());
            }

            let req: InvokeRequest = match serde_json::from_slice(&body) {
                Ok(v) => v,
                Err(err) => {
                    let resp = InvokeResponse::err(
                        "REMOTE_INVALID_JSON",
                        format!("invalid invoke request: {err}"),
                    );
                    request.respond(json_response(400, serde_json::to_vec(&resp)?))?;
                    return Ok(());
                }
            };

            let identity = bearer_token(&request).map(|t| fingerprint(&t));
            let response = echo_invoke(&req, identity.as_deref());
            request.respond(json_response(200, serde_json::to_vec(&response)?))?;
        }
        _ => {
            request.respond(Response::empty(404))?;
        }
    }
    Ok(())
}

fn bearer_token(request: &Request) -> Option<String> {
    request
        .headers()
        .iter()
        .find(|h| h.field.equiv("Authorization"))
        .and_then(|h| h.value.as_str().strip_prefix("Bearer ").map(str::to_string))
}

fn echo_invoke(req: &InvokeRequest, identity: Option<&str>) -> InvokeResponse {
    if req.protocol_version != PROTOCOL_VERSION {
        return InvokeResponse::err(
            "REMOTE_SCHEMA_VIOLATION",
            format!(
                "unsupported protocol_version '{}' (expected '{}')",
                req.protocol_version, PROTOCOL_VERSION
            ),
        );
    }
    if !req.batch && req.params.len() != 1 {
        return InvokeResponse::err(
            "REMOTE_SCHEMA_VIOLATION",
            format!("single invocation carries {} parameter sets", req.params.len()),
        );
    }
    if req.method == "fail" {
        return InvokeResponse::err(
            "REMOTE_EXECUTION_ERROR",
            format!("{}.{} failed on request", req.module, req.method),
        );
    }

    let target = Target::new(req.module.clone(), req.method.clone());
    InvokeResponse::ok(
        req.params
            .iter()
            .map(|p| echo_value(&target, p, identity))
            .collect(),
    )
}

fn json_response(code: u16, body: Vec<u8>) -> Response<std::io::Cursor<Vec<u8>>> {
    let mut response = Response::from_data(body).with_status_code(code);
    if let Ok(header) = Header::from_bytes("Content-Type", "application/json") {
        response = response.with_header(header);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    fn reserve_local_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    }

    fn params(pairs: &[(&str, &str)]) -> CallParams {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn echo_invoke_answers_each_parameter_set_in_order() {
        let a = params(&[("idSite", "1")]);
        let b = params(&[("idSite", "2")]);
        let req = InvokeRequest::new(&Target::new("A", "m"), true, &[&a, &b]);
        let resp = echo_invoke(&req, Some("abc"));
        assert!(resp.ok);
        assert_eq!(resp.results.len(), 2);
        assert_eq!(resp.results[1]["params"]["idSite"], "2");
        assert_eq!(resp.results[0]["identity"], "abc");
    }

    #[test]
    fn echo_invoke_rejects_wrong_protocol_and_fail_method() {
        let p = params(&[]);
        let mut req = InvokeRequest::new(&Target::new("A", "m"), false, &[&p]);
        req.protocol_version = "9".to_string();
        let resp = echo_invoke(&req, None);
        assert!(!resp.ok);
        assert_eq!(resp.error.unwrap().code, "REMOTE_SCHEMA_VIOLATION");

        let req = InvokeRequest::new(&Target::new("A", "fail"), false, &[&p]);
        let resp = echo_invoke(&req, None);
        assert_eq!(resp.error.unwrap().code, "REMOTE_EXECUTION_ERROR");
    }

    #[test]
    fn server_rejects_payloads_over_5_mib() {
        let port = reserve_local_port();
        let bind_addr = format!("127.0.0.1:{port}");
        thread::spawn({
            let bind_addr = bind_addr.clone();
            move || {
                let _ = run_echo_server(&bind_addr);
            }
        });
        std::thread::sleep(std::time::Duration::from_millis(120));

        let mut stream = std::net::TcpStream::connect(&bind_addr).expect("connect");
        let body = vec![b'x'; MAX_REQUEST_BYTES + 1];
        let req = format!(
            "POST /v1/invoke HTTP/1.1\r\nHost: {bind_addr}\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n",
            body.len()
        );
        stream.write_all(req.as_bytes()).unwrap();
        stream.write_all(&body).unwrap();
        stream.flush().unwrap();

        stream
            .set_read_timeout(Some(std::time::Duration::from_secs(2)))
            .unwrap();
        let mut buf = [0_u8; 1024];
        let n = stream.read(&mut buf).expect("read response");
        let resp = String::from_utf8_lossy(&buf[..n]);
        assert!(
            resp.contains("413"),
            "expected 413 response for oversized payload, got:\n{resp}"
        );
    }
}
