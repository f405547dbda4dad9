//! HTTP Dispatcher (§4.G): builds and sends the one HTTP request a Per-API
//! Pipeline run needs, handling the seven body framings
//! (`json|data|params|form|text|raw|files`), optional per-API session reuse,
//! mTLS, and the synchronous/async dispatch split.
//!
//! Grounded in `executor.py`'s `_build_request_kwargs`/`send_request`: the
//! `_raw` param is stripped of leading `/` and appended to the URL (as a
//! query string if it contains `=`, else as a bare path segment), and every
//! other body framing maps onto one `reqwest::RequestBuilder` method.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::{Client, Method};
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use crate::errors::EngineError;
use crate::model::{ApiConfig, BodyType, HttpMethod};

/// One dispatched response, already drained to a JSON-or-string body.
#[derive(Debug, Clone)]
pub struct DispatchResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body_text: String,
    pub body_json: Value,
    pub duration_ms: u64,
}

/// Builds [`Client`]s from an [`ApiConfig`]'s TLS settings and caches one per
/// `api_id` when `use_session` is set, matching the source platform's
/// `requests.Session()` reuse.
#[derive(Default)]
pub struct HttpDispatcher {
    sessions: Mutex<HashMap<i64, Arc<Client>>>,
}

impl HttpDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    async fn client_for(&self, api: &ApiConfig, use_async: bool) -> Result<Arc<Client>, EngineError> {
        if api.use_session {
            let mut sessions = self.sessions.lock().await;
            if let Some(existing) = sessions.get(&api.id) {
                return Ok(existing.clone());
            }
            let client = Arc::new(build_client(api, use_async)?);
            sessions.insert(api.id, client.clone());
            Ok(client)
        } else {
            Ok(Arc::new(build_client(api, use_async)?))
        }
    }

    /// Dispatches one request, synchronously awaiting the full response
    /// either way (§4.G: "the asynchronous executor is invoked from
    /// synchronous callers by running to completion"). `use_async` only
    /// changes the client's connect-timeout behavior: a cooperative-runtime
    /// connect timeout capped at 10s, separate from the overall request
    /// timeout, matching `httpx.AsyncClient`'s split timeout knobs versus
    /// `requests`' single timeout.
    pub async fn dispatch(
        &self,
        api: &ApiConfig,
        headers: &Map<String, Value>,
        params: &Map<String, Value>,
        body: &Value,
        use_async: bool,
    ) -> Result<DispatchResponse, EngineError> {
        let client = self.client_for(api, use_async).await?;
        send(&client, api, headers, params, body).await
    }
}

fn method_of(method: HttpMethod) -> Method {
    match method {
        HttpMethod::Get => Method::GET,
        HttpMethod::Post => Method::POST,
        HttpMethod::Put => Method::PUT,
        HttpMethod::Patch => Method::PATCH,
        HttpMethod::Delete => Method::DELETE,
    }
}

fn build_client(api: &ApiConfig, use_async: bool) -> Result<Client, EngineError> {
    let mut builder = Client::builder().timeout(Duration::from_secs(api.timeout_seconds));
    if use_async {
        let connect_secs = api.timeout_seconds.min(10);
        builder = builder.connect_timeout(Duration::from_secs(connect_secs));
    }

    match api.ssl_verify.as_str() {
        "false" | "0" => builder = builder.danger_accept_invalid_certs(true),
        "true" | "1" | "" => {}
        ca_path => {
            let pem = std::fs::read(ca_path)
                .map_err(|e| EngineError::config(format!("failed to read ssl_cert {ca_path}: {e}")))?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| EngineError::config(format!("invalid CA cert {ca_path}: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }
    }

    if api.client_cert_enabled {
        let (Some(cert_path), Some(key_path)) = (&api.client_cert, &api.client_key) else {
            return Err(EngineError::config("client_cert_enabled requires client_cert and client_key"));
        };
        let mut pem = std::fs::read(cert_path)
            .map_err(|e| EngineError::config(format!("failed to read client_cert {cert_path}: {e}")))?;
        let mut key = std::fs::read(key_path)
            .map_err(|e| EngineError::config(format!("failed to read client_key {key_path}: {e}")))?;
        pem.append(&mut key);
        let identity = reqwest::Identity::from_pem(&pem)
            .map_err(|e| EngineError::config(format!("invalid client identity: {e}")))?;
        builder = builder.identity(identity);
    }

    builder
        .build()
        .map_err(|e| EngineError::config(format!("failed to build http client: {e}")))
}

/// Renders `params` (the already-substituted, parsed `params` blob) as a
/// query string appended to `url`. `{"_raw": "..."}` is special-cased:
/// stripped of its leading `/`, then appended as a bare path segment unless
/// it already contains `=`, in which case it is appended as a query string.
fn apply_params(url: &str, params: &Map<String, Value>) -> String {
    if let Some(Value::String(raw)) = params.get("_raw") {
        let trimmed = raw.trim_start_matches('/');
        let sep = if url.contains('?') { "&" } else { "?" };
        return if trimmed.contains('=') {
            format!("{url}{sep}{trimmed}")
        } else {
            format!("{}/{}", url.trim_end_matches('/'), trimmed)
        };
    }
    let query: Vec<String> = params
        .iter()
        .filter(|(_, v)| !matches!(v, Value::Null) && !matches!(v, Value::String(s) if s.is_empty()))
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(&stringify_scalar(v))))
        .collect();
    if query.is_empty() {
        return url.to_string();
    }
    let sep = if url.contains('?') { "&" } else { "?" };
    format!("{url}{sep}{}", query.join("&"))
}

/// §4.G: `body_empty` iff `body ∈ {{}, "", null, []}` — only then is the
/// request sent with no body at all (no literal `{}`/empty form and no
/// auto-added `Content-Type`).
fn body_empty(body: &Value) -> bool {
    match body {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

fn stringify_scalar(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

async fn send(
    client: &Client,
    api: &ApiConfig,
    headers: &Map<String, Value>,
    params: &Map<String, Value>,
    body: &Value,
) -> Result<DispatchResponse, EngineError> {
    // `params` body type merges the (already-substituted) body object into
    // the query string rather than sending a request body at all.
    let url = if api.body_type == BodyType::Params {
        let mut merged = params.clone();
        if let Value::Object(map) = body {
            for (k, v) in map {
                merged.insert(k.clone(), v.clone());
            }
        }
        apply_params(&api.url, &merged)
    } else {
        apply_params(&api.url, params)
    };
    let mut builder = client.request(method_of(api.method), &url);
    let has_content_type = headers.keys().any(|k| k.eq_ignore_ascii_case("content-type"));

    for (k, v) in headers {
        builder = builder.header(k, stringify_scalar(v));
    }

    builder = match api.body_type {
        BodyType::Json if body_empty(body) => builder,
        BodyType::Json => builder.json(body),
        BodyType::Data if body_empty(body) => builder,
        BodyType::Data => {
            if let Value::Object(map) = body {
                let form: HashMap<String, String> =
                    map.iter().map(|(k, v)| (k.clone(), stringify_scalar(v))).collect();
                builder.form(&form)
            } else {
                builder.body(stringify_scalar(body))
            }
        }
        BodyType::Params => builder,
        BodyType::Form if body_empty(body) => builder,
        BodyType::Form => {
            if let Value::Object(map) = body {
                let form: HashMap<String, String> =
                    map.iter().map(|(k, v)| (k.clone(), stringify_scalar(v))).collect();
                builder.form(&form)
            } else {
                builder.body(stringify_scalar(body))
            }
        }
        BodyType::Text => {
            let text = stringify_scalar(body);
            if text.is_empty() {
                builder
            } else if has_content_type {
                builder.body(text)
            } else {
                builder.header("Content-Type", "text/plain; charset=utf-8").body(text)
            }
        }
        BodyType::Raw if body_empty(body) => builder,
        BodyType::Raw => match body {
            Value::String(s) => builder.body(s.clone()),
            Value::Object(_) | Value::Array(_) if has_content_type => builder.json(body),
            Value::Object(_) | Value::Array(_) => builder.header("Content-Type", "application/json").json(body),
            other => builder.body(stringify_scalar(other)),
        },
        BodyType::Files => build_multipart(builder, body).await?,
    };

    let start = Instant::now();
    let response = builder.send().await.map_err(classify_reqwest_error)?;
    let status = response.status().as_u16();
    let mut header_map = HashMap::new();
    for (k, v) in response.headers() {
        if let Ok(s) = v.to_str() {
            header_map.insert(k.to_string(), s.to_string());
        }
    }
    let body_text = response.text().await.map_err(classify_reqwest_error)?;
    let duration_ms = start.elapsed().as_millis() as u64;
    let body_json = serde_json::from_str(&body_text).unwrap_or(Value::Null);

    Ok(DispatchResponse {
        status,
        headers: header_map,
        body_text,
        body_json,
        duration_ms,
    })
}

/// Builds the multipart body for `body_type = files` (§4.G): `body.__files__`
/// is an array of `{field, path, mime}`, read off disk and packed as file
/// parts; every other top-level key in `body` becomes a plain text field.
async fn build_multipart(
    builder: reqwest::RequestBuilder,
    body: &Value,
) -> Result<reqwest::RequestBuilder, EngineError> {
    let mut form = reqwest::multipart::Form::new();
    let Value::Object(map) = body else {
        return Ok(builder.multipart(form));
    };
    if let Some(Value::Array(files)) = map.get("__files__") {
        for entry in files {
            let field = entry.get("field").and_then(|v| v.as_str()).unwrap_or("file").to_string();
            let path = entry.get("path").and_then(|v| v.as_str()).unwrap_or_default();
            let mime = entry.get("mime").and_then(|v| v.as_str()).unwrap_or("application/octet-stream");
            let bytes = tokio::fs::read(path)
                .await
                .map_err(|e| EngineError::config(format!("failed to read upload file {path}: {e}")))?;
            let file_name = std::path::Path::new(path)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| field.clone());
            let part = reqwest::multipart::Part::bytes(bytes)
                .file_name(file_name)
                .mime_str(mime)
                .map_err(|e| EngineError::config(format!("invalid mime {mime}: {e}")))?;
            form = form.part(field, part);
        }
    }
    for (k, v) in map {
        if k == "__files__" {
            continue;
        }
        form = form.text(k.clone(), stringify_scalar(v));
    }
    Ok(builder.multipart(form))
}

fn classify_reqwest_error(e: reqwest::Error) -> EngineError {
    if e.is_timeout() {
        EngineError::network_timeout(e.to_string())
    } else {
        EngineError::network_failure(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn raw_param_with_equals_appended_as_query() {
        let mut params = Map::new();
        params.insert("_raw".to_string(), json!("/id=5"));
        assert_eq!(apply_params("http://x/api", &params), "http://x/api?id=5");
    }

    #[test]
    fn raw_param_without_equals_appended_as_path() {
        let mut params = Map::new();
        params.insert("_raw".to_string(), json!("/segment"));
        assert_eq!(apply_params("http://x/api", &params), "http://x/api/segment");
    }

    #[test]
    fn plain_params_become_query_string() {
        let mut params = Map::new();
        params.insert("a".to_string(), json!("1"));
        let url = apply_params("http://x/api", &params);
        assert_eq!(url, "http://x/api?a=1");
    }

    #[test]
    fn empty_params_leave_url_untouched() {
        assert_eq!(apply_params("http://x/api", &Map::new()), "http://x/api");
    }

    #[test]
    fn drops_null_and_empty_string_params() {
        let mut params = Map::new();
        params.insert("a".to_string(), json!("1"));
        params.insert("b".to_string(), json!(""));
        params.insert("c".to_string(), Value::Null);
        assert_eq!(apply_params("http://x/api", &params), "http://x/api?a=1");
    }

    #[test]
    fn body_empty_matches_spec_set() {
        assert!(body_empty(&Value::Null));
        assert!(body_empty(&json!("")));
        assert!(body_empty(&json!({})));
        assert!(body_empty(&json!([])));
        assert!(!body_empty(&json!("hello")));
        assert!(!body_empty(&json!({"a": 1})));
        assert!(!body_empty(&json!([1])));
    }
}
