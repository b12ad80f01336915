//! HTTP execution of fully resolved requests.

use crate::error::RequestError;
use crate::model::{HttpMethod, RequestInfo, ResponseInfo};
use async_trait::async_trait;
use reqwest::{Client, Method as ReqMethod};
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, instrument};

/// A request with every template token already substituted.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub params: HashMap<String, String>,
    pub body: Option<Value>,
    pub timeout_secs: u64,
}

impl ResolvedRequest {
    pub fn info(&self) -> RequestInfo {
        RequestInfo {
            method: self.method.as_str().to_string(),
            url: self.url.clone(),
            headers: self.headers.clone(),
            params: self.params.clone(),
            body: self.body.clone(),
        }
    }
}

/// Normalized response.
#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    /// Parsed JSON, or the raw text as a string value.
    pub body: Value,
    pub raw_body: String,
    pub elapsed_secs: f64,
}

impl HttpResponse {
    /// Build a response, parsing the body as JSON when possible.
    pub fn new(
        status: u16,
        headers: HashMap<String, String>,
        raw_body: String,
        elapsed_secs: f64,
    ) -> Self {
        let body = serde_json::from_str::<Value>(&raw_body)
            .unwrap_or_else(|_| Value::String(raw_body.clone()));
        Self {
            status,
            headers,
            body,
            raw_body,
            elapsed_secs,
        }
    }

    pub fn info(&self) -> ResponseInfo {
        ResponseInfo {
            status: self.status,
            headers: self.headers.clone(),
            body: self.body.clone(),
            elapsed_secs: self.elapsed_secs,
        }
    }
}

/// Performs one network call. Implementations never retry.
#[async_trait]
pub trait RequestExecutor: Send + Sync {
    async fn execute(
        &self,
        request: &ResolvedRequest,
    ) -> Result<HttpResponse, RequestError>;
}

/// Join a base URL and a path with exactly one slash between them.
///
/// Paths that already carry a scheme are returned unchanged.
pub fn join_url(base_url: Option<&str>, path: &str) -> String {
    if path.contains("://") {
        return path.to_string();
    }
    match base_url {
        Some(base) if !base.is_empty() => {
            let base = base.strip_suffix('/').unwrap_or(base);
            if path.is_empty() {
                return base.to_string();
            }
            let path = path.strip_prefix('/').unwrap_or(path);
            format!("{base}/{path}")
        }
        _ => path.to_string(),
    }
}

/// [`RequestExecutor`] backed by reqwest.
#[derive(Debug, Clone)]
pub struct ReqwestExecutor {
    client: Client,
}

impl ReqwestExecutor {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    fn convert_method(method: HttpMethod) -> ReqMethod {
        match method {
            HttpMethod::Get => ReqMethod::GET,
            HttpMethod::Post => ReqMethod::POST,
            HttpMethod::Put => ReqMethod::PUT,
            HttpMethod::Delete => ReqMethod::DELETE,
            HttpMethod::Patch => ReqMethod::PATCH,
            HttpMethod::Head => ReqMethod::HEAD,
            HttpMethod::Options => ReqMethod::OPTIONS,
        }
    }
}

impl Default for ReqwestExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RequestExecutor for ReqwestExecutor {
    #[instrument(
        skip(self, request),
        fields(url = %request.url, method = request.method.as_str())
    )]
    async fn execute(
        &self,
        request: &ResolvedRequest,
    ) -> Result<HttpResponse, RequestError> {
        if request.url.trim().is_empty() {
            return Err(RequestError::EmptyUrl);
        }
        let url = url::Url::parse(&request.url).map_err(|e| {
            RequestError::InvalidUrl {
                url: request.url.clone(),
                reason: e.to_string(),
            }
        })?;

        let mut req_builder = self
            .client
            .request(Self::convert_method(request.method), url)
            .timeout(Duration::from_secs(request.timeout_secs));

        for (name, value) in &request.headers {
            req_builder = req_builder.header(name, value);
        }

        if !request.params.is_empty() {
            req_builder = req_builder.query(&request.params);
        }

        match &request.body {
            None | Some(Value::Null) => {}
            Some(Value::String(text)) => {
                req_builder = req_builder.body(text.clone());
            }
            Some(json) => {
                let has_content_type = request
                    .headers
                    .keys()
                    .any(|k| k.eq_ignore_ascii_case("content-type"));
                if !has_content_type {
                    req_builder =
                        req_builder.header("Content-Type", "application/json");
                }
                req_builder = req_builder.body(json.to_string());
            }
        }

        debug!("Sending request to {}", request.url);
        let started = Instant::now();
        let response = req_builder
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, request.timeout_secs))?;
        let status = response.status().as_u16();
        debug!("Received response with status: {}", status);

        let headers: HashMap<String, String> = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.to_string(),
                    value.to_str().unwrap_or("").to_string(),
                )
            })
            .collect();

        let raw_body = response
            .text()
            .await
            .map_err(|e| map_reqwest_error(e, request.timeout_secs))?;

        Ok(HttpResponse::new(
            status,
            headers,
            raw_body,
            started.elapsed().as_secs_f64(),
        ))
    }
}

fn map_reqwest_error(e: reqwest::Error, timeout_secs: u64) -> RequestError {
    if e.is_timeout() {
        return RequestError::Timeout { timeout_secs };
    }
    if e.is_connect() {
        return RequestError::Connect(e.to_string());
    }
    RequestError::Other(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_join_url_single_slash() {
        let cases = [
            (Some("http://h/api/"), "/users", "http://h/api/users"),
            (Some("http://h/api"), "users", "http://h/api/users"),
            (Some("http://h/api/"), "users", "http://h/api/users"),
            (Some("http://h/api"), "/users", "http://h/api/users"),
            (Some("http://h/"), "", "http://h"),
            (None, "/users", "/users"),
            (Some(""), "/users", "/users"),
            (Some("http://h"), "https://other/x", "https://other/x"),
        ];
        for (base, path, expected) in cases {
            assert_eq!(join_url(base, path), expected, "{base:?} + {path}");
        }
    }

    #[test]
    fn test_join_url_strips_only_one_slash() {
        assert_eq!(join_url(Some("http://h//"), "//x"), "http://h///x");
    }

    #[test]
    fn test_response_body_parsing() {
        let json_resp =
            HttpResponse::new(200, HashMap::new(), r#"{"a":1}"#.into(), 0.1);
        assert_eq!(json_resp.body, json!({"a": 1}));

        let text_resp =
            HttpResponse::new(200, HashMap::new(), "hello".into(), 0.1);
        assert_eq!(text_resp.body, json!("hello"));
        assert_eq!(text_resp.raw_body, "hello");
    }

    #[tokio::test]
    async fn test_empty_url_rejected() {
        let executor = ReqwestExecutor::new();
        let request = ResolvedRequest {
            method: HttpMethod::Get,
            url: "  ".into(),
            headers: HashMap::new(),
            params: HashMap::new(),
            body: None,
            timeout_secs: 1,
        };
        assert_eq!(
            executor.execute(&request).await,
            Err(RequestError::EmptyUrl)
        );
    }

    #[tokio::test]
    async fn test_relative_url_rejected() {
        let executor = ReqwestExecutor::new();
        let request = ResolvedRequest {
            method: HttpMethod::Get,
            url: "/users".into(),
            headers: HashMap::new(),
            params: HashMap::new(),
            body: None,
            timeout_secs: 1,
        };
        assert!(matches!(
            executor.execute(&request).await,
            Err(RequestError::InvalidUrl { .. })
        ));
    }
}
