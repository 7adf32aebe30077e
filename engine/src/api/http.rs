//! `http` namespace: outbound requests through the host
//!
//! A request goes out only when its host is on the host-wide allow-list
//! (`http.allowed_hosts`) and matches one of the plugin's `network`
//! permission scopes. Both accept exact hosts, `*.suffix` for subdomains and
//! `*` for any host.

use super::usage::UsageTracker;
use crate::config::HttpConfig;
use async_trait::async_trait;
use reqwest::{Client, Method, Response, Url};
use sdk::errors::{truncate, EngineError};
use sdk::host_api::{args, NamespaceImpl};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

/// Largest response body handed back to a plugin
const MAX_RESPONSE_BYTES: usize = 1024 * 1024;

/// Shared client and allow-list
pub struct HttpGateway {
    client: Client,
    allowed_hosts: Vec<String>,
    usage: Arc<UsageTracker>,
}

impl HttpGateway {
    pub fn new(config: &HttpConfig, usage: Arc<UsageTracker>) -> Result<Self, EngineError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| EngineError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            allowed_hosts: config.allowed_hosts.clone(),
            usage,
        })
    }

    /// Namespace implementation bound to one plugin's scopes
    pub fn for_plugin(self: &Arc<Self>, scopes: Vec<String>) -> HttpApi {
        HttpApi {
            gateway: Arc::clone(self),
            scopes,
        }
    }
}

/// Host part of a scope such as `api.example.com`, `https://api.example.com/v1`
/// or `*.example.com:443`
fn scope_host(scope: &str) -> &str {
    let rest = scope.split_once("://").map_or(scope, |(_, rest)| rest);
    let rest = rest.split('/').next().unwrap_or(rest);
    rest.split(':').next().unwrap_or(rest)
}

/// Whether `host` matches an allow-list entry or scope
pub fn host_matches(pattern: &str, host: &str) -> bool {
    let pattern = scope_host(pattern.trim()).to_ascii_lowercase();
    let host = host.to_ascii_lowercase();
    if pattern == "*" {
        return true;
    }
    match pattern.strip_prefix("*.") {
        Some(suffix) => host.len() > suffix.len() && host.ends_with(&format!(".{}", suffix)),
        None => pattern == host,
    }
}

/// Outbound HTTP for one plugin
pub struct HttpApi {
    gateway: Arc<HttpGateway>,
    scopes: Vec<String>,
}

impl HttpApi {
    /// Parse and gate a URL
    fn authorize(&self, plugin_id: &str, raw: &str) -> Result<Url, EngineError> {
        let url = Url::parse(raw)
            .map_err(|e| EngineError::Execution(format!("Invalid URL {}: {}", truncate(raw), e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(EngineError::Execution(format!(
                "Unsupported URL scheme: {}",
                url.scheme()
            )));
        }
        let host = url
            .host_str()
            .ok_or_else(|| EngineError::Execution(format!("URL has no host: {}", truncate(raw))))?;

        let allowed = self.gateway.allowed_hosts.iter().any(|p| host_matches(p, host));
        let scoped = self.scopes.iter().any(|p| host_matches(p, host));
        if !allowed || !scoped {
            return Err(EngineError::PermissionDenied {
                plugin_id: plugin_id.to_string(),
                capability: format!("network access to {}", host),
            });
        }
        Ok(url)
    }

    async fn request(
        &self,
        plugin_id: &str,
        method: Method,
        url: &str,
        body: Option<Value>,
    ) -> Result<Value, EngineError> {
        let url = self.authorize(plugin_id, url)?;
        self.gateway.usage.record_network_call(plugin_id).await;
        tracing::debug!("{} {} for {}", method, url, plugin_id);

        let mut request = self.gateway.client.request(method, url);
        request = match body {
            None | Some(Value::Null) => request,
            Some(Value::String(text)) => request.body(text),
            Some(other) => request.json(&other),
        };

        let response = request
            .send()
            .await
            .map_err(|e| EngineError::Execution(format!("HTTP request failed: {}", e)))?;
        let status = response.status();
        let is_json = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.contains("json"));

        let bytes = read_limited(response, MAX_RESPONSE_BYTES).await?;

        let body = if is_json {
            serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
        } else {
            Value::String(String::from_utf8_lossy(&bytes).into_owned())
        };

        Ok(json!({
            "status": status.as_u16(),
            "ok": status.is_success(),
            "body": body,
        }))
    }
}

/// Read a response body, giving up as soon as it grows past `limit`
async fn read_limited(mut response: Response, limit: usize) -> Result<Vec<u8>, EngineError> {
    let too_large = |len: u64| {
        EngineError::Execution(format!("Response of {} bytes exceeds {} bytes", len, limit))
    };
    if let Some(len) = response.content_length().filter(|&len| len > limit as u64) {
        return Err(too_large(len));
    }

    let mut bytes = Vec::new();
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| EngineError::Execution(format!("Failed to read response: {}", e)))?
    {
        if bytes.len() + chunk.len() > limit {
            return Err(too_large((bytes.len() + chunk.len()) as u64));
        }
        bytes.extend_from_slice(&chunk);
    }
    Ok(bytes)
}

#[async_trait]
impl NamespaceImpl for HttpApi {
    async fn call(
        &self,
        plugin_id: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value, EngineError> {
        let url = args::string(&args, 0, "url")?;
        match method {
            "get" => self.request(plugin_id, Method::GET, &url, None).await,
            "delete" => self.request(plugin_id, Method::DELETE, &url, None).await,
            "post" => {
                self.request(plugin_id, Method::POST, &url, Some(args::value(&args, 1)))
                    .await
            }
            "put" => {
                self.request(plugin_id, Method::PUT, &url, Some(args::value(&args, 1)))
                    .await
            }
            other => Err(EngineError::Execution(format!(
                "Unknown http method: {}",
                other
            ))),
        }
    }
}
