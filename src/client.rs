use std::time::Duration;

use reqwest::header::{
    HeaderMap, HeaderName, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, AUTHORIZATION, CONTENT_TYPE,
    COOKIE, ORIGIN, REFERER, USER_AGENT,
};
use serde_json::Value;

use crate::config::AuthScheme;
use crate::constants::{DEFAULT_BROWSER_USER_AGENT, READ_TIMEOUT_SECONDS};

/// Body markers that identify a Cloudflare/CDN error page. Checked lowercase.
const CLOUDFLARE_MARKERS: &[&str] = &[
    "cloudflare",
    "cf-ray",
    "cf-error",
    "error code 502",
    "error code 503",
    "error code 504",
];

/// A fully-read HTTP response. Relay sites return opaque HTML and empty
/// bodies often enough that callers need the raw text and content type, not
/// just a decoded JSON value.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub content_type: String,
    pub body: String,
}

impl RawResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn json(&self) -> Option<Value> {
        serde_json::from_str(self.body.trim()).ok()
    }

    pub fn is_html(&self) -> bool {
        self.content_type.to_ascii_lowercase().contains("text/html")
            || looks_like_html_document(&self.body)
    }

    pub fn describe(&self) -> String {
        describe_http_response(self.status, &self.body, &self.content_type)
    }
}

pub fn looks_like_html_document(body: &str) -> bool {
    let t = body.trim_start();
    let lower = t.get(..16).unwrap_or(t).to_ascii_lowercase();
    lower.starts_with("<!doctype") || lower.starts_with("<html")
}

/// Turn an opaque non-JSON response into a short actionable diagnostic.
///
/// Relay sites frequently interpose CDN/WAF layers that answer with HTML
/// error or challenge pages; the user needs "Cloudflare outage" or "WAF
/// block" rather than a raw body dump.
pub fn describe_http_response(status: u16, body: &str, content_type: &str) -> String {
    let content = body.trim();
    let lower = content.to_lowercase();
    let ct = content_type.to_ascii_lowercase();

    let is_cf = CLOUDFLARE_MARKERS.iter().any(|m| lower.contains(m));
    let is_html = ct.contains("text/html") || lower.starts_with("<!doctype html");

    if status >= 500 && (is_cf || is_html) {
        return "Cloudflare/源站 5xx 错误：上游异常或暂时不可用".to_string();
    }
    if is_html {
        return "返回 HTML 页面，可能被 WAF 拦截或登录态失效".to_string();
    }
    if !content.is_empty() {
        let preview: String = content.chars().take(200).collect();
        if content.chars().count() > 200 {
            return format!("{preview}...");
        }
        return preview;
    }
    "空响应或未知错误".to_string()
}

pub fn build_site_url(base_url: &str, path: &str) -> String {
    let base = base_url.trim().trim_end_matches('/');
    let rel = path.trim_start_matches('/');
    format!("{base}/{rel}")
}

/// Credential placement for key-authenticated endpoints: either an
/// `Authorization: Bearer` header or a `key` query parameter.
pub fn key_auth_parts(credential: &str, scheme: AuthScheme) -> (HeaderMap, Vec<(String, String)>) {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    let mut params = Vec::new();
    match scheme {
        AuthScheme::UrlKey => {
            params.push(("key".to_string(), credential.to_string()));
        }
        AuthScheme::Bearer => {
            if let Ok(hv) = HeaderValue::from_str(&format!("Bearer {credential}")) {
                headers.insert(AUTHORIZATION, hv);
            }
        }
    }
    (headers, params)
}

/// Browser-impersonation header set for cookie-authenticated endpoints.
pub fn cookie_headers(
    base_url: &str,
    session_cookie: &str,
    user_id: &str,
    include_content_type: bool,
) -> HeaderMap {
    let base = base_url.trim().trim_end_matches('/');
    let mut headers = HeaderMap::new();
    headers.insert(
        ACCEPT,
        HeaderValue::from_static("application/json, text/plain, */*"),
    );
    headers.insert(
        ACCEPT_LANGUAGE,
        HeaderValue::from_static("zh-CN,zh;q=0.9,en;q=0.8"),
    );
    headers.insert(
        USER_AGENT,
        HeaderValue::from_static(DEFAULT_BROWSER_USER_AGENT),
    );
    if let Ok(hv) = HeaderValue::from_str(&format!("{base}/console")) {
        headers.insert(REFERER, hv);
    }
    if let Ok(hv) = HeaderValue::from_str(base) {
        headers.insert(ORIGIN, hv);
    }
    if let Ok(hv) = HeaderValue::from_str(session_cookie) {
        headers.insert(COOKIE, hv);
    }
    if include_content_type {
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    }
    if !user_id.is_empty() {
        if let Ok(hv) = HeaderValue::from_str(user_id) {
            headers.insert(HeaderName::from_static("new-api-user"), hv);
        }
    }
    headers
}

#[derive(Clone)]
pub struct RelayClient {
    client: reqwest::Client,
}

impl Default for RelayClient {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayClient {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .user_agent("relaydesk/0.4")
            // Avoid hanging forever on broken relay TCP handshakes.
            .connect_timeout(Duration::from_secs(10))
            .build()
            .expect("reqwest client");
        Self { client }
    }

    pub async fn get(
        &self,
        url: &str,
        headers: HeaderMap,
        params: &[(String, String)],
        timeout_seconds: u64,
    ) -> Result<RawResponse, reqwest::Error> {
        let mut req = self
            .client
            .get(url)
            .headers(headers)
            .timeout(Duration::from_secs(timeout_seconds));
        if !params.is_empty() {
            req = req.query(params);
        }
        let resp = req.send().await?;
        read_response(resp).await
    }

    pub async fn post(
        &self,
        url: &str,
        headers: HeaderMap,
        timeout_seconds: u64,
    ) -> Result<RawResponse, reqwest::Error> {
        let resp = self
            .client
            .post(url)
            .headers(headers)
            .timeout(Duration::from_secs(timeout_seconds))
            .send()
            .await?;
        read_response(resp).await
    }
}

async fn read_response(resp: reqwest::Response) -> Result<RawResponse, reqwest::Error> {
    let status = resp.status().as_u16();
    let content_type = resp
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let body = resp.text().await?;
    Ok(RawResponse {
        status,
        content_type,
        body,
    })
}

/// Connectivity probe: list the site's models. Diagnostics only, the result
/// is never persisted.
pub async fn list_models(
    client: &RelayClient,
    base_url: &str,
    credential: &str,
    scheme: AuthScheme,
) -> Result<Vec<String>, String> {
    let (headers, params) = key_auth_parts(credential, scheme);
    let url = build_site_url(base_url, "/v1/models");
    let resp = client
        .get(&url, headers, &params, READ_TIMEOUT_SECONDS)
        .await
        .map_err(|e| format!("网络错误: {e}"))?;
    if !resp.is_success() {
        return Err(format!("HTTP {}: {}", resp.status, resp.describe()));
    }
    let Some(body) = resp.json() else {
        return Err(format!("API 返回非 JSON 格式: {}", resp.describe()));
    };
    let ids = body
        .get("data")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|m| m.get("id").and_then(Value::as_str))
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    Ok(ids)
}
