use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::Serialize;
use serde_json::Value;

use crate::balance::{as_f64, as_u64, quota_to_usd};
use crate::client::{build_site_url, RelayClient};
use crate::config::{AuthScheme, SiteProfile};
use crate::constants::{DEFAULT_LOG_PATH, READ_TIMEOUT_SECONDS};

/// One normalized API-call log line. Relay dialects disagree on field sets,
/// so extraction is tolerant and missing values default to zero/empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LogEntry {
    /// Unix seconds; 0 means the site did not report a time.
    pub created_at: i64,
    pub model_name: String,
    pub token_name: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    /// Cost in the relay's internal quota unit (500000 ≈ $1).
    pub quota: f64,
}

impl LogEntry {
    pub fn from_value(v: &Value) -> Self {
        Self {
            created_at: v.get("created_at").and_then(Value::as_i64).unwrap_or(0),
            model_name: v
                .get("model_name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            token_name: v
                .get("token_name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            prompt_tokens: as_u64(v.get("prompt_tokens")).unwrap_or(0),
            completion_tokens: as_u64(v.get("completion_tokens")).unwrap_or(0),
            quota: as_f64(v.get("quota")).unwrap_or(0.0),
        }
    }

    pub fn cost_usd(&self) -> f64 {
        quota_to_usd(self.quota)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LogPage {
    pub total: usize,
    pub items: Vec<LogEntry>,
    /// Last raw payload, cached for the raw-response viewer.
    pub raw_response: Value,
}

#[derive(Debug, Clone)]
pub struct LogRequest {
    pub credential: String,
    pub base_url: String,
    pub page: u32,
    pub page_size: u32,
    pub order: String,
    pub log_path: String,
    pub proxy_url: String,
    pub auth_scheme: AuthScheme,
}

impl LogRequest {
    pub fn new(credential: &str, base_url: &str) -> Self {
        Self {
            credential: credential.to_string(),
            base_url: base_url.to_string(),
            page: 1,
            page_size: 50,
            order: "desc".to_string(),
            log_path: String::new(),
            proxy_url: String::new(),
            auth_scheme: AuthScheme::Bearer,
        }
    }

    pub fn from_profile(profile: &SiteProfile) -> Self {
        let mut req = Self::new(&profile.api_key, &profile.url);
        req.log_path = profile.log_path.trim().to_string();
        req.proxy_url = profile.proxy_url.trim().to_string();
        req.auth_scheme = profile.log_auth_scheme();
        req
    }

    fn effective_path(&self) -> &str {
        let p = self.log_path.trim();
        if p.is_empty() {
            DEFAULT_LOG_PATH
        } else {
            p
        }
    }
}

/// Fetch one page of call logs.
///
/// Pagination params are `p`/`per_page`/`order`; `url_key` auth adds the
/// credential as a `key` query parameter. When a proxy is configured the
/// fully-assembled target URL is percent-encoded into the proxy's `url=`
/// parameter instead of being called directly (some sites block their log
/// API for non-browser clients).
pub async fn fetch_logs(client: &RelayClient, req: &LogRequest) -> Result<LogPage, String> {
    let mut headers = HeaderMap::new();
    if let Ok(hv) = HeaderValue::from_str(&format!("Bearer {}", req.credential)) {
        headers.insert(AUTHORIZATION, hv);
    }
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

    let mut params: Vec<(String, String)> = Vec::new();
    if req.auth_scheme == AuthScheme::UrlKey {
        params.push(("key".to_string(), req.credential.clone()));
    }
    params.push(("p".to_string(), req.page.to_string()));
    params.push(("per_page".to_string(), req.page_size.to_string()));
    params.push(("order".to_string(), req.order.clone()));

    let direct_url = build_site_url(&req.base_url, req.effective_path());
    let (request_url, query): (String, Vec<(String, String)>) = if req.proxy_url.is_empty() {
        (direct_url, params)
    } else {
        let qs = params
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&");
        let target = format!("{direct_url}?{qs}");
        let proxied = format!(
            "{}?url={}",
            req.proxy_url.trim_end_matches('/'),
            urlencoding::encode(&target)
        );
        (proxied, Vec::new())
    };

    let resp = match client
        .get(&request_url, headers, &query, READ_TIMEOUT_SECONDS)
        .await
    {
        Ok(r) => r,
        Err(e) => {
            log::debug!("fetch_logs {request_url} exception={e}");
            return Err(e.to_string());
        }
    };

    // An empty 200 body usually means a wrong path, which deserves a
    // different hint than a malformed one.
    if resp.body.trim().is_empty() {
        return Err("API 返回空响应，请检查接口路径是否正确".to_string());
    }
    let Some(body) = resp.json() else {
        log::debug!(
            "fetch_logs {request_url} json_error detail={}",
            resp.describe()
        );
        return Err(format!("API 返回非 JSON 格式: {}", resp.describe()));
    };
    if resp.status != 200 {
        log::debug!(
            "fetch_logs {request_url} status={} detail={}",
            resp.status,
            resp.describe()
        );
        return Err(format!("HTTP {}: {}", resp.status, resp.describe()));
    }

    let mut items: Vec<LogEntry> = body
        .get("data")
        .and_then(Value::as_array)
        .map(|arr| arr.iter().map(LogEntry::from_value).collect())
        .unwrap_or_default();

    // Relay sites cannot be trusted to honor the order parameter; always
    // re-sort newest-first here. Missing timestamps (0) end up last.
    sort_logs_desc(&mut items);

    Ok(LogPage {
        total: items.len(),
        items,
        raw_response: body,
    })
}

pub fn sort_logs_desc(items: &mut [LogEntry]) {
    items.sort_by(|a, b| b.created_at.cmp(&a.created_at));
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Query;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;
    use std::collections::HashMap;

    async fn serve(app: Router) -> (String, tokio::task::JoinHandle<()>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let url = format!("http://{}:{}", addr.ip(), addr.port());
        let h = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        (url, h)
    }

    fn entry(ts: i64) -> LogEntry {
        LogEntry {
            created_at: ts,
            ..LogEntry::default()
        }
    }

    #[test]
    fn ordering_invariant_puts_missing_timestamps_last() {
        let mut items = vec![entry(100), entry(0), entry(300)];
        sort_logs_desc(&mut items);
        let order: Vec<i64> = items.iter().map(|e| e.created_at).collect();
        assert_eq!(order, vec![300, 100, 0]);
    }

    #[test]
    fn entry_extraction_tolerates_sparse_rows() {
        let v = json!({"model_name": "gpt-4o", "quota": "1500"});
        let e = LogEntry::from_value(&v);
        assert_eq!(e.created_at, 0);
        assert_eq!(e.model_name, "gpt-4o");
        assert_eq!(e.quota, 1500.0);
        assert_eq!(e.prompt_tokens, 0);
    }

    #[test]
    fn entry_cost_uses_fixed_quota_ratio() {
        let e = LogEntry {
            quota: 500_000.0,
            ..LogEntry::default()
        };
        assert_eq!(e.cost_usd(), 1.00);
    }

    #[tokio::test]
    async fn fetch_resorts_server_output() {
        let app = Router::new().route(
            "/api/log/token",
            get(|| async {
                Json(json!({"data": [
                    {"created_at": 100, "model_name": "a"},
                    {"model_name": "b"},
                    {"created_at": 300, "model_name": "c"}
                ]}))
            }),
        );
        let (base, _h) = serve(app).await;

        let req = LogRequest::new("sk-test", &base);
        let page = fetch_logs(&RelayClient::new(), &req).await.unwrap();
        assert_eq!(page.total, 3);
        let order: Vec<i64> = page.items.iter().map(|e| e.created_at).collect();
        assert_eq!(order, vec![300, 100, 0]);
        assert!(page.raw_response.get("data").is_some());
    }

    #[tokio::test]
    async fn empty_body_gets_path_hint() {
        let app = Router::new().route("/api/log/token", get(|| async { "" }));
        let (base, _h) = serve(app).await;

        let req = LogRequest::new("sk-test", &base);
        let err = fetch_logs(&RelayClient::new(), &req).await.unwrap_err();
        assert_eq!(err, "API 返回空响应，请检查接口路径是否正确");
    }

    #[tokio::test]
    async fn html_error_page_is_classified() {
        let app = Router::new().route(
            "/api/log/token",
            get(|| async {
                (
                    StatusCode::FORBIDDEN,
                    [(axum::http::header::CONTENT_TYPE, "text/html")],
                    "<!DOCTYPE html><h1>blocked</h1>",
                )
            }),
        );
        let (base, _h) = serve(app).await;

        let req = LogRequest::new("sk-test", &base);
        let err = fetch_logs(&RelayClient::new(), &req).await.unwrap_err();
        assert!(err.contains("WAF"), "got: {err}");
    }

    #[tokio::test]
    async fn proxy_wraps_full_target_url() {
        let app = Router::new().route(
            "/proxy",
            get(|Query(q): Query<HashMap<String, String>>| async move {
                let target = q.get("url").cloned().unwrap_or_default();
                assert!(target.contains("/api/log/token"));
                assert!(target.contains("key=sk-proxied"));
                assert!(target.contains("per_page=25"));
                Json(json!({"data": [{"created_at": 1}]}))
            }),
        );
        let (base, _h) = serve(app).await;

        let mut req = LogRequest::new("sk-proxied", "https://blocked.example.com");
        req.auth_scheme = AuthScheme::UrlKey;
        req.page_size = 25;
        req.proxy_url = format!("{base}/proxy");
        let page = fetch_logs(&RelayClient::new(), &req).await.unwrap();
        assert_eq!(page.total, 1);
    }
}
