use std::collections::BTreeMap;

use chrono::{Duration, Local};
use serde::Serialize;
use serde_json::Value;

use crate::client::{build_site_url, cookie_headers, key_auth_parts, RawResponse, RelayClient};
use crate::config::{AuthScheme, SiteProfile};
use crate::constants::{
    COOKIE_TIMEOUT_SECONDS, DEFAULT_SUBSCRIPTION_PATH, DEFAULT_USAGE_PATH, QUOTA_UNITS_PER_USD,
    READ_TIMEOUT_SECONDS, USAGE_WINDOW_DAYS,
};

/// Money values round to two decimals at the point of computation and are
/// never re-rounded downstream.
pub fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

/// Fixed NewAPI-lineage ratio: 500000 quota units per dollar.
pub fn quota_to_usd(quota: f64) -> f64 {
    round2(quota / QUOTA_UNITS_PER_USD)
}

/// Inputs for one balance probe chain.
#[derive(Debug, Clone)]
pub struct BalanceRequest {
    pub credential: String,
    pub base_url: String,
    pub subscription_path: String,
    pub usage_path: String,
    pub auth_scheme: AuthScheme,
}

impl BalanceRequest {
    pub fn new(credential: &str, base_url: &str) -> Self {
        Self {
            credential: credential.to_string(),
            base_url: base_url.to_string(),
            subscription_path: DEFAULT_SUBSCRIPTION_PATH.to_string(),
            usage_path: DEFAULT_USAGE_PATH.to_string(),
            auth_scheme: AuthScheme::Bearer,
        }
    }

    pub fn from_profile(profile: &SiteProfile) -> Self {
        let mut req = Self::new(&profile.api_key, &profile.url);
        if !profile.subscription_path.trim().is_empty() {
            req.subscription_path = profile.subscription_path.trim().to_string();
        }
        if !profile.usage_path.trim().is_empty() {
            req.usage_path = profile.usage_path.trim().to_string();
        }
        req.auth_scheme = profile.balance_auth_scheme();
        req
    }
}

/// Merged output of the probe chain. Fields are optional because each
/// recognized response shape populates a different subset; partial data from
/// several probes can coexist in one report.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BalanceReport {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub balance: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hard_limit_usd: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub used_usd: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_usd: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_granted: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_used: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_available: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub today_requests: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub today_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub today_cost: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_requests: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_cost: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Raw decoded body of every call that parsed as JSON, keyed by probe
    /// name. Kept even for probes that did not match; this is how new site
    /// dialects get diagnosed.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub raw_responses: BTreeMap<String, Value>,
}

impl BalanceReport {
    /// True when no probe contributed any business field. `raw_responses`
    /// does not count; an unmatched-but-parseable body is still "no data".
    fn is_empty(&self) -> bool {
        self.balance.is_none()
            && self.unit.is_none()
            && self.email.is_none()
            && self.status.is_none()
            && self.plan_name.is_none()
            && self.hard_limit_usd.is_none()
            && self.used_usd.is_none()
            && self.remaining_usd.is_none()
            && self.remaining.is_none()
            && self.total_granted.is_none()
            && self.total_used.is_none()
            && self.total_available.is_none()
            && self.today_requests.is_none()
            && self.today_tokens.is_none()
            && self.today_cost.is_none()
            && self.total_requests.is_none()
            && self.total_tokens.is_none()
            && self.total_cost.is_none()
            && self.error.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProbeOutcome {
    /// The response matched this probe's shape (including a recognized
    /// server-declared error); the chain stops falling through.
    Matched,
    /// Nothing recognizable; control falls to the next probe.
    NoMatch,
}

/// Run the ordered multi-scheme balance detection chain.
///
/// Probes run strictly sequentially; later probes consult which fields
/// earlier ones populated. Transport errors and unparseable bodies are
/// non-fatal per probe. Only a total absence of data across all probes is
/// reported as an error.
pub async fn probe_balance(client: &RelayClient, req: &BalanceRequest) -> BalanceReport {
    let (headers, params) = key_auth_parts(&req.credential, req.auth_scheme);
    let mut report = BalanceReport::default();

    let mut handled =
        probe_openai_billing(client, req, &headers, &params, &mut report).await == ProbeOutcome::Matched;
    if !handled {
        handled =
            probe_sub2api(client, req, &headers, &params, &mut report).await == ProbeOutcome::Matched;
    }
    if !handled {
        // auth/me may populate balance but never ends the chain; the stats
        // probe below still runs for these sites.
        let _ = probe_auth_me(client, req, &headers, &params, &mut report).await;
    }

    let new_api_usage_path = req.usage_path.contains("/api/v1/");
    if (new_api_usage_path || !handled) && report.today_requests.is_none() {
        let _ = probe_dashboard_stats(client, req, &headers, &params, &mut report).await;
    }

    // The token-quota ledger is additive and runs regardless of earlier
    // success or failure.
    let _ = probe_token_quota(client, req, &headers, &params, &mut report).await;

    if report.is_empty() {
        report.error = Some("无法获取余额信息".to_string());
    }
    report
}

/// Probe 1: OpenAI-compatible billing. Recognizes the New-API
/// `code/data.balance` wrapper and the legacy `hard_limit_usd` shape; the
/// legacy shape triggers a second usage call over a trailing 100-day window.
async fn probe_openai_billing(
    client: &RelayClient,
    req: &BalanceRequest,
    headers: &reqwest::header::HeaderMap,
    params: &[(String, String)],
    report: &mut BalanceReport,
) -> ProbeOutcome {
    let url = build_site_url(&req.base_url, &req.subscription_path);
    let Some(body) = get_json(client, &url, headers, params).await else {
        return ProbeOutcome::NoMatch;
    };
    report.raw_responses.insert("subscription".to_string(), body.clone());

    if body.get("code").and_then(Value::as_i64) == Some(0) {
        let Some(data) = body.get("data") else {
            return ProbeOutcome::NoMatch;
        };
        if data.get("balance").is_none() {
            return ProbeOutcome::NoMatch;
        }
        report.balance = Some(as_f64(data.get("balance")).unwrap_or(0.0));
        report.email = as_display_string(data.get("email"));
        report.status = as_display_string(data.get("status"));
        return ProbeOutcome::Matched;
    }

    if let Some(limit) = as_f64(body.get("hard_limit_usd")) {
        report.hard_limit_usd = Some(limit);

        // Usage fetch is best-effort: the subscription shape alone already
        // counts as a match.
        let end = Local::now();
        let start = end - Duration::days(USAGE_WINDOW_DAYS);
        let mut usage_params = params.to_vec();
        usage_params.push(("start_date".to_string(), start.format("%Y-%m-%d").to_string()));
        usage_params.push(("end_date".to_string(), end.format("%Y-%m-%d").to_string()));
        let usage_url = build_site_url(&req.base_url, &req.usage_path);
        if let Some(usage) = get_json(client, &usage_url, headers, &usage_params).await {
            report.raw_responses.insert("usage".to_string(), usage.clone());
            // total_usage is reported in cents.
            let cents = as_f64(usage.get("total_usage")).unwrap_or(0.0);
            let used = round2(cents / 100.0);
            report.used_usd = Some(used);
            report.remaining_usd = Some(round2(limit - used));
        }
        return ProbeOutcome::Matched;
    }

    ProbeOutcome::NoMatch
}

/// Probe 2: sub2api `/v1/usage`. The body is parsed regardless of HTTP
/// status because error bodies still carry JSON on non-2xx. A recognized
/// error code counts as handled and stops the chain.
async fn probe_sub2api(
    client: &RelayClient,
    req: &BalanceRequest,
    headers: &reqwest::header::HeaderMap,
    params: &[(String, String)],
    report: &mut BalanceReport,
) -> ProbeOutcome {
    let url = build_site_url(&req.base_url, "/v1/usage");
    let resp = match client
        .get(&url, headers.clone(), params, READ_TIMEOUT_SECONDS)
        .await
    {
        Ok(r) => r,
        Err(_) => return ProbeOutcome::NoMatch,
    };
    let Some(body) = resp.json() else {
        // Non-JSON: the HTTP status alone is a non-fatal signal; keep probing.
        return ProbeOutcome::NoMatch;
    };
    report.raw_responses.insert("v1_usage".to_string(), body.clone());

    if body.get("code").is_some() && body.get("message").is_some() {
        let code = as_display_string(body.get("code")).unwrap_or_default();
        let msg = as_display_string(body.get("message")).unwrap_or_default();
        report.error = Some(match code.as_str() {
            "INSUFFICIENT_BALANCE" => format!("余额不足: {msg}"),
            "INVALID_API_KEY" => format!("API Key 无效: {msg}"),
            _ => format!("{code}: {msg}"),
        });
        return ProbeOutcome::Matched;
    }

    if body.get("balance").is_some() || body.get("remaining").is_some() {
        report.balance = Some(
            as_f64(body.get("balance"))
                .or_else(|| as_f64(body.get("remaining")))
                .unwrap_or(0.0),
        );
        report.remaining = Some(as_f64(body.get("remaining")).unwrap_or(0.0));
        report.plan_name = as_display_string(body.get("planName"));
        report.unit = Some(
            body.get("unit")
                .and_then(Value::as_str)
                .unwrap_or("USD")
                .to_string(),
        );

        if let Some(usage) = body.get("usage").filter(|u| u.is_object()) {
            let today = usage.get("today").cloned().unwrap_or(Value::Null);
            let total = usage.get("total").cloned().unwrap_or(Value::Null);
            report.today_requests = Some(as_u64(today.get("requests")).unwrap_or(0));
            report.today_tokens = Some(as_u64(today.get("total_tokens")).unwrap_or(0));
            report.today_cost = Some(as_f64(today.get("cost")).unwrap_or(0.0));
            report.total_requests = Some(as_u64(total.get("requests")).unwrap_or(0));
            report.total_tokens = Some(as_u64(total.get("total_tokens")).unwrap_or(0));
            report.total_cost = Some(as_f64(total.get("cost")).unwrap_or(0.0));
        }
        return ProbeOutcome::Matched;
    }

    ProbeOutcome::NoMatch
}

/// Probe 3: JWT-session profile (`/api/v1/auth/me`).
async fn probe_auth_me(
    client: &RelayClient,
    req: &BalanceRequest,
    headers: &reqwest::header::HeaderMap,
    params: &[(String, String)],
    report: &mut BalanceReport,
) -> ProbeOutcome {
    let url = build_site_url(&req.base_url, "/api/v1/auth/me");
    let Some(body) = get_json(client, &url, headers, params).await else {
        return ProbeOutcome::NoMatch;
    };
    report.raw_responses.insert("auth_me".to_string(), body.clone());

    if body.get("code").and_then(Value::as_i64) == Some(0) {
        if let Some(data) = body.get("data") {
            report.balance = Some(as_f64(data.get("balance")).unwrap_or(0.0));
            report.email = as_display_string(data.get("email"));
            report.status = as_display_string(data.get("status"));
            return ProbeOutcome::Matched;
        }
    }
    ProbeOutcome::NoMatch
}

/// Probe 4: New-API dashboard stats. Merges request/token/cost counters
/// without overwriting fields earlier probes already set.
async fn probe_dashboard_stats(
    client: &RelayClient,
    req: &BalanceRequest,
    headers: &reqwest::header::HeaderMap,
    params: &[(String, String)],
    report: &mut BalanceReport,
) -> ProbeOutcome {
    let stats_path = if req.usage_path.contains("/api/v1/") {
        req.usage_path.as_str()
    } else {
        "/api/v1/usage/dashboard/stats"
    };
    let url = build_site_url(&req.base_url, stats_path);
    let Some(body) = get_json(client, &url, headers, params).await else {
        return ProbeOutcome::NoMatch;
    };
    report.raw_responses.insert("stats".to_string(), body.clone());

    if body.get("code").and_then(Value::as_i64) == Some(0) {
        if let Some(data) = body.get("data") {
            merge_u64(&mut report.total_requests, data.get("total_requests"));
            merge_u64(&mut report.total_tokens, data.get("total_tokens"));
            merge_f64(&mut report.total_cost, data.get("total_cost"));
            merge_u64(&mut report.today_requests, data.get("today_requests"));
            merge_u64(&mut report.today_tokens, data.get("today_tokens"));
            merge_f64(&mut report.today_cost, data.get("today_cost"));
            return ProbeOutcome::Matched;
        }
    }
    ProbeOutcome::NoMatch
}

/// Probe 5: NewAPI token-quota ledger (`/api/usage/token/`).
async fn probe_token_quota(
    client: &RelayClient,
    req: &BalanceRequest,
    headers: &reqwest::header::HeaderMap,
    params: &[(String, String)],
    report: &mut BalanceReport,
) -> ProbeOutcome {
    let url = build_site_url(&req.base_url, "/api/usage/token/");
    let Some(body) = get_json(client, &url, headers, params).await else {
        return ProbeOutcome::NoMatch;
    };
    report.raw_responses.insert("token".to_string(), body.clone());

    if body.get("code").and_then(Value::as_i64) == Some(0) {
        if let Some(data) = body.get("data") {
            report.total_granted = Some(as_f64(data.get("total_granted")).unwrap_or(0.0));
            report.total_used = Some(as_f64(data.get("total_used")).unwrap_or(0.0));
            report.total_available = Some(as_f64(data.get("total_available")).unwrap_or(0.0));
            return ProbeOutcome::Matched;
        }
    }
    ProbeOutcome::NoMatch
}

/// 2xx + parseable JSON, or nothing. Transport errors are swallowed here;
/// each probe treats them as "no signal".
async fn get_json(
    client: &RelayClient,
    url: &str,
    headers: &reqwest::header::HeaderMap,
    params: &[(String, String)],
) -> Option<Value> {
    let resp = client
        .get(url, headers.clone(), params, READ_TIMEOUT_SECONDS)
        .await
        .ok()?;
    if !resp.is_success() {
        return None;
    }
    resp.json()
}

/// Cookie-authenticated balance via `/api/user/self`; `quota` converts at
/// the fixed 500000-per-dollar ratio.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CookieBalance {
    pub success: bool,
    pub balance: f64,
    pub quota: f64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub email: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub display_name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(skip_serializing_if = "Value::is_null")]
    pub raw_data: Value,
}

impl CookieBalance {
    fn failure(message: String) -> Self {
        Self {
            message,
            raw_data: Value::Null,
            ..Self::default()
        }
    }
}

pub async fn query_balance_by_cookie(
    client: &RelayClient,
    base_url: &str,
    session_cookie: &str,
    user_id: &str,
) -> CookieBalance {
    let headers = cookie_headers(base_url, session_cookie, user_id, false);
    let url = build_site_url(base_url, "/api/user/self");
    let resp: RawResponse = match client.get(&url, headers, &[], COOKIE_TIMEOUT_SECONDS).await {
        Ok(r) => r,
        Err(e) => {
            log::debug!("balance_by_cookie {url} exception={e}");
            return CookieBalance::failure(format!("网络错误: {e}"));
        }
    };
    let Some(body) = resp.json() else {
        log::debug!("balance_by_cookie {url} json_error detail={}", resp.describe());
        return CookieBalance::failure(format!("API 返回非 JSON 格式: {}", resp.describe()));
    };

    let success = body.get("success").map(is_truthy).unwrap_or(false);
    if success && body.get("data").is_some() {
        let data = &body["data"];
        let quota = as_f64(data.get("quota")).unwrap_or(0.0);
        return CookieBalance {
            success: true,
            balance: quota_to_usd(quota),
            quota,
            username: as_display_string(data.get("username")).unwrap_or_default(),
            email: as_display_string(data.get("email")).unwrap_or_default(),
            display_name: as_display_string(data.get("display_name")).unwrap_or_default(),
            message: String::new(),
            raw_data: data.clone(),
        };
    }
    CookieBalance::failure(
        as_display_string(body.get("message")).unwrap_or_else(|| "获取用户信息失败".to_string()),
    )
}

pub(crate) fn as_f64(v: Option<&Value>) -> Option<f64> {
    let v = v?;
    v.as_f64()
        .or_else(|| v.as_i64().map(|n| n as f64))
        .or_else(|| v.as_u64().map(|n| n as f64))
        .or_else(|| v.as_str().and_then(|s| s.trim().parse::<f64>().ok()))
}

pub(crate) fn as_u64(v: Option<&Value>) -> Option<u64> {
    let v = v?;
    v.as_u64()
        .or_else(|| v.as_f64().map(|n| n.max(0.0) as u64))
        .or_else(|| v.as_str().and_then(|s| s.trim().parse::<u64>().ok()))
}

/// Strings stay as-is; numbers render as text. Empty strings count as absent.
pub(crate) fn as_display_string(v: Option<&Value>) -> Option<String> {
    let v = v?;
    let s = match v {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        _ => return None,
    };
    if s.is_empty() {
        None
    } else {
        Some(s)
    }
}

/// Python-style truthiness for `success` fields: sites return true, 1, or
/// "true" interchangeably.
pub(crate) fn is_truthy(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty() && s != "false" && s != "0",
        Value::Null => false,
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn merge_f64(slot: &mut Option<f64>, v: Option<&Value>) {
    if slot.is_none() {
        *slot = Some(as_f64(v).unwrap_or(0.0));
    }
}

fn merge_u64(slot: &mut Option<u64>, v: Option<&Value>) {
    if slot.is_none() {
        *slot = Some(as_u64(v).unwrap_or(0));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::routing::get;
    use axum::{Json, Router};
    use serde_json::json;

    async fn serve(app: Router) -> (String, tokio::task::JoinHandle<()>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let url = format!("http://{}:{}", addr.ip(), addr.port());
        let h = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        (url, h)
    }

    fn not_found() -> (StatusCode, Json<Value>) {
        (StatusCode::NOT_FOUND, Json(json!({})))
    }

    #[test]
    fn quota_conversion_round_trip() {
        assert_eq!(quota_to_usd(500_000.0), 1.00);
        assert_eq!(quota_to_usd(0.0), 0.0);
        assert_eq!(quota_to_usd(1_250_000.0), 2.50);
    }

    #[tokio::test]
    async fn legacy_openai_shape_computes_remaining() {
        let app = Router::new()
            .route(
                "/v1/dashboard/billing/subscription",
                get(|| async { Json(json!({"hard_limit_usd": 100.0})) }),
            )
            .route(
                "/v1/dashboard/billing/usage",
                get(|| async { Json(json!({"total_usage": 2550})) }),
            )
            .fallback(|| async { not_found() });
        let (base, _h) = serve(app).await;

        let req = BalanceRequest::new("sk-test", &base);
        let report = probe_balance(&RelayClient::new(), &req).await;

        assert_eq!(report.hard_limit_usd, Some(100.0));
        assert_eq!(report.used_usd, Some(25.50));
        assert_eq!(report.remaining_usd, Some(74.50));
        assert!(report.error.is_none());
        assert!(report.raw_responses.contains_key("subscription"));
        assert!(report.raw_responses.contains_key("usage"));
    }

    #[tokio::test]
    async fn openai_probe_wins_over_sub2api() {
        // Both probe 1 and probe 2 shapes are satisfiable; probe 1 must win
        // and probe 2 must not run at all.
        let app = Router::new()
            .route(
                "/v1/dashboard/billing/subscription",
                get(|| async { Json(json!({"hard_limit_usd": 50.0})) }),
            )
            .route(
                "/v1/dashboard/billing/usage",
                get(|| async { Json(json!({"total_usage": 0})) }),
            )
            .route(
                "/v1/usage",
                get(|| async { Json(json!({"balance": 9.99, "unit": "CNY"})) }),
            )
            .fallback(|| async { not_found() });
        let (base, _h) = serve(app).await;

        let req = BalanceRequest::new("sk-test", &base);
        let report = probe_balance(&RelayClient::new(), &req).await;

        assert_eq!(report.hard_limit_usd, Some(50.0));
        assert!(report.balance.is_none());
        assert!(report.unit.is_none());
        assert!(!report.raw_responses.contains_key("v1_usage"));
    }

    #[tokio::test]
    async fn probe_is_idempotent() {
        let app = Router::new()
            .route(
                "/v1/usage",
                get(|| async {
                    Json(json!({
                        "balance": 12.5,
                        "remaining": 12.5,
                        "planName": "pro",
                        "usage": {
                            "today": {"requests": 3, "total_tokens": 900, "cost": 0.12},
                            "total": {"requests": 40, "total_tokens": 81000, "cost": 4.05}
                        }
                    }))
                }),
            )
            .fallback(|| async { not_found() });
        let (base, _h) = serve(app).await;

        let client = RelayClient::new();
        let req = BalanceRequest::new("sk-test", &base);
        let first = probe_balance(&client, &req).await;
        let second = probe_balance(&client, &req).await;
        assert_eq!(first, second);
        assert_eq!(first.balance, Some(12.5));
        assert_eq!(first.plan_name.as_deref(), Some("pro"));
        assert_eq!(first.today_requests, Some(3));
        assert_eq!(first.total_cost, Some(4.05));
    }

    #[tokio::test]
    async fn sub2api_error_code_terminates_chain() {
        let app = Router::new()
            .route(
                "/v1/usage",
                get(|| async {
                    (
                        StatusCode::FORBIDDEN,
                        Json(json!({"code": "INSUFFICIENT_BALANCE", "message": "quota exhausted"})),
                    )
                }),
            )
            .route(
                "/api/v1/auth/me",
                get(|| async { Json(json!({"code": 0, "data": {"balance": 3.0}})) }),
            )
            .fallback(|| async { not_found() });
        let (base, _h) = serve(app).await;

        let req = BalanceRequest::new("sk-test", &base);
        let report = probe_balance(&RelayClient::new(), &req).await;

        assert_eq!(report.error.as_deref(), Some("余额不足: quota exhausted"));
        // The chain stopped before auth/me.
        assert!(report.balance.is_none());
        assert!(!report.raw_responses.contains_key("auth_me"));
    }

    #[tokio::test]
    async fn auth_me_does_not_stop_stats_probe() {
        let app = Router::new()
            .route(
                "/api/v1/auth/me",
                get(|| async {
                    Json(json!({"code": 0, "data": {"balance": 6.5, "email": "a@b.c", "status": 1}}))
                }),
            )
            .route(
                "/api/v1/usage/dashboard/stats",
                get(|| async {
                    Json(json!({"code": 0, "data": {
                        "total_requests": 100, "total_tokens": 5000, "total_cost": 1.5,
                        "today_requests": 10, "today_tokens": 400, "today_cost": 0.2
                    }}))
                }),
            )
            .fallback(|| async { not_found() });
        let (base, _h) = serve(app).await;

        let req = BalanceRequest::new("jwt-token", &base);
        let report = probe_balance(&RelayClient::new(), &req).await;

        assert_eq!(report.balance, Some(6.5));
        assert_eq!(report.email.as_deref(), Some("a@b.c"));
        assert_eq!(report.status.as_deref(), Some("1"));
        assert_eq!(report.today_requests, Some(10));
        assert_eq!(report.total_cost, Some(1.5));
    }

    #[tokio::test]
    async fn configured_new_api_usage_path_is_used_for_stats() {
        let app = Router::new()
            .route(
                "/api/v1/custom/stats",
                get(|| async {
                    Json(json!({"code": 0, "data": {"today_requests": 7, "today_cost": 0.7}}))
                }),
            )
            .fallback(|| async { not_found() });
        let (base, _h) = serve(app).await;

        let mut req = BalanceRequest::new("sk-test", &base);
        req.usage_path = "/api/v1/custom/stats".to_string();
        let report = probe_balance(&RelayClient::new(), &req).await;

        assert_eq!(report.today_requests, Some(7));
        assert_eq!(report.today_cost, Some(0.7));
    }

    #[tokio::test]
    async fn token_quota_probe_runs_even_after_success() {
        let app = Router::new()
            .route(
                "/v1/dashboard/billing/subscription",
                get(|| async { Json(json!({"hard_limit_usd": 10.0})) }),
            )
            .route(
                "/v1/dashboard/billing/usage",
                get(|| async { Json(json!({"total_usage": 100})) }),
            )
            .route(
                "/api/usage/token/",
                get(|| async {
                    Json(json!({"code": 0, "data": {
                        "total_granted": 1000000, "total_used": 250000, "total_available": 750000
                    }}))
                }),
            )
            .fallback(|| async { not_found() });
        let (base, _h) = serve(app).await;

        let req = BalanceRequest::new("sk-test", &base);
        let report = probe_balance(&RelayClient::new(), &req).await;

        assert_eq!(report.hard_limit_usd, Some(10.0));
        assert_eq!(report.total_granted, Some(1_000_000.0));
        assert_eq!(report.total_available, Some(750_000.0));
    }

    #[tokio::test]
    async fn all_probes_missing_yields_terminal_error_only() {
        let app = Router::new().fallback(|| async { not_found() });
        let (base, _h) = serve(app).await;

        let req = BalanceRequest::new("sk-test", &base);
        let report = probe_balance(&RelayClient::new(), &req).await;

        assert_eq!(report.error.as_deref(), Some("无法获取余额信息"));
        let mut expected = BalanceReport::default();
        expected.error = report.error.clone();
        expected.raw_responses = report.raw_responses.clone();
        assert_eq!(report, expected);
    }

    #[tokio::test]
    async fn url_key_auth_sends_key_param() {
        use axum::extract::Query;
        use axum::response::IntoResponse;
        use std::collections::HashMap;

        let app = Router::new()
            .route(
                "/v1/usage",
                get(|Query(q): Query<HashMap<String, String>>| async move {
                    if q.get("key").map(String::as_str) == Some("sk-url") {
                        Json(json!({"balance": 1.0})).into_response()
                    } else {
                        (StatusCode::UNAUTHORIZED, Json(json!({}))).into_response()
                    }
                }),
            )
            .fallback(|| async { not_found() });
        let (base, _h) = serve(app).await;

        let mut req = BalanceRequest::new("sk-url", &base);
        req.auth_scheme = AuthScheme::UrlKey;
        let report = probe_balance(&RelayClient::new(), &req).await;
        assert_eq!(report.balance, Some(1.0));
    }

    #[tokio::test]
    async fn cookie_balance_converts_quota() {
        let app = Router::new()
            .route(
                "/api/user/self",
                get(|| async {
                    Json(json!({"success": true, "data": {
                        "quota": 2_500_000, "username": "konata", "email": "k@example.com"
                    }}))
                }),
            )
            .fallback(|| async { not_found() });
        let (base, _h) = serve(app).await;

        let out = query_balance_by_cookie(&RelayClient::new(), &base, "session=abc", "").await;
        assert!(out.success);
        assert_eq!(out.balance, 5.00);
        assert_eq!(out.quota, 2_500_000.0);
        assert_eq!(out.username, "konata");
    }

    #[tokio::test]
    async fn cookie_balance_reports_server_message() {
        let app = Router::new()
            .route(
                "/api/user/self",
                get(|| async { Json(json!({"success": false, "message": "未登录或登录已过期"})) }),
            )
            .fallback(|| async { not_found() });
        let (base, _h) = serve(app).await;

        let out = query_balance_by_cookie(&RelayClient::new(), &base, "session=bad", "").await;
        assert!(!out.success);
        assert_eq!(out.message, "未登录或登录已过期");
    }
}
