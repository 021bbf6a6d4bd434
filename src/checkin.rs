use std::collections::BTreeMap;

use chrono::Local;
use reqwest::header::{HeaderName, HeaderValue};
use serde::Serialize;
use serde_json::Value;

use crate::balance::{as_display_string, as_f64, is_truthy};
use crate::client::{build_site_url, cookie_headers, RelayClient};
use crate::config::SiteProfile;
use crate::constants::{COOKIE_TIMEOUT_SECONDS, DEFAULT_CHECKIN_PATH};

/// Free-text markers meaning "already checked in today". Relay sites report
/// this as a failure even though the check-in already succeeded, so a match
/// reclassifies the response. English markers match case-insensitively.
/// Known to be fragile against wording changes; kept as a data table so new
/// site quirks land here instead of in control flow.
pub const ALREADY_CHECKED_MARKERS: &[&str] = &[
    "已签到",
    "已经签到",
    "今日已签到",
    "already checked",
    "already check",
    "checked in today",
    "already signed",
];

pub fn is_already_checked_message(message: &str) -> bool {
    let normalized = message.to_lowercase();
    ALREADY_CHECKED_MARKERS
        .iter()
        .any(|m| message.contains(m) || normalized.contains(m))
}

#[derive(Debug, Clone)]
pub struct CheckinRequest {
    pub base_url: String,
    pub session_cookie: String,
    pub user_id: String,
    pub checkin_path: String,
    pub extra_headers: BTreeMap<String, String>,
}

impl CheckinRequest {
    pub fn new(base_url: &str, session_cookie: &str) -> Self {
        Self {
            base_url: base_url.to_string(),
            session_cookie: session_cookie.to_string(),
            user_id: String::new(),
            checkin_path: String::new(),
            extra_headers: BTreeMap::new(),
        }
    }

    pub fn from_profile(profile: &SiteProfile) -> Self {
        let mut req = Self::new(&profile.url, &profile.session_cookie);
        req.user_id = profile.checkin_user_id.clone();
        req.checkin_path = profile.checkin_path.clone();
        req.extra_headers = profile.checkin_headers.clone();
        req
    }

    fn effective_path(&self) -> String {
        let p = self.checkin_path.trim();
        if p.is_empty() {
            return DEFAULT_CHECKIN_PATH.to_string();
        }
        if p.starts_with('/') {
            p.to_string()
        } else {
            format!("/{p}")
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CheckinOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub already_checked_in: bool,
    pub message: String,
    /// Still in relay quota units here; callers convert to USD when logging.
    pub quota_awarded: f64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub checkin_date: String,
}

impl CheckinOutcome {
    fn failure(message: String) -> Self {
        Self {
            message,
            ..Self::default()
        }
    }
}

/// Perform the cookie-authenticated daily check-in.
///
/// A "failure" response whose message says the check-in already happened is
/// reclassified as success with `already_checked_in` set; surfacing it as an
/// error would be wrong for the caller.
pub async fn do_checkin(client: &RelayClient, req: &CheckinRequest) -> CheckinOutcome {
    let mut headers = cookie_headers(&req.base_url, &req.session_cookie, &req.user_id, true);
    // Caller-supplied headers merge last so they can override the defaults.
    for (k, v) in &req.extra_headers {
        let Ok(name) = HeaderName::from_bytes(k.as_bytes()) else {
            continue;
        };
        let Ok(value) = HeaderValue::from_str(v) else {
            continue;
        };
        headers.insert(name, value);
    }

    let path = req.effective_path();
    let url = build_site_url(&req.base_url, &path);
    let resp = match client.post(&url, headers, COOKIE_TIMEOUT_SECONDS).await {
        Ok(r) => r,
        Err(e) => {
            // Timeout usually means an overloaded relay; connect failure
            // means DNS or outage. The user-facing hint differs.
            let message = if e.is_timeout() {
                "请求超时，请检查网络".to_string()
            } else if e.is_connect() {
                "连接失败，请检查网络或站点是否可访问".to_string()
            } else {
                format!("网络错误: {e}")
            };
            log::debug!("checkin {url} exception={e}");
            return CheckinOutcome::failure(message);
        }
    };

    if resp.is_html() {
        log::debug!("checkin {url} status={} detail={}", resp.status, resp.describe());
        return CheckinOutcome::failure(resp.describe());
    }
    if resp.body.trim().is_empty() {
        return CheckinOutcome::failure("API 返回空响应，请检查 Cookie 是否有效".to_string());
    }
    let Some(body) = resp.json() else {
        log::debug!("checkin {url} json_error detail={}", resp.describe());
        return CheckinOutcome::failure(format!("API 返回非 JSON: {}", resp.describe()));
    };

    let message = as_display_string(body.get("message"))
        .unwrap_or_default()
        .trim()
        .to_string();
    let checkin_date = body
        .pointer("/data/checkin_date")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    if body.get("success").map(is_truthy).unwrap_or(false) {
        return CheckinOutcome {
            success: true,
            already_checked_in: false,
            message: if message.is_empty() {
                "签到成功".to_string()
            } else {
                message
            },
            quota_awarded: as_f64(body.pointer("/data/quota_awarded")).unwrap_or(0.0),
            checkin_date,
        };
    }

    if is_already_checked_message(&message) {
        return CheckinOutcome {
            success: true,
            already_checked_in: true,
            message: if message.is_empty() {
                "今日已签到".to_string()
            } else {
                message
            },
            quota_awarded: 0.0,
            checkin_date,
        };
    }

    CheckinOutcome::failure(if message.is_empty() {
        "签到失败".to_string()
    } else {
        message
    })
}

/// Check-in calendar/status for one month (`YYYY-MM`, default current).
pub async fn get_checkin_status(
    client: &RelayClient,
    base_url: &str,
    session_cookie: &str,
    month: Option<&str>,
) -> Result<Value, String> {
    let month = match month {
        Some(m) => m.to_string(),
        None => Local::now().format("%Y-%m").to_string(),
    };
    let headers = cookie_headers(base_url, session_cookie, "", false);
    let url = build_site_url(base_url, DEFAULT_CHECKIN_PATH);
    let params = vec![("month".to_string(), month)];
    let resp = client
        .get(&url, headers, &params, COOKIE_TIMEOUT_SECONDS)
        .await
        .map_err(|e| format!("网络错误: {e}"))?;
    let Some(body) = resp.json() else {
        return Err("API 返回非 JSON 格式".to_string());
    };
    if body.get("success").map(is_truthy).unwrap_or(false) {
        return Ok(body.get("data").cloned().unwrap_or_else(|| Value::Object(Default::default())));
    }
    Err(as_display_string(body.get("message")).unwrap_or_else(|| "获取签到状态失败".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::post;
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

    #[test]
    fn marker_table_matches_known_phrasings() {
        assert!(is_already_checked_message("今日已签到，明天再来"));
        assert!(is_already_checked_message("Already Checked In"));
        assert!(is_already_checked_message("you have already signed today"));
        assert!(!is_already_checked_message("签到失败"));
    }

    #[tokio::test]
    async fn successful_checkin_extracts_award() {
        let app = Router::new().route(
            "/api/user/checkin",
            post(|| async {
                Json(json!({"success": true, "message": "签到成功",
                    "data": {"quota_awarded": 250000, "checkin_date": "2026-08-27"}}))
            }),
        );
        let (base, _h) = serve(app).await;

        let req = CheckinRequest::new(&base, "session=abc");
        let out = do_checkin(&RelayClient::new(), &req).await;
        assert!(out.success);
        assert!(!out.already_checked_in);
        assert_eq!(out.quota_awarded, 250_000.0);
        assert_eq!(out.checkin_date, "2026-08-27");
    }

    #[tokio::test]
    async fn already_checked_failure_is_reclassified() {
        let app = Router::new().route(
            "/api/user/checkin",
            post(|| async { Json(json!({"success": false, "message": "今日已签到"})) }),
        );
        let (base, _h) = serve(app).await;

        let req = CheckinRequest::new(&base, "session=abc");
        let out = do_checkin(&RelayClient::new(), &req).await;
        assert!(out.success);
        assert!(out.already_checked_in);
        assert_eq!(out.quota_awarded, 0.0);
        assert_eq!(out.message, "今日已签到");
    }

    #[tokio::test]
    async fn html_interception_never_reaches_json_parsing() {
        let app = Router::new().route(
            "/api/user/checkin",
            post(|| async {
                (
                    [(axum::http::header::CONTENT_TYPE, "text/html")],
                    "<!DOCTYPE html><title>Just a moment...</title>",
                )
            }),
        );
        let (base, _h) = serve(app).await;

        let req = CheckinRequest::new(&base, "session=abc");
        let out = do_checkin(&RelayClient::new(), &req).await;
        assert!(!out.success);
        assert_eq!(out.message, "返回 HTML 页面，可能被 WAF 拦截或登录态失效");
    }

    #[tokio::test]
    async fn empty_body_blames_cookie() {
        let app = Router::new().route("/api/user/checkin", post(|| async { "" }));
        let (base, _h) = serve(app).await;

        let req = CheckinRequest::new(&base, "session=abc");
        let out = do_checkin(&RelayClient::new(), &req).await;
        assert!(!out.success);
        assert_eq!(out.message, "API 返回空响应，请检查 Cookie 是否有效");
    }

    #[tokio::test]
    async fn genuine_failure_keeps_server_message() {
        let app = Router::new().route(
            "/api/user/checkin",
            post(|| async { Json(json!({"success": false, "message": "签到功能未开启"})) }),
        );
        let (base, _h) = serve(app).await;

        let req = CheckinRequest::new(&base, "session=abc");
        let out = do_checkin(&RelayClient::new(), &req).await;
        assert!(!out.success);
        assert_eq!(out.message, "签到功能未开启");
    }

    #[tokio::test]
    async fn connection_refused_gets_network_hint() {
        // Bind then drop the listener so the port is closed.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let req = CheckinRequest::new(&format!("http://{addr}"), "session=abc");
        let out = do_checkin(&RelayClient::new(), &req).await;
        assert!(!out.success);
        assert_eq!(out.message, "连接失败，请检查网络或站点是否可访问");
    }

    #[tokio::test]
    async fn custom_path_is_normalized() {
        let app = Router::new().route(
            "/custom/checkin",
            post(|| async { Json(json!({"success": true})) }),
        );
        let (base, _h) = serve(app).await;

        let mut req = CheckinRequest::new(&base, "session=abc");
        req.checkin_path = "custom/checkin".to_string();
        let out = do_checkin(&RelayClient::new(), &req).await;
        assert!(out.success);
        assert_eq!(out.message, "签到成功");
    }

    #[tokio::test]
    async fn extra_headers_override_defaults() {
        use axum::http::HeaderMap;

        let app = Router::new().route(
            "/api/user/checkin",
            post(|headers: HeaderMap| async move {
                let ua = headers
                    .get("user-agent")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                Json(json!({"success": ua == "custom-agent/1.0"}))
            }),
        );
        let (base, _h) = serve(app).await;

        let mut req = CheckinRequest::new(&base, "session=abc");
        req.extra_headers
            .insert("User-Agent".to_string(), "custom-agent/1.0".to_string());
        let out = do_checkin(&RelayClient::new(), &req).await;
        assert!(out.success);
    }
}
