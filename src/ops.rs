use std::time::Duration;

use serde::Serialize;

use crate::balance::{probe_balance, query_balance_by_cookie, quota_to_usd, BalanceRequest};
use crate::checkin::{do_checkin, CheckinOutcome, CheckinRequest};
use crate::client::RelayClient;
use crate::config::BalanceUnit;
use crate::store::{now_local_string, CheckinLog, CheckinLogEntry, ProfileStore};
use crate::summary::{extract_site_summary, SiteSummary};

/// Pause between sites in batch operations so a burst of queries does not
/// trip relay-side rate limits.
const BATCH_DELAY: Duration = Duration::from_millis(120);

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchReport {
    pub success: usize,
    pub failed: usize,
    pub sites: Vec<SiteSummary>,
}

/// Query every key-configured site in order, persisting each fresh balance.
/// Sites run strictly one at a time; a failure on one site never stops the
/// batch.
pub async fn query_all_balances(client: &RelayClient, store: &ProfileStore) -> BatchReport {
    let mut report = BatchReport::default();
    let mut first = true;
    for site in store.list() {
        if site.api_key.trim().is_empty() {
            continue;
        }
        if !first {
            tokio::time::sleep(BATCH_DELAY).await;
        }
        first = false;

        let req = BalanceRequest::from_profile(&site);
        let probed = probe_balance(client, &req).await;
        let summary = extract_site_summary(&site.name, &probed);
        if summary.error.is_none() {
            report.success += 1;
            let unit = BalanceUnit::from_str(&summary.unit);
            if let Err(e) = store.update_balance(&site.id, summary.balance, unit) {
                log::warn!("persist balance for {} failed: {e}", site.name);
            }
        } else {
            report.failed += 1;
            log::info!(
                "balance query failed for {}: {}",
                site.name,
                summary.error.as_deref().unwrap_or_default()
            );
        }
        report.sites.push(summary);
    }
    report
}

/// One site's line in a cookie-batch result.
#[derive(Debug, Clone, Serialize)]
pub struct CookieQueryLine {
    pub site_id: String,
    pub site_name: String,
    pub success: bool,
    pub balance: f64,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub message: String,
}

/// Cookie-authenticated balance refresh for every site with a stored
/// session cookie. Results persist as USD.
pub async fn query_all_balances_by_cookie(
    client: &RelayClient,
    store: &ProfileStore,
) -> Vec<CookieQueryLine> {
    let mut lines = Vec::new();
    let mut first = true;
    for site in store.list() {
        if site.session_cookie.trim().is_empty() {
            continue;
        }
        if !first {
            tokio::time::sleep(BATCH_DELAY).await;
        }
        first = false;

        let result =
            query_balance_by_cookie(client, &site.url, &site.session_cookie, &site.checkin_user_id)
                .await;
        if result.success {
            if let Err(e) = store.update_balance(&site.id, result.balance, BalanceUnit::Usd) {
                log::warn!("persist balance for {} failed: {e}", site.name);
            }
        }
        lines.push(CookieQueryLine {
            site_id: site.id,
            site_name: site.name,
            success: result.success,
            balance: result.balance,
            message: result.message,
        });
    }
    lines
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckinLine {
    pub site_id: String,
    pub site_name: String,
    pub outcome: CheckinOutcome,
}

/// Daily check-in across every cookie-configured site. Each success chains a
/// cookie balance re-query so the stored balance reflects the awarded quota,
/// and every attempt lands in the audit log.
pub async fn checkin_all(
    client: &RelayClient,
    store: &ProfileStore,
    audit: &CheckinLog,
) -> Vec<CheckinLine> {
    let mut lines = Vec::new();
    let mut first = true;
    for site in store.list() {
        if site.session_cookie.trim().is_empty() {
            continue;
        }
        if !first {
            tokio::time::sleep(BATCH_DELAY).await;
        }
        first = false;

        let req = CheckinRequest::from_profile(&site);
        let outcome = do_checkin(client, &req).await;

        if let Err(e) = audit.add(CheckinLogEntry {
            timestamp: now_local_string(),
            site_name: site.name.clone(),
            site_id: site.id.clone(),
            success: outcome.success,
            quota_awarded: quota_to_usd(outcome.quota_awarded),
            message: outcome.message.clone(),
        }) {
            log::warn!("append checkin log for {} failed: {e}", site.name);
        }

        if outcome.success {
            let refreshed = query_balance_by_cookie(
                client,
                &site.url,
                &site.session_cookie,
                &site.checkin_user_id,
            )
            .await;
            if refreshed.success {
                if let Err(e) = store.update_balance(&site.id, refreshed.balance, BalanceUnit::Usd)
                {
                    log::warn!("persist balance for {} failed: {e}", site.name);
                }
            }
        }

        lines.push(CheckinLine {
            site_id: site.id,
            site_name: site.name,
            outcome,
        });
    }
    lines
}
