use std::collections::BTreeMap;

use serde::Serialize;

use crate::balance::BalanceReport;
use crate::config::SiteProfile;

/// One site's dashboard row, flattened from a probe report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SiteSummary {
    pub name: String,
    pub balance: f64,
    pub unit: String,
    pub today_cost: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Reduce a multi-field probe report to the single balance figure the list
/// view shows. Shapes are tried in a fixed order; the subscription shape
/// wins over the legacy-token shape when both matched.
pub fn extract_site_summary(name: &str, report: &BalanceReport) -> SiteSummary {
    let today_cost = report.today_cost.unwrap_or(0.0);

    if let Some(err) = &report.error {
        return SiteSummary {
            name: name.to_string(),
            balance: 0.0,
            unit: "USD".to_string(),
            today_cost,
            error: Some(err.clone()),
        };
    }
    if report.hard_limit_usd.is_some() {
        return SiteSummary {
            name: name.to_string(),
            balance: report.remaining_usd.unwrap_or(0.0),
            unit: "USD".to_string(),
            today_cost,
            error: None,
        };
    }
    if report.total_granted.is_some() {
        return SiteSummary {
            name: name.to_string(),
            balance: report.total_available.unwrap_or(0.0),
            unit: "Token".to_string(),
            today_cost,
            error: None,
        };
    }
    SiteSummary {
        name: name.to_string(),
        balance: report.balance.unwrap_or(0.0),
        unit: report.unit.clone().unwrap_or_else(|| "USD".to_string()),
        today_cost,
        error: None,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TypeStats {
    pub count: usize,
    pub balance: f64,
    pub recharge: f64,
}

/// Portfolio totals across all stored profiles. Token balances are
/// site-internal credit and are excluded from the money totals; negative
/// balances count as zero so one broken site cannot sink the total.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StatsSummary {
    pub total_sites: usize,
    pub total_balance: f64,
    pub total_recharge: f64,
    pub by_type: BTreeMap<String, TypeStats>,
}

pub fn stats_summary(sites: &[SiteProfile]) -> StatsSummary {
    let mut out = StatsSummary {
        total_sites: sites.len(),
        ..StatsSummary::default()
    };
    for site in sites {
        let money_balance = if site.unit().is_money() {
            site.balance.max(0.0)
        } else {
            0.0
        };
        let recharge: f64 = site.recharge_records.iter().map(|r| r.amount).sum();
        out.total_balance += money_balance;
        out.total_recharge += recharge;

        let slot = out.by_type.entry(site.kind().label().to_string()).or_default();
        slot.count += 1;
        slot.balance += money_balance;
        slot.recharge += recharge;
    }
    out
}

/// Sites whose money balance fell below the configured threshold. Token
/// sites and sites whose last query errored never alert.
pub fn low_balance_sites(summaries: &[SiteSummary], threshold: f64) -> Vec<SiteSummary> {
    summaries
        .iter()
        .filter(|s| s.error.is_none())
        .filter(|s| s.unit != "Token")
        .filter(|s| s.balance < threshold)
        .cloned()
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChartRow {
    pub name: String,
    pub balance: f64,
}

/// Rows for the balance bar chart: money-unit positive balances only,
/// largest first, at most ten bars, names clipped to eight chars so the
/// axis stays readable.
pub fn balance_chart_rows(sites: &[SiteProfile]) -> Vec<ChartRow> {
    let mut rows: Vec<ChartRow> = sites
        .iter()
        .filter(|s| s.unit().is_money() && s.balance > 0.0)
        .map(|s| ChartRow {
            name: s.name.chars().take(8).collect(),
            balance: s.balance,
        })
        .collect();
    rows.sort_by(|a, b| b.balance.partial_cmp(&a.balance).unwrap_or(std::cmp::Ordering::Equal));
    rows.truncate(10);
    rows
}
