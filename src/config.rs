use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Credential delivery for balance/log endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthScheme {
    #[default]
    Bearer,
    UrlKey,
}

impl AuthScheme {
    pub fn from_str(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "url_key" => Self::UrlKey,
            _ => Self::Bearer,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bearer => "bearer",
            Self::UrlKey => "url_key",
        }
    }
}

/// Unit of the last known balance. Empty strings in stored profiles mean USD.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BalanceUnit {
    #[default]
    Usd,
    Cny,
    Token,
}

impl BalanceUnit {
    pub fn from_str(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "cny" => Self::Cny,
            "token" => Self::Token,
            _ => Self::Usd,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Usd => "USD",
            Self::Cny => "CNY",
            Self::Token => "Token",
        }
    }

    /// Token balances are site-internal credit and never summed with money.
    pub fn is_money(&self) -> bool {
        !matches!(self, Self::Token)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SiteType {
    #[default]
    Paid,
    Free,
    Subscription,
}

impl SiteType {
    pub fn from_str(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" => Self::Free,
            "subscription" => Self::Subscription,
            _ => Self::Paid,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Paid => "paid",
            Self::Free => "free",
            Self::Subscription => "subscription",
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Paid => "付费站",
            Self::Free => "公益站",
            Self::Subscription => "订阅转API",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RechargeRecord {
    pub id: String,
    pub amount: f64,
    pub date: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub note: String,
}

/// One relay-site account record. The JSON profile store is the persistent
/// owner; enum-ish fields stay strings on disk with typed accessors here.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SiteProfile {
    pub id: String,
    pub name: String,
    pub url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub api_key: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub session_cookie: String,
    #[serde(default)]
    pub balance: f64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub balance_unit: String,
    /// Auth for the balance probe chain: "bearer" (default) or "url_key".
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub balance_auth: String,
    /// Auth for the call-log endpoint, same values.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub log_auth: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub subscription_path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub usage_path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub log_path: String,
    /// Optional proxy endpoint for sites that block direct log-API access.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub proxy_url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub checkin_path: String,
    /// Some sites require a `new-api-user` header carrying this id.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub checkin_user_id: String,
    /// Extra check-in headers, merged last so they can override defaults.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub checkin_headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_query_time: String,
    #[serde(default, skip_serializing_if = "String::is_empty", rename = "type")]
    pub site_type: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub notes: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub recharge_records: Vec<RechargeRecord>,
}

impl SiteProfile {
    pub fn new(name: &str, url: &str) -> Self {
        Self {
            id: new_site_id(),
            name: name.to_string(),
            url: url.trim().trim_end_matches('/').to_string(),
            api_key: String::new(),
            session_cookie: String::new(),
            balance: 0.0,
            balance_unit: String::new(),
            balance_auth: String::new(),
            log_auth: String::new(),
            subscription_path: String::new(),
            usage_path: String::new(),
            log_path: String::new(),
            proxy_url: String::new(),
            checkin_path: String::new(),
            checkin_user_id: String::new(),
            checkin_headers: BTreeMap::new(),
            last_query_time: String::new(),
            site_type: String::new(),
            tags: Vec::new(),
            notes: String::new(),
            recharge_records: Vec::new(),
        }
    }

    pub fn unit(&self) -> BalanceUnit {
        BalanceUnit::from_str(&self.balance_unit)
    }

    pub fn balance_auth_scheme(&self) -> AuthScheme {
        AuthScheme::from_str(&self.balance_auth)
    }

    pub fn log_auth_scheme(&self) -> AuthScheme {
        AuthScheme::from_str(&self.log_auth)
    }

    pub fn kind(&self) -> SiteType {
        SiteType::from_str(&self.site_type)
    }

    pub fn normalized_url(&self) -> &str {
        self.url.trim().trim_end_matches('/')
    }
}

pub fn new_site_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

pub fn new_record_id() -> String {
    format!("rec-{}", &uuid::Uuid::new_v4().simple().to_string()[..6])
}

fn default_low_balance_threshold() -> f64 {
    10.0
}

/// App-level settings. Loaded once per operation and passed explicitly;
/// nothing re-reads the file behind the caller's back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_low_balance_threshold")]
    pub low_balance_threshold: f64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            low_balance_threshold: default_low_balance_threshold(),
        }
    }
}

impl AppConfig {
    pub fn load(path: &Path) -> Self {
        let Ok(txt) = std::fs::read_to_string(path) else {
            return Self::default();
        };
        serde_json::from_str(&txt).unwrap_or_default()
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}
