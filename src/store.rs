use std::path::PathBuf;
use std::sync::Arc;

use chrono::Local;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{new_record_id, BalanceUnit, RechargeRecord, SiteProfile};
use crate::constants::MAX_CHECKIN_LOG_ENTRIES;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

pub fn now_local_string() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

fn read_json_file<T: serde::de::DeserializeOwned>(path: &PathBuf) -> Option<T> {
    let txt = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&txt).ok()
}

fn write_json_file<T: Serialize>(path: &PathBuf, data: &T) -> Result<(), StoreError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(data)?)?;
    Ok(())
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct ProfilesFile {
    #[serde(default)]
    sites: Vec<SiteProfile>,
}

/// A minimal external profile row, as synced from a shared profile list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileSeed {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub api_key: String,
}

/// Persistent owner of the site-profile collection. Whole-file JSON writes;
/// corrupt or missing files load as empty.
#[derive(Clone)]
pub struct ProfileStore {
    path: PathBuf,
    inner: Arc<Mutex<ProfilesFile>>,
}

impl ProfileStore {
    pub fn new(path: PathBuf) -> Self {
        let inner = read_json_file(&path).unwrap_or_default();
        Self {
            path,
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    fn persist(&self, data: &ProfilesFile) -> Result<(), StoreError> {
        write_json_file(&self.path, data)
    }

    pub fn list(&self) -> Vec<SiteProfile> {
        self.inner.lock().sites.clone()
    }

    pub fn get(&self, id: &str) -> Option<SiteProfile> {
        self.inner.lock().sites.iter().find(|s| s.id == id).cloned()
    }

    pub fn upsert(&self, profile: SiteProfile) -> Result<(), StoreError> {
        let mut data = self.inner.lock();
        match data.sites.iter_mut().find(|s| s.id == profile.id) {
            Some(slot) => *slot = profile,
            None => data.sites.push(profile),
        }
        self.persist(&data)
    }

    pub fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let mut data = self.inner.lock();
        let before = data.sites.len();
        data.sites.retain(|s| s.id != id);
        let removed = data.sites.len() != before;
        if removed {
            self.persist(&data)?;
        }
        Ok(removed)
    }

    /// Record a fresh balance reading and stamp the query time.
    pub fn update_balance(
        &self,
        id: &str,
        balance: f64,
        unit: BalanceUnit,
    ) -> Result<bool, StoreError> {
        let mut data = self.inner.lock();
        let Some(site) = data.sites.iter_mut().find(|s| s.id == id) else {
            return Ok(false);
        };
        site.balance = balance;
        site.balance_unit = unit.as_str().to_string();
        site.last_query_time = now_local_string();
        self.persist(&data)?;
        Ok(true)
    }

    /// Sync new sites from an external profile list. Existing sites are
    /// matched by trailing-slash-insensitive URL and left untouched.
    pub fn import_seeds(&self, seeds: &[ProfileSeed]) -> Result<usize, StoreError> {
        let mut data = self.inner.lock();
        let mut known: std::collections::BTreeSet<String> = data
            .sites
            .iter()
            .map(|s| s.normalized_url().to_string())
            .collect();

        let mut imported = 0;
        for seed in seeds {
            let url = seed.url.trim().trim_end_matches('/').to_string();
            if url.is_empty() || known.contains(&url) {
                continue;
            }
            let name = if seed.name.trim().is_empty() {
                "未命名"
            } else {
                seed.name.trim()
            };
            let mut site = SiteProfile::new(name, &url);
            site.api_key = seed.api_key.clone();
            known.insert(url);
            data.sites.push(site);
            imported += 1;
        }
        if imported > 0 {
            self.persist(&data)?;
        }
        Ok(imported)
    }

    pub fn add_recharge(
        &self,
        site_id: &str,
        amount: f64,
        date: Option<&str>,
        note: &str,
    ) -> Result<Option<RechargeRecord>, StoreError> {
        let mut data = self.inner.lock();
        let Some(site) = data.sites.iter_mut().find(|s| s.id == site_id) else {
            return Ok(None);
        };
        let record = RechargeRecord {
            id: new_record_id(),
            amount,
            date: date
                .map(str::to_string)
                .unwrap_or_else(|| Local::now().format("%Y-%m-%d").to_string()),
            note: note.to_string(),
        };
        site.recharge_records.push(record.clone());
        self.persist(&data)?;
        Ok(Some(record))
    }

    pub fn delete_recharge(&self, site_id: &str, record_id: &str) -> Result<bool, StoreError> {
        let mut data = self.inner.lock();
        let Some(site) = data.sites.iter_mut().find(|s| s.id == site_id) else {
            return Ok(false);
        };
        let before = site.recharge_records.len();
        site.recharge_records.retain(|r| r.id != record_id);
        let removed = site.recharge_records.len() != before;
        if removed {
            self.persist(&data)?;
        }
        Ok(removed)
    }
}

/// One line of the append-only check-in audit log. `quota_awarded` is
/// already converted to USD.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckinLogEntry {
    pub timestamp: String,
    pub site_name: String,
    pub site_id: String,
    pub success: bool,
    pub quota_awarded: f64,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct CheckinLogFile {
    #[serde(default)]
    entries: Vec<CheckinLogEntry>,
}

/// Newest-first check-in audit log, capped at 500 entries; the oldest are
/// dropped silently.
#[derive(Clone)]
pub struct CheckinLog {
    path: PathBuf,
    inner: Arc<Mutex<CheckinLogFile>>,
}

impl CheckinLog {
    pub fn new(path: PathBuf) -> Self {
        let inner = read_json_file(&path).unwrap_or_default();
        Self {
            path,
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    pub fn add(&self, entry: CheckinLogEntry) -> Result<(), StoreError> {
        let mut data = self.inner.lock();
        data.entries.insert(0, entry);
        data.entries.truncate(MAX_CHECKIN_LOG_ENTRIES);
        write_json_file(&self.path, &*data)
    }

    pub fn list(&self) -> Vec<CheckinLogEntry> {
        self.inner.lock().entries.clone()
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct RawResponseFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    balance: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    logs: Option<Value>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    updated_at: String,
}

/// Diagnostic cache holding the most recent raw balance/log payloads,
/// overwritten on each query. Consumed only by the raw-response viewer.
#[derive(Clone)]
pub struct RawResponseCache {
    path: PathBuf,
    inner: Arc<Mutex<RawResponseFile>>,
}

impl RawResponseCache {
    pub fn new(path: PathBuf) -> Self {
        let inner = read_json_file(&path).unwrap_or_default();
        Self {
            path,
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    pub fn set_balance(&self, raw: Value) -> Result<(), StoreError> {
        let mut data = self.inner.lock();
        data.balance = Some(raw);
        data.updated_at = now_local_string();
        write_json_file(&self.path, &*data)
    }

    pub fn set_logs(&self, raw: Value) -> Result<(), StoreError> {
        let mut data = self.inner.lock();
        data.logs = Some(raw);
        data.updated_at = now_local_string();
        write_json_file(&self.path, &*data)
    }

    pub fn balance(&self) -> Option<Value> {
        self.inner.lock().balance.clone()
    }

    pub fn logs(&self) -> Option<Value> {
        self.inner.lock().logs.clone()
    }
}
