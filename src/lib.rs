pub mod balance;
pub mod checkin;
pub mod client;
pub mod config;
pub mod constants;
pub mod logs;
pub mod ops;
pub mod store;
pub mod summary;

pub use balance::{probe_balance, query_balance_by_cookie, BalanceReport, BalanceRequest};
pub use checkin::{do_checkin, CheckinOutcome, CheckinRequest};
pub use client::RelayClient;
pub use config::{AppConfig, AuthScheme, BalanceUnit, SiteProfile, SiteType};
pub use logs::{fetch_logs, LogEntry, LogPage, LogRequest};
pub use ops::{checkin_all, query_all_balances, query_all_balances_by_cookie, BatchReport};
pub use store::{CheckinLog, CheckinLogEntry, ProfileStore, RawResponseCache};
pub use summary::{extract_site_summary, stats_summary, SiteSummary, StatsSummary};
