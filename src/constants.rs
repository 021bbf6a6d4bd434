/// Relay-internal quota unit. NewAPI-lineage sites treat 500000 units as $1;
/// whether other lineages share the ratio is unknown, so it stays a single
/// named constant instead of a per-site setting.
pub const QUOTA_UNITS_PER_USD: f64 = 500_000.0;

pub const DEFAULT_SUBSCRIPTION_PATH: &str = "/v1/dashboard/billing/subscription";
pub const DEFAULT_USAGE_PATH: &str = "/v1/dashboard/billing/usage";
pub const DEFAULT_LOG_PATH: &str = "/api/log/token";
pub const DEFAULT_CHECKIN_PATH: &str = "/api/user/checkin";

/// One attempt per call, no retry; reads get the short timeout, cookie
/// endpoints (check-in, /api/user/self) the longer one.
pub const READ_TIMEOUT_SECONDS: u64 = 10;
pub const COOKIE_TIMEOUT_SECONDS: u64 = 15;

/// The OpenAI-compatible usage endpoint wants an explicit date window.
pub const USAGE_WINDOW_DAYS: i64 = 100;

pub const MAX_CHECKIN_LOG_ENTRIES: usize = 500;

/// Sent on cookie-authenticated calls. Many relay sites sit behind
/// bot-detection that gates on user-agent sniffing, so this must stay a
/// realistic desktop browser string.
pub const DEFAULT_BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
     AppleWebKit/537.36 (KHTML, like Gecko) \
     Chrome/144.0.0.0 Safari/537.36 Edg/144.0.0.0";
