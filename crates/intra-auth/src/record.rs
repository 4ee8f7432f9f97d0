//! Fleet app records
//!
//! An app is one upstream-registered OAuth2 client owned by the user. Besides
//! the credential pair and the current bearer token, each record carries the
//! usage metadata scraped from the web console; those fields are persisted
//! verbatim and never interpreted by the engine beyond the usage queries.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::constants::EXPIRY_UNKNOWN;

/// A single intra application.
///
/// `token_expires_at` is an absolute unix timestamp in seconds; `-1` means
/// the expiry is unknown. An empty `access_token` means no token has been
/// fetched yet. Serde defaults let partial records (for example a file with
/// only uid/secret) load cleanly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppRecord {
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub secret: String,
    #[serde(default)]
    pub next_secret: Option<String>,
    #[serde(default)]
    pub access_token: String,
    #[serde(default = "unknown_expiry")]
    pub token_expires_at: i64,
    #[serde(default)]
    pub app_name: String,
    #[serde(default)]
    pub requests_last_hour: u64,
    #[serde(default)]
    pub max_requests_per_hour: u64,
    #[serde(default)]
    pub max_requests_per_second: u64,
    #[serde(default)]
    pub active_tokens: u64,
    #[serde(default)]
    pub active_users: u64,
    #[serde(default)]
    pub total_requests: u64,
    #[serde(default)]
    pub total_generated_tokens: u64,
    #[serde(default)]
    pub total_unique_users: u64,
    #[serde(default = "unknown_expiry")]
    pub current_secret_expiry_ts: i64,
    #[serde(default = "unknown_expiry")]
    pub next_secret_expiry_ts: i64,
    #[serde(default)]
    pub redirect_url: String,
    #[serde(default)]
    pub scopes: Vec<String>,
}

fn unknown_expiry() -> i64 {
    EXPIRY_UNKNOWN
}

impl Default for AppRecord {
    fn default() -> Self {
        Self {
            uid: String::new(),
            secret: String::new(),
            next_secret: None,
            access_token: String::new(),
            token_expires_at: EXPIRY_UNKNOWN,
            app_name: String::new(),
            requests_last_hour: 0,
            max_requests_per_hour: 0,
            max_requests_per_second: 0,
            active_tokens: 0,
            active_users: 0,
            total_requests: 0,
            total_generated_tokens: 0,
            total_unique_users: 0,
            current_secret_expiry_ts: EXPIRY_UNKNOWN,
            next_secret_expiry_ts: EXPIRY_UNKNOWN,
            redirect_url: String::new(),
            scopes: Vec::new(),
        }
    }
}

impl AppRecord {
    /// A record holding only a credential pair, everything else unknown.
    pub fn with_credentials(uid: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            secret: secret.into(),
            ..Self::default()
        }
    }

    /// Whether the bearer token must be refreshed before use.
    ///
    /// An unknown expiry (`-1`) counts as expired, so freshly scraped apps
    /// get a token on first pick.
    pub fn token_expired(&self, now: i64) -> bool {
        self.token_expires_at <= now
    }
}

/// Current unix time in whole seconds.
pub fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
