//! Web-console adapter contract
//!
//! The engine maintains a fleet of intra applications, but discovering app
//! ids, reading uid/secret pairs, and creating or deleting applications all
//! happen through an authenticated browser-style session against the profile
//! pages. That collaborator is defined here as the `ConsoleClient` trait so
//! the engine stays decoupled from any scraping implementation; the adapter
//! owns its HTTP session exclusively and never shares it with the engine's
//! request workers.

mod error;

pub use error::{ConsoleError, Result};

use async_trait::async_trait;
use common::Secret;
use serde::{Deserialize, Serialize};

/// Scraped application fields — everything an app record holds except token
/// state, which only the token endpoint produces.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppMeta {
    pub uid: String,
    pub secret: String,
    pub next_secret: Option<String>,
    pub app_name: String,
    pub requests_last_hour: u64,
    pub max_requests_per_hour: u64,
    pub max_requests_per_second: u64,
    pub active_tokens: u64,
    pub active_users: u64,
    pub total_requests: u64,
    pub total_generated_tokens: u64,
    pub total_unique_users: u64,
    pub current_secret_expiry_ts: i64,
    pub next_secret_expiry_ts: i64,
    pub redirect_url: String,
    pub scopes: Vec<String>,
}

/// Sign-in material for the console session.
pub struct ConsoleCredentials {
    pub login: String,
    pub password: Secret<String>,
}

impl ConsoleCredentials {
    /// Read credentials from `INTRA_LOGIN` and `INTRA_PW_B64`.
    ///
    /// The password is stored base64-encoded in the environment so it never
    /// appears verbatim in shell history or process listings.
    pub fn from_env() -> common::Result<Self> {
        use base64::Engine as _;

        let login = std::env::var("INTRA_LOGIN")
            .map_err(|_| common::Error::Env("INTRA_LOGIN is not set".into()))?;
        let encoded = std::env::var("INTRA_PW_B64")
            .map_err(|_| common::Error::Env("INTRA_PW_B64 is not set".into()))?;
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(encoded.as_bytes())
            .map_err(|e| common::Error::Env(format!("INTRA_PW_B64 is not valid base64: {e}")))?;
        let password = String::from_utf8(decoded)
            .map_err(|e| common::Error::Env(format!("decoded password is not UTF-8: {e}")))?;
        Ok(Self {
            login,
            password: Secret::new(password),
        })
    }
}

/// Authenticated console operations the engine's fleet control relies on.
///
/// Implementations scrape the profile pages behind a keycloak sign-in. Parse
/// failures should leave the affected `AppMeta` fields at their defaults
/// rather than failing the whole call; a sign-in that lands on the
/// reset-password page must surface as `ConsoleError::TwoFactorRequired`.
#[async_trait]
pub trait ConsoleClient: Send + Sync {
    /// Make sure the browser-style session is authenticated, signing in if
    /// the session cookie is missing or stale.
    async fn ensure_session(&self) -> Result<()>;

    /// Ids of all applications owned by the signed-in user.
    async fn list_app_ids(&self) -> Result<Vec<String>>;

    /// Scrape one application's credentials and usage metadata.
    async fn fetch_app_metadata(&self, app_id: &str) -> Result<AppMeta>;

    /// Register a new application, returning its id.
    async fn create_app(&self, name: &str) -> Result<String>;

    /// Delete an application by id.
    async fn delete_app(&self, app_id: &str) -> Result<()>;
}
