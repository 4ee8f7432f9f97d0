//! Request authentication shaping
//!
//! Decouples the worker loop from how an upstream wants its credentials
//! presented. The intra API uses plain bearer authentication; another
//! upstream would implement its own shaper.

use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use tracing::error;

use intra_auth::AppRecord;

/// Capability for shaping outbound request headers from a selected app.
pub trait AuthShaper: Send + Sync {
    /// Apply the app's credentials to the request headers.
    ///
    /// Caller-supplied headers are preserved; the shaper only adds or
    /// replaces what authentication requires.
    fn shape(&self, app_id: &str, app: &AppRecord, headers: HeaderMap) -> HeaderMap;
}

/// The 42-intra shaper: `Authorization: Bearer <token>`.
#[derive(Debug, Default)]
pub struct BearerShaper;

impl AuthShaper for BearerShaper {
    fn shape(&self, app_id: &str, app: &AppRecord, mut headers: HeaderMap) -> HeaderMap {
        if app.access_token.is_empty() {
            error!(app_id, "app has no access token");
        }
        match HeaderValue::from_str(&format!("Bearer {}", app.access_token)) {
            Ok(value) => {
                headers.insert(AUTHORIZATION, value);
            }
            Err(e) => {
                error!(app_id, error = %e, "could not build authorization header");
            }
        }
        headers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app_with_token(token: &str) -> AppRecord {
        let mut app = AppRecord::with_credentials("u", "s");
        app.access_token = token.to_string();
        app
    }

    #[test]
    fn injects_bearer_token() {
        let app = app_with_token("tok-123");
        let headers = BearerShaper.shape("91234", &app, HeaderMap::new());
        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Bearer tok-123");
    }

    #[test]
    fn preserves_caller_headers() {
        let app = app_with_token("tok-123");
        let mut headers = HeaderMap::new();
        headers.insert("x-page", HeaderValue::from_static("7"));
        let shaped = BearerShaper.shape("91234", &app, headers);
        assert_eq!(shaped.get("x-page").unwrap(), "7");
        assert_eq!(shaped.get(AUTHORIZATION).unwrap(), "Bearer tok-123");
    }

    #[test]
    fn replaces_caller_authorization() {
        let app = app_with_token("tok-123");
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer stale"));
        let shaped = BearerShaper.shape("91234", &app, headers);
        assert_eq!(shaped.get(AUTHORIZATION).unwrap(), "Bearer tok-123");
    }

    #[test]
    fn empty_token_still_shapes() {
        // The send proceeds and fails through the normal retry path.
        let app = app_with_token("");
        let headers = BearerShaper.shape("91234", &app, HeaderMap::new());
        assert_eq!(headers.get(AUTHORIZATION).unwrap(), "Bearer ");
    }
}
