//! Token endpoint client
//!
//! The intra API hands out bearer tokens via the OAuth2 client-credentials
//! grant: one POST per app with its uid/secret pair. This is the single-app
//! primitive; full-fleet refresh lives with the engine, which owns the
//! barrier that quiesces workers while tokens are rewritten.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Response from the token endpoint.
///
/// `expires_in` is a delta in seconds from the response time. The caller
/// converts it to an absolute unix timestamp when storing the record.
#[derive(Debug, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    /// Seconds until the access token expires (delta, not absolute)
    pub expires_in: i64,
}

/// Fetch an access token for one app via the client-credentials grant.
pub async fn fetch_token(
    client: &reqwest::Client,
    endpoint: &str,
    uid: &str,
    secret: &str,
) -> Result<TokenResponse> {
    let response = client
        .post(endpoint)
        .form(&[
            ("grant_type", "client_credentials"),
            ("client_id", uid),
            ("client_secret", secret),
        ])
        .send()
        .await
        .map_err(|e| Error::Http(format!("token request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));
        return Err(Error::TokenExchange(format!(
            "token endpoint returned {status}: {body}"
        )));
    }

    response
        .json::<TokenResponse>()
        .await
        .map_err(|e| Error::TokenExchange(format!("invalid token response: {e}")))
}
