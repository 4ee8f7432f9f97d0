//! Full-fleet token refresh
//!
//! Walks a snapshot of the fleet and fetches a fresh bearer token for every
//! app, so the fleet can be mutated underneath without aliasing. The caller
//! owns the `refreshing` barrier and the fleet-ops lock; this module only
//! performs the per-app exchanges and store writes.

use intra_auth::{AppStore, fetch_token, unix_now};
use intra_auth::constants::EXPIRY_UNKNOWN;
use tracing::{error, info, warn};

/// Refresh every app's access token.
///
/// Apps with an empty uid or secret cannot be exchanged and are removed from
/// the fleet. A failed exchange records an empty token with unknown expiry,
/// so the app is retried at its next refresh instead of being dropped.
pub(crate) async fn refresh_fleet(store: &AppStore, client: &reqwest::Client, endpoint: &str) {
    let snapshot = store.snapshot().await;
    let total = snapshot.len();
    for (i, (app_id, app)) in snapshot.iter().enumerate() {
        info!(app_id, "refreshing token ({}/{})", i + 1, total);
        if app.uid.is_empty() || app.secret.is_empty() {
            error!(app_id, "app has no uid or secret, removing it from the fleet");
            store.remove(app_id).await;
            continue;
        }
        match fetch_token(client, endpoint, &app.uid, &app.secret).await {
            Ok(token) => {
                let expires_at = unix_now() + token.expires_in;
                if let Err(e) = store
                    .update_token(app_id, token.access_token, expires_at)
                    .await
                {
                    warn!(app_id, error = %e, "could not store refreshed token");
                }
            }
            Err(e) => {
                error!(app_id, error = %e, "could not get access token");
                if let Err(e) = store
                    .update_token(app_id, String::new(), EXPIRY_UNKNOWN)
                    .await
                {
                    warn!(app_id, error = %e, "could not record failed refresh");
                }
            }
        }
    }
}
