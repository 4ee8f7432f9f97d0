//! Per-request worker
//!
//! Each submitted request runs on its own task and owns its retry loop. On
//! every attempt the worker re-picks a credential from the dispatcher, so a
//! failing app never monopolizes a stuck request. Backoff starts at `1/N`
//! seconds and grows by the configured factor per failed attempt.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::HeaderMap;
use tracing::{debug, error, warn};

use intra_auth::unix_now;

use crate::engine::Shared;
use crate::sink::ResponseRecord;

/// Poll interval for the refresh barrier and admission waits.
pub(crate) const REFRESH_POLL: Duration = Duration::from_millis(500);

/// Status recorded for attempts that died in transport, below HTTP. Never
/// produced by the upstream, so it flows through the ordinary failure path.
pub(crate) const SYNTHETIC_TRANSPORT_STATUS: u16 = 599;

/// Attempts still eligible for the permanent-404 early return.
const NOT_FOUND_GRACE: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HttpMethod {
    Get,
    Post,
}

/// Keeps the in-flight worker count honest across every exit path.
pub(crate) struct InFlightGuard {
    shared: Arc<Shared>,
}

impl InFlightGuard {
    pub(crate) fn acquire(shared: Arc<Shared>) -> Self {
        shared.in_flight.fetch_add(1, Ordering::SeqCst);
        Self { shared }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.shared.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Run one submitted request to completion.
pub(crate) async fn run_request(
    shared: Arc<Shared>,
    method: HttpMethod,
    url: String,
    body: Option<String>,
    headers: HeaderMap,
) {
    let url = if url.starts_with('/') {
        format!("{}{}", shared.config.api_base, url)
    } else {
        url
    };

    let fleet_size = shared.store.len().await.max(1);
    let mut retries: u32 = 0;
    let mut delay = Duration::from_secs_f64(1.0 / fleet_size as f64);

    loop {
        // Pick a credential, waiting out any fleet-wide token refresh.
        let (app_id, app) = loop {
            while shared.refreshing.load(Ordering::Acquire) {
                tokio::time::sleep(REFRESH_POLL).await;
            }
            let Some((app_id, app)) = shared.dispatcher.next_app(&shared.store).await else {
                error!(%url, "fleet emptied out, abandoning request");
                return;
            };
            if app.token_expired(unix_now()) {
                warn!(app_id, %url, "token expired, refreshing fleet");
                shared.refresh_if_expired(&app_id).await;
                continue;
            }
            break (app_id, app);
        };

        let shaped = shared.shaper.shape(&app_id, &app, headers.clone());
        let builder = match method {
            HttpMethod::Get => shared.client.get(&url),
            HttpMethod::Post => shared.client.post(&url),
        }
        .headers(shaped);
        let builder = match &body {
            Some(b) if method == HttpMethod::Post => builder.body(b.clone()),
            _ => builder,
        };

        let (status, response_body) = match builder.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                match response.bytes().await {
                    Ok(bytes) => (status, bytes),
                    Err(e) => {
                        warn!(%url, error = %e, "could not read response body");
                        (SYNTHETIC_TRANSPORT_STATUS, Bytes::new())
                    }
                }
            }
            Err(e) => {
                warn!(%url, error = %e, "transport error");
                (SYNTHETIC_TRANSPORT_STATUS, Bytes::new())
            }
        };

        if status == 200 {
            debug!(%url, app_id, "request ok");
            shared.stats.record_ok(response_body.len());
            shared
                .sink
                .append(ResponseRecord {
                    url,
                    status,
                    body: response_body,
                })
                .await;
            return;
        }

        shared.stats.record_non_ok(status);
        if status == 429 {
            debug!(%url, app_id, retries, "request rate limited");
        } else {
            warn!(%url, app_id, status, retries, "request failed");
        }
        if retries > NOT_FOUND_GRACE && status == 404 {
            warn!(%url, retries, "still 404, returning early");
            return;
        }

        tokio::time::sleep(delay).await;
        delay = delay.mul_f64(shared.config.retry_delay_factor);
        retries += 1;
        shared.stats.record_retry();
        if retries > shared.config.max_retries {
            error!(
                %url,
                max_retries = shared.config.max_retries,
                "data loss: request exceeded max retries"
            );
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HydraConfig;
    use intra_auth::{AppRecord, AppStore, unix_now};
    use wiremock::matchers::{header, method as http_method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fresh_app(token: &str) -> AppRecord {
        let mut app = AppRecord::with_credentials("u", "s");
        app.access_token = token.to_string();
        app.token_expires_at = unix_now() + 3600;
        app
    }

    async fn shared_for(server: &MockServer, apps: &[(&str, &str)], max_retries: u32) -> Arc<Shared> {
        let mut config = HydraConfig::default();
        config.api_base = server.uri();
        config.token_endpoint = format!("{}/oauth/token", server.uri());
        config.max_retries = max_retries;
        config.retry_delay_factor = 1.0;
        config.request_timeout_secs = 5;

        let store = AppStore::empty("unused.json".into());
        for (id, token) in apps {
            store.insert(id.to_string(), fresh_app(token)).await;
        }
        Arc::new(Shared::new(config, store).unwrap())
    }

    #[tokio::test]
    async fn single_get_success() {
        let server = MockServer::start().await;
        Mock::given(http_method("GET"))
            .and(path("/ping"))
            .and(header("authorization", "Bearer tok-a"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"ok":true}"#))
            .expect(1)
            .mount(&server)
            .await;

        let shared = shared_for(&server, &[("a", "tok-a")], 50).await;
        run_request(
            shared.clone(),
            HttpMethod::Get,
            "/ping".into(),
            None,
            HeaderMap::new(),
        )
        .await;

        let records = shared.sink.copy().await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].url, format!("{}/ping", server.uri()));
        assert_eq!(records[0].status, 200);
        assert_eq!(&records[0].body[..], br#"{"ok":true}"#);

        let stats = shared.stats.snapshot();
        assert_eq!(stats.ok_requests, 1);
        assert_eq!(stats.non_ok_requests, 0);
        assert_eq!(stats.response_bytes, 11);
    }

    #[tokio::test]
    async fn post_sends_body() {
        let server = MockServer::start().await;
        Mock::given(http_method("POST"))
            .and(path("/submit"))
            .and(wiremock::matchers::body_string("payload=1"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;

        let shared = shared_for(&server, &[("a", "tok-a")], 50).await;
        run_request(
            shared.clone(),
            HttpMethod::Post,
            "/submit".into(),
            Some("payload=1".into()),
            HeaderMap::new(),
        )
        .await;

        assert_eq!(shared.stats.snapshot().ok_requests, 1);
    }

    #[tokio::test]
    async fn rate_limited_then_ok_is_retried() {
        let server = MockServer::start().await;
        Mock::given(http_method("GET"))
            .and(path("/x"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(http_method("GET"))
            .and(path("/x"))
            .respond_with(ResponseTemplate::new(200).set_body_string("late"))
            .expect(1)
            .mount(&server)
            .await;

        let shared = shared_for(&server, &[("a", "tok-a")], 50).await;
        run_request(
            shared.clone(),
            HttpMethod::Get,
            "/x".into(),
            None,
            HeaderMap::new(),
        )
        .await;

        let stats = shared.stats.snapshot();
        assert_eq!(stats.ok_requests, 1);
        assert_eq!(stats.non_ok_requests, 1);
        assert!(stats.retries >= 1);
        assert_eq!(shared.sink.len().await, 1);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let server = MockServer::start().await;
        Mock::given(http_method("GET"))
            .and(path("/never"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        // A larger fleet keeps the 1/N starting backoff short for the test
        let max_retries = 3;
        let fleet: Vec<(&str, &str)> =
            vec![("a", "t"), ("b", "t"), ("c", "t"), ("d", "t"), ("e", "t"), ("f", "t"), ("g", "t"), ("h", "t"), ("i", "t"), ("j", "t")];
        let shared = shared_for(&server, &fleet, max_retries).await;
        run_request(
            shared.clone(),
            HttpMethod::Get,
            "/never".into(),
            None,
            HeaderMap::new(),
        )
        .await;

        // No more than max_retries + 1 send attempts
        let hits = server.received_requests().await.unwrap().len();
        assert_eq!(hits as u32, max_retries + 1);

        let stats = shared.stats.snapshot();
        assert_eq!(stats.ok_requests, 0);
        assert_eq!(stats.non_ok_requests, (max_retries + 1) as u64);
        // Every failed attempt bumps the counter, including the one that
        // trips the cap
        assert_eq!(stats.retries, (max_retries + 1) as u64);
        assert!(shared.sink.is_empty().await);
    }

    #[tokio::test]
    async fn backoff_grows_by_the_delay_factor() {
        let server = MockServer::start().await;
        Mock::given(http_method("GET"))
            .and(path("/slow"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;

        // 10 apps -> 100ms starting delay; factor 2 -> sleeps of 100ms and
        // 200ms before the third (final) attempt.
        let fleet: Vec<(&str, &str)> =
            vec![("a", "t"), ("b", "t"), ("c", "t"), ("d", "t"), ("e", "t"), ("f", "t"), ("g", "t"), ("h", "t"), ("i", "t"), ("j", "t")];
        let mut config = HydraConfig::default();
        config.api_base = server.uri();
        config.max_retries = 2;
        config.retry_delay_factor = 2.0;
        config.request_timeout_secs = 5;
        let store = AppStore::empty("unused.json".into());
        for (id, token) in &fleet {
            store.insert(id.to_string(), fresh_app(token)).await;
        }
        let shared = Arc::new(Shared::new(config, store).unwrap());

        let start = std::time::Instant::now();
        run_request(
            shared.clone(),
            HttpMethod::Get,
            "/slow".into(),
            None,
            HeaderMap::new(),
        )
        .await;
        let elapsed = start.elapsed();

        assert_eq!(server.received_requests().await.unwrap().len(), 3);
        assert!(
            elapsed >= Duration::from_millis(300),
            "backoff must accumulate 100ms + 200ms, elapsed {elapsed:?}"
        );
    }

    #[tokio::test]
    async fn persistent_404_returns_early() {
        let server = MockServer::start().await;
        Mock::given(http_method("GET"))
            .and(path("/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let fleet: Vec<(&str, &str)> =
            vec![("a", "t"), ("b", "t"), ("c", "t"), ("d", "t"), ("e", "t"), ("f", "t"), ("g", "t"), ("h", "t"), ("i", "t"), ("j", "t")];
        let shared = shared_for(&server, &fleet, 50).await;
        run_request(
            shared.clone(),
            HttpMethod::Get,
            "/gone".into(),
            None,
            HeaderMap::new(),
        )
        .await;

        // Attempts with retries = 0..=6; the check fires once retries > 5
        let hits = server.received_requests().await.unwrap().len();
        assert_eq!(hits, 7);
        assert!(shared.sink.is_empty().await);
    }

    #[tokio::test]
    async fn transport_error_is_retried_as_failure() {
        // Point the worker at a closed port: every attempt dies in transport.
        let server = MockServer::start().await;
        let shared = shared_for(&server, &[("a", "t"), ("b", "t"), ("c", "t"), ("d", "t")], 1).await;

        run_request(
            shared.clone(),
            HttpMethod::Get,
            "http://127.0.0.1:1/unreachable".into(),
            None,
            HeaderMap::new(),
        )
        .await;

        let stats = shared.stats.snapshot();
        assert_eq!(stats.ok_requests, 0);
        assert_eq!(stats.non_ok_requests, 2);
        assert_eq!(stats.retries, 2);
    }

    #[tokio::test]
    async fn each_attempt_repicks_a_credential() {
        let server = MockServer::start().await;
        Mock::given(http_method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(http_method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let shared = shared_for(&server, &[("a", "tok-a"), ("b", "tok-b")], 50).await;
        run_request(
            shared.clone(),
            HttpMethod::Get,
            "/flaky".into(),
            None,
            HeaderMap::new(),
        )
        .await;

        let requests = server.received_requests().await.unwrap();
        let tokens: Vec<String> = requests
            .iter()
            .map(|r| {
                r.headers
                    .get("authorization")
                    .unwrap()
                    .to_str()
                    .unwrap()
                    .to_string()
            })
            .collect();
        assert_eq!(tokens, vec!["Bearer tok-a", "Bearer tok-b"]);
    }

    #[tokio::test]
    async fn absolute_urls_skip_base_prefix() {
        let server = MockServer::start().await;
        Mock::given(http_method("GET"))
            .and(path("/absolute"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .expect(1)
            .mount(&server)
            .await;

        let shared = shared_for(&server, &[("a", "tok-a")], 50).await;
        let url = format!("{}/absolute", server.uri());
        run_request(shared.clone(), HttpMethod::Get, url.clone(), None, HeaderMap::new()).await;

        let records = shared.sink.copy().await;
        assert_eq!(records[0].url, url);
    }

    #[tokio::test]
    async fn in_flight_guard_tracks_count() {
        let server = MockServer::start().await;
        let shared = shared_for(&server, &[("a", "tok-a")], 50).await;

        assert_eq!(shared.in_flight.load(Ordering::SeqCst), 0);
        let guard = InFlightGuard::acquire(shared.clone());
        assert_eq!(shared.in_flight.load(Ordering::SeqCst), 1);
        drop(guard);
        assert_eq!(shared.in_flight.load(Ordering::SeqCst), 0);
    }
}
