//! Engine supervisor
//!
//! `Hydra` is the single value owning the credential store, the response
//! sink, and the worker handles. Workers receive shared state by `Arc`,
//! never back-pointers to the supervisor. Submission is admission-gated:
//! the emergency-stop file, the refresh barrier, the in-flight cap, and the
//! checkpoint threshold are all checked before a worker is spawned.
//!
//! Shutdown is an explicit, single-shot `close()`; nothing relies on drop
//! order. The emergency-stop path runs the same hook before exiting 42.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use indexmap::IndexMap;
use reqwest::header::HeaderMap;
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, warn};
use uuid::Uuid;

use intra_auth::{AppRecord, AppStore, unix_now};
use intra_console::{AppMeta, ConsoleClient};

use crate::config::HydraConfig;
use crate::dispatch::Dispatcher;
use crate::error::{Error, Result};
use crate::pacer::Pacer;
use crate::refresh::refresh_fleet;
use crate::shape::{AuthShaper, BearerShaper};
use crate::sink::{ResponseRecord, ResponseSink, serialize_records};
use crate::stats::{EngineStats, StatsSnapshot};
use crate::worker::{HttpMethod, InFlightGuard, REFRESH_POLL, run_request};

/// State shared between the supervisor and every worker.
pub(crate) struct Shared {
    pub(crate) config: HydraConfig,
    pub(crate) client: reqwest::Client,
    pub(crate) store: AppStore,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) sink: ResponseSink,
    pub(crate) stats: EngineStats,
    pub(crate) pacer: Pacer,
    pub(crate) shaper: Box<dyn AuthShaper>,
    /// Set for the duration of a full-fleet token refresh. Submission and
    /// pick paths park on it.
    pub(crate) refreshing: AtomicBool,
    /// Serializes fleet mutations (update, refresh, create, delete).
    pub(crate) fleet_ops: Mutex<()>,
    pub(crate) in_flight: AtomicUsize,
}

impl Shared {
    pub(crate) fn new(config: HydraConfig, store: AppStore) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| Error::Client(e.to_string()))?;
        let pacer = Pacer::new(
            config.requests_per_second,
            Duration::from_secs_f64(config.min_request_delay),
        );
        Ok(Self {
            config,
            client,
            store,
            dispatcher: Dispatcher::new(),
            sink: ResponseSink::new(),
            stats: EngineStats::new(),
            pacer,
            shaper: Box::new(BearerShaper),
            refreshing: AtomicBool::new(false),
            fleet_ops: Mutex::new(()),
            in_flight: AtomicUsize::new(0),
        })
    }

    /// Refresh every app's token behind the barrier. Caller must hold the
    /// fleet-ops lock.
    pub(crate) async fn refresh_locked(&self) {
        self.refreshing.store(true, Ordering::Release);
        refresh_fleet(&self.store, &self.client, &self.config.token_endpoint).await;
        self.refreshing.store(false, Ordering::Release);
    }

    pub(crate) async fn refresh_tokens(&self) {
        let _ops = self.fleet_ops.lock().await;
        self.refresh_locked().await;
    }

    /// Refresh triggered by a worker that picked an expired app. Re-checks
    /// under the lock so concurrent pickers don't stampede the token
    /// endpoint.
    pub(crate) async fn refresh_if_expired(&self, app_id: &str) {
        let _ops = self.fleet_ops.lock().await;
        let still_expired = self
            .store
            .get(app_id)
            .await
            .map(|app| app.token_expired(unix_now()))
            .unwrap_or(false);
        if still_expired {
            self.refresh_locked().await;
        }
    }
}

/// The request multiplexing engine: one head per credential.
pub struct Hydra {
    shared: Arc<Shared>,
    console: Option<Arc<dyn ConsoleClient>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    part: AtomicU32,
    serialize_on_close: AtomicBool,
    closed: AtomicBool,
    /// Whether a full console scrape has run this session. Usage queries
    /// read stale metadata until it has.
    updated: AtomicBool,
}

impl Hydra {
    /// Build an engine: raise the fd limit, load the fleet from the apps
    /// file, and set up the HTTP client.
    pub async fn new(config: HydraConfig) -> Result<Self> {
        raise_fd_limit();
        let store = AppStore::load(config.apps_file.clone()).await;
        let shared = Arc::new(Shared::new(config, store)?);
        Ok(Self {
            shared,
            console: None,
            handles: Mutex::new(Vec::new()),
            part: AtomicU32::new(1),
            serialize_on_close: AtomicBool::new(true),
            closed: AtomicBool::new(false),
            updated: AtomicBool::new(false),
        })
    }

    /// Attach the web-console adapter that fleet control operates through.
    pub fn with_console(mut self, console: Arc<dyn ConsoleClient>) -> Self {
        self.console = Some(console);
        self
    }

    pub fn config(&self) -> &HydraConfig {
        &self.shared.config
    }

    /// Enqueue a GET. Non-blocking apart from admission and pacing.
    pub async fn submit_get(
        &self,
        url: impl Into<String>,
        headers: Option<HeaderMap>,
    ) -> Result<()> {
        self.submit(HttpMethod::Get, url.into(), None, headers).await
    }

    /// Enqueue a POST. Non-blocking apart from admission and pacing.
    pub async fn submit_post(
        &self,
        url: impl Into<String>,
        body: Option<String>,
        headers: Option<HeaderMap>,
    ) -> Result<()> {
        self.submit(HttpMethod::Post, url.into(), body, headers).await
    }

    async fn submit(
        &self,
        method: HttpMethod,
        url: String,
        body: Option<String>,
        headers: Option<HeaderMap>,
    ) -> Result<()> {
        if url.is_empty() {
            error!("request submitted without a url");
            return Err(Error::EmptyUrl);
        }
        self.ensure_ready().await;
        let fleet_size = self.shared.store.len().await;
        if fleet_size == 0 {
            error!(%url, "fleet is empty, cannot submit");
            return Err(Error::EmptyFleet);
        }

        self.shared.stats.record_submitted();
        let request_id = Uuid::new_v4();
        debug!(request = %request_id.simple(), %url, ?method, "spawning request worker");

        let permit = InFlightGuard::acquire(self.shared.clone());
        let shared = self.shared.clone();
        let span = tracing::info_span!("request", id = %request_id.simple());
        let handle = tokio::spawn(
            async move {
                let _permit = permit;
                run_request(shared, method, url, body, headers.unwrap_or_default()).await;
            }
            .instrument(span),
        );
        self.handles.lock().await.push(handle);

        self.shared.pacer.pace(fleet_size).await;
        Ok(())
    }

    /// Whether the emergency-stop marker is present on disk.
    pub fn stop_requested(&self) -> bool {
        self.shared.config.stop_file.is_file()
    }

    /// Admission gate run before every submission.
    async fn ensure_ready(&self) {
        if self.stop_requested() {
            error!(
                fatal = true,
                path = %self.shared.config.stop_file.display(),
                "emergency stop file found, finishing up"
            );
            self.join().await;
            self.close().await;
            std::process::exit(42);
        }

        while self.shared.refreshing.load(Ordering::Acquire) {
            tokio::time::sleep(REFRESH_POLL).await;
        }

        let fleet_size = self.shared.store.len().await.max(1);
        let in_flight = self.shared.in_flight.load(Ordering::SeqCst);
        if in_flight > 2 * fleet_size {
            warn!(
                in_flight,
                apps = fleet_size,
                "in-flight workers exceeded twice the fleet size, waiting"
            );
            while self.shared.in_flight.load(Ordering::SeqCst) >= fleet_size {
                tokio::time::sleep(REFRESH_POLL).await;
            }
            warn!(apps = fleet_size, "in-flight workers drained below the fleet size");
        }

        if self.shared.sink.len().await > self.shared.config.checkpoint_threshold {
            self.join().await;
            let part = self.part.fetch_add(1, Ordering::SeqCst);
            let records = self.shared.sink.live().await;
            let _ = serialize_records(
                &records,
                &self.shared.config.responses_file_path_template,
                part,
            )
            .await;
            drop(records);
            self.shared.sink.clear().await;
        }
    }

    /// Wait for every submitted worker to finish, including ones submitted
    /// while joining.
    pub async fn join(&self) {
        info!("joining request workers");
        loop {
            let drained: Vec<JoinHandle<()>> = {
                let mut handles = self.handles.lock().await;
                handles.drain(..).collect()
            };
            if drained.is_empty() {
                break;
            }
            for handle in drained {
                if let Err(e) = handle.await {
                    warn!(error = %e, "request worker panicked");
                }
            }
        }
        info!("all request workers joined");
    }

    /// The live response list. A later `clear_responses()` empties the same
    /// list; use `responses_copy()` to keep the data.
    pub async fn responses(&self) -> MutexGuard<'_, Vec<ResponseRecord>> {
        self.join().await;
        debug!("returning responses (live view)");
        self.shared.sink.live().await
    }

    /// A deep copy of the response list.
    pub async fn responses_copy(&self) -> Vec<ResponseRecord> {
        self.join().await;
        debug!("returning responses (deep copy)");
        self.shared.sink.copy().await
    }

    /// Responses with bodies decoded as JSON; undecodable ones are dropped
    /// with a warning.
    pub async fn responses_as_json(&self) -> Vec<(String, serde_json::Value)> {
        self.join().await;
        debug!("returning responses as json");
        self.shared.sink.as_json().await
    }

    pub async fn clear_responses(&self) {
        self.shared.sink.clear().await;
    }

    /// Serialize the current sink to disk, advancing the part counter.
    /// `template` defaults to the configured pattern.
    pub async fn serialize_responses(&self, template: Option<&str>) -> Result<PathBuf> {
        let template = template
            .map(str::to_owned)
            .unwrap_or_else(|| self.shared.config.responses_file_path_template.clone());
        let part = self.part.fetch_add(1, Ordering::SeqCst);
        let records = self.shared.sink.live().await;
        serialize_records(&records, &template, part).await
    }

    /// Persist the fleet to the apps file.
    pub async fn save_credentials(&self) -> Result<()> {
        self.shared
            .store
            .save()
            .await
            .map_err(|e| Error::Store(e.to_string()))
    }

    /// Refresh every app's access token behind the barrier.
    pub async fn refresh_tokens(&self) {
        self.shared.refresh_tokens().await;
    }

    fn console_for(&self, op: &'static str) -> Result<&Arc<dyn ConsoleClient>> {
        self.console.as_ref().ok_or(Error::NoConsole(op))
    }

    /// Rebuild the fleet from the console: discover ids, scrape each app's
    /// credentials and metadata, then refresh all tokens.
    pub async fn update(&self) -> Result<()> {
        let console = self.console_for("update the fleet")?;
        info!("updating the fleet from the console");
        console.ensure_session().await?;
        let app_ids = console.list_app_ids().await?;
        debug!(apps = app_ids.len(), "discovered app ids");

        let _ops = self.shared.fleet_ops.lock().await;
        let mut fleet = IndexMap::new();
        for (i, app_id) in app_ids.iter().enumerate() {
            if app_id.is_empty() {
                continue;
            }
            info!(app_id, "adding updated app ({}/{})", i + 1, app_ids.len());
            let record = match console.fetch_app_metadata(app_id).await {
                Ok(meta) => record_from_meta(meta),
                Err(e) => {
                    error!(app_id, error = %e, "could not scrape app, keeping empty record");
                    AppRecord::default()
                }
            };
            fleet.insert(app_id.clone(), record);
        }
        self.shared.store.replace_all(fleet).await;
        self.shared.refresh_locked().await;
        self.updated.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Whether `update()` has completed a full console scrape this session.
    pub fn is_updated(&self) -> bool {
        self.updated.load(Ordering::SeqCst)
    }

    /// Register a new app on the console and add it to the fleet. Its first
    /// token is fetched lazily, when a worker first picks it.
    pub async fn create_app(&self) -> Result<String> {
        let console = self.console_for("create an app")?;
        console.ensure_session().await?;
        let name = format!("Hydra_{}", self.shared.store.len().await + 1);
        let app_id = console.create_app(&name).await?;
        let record = match console.fetch_app_metadata(&app_id).await {
            Ok(meta) => record_from_meta(meta),
            Err(e) => {
                error!(app_id, error = %e, "could not scrape created app");
                AppRecord::default()
            }
        };
        let _ops = self.shared.fleet_ops.lock().await;
        self.shared.store.insert(app_id.clone(), record).await;
        info!(app_id, name, "created app");
        Ok(app_id)
    }

    /// Delete an app on the console and drop it from the fleet.
    pub async fn delete_app(&self, app_id: &str) -> Result<()> {
        let console = self.console_for("delete an app")?;
        console.ensure_session().await?;
        console.delete_app(app_id).await?;
        let _ops = self.shared.fleet_ops.lock().await;
        self.shared.store.remove(app_id).await;
        info!(app_id, "deleted app");
        Ok(())
    }

    /// Grow or shrink the fleet to exactly `n` apps (at most 200), then
    /// re-scrape everything.
    pub async fn set_number_of_apps(&self, n: usize) -> Result<()> {
        if n > 200 {
            error!(n, "cannot have more than 200 apps");
            return Err(Error::FleetSize(n));
        }
        self.update().await?;
        let current = self.shared.store.len().await;
        match n.cmp(&current) {
            std::cmp::Ordering::Equal => {
                debug!(n, "fleet already at requested size");
                return Ok(());
            }
            std::cmp::Ordering::Less => {
                let doomed: Vec<String> = self
                    .shared
                    .store
                    .ids()
                    .await
                    .into_iter()
                    .take(current - n)
                    .collect();
                debug!(count = doomed.len(), "deleting apps");
                for app_id in doomed {
                    self.delete_app(&app_id).await?;
                }
            }
            std::cmp::Ordering::Greater => {
                debug!(count = n - current, "creating apps");
                for _ in current..n {
                    self.create_app().await?;
                }
            }
        }
        self.update().await
    }

    /// Fleet size, re-scraping the console first when `update` is set.
    pub async fn get_number_of_apps(&self, update: bool) -> Result<usize> {
        if update {
            self.update().await?;
        }
        Ok(self.shared.store.len().await)
    }

    /// Sum of scraped lifetime request counts across the fleet,
    /// re-scraping the console first when `update` is set.
    pub async fn get_total_number_of_requests(&self, update: bool) -> Result<u64> {
        if update {
            self.update().await?;
        }
        let snapshot = self.shared.store.snapshot().await;
        Ok(snapshot.values().map(|app| app.total_requests).sum())
    }

    /// `(requests left this hour, hourly capacity)` summed over the fleet,
    /// re-scraping the console first when `update` is set.
    pub async fn get_requests_left_this_hour(&self, update: bool) -> Result<(u64, u64)> {
        if update {
            self.update().await?;
        }
        let snapshot = self.shared.store.snapshot().await;
        let mut left = 0u64;
        let mut max = 0u64;
        for app in snapshot.values() {
            left += app.max_requests_per_hour.saturating_sub(app.requests_last_hour);
            max += app.max_requests_per_hour;
        }
        Ok((left, max))
    }

    /// Print the hourly quota summary to stdout, re-scraping the console
    /// first when `update` is set.
    pub async fn print_api_usage(&self, update: bool) -> Result<()> {
        let (left, max) = self.get_requests_left_this_hour(update).await?;
        println!("{left} out of {max} API requests left ({} were made)", max - left);
        Ok(())
    }

    /// Suppress the final response serialization at `close()`.
    pub fn finish(&self) {
        self.serialize_on_close.store(false, Ordering::SeqCst);
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Shutdown hook: join outstanding work, save credentials, serialize
    /// the remaining responses unless `finish()` was called, and emit the
    /// statistics summary. Single-shot and idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.join().await;
        let _ = self.shared.store.save().await;
        if self.serialize_on_close.load(Ordering::SeqCst) {
            let part = self.part.fetch_add(1, Ordering::SeqCst);
            let records = self.shared.sink.live().await;
            let _ = serialize_records(
                &records,
                &self.shared.config.responses_file_path_template,
                part,
            )
            .await;
        }
        self.shared.stats.log_summary(self.shared.config.stats);
    }
}

/// Fold scraped metadata into a record, leaving token state untouched
/// (empty token, unknown expiry) so the first pick triggers a refresh.
fn record_from_meta(meta: AppMeta) -> AppRecord {
    AppRecord {
        uid: meta.uid,
        secret: meta.secret,
        next_secret: meta.next_secret,
        app_name: meta.app_name,
        requests_last_hour: meta.requests_last_hour,
        max_requests_per_hour: meta.max_requests_per_hour,
        max_requests_per_second: meta.max_requests_per_second,
        active_tokens: meta.active_tokens,
        active_users: meta.active_users,
        total_requests: meta.total_requests,
        total_generated_tokens: meta.total_generated_tokens,
        total_unique_users: meta.total_unique_users,
        current_secret_expiry_ts: meta.current_secret_expiry_ts,
        next_secret_expiry_ts: meta.next_secret_expiry_ts,
        redirect_url: meta.redirect_url,
        scopes: meta.scopes,
        ..AppRecord::default()
    }
}

/// Raise the soft limit on open files toward 50 000, clamped by the hard
/// limit, so highly parallel HTTP sockets do not exhaust the process.
#[cfg(unix)]
fn raise_fd_limit() {
    const TARGET: libc::rlim_t = 50_000;
    unsafe {
        let mut limit = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        if libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) != 0 {
            warn!("could not read the open-file limit");
            return;
        }
        let target = if limit.rlim_max == libc::RLIM_INFINITY {
            TARGET
        } else {
            TARGET.min(limit.rlim_max)
        };
        if limit.rlim_cur >= target {
            return;
        }
        limit.rlim_cur = target;
        if libc::setrlimit(libc::RLIMIT_NOFILE, &limit) != 0 {
            warn!(limit = target, "could not raise the open-file limit");
        } else {
            debug!(limit = target, "raised the open-file soft limit");
        }
    }
}

#[cfg(not(unix))]
fn raise_fd_limit() {}
