//! Credential storage for the app fleet
//!
//! Manages the JSON file mapping app ids to app records. The in-memory map
//! preserves insertion order, which drives round-robin fairness; on disk the
//! keys are sorted and pretty-printed. All writes use atomic temp-file +
//! rename to prevent corruption on crash. A tokio Mutex guards the map;
//! critical sections are short and hand out clones.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::record::AppRecord;

/// Thread-safe app credential store.
pub struct AppStore {
    path: PathBuf,
    state: Mutex<IndexMap<String, AppRecord>>,
}

impl AppStore {
    /// Load the fleet from the given file path.
    ///
    /// A missing file is a cold start: logged as a warning, empty fleet.
    /// Malformed JSON is logged as an error and also yields an empty fleet,
    /// leaving the file on disk untouched for inspection.
    pub async fn load(path: PathBuf) -> Self {
        debug!(path = %path.display(), "deserializing app credentials");
        let state = match tokio::fs::read_to_string(&path).await {
            Ok(contents) => match serde_json::from_str::<IndexMap<String, AppRecord>>(&contents) {
                Ok(apps) => {
                    info!(path = %path.display(), apps = apps.len(), "loaded app credentials");
                    apps
                }
                Err(e) => {
                    error!(path = %path.display(), error = %e, "could not deserialize app credentials");
                    IndexMap::new()
                }
            },
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not open credentials file, starting with empty fleet");
                IndexMap::new()
            }
        };
        Self {
            path,
            state: Mutex::new(state),
        }
    }

    /// An empty store that will persist to `path`.
    pub fn empty(path: PathBuf) -> Self {
        Self {
            path,
            state: Mutex::new(IndexMap::new()),
        }
    }

    /// Persist the current in-memory state to its file.
    ///
    /// Keys are sorted, output is pretty-printed UTF-8. On failure the
    /// in-memory fleet is dumped into the log as a last-resort record.
    pub async fn save(&self) -> Result<()> {
        let state = self.state.lock().await;
        warn!(path = %self.path.display(), "serializing app credentials");
        if let Err(e) = write_atomic(&self.path, &state).await {
            error!(fatal = true, path = %self.path.display(), error = %e, "could not serialize app credentials");
            error!(fatal = true, "dump of the app fleet follows");
            error!(fatal = true, dump = %dump_fleet(&state));
            return Err(e);
        }
        Ok(())
    }

    /// Get a clone of a specific record.
    pub async fn get(&self, app_id: &str) -> Option<AppRecord> {
        let state = self.state.lock().await;
        state.get(app_id).cloned()
    }

    /// The record at a rotation index, wrapping around the fleet.
    ///
    /// Index and length are resolved under one lock acquisition, so a pick
    /// stays valid while apps are added or removed concurrently.
    pub async fn nth(&self, idx: usize) -> Option<(String, AppRecord)> {
        let state = self.state.lock().await;
        if state.is_empty() {
            return None;
        }
        state
            .get_index(idx % state.len())
            .map(|(id, record)| (id.clone(), record.clone()))
    }

    /// All app ids in insertion order.
    pub async fn ids(&self) -> Vec<String> {
        let state = self.state.lock().await;
        state.keys().cloned().collect()
    }

    /// A clone of the whole fleet, insertion order preserved.
    pub async fn snapshot(&self) -> IndexMap<String, AppRecord> {
        let state = self.state.lock().await;
        state.clone()
    }

    /// Add or replace a record.
    pub async fn insert(&self, app_id: String, record: AppRecord) {
        let mut state = self.state.lock().await;
        debug!(app_id, "inserting app record");
        state.insert(app_id, record);
    }

    /// Remove a record, preserving the order of the remaining fleet.
    pub async fn remove(&self, app_id: &str) -> Option<AppRecord> {
        let mut state = self.state.lock().await;
        let removed = state.shift_remove(app_id);
        if removed.is_some() {
            debug!(app_id, "removed app record");
        }
        removed
    }

    /// Replace the entire fleet (used by the full console update).
    pub async fn replace_all(&self, apps: IndexMap<String, AppRecord>) {
        let mut state = self.state.lock().await;
        info!(apps = apps.len(), "replacing app fleet");
        *state = apps;
    }

    /// Store a refreshed token for an existing app.
    pub async fn update_token(
        &self,
        app_id: &str,
        access_token: String,
        token_expires_at: i64,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let record = state
            .get_mut(app_id)
            .ok_or_else(|| Error::NotFound(format!("app {app_id} not in store")))?;
        record.access_token = access_token;
        record.token_expires_at = token_expires_at;
        debug!(app_id, "updated token");
        Ok(())
    }

    /// Number of apps in the fleet.
    pub async fn len(&self) -> usize {
        let state = self.state.lock().await;
        state.len()
    }

    /// Whether the fleet is empty.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// The file this store persists to.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Render the fleet as JSON for the save-failure log dump, falling back to
/// the Debug representation if even that fails.
fn dump_fleet(state: &IndexMap<String, AppRecord>) -> String {
    serde_json::to_string(state).unwrap_or_else(|_| format!("{state:?}"))
}

/// Write the fleet to a file atomically, keys sorted, pretty-printed.
///
/// Writes to a temporary file in the same directory, then renames it over
/// the target. File permissions are set to 0600 since the file contains
/// client secrets and bearer tokens.
async fn write_atomic(path: &Path, state: &IndexMap<String, AppRecord>) -> Result<()> {
    let sorted: BTreeMap<&String, &AppRecord> = state.iter().collect();
    let json = serde_json::to_string_pretty(&sorted)
        .map_err(|e| Error::Parse(format!("serializing app credentials: {e}")))?;

    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    let tmp_path = dir.join(format!(".apps.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp credentials file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting credentials file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp credentials file: {e}")))?;

    debug!(path = %path.display(), "persisted app credentials");
    Ok(())
}
