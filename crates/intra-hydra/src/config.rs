//! Engine configuration
//!
//! Every knob has a serde default, so an empty TOML file (or `Default`)
//! yields a working configuration pointed at the real intra API. Tests and
//! the driver override what they need.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use intra_auth::constants::{API_BASE, TOKEN_ENDPOINT};

/// Engine configuration.
///
/// `log_level` and `log_file` are carried here so one file configures the
/// whole program, but they are applied by the driver's subscriber setup, not
/// by the engine.
#[derive(Debug, Clone, Deserialize)]
pub struct HydraConfig {
    /// URL prefix prepended to leading-slash request paths
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// OAuth token endpoint for the client-credentials grant
    #[serde(default = "default_token_endpoint")]
    pub token_endpoint: String,
    /// Subscriber threshold in env-filter syntax (driver-side)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log destination; stdout when absent (driver-side)
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    /// Emit the shutdown statistics summary at INFO instead of DEBUG
    #[serde(default)]
    pub stats: bool,
    /// Per-request retry cap
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Aggregate request-rate target across the whole fleet
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: f64,
    /// Floor between consecutive submissions, in seconds
    #[serde(default = "default_min_request_delay")]
    pub min_request_delay: f64,
    /// Backoff multiplier applied on each failed attempt
    #[serde(default = "default_retry_delay_factor")]
    pub retry_delay_factor: f64,
    /// Credential store path
    #[serde(default = "default_apps_file")]
    pub apps_file: PathBuf,
    /// Response batch file pattern; `{part}` and `{ts}` are substituted
    #[serde(default = "default_responses_template")]
    pub responses_file_path_template: String,
    /// Sink length that triggers a checkpoint at admission
    #[serde(default = "default_checkpoint_threshold")]
    pub checkpoint_threshold: usize,
    /// Emergency-stop marker path, checked at every admission
    #[serde(default = "default_stop_file")]
    pub stop_file: PathBuf,
    /// Per-request timeout handed to the HTTP client, in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_api_base() -> String {
    API_BASE.to_string()
}

fn default_token_endpoint() -> String {
    TOKEN_ENDPOINT.to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_retries() -> u32 {
    50
}

fn default_requests_per_second() -> f64 {
    1.0 / 3.0
}

fn default_min_request_delay() -> f64 {
    0.01
}

fn default_retry_delay_factor() -> f64 {
    1.1
}

fn default_apps_file() -> PathBuf {
    PathBuf::from("./apps.json")
}

fn default_responses_template() -> String {
    "./.responses_{part}_{ts}.json".to_string()
}

fn default_checkpoint_threshold() -> usize {
    10_000
}

fn default_stop_file() -> PathBuf {
    PathBuf::from("./SHUTDOWN_HYDRA")
}

fn default_request_timeout_secs() -> u64 {
    60
}

impl Default for HydraConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty config must deserialize from defaults")
    }
}

impl HydraConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_upstream() {
        let config = HydraConfig::default();
        assert_eq!(config.api_base, "https://api.intra.42.fr/v2");
        assert_eq!(config.token_endpoint, "https://api.intra.42.fr/oauth/token");
        assert_eq!(config.max_retries, 50);
        assert!((config.requests_per_second - 1.0 / 3.0).abs() < 1e-9);
        assert!((config.min_request_delay - 0.01).abs() < 1e-9);
        assert!((config.retry_delay_factor - 1.1).abs() < 1e-9);
        assert_eq!(config.apps_file, PathBuf::from("./apps.json"));
        assert_eq!(config.checkpoint_threshold, 10_000);
        assert_eq!(config.stop_file, PathBuf::from("./SHUTDOWN_HYDRA"));
        assert!(!config.stats);
        assert!(config.log_file.is_none());
    }

    #[test]
    fn partial_toml_overrides_some_fields() {
        let config: HydraConfig = toml::from_str(
            r#"
            max_retries = 5
            requests_per_second = 2.0
            apps_file = "/data/apps.json"
            stats = true
            "#,
        )
        .unwrap();
        assert_eq!(config.max_retries, 5);
        assert!((config.requests_per_second - 2.0).abs() < 1e-9);
        assert_eq!(config.apps_file, PathBuf::from("/data/apps.json"));
        assert!(config.stats);
        // Untouched fields keep their defaults
        assert_eq!(config.api_base, "https://api.intra.42.fr/v2");
    }

    #[test]
    fn load_reads_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hydra.toml");
        std::fs::write(&path, "log_level = \"debug\"\nmax_retries = 7\n").unwrap();

        let config = HydraConfig::load(&path).unwrap();
        assert_eq!(config.log_level, "debug");
        assert_eq!(config.max_retries, 7);
    }

    #[test]
    fn load_missing_file_is_io_error() {
        let err = HydraConfig::load(Path::new("/nonexistent/hydra.toml")).unwrap_err();
        assert!(matches!(err, common::Error::Io(_)));
    }
}
