//! Response sink and batch serialization
//!
//! Completed responses land here in completion order, not submission order.
//! The sink is drained by the caller or checkpointed to disk when it grows
//! past the configured threshold. Serialization is paranoid about losing
//! data: the primary path falls back to tmpfs, and a JSON failure falls back
//! to the raw textual representation.

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{error, info, warn};

use crate::error::{Error, Result};

/// Fallback template used when the primary response path is unwritable.
const TMPFS_FALLBACK_TEMPLATE: &str = "/tmp/.responses_{part}_{ts}.json";

/// One completed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseRecord {
    pub url: String,
    pub status: u16,
    pub body: Bytes,
}

/// Append-only collection of completed responses.
#[derive(Debug, Default)]
pub struct ResponseSink {
    records: Mutex<Vec<ResponseRecord>>,
}

impl ResponseSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically append one record.
    pub async fn append(&self, record: ResponseRecord) {
        let mut records = self.records.lock().await;
        records.push(record);
    }

    /// Atomically truncate to empty.
    pub async fn clear(&self) {
        info!("clearing responses");
        let mut records = self.records.lock().await;
        records.clear();
    }

    pub async fn len(&self) -> usize {
        let records = self.records.lock().await;
        records.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// The live record list. A later `clear()` empties the same list, so
    /// callers wanting to keep the data use `copy()` instead.
    pub async fn live(&self) -> MutexGuard<'_, Vec<ResponseRecord>> {
        self.records.lock().await
    }

    /// A deep copy of the record list.
    pub async fn copy(&self) -> Vec<ResponseRecord> {
        let records = self.records.lock().await;
        records.clone()
    }

    /// Bodies decoded as JSON. Records whose body does not decode are
    /// dropped with a warning.
    pub async fn as_json(&self) -> Vec<(String, serde_json::Value)> {
        let records = self.records.lock().await;
        let mut decoded = Vec::with_capacity(records.len());
        for record in records.iter() {
            match serde_json::from_slice::<serde_json::Value>(&record.body) {
                Ok(value) => decoded.push((record.url.clone(), value)),
                Err(e) => {
                    warn!(url = %record.url, error = %e, "data loss: could not deserialize response body");
                }
            }
        }
        decoded
    }
}

/// Substitute `{part}` and `{ts}` into a response file template.
///
/// A template with neither placeholder falls back to a timestamped default
/// name, so a misconfigured template never collapses every batch onto one
/// file.
pub fn substitute_template(template: &str, part: u32, ts: u64) -> String {
    if template.contains("{part}") || template.contains("{ts}") {
        template
            .replace("{part}", &part.to_string())
            .replace("{ts}", &ts.to_string())
    } else {
        format!("./.responses_{ts}.json")
    }
}

fn unix_ts() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Serialize records to disk as a JSON array of `[url, body]` pairs.
///
/// Bodies are decoded as UTF-8 lossily so binary garbage cannot abort a
/// batch. On an I/O failure the batch is retried on tmpfs; if JSON
/// serialization itself fails, the raw textual representation is written
/// instead. Every failing step logs at the highest severity.
pub async fn serialize_records(
    records: &[ResponseRecord],
    template: &str,
    part: u32,
) -> Result<PathBuf> {
    let rows: Vec<(String, String)> = records
        .iter()
        .map(|r| (r.url.clone(), String::from_utf8_lossy(&r.body).into_owned()))
        .collect();
    let ts = unix_ts();
    let file_name = substitute_template(template, part, ts);

    let json = match serde_json::to_string_pretty(&rows) {
        Ok(json) => json,
        Err(e) => {
            error!(fatal = true, error = %e, "could not serialize responses, trying raw representation");
            let raw_name = format!("{file_name}.py");
            return match tokio::fs::write(&raw_name, format!("{rows:?}")).await {
                Ok(()) => {
                    info!(path = %raw_name, "serialized responses as raw representation");
                    Ok(PathBuf::from(raw_name))
                }
                Err(e) => {
                    error!(fatal = true, error = %e, "could not write raw representation, all response data is now lost");
                    Err(Error::Serialize(format!("raw fallback failed: {e}")))
                }
            };
        }
    };

    match tokio::fs::write(&file_name, json.as_bytes()).await {
        Ok(()) => {
            warn!(path = %file_name, records = rows.len(), "serialized responses");
            return Ok(PathBuf::from(file_name));
        }
        Err(e) => {
            error!(fatal = true, path = %file_name, error = %e, "could not write responses, trying tmpfs");
        }
    }

    let fallback = substitute_template(TMPFS_FALLBACK_TEMPLATE, part, ts);
    match tokio::fs::write(&fallback, json.as_bytes()).await {
        Ok(()) => {
            info!(path = %fallback, records = rows.len(), "serialized responses to tmpfs");
            Ok(PathBuf::from(fallback))
        }
        Err(e) => {
            error!(fatal = true, path = %fallback, error = %e, "could not write responses, all response data is now lost");
            Err(Error::Serialize(format!("tmpfs fallback failed: {e}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(url: &str, body: &str) -> ResponseRecord {
        ResponseRecord {
            url: url.to_string(),
            status: 200,
            body: Bytes::copy_from_slice(body.as_bytes()),
        }
    }

    #[tokio::test]
    async fn append_then_clear() {
        let sink = ResponseSink::new();
        sink.append(record("/a", "one")).await;
        sink.append(record("/b", "two")).await;
        assert_eq!(sink.len().await, 2);

        sink.clear().await;
        assert!(sink.is_empty().await);
    }

    #[tokio::test]
    async fn copy_is_independent_of_clear() {
        let sink = ResponseSink::new();
        sink.append(record("/a", "one")).await;

        let copied = sink.copy().await;
        sink.clear().await;

        assert_eq!(copied.len(), 1);
        assert_eq!(copied[0].url, "/a");
        assert!(sink.is_empty().await);
    }

    #[tokio::test]
    async fn as_json_drops_undecodable_bodies() {
        let sink = ResponseSink::new();
        sink.append(record("/good", r#"{"ok":true}"#)).await;
        sink.append(record("/bad", "<html>not json</html>")).await;
        sink.append(record("/also-good", "[1,2,3]")).await;

        let decoded = sink.as_json().await;
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].0, "/good");
        assert_eq!(decoded[0].1, serde_json::json!({"ok": true}));
        assert_eq!(decoded[1].0, "/also-good");
    }

    #[test]
    fn template_substitutes_part_and_ts() {
        let name = substitute_template("./out_{part}_{ts}.json", 3, 1700000000);
        assert_eq!(name, "./out_3_1700000000.json");
    }

    #[test]
    fn template_without_placeholders_falls_back() {
        let name = substitute_template("./fixed-name.json", 3, 1700000000);
        assert_eq!(name, "./.responses_1700000000.json");
    }

    #[test]
    fn template_with_only_part_still_substitutes() {
        let name = substitute_template("./out_{part}.json", 2, 1);
        assert_eq!(name, "./out_2.json");
    }

    #[tokio::test]
    async fn serialize_writes_url_body_pairs() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir
            .path()
            .join("responses_{part}_{ts}.json")
            .to_string_lossy()
            .into_owned();

        let records = vec![
            record("https://x/1", r#"{"n":1}"#),
            record("https://x/2", r#"{"n":2}"#),
        ];
        let path = serialize_records(&records, &template, 1).await.unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let rows: Vec<(String, String)> = serde_json::from_str(&contents).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], ("https://x/1".to_string(), r#"{"n":1}"#.to_string()));
        assert_eq!(rows[1].0, "https://x/2");
    }

    #[tokio::test]
    async fn serialize_decodes_bodies_lossily() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir
            .path()
            .join("responses_{part}_{ts}.json")
            .to_string_lossy()
            .into_owned();

        let records = vec![ResponseRecord {
            url: "https://x/bin".into(),
            status: 200,
            body: Bytes::from_static(&[0xff, 0xfe, b'o', b'k']),
        }];
        let path = serialize_records(&records, &template, 1).await.unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let rows: Vec<(String, String)> = serde_json::from_str(&contents).unwrap();
        assert!(rows[0].1.contains("ok"));
    }

    #[tokio::test]
    async fn serialize_falls_back_to_tmpfs_on_io_error() {
        let records = vec![record("https://x/1", "body")];
        let template = "/nonexistent-dir/responses_{part}_{ts}.json";

        let path = serialize_records(&records, template, 9).await.unwrap();
        assert!(path.starts_with("/tmp"));
        assert!(path.exists());

        tokio::fs::remove_file(&path).await.unwrap();
    }
}
