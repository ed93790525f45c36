//! Command history, one JSON object per line.
//!
//! Recording is fire-and-forget: the router hands a record to a bounded
//! channel and moves on. A blocking writer task owns the file. A full
//! channel or a failed write is logged and the record dropped; neither
//! ever reaches the client.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::pipeline::Verdict;

const CHANNEL_CAPACITY: usize = 1024;

/// Immutable record of one handled request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub session_id: String,
    /// Command text that was validated, if the request got that far
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict: Option<Verdict>,
    /// Outcome kind tag, e.g. `"success"` or `"blocked"`
    pub outcome: String,
    /// When the request arrived
    pub timestamp: DateTime<Utc>,
    /// Time from arrival to outcome
    #[serde(default)]
    pub latency_ms: u64,
}

pub trait HistorySink: Send + Sync {
    /// Queues `record` for storage. Never blocks and never fails.
    fn record(&self, record: HistoryRecord);

    /// Newest `limit` records of `session_id`, oldest first.
    fn recent(&self, session_id: &str, limit: usize) -> Result<Vec<HistoryRecord>>;
}

enum WriterMsg {
    Record(HistoryRecord),
    Flush(oneshot::Sender<()>),
}

/// Append-only JSONL history file.
pub struct JsonlHistory {
    path: PathBuf,
    tx: mpsc::Sender<WriterMsg>,
}

impl JsonlHistory {
    /// Opens (creating parent directories) and starts the writer task.
    /// Must be called from within a tokio runtime.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        // Fail at startup rather than on the first record
        OpenOptions::new().create(true).append(true).open(&path)?;

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let writer_path = path.clone();
        tokio::task::spawn_blocking(move || write_loop(&writer_path, rx));

        Ok(Self { path, tx })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Waits until every record queued before this call has been written.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(WriterMsg::Flush(done_tx)).await.is_ok() {
            let _ = done_rx.await;
        }
    }
}

impl HistorySink for JsonlHistory {
    fn record(&self, record: HistoryRecord) {
        if let Err(e) = self.tx.try_send(WriterMsg::Record(record)) {
            warn!("Dropping history record: {e}");
        }
    }

    fn recent(&self, session_id: &str, limit: usize) -> Result<Vec<HistoryRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path)?;
        let records: Vec<HistoryRecord> = content
            .lines()
            .filter_map(|line| serde_json::from_str::<HistoryRecord>(line).ok())
            .filter(|r| r.session_id == session_id)
            .collect();

        let start = records.len().saturating_sub(limit);
        Ok(records[start..].to_vec())
    }
}

fn write_loop(path: &Path, mut rx: mpsc::Receiver<WriterMsg>) {
    while let Some(msg) = rx.blocking_recv() {
        match msg {
            WriterMsg::Record(record) => {
                if let Err(e) = append(path, &record) {
                    warn!("Failed to write history record to {}: {e}", path.display());
                }
            }
            WriterMsg::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("History writer stopped");
}

fn append(path: &Path, record: &HistoryRecord) -> Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    let json = serde_json::to_string(record)?;
    writeln!(file, "{json}")?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(session: &str, outcome: &str) -> HistoryRecord {
        HistoryRecord {
            session_id: session.to_string(),
            candidate_text: Some("ls".to_string()),
            verdict: Some(Verdict::allow()),
            outcome: outcome.to_string(),
            timestamp: Utc::now(),
            latency_ms: 3,
        }
    }

    #[tokio::test]
    async fn test_open_creates_parent_dirs() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("data").join("history.jsonl");
        let history = JsonlHistory::open(&path).unwrap();
        assert!(history.path().exists());
    }

    #[tokio::test]
    async fn test_record_and_recent() {
        let tmp = tempfile::TempDir::new().unwrap();
        let history = JsonlHistory::open(tmp.path().join("history.jsonl")).unwrap();

        history.record(record("s1", "success"));
        history.record(record("s2", "blocked"));
        history.record(record("s1", "runtime_failure"));
        history.record(record("s1", "rate_limited"));
        history.flush().await;

        let recent = history.recent("s1", 2).unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].outcome, "runtime_failure");
        assert_eq!(recent[1].outcome, "rate_limited");

        assert_eq!(history.recent("s2", 10).unwrap().len(), 1);
        assert!(history.recent("nobody", 10).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_lines_are_skipped() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("history.jsonl");
        fs::write(&path, "not json\n{\"partial\":true}\n").unwrap();

        let history = JsonlHistory::open(&path).unwrap();
        history.record(record("s1", "success"));
        history.flush().await;

        let recent = history.recent("s1", 10).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].outcome, "success");
    }

    #[test]
    fn test_records_without_latency_still_parse() {
        let line = r#"{"session_id":"s","outcome":"success","timestamp":"2026-01-05T10:00:00Z"}"#;
        let r: HistoryRecord = serde_json::from_str(line).unwrap();
        assert_eq!(r.latency_ms, 0);
        assert_eq!(r.outcome, "success");
    }

    #[test]
    fn test_record_serialization_omits_missing_fields() {
        let r = HistoryRecord {
            session_id: "s".to_string(),
            candidate_text: None,
            verdict: None,
            outcome: "empty_command".to_string(),
            timestamp: Utc::now(),
            latency_ms: 0,
        };
        let json = serde_json::to_value(&r).unwrap();
        assert!(json.get("candidate_text").is_none());
        assert!(json.get("verdict").is_none());
        assert_eq!(json["outcome"], "empty_command");
    }
}
