//! Consent-gated event recording.
//!
//! When the session allows recording and a spool directory is configured,
//! client and server events are appended as JSONL. Inbound audio is never
//! written; the anonymized sample-count event stands in for it.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

pub struct EventRecorder {
    file: Mutex<File>,
}

impl EventRecorder {
    pub async fn create(directory: &Path, session_id: &str) -> std::io::Result<Self> {
        tokio::fs::create_dir_all(directory).await?;
        let path = directory.join(format!("{session_id}.jsonl"));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(EventRecorder {
            file: Mutex::new(file),
        })
    }

    /// Append one event. `origin` is "client" or "server". Write failures
    /// are logged and swallowed: recording must never take a session down.
    pub async fn record(&self, origin: &str, event: &serde_json::Value) {
        let time = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);
        let line = serde_json::json!({
            "time": time,
            "origin": origin,
            "event": event,
        });

        let mut file = self.file.lock().await;
        let mut bytes = line.to_string().into_bytes();
        bytes.push(b'\n');
        if let Err(e) = file.write_all(&bytes).await {
            warn!(error = %e, "Failed to record event");
        }
    }
}
