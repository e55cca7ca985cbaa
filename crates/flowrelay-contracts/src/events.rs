use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Context;
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::protocol::ClientEvent;

/// JSONL transcript of every event sent to clients, one row per line.
///
/// The file is opened once in append mode and shared between connections;
/// each row is written and flushed under the handle's lock.
#[derive(Debug, Clone)]
pub struct TranscriptWriter {
    path: Arc<PathBuf>,
    file: Arc<Mutex<File>>,
}

#[derive(Serialize)]
struct TranscriptRow<'a> {
    #[serde(rename = "type")]
    event: &'a str,
    session_id: &'a str,
    ts: String,
    data: Value,
}

impl TranscriptWriter {
    pub fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open transcript {}", path.display()))?;
        Ok(Self {
            path: Arc::new(path),
            file: Arc::new(Mutex::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one row and returns it as written.
    pub fn record(&self, session_id: &str, event: &ClientEvent) -> anyhow::Result<Value> {
        let row = TranscriptRow {
            event: event.name(),
            session_id,
            ts: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            data: event.data(),
        };
        let mut line = serde_json::to_vec(&row)?;
        line.push(b'\n');

        let mut file = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        file.write_all(&line)
            .and_then(|()| file.flush())
            .with_context(|| format!("failed to append to {}", self.path.display()))?;
        Ok(serde_json::to_value(&row)?)
    }
}
