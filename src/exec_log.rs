use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::{io::AsyncWriteExt, sync::Mutex};
use uuid::Uuid;

use crate::metrics::RunStatus;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionEvent {
    pub exec_id: Uuid,
    pub language: String,
    pub status: RunStatus,
    pub duration: f64,
    pub timestamp: DateTime<Utc>,
}

/// Append-only JSON-lines log of finished executions, one file per UTC day.
pub struct ExecutionLog {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl ExecutionLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path_for(&self, timestamp: &DateTime<Utc>) -> PathBuf {
        self.dir
            .join(format!("{}.log", timestamp.format("%Y-%m-%d")))
    }

    pub async fn record(&self, event: &ExecutionEvent) -> std::io::Result<()> {
        let mut line = serde_json::to_string(event)?;
        line.push('\n');
        let path = self.path_for(&event.timestamp);

        let _guard = self.write_lock.lock().await;
        tokio::fs::create_dir_all(&self.dir).await?;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await
    }
}
