//! Audit sink that appends JSON lines to a file.
//!
//! Each line is one [`AuditFact`]. The file is only ever appended to. Writes
//! are serialized through a `tokio::sync::Mutex` around the file handle.

use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, MutexGuard};

use crate::audit::{AuditFact, AuditSink};
use crate::error::AuditError;

pub struct FileAuditSink {
    path: PathBuf,
    writer: Mutex<Option<File>>,
}

impl FileAuditSink {
    /// The file is created (or opened for appending) on the first write.
    #[must_use]
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            writer: Mutex::new(None),
        }
    }

    fn failure(&self, reason: String) -> AuditError {
        AuditError::SinkFailure {
            name: self.name().to_owned(),
            reason,
        }
    }

    async fn writer(&self) -> Result<MutexGuard<'_, Option<File>>, AuditError> {
        let mut guard = self.writer.lock().await;
        if guard.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await
                .map_err(|e| {
                    self.failure(format!("cannot open {}: {e}", self.path.display()))
                })?;
            *guard = Some(file);
        }
        Ok(guard)
    }
}

#[async_trait::async_trait]
impl AuditSink for FileAuditSink {
    #[allow(clippy::unnecessary_literal_bound)]
    fn name(&self) -> &str {
        "file"
    }

    async fn log(&self, fact: &AuditFact) -> Result<(), AuditError> {
        let mut line = serde_json::to_vec(fact)?;
        line.push(b'\n');

        let mut guard = self.writer().await?;
        let file = guard
            .as_mut()
            .ok_or_else(|| self.failure("file handle missing after open".to_owned()))?;
        file.write_all(&line)
            .await
            .map_err(|e| self.failure(format!("write failed: {e}")))?;
        file.flush()
            .await
            .map_err(|e| self.failure(format!("flush failed: {e}")))?;
        Ok(())
    }
}

impl std::fmt::Debug for FileAuditSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileAuditSink")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::audit::tests::sample_fact;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("limes-audit-{}-{name}.jsonl", std::process::id()))
    }

    #[tokio::test]
    async fn appends_one_line_per_fact() {
        let path = temp_path("append");
        let _ = tokio::fs::remove_file(&path).await;

        let sink = FileAuditSink::new(&path);
        sink.log(&sample_fact()).await.unwrap();
        sink.log(&sample_fact()).await.unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        let parsed: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(parsed["initiator"]["user_name"], "alice");

        tokio::fs::remove_file(&path).await.unwrap();
    }

    #[tokio::test]
    async fn unopenable_path_is_a_sink_failure() {
        let sink = FileAuditSink::new("/nonexistent-dir/limes/audit.jsonl");
        let result = sink.log(&sample_fact()).await;
        assert!(matches!(result, Err(AuditError::SinkFailure { .. })));
    }
}
