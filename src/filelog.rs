//! Date-partitioned, human-readable audit trail.
//!
//! Every lifecycle event becomes one line in `<root>/<category>/<category>_YYYY-MM-DD.log`.
//! Each line goes out as one `write_all` on an append-mode handle while an
//! exclusive advisory lock is held on the file, so neither concurrent
//! requests nor other receiver processes sharing the directory interleave lines.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use fs2::FileExt;
use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};
use tokio::sync::Mutex;
use tracing::warn;

pub const LOG_EXTENSION: &str = "log";
pub const RECEIVE_CATEGORY: &str = "receive";
pub const ACK_CATEGORY: &str = "ack";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditEvent {
    Received,
    Unauthorized,
    RateLimited,
    Duplicate,
    MissingSignature,
    BadSignature,
    AckSent,
}

impl AuditEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEvent::Received => "RECEIVED",
            AuditEvent::Unauthorized => "UNAUTHORIZED",
            AuditEvent::RateLimited => "RATE_LIMITED",
            AuditEvent::Duplicate => "DUPLICATE",
            AuditEvent::MissingSignature => "MISSING_SIGNATURE",
            AuditEvent::BadSignature => "BAD_SIGNATURE",
            AuditEvent::AckSent => "ACK_SENT",
        }
    }

    pub fn category(&self) -> &'static str {
        match self {
            AuditEvent::AckSent => ACK_CATEGORY,
            _ => RECEIVE_CATEGORY,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuditLine {
    event: AuditEvent,
    fields: Vec<(&'static str, String)>,
}

impl AuditLine {
    pub fn new(event: AuditEvent) -> Self {
        Self {
            event,
            fields: Vec::new(),
        }
    }

    pub fn field(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.fields.push((key, value.into()));
        self
    }

    pub fn render(&self) -> String {
        let mut out = self.event.as_str().to_string();
        for (key, value) in &self.fields {
            out.push(' ');
            out.push_str(key);
            out.push('=');
            if value.is_empty() || value.chars().any(|c| c.is_whitespace() || c == '"' || c.is_control()) {
                out.push_str(&format!("{:?}", value));
            } else {
                out.push_str(value);
            }
        }
        out
    }
}

pub struct FileLog {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl FileLog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn category_dir(&self, category: &str) -> PathBuf {
        self.root.join(category)
    }

    pub fn file_for(&self, category: &str, date: NaiveDate) -> PathBuf {
        self.category_dir(category)
            .join(format!("{}_{}.{}", category, date.format("%Y-%m-%d"), LOG_EXTENSION))
    }

    pub async fn append(&self, category: &str, line: &str) -> Result<()> {
        self.append_at(category, line, Utc::now()).await
    }

    pub async fn append_at(&self, category: &str, line: &str, at: DateTime<Utc>) -> Result<()> {
        let dir = self.category_dir(category);
        let path = self.file_for(category, at.date_naive());
        let entry = format!("{} {}\n", at.format("%Y-%m-%d %H:%M:%S"), line.trim_end());

        // In-process ordering; the file lock covers other processes.
        let _guard = self.write_lock.lock().await;
        tokio::task::spawn_blocking(move || append_locked(&dir, &path, entry.as_bytes()))
            .await
            .map_err(|e| anyhow!("Log writer task failed: {}", e))?
    }

    /// Best-effort: a failed audit write is reported through tracing only.
    pub async fn record(&self, line: AuditLine) {
        let category = line.event.category();
        if let Err(e) = self.append(category, &line.render()).await {
            warn!("Audit log write failed ({}): {:#}", line.event.as_str(), e);
        }
    }
}

fn append_locked(dir: &Path, path: &Path, entry: &[u8]) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("Failed to create log dir {}", dir.display()))?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open log file {}", path.display()))?;
    file.lock_exclusive()
        .with_context(|| format!("Failed to lock log file {}", path.display()))?;
    let written = file
        .write_all(entry)
        .and_then(|()| file.flush())
        .with_context(|| format!("Failed to append to {}", path.display()));
    if let Err(e) = FileExt::unlock(&file) {
        warn!("Failed to unlock {}: {}", path.display(), e);
    }
    written
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::{sync::Arc, time::Duration};
    use tempfile::TempDir;

    #[test]
    fn renders_fields_and_quotes_awkward_values() {
        let line = AuditLine::new(AuditEvent::Unauthorized)
            .field("ip", "10.0.0.1")
            .field("origin", "curl/8.0 (x86)")
            .field("reason", "");
        assert_eq!(
            line.render(),
            r#"UNAUTHORIZED ip=10.0.0.1 origin="curl/8.0 (x86)" reason="""#
        );

        let injected = AuditLine::new(AuditEvent::Received).field("event_type", "a\nRECEIVED fake=1");
        assert!(!injected.render().contains('\n'));
    }

    #[test]
    fn ack_events_go_to_their_own_category() {
        assert_eq!(AuditEvent::AckSent.category(), "ack");
        assert_eq!(AuditEvent::Duplicate.category(), "receive");
    }

    #[tokio::test]
    async fn appends_to_date_partitioned_file() {
        let dir = TempDir::new().unwrap();
        let log = FileLog::new(dir.path());
        let at = Utc.with_ymd_and_hms(2026, 3, 14, 9, 26, 53).unwrap();

        log.append_at("receive", "RECEIVED request_id=a", at).await.unwrap();
        log.append_at("receive", "DUPLICATE request_id=a", at).await.unwrap();

        let path = dir.path().join("receive").join("receive_2026-03-14.log");
        assert_eq!(path, log.file_for("receive", at.date_naive()));
        let content = std::fs::read_to_string(path).unwrap();
        assert_eq!(
            content,
            "2026-03-14 09:26:53 RECEIVED request_id=a\n2026-03-14 09:26:53 DUPLICATE request_id=a\n"
        );
    }

    #[tokio::test]
    async fn concurrent_appends_keep_lines_whole() {
        let dir = TempDir::new().unwrap();
        let log = Arc::new(FileLog::new(dir.path()));
        let at = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap();
        let handles: Vec<_> = (0..50)
            .map(|i| {
                let log = log.clone();
                tokio::spawn(async move {
                    let line = format!("RECEIVED request_id=req-{i} {}", "x".repeat(200));
                    log.append_at("receive", &line, at).await.unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }
        let content = std::fs::read_to_string(log.file_for("receive", at.date_naive())).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 50);
        assert!(lines
            .iter()
            .all(|l| l.starts_with("2026-01-02 03:04:05 RECEIVED request_id=req-") && l.ends_with('x')));
    }

    #[tokio::test]
    async fn waits_for_a_lock_held_by_another_writer() {
        let dir = TempDir::new().unwrap();
        let log = Arc::new(FileLog::new(dir.path()));
        let at = Utc.with_ymd_and_hms(2026, 5, 6, 7, 8, 9).unwrap();
        let path = log.file_for("receive", at.date_naive());
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();

        // A separate handle stands in for another receiver process.
        let other = OpenOptions::new().create(true).append(true).open(&path).unwrap();
        other.lock_exclusive().unwrap();

        let writer = {
            let log = log.clone();
            tokio::spawn(async move { log.append_at("receive", "RECEIVED request_id=late", at).await })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!writer.is_finished());
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "");

        FileExt::unlock(&other).unwrap();
        writer.await.unwrap().unwrap();
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "2026-05-06 07:08:09 RECEIVED request_id=late\n"
        );
    }
}
