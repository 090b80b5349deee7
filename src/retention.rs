use crate::dedupe::MARKER_EXTENSION;
use crate::filelog::{ACK_CATEGORY, LOG_EXTENSION, RECEIVE_CATEGORY};
use crate::rate_limit::RateLimiter;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};
use tokio::{fs, task::JoinHandle};
use tracing::{debug, info, warn};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub logs_removed: usize,
    pub markers_removed: usize,
    pub counters_purged: usize,
}

pub struct Sweeper {
    pub log_root: PathBuf,
    pub dedupe_dir: PathBuf,
    pub log_max_age: Duration,
    pub dedupe_max_age: Duration,
    pub rate_limiter: Arc<RateLimiter>,
}

impl Sweeper {
    pub async fn sweep(&self, now: DateTime<Utc>) -> SweepReport {
        let clock = SystemTime::from(now);
        let mut report = SweepReport::default();

        for category in [RECEIVE_CATEGORY, ACK_CATEGORY] {
            let dir = self.log_root.join(category);
            match sweep_dir(&dir, LOG_EXTENSION, self.log_max_age, clock).await {
                Ok(n) => report.logs_removed += n,
                Err(e) => warn!("Log retention sweep failed for {}: {:#}", dir.display(), e),
            }
        }
        match sweep_dir(&self.dedupe_dir, MARKER_EXTENSION, self.dedupe_max_age, clock).await {
            Ok(n) => report.markers_removed = n,
            Err(e) => warn!(
                "Dedupe retention sweep failed for {}: {:#}",
                self.dedupe_dir.display(),
                e
            ),
        }
        report.counters_purged = self.rate_limiter.purge_stale(now).await;
        report
    }

    /// Runs `sweep` every `interval` until the returned handle is aborted.
    pub fn spawn(self, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let report = self.sweep(Utc::now()).await;
                if report == SweepReport::default() {
                    debug!("Retention sweep found nothing to remove");
                } else {
                    info!(
                        "Retention sweep removed {} log files, {} dedupe markers, {} rate counters",
                        report.logs_removed, report.markers_removed, report.counters_purged
                    );
                }
            }
        })
    }
}

/// Deletes regular files in `dir` with the given extension whose mtime is
/// more than `max_age` before `now`. A missing directory counts as empty.
pub async fn sweep_dir(dir: &Path, extension: &str, max_age: Duration, now: SystemTime) -> Result<usize> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", dir.display())),
    };

    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(extension) {
            continue;
        }
        let Ok(meta) = entry.metadata().await else {
            continue;
        };
        if !meta.is_file() {
            continue;
        }
        let Ok(modified) = meta.modified() else {
            continue;
        };
        let expired = now
            .duration_since(modified)
            .map(|age| age > max_age)
            .unwrap_or(false);
        if !expired {
            continue;
        }
        match fs::remove_file(&path).await {
            Ok(()) => removed += 1,
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!("Could not delete expired file {}: {}", path.display(), e),
        }
    }
    Ok(removed)
}
