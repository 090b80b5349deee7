use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use std::{io::ErrorKind, path::PathBuf, sync::Arc};
use tokio::{fs, io::AsyncWriteExt};
use tracing::warn;

pub const MARKER_EXTENSION: &str = "seen";
const MAX_KEY_LEN: usize = 100;

#[async_trait]
pub trait DedupeStore: Send + Sync {
    /// Records first sight of `key`. `Ok(true)` only for the caller that
    /// created the marker; every later or concurrent caller gets `Ok(false)`.
    async fn claim(&self, key: &str) -> Result<bool>;
}

/// One empty-ish `<key>.seen` file per request id, created with `create_new`
/// so the filesystem arbitrates concurrent deliveries.
pub struct FileDedupeStore {
    dir: PathBuf,
}

impl FileDedupeStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn marker_path(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.{MARKER_EXTENSION}"))
    }
}

#[async_trait]
impl DedupeStore for FileDedupeStore {
    async fn claim(&self, key: &str) -> Result<bool> {
        fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create dedupe dir {}", self.dir.display()))?;
        let path = self.marker_path(key);
        let opened = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await;
        match opened {
            Ok(mut file) => {
                // The marker already exists at this point; its content is informational.
                if let Err(e) = file.write_all(Utc::now().to_rfc3339().as_bytes()).await {
                    warn!("Dedupe marker {} created but not written: {}", path.display(), e);
                }
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e).with_context(|| format!("Failed to create marker {}", path.display())),
        }
    }
}

pub struct Deduplicator {
    store: Arc<dyn DedupeStore>,
}

impl Deduplicator {
    pub fn new(store: Arc<dyn DedupeStore>) -> Self {
        Self { store }
    }

    pub async fn is_duplicate(&self, request_id: &str) -> Result<bool> {
        let first_sight = self.store.claim(&sanitize_key(request_id)).await?;
        Ok(!first_sight)
    }
}

/// Maps a caller-chosen id onto `[A-Za-z0-9_-]`. Ids that had to be altered get
/// a digest suffix so `evt/1` and `evt_1` stay distinct.
pub fn sanitize_key(raw: &str) -> String {
    let mut cleaned: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .take(MAX_KEY_LEN)
        .collect();
    if cleaned != raw || cleaned.is_empty() {
        let digest = hex::encode(Sha256::digest(raw.as_bytes()));
        cleaned.push('-');
        cleaned.push_str(&digest[..16]);
    }
    cleaned
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn keeps_safe_ids_verbatim() {
        assert_eq!(sanitize_key("evt-001"), "evt-001");
        assert_eq!(sanitize_key("req_0123abcd"), "req_0123abcd");
    }

    #[test]
    fn rewrites_unsafe_ids_without_collisions() {
        let slash = sanitize_key("evt/1");
        let underscore = sanitize_key("evt_1");
        assert!(slash.starts_with("evt_1-"));
        assert_ne!(slash, underscore);

        let traversal = sanitize_key("../../etc/passwd");
        assert!(!traversal.contains('/') && !traversal.contains('.'));

        let empty = sanitize_key("");
        assert_eq!(empty.len(), 17);

        let long = sanitize_key(&"a".repeat(500));
        assert_eq!(long.len(), MAX_KEY_LEN + 17);
    }

    #[tokio::test]
    async fn second_claim_is_duplicate() {
        let dir = TempDir::new().unwrap();
        let store = FileDedupeStore::new(dir.path().join("dedupe"));
        let dedupe = Deduplicator::new(Arc::new(FileDedupeStore::new(dir.path().join("dedupe"))));

        assert!(!dedupe.is_duplicate("evt-001").await.unwrap());
        assert!(dedupe.is_duplicate("evt-001").await.unwrap());
        assert!(!dedupe.is_duplicate("evt-002").await.unwrap());
        assert!(store.marker_path("evt-001").exists());
    }

    #[tokio::test]
    async fn concurrent_claims_have_one_winner() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(FileDedupeStore::new(dir.path()));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.claim("same-id").await.unwrap() })
            })
            .collect();
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn surfaces_store_errors() {
        let dir = TempDir::new().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"file").unwrap();
        let dedupe = Deduplicator::new(Arc::new(FileDedupeStore::new(&blocker)));
        assert!(dedupe.is_duplicate("evt-001").await.is_err());
    }
}
