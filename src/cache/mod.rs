//! Per-account snapshot of the newest Inbox messages, so launch can show
//! stale mail before the network answers.
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::{AppError, AppResult};
use crate::sync::MailboxCache;
use crate::types::Message;

const CACHE_FILE: &str = "emails.json";
const CACHE_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct CacheFile {
    version: u32,
    messages: Vec<Message>,
}

/// Result of reading the snapshot. Neither miss is an error: both mean
/// "start empty and do a full fetch".
#[derive(Debug)]
pub enum CacheLoad {
    Warm(Vec<Message>),
    Missing,
    Corrupt(String),
}

impl CacheLoad {
    pub fn into_messages(self) -> Vec<Message> {
        match self {
            CacheLoad::Warm(messages) => messages,
            CacheLoad::Missing | CacheLoad::Corrupt(_) => Vec::new(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct CacheStore {
    path: PathBuf,
    keep: usize,
}

impl CacheStore {
    /// `<data_dir>/<email>/emails.json`, keeping the newest `keep` messages.
    pub fn for_account(data_dir: &Path, email: &str, keep: usize) -> Self {
        Self {
            path: data_dir.join(account_dir_name(email)).join(CACHE_FILE),
            keep,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> CacheLoad {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return CacheLoad::Missing,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Cache unreadable");
                return CacheLoad::Corrupt(e.to_string());
            }
        };

        match serde_json::from_slice::<CacheFile>(&bytes) {
            Ok(file) if file.version == CACHE_VERSION => {
                debug!(path = %self.path.display(), count = file.messages.len(), "Cache loaded");
                CacheLoad::Warm(file.messages)
            }
            Ok(file) => CacheLoad::Corrupt(format!("unsupported cache version {}", file.version)),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Cache corrupt; starting cold");
                CacheLoad::Corrupt(e.to_string())
            }
        }
    }

    /// Write the newest messages via temp file + rename.
    pub async fn save(&self, cache: &MailboxCache) -> AppResult<usize> {
        let messages = cache.most_recent(self.keep).to_vec();
        let count = messages.len();
        let payload = serde_json::to_vec(&CacheFile {
            version: CACHE_VERSION,
            messages,
        })
        .map_err(|e| AppError::Cache(format!("serialize: {e}")))?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| AppError::Cache(format!("create {}: {e}", parent.display())))?;
        }

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &payload)
            .await
            .map_err(|e| AppError::Cache(format!("write {}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| AppError::Cache(format!("rename into {}: {e}", self.path.display())))?;

        debug!(path = %self.path.display(), count, "Cache saved");
        Ok(count)
    }

    pub async fn clear(&self) -> AppResult<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AppError::Cache(format!("remove {}: {e}", self.path.display()))),
        }
    }
}

fn account_dir_name(email: &str) -> String {
    email
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' => '_',
            c => c,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Flag;

    fn cache_with(uids: impl IntoIterator<Item = u32>) -> MailboxCache {
        MailboxCache::from_messages(
            200,
            uids.into_iter()
                .map(|uid| Message::new(uid).with_flags([Flag::Seen]))
                .collect(),
        )
    }

    #[tokio::test]
    async fn saves_only_newest_messages() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::for_account(dir.path(), "me@example.com", 50);

        let saved = store.save(&cache_with(1..=120)).await.unwrap();
        assert_eq!(saved, 50);

        let messages = store.load().await.into_messages();
        assert_eq!(messages.len(), 50);
        assert_eq!(messages.first().map(|m| m.uid), Some(71));
        assert_eq!(messages.last().map(|m| m.uid), Some(120));
        assert!(messages.iter().all(Message::is_seen));
    }

    #[tokio::test]
    async fn missing_file_is_a_cold_start() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::for_account(dir.path(), "me@example.com", 50);
        assert!(matches!(store.load().await, CacheLoad::Missing));
    }

    #[tokio::test]
    async fn garbage_is_reported_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::for_account(dir.path(), "me@example.com", 50);
        std::fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        std::fs::write(store.path(), b"{not json").unwrap();

        let load = store.load().await;
        assert!(matches!(load, CacheLoad::Corrupt(_)));
        assert!(load.into_messages().is_empty());
    }

    #[tokio::test]
    async fn clear_removes_file_and_tolerates_absence() {
        let dir = tempfile::tempdir().unwrap();
        let store = CacheStore::for_account(dir.path(), "me@example.com", 50);
        store.save(&cache_with(1..=3)).await.unwrap();
        assert!(store.path().exists());

        store.clear().await.unwrap();
        assert!(!store.path().exists());
        store.clear().await.unwrap();
    }

    #[test]
    fn path_is_per_account() {
        let store = CacheStore::for_account(Path::new("/data"), "a/b@example.com", 50);
        assert_eq!(store.path(), Path::new("/data/a_b@example.com/emails.json"));
    }
}
