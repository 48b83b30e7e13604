//! Inbox synchronizer: plans UID ranges, fetches through a `MailRemote`,
//! and merges into the bounded cache.
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::SyncSettings;
use crate::errors::{AppError, AppResult};
use crate::imap::MailRemote;
use crate::sanitize::render_plain_text;
use crate::types::{Flag, Folder, Message, UidRange, INBOX, TRASH};

pub mod mailbox;
pub mod plan;

pub use mailbox::{MailboxCache, MergeOutcome};
pub use plan::{plan_delta, plan_fetch, plan_latest_numbers, plan_older, plan_recent};

/// Download progress of the fetch in flight.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Progress {
    pub requested: u32,
    pub fetched: u32,
}

impl Progress {
    pub fn started(requested: u32) -> Self {
        Self {
            requested,
            fetched: 0,
        }
    }

    pub fn fraction(&self) -> f64 {
        if self.requested == 0 {
            return 0.0;
        }
        (f64::from(self.fetched) / f64::from(self.requested)).min(1.0)
    }

    pub fn is_done(&self) -> bool {
        self.fetched >= self.requested
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// `None` when the server had nothing new.
    pub range: Option<UidRange>,
    pub outcome: MergeOutcome,
    pub total: Option<u32>,
    pub unread: Option<u32>,
}

/// Mailboxes shown in the folder list: the well-known ones first, then
/// whatever the server reports. Unique by path.
#[derive(Clone, Debug)]
pub struct FolderList {
    folders: Vec<Folder>,
}

impl Default for FolderList {
    fn default() -> Self {
        Self::new()
    }
}

impl FolderList {
    pub fn new() -> Self {
        Self {
            folders: crate::types::well_known_folders(),
        }
    }

    pub fn from_folders(folders: Vec<Folder>) -> Self {
        let mut list = Self { folders: Vec::new() };
        for folder in folders {
            list.add(folder);
        }
        list
    }

    pub fn folders(&self) -> &[Folder] {
        &self.folders
    }

    pub fn contains(&self, path: &str) -> bool {
        self.folders.iter().any(|f| f.path == path)
    }

    /// Returns false when the path is already listed.
    pub fn add(&mut self, folder: Folder) -> bool {
        if self.contains(&folder.path) {
            return false;
        }
        self.folders.push(folder);
        true
    }

    /// Fold in a server LIST result. Returns how many folders were new.
    pub fn absorb_server_paths<I, S>(&mut self, paths: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        paths
            .into_iter()
            .filter_map(|p| discovered_folder(p.as_ref()))
            .filter(|f| self.add(f.clone()))
            .count()
    }
}

const GMAIL_PREFIX: &str = "[Gmail]/";

/// Folder entry for a server path, or `None` for containers we never show.
pub fn discovered_folder(path: &str) -> Option<Folder> {
    if path == "[Gmail]" || path == "[Gmail]/All Mail" || path.is_empty() {
        return None;
    }
    let name = path.strip_prefix(GMAIL_PREFIX).unwrap_or(path);
    Some(Folder::new(name, "mailbox", path))
}

/// Owns the Inbox cache and everything derived from it. Only the sync task
/// touches it; other tasks talk to that task over channels.
pub struct SyncEngine {
    folder: String,
    cache: MailboxCache,
    settings: SyncSettings,
    total: Option<u32>,
    unread: Option<u32>,
    last_updated: Option<DateTime<Utc>>,
    progress: watch::Sender<Progress>,
}

impl SyncEngine {
    pub fn new(settings: SyncSettings) -> Self {
        let (progress, _) = watch::channel(Progress::default());
        Self {
            folder: INBOX.to_string(),
            cache: MailboxCache::new(settings.cache_bound),
            settings,
            total: None,
            unread: None,
            last_updated: None,
            progress,
        }
    }

    /// Seed the cache with previously persisted messages.
    pub fn restore(&mut self, messages: Vec<Message>) {
        self.cache = MailboxCache::from_messages(self.settings.cache_bound, messages);
        debug!(count = self.cache.len(), max_uid = ?self.cache.max_uid(), "Cache restored");
    }

    pub fn cache(&self) -> &MailboxCache {
        &self.cache
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn folder(&self) -> &str {
        &self.folder
    }

    pub fn total(&self) -> Option<u32> {
        self.total
    }

    /// Server unread count when known, else what the cache says.
    pub fn unread(&self) -> u32 {
        self.unread
            .unwrap_or_else(|| u32::try_from(self.cache.unread_count()).unwrap_or(u32::MAX))
    }

    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.last_updated
    }

    pub fn subscribe_progress(&self) -> watch::Receiver<Progress> {
        self.progress.subscribe()
    }

    pub fn reset(&mut self) {
        self.cache.clear();
        self.total = None;
        self.unread = None;
        self.last_updated = None;
        self.progress.send_replace(Progress::default());
    }

    /// STATUS, plan, fetch, merge. On any failure the cache is left as it was.
    pub async fn refresh(&mut self, remote: &mut dyn MailRemote) -> AppResult<SyncReport> {
        let result = self.run_refresh(remote).await;
        if let Err(e) = &result {
            warn!(folder = %self.folder, error = %e, "Refresh failed; keeping cached messages");
        }
        result
    }

    async fn run_refresh(&mut self, remote: &mut dyn MailRemote) -> AppResult<SyncReport> {
        let info = remote.folder_info(&self.folder).await?;
        self.total = Some(info.message_count);
        if info.unseen.is_some() {
            self.unread = info.unseen;
        }

        let range = plan_fetch(self.cache.max_uid(), info.uid_next, self.settings.batch_size);
        let outcome = match range {
            Some(range) => self.fetch_and_merge(remote, range).await?,
            None => {
                debug!(folder = %self.folder, uid_next = info.uid_next, "Nothing new on server");
                MergeOutcome::default()
            }
        };

        self.last_updated = Some(Utc::now());
        Ok(SyncReport {
            range,
            outcome,
            total: self.total,
            unread: self.unread,
        })
    }

    async fn fetch_and_merge(
        &mut self,
        remote: &mut dyn MailRemote,
        range: UidRange,
    ) -> AppResult<MergeOutcome> {
        self.progress.send_replace(Progress::started(range.count()));
        let fetched = remote.fetch_uids(&self.folder, range, &self.progress).await?;
        let received = fetched.len();
        let outcome = self.cache.merge(fetched);
        self.progress.send_modify(|p| p.fetched = p.requested);

        info!(
            folder = %self.folder,
            range = %range,
            received,
            inserted = outcome.inserted,
            updated = outcome.updated,
            evicted = outcome.evicted,
            skipped_deleted = outcome.skipped_deleted,
            cached = self.cache.len(),
            "Merged fetched messages"
        );
        Ok(outcome)
    }

    /// Ask the server how many Inbox messages are unread.
    pub async fn refresh_unread_count(&mut self, remote: &mut dyn MailRemote) -> AppResult<u32> {
        let info = remote.folder_info(&self.folder).await?;
        self.total = Some(info.message_count);
        let unseen = info
            .unseen
            .ok_or_else(|| AppError::Protocol("STATUS returned no UNSEEN count".into()))?;
        self.unread = Some(unseen);
        Ok(unseen)
    }

    pub async fn discover_folders(
        &self,
        remote: &mut dyn MailRemote,
        list: &mut FolderList,
    ) -> AppResult<usize> {
        let paths = remote.list_folders().await?;
        let added = list.absorb_server_paths(&paths);
        debug!(listed = paths.len(), added, "Folders discovered");
        Ok(added)
    }

    /// "Load more": fetch UIDs just below the oldest cached one. Only
    /// fetches as many as fit under the bound, so nothing newer is evicted.
    pub async fn load_older(&mut self, remote: &mut dyn MailRemote) -> AppResult<SyncReport> {
        let room = self.cache.bound().saturating_sub(self.cache.len());
        let count = self
            .settings
            .older_batch
            .min(u32::try_from(room).unwrap_or(u32::MAX));
        let range = plan_older(self.cache.min_uid(), count);

        let outcome = match range {
            Some(range) => self.fetch_and_merge(remote, range).await?,
            None => MergeOutcome::default(),
        };
        Ok(SyncReport {
            range,
            outcome,
            total: self.total,
            unread: self.unread,
        })
    }

    /// Set `\Seen` on the server, then locally. Returns false when the
    /// message was already read.
    pub async fn mark_seen(&mut self, remote: &mut dyn MailRemote, uid: u32) -> AppResult<bool> {
        if self.cache.get(uid).is_some_and(Message::is_seen) {
            return Ok(false);
        }
        remote.add_flags(&self.folder, uid, &[Flag::Seen]).await?;
        if self.cache.add_flag(uid, Flag::Seen) {
            self.unread = self.unread.map(|n| n.saturating_sub(1));
        }
        Ok(true)
    }

    pub async fn move_message(
        &mut self,
        remote: &mut dyn MailRemote,
        uid: u32,
        dest: &str,
    ) -> AppResult<()> {
        if dest == self.folder {
            return Err(AppError::Config(format!("message {uid} is already in {dest}")));
        }
        remote.move_message(&self.folder, uid, dest).await?;
        if let Some(removed) = self.cache.remove(uid) {
            self.total = self.total.map(|n| n.saturating_sub(1));
            if !removed.is_seen() {
                self.unread = self.unread.map(|n| n.saturating_sub(1));
            }
        }
        info!(uid, dest = %dest, "Message moved");
        Ok(())
    }

    pub async fn move_to_trash(&mut self, remote: &mut dyn MailRemote, uid: u32) -> AppResult<()> {
        self.move_message(remote, uid, TRASH).await
    }

    /// Plain-text body of an Inbox message, cached after the first fetch.
    pub async fn fetch_body(&mut self, remote: &mut dyn MailRemote, uid: u32) -> AppResult<String> {
        if let Some(body) = self.cache.get(uid).and_then(|m| m.body.clone()) {
            return Ok(body);
        }
        let raw = remote
            .fetch_source(&self.folder, uid)
            .await?
            .ok_or_else(|| AppError::Protocol(format!("message {uid} not found on server")))?;
        let text = render_plain_text(&raw);
        self.cache.set_body(uid, text.clone());
        Ok(text)
    }

    /// Newest non-deleted messages of any folder, newest first. Does not
    /// touch the Inbox cache.
    pub async fn fetch_folder_recent(
        &self,
        remote: &mut dyn MailRemote,
        path: &str,
        count: u32,
    ) -> AppResult<Vec<Message>> {
        let info = remote.folder_info(path).await?;
        let Some(window) = plan_latest_numbers(info.message_count, count) else {
            return Ok(Vec::new());
        };
        let mut messages: Vec<Message> = remote
            .fetch_numbers(path, window)
            .await?
            .into_iter()
            .filter(|m| !m.is_deleted())
            .collect();
        messages.sort_by(|a, b| b.uid.cmp(&a.uid));
        messages.dedup_by_key(|m| m.uid);
        Ok(messages)
    }
}
