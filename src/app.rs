use crate::cache::{CacheLoad, CacheStore};
use crate::cli::{Cli, Startup};
use crate::config::AppDefaults;
use crate::errors::{AppError, AppResult};
use crate::idle::{ImapIdleConnector, MailSignal, WatcherExit, WatcherHandle};
use crate::imap::{ImapEndpoint, ImapRemote, MailRemote, SessionFactory};
use crate::oauth::{OAuthCredentials, TokenManager, TokenSource};
use crate::onboarding;
use crate::smtp::{build_message, send_with_retry, LettreSender, Outgoing};
use crate::storage::Database;
use crate::sync::{FolderList, SyncEngine, SyncReport};
use crate::types::{Account, Message, INBOX};
use anyhow::Result;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Keyring slot for the single signed-in account.
const TOKEN_KEY: &str = "default";
const FOLDER_BROWSE_COUNT: u32 = 50;

/// Everything one signed-in session needs. Created at session start and
/// dropped at session end; nothing lives in globals.
pub struct MailContext {
    defaults: AppDefaults,
    account: Account,
    tokens: Arc<TokenManager>,
    factory: SessionFactory,
    cache_store: CacheStore,
    db: Database,
    engine: SyncEngine,
    folders: FolderList,
    remote: Option<ImapRemote>,
    watcher: Option<WatcherHandle>,
    signals_tx: mpsc::Sender<MailSignal>,
    signals_rx: mpsc::Receiver<MailSignal>,
}

impl MailContext {
    pub fn new(defaults: AppDefaults, account: Account, tokens: Arc<TokenManager>, db: Database) -> Self {
        let endpoint = ImapEndpoint {
            host: defaults.imap_host.clone(),
            port: defaults.imap_port,
            user: account.email.clone(),
        };
        let token_source: Arc<dyn TokenSource> = tokens.clone();
        let factory = SessionFactory::new(endpoint, token_source);
        let cache_store =
            CacheStore::for_account(&defaults.data_dir, &account.email, defaults.sync.persist_count);
        let engine = SyncEngine::new(defaults.sync);
        let (signals_tx, signals_rx) = mpsc::channel(16);

        Self {
            defaults,
            account,
            tokens,
            factory,
            cache_store,
            db,
            engine,
            folders: FolderList::new(),
            remote: None,
            watcher: None,
            signals_tx,
            signals_rx,
        }
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    pub fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    pub fn folders(&self) -> &FolderList {
        &self.folders
    }

    /// Stale data first: restore the on-disk snapshot and the stored folder
    /// list before anything touches the network.
    pub async fn load_cache(&mut self) -> usize {
        let messages = match self.cache_store.load().await {
            CacheLoad::Warm(messages) => messages,
            CacheLoad::Missing => {
                debug!(email = %self.account.email, "No cache yet; first sync fetches the newest batch");
                Vec::new()
            }
            CacheLoad::Corrupt(reason) => {
                warn!(email = %self.account.email, reason = %reason, "Discarding unreadable cache");
                Vec::new()
            }
        };
        self.engine.restore(messages);

        match self.db.load_folders(&self.account.email).await {
            Ok(stored) if !stored.is_empty() => self.folders = FolderList::from_folders(stored),
            Ok(_) => {}
            Err(e) => warn!(error = %format!("{e:#}"), "Could not load stored folders"),
        }
        self.engine.cache().len()
    }

    async fn ensure_remote(&mut self) -> AppResult<()> {
        if self.remote.is_none() {
            self.remote = Some(self.factory.open_remote().await?);
        }
        Ok(())
    }

    /// Drop a session that failed so the next call reconnects with a
    /// refreshed token.
    fn settle<T>(&mut self, result: AppResult<T>) -> AppResult<T> {
        if let Err(e) = &result {
            if matches!(e, AppError::Network(_)) || e.is_auth() {
                self.remote = None;
            }
            if matches!(e, AppError::AuthExpired) {
                self.tokens.invalidate();
            }
        }
        result
    }

    /// Launch sequence: unread count, folders, then a delta sync.
    pub async fn start(&mut self) -> AppResult<SyncReport> {
        if let Err(e) = self.refresh_unread_count().await {
            warn!(error = %e, "Unread count unavailable");
        }
        if let Err(e) = self.discover_folders().await {
            warn!(error = %e, "Folder discovery failed");
        }
        self.sync().await
    }

    pub async fn sync(&mut self) -> AppResult<SyncReport> {
        self.ensure_remote().await?;
        let remote = self.remote.as_mut().ok_or_else(not_open)?;
        let result = self.engine.refresh(remote).await;
        let report = self.settle(result)?;

        if let Some(at) = self.engine.last_updated() {
            self.account.last_updated = Some(at);
            if let Err(e) = self.db.touch_last_updated(&self.account.email, at).await {
                warn!(error = %format!("{e:#}"), "Could not record last sync time");
            }
        }
        Ok(report)
    }

    pub async fn refresh_unread_count(&mut self) -> AppResult<u32> {
        self.ensure_remote().await?;
        let remote = self.remote.as_mut().ok_or_else(not_open)?;
        let result = self.engine.refresh_unread_count(remote).await;
        self.settle(result)
    }

    pub async fn discover_folders(&mut self) -> AppResult<usize> {
        self.ensure_remote().await?;
        let remote = self.remote.as_mut().ok_or_else(not_open)?;
        let result = self.engine.discover_folders(remote, &mut self.folders).await;
        let added = self.settle(result)?;
        self.db
            .save_folders(&self.account.email, self.folders.folders())
            .await
            .map_err(|e| AppError::Database(format!("{e:#}")))?;
        Ok(added)
    }

    pub async fn load_more(&mut self) -> AppResult<SyncReport> {
        self.ensure_remote().await?;
        let remote = self.remote.as_mut().ok_or_else(not_open)?;
        let result = self.engine.load_older(remote).await;
        self.settle(result)
    }

    /// Body text of an Inbox message; opening it marks it read.
    pub async fn open_message(&mut self, uid: u32) -> AppResult<String> {
        self.ensure_remote().await?;
        let remote = self.remote.as_mut().ok_or_else(not_open)?;
        let result = self.engine.fetch_body(remote, uid).await;
        let body = self.settle(result)?;

        let remote = self.remote.as_mut().ok_or_else(not_open)?;
        let result = self.engine.mark_seen(remote, uid).await;
        if let Err(e) = self.settle(result) {
            warn!(uid, error = %e, "Could not mark message read");
        }
        Ok(body)
    }

    pub async fn move_message(&mut self, uid: u32, dest: &str) -> AppResult<()> {
        self.ensure_remote().await?;
        let remote = self.remote.as_mut().ok_or_else(not_open)?;
        let result = self.engine.move_message(remote, uid, dest).await;
        self.settle(result)
    }

    pub async fn move_to_trash(&mut self, uid: u32) -> AppResult<()> {
        self.ensure_remote().await?;
        let remote = self.remote.as_mut().ok_or_else(not_open)?;
        let result = self.engine.move_to_trash(remote, uid).await;
        self.settle(result)
    }

    pub async fn browse(&mut self, path: &str) -> AppResult<Vec<Message>> {
        self.ensure_remote().await?;
        let remote = self.remote.as_mut().ok_or_else(not_open)?;
        let result = self
            .engine
            .fetch_folder_recent(remote, path, FOLDER_BROWSE_COUNT)
            .await;
        self.settle(result)
    }

    pub async fn send(&self, outgoing: &Outgoing) -> AppResult<()> {
        let message = build_message(&self.account, outgoing)?;
        let sender = LettreSender::new(self.defaults.smtp_host.clone(), self.defaults.smtp_port);
        send_with_retry(&sender, self.tokens.as_ref(), &self.account.email, &message).await?;
        info!(to = ?outgoing.to, "Message sent");
        Ok(())
    }

    fn spawn_watcher(&mut self) {
        if self.watcher.as_ref().is_some_and(|w| !w.is_finished()) {
            return;
        }
        let connector = ImapIdleConnector::new(self.factory.clone(), INBOX);
        self.watcher = Some(WatcherHandle::spawn(
            connector,
            self.defaults.idle,
            self.signals_tx.clone(),
        ));
        info!(email = %self.account.email, "IDLE watcher started");
    }

    /// Run the sync actor until `shutdown` resolves or the watcher quits:
    /// every new-mail signal becomes a delta sync.
    pub async fn watch<F>(&mut self, shutdown: F) -> AppResult<()>
    where
        F: Future<Output = ()>,
    {
        self.spawn_watcher();
        tokio::pin!(shutdown);

        loop {
            let signal = tokio::select! {
                _ = &mut shutdown => break,
                signal = self.signals_rx.recv() => signal,
            };
            match signal {
                Some(MailSignal::NewMail) => match self.sync().await {
                    Ok(report) if report.outcome.inserted > 0 => {
                        println!("📬 {} new message(s)", report.outcome.inserted);
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "Sync after new-mail signal failed"),
                },
                Some(MailSignal::WatcherStopped { reason }) => {
                    warn!(reason = %reason, "IDLE watcher stopped");
                    break;
                }
                None => break,
            }
        }
        self.suspend().await;
        Ok(())
    }

    /// Going to the background: stop IDLE, persist the newest messages,
    /// close the interactive session.
    pub async fn suspend(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            let exit = watcher.stop().await;
            debug!(?exit, "IDLE watcher stopped");
        }
        match self.cache_store.save(self.engine.cache()).await {
            Ok(count) => debug!(count, "Cache persisted"),
            Err(e) => warn!(error = %e, "Cache save failed"),
        }
        if let Some(mut remote) = self.remote.take() {
            if let Err(e) = remote.logout().await {
                debug!(error = %e, "Logout failed");
            }
        }
    }

    /// Back to the foreground: restart IDLE and catch up.
    pub async fn resume(&mut self) -> AppResult<SyncReport> {
        self.spawn_watcher();
        self.sync().await
    }

    pub async fn sign_out(mut self) -> AppResult<()> {
        if let Some(watcher) = self.watcher.take() {
            let exit: WatcherExit = watcher.stop().await;
            debug!(?exit, "IDLE watcher stopped for sign-out");
        }
        if let Some(mut remote) = self.remote.take() {
            let _ = remote.logout().await;
        }
        self.tokens.forget()?;
        self.cache_store.clear().await?;
        self.db
            .delete_account(&self.account.email)
            .await
            .map_err(|e| AppError::Database(format!("{e:#}")))?;
        self.engine.reset();
        info!(email = %self.account.email, "Signed out");
        Ok(())
    }
}

fn not_open() -> AppError {
    AppError::Unexpected("IMAP session not open".into())
}

pub async fn run(cli: Cli) -> Result<()> {
    let defaults = AppDefaults::load()?;
    let db = Database::open(&defaults.db_path()).await?;
    info!(path = %defaults.db_path().display(), "Using SQLite store");

    let stored = db.load_account().await?;
    let startup = cli.startup(stored.is_some());
    if startup == Startup::NotSignedIn {
        println!("Not signed in");
        return Ok(());
    }

    let creds = OAuthCredentials::from_env()?;
    let tokens = Arc::new(TokenManager::new(creds, TOKEN_KEY));

    let account = match (startup, stored) {
        (Startup::UseStored, Some(account)) => account,
        _ => {
            let account = onboarding::sign_in(&tokens).await?;
            db.save_account(&account).await?;
            account
        }
    };

    let mut ctx = MailContext::new(defaults, account, tokens, db);

    if cli.sign_out {
        let email = ctx.account().email.clone();
        ctx.sign_out().await?;
        println!("Signed out of {email}");
        return Ok(());
    }

    let restored = ctx.load_cache().await;
    info!(restored, "Cache loaded");

    if !cli.no_sync {
        match ctx.start().await {
            Ok(report) => debug!(?report, "Initial sync done"),
            Err(e) => warn!(error = %e, "Sync failed; showing cached mail"),
        }
    } else {
        info!("Skipping sync; using cached data only");
    }

    if cli.load_more {
        let report = ctx.load_more().await?;
        println!("Loaded {} older message(s)", report.outcome.inserted);
    }

    if let Some(uid) = cli.read {
        let body = ctx.open_message(uid).await?;
        print_message(&ctx, uid, &body);
    }

    if let Some(uid) = cli.trash {
        ctx.move_to_trash(uid).await?;
        println!("Moved {uid} to Trash");
    }

    if let (Some(uid), Some(dest)) = (cli.move_uid, cli.to.as_deref()) {
        ctx.move_message(uid, dest).await?;
        println!("Moved {uid} to {dest}");
    }

    if !cli.send_to.is_empty() {
        let outgoing = Outgoing {
            to: cli.send_to.clone(),
            cc: cli.cc.clone(),
            bcc: cli.bcc.clone(),
            subject: cli.subject.clone(),
            body: cli.body.clone(),
        };
        ctx.send(&outgoing).await?;
        println!("Sent.");
    }

    if cli.folders {
        print_folders(&ctx);
    }

    if let Some(path) = cli.browse.as_deref() {
        let messages = ctx.browse(path).await?;
        print_messages(path, messages.iter().take(cli.limit));
    } else {
        print_inbox(&ctx, cli.limit);
    }

    if cli.watch {
        println!("Watching for new mail (Ctrl-C to stop)...");
        ctx.watch(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Ctrl-C handler failed");
            }
        })
        .await?;
    } else {
        ctx.suspend().await;
    }

    Ok(())
}

fn print_inbox(ctx: &MailContext, limit: usize) {
    let engine = ctx.engine();
    let updated = engine
        .last_updated()
        .or(ctx.account().last_updated)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "never".to_string());

    println!("\n{}", "=".repeat(80));
    println!(
        "📬 Inbox ({} unread) · {} · updated {}",
        engine.unread(),
        ctx.account().email,
        updated
    );
    println!("{}\n", "=".repeat(80));

    let visible: Vec<&Message> = engine.cache().visible().take(limit).collect();
    if visible.is_empty() {
        println!("No messages.\n");
    }
    for (i, msg) in visible.iter().enumerate() {
        print_row(i, msg);
    }
    println!("{}", "=".repeat(80));
}

fn print_messages<'a>(path: &str, messages: impl Iterator<Item = &'a Message>) {
    println!("\n{}", "=".repeat(80));
    println!("📁 {path}");
    println!("{}\n", "=".repeat(80));
    for (i, msg) in messages.enumerate() {
        print_row(i, msg);
    }
    println!("{}", "=".repeat(80));
}

fn print_row(i: usize, msg: &Message) {
    let date = msg
        .header
        .date
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "Unknown".to_string());
    let status = if msg.is_seen() { "R" } else { "U" };
    println!("{}. [{}] [{}] {} (uid {})", i + 1, date, status, msg.subject(), msg.uid);
    println!("   From: {}", msg.sender_name());
    println!();
}

fn print_message(ctx: &MailContext, uid: u32, body: &str) {
    println!("\n{}", "=".repeat(80));
    if let Some(msg) = ctx.engine().cache().get(uid) {
        println!("Subject: {}", msg.subject());
        if let Some(sender) = &msg.header.sender {
            println!("From: {sender}");
        }
        if let Some(date) = msg.header.date {
            println!("Date: {}", date.format("%Y-%m-%d %H:%M"));
        }
        println!();
    }
    println!("{}", body.trim_end());
    println!("{}", "=".repeat(80));
}

fn print_folders(ctx: &MailContext) {
    println!("\nFolders:");
    for folder in ctx.folders().folders() {
        println!("  [{}] {} ({})", folder.icon, folder.name, folder.path);
    }
}
