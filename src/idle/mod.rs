//! IMAP IDLE watcher. Holds its own session on INBOX and tells the sync
//! task when new mail shows up.
use std::time::Duration;

use async_imap::extensions::idle::IdleResponse;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::IdleSettings;
use crate::errors::{AppError, AppResult};
use crate::imap::{ImapSession, SessionFactory};

/// What the watcher reports to the sync task.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MailSignal {
    NewMail,
    WatcherStopped { reason: String },
}

/// Why `IdleWatcher::run` returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatcherExit {
    Cancelled,
    GaveUp,
    NoToken,
    ReceiverClosed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IdleWake {
    NewData,
    Timeout,
    Cancelled,
}

/// Bounded exponential backoff: `base * 2^attempt`, capped at `max`, and
/// exhausted after `max_attempts` delays in a row.
#[derive(Clone, Debug)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    max_attempts: u32,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            max,
            max_attempts,
            attempt: 0,
        }
    }

    pub fn from_settings(settings: &IdleSettings) -> Self {
        Self::new(settings.backoff_base, settings.backoff_max, settings.max_attempts)
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Delay before the next reconnect, or `None` once attempts run out.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        let factor = 2u32.saturating_pow(self.attempt);
        self.attempt += 1;
        Some(self.base.saturating_mul(factor).min(self.max))
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// One IDLE-capable connection with INBOX already selected.
#[async_trait]
pub trait IdleSession: Send {
    /// Enter IDLE and return once the server sends data, `timeout` passes,
    /// or `cancel` fires.
    async fn wait(&mut self, timeout: Duration, cancel: &CancellationToken) -> AppResult<IdleWake>;

    async fn close(&mut self);
}

#[async_trait]
pub trait IdleConnector: Send + Sync {
    async fn connect(&self) -> AppResult<Box<dyn IdleSession>>;

    /// Drop the cached access token so the next connect refreshes it.
    fn invalidate_token(&self);
}

pub struct IdleWatcher<C> {
    connector: C,
    settings: IdleSettings,
    signals: mpsc::Sender<MailSignal>,
    cancel: CancellationToken,
}

impl<C: IdleConnector> IdleWatcher<C> {
    pub fn new(
        connector: C,
        settings: IdleSettings,
        signals: mpsc::Sender<MailSignal>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            connector,
            settings,
            signals,
            cancel,
        }
    }

    pub async fn run(self) -> WatcherExit {
        let mut backoff = Backoff::from_settings(&self.settings);

        loop {
            let connected = tokio::select! {
                _ = self.cancel.cancelled() => return WatcherExit::Cancelled,
                res = self.connector.connect() => res,
            };

            let failure = match connected {
                Ok(mut session) => {
                    info!("IDLE watcher connected");
                    let outcome = self.idle_cycles(session.as_mut(), &mut backoff).await;
                    match outcome {
                        Ok(exit) => {
                            session.close().await;
                            return exit;
                        }
                        Err(e) => e,
                    }
                }
                Err(e) => e,
            };

            if matches!(failure, AppError::NoToken) {
                warn!("IDLE watcher has no token; interactive sign-in required");
                self.stop_signal("no OAuth token").await;
                return WatcherExit::NoToken;
            }

            warn!(error = %failure, attempt = backoff.attempts() + 1, "IDLE connection failed");
            if failure.is_auth() {
                self.connector.invalidate_token();
            }

            let Some(delay) = backoff.next_delay() else {
                self.stop_signal(&format!("gave up after {} attempts: {failure}", self.settings.max_attempts))
                    .await;
                return WatcherExit::GaveUp;
            };
            debug!(delay_ms = delay.as_millis() as u64, "Backing off before reconnect");
            tokio::select! {
                _ = self.cancel.cancelled() => return WatcherExit::Cancelled,
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// IDLE until cancelled or the session breaks. `Err` means reconnect.
    async fn idle_cycles(
        &self,
        session: &mut dyn IdleSession,
        backoff: &mut Backoff,
    ) -> AppResult<WatcherExit> {
        loop {
            match session.wait(self.settings.keepalive, &self.cancel).await? {
                IdleWake::NewData => {
                    backoff.reset();
                    debug!("IDLE woke with new data");
                    if self.signals.send(MailSignal::NewMail).await.is_err() {
                        return Ok(WatcherExit::ReceiverClosed);
                    }
                }
                IdleWake::Timeout => {
                    backoff.reset();
                    debug!("IDLE keepalive; re-issuing");
                }
                IdleWake::Cancelled => return Ok(WatcherExit::Cancelled),
            }
        }
    }

    async fn stop_signal(&self, reason: &str) {
        let _ = self
            .signals
            .send(MailSignal::WatcherStopped {
                reason: reason.to_string(),
            })
            .await;
    }
}

/// A running watcher task.
pub struct WatcherHandle {
    cancel: CancellationToken,
    join: JoinHandle<WatcherExit>,
}

impl WatcherHandle {
    pub fn spawn<C>(connector: C, settings: IdleSettings, signals: mpsc::Sender<MailSignal>) -> Self
    where
        C: IdleConnector + 'static,
    {
        let cancel = CancellationToken::new();
        let watcher = IdleWatcher::new(connector, settings, signals, cancel.clone());
        let join = tokio::spawn(watcher.run());
        Self { cancel, join }
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub async fn stop(self) -> WatcherExit {
        self.cancel.cancel();
        match self.join.await {
            Ok(exit) => exit,
            Err(e) => {
                warn!(error = %e, "IDLE watcher task panicked");
                WatcherExit::Cancelled
            }
        }
    }
}

/// Opens IDLE sessions on one folder through the shared session factory.
pub struct ImapIdleConnector {
    factory: SessionFactory,
    folder: String,
}

impl ImapIdleConnector {
    pub fn new(factory: SessionFactory, folder: impl Into<String>) -> Self {
        Self {
            factory,
            folder: folder.into(),
        }
    }
}

#[async_trait]
impl IdleConnector for ImapIdleConnector {
    async fn connect(&self) -> AppResult<Box<dyn IdleSession>> {
        let mut session = self.factory.open().await?;
        session
            .select(&self.folder)
            .await
            .map_err(|e| AppError::Network(format!("SELECT {} for IDLE: {e}", self.folder)))?;
        Ok(Box::new(ImapIdleSession {
            session: Some(session),
        }))
    }

    fn invalidate_token(&self) {
        self.factory.tokens().invalidate();
    }
}

struct ImapIdleSession {
    session: Option<ImapSession>,
}

#[async_trait]
impl IdleSession for ImapIdleSession {
    async fn wait(&mut self, timeout: Duration, cancel: &CancellationToken) -> AppResult<IdleWake> {
        let session = self
            .session
            .take()
            .ok_or_else(|| AppError::Unexpected("IDLE on a closed session".into()))?;

        let mut handle = session.idle();
        handle
            .init()
            .await
            .map_err(|e| AppError::Network(format!("IDLE init: {e}")))?;

        let wake = {
            let (wait, interrupt) = handle.wait_with_timeout(timeout);
            tokio::pin!(wait);
            tokio::select! {
                res = &mut wait => match res {
                    Ok(IdleResponse::NewData(_)) => Ok(IdleWake::NewData),
                    Ok(IdleResponse::Timeout) => Ok(IdleWake::Timeout),
                    Ok(IdleResponse::ManualInterrupt) => Ok(IdleWake::Cancelled),
                    Err(e) => Err(AppError::Network(format!("IDLE wait: {e}"))),
                },
                _ = cancel.cancelled() => {
                    // Dropping the stop source interrupts the wait.
                    drop(interrupt);
                    let _ = wait.await;
                    Ok(IdleWake::Cancelled)
                }
            }
        }?;

        let session = handle
            .done()
            .await
            .map_err(|e| AppError::Network(format!("IDLE DONE: {e}")))?;
        self.session = Some(session);
        Ok(wake)
    }

    async fn close(&mut self) {
        if let Some(mut session) = self.session.take() {
            if let Err(e) = session.logout().await {
                debug!(error = %e, "IDLE session logout failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    enum Step {
        Wake(IdleWake),
        Fail,
    }

    struct ScriptedSession {
        steps: VecDeque<Step>,
    }

    #[async_trait]
    impl IdleSession for ScriptedSession {
        async fn wait(&mut self, _timeout: Duration, cancel: &CancellationToken) -> AppResult<IdleWake> {
            match self.steps.pop_front() {
                Some(Step::Wake(w)) => Ok(w),
                Some(Step::Fail) => Err(AppError::Network("connection reset".into())),
                None => {
                    cancel.cancelled().await;
                    Ok(IdleWake::Cancelled)
                }
            }
        }

        async fn close(&mut self) {}
    }

    enum Connect {
        Ok(Vec<Step>),
        Err(AppError),
    }

    #[derive(Clone, Default)]
    struct ScriptedConnector {
        script: Arc<Mutex<VecDeque<Connect>>>,
        connects: Arc<AtomicUsize>,
        invalidations: Arc<AtomicUsize>,
    }

    impl ScriptedConnector {
        fn new(script: Vec<Connect>) -> Self {
            Self {
                script: Arc::new(Mutex::new(script.into())),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl IdleConnector for ScriptedConnector {
        async fn connect(&self) -> AppResult<Box<dyn IdleSession>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(Connect::Ok(steps)) => Ok(Box::new(ScriptedSession {
                    steps: steps.into(),
                })),
                Some(Connect::Err(e)) => Err(e),
                None => Err(AppError::Network("unreachable".into())),
            }
        }

        fn invalidate_token(&self) {
            self.invalidations.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn fast_settings(max_attempts: u32) -> IdleSettings {
        IdleSettings {
            keepalive: Duration::from_millis(50),
            backoff_base: Duration::from_millis(1),
            backoff_max: Duration::from_millis(4),
            max_attempts,
        }
    }

    #[test]
    fn backoff_doubles_caps_and_runs_out() {
        let mut backoff = Backoff::new(Duration::from_secs(2), Duration::from_secs(300), 10);
        let delays: Vec<u64> = std::iter::from_fn(|| backoff.next_delay())
            .map(|d| d.as_secs())
            .collect();
        assert_eq!(delays, vec![2, 4, 8, 16, 32, 64, 128, 256, 300, 300]);
        assert_eq!(backoff.next_delay(), None);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(2)));
    }

    #[test]
    fn backoff_survives_huge_attempt_counts() {
        let mut backoff = Backoff::new(Duration::from_secs(2), Duration::from_secs(300), 100);
        let last = std::iter::from_fn(|| backoff.next_delay()).last();
        assert_eq!(last, Some(Duration::from_secs(300)));
    }

    #[tokio::test]
    async fn new_data_is_signalled_until_cancelled() {
        let connector = ScriptedConnector::new(vec![Connect::Ok(vec![
            Step::Wake(IdleWake::NewData),
            Step::Wake(IdleWake::Timeout),
            Step::Wake(IdleWake::NewData),
        ])]);
        let (tx, mut rx) = mpsc::channel(8);
        let handle = WatcherHandle::spawn(connector.clone(), fast_settings(3), tx);

        assert_eq!(rx.recv().await, Some(MailSignal::NewMail));
        assert_eq!(rx.recv().await, Some(MailSignal::NewMail));

        assert_eq!(handle.stop().await, WatcherExit::Cancelled);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn broken_session_reconnects() {
        let connector = ScriptedConnector::new(vec![
            Connect::Ok(vec![Step::Fail]),
            Connect::Ok(vec![Step::Wake(IdleWake::NewData)]),
        ]);
        let (tx, mut rx) = mpsc::channel(8);
        let handle = WatcherHandle::spawn(connector.clone(), fast_settings(3), tx);

        assert_eq!(rx.recv().await, Some(MailSignal::NewMail));
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
        assert_eq!(connector.invalidations.load(Ordering::SeqCst), 0);
        assert_eq!(handle.stop().await, WatcherExit::Cancelled);
    }

    #[tokio::test]
    async fn rejected_token_is_refreshed_before_reconnect() {
        let connector = ScriptedConnector::new(vec![
            Connect::Err(AppError::AuthExpired),
            Connect::Ok(vec![Step::Wake(IdleWake::NewData)]),
        ]);
        let (tx, mut rx) = mpsc::channel(8);
        let handle = WatcherHandle::spawn(connector.clone(), fast_settings(3), tx);

        assert_eq!(rx.recv().await, Some(MailSignal::NewMail));
        assert_eq!(connector.invalidations.load(Ordering::SeqCst), 1);
        assert_eq!(handle.stop().await, WatcherExit::Cancelled);
    }

    #[tokio::test]
    async fn offline_token_refresh_keeps_backing_off() {
        // Token endpoint unreachable on every attempt, as during an outage.
        let script = (0..4)
            .map(|_| Connect::Err(AppError::Network("token refresh: connection refused".into())))
            .collect();
        let connector = ScriptedConnector::new(script);
        let (tx, mut rx) = mpsc::channel(8);
        let watcher = IdleWatcher::new(connector.clone(), fast_settings(3), tx, CancellationToken::new());

        assert_eq!(watcher.run().await, WatcherExit::GaveUp);
        assert!(matches!(rx.recv().await, Some(MailSignal::WatcherStopped { .. })));
        assert_eq!(connector.connects.load(Ordering::SeqCst), 4);
        assert_eq!(connector.invalidations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn watcher_gives_up_after_max_attempts() {
        let connector = ScriptedConnector::new(Vec::new());
        let (tx, mut rx) = mpsc::channel(8);
        let watcher = IdleWatcher::new(connector.clone(), fast_settings(3), tx, CancellationToken::new());

        assert_eq!(watcher.run().await, WatcherExit::GaveUp);
        assert!(matches!(rx.recv().await, Some(MailSignal::WatcherStopped { .. })));
        // first try plus three backed-off retries
        assert_eq!(connector.connects.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn missing_token_stops_immediately() {
        let connector = ScriptedConnector::new(vec![Connect::Err(AppError::NoToken)]);
        let (tx, mut rx) = mpsc::channel(8);
        let watcher = IdleWatcher::new(connector.clone(), fast_settings(5), tx, CancellationToken::new());

        assert_eq!(watcher.run().await, WatcherExit::NoToken);
        assert!(matches!(rx.recv().await, Some(MailSignal::WatcherStopped { .. })));
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
        assert_eq!(connector.invalidations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn dropped_receiver_ends_the_watcher() {
        let connector = ScriptedConnector::new(vec![Connect::Ok(vec![Step::Wake(IdleWake::NewData)])]);
        let (tx, rx) = mpsc::channel(8);
        drop(rx);
        let watcher = IdleWatcher::new(connector, fast_settings(3), tx, CancellationToken::new());
        assert_eq!(watcher.run().await, WatcherExit::ReceiverClosed);
    }
}
