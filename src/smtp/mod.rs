//! Outgoing mail over SMTP (implicit TLS, XOAUTH2) with lettre.
use async_trait::async_trait;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::{Credentials, Mechanism};
use lettre::{AsyncSmtpTransport, AsyncTransport, Message as LettreMessage, Tokio1Executor};
use tracing::{info, warn};

use crate::errors::{AppError, AppResult};
use crate::oauth::TokenSource;
use crate::types::Account;

/// A plain-text message as the compose sheet fills it in.
#[derive(Clone, Debug, Default)]
pub struct Outgoing {
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    pub subject: String,
    pub body: String,
}

fn parse_mailbox(raw: &str) -> AppResult<Mailbox> {
    raw.trim()
        .parse::<Mailbox>()
        .map_err(|e| AppError::Config(format!("invalid address {raw:?}: {e}")))
}

fn sender_mailbox(account: &Account) -> AppResult<Mailbox> {
    let address = account
        .email
        .parse()
        .map_err(|e| AppError::Config(format!("invalid account address {}: {e}", account.email)))?;
    let name = Some(account.name.trim())
        .filter(|n| !n.is_empty())
        .map(str::to_string);
    Ok(Mailbox::new(name, address))
}

/// RFC 5322 message from the account to the listed recipients.
pub fn build_message(from: &Account, outgoing: &Outgoing) -> AppResult<LettreMessage> {
    if outgoing.to.iter().all(|t| t.trim().is_empty()) {
        return Err(AppError::Config("message has no recipients".into()));
    }

    let mut builder = LettreMessage::builder()
        .from(sender_mailbox(from)?)
        .subject(outgoing.subject.clone())
        .header(ContentType::TEXT_PLAIN);

    for to in outgoing.to.iter().filter(|a| !a.trim().is_empty()) {
        builder = builder.to(parse_mailbox(to)?);
    }
    for cc in outgoing.cc.iter().filter(|a| !a.trim().is_empty()) {
        builder = builder.cc(parse_mailbox(cc)?);
    }
    for bcc in outgoing.bcc.iter().filter(|a| !a.trim().is_empty()) {
        builder = builder.bcc(parse_mailbox(bcc)?);
    }

    builder
        .body(outgoing.body.clone())
        .map_err(|e| AppError::Config(format!("building message: {e}")))
}

#[async_trait]
pub trait SmtpSender: Send + Sync {
    async fn send(&self, message: &LettreMessage, user: &str, access_token: &str) -> AppResult<()>;
}

/// Sends through `host:port` with SMTPS and the XOAUTH2 mechanism.
pub struct LettreSender {
    host: String,
    port: u16,
}

impl LettreSender {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

#[async_trait]
impl SmtpSender for LettreSender {
    async fn send(&self, message: &LettreMessage, user: &str, access_token: &str) -> AppResult<()> {
        let transport = AsyncSmtpTransport::<Tokio1Executor>::relay(&self.host)
            .map_err(|e| AppError::Network(format!("SMTP relay {}: {e}", self.host)))?
            .port(self.port)
            .credentials(Credentials::new(user.to_string(), access_token.to_string()))
            .authentication(vec![Mechanism::Xoauth2])
            .build();

        let response = transport
            .send(message.clone())
            .await
            .map_err(|e| AppError::Send(e.to_string()))?;
        info!(host = %self.host, code = %response.code(), "SMTP accepted message");
        Ok(())
    }
}

/// Send once; on any failure refresh the token and try exactly one more time.
pub async fn send_with_retry(
    sender: &dyn SmtpSender,
    tokens: &dyn TokenSource,
    user: &str,
    message: &LettreMessage,
) -> AppResult<()> {
    let token = tokens.access_token().await?;
    let first = match sender.send(message, user, &token).await {
        Ok(()) => return Ok(()),
        Err(e) => e,
    };

    warn!(user = %user, error = %first, "Send failed; retrying with a fresh token");
    tokens.invalidate();
    let token = tokens.access_token().await?;
    sender
        .send(message, user, &token)
        .await
        .map_err(|e| AppError::Send(format!("gave up after retry: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct CountingTokens {
        generation: AtomicUsize,
        invalidations: AtomicUsize,
    }

    impl CountingTokens {
        fn new() -> Self {
            Self {
                generation: AtomicUsize::new(1),
                invalidations: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl TokenSource for CountingTokens {
        async fn access_token(&self) -> AppResult<String> {
            Ok(format!("tok-{}", self.generation.load(Ordering::SeqCst)))
        }

        fn invalidate(&self) {
            self.invalidations.fetch_add(1, Ordering::SeqCst);
            self.generation.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct FlakySender {
        failures_left: AtomicUsize,
        tokens_seen: Mutex<Vec<String>>,
    }

    impl FlakySender {
        fn failing(times: usize) -> Self {
            Self {
                failures_left: AtomicUsize::new(times),
                tokens_seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl SmtpSender for FlakySender {
        async fn send(&self, _message: &LettreMessage, _user: &str, token: &str) -> AppResult<()> {
            self.tokens_seen.lock().unwrap().push(token.to_string());
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(AppError::Send("535 auth rejected".into()));
            }
            Ok(())
        }
    }

    fn account() -> Account {
        let mut account = Account::new("me@example.com");
        account.name = "Me Myself".into();
        account
    }

    fn outgoing() -> Outgoing {
        Outgoing {
            to: vec!["you@example.com".into()],
            bcc: vec!["hidden@example.com".into()],
            subject: "Hello".into(),
            body: "Hi there".into(),
            ..Outgoing::default()
        }
    }

    #[test]
    fn message_carries_headers_and_envelope() {
        let message = build_message(&account(), &outgoing()).unwrap();
        let formatted = String::from_utf8(message.formatted()).unwrap();

        assert!(formatted.contains("Subject: Hello"));
        assert!(formatted.contains("To: you@example.com"));
        assert!(formatted.contains("me@example.com"));
        assert!(!formatted.contains("hidden@example.com"));
        assert_eq!(message.envelope().to().len(), 2);
    }

    #[test]
    fn empty_recipients_are_rejected() {
        let mut out = outgoing();
        out.to = vec!["  ".into()];
        assert!(matches!(build_message(&account(), &out), Err(AppError::Config(_))));
    }

    #[test]
    fn bad_address_is_a_config_error() {
        let mut out = outgoing();
        out.to = vec!["not an address".into()];
        assert!(matches!(build_message(&account(), &out), Err(AppError::Config(_))));
    }

    #[tokio::test]
    async fn first_success_needs_no_refresh() {
        let tokens = CountingTokens::new();
        let sender = FlakySender::failing(0);
        let message = build_message(&account(), &outgoing()).unwrap();

        send_with_retry(&sender, &tokens, "me@example.com", &message)
            .await
            .unwrap();

        assert_eq!(*sender.tokens_seen.lock().unwrap(), vec!["tok-1"]);
        assert_eq!(tokens.invalidations.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn retries_once_with_fresh_token() {
        let tokens = CountingTokens::new();
        let sender = FlakySender::failing(1);
        let message = build_message(&account(), &outgoing()).unwrap();

        send_with_retry(&sender, &tokens, "me@example.com", &message)
            .await
            .unwrap();

        assert_eq!(*sender.tokens_seen.lock().unwrap(), vec!["tok-1", "tok-2"]);
        assert_eq!(tokens.invalidations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn second_failure_is_permanent() {
        let tokens = CountingTokens::new();
        let sender = FlakySender::failing(5);
        let message = build_message(&account(), &outgoing()).unwrap();

        let err = send_with_retry(&sender, &tokens, "me@example.com", &message)
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::Send(_)));
        assert_eq!(sender.tokens_seen.lock().unwrap().len(), 2);
    }
}
