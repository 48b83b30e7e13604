//! IMAP connector (XOAUTH2) using async-imap 0.11 with tokio-rustls.
use async_imap::{Authenticator, Client, Session};
use async_trait::async_trait;
use rustls_native_certs::load_native_certs;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerName};
use tokio_rustls::TlsConnector;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};
use tracing::{debug, warn};

use crate::errors::{AppError, AppResult};
use crate::oauth::TokenSource;
use crate::sync::Progress;
use crate::types::{Flag, FolderInfo, Message, UidRange};

mod remote;

pub use remote::ImapRemote;

pub type ImapSession = Session<Compat<tokio_rustls::client::TlsStream<TcpStream>>>;

/// Everything the synchronizer needs from a mail server. One implementor
/// talks IMAP; tests use an in-memory mailbox.
#[async_trait]
pub trait MailRemote: Send {
    /// UIDNEXT, message count and unseen count of `folder`.
    async fn folder_info(&mut self, folder: &str) -> AppResult<FolderInfo>;

    /// Headers and flags for every existing UID in `range`. Each arriving
    /// message bumps `progress`.
    async fn fetch_uids(
        &mut self,
        folder: &str,
        range: UidRange,
        progress: &watch::Sender<Progress>,
    ) -> AppResult<Vec<Message>>;

    /// Headers and flags for a sequence-number window.
    async fn fetch_numbers(&mut self, folder: &str, range: UidRange) -> AppResult<Vec<Message>>;

    /// Full RFC 822 source of one message.
    async fn fetch_source(&mut self, folder: &str, uid: u32) -> AppResult<Option<Vec<u8>>>;

    /// Paths of every folder on the server.
    async fn list_folders(&mut self) -> AppResult<Vec<String>>;

    async fn add_flags(&mut self, folder: &str, uid: u32, flags: &[Flag]) -> AppResult<()>;

    async fn move_message(&mut self, folder: &str, uid: u32, dest: &str) -> AppResult<()>;

    async fn logout(&mut self) -> AppResult<()>;
}

/// Where and as whom to connect.
#[derive(Clone, Debug)]
pub struct ImapEndpoint {
    pub host: String,
    pub port: u16,
    pub user: String,
}

/// Opens authenticated sessions, pulling a fresh token for each one.
#[derive(Clone)]
pub struct SessionFactory {
    endpoint: ImapEndpoint,
    tokens: Arc<dyn TokenSource>,
}

impl SessionFactory {
    pub fn new(endpoint: ImapEndpoint, tokens: Arc<dyn TokenSource>) -> Self {
        Self { endpoint, tokens }
    }

    pub fn tokens(&self) -> &Arc<dyn TokenSource> {
        &self.tokens
    }

    /// Connect with the current token; if the server rejects it, drop the
    /// token and try once more with a refreshed one.
    pub async fn open(&self) -> AppResult<ImapSession> {
        let token = self.tokens.access_token().await?;
        match ImapClient::connect(&self.endpoint, &token).await {
            Err(AppError::AuthExpired) => {
                warn!(user = %self.endpoint.user, "IMAP rejected token; refreshing and retrying");
                self.tokens.invalidate();
                let token = self.tokens.access_token().await?;
                ImapClient::connect(&self.endpoint, &token).await
            }
            other => other,
        }
    }

    pub async fn open_remote(&self) -> AppResult<ImapRemote> {
        Ok(ImapRemote::new(self.open().await?))
    }
}

pub struct ImapClient;

impl ImapClient {
    pub async fn connect(endpoint: &ImapEndpoint, access_token: &str) -> AppResult<ImapSession> {
        let compat_stream = open_tls(&endpoint.host, endpoint.port)
            .await
            .map_err(|e| AppError::Network(format!("{e:#}")))?;

        let mut client = Client::new(compat_stream);

        let _greeting = client
            .read_response()
            .await
            .map_err(|e| AppError::Network(format!("reading IMAP greeting: {e}")))?
            .ok_or_else(|| {
                AppError::Network("unexpected end of stream, expected greeting".into())
            })?;

        let xoauth = Xoauth2 {
            user: endpoint.user.clone(),
            access_token: access_token.to_string(),
        };

        let session = client
            .authenticate("XOAUTH2", xoauth)
            .await
            .map_err(|(err, _client)| match err {
                async_imap::error::Error::No(_) | async_imap::error::Error::Bad(_) => {
                    AppError::AuthExpired
                }
                other => AppError::Network(format!("XOAUTH2 authenticate: {other}")),
            })?;

        debug!(host = %endpoint.host, user = %endpoint.user, "IMAP session authenticated");
        Ok(session)
    }
}

async fn open_tls(
    host: &str,
    port: u16,
) -> anyhow::Result<Compat<tokio_rustls::client::TlsStream<TcpStream>>> {
    use anyhow::Context;

    let mut root_store = RootCertStore::empty();
    for cert in load_native_certs().context("failed to load native certs")? {
        root_store
            .add(&tokio_rustls::rustls::Certificate(cert.0))
            .context("failed to add cert to root store")?;
    }

    let config = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    let connector = TlsConnector::from(Arc::new(config));

    let tcp = TcpStream::connect((host, port))
        .await
        .with_context(|| format!("connecting to {host}:{port}"))?;

    let server_name = ServerName::try_from(host).context("invalid DNS name")?;
    let tls_stream = connector
        .connect(server_name, tcp)
        .await
        .context("starting TLS for IMAP")?;

    // async-imap speaks futures-io; tokio-rustls speaks tokio-io.
    Ok(tls_stream.compat())
}

struct Xoauth2 {
    user: String,
    access_token: String,
}

impl Authenticator for Xoauth2 {
    type Response = String;

    fn process(&mut self, _challenge: &[u8]) -> String {
        xoauth2_payload(&self.user, &self.access_token)
    }
}

/// SASL XOAUTH2 initial response (before base64, which async-imap applies).
pub fn xoauth2_payload(user: &str, access_token: &str) -> String {
    format!("user={}\x01auth=Bearer {}\x01\x01", user, access_token)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn xoauth2_payload_layout() {
        assert_eq!(
            xoauth2_payload("me@example.com", "tok"),
            "user=me@example.com\x01auth=Bearer tok\x01\x01"
        );
    }
}
