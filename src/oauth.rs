use crate::errors::{AppError, AppResult};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use oauth2::basic::{BasicClient, BasicTokenResponse};
use oauth2::reqwest::async_http_client;
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, ErrorResponse,
    PkceCodeChallenge, PkceCodeVerifier, RedirectUrl, RefreshToken, RequestTokenError, Scope,
    TokenResponse, TokenUrl,
};
use serde::Deserialize;
use std::env;
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};

const AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const USERINFO_URL: &str = "https://www.googleapis.com/oauth2/v2/userinfo";
const SERVICE_NAME: &str = "retromail-google-oauth";
const REDIRECT_BASE: &str = "http://127.0.0.1:8000";

/// Tokens are treated as expired this long before the provider says so.
const EXPIRY_SKEW_SECS: i64 = 60;

pub fn mail_scopes() -> Vec<Scope> {
    ["https://mail.google.com/", "openid", "email", "profile"]
        .into_iter()
        .map(|s| Scope::new(s.to_string()))
        .collect()
}

/// Anything that can hand out a usable bearer token for XOAUTH2.
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Returns a token that is valid right now, refreshing when needed.
    async fn access_token(&self) -> AppResult<String>;

    /// Forget the current access token so the next call refreshes.
    fn invalidate(&self);
}

#[derive(Clone, Debug)]
pub struct TokenBundle {
    pub access_token: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub refresh_token: Option<String>,
}

impl TokenBundle {
    fn from_response(res: &BasicTokenResponse) -> Self {
        Self {
            access_token: res.access_token().secret().to_string(),
            expires_at: res.expires_in().map(|d| {
                Utc::now() + Duration::from_std(d).unwrap_or_else(|_| Duration::seconds(0))
            }),
            refresh_token: res.refresh_token().map(|r| r.secret().to_string()),
        }
    }

    /// An access token with no advertised expiry is assumed usable.
    pub fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => now + Duration::seconds(EXPIRY_SKEW_SECS) < expires_at,
            None => !self.access_token.is_empty(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OAuthCredentials {
    client_id: String,
    client_secret: String,
}

impl OAuthCredentials {
    pub fn from_env() -> AppResult<Self> {
        let id = env::var("GOOGLE_CLIENT_ID")
            .map_err(|_| AppError::Config("GOOGLE_CLIENT_ID missing".into()))?;
        let secret = env::var("GOOGLE_CLIENT_SECRET")
            .map_err(|_| AppError::Config("GOOGLE_CLIENT_SECRET missing".into()))?;
        Ok(Self::new(id, secret))
    }

    pub fn new(client_id: impl Into<String>, client_secret: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
        }
    }
}

/// Owns the OAuth state of one account: the in-memory access token and the
/// refresh token persisted in the OS keyring.
pub struct TokenManager {
    creds: OAuthCredentials,
    store: TokenStore,
    current: Mutex<Option<TokenBundle>>,
}

impl TokenManager {
    pub fn new(creds: OAuthCredentials, account_key: &str) -> Self {
        Self {
            creds,
            store: TokenStore::from_key(account_key),
            current: Mutex::new(None),
        }
    }

    /// Seed the manager with a bundle obtained elsewhere (e.g. right after
    /// sign-in).
    pub fn with_bundle(self, bundle: TokenBundle) -> Self {
        self.set_current(Some(bundle));
        self
    }

    /// Interactive authorization-code grant (PKCE + loopback redirect).
    pub async fn sign_in(&self, scopes: &[Scope]) -> AppResult<TokenBundle> {
        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .map_err(|e| AppError::Unexpected(format!("failed to bind loopback port: {e}")))?;
        let local_port = listener
            .local_addr()
            .map(|addr| addr.port())
            .map_err(|e| AppError::Unexpected(format!("failed to read local addr: {e}")))?;

        let redirect = build_redirect_url(REDIRECT_BASE, local_port)?;
        let client = build_client(&self.creds, Some(&redirect))?;

        let (auth_url, verifier, csrf) = build_auth_url(&client, scopes);
        info!(redirect = %redirect, "Opening browser for Google OAuth consent");
        open_in_browser(&auth_url);

        let code = listen_for_code(listener).await?;
        if code.state != *csrf.secret() {
            warn!("OAuth callback state mismatch");
            return Err(AppError::AuthExpired);
        }

        let token_res = client
            .exchange_code(AuthorizationCode::new(code.code))
            .set_pkce_verifier(verifier)
            .request_async(async_http_client)
            .await
            .map_err(|e| AppError::Network(format!("token exchange failed: {e}")))?;

        let bundle = TokenBundle::from_response(&token_res);
        match &bundle.refresh_token {
            Some(refresh) => self.store.save(refresh)?,
            None => warn!("Provider returned no refresh token; session will not survive expiry"),
        }
        self.set_current(Some(bundle.clone()));
        Ok(bundle)
    }

    /// Delete every trace of the account's tokens.
    pub fn forget(&self) -> AppResult<()> {
        self.set_current(None);
        self.store.delete()
    }

    fn cached_fresh(&self) -> Option<String> {
        let guard = self.current.lock().ok()?;
        guard
            .as_ref()
            .filter(|b| b.is_fresh_at(Utc::now()))
            .map(|b| b.access_token.clone())
    }

    fn set_current(&self, bundle: Option<TokenBundle>) {
        if let Ok(mut guard) = self.current.lock() {
            *guard = bundle;
        }
    }

    fn refresh_token(&self) -> AppResult<Option<String>> {
        let in_memory = self
            .current
            .lock()
            .ok()
            .and_then(|g| g.as_ref().and_then(|b| b.refresh_token.clone()));
        if in_memory.is_some() {
            return Ok(in_memory);
        }
        Ok(self.store.load()?.map(|t| t.refresh_token))
    }

    async fn refresh(&self, refresh: String) -> AppResult<TokenBundle> {
        let client = build_client(&self.creds, None)?;
        let res = client
            .exchange_refresh_token(&RefreshToken::new(refresh.clone()))
            .request_async(async_http_client)
            .await;

        match res {
            Ok(token_res) => {
                let mut bundle = TokenBundle::from_response(&token_res);
                match bundle.refresh_token.clone() {
                    Some(rotated) if rotated != refresh => self.store.save(&rotated)?,
                    Some(_) => {}
                    None => bundle.refresh_token = Some(refresh),
                }
                Ok(bundle)
            }
            Err(err) => Err(refresh_failure(&err)),
        }
    }
}

/// Transport trouble is retryable; anything the token endpoint actually
/// answered (e.g. `invalid_grant`) means the refresh token is no good.
fn refresh_failure<RE, T>(err: &RequestTokenError<RE, T>) -> AppError
where
    RE: std::error::Error + 'static,
    T: ErrorResponse + 'static,
{
    match err {
        RequestTokenError::Request(e) => {
            warn!("Token endpoint unreachable: {e}");
            AppError::Network(format!("token refresh: {e}"))
        }
        other => {
            warn!("Refresh token invalid or expired: {other}");
            AppError::NoToken
        }
    }
}

#[async_trait]
impl TokenSource for TokenManager {
    async fn access_token(&self) -> AppResult<String> {
        if let Some(token) = self.cached_fresh() {
            return Ok(token);
        }

        let Some(refresh) = self.refresh_token()? else {
            debug!("No refresh token stored");
            return Err(AppError::NoToken);
        };

        match self.refresh(refresh).await {
            Ok(bundle) => {
                let token = bundle.access_token.clone();
                self.set_current(Some(bundle));
                info!("Access token refreshed");
                Ok(token)
            }
            Err(e) => {
                self.invalidate();
                Err(e)
            }
        }
    }

    fn invalidate(&self) {
        if let Ok(mut guard) = self.current.lock() {
            if let Some(bundle) = guard.as_mut() {
                bundle.access_token.clear();
                bundle.expires_at = Some(Utc::now());
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct UserInfo {
    email: String,
    #[serde(default)]
    name: Option<String>,
}

/// Email and display name of the signed-in user.
pub async fn fetch_user_profile(access_token: &str) -> AppResult<(String, Option<String>)> {
    let client = reqwest::Client::new();
    let res = client
        .get(USERINFO_URL)
        .bearer_auth(access_token)
        .send()
        .await
        .map_err(|e| AppError::Network(format!("userinfo request failed: {e}")))?;
    if !res.status().is_success() {
        return Err(AppError::Network(format!(
            "userinfo failed with status {}",
            res.status()
        )));
    }
    let parsed: UserInfo = res
        .json()
        .await
        .map_err(|e| AppError::Unexpected(format!("parse userinfo: {e}")))?;
    Ok((parsed.email, parsed.name))
}

fn build_redirect_url(base: &str, port: u16) -> AppResult<String> {
    let mut url = url::Url::parse(base)
        .map_err(|e| AppError::Config(format!("invalid redirect uri {base}: {e}")))?;
    url.set_port(Some(port))
        .map_err(|_| AppError::Config("failed to set redirect port".into()))?;
    Ok(url.to_string())
}

fn build_client(creds: &OAuthCredentials, redirect: Option<&str>) -> AppResult<BasicClient> {
    let auth_url = AuthUrl::new(AUTH_URL.to_string())
        .map_err(|e| AppError::Config(format!("invalid auth url: {e}")))?;
    let token_url = TokenUrl::new(TOKEN_URL.to_string())
        .map_err(|e| AppError::Config(format!("invalid token url: {e}")))?;

    let mut client = BasicClient::new(
        ClientId::new(creds.client_id.clone()),
        Some(ClientSecret::new(creds.client_secret.clone())),
        auth_url,
        Some(token_url),
    )
    .set_auth_type(oauth2::AuthType::RequestBody);

    if let Some(redirect) = redirect {
        client = client.set_redirect_uri(
            RedirectUrl::new(redirect.to_string())
                .map_err(|e| AppError::Config(format!("invalid redirect uri {redirect}: {e}")))?,
        );
    }

    Ok(client)
}

fn build_auth_url(client: &BasicClient, scopes: &[Scope]) -> (String, PkceCodeVerifier, CsrfToken) {
    let (challenge, verifier) = PkceCodeChallenge::new_random_sha256();
    let mut req = client
        .authorize_url(CsrfToken::new_random)
        .add_extra_param("access_type", "offline")
        .add_extra_param("prompt", "consent")
        .set_pkce_challenge(challenge);
    for scope in scopes {
        req = req.add_scope(scope.clone());
    }
    let (url, csrf) = req.url();
    (url.to_string(), verifier, csrf)
}

#[derive(Debug, PartialEq, Eq)]
struct CodeResponse {
    code: String,
    state: String,
}

fn parse_callback(request: &str) -> AppResult<CodeResponse> {
    let first_line = request.lines().next().unwrap_or("");
    let path = first_line
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| AppError::Unexpected("invalid HTTP request".into()))?;
    let parsed = url::Url::parse(&format!("http://localhost{path}"))
        .map_err(|e| AppError::Unexpected(format!("failed to parse callback url: {e}")))?;

    if let Some((_, err)) = parsed.query_pairs().find(|(k, _)| k == "error") {
        warn!(error = %err, "OAuth consent was not granted");
        return Err(AppError::AuthExpired);
    }

    let code = parsed
        .query_pairs()
        .find(|(k, _)| k == "code")
        .map(|(_, v)| v.to_string())
        .ok_or_else(|| AppError::Unexpected("callback missing code parameter".into()))?;
    let state = parsed
        .query_pairs()
        .find(|(k, _)| k == "state")
        .map(|(_, v)| v.to_string())
        .unwrap_or_default();
    Ok(CodeResponse { code, state })
}

async fn listen_for_code(listener: TcpListener) -> AppResult<CodeResponse> {
    let (mut stream, _) = listener
        .accept()
        .await
        .map_err(|e| AppError::Unexpected(format!("redirect accept failed: {e}")))?;

    let mut buf = [0u8; 4096];
    let n = stream
        .read(&mut buf)
        .await
        .map_err(|e| AppError::Unexpected(format!("reading auth callback failed: {e}")))?;
    let parsed = parse_callback(&String::from_utf8_lossy(&buf[..n]));

    let body = if parsed.is_ok() {
        "Sign-in complete. You can close this tab."
    } else {
        "Sign-in failed. Return to the terminal."
    };
    let response = format!("HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\n\r\n{body}");
    let _ = stream.write_all(response.as_bytes()).await;
    parsed
}

fn open_in_browser(url: &str) {
    let attempt = if cfg!(target_os = "macos") {
        std::process::Command::new("open").arg(url).status()
    } else if cfg!(target_os = "windows") {
        std::process::Command::new("rundll32.exe")
            .args(["url.dll,FileProtocolHandler", url])
            .status()
    } else {
        std::process::Command::new("xdg-open").arg(url).status()
    };
    if let Err(e) = attempt {
        warn!("Could not auto-open browser: {e}. Open this URL manually:\n{url}");
    } else {
        println!("If your browser did not open, navigate to:\n{url}");
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct StoredToken {
    refresh_token: String,
}

/// Refresh-token persistence: OS keyring first, owner-only temp file when the
/// keyring is unavailable.
#[derive(Clone)]
struct TokenStore {
    account_id: String,
}

impl TokenStore {
    fn from_key(key: &str) -> Self {
        Self {
            account_id: key.to_string(),
        }
    }

    fn load(&self) -> AppResult<Option<StoredToken>> {
        match self.load_keyring() {
            Ok(Some(tok)) => return Ok(Some(tok)),
            Ok(None) => {}
            Err(e) => warn!("Keyring unavailable: {e}"),
        }

        self.load_file()
    }

    fn save(&self, refresh: &str) -> AppResult<()> {
        let token = StoredToken {
            refresh_token: refresh.to_string(),
        };
        let serialized =
            serde_json::to_string(&token).map_err(|e| AppError::Unexpected(format!("{e}")))?;

        if let Err(e) = self.save_keyring(&serialized) {
            warn!("Keyring save failed ({e}); writing to temp file as fallback");
            self.save_file(&serialized)?;
        }
        Ok(())
    }

    fn delete(&self) -> AppResult<()> {
        if let Ok(entry) = keyring::Entry::new(SERVICE_NAME, &self.account_id) {
            let _ = entry.delete_password();
        }
        let path = self.file_path();
        if path.exists() {
            fs::remove_file(&path)
                .map_err(|e| AppError::Unexpected(format!("removing token file: {e}")))?;
        }
        Ok(())
    }

    fn load_keyring(&self) -> Result<Option<StoredToken>, String> {
        let entry = keyring::Entry::new(SERVICE_NAME, &self.account_id)
            .map_err(|e| format!("keyring entry error: {e}"))?;
        match entry.get_password() {
            Ok(pwd) => serde_json::from_str(&pwd)
                .map(Some)
                .map_err(|e| format!("keyring token decode: {e}")),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(format!("keyring read: {e}")),
        }
    }

    fn save_keyring(&self, serialized: &str) -> Result<(), String> {
        let entry = keyring::Entry::new(SERVICE_NAME, &self.account_id)
            .map_err(|e| format!("keyring entry error: {e}"))?;
        entry
            .set_password(serialized)
            .map_err(|e| format!("keyring write: {e}"))
    }

    fn file_path(&self) -> PathBuf {
        let safe: String = self
            .account_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        std::env::temp_dir().join(format!("retromail_token_{safe}.json"))
    }

    fn load_file(&self) -> AppResult<Option<StoredToken>> {
        let path = self.file_path();
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(AppError::Unexpected(format!("reading token file: {e}"))),
        };
        match serde_json::from_str(&raw) {
            Ok(tok) => Ok(Some(tok)),
            Err(e) => {
                warn!(path = %path.display(), "Ignoring unreadable token file: {e}");
                Ok(None)
            }
        }
    }

    fn save_file(&self, serialized: &str) -> AppResult<()> {
        let tmp = self.file_path();

        let mut file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)
            .map_err(|e| AppError::Unexpected(format!("opening temp token file: {e}")))?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = file.set_permissions(fs::Permissions::from_mode(0o600));
        }

        file.write_all(serialized.as_bytes())
            .map_err(|e| AppError::Unexpected(format!("writing token file: {e}")))?;
        file.sync_all()
            .map_err(|e| AppError::Unexpected(format!("syncing token file: {e}")))?;
        warn!(
            path = %tmp.display(),
            "Token saved to temp file due to keyring issues; move/delete after debugging."
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle(expires_in_secs: Option<i64>) -> TokenBundle {
        TokenBundle {
            access_token: "ya29.token".into(),
            expires_at: expires_in_secs.map(|s| Utc::now() + Duration::seconds(s)),
            refresh_token: None,
        }
    }

    #[test]
    fn freshness_honours_skew() {
        let now = Utc::now();
        assert!(bundle(Some(3600)).is_fresh_at(now));
        assert!(!bundle(Some(30)).is_fresh_at(now));
        assert!(!bundle(Some(-10)).is_fresh_at(now));
        assert!(bundle(None).is_fresh_at(now));
    }

    #[tokio::test]
    async fn fresh_cached_token_is_returned_without_refresh() {
        let manager = TokenManager::new(OAuthCredentials::new("id", "secret"), "cached-test")
            .with_bundle(bundle(Some(3600)));
        assert_eq!(manager.access_token().await.unwrap(), "ya29.token");
    }

    #[tokio::test]
    async fn invalidated_token_without_refresh_token_reports_no_token() {
        let key = format!("retromail-test-{}", std::process::id());
        let manager = TokenManager::new(OAuthCredentials::new("id", "secret"), &key)
            .with_bundle(bundle(Some(3600)));
        manager.invalidate();
        let err = manager.access_token().await.unwrap_err();
        assert!(matches!(err, AppError::NoToken));
    }

    #[test]
    fn unreachable_token_endpoint_is_a_network_error() {
        use oauth2::basic::BasicErrorResponse;

        let err: RequestTokenError<std::io::Error, BasicErrorResponse> = RequestTokenError::Request(
            std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "connection refused"),
        );
        let mapped = refresh_failure(&err);
        assert!(matches!(mapped, AppError::Network(_)));
        assert!(!mapped.is_auth());
    }

    #[test]
    fn rejected_refresh_token_needs_sign_in() {
        use oauth2::basic::{BasicErrorResponse, BasicErrorResponseType};

        let err: RequestTokenError<std::io::Error, BasicErrorResponse> =
            RequestTokenError::ServerResponse(BasicErrorResponse::new(
                BasicErrorResponseType::InvalidGrant,
                Some("Token has been expired or revoked.".into()),
                None,
            ));
        assert!(matches!(refresh_failure(&err), AppError::NoToken));
    }

    #[test]
    fn callback_parsing_extracts_code_and_state() {
        let req = "GET /?state=abc&code=4%2F0Ad HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n";
        let parsed = parse_callback(req).unwrap();
        assert_eq!(
            parsed,
            CodeResponse {
                code: "4/0Ad".into(),
                state: "abc".into()
            }
        );
    }

    #[test]
    fn callback_with_error_is_rejected() {
        let req = "GET /?error=access_denied HTTP/1.1\r\n\r\n";
        assert!(matches!(parse_callback(req), Err(AppError::AuthExpired)));
    }

    #[test]
    fn scopes_cover_mail_and_identity() {
        let scopes: Vec<String> = mail_scopes().iter().map(|s| s.as_str().to_string()).collect();
        assert!(scopes.contains(&"https://mail.google.com/".to_string()));
        assert!(scopes.contains(&"email".to_string()));
    }
}
