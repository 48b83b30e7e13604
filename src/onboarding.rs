use crate::errors::AppResult;
use crate::oauth::{fetch_user_profile, mail_scopes, TokenManager};
use crate::types::Account;
use tracing::info;

/// Run the OAuth flow, look up who signed in, and return the Account.
pub async fn sign_in(tokens: &TokenManager) -> AppResult<Account> {
    let bundle = tokens.sign_in(&mail_scopes()).await?;
    let (email, name) = fetch_user_profile(&bundle.access_token).await?;

    let mut account = Account::new(email);
    account.name = name.unwrap_or_default();
    account.description = "Gmail".to_string();

    info!(email = %account.email, "Signed in via OAuth");
    Ok(account)
}
