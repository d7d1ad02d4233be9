//! Key Fetcher
//!
//! Retrieves one account's authorized_keys payload from the Deployer API
//! and gates it on the managed-block markers before anything may be
//! written.

use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::{debug, info};

use super::types::{mask_api_key, Account, AgentError, END_MARKER, START_MARKER};
use crate::config::SyncTarget;

/// Bound on every request to the Deployer API
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// `DeployerAgent-v<version>;<os>`
pub fn user_agent() -> String {
    format!(
        "DeployerAgent-v{};{}",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS
    )
}

/// Source of remote keys payloads
#[async_trait]
pub trait KeySource {
    /// Fetch the raw payload for `account`. Validation is applied by
    /// [`fetch_validated`], not by implementors.
    async fn fetch(&self, target: &SyncTarget, account: &Account) -> Result<String, AgentError>;
}

/// Fetch from `source` and reject payloads missing either marker
pub async fn fetch_validated<K>(
    source: &K,
    target: &SyncTarget,
    account: &Account,
) -> Result<String, AgentError>
where
    K: KeySource + ?Sized,
{
    let payload = source.fetch(target, account).await?;
    validate_payload(&account.username, &payload)?;
    Ok(payload)
}

/// A payload is only valid when it frames the managed block with both markers
pub fn validate_payload(username: &str, payload: &str) -> Result<(), AgentError> {
    if payload.contains(START_MARKER) && payload.contains(END_MARKER) {
        Ok(())
    } else {
        Err(AgentError::Validation(username.to_string()))
    }
}

/// `{base}keys/{org}/{server}/{api_key}`
pub fn keys_url(target: &SyncTarget, api_key: &str) -> String {
    format!(
        "{}keys/{}/{}/{}",
        target.base_domain, target.org_id, target.server_id, api_key
    )
}

/// Keys URL with all but the last four characters of the API key masked
pub fn redacted_keys_url(target: &SyncTarget, api_key: &str) -> String {
    keys_url(target, &mask_api_key(api_key))
}

/// Key source backed by the Deployer HTTP API
pub struct HttpKeySource {
    client: Client,
    timeout: Duration,
}

impl HttpKeySource {
    /// Create a source with the standard 10 second timeout
    pub fn new() -> Result<Self, AgentError> {
        Self::with_timeout(REQUEST_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, AgentError> {
        let client = Client::builder()
            .user_agent(user_agent())
            .timeout(timeout)
            .build()
            .map_err(|e| AgentError::Network(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self { client, timeout })
    }
}

#[async_trait]
impl KeySource for HttpKeySource {
    async fn fetch(&self, target: &SyncTarget, account: &Account) -> Result<String, AgentError> {
        let url = keys_url(target, &account.api_key);
        info!(
            username = %account.username,
            url = %redacted_keys_url(target, &account.api_key),
            "📥 Loading keys"
        );

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| self.network_error(&account.username, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AgentError::Network(format!(
                "Deployer API returned {} for `{}`; check the account's API key",
                status, account.username
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| self.network_error(&account.username, e))?;

        debug!(username = %account.username, bytes = body.len(), "Keys payload received");
        Ok(body)
    }
}

impl HttpKeySource {
    fn network_error(&self, username: &str, e: reqwest::Error) -> AgentError {
        if e.is_timeout() {
            AgentError::Network(format!(
                "Request for `{}` timed out after {:?}",
                username, self.timeout
            ))
        } else {
            AgentError::Network(format!("Request for `{}` failed: {}", username, e))
        }
    }
}
