//! Key Sync Agent
//!
//! Keeps each managed system account's `~/.ssh/authorized_keys` in step
//! with the Deployer API.
//!
//! ## Operations
//!
//! - `add`: check the OS user exists, write the bootstrap file, then
//!   register the account
//! - `remove`: deregister the account; files on disk are left as they are
//! - `sync`: for every registered account, resolve, fetch, validate, write
//!
//! ## Example Usage
//!
//! ```ignore
//! use deployer_agent::agents::keys::{HttpKeySource, KeySyncAgent};
//! use deployer_agent::config::ConfigStore;
//!
//! let store = ConfigStore::new("/etc/deployer/config.yaml");
//! let target = store.load()?.sync_target()?;
//! let agent = KeySyncAgent::open(store)?;
//!
//! let report = agent.sync(&HttpKeySource::new()?, &target).await?;
//! println!("{}", report.display());
//! ```

pub mod fetcher;
pub mod registry;
pub mod resolver;
pub mod types;
pub mod writer;

pub use fetcher::{fetch_validated, validate_payload, HttpKeySource, KeySource};
pub use registry::{AccountRegistry, AccountStore};
pub use resolver::{AccountResolver, SystemAccountResolver};
pub use types::{
    mask_api_key, Account, AgentError, SyncReport, SystemIdentity, WriteOutcome, BOOTSTRAP_TEMPLATE,
    END_MARKER, START_MARKER,
};
pub use writer::{AuthorizedKeysWriter, KeysWriter};

use tracing::{error, info, warn};

use crate::config::{ConfigStore, SyncTarget};

/// Key Sync Agent
///
/// Owns the account registry and the two OS-facing collaborators. One
/// instance serves one invocation; accounts are processed sequentially.
pub struct KeySyncAgent<S: AccountStore, R: AccountResolver, W: KeysWriter> {
    registry: AccountRegistry<S>,
    resolver: R,
    writer: W,
}

impl KeySyncAgent<ConfigStore, SystemAccountResolver, AuthorizedKeysWriter> {
    /// Agent over the host's config file, passwd database, and filesystem
    pub fn open(store: ConfigStore) -> Result<Self, AgentError> {
        Ok(Self::new(
            AccountRegistry::open(store)?,
            SystemAccountResolver,
            AuthorizedKeysWriter,
        ))
    }
}

impl<S: AccountStore, R: AccountResolver, W: KeysWriter> KeySyncAgent<S, R, W> {
    pub fn new(registry: AccountRegistry<S>, resolver: R, writer: W) -> Self {
        Self {
            registry,
            resolver,
            writer,
        }
    }

    /// Registered accounts, in order
    pub fn accounts(&self) -> &[Account] {
        self.registry.list()
    }

    /// Bring `username` under management.
    ///
    /// The bootstrap file is written before the registry is touched, so a
    /// failed write never leaves a registered account without a managed
    /// file. If registering fails afterwards, the write is rolled back.
    pub fn add(&mut self, username: &str, api_key: &str) -> Result<WriteOutcome, AgentError> {
        let identity = self.resolver.resolve(username)?;
        info!(username = %identity.username, "✅ Found system user, setting up Deployer for the account");

        if self.registry.contains(username) {
            return Err(AgentError::DuplicateAccount(username.to_string()));
        }

        let outcome = self
            .writer
            .write(&identity, BOOTSTRAP_TEMPLATE.as_bytes())?;

        if let Err(e) = self.registry.add(Account::new(username, api_key)) {
            error!(username = %username, error = %e, "Account could not be registered, undoing bootstrap write");
            if let Err(undo) = self.writer.restore(&identity, &outcome) {
                error!(
                    username = %username,
                    path = %outcome.path.display(),
                    backup = ?outcome.backup,
                    error = %undo,
                    "Bootstrap write could not be undone; previous keys remain in the backup file"
                );
            }
            return Err(e);
        }

        info!(username = %username, "The user is now managed by Deployer");
        Ok(outcome)
    }

    /// Stop managing `username`. Deployed keys stay in place.
    ///
    /// The OS lookup is advisory: the user may already have been deleted
    /// from the host, which must not block deregistration.
    pub fn remove(&mut self, username: &str) -> Result<usize, AgentError> {
        if let Err(e) = self.resolver.resolve(username) {
            warn!(username = %username, error = %e, "System user not found, removing registration anyway");
        }

        let removed = self.registry.remove(username)?;
        if removed == 0 {
            warn!(username = %username, "Account was not registered, nothing to remove");
        } else {
            info!(username = %username, "🗑️  Account removed from Deployer");
        }
        info!("The authorized_keys file has been left intact so it can be updated manually");

        Ok(removed)
    }

    /// Sync every registered account once, in registry order.
    ///
    /// A missing OS user skips that account. A fetch or validation failure
    /// aborts the run: it points at the remote contract, not the account.
    /// Filesystem failures abort the run as well.
    pub async fn sync<K>(&self, source: &K, target: &SyncTarget) -> Result<SyncReport, AgentError>
    where
        K: KeySource + ?Sized,
    {
        let mut report = SyncReport::default();

        if self.registry.list().is_empty() {
            warn!("No accounts are configured for Deployer, nothing to sync");
            return Ok(report);
        }

        info!(accounts = self.registry.list().len(), "🔄 Starting key sync");

        for account in self.registry.list() {
            let identity = match self.resolver.resolve(&account.username) {
                Ok(identity) => identity,
                Err(e) => {
                    warn!(username = %account.username, error = %e, "Skipping account");
                    report.skipped.push(account.username.clone());
                    continue;
                }
            };

            let payload = fetch_validated(source, target, account).await.map_err(|e| {
                error!(username = %account.username, error = %e, "Aborting sync");
                e
            })?;

            let outcome = self.writer.write(&identity, payload.as_bytes())?;
            info!(username = %account.username, path = %outcome.path.display(), "✅ Done");
            report.synced.push(account.username.clone());
        }

        Ok(report)
    }
}
