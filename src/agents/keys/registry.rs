//! Account Registry
//!
//! The ordered list of accounts this host manages. The in-memory list only
//! changes after the backing store has accepted the new list, so a failed
//! persist never leaves a phantom registration behind.

use tracing::{debug, info};

use super::types::{Account, AgentError};
use crate::config::ConfigStore;

/// Durable backing for the registry
pub trait AccountStore {
    /// Read every persisted account, in order
    fn load_accounts(&self) -> Result<Vec<Account>, AgentError>;

    /// Replace the persisted account list
    fn save_accounts(&self, accounts: &[Account]) -> Result<(), AgentError>;
}

impl AccountStore for ConfigStore {
    fn load_accounts(&self) -> Result<Vec<Account>, AgentError> {
        Ok(self.load()?.accounts)
    }

    /// Read-modify-write so every other key in the document survives.
    fn save_accounts(&self, accounts: &[Account]) -> Result<(), AgentError> {
        let mut config = self.load()?;
        config.accounts = accounts.to_vec();
        self.save(&config)
    }
}

/// Registry of managed accounts
pub struct AccountRegistry<S: AccountStore> {
    store: S,
    accounts: Vec<Account>,
}

impl<S: AccountStore> AccountRegistry<S> {
    /// Load the registry from its store
    pub fn open(store: S) -> Result<Self, AgentError> {
        let accounts = store.load_accounts()?;
        debug!(count = accounts.len(), "Loaded account registry");
        Ok(Self { store, accounts })
    }

    /// All accounts in persisted order
    pub fn list(&self) -> &[Account] {
        &self.accounts
    }

    pub fn contains(&self, username: &str) -> bool {
        self.accounts.iter().any(|a| a.username == username)
    }

    /// Append `account` and persist.
    ///
    /// Rejects a username that is already registered without touching the
    /// store.
    pub fn add(&mut self, account: Account) -> Result<(), AgentError> {
        if self.contains(&account.username) {
            return Err(AgentError::DuplicateAccount(account.username));
        }

        let mut updated = self.accounts.clone();
        updated.push(account);
        self.commit(updated)?;

        info!(count = self.accounts.len(), "Account registered");
        Ok(())
    }

    /// Drop every account named `username` and persist.
    ///
    /// Persists even when nothing matched. Returns how many entries were
    /// removed.
    pub fn remove(&mut self, username: &str) -> Result<usize, AgentError> {
        let updated: Vec<Account> = self
            .accounts
            .iter()
            .filter(|a| a.username != username)
            .cloned()
            .collect();
        let removed = self.accounts.len() - updated.len();

        self.commit(updated)?;

        debug!(username = %username, removed, "Account registry updated");
        Ok(removed)
    }

    #[cfg(test)]
    pub(crate) fn store(&self) -> &S {
        &self.store
    }

    fn commit(&mut self, updated: Vec<Account>) -> Result<(), AgentError> {
        self.store.save_accounts(&updated)?;
        self.accounts = updated;
        Ok(())
    }
}
