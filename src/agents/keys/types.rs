//! Types for authorized_keys synchronization
//!
//! Accounts, resolved OS identities, the sync report, and the error
//! taxonomy shared by every collaborator of the key-sync agent.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Marker that opens the managed block in a remote keys payload
pub const START_MARKER: &str = "START Deployer Managed Keys File";

/// Marker that closes the managed block in a remote keys payload
pub const END_MARKER: &str = "END Deployer Managed Keys File";

/// Placeholder written when an account is first brought under management.
///
/// Contains no keys; the next sync replaces it with the remote payload.
pub const BOOTSTRAP_TEMPLATE: &str = "# This file is managed by Deployer.\n\
# Any changes made will be overwritten.\n\
# If you do not have an account please contact the server owner for assistance.\n";

/// A system account managed by this host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// OS username (e.g., "deploy")
    pub username: String,
    /// Remote API key identifying this account's key set
    #[serde(rename = "apiKey", alias = "apikey")]
    pub api_key: String,
}

impl Account {
    pub fn new(username: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            api_key: api_key.into(),
        }
    }
}

/// Mask all but the last four characters of an API key for display
pub fn mask_api_key(key: &str) -> String {
    let count = key.chars().count();
    let tail: String = key.chars().skip(count.saturating_sub(4)).collect();
    format!("****{}", tail)
}

/// OS-level identity resolved for a username at call time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemIdentity {
    pub username: String,
    pub uid: u32,
    pub gid: u32,
    pub home_dir: PathBuf,
}

impl SystemIdentity {
    /// `<home>/.ssh`
    pub fn ssh_dir(&self) -> PathBuf {
        self.home_dir.join(".ssh")
    }

    /// `<home>/.ssh/authorized_keys`
    pub fn keys_file(&self) -> PathBuf {
        self.ssh_dir().join("authorized_keys")
    }

    /// `<home>/.ssh/authorized_keys.bak`
    pub fn backup_file(&self) -> PathBuf {
        self.ssh_dir().join("authorized_keys.bak")
    }
}

/// What a single authorized_keys write did on disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    /// The authorized_keys file that was written
    pub path: PathBuf,
    /// Where the previous file was moved, if one existed
    pub backup: Option<PathBuf>,
    /// Whether the `.ssh` directory had to be created
    pub created_dir: bool,
}

/// Result of a sync pass over the registry
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    /// Accounts whose authorized_keys file was rewritten
    pub synced: Vec<String>,
    /// Accounts skipped because the OS user no longer exists
    pub skipped: Vec<String>,
}

impl SyncReport {
    /// Format the report for display
    pub fn display(&self) -> String {
        let skipped = if self.skipped.is_empty() {
            "none".to_string()
        } else {
            self.skipped.join(", ")
        };
        format!(
            "Sync complete:\n  Synced: {}\n  Skipped: {}",
            self.synced.len(),
            skipped
        )
    }
}

/// Errors that can occur while managing authorized_keys
#[derive(Debug, Error)]
pub enum AgentError {
    /// No such user in the OS account database
    #[error("Unable to find system user `{0}`. Check the username, and re-create the user on Deployer if needed")]
    UnknownSystemAccount(String),

    /// The OS account database could not be queried
    #[error("Failed to look up system user `{username}`: {source}")]
    Lookup {
        username: String,
        #[source]
        source: std::io::Error,
    },

    /// Add was called for a username already in the registry
    #[error("The user `{0}` is already configured - no changes needed")]
    DuplicateAccount(String),

    /// The config document could not be read or parsed
    #[error("Failed to read Deployer configuration at {path}: {message}")]
    ConfigRead { path: PathBuf, message: String },

    /// A required setting is missing or blank
    #[error("The {0} is missing from your Deployer configuration. Check this server is configured for Deployer and try again")]
    Configuration(&'static str),

    /// Transport failure, timeout, or non-success status
    #[error("Network error: {0}")]
    Network(String),

    /// The remote payload lacks the managed-block markers
    #[error("The response from the Deployer API for `{0}` was invalid (missing managed keys markers). Contact Deployer for assistance")]
    Validation(String),

    /// I/O failure while creating, backing up, writing, or chowning
    #[error("Filesystem error at {path}: {source}. Check the agent is running with sufficient privileges")]
    FileSystem {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl AgentError {
    pub(crate) fn fs(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        AgentError::FileSystem {
            path: path.into(),
            source,
        }
    }
}
