//! Agent Configuration
//!
//! Strongly-typed view of `/etc/deployer/config.yaml`, loaded once per
//! invocation and handed to the agents that need it. The store owns the
//! whole document: keys this agent does not understand are carried through
//! a load/save cycle untouched.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::agents::keys::{Account, AgentError};

/// Default config location on a managed host
pub const DEFAULT_CONFIG_PATH: &str = "/etc/deployer/config.yaml";

/// API base used when `baseDomain` is not set
pub const DEFAULT_BASE_DOMAIN: &str = "https://deployer.codions.com/api/";

/// Parsed configuration document
///
/// Field names follow the documented camelCase spelling; the lower-cased
/// spellings written by older agents are accepted on read.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Managed accounts, in registration order
    #[serde(default, deserialize_with = "null_as_empty")]
    pub accounts: Vec<Account>,

    /// Organisation identifier
    #[serde(
        rename = "orgId",
        alias = "orgid",
        default,
        deserialize_with = "scalar_string",
        skip_serializing_if = "String::is_empty",
    )]
    pub org_id: String,

    /// Server identifier (doubles as the server API key)
    #[serde(
        rename = "serverId",
        alias = "serverid",
        default,
        deserialize_with = "scalar_string",
        skip_serializing_if = "String::is_empty",
    )]
    pub server_id: String,

    /// Team API key, required for monitoring
    #[serde(
        rename = "teamAPIKey",
        alias = "teamapikey",
        default,
        deserialize_with = "scalar_string",
        skip_serializing_if = "String::is_empty",
    )]
    pub team_api_key: String,

    /// Optional API base override
    #[serde(
        rename = "baseDomain",
        alias = "basedomain",
        default,
        skip_serializing_if = "Option::is_none",
    )]
    pub base_domain: Option<String>,

    /// Keys not modelled above, preserved on write
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_yaml::Value>,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Vec<Account>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Vec<Account>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Accept `orgId: 42` as well as `orgId: "42"`
fn scalar_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    match serde_yaml::Value::deserialize(deserializer)? {
        serde_yaml::Value::Null => Ok(String::new()),
        serde_yaml::Value::String(s) => Ok(s),
        serde_yaml::Value::Number(n) => Ok(n.to_string()),
        serde_yaml::Value::Bool(b) => Ok(b.to_string()),
        other => Err(D::Error::custom(format!(
            "expected a string, found {:?}",
            other
        ))),
    }
}

/// Validated settings needed to talk to the keys endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncTarget {
    pub org_id: String,
    pub server_id: String,
    /// Always ends with `/`
    pub base_domain: String,
}

/// Validated settings needed to post monitoring data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorTarget {
    pub server_id: String,
    pub team_api_key: String,
    /// Always ends with `/`
    pub base_domain: String,
}

impl AgentConfig {
    /// Effective API base, normalised to end with a slash
    pub fn base_domain(&self) -> String {
        let base = self
            .base_domain
            .as_deref()
            .map(str::trim)
            .filter(|b| !b.is_empty())
            .unwrap_or(DEFAULT_BASE_DOMAIN);

        if base.ends_with('/') {
            base.to_string()
        } else {
            format!("{}/", base)
        }
    }

    /// Validate the settings a sync needs
    pub fn sync_target(&self) -> Result<SyncTarget, AgentError> {
        Ok(SyncTarget {
            org_id: required(&self.org_id, "organisation id (orgId)")?,
            server_id: required(&self.server_id, "server API key (serverId)")?,
            base_domain: self.base_domain(),
        })
    }

    /// Validate the settings a monitoring post needs
    pub fn monitor_target(&self) -> Result<MonitorTarget, AgentError> {
        required(&self.org_id, "organisation id (orgId)")?;
        Ok(MonitorTarget {
            server_id: required(&self.server_id, "server API key (serverId)")?,
            team_api_key: required(&self.team_api_key, "team API key (teamAPIKey)")?,
            base_domain: self.base_domain(),
        })
    }
}

fn required(value: &str, name: &'static str) -> Result<String, AgentError> {
    let value = value.trim();
    if value.is_empty() {
        Err(AgentError::Configuration(name))
    } else {
        Ok(value.to_string())
    }
}

/// Read-full / replace-full access to the config document on disk
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the document. A missing file is an empty configuration.
    pub fn load(&self) -> Result<AgentConfig, AgentError> {
        debug!(path = %self.path.display(), "Loading configuration");

        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No configuration file, using defaults");
                return Ok(AgentConfig::default());
            }
            Err(e) => return Err(self.read_error(e)),
        };

        if contents.trim().is_empty() {
            return Ok(AgentConfig::default());
        }

        serde_yaml::from_str(&contents).map_err(|e| self.read_error(e))
    }

    /// Replace the document on disk with `config`.
    ///
    /// Written to a sibling temp file with mode `0600` and renamed into
    /// place, so readers never see a partial document.
    pub fn save(&self, config: &AgentConfig) -> Result<(), AgentError> {
        use std::io::Write;
        use std::os::unix::fs::OpenOptionsExt;

        let yaml = serde_yaml::to_string(config).map_err(|e| self.encode_error(e))?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| AgentError::fs(parent, e))?;
        }

        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);

        {
            let mut f = std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&tmp_path)
                .map_err(|e| AgentError::fs(&tmp_path, e))?;
            f.write_all(yaml.as_bytes())
                .map_err(|e| AgentError::fs(&tmp_path, e))?;
            f.sync_all().map_err(|e| AgentError::fs(&tmp_path, e))?;
        }

        std::fs::rename(&tmp_path, &self.path).map_err(|e| {
            let _ = std::fs::remove_file(&tmp_path);
            AgentError::fs(&self.path, e)
        })?;

        debug!(path = %self.path.display(), accounts = config.accounts.len(), "Configuration saved");
        Ok(())
    }

    fn read_error(&self, e: impl std::fmt::Display) -> AgentError {
        AgentError::ConfigRead {
            path: self.path.clone(),
            message: e.to_string(),
        }
    }

    /// Nothing reached the disk; surfaced as a write failure, not a read one
    fn encode_error(&self, e: impl std::fmt::Display) -> AgentError {
        AgentError::fs(
            &self.path,
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("could not encode configuration: {e}"),
            ),
        )
    }
}
