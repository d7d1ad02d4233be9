//! End-to-end reconciliation against a real config file and real home
//! directories under a temp root. Every "system user" resolves to the
//! uid/gid running the tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fs;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use deployer_agent::agents::keys::{
    Account, AccountRegistry, AccountResolver, AgentError, AuthorizedKeysWriter, KeySource,
    KeySyncAgent, SystemIdentity, BOOTSTRAP_TEMPLATE, END_MARKER, START_MARKER,
};
use deployer_agent::config::{ConfigStore, SyncTarget};

struct TempHomes {
    root: PathBuf,
    users: Vec<String>,
}

impl AccountResolver for TempHomes {
    fn resolve(&self, username: &str) -> Result<SystemIdentity, AgentError> {
        if !self.users.iter().any(|u| u == username) {
            return Err(AgentError::UnknownSystemAccount(username.to_string()));
        }
        let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
        Ok(SystemIdentity {
            username: username.to_string(),
            uid,
            gid,
            home_dir: self.root.join(username),
        })
    }
}

struct FixedSource(HashMap<String, String>);

#[async_trait]
impl KeySource for FixedSource {
    async fn fetch(&self, _target: &SyncTarget, account: &Account) -> Result<String, AgentError> {
        self.0
            .get(&account.api_key)
            .cloned()
            .ok_or_else(|| AgentError::Network(format!("unexpected key for {}", account.username)))
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    config: PathBuf,
    homes: PathBuf,
}

impl Fixture {
    fn new(config_yaml: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("etc").join("config.yaml");
        fs::create_dir_all(config.parent().unwrap()).unwrap();
        fs::write(&config, config_yaml).unwrap();
        let homes = dir.path().join("home");
        fs::create_dir_all(&homes).unwrap();
        Self {
            _dir: dir,
            config,
            homes,
        }
    }

    /// Agent whose resolver knows `users`, each with an existing home
    fn agent(&self, users: &[&str]) -> KeySyncAgent<ConfigStore, TempHomes, AuthorizedKeysWriter> {
        for user in users {
            fs::create_dir_all(self.homes.join(user)).unwrap();
        }
        let registry = AccountRegistry::open(ConfigStore::new(&self.config)).unwrap();
        let resolver = TempHomes {
            root: self.homes.clone(),
            users: users.iter().map(|u| u.to_string()).collect(),
        };
        KeySyncAgent::new(registry, resolver, AuthorizedKeysWriter)
    }

    fn keys_file(&self, user: &str) -> PathBuf {
        self.homes.join(user).join(".ssh").join("authorized_keys")
    }

    fn target(&self) -> SyncTarget {
        ConfigStore::new(&self.config)
            .load()
            .unwrap()
            .sync_target()
            .unwrap()
    }
}

fn payload(user: &str) -> String {
    format!("# {START_MARKER}\nssh-ed25519 AAAAC3Nz {user}@laptop\n# {END_MARKER}\n")
}

fn mode(path: &Path) -> u32 {
    fs::metadata(path).unwrap().permissions().mode() & 0o777
}

#[test]
fn add_bootstraps_and_persists() {
    let fx = Fixture::new("orgId: org\nserverId: srv\n");
    let mut agent = fx.agent(&["bob"]);

    agent.add("bob", "key123").unwrap();

    let cfg = ConfigStore::new(&fx.config).load().unwrap();
    assert_eq!(cfg.accounts, vec![Account::new("bob", "key123")]);
    assert_eq!(cfg.org_id, "org");
    assert_eq!(fs::read_to_string(fx.keys_file("bob")).unwrap(), BOOTSTRAP_TEMPLATE);
    assert_eq!(mode(&fx.keys_file("bob")), 0o600);
    assert_eq!(mode(fx.keys_file("bob").parent().unwrap()), 0o700);
}

#[test]
fn add_preserves_existing_keys_in_backup() {
    let fx = Fixture::new("");
    let ssh = fx.homes.join("alice").join(".ssh");
    fs::create_dir_all(&ssh).unwrap();
    fs::write(ssh.join("authorized_keys"), "OLDKEYS").unwrap();

    fx.agent(&["alice"]).add("alice", "k1").unwrap();

    assert_eq!(fs::read_to_string(ssh.join("authorized_keys.bak")).unwrap(), "OLDKEYS");
    assert_eq!(fs::read_to_string(ssh.join("authorized_keys")).unwrap(), BOOTSTRAP_TEMPLATE);
}

#[test]
fn add_that_cannot_register_restores_previous_keys() {
    let fx = Fixture::new("orgId: org\n");
    let ssh = fx.homes.join("alice").join(".ssh");
    fs::create_dir_all(&ssh).unwrap();
    fs::write(ssh.join("authorized_keys"), "LIVEKEYS").unwrap();
    let mut agent = fx.agent(&["alice"]);
    // A directory where the config's temp file goes makes every save fail.
    let mut tmp = fx.config.clone().into_os_string();
    tmp.push(".tmp");
    fs::create_dir(&tmp).unwrap();

    let err = agent.add("alice", "k1").unwrap_err();

    assert!(matches!(err, AgentError::FileSystem { .. }));
    assert_eq!(fs::read_to_string(ssh.join("authorized_keys")).unwrap(), "LIVEKEYS");
    assert!(!ssh.join("authorized_keys.bak").exists());
    assert!(ConfigStore::new(&fx.config).load().unwrap().accounts.is_empty());
}

#[test]
fn second_add_is_rejected_and_first_kept() {
    let fx = Fixture::new("");
    let mut agent = fx.agent(&["alice"]);

    agent.add("alice", "k1").unwrap();
    let err = agent.add("alice", "k2").unwrap_err();
    assert!(matches!(err, AgentError::DuplicateAccount(_)));

    // A fresh agent sees exactly what was persisted.
    let reopened = fx.agent(&["alice"]);
    assert_eq!(reopened.accounts(), &[Account::new("alice", "k1")]);
    assert!(!fx
        .keys_file("alice")
        .with_file_name("authorized_keys.bak")
        .exists());
}

#[test]
fn remove_leaves_files_and_is_idempotent() {
    let fx = Fixture::new("");
    let mut agent = fx.agent(&["alice"]);
    agent.add("alice", "k1").unwrap();

    assert_eq!(agent.remove("alice").unwrap(), 1);
    assert_eq!(agent.remove("alice").unwrap(), 0);

    assert!(fx.agent(&["alice"]).accounts().is_empty());
    assert_eq!(fs::read_to_string(fx.keys_file("alice")).unwrap(), BOOTSTRAP_TEMPLATE);
}

#[tokio::test]
async fn sync_writes_valid_accounts_and_skips_missing_users() {
    let fx = Fixture::new(
        "accounts:\n- username: alice\n  apiKey: ka\n- username: ghost\n  apiKey: kg\n- username: carol\n  apiKey: kc\norgId: org\nserverId: srv\n",
    );
    let agent = fx.agent(&["alice", "carol"]);
    let source = FixedSource(HashMap::from([
        ("ka".to_string(), payload("alice")),
        ("kg".to_string(), payload("ghost")),
        ("kc".to_string(), payload("carol")),
    ]));

    let report = agent.sync(&source, &fx.target()).await.unwrap();

    assert_eq!(report.synced, vec!["alice", "carol"]);
    assert_eq!(report.skipped, vec!["ghost"]);
    assert_eq!(fs::read_to_string(fx.keys_file("alice")).unwrap(), payload("alice"));
    assert_eq!(fs::read_to_string(fx.keys_file("carol")).unwrap(), payload("carol"));
    assert!(!fx.homes.join("ghost").exists());

    let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
    for user in ["alice", "carol"] {
        let file = fs::metadata(fx.keys_file(user)).unwrap();
        let dir = fs::metadata(fx.keys_file(user).parent().unwrap()).unwrap();
        assert_eq!((file.uid(), file.gid()), (uid, gid));
        assert_eq!((dir.uid(), dir.gid()), (uid, gid));
    }
}

#[tokio::test]
async fn sync_rejects_payload_missing_end_marker() {
    let fx = Fixture::new(
        "accounts:\n- username: alice\n  apiKey: ka\n- username: carol\n  apiKey: kc\norgId: org\nserverId: srv\n",
    );
    let agent = fx.agent(&["alice", "carol"]);
    let source = FixedSource(HashMap::from([
        ("ka".to_string(), format!("# {START_MARKER}\nssh-ed25519 AAAA alice\n")),
        ("kc".to_string(), payload("carol")),
    ]));

    let err = agent.sync(&source, &fx.target()).await.unwrap_err();

    assert!(matches!(err, AgentError::Validation(_)));
    assert!(!fx.keys_file("alice").exists());
    assert!(!fx.keys_file("carol").exists());
}

#[tokio::test]
async fn sync_backs_up_bootstrap_file() {
    let fx = Fixture::new("orgId: org\nserverId: srv\n");
    let mut agent = fx.agent(&["bob"]);
    agent.add("bob", "kb").unwrap();

    let source = FixedSource(HashMap::from([("kb".to_string(), payload("bob"))]));
    agent.sync(&source, &fx.target()).await.unwrap();

    let backup = fx.keys_file("bob").with_file_name("authorized_keys.bak");
    assert_eq!(fs::read_to_string(backup).unwrap(), BOOTSTRAP_TEMPLATE);
    assert_eq!(fs::read_to_string(fx.keys_file("bob")).unwrap(), payload("bob"));
}

#[test]
fn sync_target_requires_settings() {
    let fx = Fixture::new("accounts: []\norgId: org\n");
    let err = ConfigStore::new(&fx.config)
        .load()
        .unwrap()
        .sync_target()
        .unwrap_err();
    assert!(matches!(err, AgentError::Configuration(_)));
}
