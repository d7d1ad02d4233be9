//! Authorized-Keys Writer
//!
//! The only component that touches the filesystem on behalf of an account.
//! Every write runs the same fixed sequence:
//! 1. ensure `<home>/.ssh` exists (`0700`, owned by the account)
//! 2. move an existing `authorized_keys` to `authorized_keys.bak`
//! 3. create `authorized_keys` (`0600`), write it in full, chown it
//!
//! Any failing step aborts the write. Because the backup happens before the
//! new file is created, prior key material is never discarded.
//!
//! Home directories are controlled by the account, not by the agent, so
//! nothing here follows a symlink: `.ssh` is opened once with
//! `O_NOFOLLOW | O_DIRECTORY` and every later step (rename, create,
//! chown, chmod) goes through that descriptor or the file descriptor it
//! yields.

use std::ffi::CStr;
use std::fs::{self, DirBuilder, File, OpenOptions, Permissions};
use std::io::{Error, ErrorKind, Write};
use std::os::fd::{AsRawFd, FromRawFd};
use std::os::unix::fs::{fchown, DirBuilderExt, OpenOptionsExt, PermissionsExt};
use tracing::{debug, error, info, warn};

use super::types::{AgentError, SystemIdentity, WriteOutcome};

const SSH_DIR_MODE: u32 = 0o700;
const KEYS_FILE_MODE: u32 = 0o600;

const KEYS_NAME: &CStr = c"authorized_keys";
const BACKUP_NAME: &CStr = c"authorized_keys.bak";

/// Writes an account's authorized_keys file
pub trait KeysWriter {
    fn write(&self, identity: &SystemIdentity, content: &[u8]) -> Result<WriteOutcome, AgentError>;

    /// Undo `outcome`: move the backup back into place, or remove the
    /// written file when there was nothing to back up.
    fn restore(&self, identity: &SystemIdentity, outcome: &WriteOutcome) -> Result<(), AgentError>;
}

/// Writer that applies changes to the real filesystem
#[derive(Debug, Clone, Copy, Default)]
pub struct AuthorizedKeysWriter;

impl KeysWriter for AuthorizedKeysWriter {
    fn write(&self, identity: &SystemIdentity, content: &[u8]) -> Result<WriteOutcome, AgentError> {
        let (ssh_dir, created_dir) = open_ssh_dir(identity)?;
        let backup = backup_existing(&ssh_dir, identity)?;

        let path = identity.keys_file();
        write_keys_file(&ssh_dir, identity, content)?;

        info!(
            username = %identity.username,
            path = %path.display(),
            bytes = content.len(),
            "authorized_keys written"
        );

        Ok(WriteOutcome {
            path,
            backup,
            created_dir,
        })
    }

    fn restore(&self, identity: &SystemIdentity, outcome: &WriteOutcome) -> Result<(), AgentError> {
        let ssh_dir = open_dir_nofollow(identity)?;

        if let Some(backup) = &outcome.backup {
            renameat(&ssh_dir, BACKUP_NAME, KEYS_NAME).map_err(|e| AgentError::fs(backup, e))?;
            warn!(username = %identity.username, path = %outcome.path.display(), "Previous authorized_keys restored");
        } else {
            let rc = unsafe { libc::unlinkat(ssh_dir.as_raw_fd(), KEYS_NAME.as_ptr(), 0) };
            if rc != 0 {
                let e = Error::last_os_error();
                if e.kind() != ErrorKind::NotFound {
                    return Err(AgentError::fs(&outcome.path, e));
                }
            }
            warn!(username = %identity.username, path = %outcome.path.display(), "Written authorized_keys removed");
        }
        Ok(())
    }
}

/// Open `<home>/.ssh`, creating it when absent. Returns the directory
/// handle and whether it was created.
///
/// A missing home directory is an error: creating it here would leave it
/// owned by the agent rather than the account.
fn open_ssh_dir(identity: &SystemIdentity) -> Result<(File, bool), AgentError> {
    let home = &identity.home_dir;
    match fs::metadata(home) {
        Ok(meta) if meta.is_dir() => {}
        Ok(_) => return Err(AgentError::fs(home, Error::new(ErrorKind::Other, "home is not a directory"))),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            return Err(AgentError::fs(
                home,
                Error::new(ErrorKind::NotFound, "home directory does not exist; create the account's home first"),
            ))
        }
        Err(e) => return Err(AgentError::fs(home, e)),
    }

    let dir = identity.ssh_dir();
    match fs::symlink_metadata(&dir) {
        Ok(meta) if meta.file_type().is_symlink() => {
            return Err(AgentError::fs(&dir, Error::new(ErrorKind::Other, "is a symlink; refusing to follow it")))
        }
        Ok(meta) if !meta.is_dir() => {
            return Err(AgentError::fs(&dir, Error::new(ErrorKind::AlreadyExists, "exists but is not a directory")))
        }
        Ok(_) => return Ok((open_dir_nofollow(identity)?, false)),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(AgentError::fs(&dir, e)),
    }

    warn!(path = %dir.display(), "SSH directory does not exist yet, creating it");

    DirBuilder::new()
        .mode(SSH_DIR_MODE)
        .create(&dir)
        .map_err(|e| AgentError::fs(&dir, e))?;

    let handle = open_dir_nofollow(identity)?;
    fchown(&handle, Some(identity.uid), Some(identity.gid)).map_err(|e| AgentError::fs(&dir, e))?;
    // mode() is filtered through the umask
    handle
        .set_permissions(Permissions::from_mode(SSH_DIR_MODE))
        .map_err(|e| AgentError::fs(&dir, e))?;

    Ok((handle, true))
}

/// `.ssh` as a directory descriptor; fails on a symlink or non-directory
fn open_dir_nofollow(identity: &SystemIdentity) -> Result<File, AgentError> {
    let dir = identity.ssh_dir();
    OpenOptions::new()
        .read(true)
        .custom_flags(libc::O_NOFOLLOW | libc::O_DIRECTORY | libc::O_CLOEXEC)
        .open(&dir)
        .map_err(|e| AgentError::fs(&dir, e))
}

fn renameat(dir: &File, from: &CStr, to: &CStr) -> std::io::Result<()> {
    let fd = dir.as_raw_fd();
    let rc = unsafe { libc::renameat(fd, from.as_ptr(), fd, to.as_ptr()) };
    if rc == 0 {
        Ok(())
    } else {
        Err(Error::last_os_error())
    }
}

fn backup_existing(ssh_dir: &File, identity: &SystemIdentity) -> Result<Option<std::path::PathBuf>, AgentError> {
    let backup = identity.backup_file();

    // Renames the entry itself; a symlink at authorized_keys is moved, not followed.
    match renameat(ssh_dir, KEYS_NAME, BACKUP_NAME) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(AgentError::fs(&backup, e)),
    }

    warn!(
        username = %identity.username,
        backup = %backup.display(),
        "Existing authorized_keys moved to backup"
    );
    Ok(Some(backup))
}

fn write_keys_file(ssh_dir: &File, identity: &SystemIdentity, content: &[u8]) -> Result<(), AgentError> {
    let path = identity.keys_file();
    debug!(path = %path.display(), "Creating authorized_keys");

    // O_EXCL: the name was just vacated, anything there now was planted.
    let fd = unsafe {
        libc::openat(
            ssh_dir.as_raw_fd(),
            KEYS_NAME.as_ptr(),
            libc::O_WRONLY | libc::O_CREAT | libc::O_EXCL | libc::O_NOFOLLOW | libc::O_CLOEXEC,
            KEYS_FILE_MODE as libc::c_uint,
        )
    };
    if fd < 0 {
        let e = Error::last_os_error();
        error!(path = %path.display(), error = %e, "Failed to create authorized_keys");
        return Err(AgentError::fs(&path, e));
    }
    // SAFETY: openat returned a fresh descriptor that nothing else owns.
    let mut file = unsafe { File::from_raw_fd(fd) };

    fchown(&file, Some(identity.uid), Some(identity.gid)).map_err(|e| AgentError::fs(&path, e))?;
    file.set_permissions(Permissions::from_mode(KEYS_FILE_MODE))
        .map_err(|e| AgentError::fs(&path, e))?;
    file.write_all(content).map_err(|e| AgentError::fs(&path, e))?;
    file.sync_all().map_err(|e| AgentError::fs(&path, e))?;

    Ok(())
}
