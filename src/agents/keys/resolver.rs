//! System Account Resolver
//!
//! Looks a username up in the OS account database (`getpwnam_r`) and
//! returns the uid, gid, and home directory. Nothing is cached: every call
//! asks the OS again.

use std::ffi::{CStr, CString, OsStr};
use std::os::unix::ffi::OsStrExt;
use std::path::PathBuf;
use tracing::debug;

use super::types::{AgentError, SystemIdentity};

/// Upper bound for the `getpwnam_r` scratch buffer
const MAX_BUFFER: usize = 1 << 20;

/// Resolves usernames to OS identities
pub trait AccountResolver {
    fn resolve(&self, username: &str) -> Result<SystemIdentity, AgentError>;
}

/// Resolver backed by the host's passwd database (files, NSS, LDAP, ...)
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemAccountResolver;

impl AccountResolver for SystemAccountResolver {
    fn resolve(&self, username: &str) -> Result<SystemIdentity, AgentError> {
        debug!(username = %username, "Resolving system account");

        match lookup_passwd(username) {
            Ok(Some(identity)) => {
                debug!(
                    username = %username,
                    uid = identity.uid,
                    gid = identity.gid,
                    home = %identity.home_dir.display(),
                    "Found system account"
                );
                Ok(identity)
            }
            Ok(None) => Err(AgentError::UnknownSystemAccount(username.to_string())),
            Err(source) => Err(AgentError::Lookup {
                username: username.to_string(),
                source,
            }),
        }
    }
}

fn lookup_passwd(username: &str) -> std::io::Result<Option<SystemIdentity>> {
    // A name with an interior NUL cannot exist in the database.
    let Ok(c_name) = CString::new(username) else {
        return Ok(None);
    };

    let suggested = unsafe { libc::sysconf(libc::_SC_GETPW_R_SIZE_MAX) };
    let mut buf_len = if suggested > 0 { suggested as usize } else { 1024 };

    loop {
        let mut buf: Vec<libc::c_char> = vec![0; buf_len];
        let mut pwd = std::mem::MaybeUninit::<libc::passwd>::uninit();
        let mut result: *mut libc::passwd = std::ptr::null_mut();

        let rc = unsafe {
            libc::getpwnam_r(
                c_name.as_ptr(),
                pwd.as_mut_ptr(),
                buf.as_mut_ptr(),
                buf.len(),
                &mut result,
            )
        };

        if rc == libc::ERANGE && buf_len < MAX_BUFFER {
            buf_len *= 2;
            continue;
        }

        // POSIX lets implementations report "no such user" through any of these.
        if matches!(rc, libc::ENOENT | libc::ESRCH | libc::EBADF | libc::EPERM) {
            return Ok(None);
        }
        if rc != 0 {
            return Err(std::io::Error::from_raw_os_error(rc));
        }
        if result.is_null() {
            return Ok(None);
        }

        // SAFETY: getpwnam_r returned 0 with a non-null result, so `pwd` is
        // initialised and its string fields point into `buf`, which is
        // still alive here.
        let pwd = unsafe { pwd.assume_init() };
        let home = unsafe { CStr::from_ptr(pwd.pw_dir) };
        let name = unsafe { CStr::from_ptr(pwd.pw_name) };

        return Ok(Some(SystemIdentity {
            username: name.to_string_lossy().into_owned(),
            uid: pwd.pw_uid,
            gid: pwd.pw_gid,
            home_dir: PathBuf::from(OsStr::from_bytes(home.to_bytes())),
        }));
    }
}
