//! Process setup: daemonization, resource limits, privilege drop, memory
//! locking, and the pidfile.

use std::ffi::CString;
use std::io::Write;
use std::path::Path;
use tracing::warn;

/// A fatal startup failure; printed to stderr and turned into exit code 1.
#[derive(Debug)]
pub enum StartupError {
    CoreLimit,
    FileLimit,
    UnknownUser(String),
    DropPrivileges(String),
    RootWithoutUser,
    Daemonize(std::io::Error),
}

impl std::fmt::Display for StartupError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StartupError::CoreLimit => write!(f, "failed to ensure corefile creation"),
            StartupError::FileLimit => write!(
                f,
                "failed to set rlimit for open files. Try running as root or \
                 requesting a smaller maxconns value"
            ),
            StartupError::UnknownUser(user) => {
                write!(f, "can't find the user {user} to switch to")
            }
            StartupError::DropPrivileges(user) => {
                write!(f, "failed to assume identity of user {user}")
            }
            StartupError::RootWithoutUser => {
                write!(f, "can't run as root without the -u switch")
            }
            StartupError::Daemonize(e) => write!(f, "failed to daemonize: {e}"),
        }
    }
}

impl std::error::Error for StartupError {}

/// Raise the core-size limit as far as the kernel allows; fail if the soft
/// limit ends up zero, because then no core files appear at all.
pub fn raise_core_limit() -> Result<(), StartupError> {
    unsafe {
        let mut rlim: libc::rlimit = std::mem::zeroed();
        if libc::getrlimit(libc::RLIMIT_CORE, &mut rlim) == 0 {
            let mut wanted = libc::rlimit {
                rlim_cur: libc::RLIM_INFINITY,
                rlim_max: libc::RLIM_INFINITY,
            };
            if libc::setrlimit(libc::RLIMIT_CORE, &wanted) != 0 {
                wanted.rlim_cur = rlim.rlim_max;
                wanted.rlim_max = rlim.rlim_max;
                libc::setrlimit(libc::RLIMIT_CORE, &wanted);
            }
        }

        if libc::getrlimit(libc::RLIMIT_CORE, &mut rlim) != 0 || rlim.rlim_cur == 0 {
            return Err(StartupError::CoreLimit);
        }
    }
    Ok(())
}

/// Make sure the fd limit covers `maxconns` plus a few spares.
pub fn raise_fd_limit(maxconns: usize) -> Result<(), StartupError> {
    unsafe {
        let mut rlim: libc::rlimit = std::mem::zeroed();
        if libc::getrlimit(libc::RLIMIT_NOFILE, &mut rlim) != 0 {
            return Err(StartupError::FileLimit);
        }
        let wanted = (maxconns + 3) as libc::rlim_t;
        if rlim.rlim_cur < wanted {
            rlim.rlim_cur = wanted;
        }
        if rlim.rlim_max < rlim.rlim_cur {
            rlim.rlim_max = rlim.rlim_cur;
        }
        if libc::setrlimit(libc::RLIMIT_NOFILE, &rlim) != 0 {
            return Err(StartupError::FileLimit);
        }
    }
    Ok(())
}

/// Lose root privileges if we have them.
pub fn drop_privileges(username: Option<&str>) -> Result<(), StartupError> {
    let (uid, euid) = unsafe { (libc::getuid(), libc::geteuid()) };
    if uid != 0 && euid != 0 {
        return Ok(());
    }

    let username = match username {
        Some(name) if !name.is_empty() => name,
        _ => return Err(StartupError::RootWithoutUser),
    };

    let cname = CString::new(username)
        .map_err(|_| StartupError::UnknownUser(username.to_string()))?;
    unsafe {
        let pw = libc::getpwnam(cname.as_ptr());
        if pw.is_null() {
            return Err(StartupError::UnknownUser(username.to_string()));
        }
        if libc::setgid((*pw).pw_gid) < 0 || libc::setuid((*pw).pw_uid) < 0 {
            return Err(StartupError::DropPrivileges(username.to_string()));
        }
    }
    Ok(())
}

/// Fork into the background. `keep_cwd` avoids chdir("/") so core files land
/// somewhere predictable; `keep_stderr` leaves stdio attached for verbose
/// runs.
pub fn daemonize(keep_cwd: bool, keep_stderr: bool) -> Result<(), StartupError> {
    let res = unsafe { libc::daemon(keep_cwd as libc::c_int, keep_stderr as libc::c_int) };
    if res != 0 {
        return Err(StartupError::Daemonize(std::io::Error::last_os_error()));
    }
    Ok(())
}

/// Pin all current and future pages in memory.
pub fn lock_memory() {
    let res = unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) };
    if res != 0 {
        warn!("mlockall failed, proceeding without locked memory");
    }
}

pub fn save_pid(path: &Path) {
    let write = || -> std::io::Result<()> {
        let mut file = std::fs::File::create(path)?;
        writeln!(file, "{}", std::process::id())
    };
    if let Err(e) = write() {
        eprintln!("Could not write the pid file {}: {}", path.display(), e);
    }
}

pub fn remove_pidfile(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        eprintln!("Could not remove the pid file {}: {}", path.display(), e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pidfile_round_trip() {
        let path = std::env::temp_dir().join(format!("scattercache-pid-{}", std::process::id()));
        save_pid(&path);
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.trim().parse::<u32>().unwrap(), std::process::id());
        remove_pidfile(&path);
        assert!(!path.exists());
    }

    #[test]
    fn fd_limit_covers_maxconns() {
        // raising within the current hard limit needs no privileges
        raise_fd_limit(64).unwrap();
    }
}
