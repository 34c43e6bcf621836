//! Process hardening for a daemon that holds the config secret key.
//!
//! The derived AES key lives in process memory once an operator sets the
//! passphrase, so the daemon keeps it out of core files and swap.
//! Both calls are no-ops off Unix.

use std::io;

/// Set `RLIMIT_CORE` to zero so a crash never writes the key to disk.
///
/// Call before the secret key is set.
///
/// # Errors
///
/// The OS error from `setrlimit`.
#[cfg(unix)]
pub fn disable_core_dumps() -> io::Result<()> {
    let limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: `limit` is a fully initialized `rlimit` that outlives the
    // call; `setrlimit` only reads it.
    #[allow(unsafe_code)]
    let rc = unsafe { libc::setrlimit(libc::RLIMIT_CORE, &limit) };
    check(rc)
}

#[cfg(not(unix))]
pub fn disable_core_dumps() -> io::Result<()> {
    Ok(())
}

/// Pin current and future pages in RAM with `mlockall`.
///
/// Needs `CAP_IPC_LOCK` or root. Set `WATCHTOWER_DISABLE_MLOCK=true` to
/// skip it during development.
///
/// # Errors
///
/// The OS error from `mlockall`.
#[cfg(unix)]
pub fn lock_memory() -> io::Result<()> {
    // SAFETY: `mlockall` takes only flag bits and touches no Rust memory.
    #[allow(unsafe_code)]
    let rc = unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) };
    check(rc)
}

#[cfg(not(unix))]
pub fn lock_memory() -> io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn check(rc: libc::c_int) -> io::Result<()> {
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_dumps_can_be_disabled_unprivileged() {
        // Lowering a limit never needs privileges.
        assert!(disable_core_dumps().is_ok());
    }

    #[cfg(unix)]
    #[test]
    fn check_maps_nonzero_to_os_error() {
        assert!(check(0).is_ok());
        assert!(check(-1).is_err());
    }
}
