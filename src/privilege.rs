//! Process setup applied after binding and before accepting connections.

use std::fs::OpenOptions;
use std::io::{self, Error};
use std::os::fd::AsRawFd;

use libc::{gid_t, uid_t};

use crate::config::Config;

const DEV_NULL: &str = "/dev/null";

fn check(rc: libc::c_int) -> io::Result<libc::c_int> {
    if rc < 0 {
        Err(Error::last_os_error())
    } else {
        Ok(rc)
    }
}

/// Fork into the background. The parent exits; the child continues in a new
/// session with its standard streams on /dev/null.
///
/// Must run before any other thread exists.
pub fn detach() -> io::Result<()> {
    let null = OpenOptions::new().read(true).write(true).open(DEV_NULL)?;

    let pid = check(unsafe { libc::fork() })?;
    if pid > 0 {
        log::info!("detached, pid {pid}");
        std::process::exit(0);
    }

    check(unsafe { libc::setsid() })?;
    for fd in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        check(unsafe { libc::dup2(null.as_raw_fd(), fd) })?;
    }
    Ok(())
}

/// chroot() into the storage root if configured to.
pub fn enter_root(config: &Config) -> io::Result<()> {
    if !config.chroot {
        return Ok(());
    }
    std::os::unix::fs::chroot(&config.storage_root)?;
    std::env::set_current_dir("/")?;
    log::info!("chrooted to {}", config.storage_root.display());
    Ok(())
}

/// A user switch without a group also switches to that user's primary
/// group. Must run before chroot hides the user database.
pub fn target_ids(
    uid: Option<uid_t>, gid: Option<gid_t>,
) -> (Option<uid_t>, Option<gid_t>) {
    match (uid, gid) {
        (Some(uid), None) => (
            Some(uid),
            uzers::get_user_by_uid(uid).map(|u| u.primary_group_id()),
        ),
        ids => ids,
    }
}

/// Switch supplementary groups, group, then user; an unprivileged process
/// can no longer change its groups.
pub fn drop_privileges(uid: Option<uid_t>, gid: Option<gid_t>) -> io::Result<()> {
    if (uid.is_some() || gid.is_some()) && unsafe { libc::geteuid() } == 0 {
        let groups = gid.into_iter().collect::<Vec<_>>();
        check(unsafe { libc::setgroups(groups.len() as _, groups.as_ptr()) })?;
        log::info!("set supplementary groups to {groups:?}");
    }
    if let Some(gid) = gid {
        check(unsafe { libc::setgid(gid) })?;
        log::info!("set gid to {gid}");
    }
    if let Some(uid) = uid {
        check(unsafe { libc::setuid(uid) })?;
        log::info!("set uid to {uid}");
    }
    Ok(())
}
