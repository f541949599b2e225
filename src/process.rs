//! Helpers for creating, naming, demoting and reaping forked processes.

use crate::logging;
use crate::signals;
use anyhow::{anyhow, Context, Result};
use nix::errno::Errno;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Gid, Group, Pid, User};
use slog_scope::{debug, warn};
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::RawFd;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::Path;
use std::time::{Duration, Instant};

/// Exit code of a forked child whose body panicked.
pub const PANIC_EXIT_CODE: i32 = 70;

/// Ends the current process without running destructors or atexit
/// handlers, which belong to the process we were forked from.
pub fn exit_immediately(code: i32) -> ! {
    unsafe { nix::libc::_exit(code) }
}

/// Forks and runs `body` in the child, which then exits with the
/// returned code. The child never returns into the caller's stack.
pub fn fork_process<F>(name: &str, body: F) -> nix::Result<Pid>
where
    F: FnOnce() -> i32,
{
    match unsafe { fork() }? {
        ForkResult::Parent { child } => Ok(child),
        ForkResult::Child => {
            logging::after_fork(name);
            let code = catch_unwind(AssertUnwindSafe(body)).unwrap_or(PANIC_EXIT_CODE);
            exit_immediately(code)
        }
    }
}

/// Runs `body` in a grandchild process. The intermediate child exits
/// right after forking and is reaped before this returns, so the
/// grandchild gets re-parented and never becomes our zombie.
pub fn double_fork<F>(name: &str, body: F) -> nix::Result<()>
where
    F: FnOnce() -> i32,
{
    let intermediate = fork_process(name, move || match fork_process(name, body) {
        Ok(_) => 0,
        Err(e) => e as i32,
    })?;
    match wait_for(intermediate)? {
        WaitStatus::Exited(_, 0) => Ok(()),
        WaitStatus::Exited(_, code) => Err(Errno::from_i32(code)),
        status => {
            warn!("intermediate process ended abnormally"; "status" => ?status);
            Err(Errno::ECHILD)
        }
    }
}

/// Blocks until `pid` has terminated and returns how it ended.
pub fn wait_for(pid: Pid) -> nix::Result<WaitStatus> {
    loop {
        match waitpid(pid, None) {
            Err(Errno::EINTR) => continue,
            Ok(WaitStatus::StillAlive) => continue,
            other => return other,
        }
    }
}

/// Waits up to `timeout` for `pid` to terminate. Returns `None` if it's still alive.
pub fn reap_with_timeout(pid: Pid, timeout: Duration) -> nix::Result<Option<WaitStatus>> {
    let deadline = Instant::now() + timeout;
    loop {
        match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => {
                if Instant::now() >= deadline {
                    return Ok(None);
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            Ok(status) => return Ok(Some(status)),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Sends SIGTERM to `pid` and reaps it, escalating to SIGKILL if it
/// doesn't exit within `grace`.
pub fn terminate(pid: Pid, grace: Duration) -> nix::Result<WaitStatus> {
    match kill(pid, Signal::SIGTERM) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => return Err(e),
    }
    if let Some(status) = reap_with_timeout(pid, grace)? {
        return Ok(status);
    }
    warn!("process didn't exit in time, killing it"; "pid" => pid.as_raw(), "grace" => ?grace);
    match kill(pid, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => return Err(e),
    }
    wait_for(pid)
}

fn open_fds() -> Vec<RawFd> {
    #[cfg(target_os = "linux")]
    {
        if let Ok(entries) = std::fs::read_dir("/proc/self/fd") {
            return entries
                .filter_map(|entry| entry.ok())
                .filter_map(|entry| entry.file_name().to_str()?.parse().ok())
                .collect();
        }
    }
    let max = nix::unistd::sysconf(nix::unistd::SysconfVar::OPEN_MAX)
        .ok()
        .flatten()
        .unwrap_or(1024)
        .min(65536) as RawFd;
    (0..max).collect()
}

/// Closes every descriptor above stderr except those in `keep`, so a
/// forked child doesn't hold on to its siblings' sockets and pipes.
pub fn close_unrelated_fds(keep: &[RawFd]) {
    for fd in open_fds() {
        if fd > 2 && !keep.contains(&fd) {
            let _ = nix::unistd::close(fd);
        }
    }
}

/// Detaches a freshly forked child from its parent's signal scopes
/// and descriptors, keeping only `keep` (and stdio) open.
pub fn prepare_child(keep: &[RawFd]) {
    signals::forget_scopes();
    signals::clear_pending();
    close_unrelated_fds(keep);
}

/// Sets the name the process shows up as in `ps` and `top`.
#[cfg(target_os = "linux")]
pub fn set_process_name(name: &str) {
    let mut end = name.len().min(15);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    if let Err(code) = prctl::set_name(&name[..end]) {
        debug!("could not set process name"; "name" => name, "code" => code);
    }
}

#[cfg(not(target_os = "linux"))]
pub fn set_process_name(_name: &str) {}

/// Who a worker should run as, when it's started by root.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Identity {
    pub user: Option<String>,
    pub group: Option<String>,
}

/// Switches the current process to an unprivileged identity if it runs as root.
///
/// The requested user wins; without one, the owner of `app_root` is
/// used, unless that is root, in which case `lowest_user` is.
pub fn lower_privilege(app_root: &Path, identity: &Identity, lowest_user: &str) -> Result<()> {
    if !nix::unistd::geteuid().is_root() {
        return Ok(());
    }
    let user = match &identity.user {
        Some(name) => User::from_name(name)?.ok_or_else(|| anyhow!("no such user {:?}", name))?,
        None => {
            let owner = std::fs::metadata(app_root)
                .with_context(|| format!("inspecting {:?}", app_root))?
                .uid();
            User::from_uid(nix::unistd::Uid::from_raw(owner))?
                .ok_or_else(|| anyhow!("application root owner {} has no user entry", owner))?
        }
    };
    let user = if user.uid.is_root() {
        User::from_name(lowest_user)?
            .ok_or_else(|| anyhow!("no such user {:?}", lowest_user))?
    } else {
        user
    };
    let gid: Gid = match &identity.group {
        Some(name) => {
            Group::from_name(name)?
                .ok_or_else(|| anyhow!("no such group {:?}", name))?
                .gid
        }
        None => user.gid,
    };

    #[cfg(target_os = "linux")]
    {
        let name = std::ffi::CString::new(user.name.clone())?;
        nix::unistd::initgroups(&name, gid).context("initgroups")?;
    }
    nix::unistd::setgid(gid).context("setgid")?;
    nix::unistd::setuid(user.uid).context("setuid")?;
    std::env::set_var("HOME", &user.dir);
    std::env::set_var("USER", &user.name);
    debug!("lowered privileges"; "user" => &user.name, "gid" => gid.as_raw());
    Ok(())
}
