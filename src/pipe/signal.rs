//! Signal delivery to supervised children.
//!
//! Children lead their own process group (see
//! [`spawn_headless`](super::spawner::spawn_headless)), so signals go to the
//! whole group and reach any helpers the tool forked.

use crate::{AppError, Result};

/// Ask the process group led by `pid` to terminate.
///
/// # Errors
///
/// Returns `AppError::Io` if the signal cannot be delivered, or on
/// platforms without a terminate signal.
#[cfg(unix)]
pub fn terminate_group(pid: u32) -> Result<()> {
    send_group(pid, nix::sys::signal::Signal::SIGTERM)
}

/// Force-kill the process group led by `pid`.
///
/// # Errors
///
/// Returns `AppError::Io` if the signal cannot be delivered.
#[cfg(unix)]
pub fn kill_group(pid: u32) -> Result<()> {
    send_group(pid, nix::sys::signal::Signal::SIGKILL)
}

#[cfg(unix)]
fn send_group(pid: u32, signal: nix::sys::signal::Signal) -> Result<()> {
    let raw = i32::try_from(pid).map_err(|_| AppError::Io(format!("pid {pid} out of range")))?;
    nix::sys::signal::killpg(nix::unistd::Pid::from_raw(raw), signal)
        .map_err(|errno| AppError::Io(format!("failed to send {signal} to group {pid}: {errno}")))
}

/// Windows has no terminate signal; the close ladder falls through to kill.
///
/// # Errors
///
/// Always returns `AppError::Io`.
#[cfg(not(unix))]
pub fn terminate_group(pid: u32) -> Result<()> {
    Err(AppError::Io(format!(
        "terminate signal unsupported on this platform (pid {pid})"
    )))
}

/// Group kill is delegated to the child handle on this platform.
///
/// # Errors
///
/// Always returns `AppError::Io`.
#[cfg(not(unix))]
pub fn kill_group(pid: u32) -> Result<()> {
    Err(AppError::Io(format!(
        "group kill unsupported on this platform (pid {pid})"
    )))
}
