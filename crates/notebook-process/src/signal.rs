use std::{io, time::Duration};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    NoSuchProcess,
}

fn checked_pid(pid: u32) -> io::Result<i32> {
    // 0 and 1 would address our own group or every process; never signal those.
    match i32::try_from(pid) {
        Ok(p) if p > 1 => Ok(p),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("refusing to signal pid {pid}"),
        )),
    }
}

#[cfg(unix)]
fn raw_kill(target: i32, sig: i32) -> io::Result<Delivery> {
    let rc = unsafe { libc::kill(target, sig) };
    if rc == 0 {
        return Ok(Delivery::Delivered);
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(Delivery::NoSuchProcess)
    } else {
        Err(err)
    }
}

/// Sends `sig` to the process group led by `pid`, then to `pid` itself.
///
/// `NoSuchProcess` only when neither target exists.
#[cfg(unix)]
pub fn send(pid: u32, sig: i32) -> io::Result<Delivery> {
    let pid = checked_pid(pid)?;
    let group = raw_kill(-pid, sig);
    let single = raw_kill(pid, sig);
    match (group, single) {
        (Ok(Delivery::Delivered), _) | (_, Ok(Delivery::Delivered)) => Ok(Delivery::Delivered),
        (Ok(Delivery::NoSuchProcess), Ok(Delivery::NoSuchProcess)) => Ok(Delivery::NoSuchProcess),
        (_, Err(e)) => Err(e),
        (Err(e), _) => Err(e),
    }
}

#[cfg(not(unix))]
pub fn send(pid: u32, _sig: i32) -> io::Result<Delivery> {
    checked_pid(pid)?;
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "process signals are only supported on unix",
    ))
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: i32) -> bool {
    let Ok(s) = std::fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return false;
    };
    // Field 3, after the parenthesised comm which may itself contain spaces.
    s.rfind(')')
        .and_then(|end| s.get(end + 2..))
        .and_then(|rest| rest.chars().next())
        == Some('Z')
}

#[cfg(not(target_os = "linux"))]
fn is_zombie(_pid: i32) -> bool {
    false
}

/// Signal-0 probe. A process we may not signal (EPERM) still exists; an
/// exited but unreaped one does not.
#[cfg(unix)]
pub fn is_alive(pid: u32) -> bool {
    let Ok(pid) = checked_pid(pid) else {
        return false;
    };
    match raw_kill(pid, 0) {
        Ok(Delivery::Delivered) => !is_zombie(pid),
        Ok(Delivery::NoSuchProcess) => false,
        Err(e) => e.raw_os_error() == Some(libc::EPERM),
    }
}

#[cfg(not(unix))]
pub fn is_alive(_pid: u32) -> bool {
    false
}

/// Polls until `pid` disappears or `timeout` elapses. Returns whether it is gone.
pub async fn wait_gone(pid: u32, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if !is_alive(pid) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
