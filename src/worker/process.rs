//! OS process signalling for worker processes the supervisor did not spawn
//! in the current session (known only by PID).

/// What happened when a signal was sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalResult {
    Sent,
    /// No such process.
    NotFound,
    /// The process exists but belongs to someone else.
    PermissionDenied,
    Failed(String),
}

#[cfg(unix)]
mod imp {
    use super::SignalResult;

    fn signal(pid: u32, sig: libc::c_int) -> SignalResult {
        // pid 0 and negative pids address process groups, never a single worker.
        let Ok(pid) = libc::pid_t::try_from(pid) else {
            return SignalResult::NotFound;
        };
        if pid <= 0 {
            return SignalResult::NotFound;
        }

        let rc = unsafe { libc::kill(pid, sig) };
        if rc == 0 {
            return SignalResult::Sent;
        }
        let err = std::io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::ESRCH) => SignalResult::NotFound,
            Some(libc::EPERM) => SignalResult::PermissionDenied,
            _ => SignalResult::Failed(err.to_string()),
        }
    }

    pub fn check(pid: u32) -> SignalResult {
        signal(pid, 0)
    }

    pub fn is_alive(pid: u32) -> bool {
        matches!(
            check(pid),
            SignalResult::Sent | SignalResult::PermissionDenied
        )
    }

    pub fn terminate(pid: u32) -> SignalResult {
        signal(pid, libc::SIGTERM)
    }

    pub fn kill(pid: u32) -> SignalResult {
        signal(pid, libc::SIGKILL)
    }
}

#[cfg(windows)]
mod imp {
    use std::process::{Command, Stdio};

    use super::SignalResult;

    fn taskkill(pid: u32, force: bool) -> SignalResult {
        if !is_alive(pid) {
            return SignalResult::NotFound;
        }
        let mut cmd = Command::new("taskkill");
        if force {
            cmd.arg("/F");
        }
        let status = cmd
            .args(["/PID", &pid.to_string()])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        match status {
            Ok(s) if s.success() => SignalResult::Sent,
            Ok(s) => SignalResult::Failed(format!("taskkill exited with {s}")),
            Err(e) => SignalResult::Failed(e.to_string()),
        }
    }

    pub fn check(pid: u32) -> SignalResult {
        if is_alive(pid) {
            SignalResult::Sent
        } else {
            SignalResult::NotFound
        }
    }

    pub fn is_alive(pid: u32) -> bool {
        Command::new("tasklist")
            .args(["/FI", &format!("PID eq {pid}"), "/NH", "/FO", "CSV"])
            .stderr(Stdio::null())
            .output()
            .map(|out| String::from_utf8_lossy(&out.stdout).contains(&format!("\"{pid}\"")))
            .unwrap_or(false)
    }

    pub fn terminate(pid: u32) -> SignalResult {
        taskkill(pid, false)
    }

    pub fn kill(pid: u32) -> SignalResult {
        taskkill(pid, true)
    }
}

/// Null signal: reports whether the process exists and whether we may
/// signal it, without delivering anything.
pub fn check(pid: u32) -> SignalResult {
    imp::check(pid)
}

/// True if a process with this PID exists, even one owned by another user.
pub fn is_alive(pid: u32) -> bool {
    imp::is_alive(pid)
}

/// Ask the process to exit (SIGTERM).
pub fn terminate(pid: u32) -> SignalResult {
    imp::terminate(pid)
}

/// Force the process to exit (SIGKILL / `taskkill /F`).
pub fn kill(pid: u32) -> SignalResult {
    imp::kill(pid)
}
