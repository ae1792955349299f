//! OS process liveness checks and pid-file handling.

use std::{path::Path, sync::Arc};

use tracing::debug;

/// Answers whether an OS process is alive. Injected so reconciliation can be
/// exercised without real processes.
pub trait ProcessProbe: Send + Sync + 'static {
    fn is_alive(&self, pid: u32) -> bool;

    /// Whether any process remains in the group led by `pid`.
    fn is_group_alive(&self, pid: u32) -> bool {
        self.is_alive(pid)
    }

    fn read_pid_file(&self, path: &Path) -> Option<u32> {
        read_pid_file(path)
    }
}

/// Parses the first line of a pid-file. Missing or malformed files yield `None`.
pub fn read_pid_file(path: &Path) -> Option<u32> {
    let contents = std::fs::read_to_string(path).ok()?;
    let parsed = contents.lines().next()?.trim().parse::<u32>().ok();
    if parsed.is_none() {
        debug!(path = %path.display(), "ignoring malformed pid-file");
    }
    parsed.filter(|pid| *pid != 0)
}

/// Probe that sends the null signal to the pid.
#[cfg(unix)]
#[derive(Debug, Default, Clone, Copy)]
pub struct SignalProbe;

#[cfg(unix)]
impl ProcessProbe for SignalProbe {
    fn is_alive(&self, pid: u32) -> bool {
        use nix::{errno::Errno, sys::signal::kill, unistd::Pid};

        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        if raw <= 0 {
            return false;
        }
        match kill(Pid::from_raw(raw), None) {
            Ok(()) => true,
            // The process exists but belongs to another user.
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    fn is_group_alive(&self, pid: u32) -> bool {
        use nix::{errno::Errno, sys::signal::killpg, unistd::Pid};

        let Ok(raw) = i32::try_from(pid) else {
            return false;
        };
        if raw <= 0 {
            return false;
        }
        matches!(killpg(Pid::from_raw(raw), None), Ok(()) | Err(Errno::EPERM))
    }
}

/// Probe that asks `tasklist` for the pid.
#[cfg(windows)]
#[derive(Debug, Default, Clone, Copy)]
pub struct TasklistProbe;

#[cfg(windows)]
impl ProcessProbe for TasklistProbe {
    fn is_alive(&self, pid: u32) -> bool {
        let output = std::process::Command::new("tasklist")
            .args(["/FI", &format!("PID eq {pid}"), "/NH", "/FO", "CSV"])
            .output();
        match output {
            Ok(output) => String::from_utf8_lossy(&output.stdout).contains(&format!("\"{pid}\"")),
            Err(_) => false,
        }
    }
}

/// Probe for the host platform.
pub fn platform_probe() -> Arc<dyn ProcessProbe> {
    #[cfg(unix)]
    {
        Arc::new(SignalProbe)
    }
    #[cfg(windows)]
    {
        Arc::new(TasklistProbe)
    }
}
