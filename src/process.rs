/// Answers "is this pid still running?".
pub trait ProcessProbe: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;
}

/// Signal-0 probe against the local process table.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProbe;

impl ProcessProbe for SystemProbe {
    fn is_alive(&self, pid: u32) -> bool {
        is_pid_alive(pid)
    }
}

/// Check if a process with the given PID is alive.
#[cfg(unix)]
pub fn is_pid_alive(pid: u32) -> bool {
    use nix::{errno::Errno, sys::signal::kill, unistd::Pid};

    if pid == 0 || pid > i32::MAX as u32 {
        return false;
    }
    match kill(Pid::from_raw(pid as i32), None) {
        Ok(()) => true,
        // EPERM means the process exists but we can't signal it (different user)
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
pub fn is_pid_alive(_pid: u32) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::{is_pid_alive, ProcessProbe, SystemProbe};

    #[test]
    fn current_process_is_alive() {
        assert!(SystemProbe.is_alive(std::process::id()));
    }

    #[test]
    fn zero_pid_is_never_alive() {
        assert!(!is_pid_alive(0));
    }

    #[test]
    #[cfg(unix)]
    fn exited_child_is_dead() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        assert!(!is_pid_alive(pid));
    }
}
