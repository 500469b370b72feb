//! Process inspection and signalling helpers for the daemon.

use std::process::{Command, Stdio};
use sysinfo::{Pid, ProcessRefreshKind, System};

/// Unix start time (seconds) of a live process, if it exists.
pub fn get_process_start_time(pid: u32) -> Option<u64> {
    let mut sys = System::new();
    let sys_pid = Pid::from(pid as usize);
    sys.refresh_process_specifics(sys_pid, ProcessRefreshKind::new());
    sys.process(sys_pid).map(|process| process.start_time())
}

pub fn is_pid_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    #[cfg(unix)]
    {
        unsafe { libc::kill(pid as i32, 0) == 0 }
    }
    #[cfg(not(unix))]
    {
        false
    }
}

/// Puts the child in its own process group with piped output so the
/// supervisor can drain it and signal everything it forks.
pub fn prepare_worker_command(command: &mut Command) {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    Terminate,
    Kill,
}

impl Signal {
    #[cfg(unix)]
    fn as_raw(self) -> i32 {
        match self {
            Signal::Terminate => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        }
    }
}

/// Signals the process group led by `pid`, falling back to the single pid
/// when the child was not started as a group leader.
pub fn signal_process(pid: u32, signal: Signal) -> bool {
    if pid == 0 {
        return false;
    }
    #[cfg(unix)]
    {
        let raw = signal.as_raw();
        unsafe {
            if libc::kill(-(pid as i32), raw) == 0 {
                return true;
            }
            libc::kill(pid as i32, raw) == 0
        }
    }
    #[cfg(not(unix))]
    {
        let _ = signal;
        false
    }
}
