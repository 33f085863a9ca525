//! Isolated process lifecycle: fork, wait (with optional deadline), terminate, reap.
//!
//! The handle returned by [`spawn`] owns the child. Whatever path the caller
//! takes, the child is reaped exactly once: either by an explicit
//! [`IsolatedProcess::wait`] or by the drop guard, which kills and reaps a
//! context that is still running.

use crate::config::types::{ContextState, IsolateError, Result, TerminationStatus};
use crate::kernel::signal::{signal_group, Delivery};
use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, setpgid, ForkResult, Pid};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::{Duration, Instant};

/// Exit status of a context whose entry unwound instead of returning.
pub const EXIT_ENTRY_PANIC: i32 = 101;

const FALLBACK_POLL_INTERVAL: Duration = Duration::from_millis(10);

fn to_process_error(prefix: &str, err: impl std::fmt::Display) -> IsolateError {
    IsolateError::Process(format!("{prefix}: {err}"))
}

/// How deadline waits observe child exit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PidfdMode {
    /// pidfd_open(2) + poll(2): one blocking call per wait.
    Native,
    /// WNOHANG polling for kernels without pidfd support.
    Fallback,
}

/// Signal escalation report for timeout/forced termination paths.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KillReport {
    pub term_sent: bool,
    pub kill_sent: bool,
    pub waited_ms: u64,
    pub notes: Vec<String>,
}

/// Handle to a forked isolation context.
#[derive(Debug)]
pub struct IsolatedProcess {
    pid: Pid,
    termination: Option<TerminationStatus>,
}

/// Fork a new isolation context running `entry`.
///
/// The child moves into its own process group, runs `entry`, and leaves with
/// `_exit(entry())` so no parent-owned destructors or atexit handlers run in
/// the copy. In the parent the closure is dropped unrun, which releases any
/// resources it captured (the child end of a transport, for instance).
pub fn spawn<F>(entry: F) -> Result<IsolatedProcess>
where
    F: FnOnce() -> i32,
{
    // SAFETY: the child only runs `entry` and then _exit()s; it never returns
    // into the caller's stack frames.
    match unsafe { fork() }.map_err(|e| to_process_error("fork(context)", e))? {
        ForkResult::Child => {
            let _ = setpgid(Pid::from_raw(0), Pid::from_raw(0));
            let code = catch_unwind(AssertUnwindSafe(entry)).unwrap_or(EXIT_ENTRY_PANIC);
            // SAFETY: _exit(2) ends the process without running atexit handlers
            // or touching state shared with the parent.
            unsafe { libc::_exit(code) }
        }
        ForkResult::Parent { child } => {
            // Also set from the parent so group signals work before the child runs.
            let _ = setpgid(child, child);
            drop(entry);
            Ok(IsolatedProcess {
                pid: child,
                termination: None,
            })
        }
    }
}

/// Probe whether this kernel supports pidfd_open(2).
pub fn detect_pidfd_mode() -> PidfdMode {
    match PidFd::open(Pid::this()) {
        Some(_) => PidfdMode::Native,
        None => PidfdMode::Fallback,
    }
}

impl IsolatedProcess {
    pub fn pid(&self) -> i32 {
        self.pid.as_raw()
    }

    pub fn state(&self) -> ContextState {
        match self.termination {
            None => ContextState::Running,
            Some(TerminationStatus::Exited(code)) => ContextState::Exited(code),
            Some(TerminationStatus::Signaled { signal, .. }) => ContextState::Killed(signal),
        }
    }

    pub fn termination(&self) -> Option<TerminationStatus> {
        self.termination
    }

    /// Block until the context terminates and reap it.
    pub fn wait(&mut self) -> Result<TerminationStatus> {
        if let Some(status) = self.termination {
            return Ok(status);
        }
        loop {
            match waitpid(self.pid, None) {
                Ok(status) => {
                    if let Some(termination) = self.record(status) {
                        return Ok(termination);
                    }
                }
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(to_process_error("waitpid(context)", e)),
            }
        }
    }

    /// Reap the context if it has already terminated.
    pub fn try_wait(&mut self) -> Result<Option<TerminationStatus>> {
        if let Some(status) = self.termination {
            return Ok(Some(status));
        }
        loop {
            match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => return Ok(None),
                Ok(status) => return Ok(self.record(status)),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(to_process_error("waitpid(context, WNOHANG)", e)),
            }
        }
    }

    /// Wait at most `limit` for termination. `Ok(None)` means the deadline
    /// passed with the context still running.
    pub fn wait_timeout(&mut self, limit: Duration) -> Result<Option<TerminationStatus>> {
        let deadline = Instant::now() + limit;
        match PidFd::open(self.pid) {
            Some(pidfd) => self.wait_pidfd(&pidfd, deadline),
            None => self.wait_polling(deadline),
        }
    }

    fn wait_pidfd(
        &mut self,
        pidfd: &PidFd,
        deadline: Instant,
    ) -> Result<Option<TerminationStatus>> {
        use std::os::fd::AsRawFd;

        loop {
            if let Some(status) = self.try_wait()? {
                return Ok(Some(status));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            match crate::kernel::poll::wait_readable(&[pidfd.0.as_raw_fd()], Some(remaining)) {
                Ok(_) => continue,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(to_process_error("poll(pidfd)", e)),
            }
        }
    }

    fn wait_polling(&mut self, deadline: Instant) -> Result<Option<TerminationStatus>> {
        loop {
            if let Some(status) = self.try_wait()? {
                return Ok(Some(status));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            std::thread::sleep(remaining.min(FALLBACK_POLL_INTERVAL));
        }
    }

    /// Forcibly end the context and reap it.
    ///
    /// With a nonzero `grace` the process group first gets SIGTERM and the
    /// remaining grace period to exit; SIGKILL follows if it is still alive.
    pub fn terminate(&mut self, grace: Duration) -> Result<(KillReport, TerminationStatus)> {
        let mut report = KillReport::default();
        let started = Instant::now();

        if let Some(status) = self.termination {
            report.notes.push("context already reaped".to_string());
            return Ok((report, status));
        }

        if !grace.is_zero() {
            report.term_sent = true;
            self.note_delivery(&mut report, Signal::SIGTERM);
            if let Some(status) = self.wait_timeout(grace)? {
                report.waited_ms = started.elapsed().as_millis() as u64;
                return Ok((report, status));
            }
        }

        report.kill_sent = true;
        self.note_delivery(&mut report, Signal::SIGKILL);
        let status = self.wait()?;
        report.waited_ms = started.elapsed().as_millis() as u64;
        Ok((report, status))
    }

    /// SIGKILL the context's group immediately and reap it.
    pub fn kill(&mut self) -> Result<TerminationStatus> {
        self.terminate(Duration::ZERO).map(|(_, status)| status)
    }

    fn note_delivery(&self, report: &mut KillReport, sig: Signal) {
        match signal_group(self.pid, sig) {
            Delivery::Group => {}
            Delivery::LeaderOnly => report
                .notes
                .push(format!("group {} fallback used for pid {}", sig.as_str(), self.pid)),
            Delivery::Gone => report
                .notes
                .push(format!("{} not delivered: pid {} already gone", sig.as_str(), self.pid)),
        }
    }

    fn record(&mut self, status: WaitStatus) -> Option<TerminationStatus> {
        let termination = match status {
            WaitStatus::Exited(_, code) => TerminationStatus::Exited(code),
            WaitStatus::Signaled(_, sig, core_dumped) => TerminationStatus::Signaled {
                signal: sig as i32,
                core_dumped,
            },
            _ => return None,
        };
        self.termination = Some(termination);
        Some(termination)
    }
}

impl Drop for IsolatedProcess {
    fn drop(&mut self) {
        if self.termination.is_some() {
            return;
        }
        log::warn!(
            "Isolated context pid {} dropped while running; killing and reaping",
            self.pid
        );
        let _ = signal_group(self.pid, Signal::SIGKILL);
        loop {
            match waitpid(self.pid, None) {
                Err(Errno::EINTR) => continue,
                Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) | Err(_) => break,
                Ok(_) => continue,
            }
        }
    }
}

/// Owned pidfd for one child.
struct PidFd(std::os::fd::OwnedFd);

impl PidFd {
    #[cfg(target_os = "linux")]
    fn open(pid: Pid) -> Option<Self> {
        use std::os::fd::{FromRawFd, RawFd};

        // SAFETY: pidfd_open takes a pid and flags and returns a new descriptor or -1.
        let fd = unsafe { libc::syscall(libc::SYS_pidfd_open, pid.as_raw(), 0) };
        if fd < 0 {
            return None;
        }
        // SAFETY: the kernel just handed us exclusive ownership of this descriptor.
        Some(Self(unsafe { std::os::fd::OwnedFd::from_raw_fd(fd as RawFd) }))
    }

    #[cfg(not(target_os = "linux"))]
    fn open(_pid: Pid) -> Option<Self> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reports_exit_code() {
        let mut child = spawn(|| 7).unwrap();
        assert_eq!(child.state(), ContextState::Running);
        let status = child.wait().unwrap();
        assert_eq!(status, TerminationStatus::Exited(7));
        assert_eq!(child.state(), ContextState::Exited(7));
        // Repeated waits return the recorded status without another waitpid.
        assert_eq!(child.wait().unwrap(), status);
    }

    #[test]
    fn reports_terminating_signal() {
        let mut child = spawn(|| {
            unsafe {
                libc::raise(libc::SIGFPE);
            }
            0
        })
        .unwrap();
        let status = child.wait().unwrap();
        assert_eq!(status.signal(), Some(libc::SIGFPE));
        assert_eq!(child.state(), ContextState::Killed(libc::SIGFPE));
    }

    #[test]
    fn entry_panic_becomes_exit_status() {
        let mut child = spawn(|| -> i32 { panic!("entry blew up") }).unwrap();
        assert_eq!(
            child.wait().unwrap(),
            TerminationStatus::Exited(EXIT_ENTRY_PANIC)
        );
    }

    #[test]
    fn wait_timeout_expires_then_terminate_reaps() {
        let mut child = spawn(|| loop {
            std::thread::sleep(Duration::from_millis(50));
        })
        .unwrap();

        let started = Instant::now();
        let waited = child.wait_timeout(Duration::from_millis(200)).unwrap();
        assert!(waited.is_none());
        assert!(started.elapsed() >= Duration::from_millis(200));

        let (report, status) = child.terminate(Duration::ZERO).unwrap();
        assert!(report.kill_sent);
        assert!(!report.term_sent);
        assert_eq!(status.signal(), Some(libc::SIGKILL));
        assert_eq!(
            nix::sys::signal::kill(Pid::from_raw(child.pid()), None),
            Err(Errno::ESRCH)
        );
    }

    #[test]
    fn kill_is_idempotent_once_reaped() {
        let mut child = spawn(|| loop {
            std::thread::sleep(Duration::from_millis(50));
        })
        .unwrap();
        let first = child.kill().unwrap();
        assert_eq!(first.signal(), Some(libc::SIGKILL));
        assert_eq!(child.kill().unwrap(), first);
        assert_eq!(child.state(), ContextState::Killed(libc::SIGKILL));
    }

    #[test]
    fn grace_period_lets_sigterm_finish_the_job() {
        let mut child = spawn(|| loop {
            std::thread::sleep(Duration::from_millis(50));
        })
        .unwrap();

        let (report, status) = child.terminate(Duration::from_secs(2)).unwrap();
        assert!(report.term_sent);
        assert!(!report.kill_sent);
        assert_eq!(status.signal(), Some(libc::SIGTERM));
    }

    #[test]
    fn wait_timeout_returns_early_exit() {
        let mut child = spawn(|| 3).unwrap();
        let status = child.wait_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(status, Some(TerminationStatus::Exited(3)));
    }

    #[test]
    fn drop_reaps_running_context() {
        let child = spawn(|| loop {
            std::thread::sleep(Duration::from_millis(50));
        })
        .unwrap();
        let pid = child.pid();
        drop(child);
        assert_eq!(
            nix::sys::signal::kill(Pid::from_raw(pid), None),
            Err(Errno::ESRCH)
        );
    }
}
