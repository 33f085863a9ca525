/// Signal naming and delivery helpers
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::ffi::CStr;

/// Symbolic name of a signal number ("SIGSEGV"), or "SIG<n>" when unknown.
pub fn signal_name(signal: i32) -> String {
    match Signal::try_from(signal) {
        Ok(sig) => sig.as_str().to_string(),
        Err(_) => format!("SIG{}", signal),
    }
}

/// Human readable description from the C library ("Segmentation fault").
pub fn signal_description(signal: i32) -> String {
    // SAFETY: strsignal returns a pointer to a NUL-terminated string owned by
    // libc; it is copied before any other call can overwrite it.
    let ptr = unsafe { libc::strsignal(signal) };
    if ptr.is_null() {
        return format!("Unknown signal {}", signal);
    }
    unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
}

/// Outcome of delivering a signal to a context's process group.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Delivery {
    /// Delivered to the whole process group.
    Group,
    /// Group delivery failed; delivered to the leader pid only.
    LeaderOnly,
    /// The process is already gone.
    Gone,
}

/// Deliver `sig` to the process group led by `pid`, falling back to the pid
/// itself when the group does not exist yet (setpgid race after fork).
pub fn signal_group(pid: Pid, sig: Signal) -> Delivery {
    if signal::killpg(pid, sig).is_ok() {
        return Delivery::Group;
    }
    match signal::kill(pid, sig) {
        Ok(()) => Delivery::LeaderOnly,
        Err(_) => Delivery::Gone,
    }
}
