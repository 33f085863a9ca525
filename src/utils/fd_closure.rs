/// File descriptor closure for isolated contexts
///
/// Runs inside a freshly forked context: closes every descriptor above
/// stderr except the ones the context still needs (its transport endpoint).
/// Prefers close_range(2), falls back to iterating /proc/self/fd.
/// Nothing here logs; the logger's own state belongs to the parent.
use crate::config::types::{IsolateError, Result};
use std::fs;
use std::os::unix::io::RawFd;

use nix::unistd::close;

/// Close all descriptors > 2 that are not listed in `keep`.
pub fn close_fds_except(keep: &[RawFd]) -> Result<()> {
    let mut keep: Vec<RawFd> = keep.iter().copied().filter(|fd| *fd > 2).collect();
    keep.sort_unstable();
    keep.dedup();

    #[cfg(target_os = "linux")]
    {
        if close_gaps_with_close_range(&keep) {
            return Ok(());
        }
    }

    close_fds_via_proc(&keep)
}

/// Ranges of descriptors to close around the sorted `keep` list.
fn closable_ranges(keep: &[RawFd]) -> Vec<(u32, u32)> {
    let mut ranges = Vec::with_capacity(keep.len() + 1);
    let mut next: u32 = 3;
    for &fd in keep {
        let fd = fd as u32;
        if fd > next {
            ranges.push((next, fd - 1));
        }
        next = fd + 1;
    }
    ranges.push((next, u32::MAX));
    ranges
}

#[cfg(target_os = "linux")]
fn close_gaps_with_close_range(keep: &[RawFd]) -> bool {
    // close_range syscall number (same on every architecture that has it)
    const SYS_CLOSE_RANGE: libc::c_long = 436;

    for (first, last) in closable_ranges(keep) {
        // SAFETY: close_range only closes descriptors in [first, last].
        let rc = unsafe { libc::syscall(SYS_CLOSE_RANGE, first, last, 0 as libc::c_uint) };
        if rc != 0 {
            return false;
        }
    }
    true
}

fn close_fds_via_proc(keep: &[RawFd]) -> Result<()> {
    let fds = get_open_fds()?;
    let mut failed = Vec::new();

    for fd in fds {
        if fd <= 2 || keep.binary_search(&fd).is_ok() {
            continue;
        }
        if let Err(e) = close(fd) {
            // The directory handle used for listing is already gone.
            if e != nix::errno::Errno::EBADF {
                failed.push(format!("fd {}: {}", fd, e));
            }
        }
    }

    if !failed.is_empty() {
        return Err(IsolateError::Process(format!(
            "Failed to close {} FD(s): {}",
            failed.len(),
            failed.join(", ")
        )));
    }
    Ok(())
}

/// Get list of open file descriptors
pub fn get_open_fds() -> Result<Vec<RawFd>> {
    let fd_dir = "/proc/self/fd";

    let entries = fs::read_dir(fd_dir)
        .map_err(|e| IsolateError::Process(format!("Failed to read {}: {}", fd_dir, e)))?;

    let mut fds: Vec<RawFd> = entries
        .flatten()
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter_map(|name| name.parse::<RawFd>().ok())
        .collect();
    fds.sort_unstable();
    Ok(fds)
}
