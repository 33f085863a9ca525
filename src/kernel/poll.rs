/// Readiness waiting over raw descriptors via poll(2)
use nix::poll::{poll, PollFd, PollFlags};
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

/// Block until at least one descriptor is readable (or hung up), or until
/// `timeout` elapses. Returns one readiness flag per descriptor; all false
/// on timeout. EINTR surfaces as `ErrorKind::Interrupted`.
pub fn wait_readable(fds: &[RawFd], timeout: Option<Duration>) -> io::Result<Vec<bool>> {
    let mut pollfds: Vec<PollFd> = fds
        .iter()
        .map(|&fd| PollFd::new(fd, PollFlags::POLLIN))
        .collect();

    let timeout_ms: libc::c_int = match timeout {
        None => -1,
        Some(d) => d.as_millis().min(libc::c_int::MAX as u128) as libc::c_int,
    };

    poll(&mut pollfds, timeout_ms).map_err(io::Error::from)?;

    let ready = PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR;
    Ok(pollfds
        .iter()
        .map(|p| p.revents().map_or(false, |revents| revents.intersects(ready)))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::time::Instant;

    #[test]
    fn times_out_when_nothing_is_readable() {
        let (a, _b) = UnixStream::pair().unwrap();
        let started = Instant::now();
        let ready = wait_readable(&[a.as_raw_fd()], Some(Duration::from_millis(50))).unwrap();
        assert_eq!(ready, vec![false]);
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn reports_the_readable_descriptor() {
        let (a, _b) = UnixStream::pair().unwrap();
        let (c, mut d) = UnixStream::pair().unwrap();
        d.write_all(b"x").unwrap();

        let ready = wait_readable(&[a.as_raw_fd(), c.as_raw_fd()], None).unwrap();
        assert_eq!(ready, vec![false, true]);
    }

    #[test]
    fn hangup_counts_as_readable() {
        let (a, b) = UnixStream::pair().unwrap();
        drop(b);
        let ready = wait_readable(&[a.as_raw_fd()], Some(Duration::from_secs(1))).unwrap();
        assert_eq!(ready, vec![true]);
    }
}
