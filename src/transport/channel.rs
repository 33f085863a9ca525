//! Transport endpoints between a supervisor and its isolated context.
//!
//! `Streamed` is a pipe: the parent end can only read, the child end can only
//! write. `Socket` is a Unix stream pair and carries frames both ways. Both
//! speak the same length-prefixed framing from [`super::frame`].

use crate::config::types::{IsolateError, Result, TransportKind};
use crate::kernel::poll::wait_readable;
use crate::transport::frame::{encode_frame, FrameBuffer, Received};
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::unistd::pipe2;
use std::fs::File;
use std::io::{self, ErrorKind, Read, Write};
use std::net::Shutdown;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::net::UnixStream;

const READ_CHUNK: usize = 8 * 1024;

fn to_process_error(prefix: &str, err: impl std::fmt::Display) -> IsolateError {
    IsolateError::Process(format!("{prefix}: {err}"))
}

#[derive(Debug)]
enum Inner {
    PipeReader(File),
    PipeWriter(File),
    Socket(UnixStream),
}

/// One side of a transport channel.
#[derive(Debug)]
pub struct Endpoint {
    kind: TransportKind,
    inner: Inner,
    inbox: FrameBuffer,
}

/// Create a channel of the requested kind. Returns `(parent, child)`.
pub fn open(kind: TransportKind, max_frame: usize) -> Result<(Endpoint, Endpoint)> {
    let (parent, child) = match kind {
        TransportKind::Streamed => {
            let (read_fd, write_fd) = pipe_cloexec("pipe(transport)")?;
            (Inner::PipeReader(read_fd), Inner::PipeWriter(write_fd))
        }
        TransportKind::Socket => {
            let (parent, child) = UnixStream::pair()
                .map_err(|e| to_process_error("socketpair(transport)", e))?;
            (Inner::Socket(parent), Inner::Socket(child))
        }
    };

    Ok((
        Endpoint::new(kind, parent, max_frame),
        Endpoint::new(kind, child, max_frame),
    ))
}

fn pipe_cloexec(what: &str) -> Result<(File, File)> {
    let (read_fd, write_fd) = pipe2(OFlag::O_CLOEXEC).map_err(|e| to_process_error(what, e))?;
    // SAFETY: pipe2 returned two fresh descriptors that nothing else owns.
    Ok(unsafe { (File::from_raw_fd(read_fd), File::from_raw_fd(write_fd)) })
}

impl Endpoint {
    fn new(kind: TransportKind, inner: Inner, max_frame: usize) -> Self {
        Self {
            kind,
            inner,
            inbox: FrameBuffer::new(max_frame),
        }
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    /// Write one frame and flush it.
    pub fn send_frame(&mut self, payload: &[u8]) -> Result<()> {
        let framed = encode_frame(payload)?;
        match &mut self.inner {
            Inner::PipeWriter(file) => {
                file.write_all(&framed)?;
                file.flush()?;
            }
            Inner::Socket(stream) => {
                stream.write_all(&framed)?;
                stream.flush()?;
            }
            Inner::PipeReader(_) => {
                return Err(IsolateError::Process(
                    "streamed transport: this end is read-only".to_string(),
                ))
            }
        }
        Ok(())
    }

    /// Blocking read of the next frame, or an explicit end-of-stream signal.
    pub fn recv_frame(&mut self) -> Result<Received> {
        if let Some(frame) = self.inbox.take_frame()? {
            return Ok(Received::Frame(frame));
        }
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            match self.read_some(&mut chunk) {
                Ok(0) => return self.inbox.finish(),
                Ok(n) => {
                    self.inbox.extend(&chunk[..n]);
                    if let Some(frame) = self.inbox.take_frame()? {
                        return Ok(Received::Frame(frame));
                    }
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Read the context's envelope frame without depending on end-of-stream.
    ///
    /// Reads as data arrives. Once `watch` fires (the context has terminated
    /// and everything it wrote is already buffered) whatever is left is
    /// drained and resolved. Another forked process still holding a copy of
    /// the write end therefore cannot stall the read. Closes the endpoint.
    pub fn collect(mut self, watch: &WakeWatch) -> Result<Received> {
        self.set_nonblocking()?;
        let data_fd = self.as_raw_fd();
        let wake_fd = watch.as_raw_fd();
        let mut woken = false;
        let mut chunk = vec![0u8; READ_CHUNK];

        let received = loop {
            match self.read_some(&mut chunk) {
                Ok(0) => break self.inbox.finish()?,
                Ok(n) => {
                    self.inbox.extend(&chunk[..n]);
                    if let Some(frame) = self.inbox.take_frame()? {
                        break Received::Frame(frame);
                    }
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    if woken {
                        break self.inbox.finish()?;
                    }
                    match wait_readable(&[data_fd, wake_fd], None) {
                        Ok(ready) => woken = ready[1],
                        Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                        Err(e) => return Err(to_process_error("poll(transport)", e)),
                    }
                }
                Err(e) => return Err(e.into()),
            }
        };

        self.close();
        Ok(received)
    }

    /// Signal that this side will send nothing more.
    pub fn finish_sending(&mut self) {
        if let Inner::Socket(stream) = &self.inner {
            let _ = stream.shutdown(Shutdown::Write);
        }
    }

    /// Close this end. Dropping has the same effect; this makes it explicit.
    pub fn close(mut self) {
        self.finish_sending();
    }

    fn read_some(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.inner {
            Inner::PipeReader(file) => file.read(buf),
            Inner::Socket(stream) => stream.read(buf),
            Inner::PipeWriter(_) => Err(io::Error::new(
                ErrorKind::Unsupported,
                "streamed transport: this end is write-only",
            )),
        }
    }

    fn set_nonblocking(&mut self) -> Result<()> {
        match &self.inner {
            Inner::Socket(stream) => stream.set_nonblocking(true)?,
            Inner::PipeReader(file) | Inner::PipeWriter(file) => {
                let fd = file.as_raw_fd();
                let flags = fcntl(fd, FcntlArg::F_GETFL)
                    .map_err(|e| to_process_error("fcntl(F_GETFL)", e))?;
                let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
                fcntl(fd, FcntlArg::F_SETFL(flags))
                    .map_err(|e| to_process_error("fcntl(F_SETFL)", e))?;
            }
        }
        Ok(())
    }
}

impl AsRawFd for Endpoint {
    fn as_raw_fd(&self) -> RawFd {
        match &self.inner {
            Inner::PipeReader(file) | Inner::PipeWriter(file) => file.as_raw_fd(),
            Inner::Socket(stream) => stream.as_raw_fd(),
        }
    }
}

/// Write side of a one-shot wakeup. Fires on [`Waker::wake`] or on drop.
#[derive(Debug)]
pub struct Waker {
    file: Option<File>,
}

/// Read side of a one-shot wakeup, watched by [`Endpoint::collect`].
#[derive(Debug)]
pub struct WakeWatch {
    file: File,
}

/// Create a wakeup pair. The byte written by `wake` reaches the watcher even
/// if some unrelated forked process inherited a copy of the write end.
pub fn wake_pair() -> Result<(Waker, WakeWatch)> {
    let (read, write) = pipe_cloexec("pipe(wake)")?;
    Ok((Waker { file: Some(write) }, WakeWatch { file: read }))
}

impl Waker {
    pub fn wake(&mut self) {
        if let Some(mut file) = self.file.take() {
            let _ = file.write_all(&[1]);
        }
    }
}

impl Drop for Waker {
    fn drop(&mut self) {
        self.wake();
    }
}

impl AsRawFd for WakeWatch {
    fn as_raw_fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }
}
