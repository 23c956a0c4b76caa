//! Local pipe plumbing for the session loop.
//!
//! The wake pipe is the loop's out-of-band doorbell: its read end sits in
//! the select read set, and any thread that mutates state the loop must
//! observe writes a single byte to the write end to break the select.

use std::io;
use std::os::fd::{AsRawFd, RawFd};

use os_pipe::{PipeReader, PipeWriter};

/// Put `fd` into nonblocking mode.
pub(crate) fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: fd is a valid open descriptor owned by the caller; F_GETFL and
    // F_SETFL take and return plain flag words.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: same fd, flags is the value the kernel just handed back.
    let ret = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// One-byte-per-wake doorbell pipe.
///
/// Both ends are nonblocking: a wake against a full pipe is dropped (the
/// loop is already due to wake), and a drain against an empty pipe is a
/// no-op. Created unconditionally when the session is built.
pub(crate) struct WakePipe {
    reader: PipeReader,
    writer: PipeWriter,
}

impl WakePipe {
    pub(crate) fn new() -> io::Result<Self> {
        let (reader, writer) = os_pipe::pipe()?;
        set_nonblocking(reader.as_raw_fd())?;
        set_nonblocking(writer.as_raw_fd())?;
        Ok(Self { reader, writer })
    }

    /// The read end for the select read set.
    pub(crate) fn poll_fd(&self) -> RawFd {
        self.reader.as_raw_fd()
    }

    /// Make the read end ready. Never blocks: against a full pipe the byte
    /// is dropped, because the loop is already due to wake.
    pub(crate) fn wake(&self) {
        let byte = [1u8];
        // SAFETY: the fd is owned by self and nonblocking; a 1-byte write
        // either succeeds or fails with EAGAIN.
        let ret = unsafe { libc::write(self.writer.as_raw_fd(), byte.as_ptr().cast(), 1) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock {
                tracing::warn!("wake pipe: write failed: {err}");
            }
        }
    }

    /// Consume one pending wake, if any. Returns whether a byte was read.
    pub(crate) fn drain(&self) -> bool {
        let mut byte = [0u8; 1];
        // SAFETY: the fd is owned by self and nonblocking; reading into a
        // 1-byte stack buffer either returns data or fails with EAGAIN.
        let ret = unsafe { libc::read(self.reader.as_raw_fd(), byte.as_mut_ptr().cast(), 1) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock {
                tracing::warn!("wake pipe: read failed: {err}");
            }
            return false;
        }
        ret > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wake_then_drain() {
        let wake = WakePipe::new().unwrap();
        wake.wake();
        assert!(wake.drain());
        assert!(!wake.drain());
    }

    #[test]
    fn drain_on_empty_pipe_does_not_block() {
        let wake = WakePipe::new().unwrap();
        assert!(!wake.drain());
    }

    #[test]
    fn one_byte_per_wake() {
        let wake = WakePipe::new().unwrap();
        wake.wake();
        wake.wake();
        assert!(wake.drain());
        assert!(wake.drain());
        assert!(!wake.drain());
    }

    #[test]
    fn wake_against_full_pipe_is_dropped() {
        let wake = WakePipe::new().unwrap();
        // Pipe capacity is finite (64 KiB on Linux); far overshoot it.
        for _ in 0..100_000 {
            wake.wake();
        }
        assert!(wake.drain());
    }
}
