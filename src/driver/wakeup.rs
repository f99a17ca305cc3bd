//! Wakeup channel for the poll loop.
//!
//! An anonymous pipe whose read end sits at index 0 of the poll set. Any
//! thread with work for the poll loop writes one byte; the loop drains the
//! pipe at the top of its next iteration. A pending-byte counter bounds the
//! drain so one successful signal is never lost and never over-read.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};

/// Largest drain chunk per read.
const DRAIN_CHUNK: u64 = 1024;

pub(crate) struct WakeupPipe {
    read_fd: OwnedFd,
    write_fd: OwnedFd,
    /// Bytes written but not yet drained.
    pending: AtomicU64,
}

impl WakeupPipe {
    pub fn new() -> io::Result<Self> {
        let (read_fd, write_fd) = nix::unistd::pipe().map_err(io::Error::from)?;

        // The drain is bounded by the counter, but a spurious poll wake must
        // not park the loop inside read(2).
        unsafe {
            let flags = libc::fcntl(read_fd.as_raw_fd(), libc::F_GETFL);
            if flags < 0
                || libc::fcntl(read_fd.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK) < 0
            {
                return Err(io::Error::last_os_error());
            }
        }

        Ok(Self {
            read_fd,
            write_fd,
            pending: AtomicU64::new(0),
        })
    }

    /// Write one byte into the pipe. One successful signal guarantees one
    /// future wake; a failed write is logged and not counted.
    pub fn signal(&self) {
        let rc = unsafe { libc::write(self.write_fd.as_raw_fd(), [0u8].as_ptr().cast(), 1) };
        if rc == 1 {
            self.pending.fetch_add(1, Ordering::AcqRel);
        } else {
            let err = io::Error::last_os_error();
            tracing::warn!(error = %err, "wakeup pipe write failed");
        }
    }

    /// Drain everything signalled so far, in chunks of at most 1024 bytes,
    /// leaving the counter at zero.
    pub fn drain(&self) {
        let mut buf = [0u8; DRAIN_CHUNK as usize];
        loop {
            let pending = self.pending.load(Ordering::Acquire);
            if pending == 0 {
                return;
            }
            let want = pending.min(DRAIN_CHUNK) as usize;
            let n = unsafe { libc::read(self.read_fd.as_raw_fd(), buf.as_mut_ptr().cast(), want) };
            if n <= 0 {
                return;
            }
            self.pending.fetch_sub(n as u64, Ordering::AcqRel);
        }
    }

    /// Read end, for poll-set entry 0.
    pub fn read_fd(&self) -> RawFd {
        self.read_fd.as_raw_fd()
    }

    #[cfg(test)]
    pub fn pending(&self) -> u64 {
        self.pending.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn readable(pipe: &WakeupPipe) -> bool {
        let mut pfd = libc::pollfd {
            fd: pipe.read_fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let rc = unsafe { libc::poll(&mut pfd, 1, 0) };
        rc > 0 && pfd.revents & libc::POLLIN != 0
    }

    #[test]
    fn test_signal_then_drain() {
        let pipe = WakeupPipe::new().unwrap();
        assert!(!readable(&pipe));

        pipe.signal();
        assert_eq!(pipe.pending(), 1);
        assert!(readable(&pipe));

        pipe.drain();
        assert_eq!(pipe.pending(), 0);
        assert!(!readable(&pipe));
    }

    #[test]
    fn test_drain_is_idempotent() {
        let pipe = WakeupPipe::new().unwrap();
        for _ in 0..7 {
            pipe.signal();
        }
        pipe.drain();
        pipe.drain();
        assert_eq!(pipe.pending(), 0);
        assert!(!readable(&pipe));
    }

    #[test]
    fn test_drain_chunks_past_1024() {
        let pipe = WakeupPipe::new().unwrap();
        for _ in 0..1500 {
            pipe.signal();
        }
        assert_eq!(pipe.pending(), 1500);
        pipe.drain();
        assert_eq!(pipe.pending(), 0);
        assert!(!readable(&pipe));
    }
}
