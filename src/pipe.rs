//! Abstraction over UNIX pipes and raw file descriptors.
//!
//! Every descriptor an invocation opens is wrapped in an [`OwnedFd`], whose
//! `Drop` closes it (retrying on `EINTR`). This is what guarantees every
//! descriptor is closed on every exit path, success or failure, without
//! every call site having to remember to do so by hand.

use crate::error::{Error, Syscall};
use crate::libc_util::{check_int, retry_eintr_int};
use std::os::unix::io::RawFd;

/// An owned raw file descriptor. Closes itself on drop.
#[derive(Debug)]
pub struct OwnedFd(RawFd);

impl OwnedFd {
    /// Takes ownership of a raw fd. The caller must not close it itself.
    pub(crate) fn new(fd: RawFd) -> Self {
        OwnedFd(fd)
    }

    pub fn raw(&self) -> RawFd {
        self.0
    }

    /// Sets the `FD_CLOEXEC` flag on this descriptor.
    pub(crate) fn set_cloexec(&self) -> Result<(), Error> {
        unsafe {
            let flags = check_int(libc::fcntl(self.0, libc::F_GETFD), Syscall::Fcntl)?;
            check_int(
                libc::fcntl(self.0, libc::F_SETFD, flags | libc::FD_CLOEXEC),
                Syscall::Fcntl,
            )?;
        }
        Ok(())
    }

    /// Consumes and closes the descriptor explicitly, observing the error
    /// rather than logging and swallowing it as `Drop` does.
    pub(crate) fn close(mut self) -> Result<(), Error> {
        self.close_mut()
    }

    fn close_mut(&mut self) -> Result<(), Error> {
        if self.0 < 0 {
            return Ok(());
        }
        let fd = self.0;
        self.0 = -1;
        retry_eintr_int(Syscall::Close, || unsafe { libc::close(fd) })?;
        Ok(())
    }
}

impl Drop for OwnedFd {
    fn drop(&mut self) {
        if self.0 < 0 {
            return;
        }
        if let Err(e) = self.close_mut() {
            warn!("close({}) failed on drop: {}", self.0, e);
        }
    }
}

/// A freshly created, unidirectional-use `pipe(2)` pair. Both ends are
/// still open; the caller decides which end(s) to keep for which role.
pub struct RawPipe {
    pub read: OwnedFd,
    pub write: OwnedFd,
}

impl RawPipe {
    /// Creates a new pipe via `pipe(2)`.
    pub fn new() -> Result<Self, Error> {
        let mut fds: [libc::c_int; 2] = [0, 0];
        check_int(unsafe { libc::pipe(fds.as_mut_ptr()) }, Syscall::Pipe)?;
        trace!("pipe created: read={}, write={}", fds[0], fds[1]);
        Ok(RawPipe {
            read: OwnedFd::new(fds[0]),
            write: OwnedFd::new(fds[1]),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_pipe_has_distinct_valid_fds() {
        let pipe = RawPipe::new().unwrap();
        assert_ne!(pipe.read.raw(), pipe.write.raw());
        assert!(pipe.read.raw() >= 0);
        assert!(pipe.write.raw() >= 0);
    }

    #[test]
    fn owned_fd_close_is_idempotent_via_drop() {
        let pipe = RawPipe::new().unwrap();
        let fd = pipe.read.raw();
        pipe.read.close().unwrap();
        // closing twice must not panic or double-free; the raw fd is
        // simply gone now, dropping `write` is unrelated.
        drop(pipe.write);
        let _ = fd;
    }
}
