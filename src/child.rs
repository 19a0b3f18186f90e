//! Steps performed inside the child process, strictly after `fork()` and
//! before `exec()` takes over the address space.

use crate::error::{Error, Syscall};
use crate::exec::{exec, Argv, Envp};
use crate::libc_util::check_int;
use std::os::unix::io::RawFd;

/// All raw descriptors the child sees right after `fork()`, before any of
/// them have been rewired or closed.
pub(crate) struct ChildFds {
    pub stdin_read: RawFd,
    pub stdin_write: RawFd,
    pub stdout_read: RawFd,
    pub stdout_write: RawFd,
    pub notify_read: RawFd,
    pub notify_write: RawFd,
    pub err_read: RawFd,
    pub err_write: RawFd,
}

/// Runs entirely inside the freshly forked child. Never returns: either
/// `exec` replaces the process image, or setup/exec failure reports the
/// `errno` through `err_write` and calls `_exit`.
///
/// Every step here is a hard failure: a child that can't wire up its own
/// pipes can't meaningfully run anything, and panicking after `fork()` is
/// unsound (it could run arbitrary unwind/cleanup code sharing state with
/// the parent), so every error path below goes straight to `_exit` instead
/// of propagating a `Result` to a caller that no longer safely exists.
pub(crate) fn run_in_child(fds: ChildFds, file: &str, argv: &Argv, envp: Option<&Envp>) -> ! {
    if let Err(e) = setup(&fds) {
        report_and_exit(fds.err_write, e);
    }

    let err = exec(file, argv, envp);
    report_and_exit(fds.err_write, err);
}

fn setup(fds: &ChildFds) -> Result<(), Error> {
    dup2(fds.stdin_read, libc::STDIN_FILENO)?;
    close(fds.stdin_write)?;

    dup2(fds.stdout_write, libc::STDOUT_FILENO)?;
    close(fds.stdout_read)?;

    close(fds.notify_read)?;
    close(fds.notify_write)?;

    close(fds.err_read)?;
    cloexec(fds.err_write)?;

    Ok(())
}

fn dup2(from: RawFd, to: RawFd) -> Result<(), Error> {
    check_int(unsafe { libc::dup2(from, to) }, Syscall::Dup2)?;
    Ok(())
}

fn close(fd: RawFd) -> Result<(), Error> {
    check_int(unsafe { libc::close(fd) }, Syscall::Close)?;
    Ok(())
}

fn cloexec(fd: RawFd) -> Result<(), Error> {
    unsafe {
        let flags = check_int(libc::fcntl(fd, libc::F_GETFD), Syscall::Fcntl)?;
        check_int(libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC), Syscall::Fcntl)?;
    }
    Ok(())
}

/// Writes the triggering error's `errno` (best-effort, no retry loop — no
/// signal handlers are active in this window that could interrupt a
/// single `write`) into the error pipe and exits with a conventional
/// OS-error status, matching the original C source's
/// `write(...); _exit(EX_OSERR);` sequence.
fn report_and_exit(err_write: RawFd, e: Error) -> ! {
    let code: libc::c_int = e.errno().unwrap_or(libc::EIO);
    unsafe {
        libc::write(
            err_write,
            &code as *const libc::c_int as *const libc::c_void,
            std::mem::size_of::<libc::c_int>(),
        );
        libc::_exit(libc::EX_OSERR);
    }
}
