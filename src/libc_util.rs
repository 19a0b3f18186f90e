//! libc utilities: translating raw return values into typed errors, and
//! retrying syscalls that were interrupted by a signal (`EINTR`).

use crate::error::{Error, Syscall};

/// Returns the error belonging to the last `errno` set by a libc call.
fn last_error(syscall: Syscall) -> Error {
    syscall.into_error(errno::errno().0)
}

/// Turns a `c_int`-returning libc call's return value into a `Result`.
/// `-1` means failure (consult `errno`); anything else (usually `0`, but
/// e.g. `fork()`'s pid counts too) is success.
pub fn check_int(ret: libc::c_int, syscall: Syscall) -> Result<libc::c_int, Error> {
    if ret == -1 {
        Err(last_error(syscall))
    } else {
        Ok(ret)
    }
}

/// Like [`check_int`], but for the `ssize_t`-returning family (`read`,
/// `write`).
pub fn check_ssize(ret: isize, syscall: Syscall) -> Result<isize, Error> {
    if ret == -1 {
        Err(last_error(syscall))
    } else {
        Ok(ret)
    }
}

/// True if the current `errno` is `EINTR`.
pub fn errno_is_eintr() -> bool {
    errno::errno().0 == libc::EINTR
}

/// True if the current `errno` is `EAGAIN`/`EWOULDBLOCK`.
pub fn errno_is_would_block() -> bool {
    let e = errno::errno().0;
    e == libc::EAGAIN || e == libc::EWOULDBLOCK
}

/// True if the current `errno` is `EPIPE`.
pub fn errno_is_broken_pipe() -> bool {
    errno::errno().0 == libc::EPIPE
}

/// Repeats a `c_int`-returning libc call as long as it fails with `EINTR`.
pub fn retry_eintr_int<F: FnMut() -> libc::c_int>(
    syscall: Syscall,
    mut f: F,
) -> Result<libc::c_int, Error> {
    loop {
        let ret = f();
        if ret == -1 && errno_is_eintr() {
            trace!("{:?} interrupted by EINTR, retrying", syscall);
            continue;
        }
        return check_int(ret, syscall);
    }
}

/// Repeats an `ssize_t`-returning libc call (`read`/`write`) as long as it
/// fails with `EINTR`.
pub fn retry_eintr_ssize<F: FnMut() -> isize>(
    syscall: Syscall,
    mut f: F,
) -> Result<isize, Error> {
    loop {
        let ret = f();
        if ret == -1 && errno_is_eintr() {
            trace!("{:?} interrupted by EINTR, retrying", syscall);
            continue;
        }
        return check_ssize(ret, syscall);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_int_ok_on_non_negative_one() {
        assert_eq!(check_int(0, Syscall::Close).unwrap(), 0);
        assert_eq!(check_int(42, Syscall::Fork).unwrap(), 42);
    }

    #[test]
    fn check_int_is_err_on_minus_one() {
        // EBADF, set so the translated error is deterministic.
        errno::set_errno(errno::Errno(libc::EBADF));
        let err = check_int(-1, Syscall::Close).unwrap_err();
        assert_eq!(err, Error::CloseFailed { errno: libc::EBADF });
    }
}
