//! The parent-side event loop: the heart of this crate.
//!
//! One invocation at a time wires up three pipes (stdin, stdout, and a
//! one-shot exec-error pipe), forks, and drives a single-threaded
//! `select(2)` loop over the notify-pipe, the stdin write end, and the
//! stdout read end until the child exits or the wall-clock timeout expires.
//! The self-pipe idiom (see [`crate::session`]) is what lets a `SIGCHLD`
//! delivery wake a blocked `select` safely.

use crate::child::{run_in_child, ChildFds};
use crate::error::{Error, Syscall};
use crate::exec::{Argv, Envp};
use crate::libc_util::{check_int, errno_is_broken_pipe, errno_is_eintr, errno_is_would_block, retry_eintr_int};
use crate::pipe::{OwnedFd, RawPipe};
use crate::session::Session;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

/// Blocks `SIGCHLD` for the duration of the guard's lifetime, restoring the
/// previous process signal mask on drop (or, eagerly and fallibly, via
/// [`SigchldMaskGuard::restore`]).
///
/// Needed to close the race between `fork()` returning in the parent and
/// [`Session::begin_invocation`] recording the child's pid: without it, a
/// child that execs and exits before `begin_invocation` runs delivers
/// `SIGCHLD` while `CURRENT_PID` still holds the sentinel, so the handler's
/// `pid == CURRENT_PID` check (see `session.rs`) never matches and the
/// notify-pipe is never written — the event loop then spins or times out
/// for an invocation that actually already finished.
struct SigchldMaskGuard {
    old_mask: libc::sigset_t,
    active: bool,
}

impl SigchldMaskGuard {
    /// Blocks `SIGCHLD` in the calling process, returning a guard that
    /// restores the previous mask on drop.
    fn block() -> Result<Self, Error> {
        let mut chld_set: libc::sigset_t = unsafe { std::mem::zeroed() };
        let mut old_mask: libc::sigset_t = unsafe { std::mem::zeroed() };
        unsafe {
            libc::sigemptyset(&mut chld_set);
            libc::sigaddset(&mut chld_set, libc::SIGCHLD);
        }
        check_int(
            unsafe { libc::sigprocmask(libc::SIG_BLOCK, &chld_set, &mut old_mask) },
            Syscall::Sigprocmask,
        )?;
        Ok(SigchldMaskGuard { old_mask, active: true })
    }

    /// Restores the previous mask now, observing failure (the `Drop` path
    /// can only log it).
    fn restore(mut self) -> Result<(), Error> {
        self.restore_mut()
    }

    fn restore_mut(&mut self) -> Result<(), Error> {
        if !self.active {
            return Ok(());
        }
        self.active = false;
        check_int(
            unsafe { libc::sigprocmask(libc::SIG_SETMASK, &self.old_mask, std::ptr::null_mut()) },
            Syscall::Sigprocmask,
        )?;
        Ok(())
    }
}

impl Drop for SigchldMaskGuard {
    fn drop(&mut self) {
        if let Err(e) = self.restore_mut() {
            warn!("failed to restore signal mask: {}", e);
        }
    }
}

/// Unblocks `SIGCHLD` in a freshly forked child, best-effort: the mask is
/// otherwise inherited across `exec`, which would leave the child's own
/// program unable to receive `SIGCHLD` for its own children.
fn unblock_sigchld_in_child() {
    let mut chld_set: libc::sigset_t = unsafe { std::mem::zeroed() };
    unsafe {
        libc::sigemptyset(&mut chld_set);
        libc::sigaddset(&mut chld_set, libc::SIGCHLD);
        libc::sigprocmask(libc::SIG_UNBLOCK, &chld_set, std::ptr::null_mut());
    }
}

/// A conservative ceiling for a single `select` wait when the caller asked
/// for no timeout at all: long enough to never matter in practice, short
/// enough that the loop still wakes periodically (it has nothing useful to
/// do on a bare wakeup here, but it keeps `select`'s timeout argument within
/// sane bounds rather than passing `NULL` and blocking truly forever).
const NO_DEADLINE_POLL: Duration = Duration::from_secs(60);

/// Runs `file` with `argv`/`envp` as a child process, feeding it `input` on
/// its standard input and collecting its standard output, subject to
/// `timeout` (`None` = wait forever). See [`crate::Session::run`].
pub(crate) fn run(
    session: &Session,
    input: &[u8],
    file: &str,
    argv: &[&str],
    envp: Option<&[(&str, &str)]>,
    timeout: Option<Duration>,
) -> Result<Vec<u8>, Error> {
    let argv = Argv::new(argv)?;
    let envp = match envp {
        Some(vars) => Some(Envp::new(vars)?),
        None => None,
    };

    let stdin_pipe = RawPipe::new()?;
    let stdout_pipe = RawPipe::new()?;
    let err_pipe = RawPipe::new()?;

    trace!(
        "spawning {:?}: stdin={}/{} stdout={}/{} err={}/{}",
        file,
        stdin_pipe.read.raw(),
        stdin_pipe.write.raw(),
        stdout_pipe.read.raw(),
        stdout_pipe.write.raw(),
        err_pipe.read.raw(),
        err_pipe.write.raw(),
    );

    // Block SIGCHLD until `begin_invocation` has recorded this child's pid,
    // so the handler can never observe an exit for a pid it doesn't
    // recognize yet (see `SigchldMaskGuard`'s docs).
    let mask_guard = SigchldMaskGuard::block()?;

    let pid = check_int(unsafe { libc::fork() }, Syscall::Fork)?;

    if pid == 0 {
        unblock_sigchld_in_child();
        let fds = ChildFds {
            stdin_read: stdin_pipe.read.raw(),
            stdin_write: stdin_pipe.write.raw(),
            stdout_read: stdout_pipe.read.raw(),
            stdout_write: stdout_pipe.write.raw(),
            notify_read: session.notify_read_fd(),
            notify_write: session.notify_write_fd(),
            err_read: err_pipe.read.raw(),
            err_write: err_pipe.write.raw(),
        };
        run_in_child(fds, file, &argv, envp.as_ref());
    }

    debug!("forked child pid={}", pid);

    // Parent: drop the ends that belong to the child now.
    stdin_pipe.read.close()?;
    stdout_pipe.write.close()?;
    err_pipe.write.close()?;

    let mut stdin_write = Some(stdin_pipe.write);
    let mut stdout_read = Some(stdout_pipe.read);
    let err_read = err_pipe.read;

    if let Err(e) = session.begin_invocation(pid) {
        // Another invocation is live; this one never gets to run. SIGCHLD
        // is still blocked, so terminate and reap it directly rather than
        // risk a signal nobody's listening for yet.
        kill_and_reap(pid);
        return Err(e);
    }

    // The pid is recorded now; safe to let the handler observe this child's
    // exit.
    mask_guard.restore()?;

    let result = run_invocation(session, pid, input, err_read, &mut stdin_write, &mut stdout_read, timeout);

    session.end_invocation();
    result
}

/// The `select` loop proper, plus the exec-error-pipe read that precedes
/// it. Split out from [`run`] so every early return still runs through the
/// same `Drop`-based descriptor cleanup (the `Option<OwnedFd>` parameters
/// are dropped when this function returns, by value or by `?`).
fn run_invocation(
    session: &Session,
    pid: libc::pid_t,
    input: &[u8],
    err_read: OwnedFd,
    stdin_write: &mut Option<OwnedFd>,
    stdout_read: &mut Option<OwnedFd>,
    timeout: Option<Duration>,
) -> Result<Vec<u8>, Error> {
    if let Some(errno) = read_exec_error(&err_read)? {
        reap_best_effort(pid);
        return Err(Error::ExecFailed { errno });
    }
    drop(err_read);

    let deadline = timeout.map(|t| Instant::now() + t);
    let mut cursor = input;
    let mut output = Vec::new();

    loop {
        let notify_fd = session.notify_read_fd();
        let stdin_fd = if !cursor.is_empty() {
            stdin_write.as_ref().map(OwnedFd::raw)
        } else {
            None
        };
        let stdout_fd = stdout_read.as_ref().map(OwnedFd::raw);

        let mut read_fds = build_fd_set(&[Some(notify_fd), stdout_fd]);
        let mut write_fds = build_fd_set(&[stdin_fd]);
        let nfds = [Some(notify_fd), stdin_fd, stdout_fd].iter().flatten().max().map_or(0, |f| f + 1);

        let mut timeval = match deadline {
            Some(d) => match remaining_timeval(d) {
                Some(tv) => tv,
                None => {
                    kill_and_reap(pid);
                    return Err(Error::Timeout);
                }
            },
            None => to_timeval(NO_DEADLINE_POLL),
        };

        let ready = retry_select(nfds, &mut read_fds, &mut write_fds, &mut timeval, deadline, pid)?;

        if ready == 0 {
            if deadline.is_some() {
                kill_and_reap(pid);
                return Err(Error::Timeout);
            }
            continue;
        }

        if fd_isset(notify_fd, &read_fds) {
            drain_notify_byte(notify_fd)?;
            if let Some(fd) = stdout_read.take() {
                drain_to_eof(&fd, &mut output)?;
            }
            reap_best_effort(pid);
            return Ok(output);
        }

        if let Some(fd) = stdin_fd {
            if fd_isset(fd, &write_fds) {
                write_input_chunk(stdin_write, &mut cursor, fd)?;
                continue;
            }
        }

        if let Some(fd) = stdout_fd {
            if fd_isset(fd, &read_fds) {
                read_output_chunk(stdout_read, &mut output)?;
            }
        }
    }
}

/// Calls `select`, retrying transparently on `EINTR` (recomputing the
/// remaining timeout before each retry, per the deadline rule in §4.4).
/// Any other failure sends `SIGTERM` to the child before surfacing the
/// error, since the invocation is being abandoned.
fn retry_select(
    nfds: RawFd,
    read_fds: &mut libc::fd_set,
    write_fds: &mut libc::fd_set,
    timeval: &mut libc::timeval,
    deadline: Option<Instant>,
    pid: libc::pid_t,
) -> Result<libc::c_int, Error> {
    loop {
        let ret = unsafe { libc::select(nfds, read_fds, write_fds, std::ptr::null_mut(), timeval) };
        if ret != -1 {
            return Ok(ret);
        }
        if errno_is_eintr() {
            if let Some(d) = deadline {
                match remaining_timeval(d) {
                    Some(tv) => *timeval = tv,
                    None => {
                        kill_and_reap(pid);
                        return Err(Error::Timeout);
                    }
                }
            }
            continue;
        }
        let errno = errno::errno().0;
        kill_and_reap(pid);
        return Err(Error::SelectFailed { errno });
    }
}

/// Reads the child's exec-error pipe: `None` on a zero-length read (exec
/// succeeded, the kernel closed the close-on-exec write end), `Some(errno)`
/// on a positive-length read.
fn read_exec_error(err_read: &OwnedFd) -> Result<Option<i32>, Error> {
    let mut buf = [0u8; std::mem::size_of::<libc::c_int>()];
    let mut total = 0usize;
    while total < buf.len() {
        let ret = unsafe {
            libc::read(
                err_read.raw(),
                buf[total..].as_mut_ptr() as *mut libc::c_void,
                buf.len() - total,
            )
        };
        if ret == -1 {
            if errno_is_eintr() {
                continue;
            }
            return Err(Syscall::Read.into_error(errno::errno().0));
        }
        if ret == 0 {
            break;
        }
        total += ret as usize;
    }
    if total == 0 {
        Ok(None)
    } else {
        Ok(Some(i32::from_ne_bytes(buf)))
    }
}

fn drain_notify_byte(notify_fd: RawFd) -> Result<(), Error> {
    let mut byte = [0u8; 1];
    loop {
        let ret = unsafe { libc::read(notify_fd, byte.as_mut_ptr() as *mut libc::c_void, 1) };
        if ret == -1 {
            if errno_is_eintr() {
                continue;
            }
            if errno_is_would_block() {
                return Ok(());
            }
            return Err(Syscall::Read.into_error(errno::errno().0));
        }
        return Ok(());
    }
}

fn drain_to_eof(fd: &OwnedFd, output: &mut Vec<u8>) -> Result<(), Error> {
    let mut scratch = [0u8; libc::PIPE_BUF];
    loop {
        let ret = unsafe { libc::read(fd.raw(), scratch.as_mut_ptr() as *mut libc::c_void, scratch.len()) };
        if ret == -1 {
            if errno_is_eintr() {
                continue;
            }
            if errno_is_broken_pipe() {
                return Ok(());
            }
            return Err(Syscall::Read.into_error(errno::errno().0));
        }
        if ret == 0 {
            return Ok(());
        }
        output.extend_from_slice(&scratch[..ret as usize]);
    }
}

fn write_input_chunk(stdin_write: &mut Option<OwnedFd>, cursor: &mut &[u8], fd: RawFd) -> Result<(), Error> {
    let chunk_len = cursor.len().min(libc::PIPE_BUF);
    let chunk = &cursor[..chunk_len];

    let ret = unsafe { libc::write(fd, chunk.as_ptr() as *const libc::c_void, chunk.len()) };

    if ret == -1 {
        if errno_is_eintr() || errno_is_would_block() {
            return Ok(());
        }
        if errno_is_broken_pipe() {
            warn!("child closed stdin early, no longer writing input");
            *stdin_write = None;
            return Ok(());
        }
        return Err(Syscall::Write.into_error(errno::errno().0));
    }

    let written = ret as usize;
    *cursor = &cursor[written..];
    if cursor.is_empty() {
        if let Some(w) = stdin_write.take() {
            w.close()?;
        }
    }
    Ok(())
}

/// Reads one chunk from the child's stdout. A `0`-byte read means the
/// stream has hit genuine EOF (all writers closed); since nothing more can
/// ever arrive, `stdout_read` is cleared so the fd stops being added to the
/// `select` read-set — otherwise a pipe at EOF is always select-ready and
/// the loop would spin on `select`+`read` until the exit notification
/// eventually shows up (§4.4 rule 5).
fn read_output_chunk(stdout_read: &mut Option<OwnedFd>, output: &mut Vec<u8>) -> Result<(), Error> {
    let fd = match stdout_read.as_ref() {
        Some(f) => f.raw(),
        None => return Ok(()),
    };
    let mut scratch = [0u8; libc::PIPE_BUF];
    let ret = unsafe { libc::read(fd, scratch.as_mut_ptr() as *mut libc::c_void, scratch.len()) };
    if ret == -1 {
        if errno_is_eintr() || errno_is_would_block() {
            return Ok(());
        }
        if errno_is_broken_pipe() {
            *stdout_read = None;
            return Ok(());
        }
        return Err(Syscall::Read.into_error(errno::errno().0));
    }
    if ret == 0 {
        *stdout_read = None;
        return Ok(());
    }
    output.extend_from_slice(&scratch[..ret as usize]);
    Ok(())
}

/// Sends `SIGTERM` to `pid` and reaps it. Used whenever an invocation is
/// abandoned without having reached its normal exit-notification path:
/// timeout, a `select`/`write` failure, or a `Busy` rejection of a child
/// that already forked (and possibly exec'd) before the rejection.
fn kill_and_reap(pid: libc::pid_t) {
    if let Err(e) = retry_eintr_int(Syscall::Kill, || unsafe { libc::kill(pid, libc::SIGTERM) }) {
        warn!("failed to SIGTERM abandoned child {}: {}", pid, e);
    }
    reap_best_effort(pid);
}

/// Reaps a child outside the signal-handler path (exec failure before the
/// invocation got going, or after forcing termination). Best-effort: the
/// `SIGCHLD` handler usually wins the race via `waitpid(-1, ...)`, in which
/// case this just observes `ECHILD`.
fn reap_best_effort(pid: libc::pid_t) {
    loop {
        let mut status: libc::c_int = 0;
        let ret = unsafe { libc::waitpid(pid, &mut status, 0) };
        if ret == -1 && errno_is_eintr() {
            continue;
        }
        break;
    }
}

fn build_fd_set(fds: &[Option<RawFd>]) -> libc::fd_set {
    let mut set: libc::fd_set = unsafe { std::mem::zeroed() };
    unsafe { libc::FD_ZERO(&mut set) };
    for fd in fds.iter().flatten() {
        unsafe { libc::FD_SET(*fd, &mut set) };
    }
    set
}

fn fd_isset(fd: RawFd, set: &libc::fd_set) -> bool {
    // libc's FD_ISSET takes `*mut fd_set` even though it only reads; cast
    // explicitly since `&T` doesn't coerce to `*mut T`.
    fd >= 0 && unsafe { libc::FD_ISSET(fd, set as *const libc::fd_set as *mut libc::fd_set) }
}

fn to_timeval(d: Duration) -> libc::timeval {
    libc::timeval {
        tv_sec: d.as_secs() as libc::time_t,
        tv_usec: d.subsec_micros() as libc::suseconds_t,
    }
}

/// `None` once the deadline has already passed; otherwise the time left.
fn remaining_timeval(deadline: Instant) -> Option<libc::timeval> {
    let now = Instant::now();
    if now >= deadline {
        return None;
    }
    Some(to_timeval(deadline - now))
}
