//! The process-wide session: owns the notify-pipe and the installed
//! `SIGCHLD` handler that bridges child-exit signals into the event loop
//! (the self-pipe trick — see the module docs on [`crate::run`]).
//!
//! There can only be one [`Session`] at a time; the handler and the "is a
//! child currently running" bookkeeping live in process-wide statics so the
//! signal handler (which cannot carry arbitrary state) can reach them.

use crate::error::{Error, Syscall};
use crate::libc_util::{check_int, retry_eintr_int};
use crate::pipe::{OwnedFd, RawPipe};
use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

const NO_PID: i32 = -1;

/// Holds whatever `SIGCHLD` handler was installed before ours, for restore
/// on destroy and for chaining.
///
/// Written exactly once, at `Session::init*` time, strictly before our
/// handler is installed (so before any signal delivery could read it), and
/// not mutated again until after our handler has been uninstalled at
/// `destroy` time. That ordering is what makes a plain (non-atomic) read
/// from the signal handler sound despite the lack of synchronization
/// primitives usable inside a signal handler.
struct PriorHandlerSlot(UnsafeCell<MaybeUninit<libc::sigaction>>);
unsafe impl Sync for PriorHandlerSlot {}

static PRIOR_HANDLER: PriorHandlerSlot = PriorHandlerSlot(UnsafeCell::new(MaybeUninit::uninit()));
static CHAIN_ENABLED: AtomicBool = AtomicBool::new(false);
static NOTIFY_WRITE_FD: AtomicI32 = AtomicI32::new(-1);
static CURRENT_PID: AtomicI32 = AtomicI32::new(NO_PID);

/// A handler the caller wants chained to for `SIGCHLD` deliveries that
/// don't belong to this library's own child (mirrors the C ABI's two
/// possible `sigaction` handler shapes).
#[derive(Copy, Clone)]
pub enum PriorHandler {
    Plain(extern "C" fn(libc::c_int)),
    SigInfo(extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void)),
}

enum ChainMode {
    None,
    CapturePrior,
    Provided(PriorHandler),
}

/// Process-wide session state: the notify-pipe and the installed SIGCHLD
/// handler. Must exist before [`crate::run::run`] is called.
pub struct Session {
    notify_read: Option<OwnedFd>,
    notify_write: Option<OwnedFd>,
}

impl Session {
    /// Plain init: installs the `SIGCHLD` handler, forgetting whatever was
    /// installed before (no chaining).
    pub fn init() -> Result<Session, Error> {
        Self::init_impl(ChainMode::None)
    }

    /// Like [`Session::init`], but remembers the prior handler so it is
    /// both restored on [`Session`] drop and chained to for signals about
    /// processes this library didn't spawn.
    pub fn init_capturing_prior() -> Result<Session, Error> {
        Self::init_impl(ChainMode::CapturePrior)
    }

    /// Like [`Session::init_capturing_prior`], but the handler to chain to
    /// is supplied by the caller instead of captured from the environment.
    pub fn init_with_prior(prior: PriorHandler) -> Result<Session, Error> {
        Self::init_impl(ChainMode::Provided(prior))
    }

    fn init_impl(mode: ChainMode) -> Result<Session, Error> {
        let pipe = RawPipe::new()?;
        set_nonblocking(&pipe.read)?;

        if let Err(e) = install_handler(mode) {
            // Nothing else to undo: `pipe` is dropped here, closing both ends.
            return Err(e);
        }

        NOTIFY_WRITE_FD.store(pipe.write.raw(), Ordering::SeqCst);
        debug!("session initialized, notify-pipe read={} write={}", pipe.read.raw(), pipe.write.raw());

        Ok(Session {
            notify_read: Some(pipe.read),
            notify_write: Some(pipe.write),
        })
    }

    /// Tears the session down, restoring the prior `SIGCHLD` handler
    /// before closing the notify-pipe, and returning (rather than
    /// swallowing) the first error encountered while still attempting
    /// subsequent cleanup steps.
    pub fn close(mut self) -> Result<(), Error> {
        self.close_impl()
    }

    fn close_impl(&mut self) -> Result<(), Error> {
        let mut first_err = None;

        if let Err(e) = restore_prior_handler() {
            first_err.get_or_insert(e);
        }
        NOTIFY_WRITE_FD.store(-1, Ordering::SeqCst);

        if let Some(read) = self.notify_read.take() {
            if let Err(e) = read.close() {
                warn!("closing notify-pipe read end failed: {}", e);
                first_err.get_or_insert(e);
            }
        }
        if let Some(write) = self.notify_write.take() {
            if let Err(e) = write.close() {
                warn!("closing notify-pipe write end failed: {}", e);
                first_err.get_or_insert(e);
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Raw fd of the notify-pipe's read end, for the event loop to `select`
    /// on.
    pub(crate) fn notify_read_fd(&self) -> RawFd {
        self.notify_read.as_ref().expect("session already closed").raw()
    }

    /// Raw fd of the notify-pipe's write end, so a freshly forked child can
    /// close its inherited copy (the child must not hold descriptors
    /// belonging to the parent's signal bridge).
    pub(crate) fn notify_write_fd(&self) -> RawFd {
        self.notify_write.as_ref().expect("session already closed").raw()
    }

    /// Marks `pid` as the currently live invocation. Fails with
    /// [`Error::Busy`] if another invocation is already live.
    pub(crate) fn begin_invocation(&self, pid: libc::pid_t) -> Result<(), Error> {
        match CURRENT_PID.compare_exchange(NO_PID, pid, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => Ok(()),
            Err(_) => Err(Error::Busy),
        }
    }

    /// Clears the currently-live invocation marker.
    pub(crate) fn end_invocation(&self) {
        CURRENT_PID.store(NO_PID, Ordering::SeqCst);
    }

    /// Runs `file` with `argv` as a child process, feeding it `input` on
    /// its standard input and returning everything it writes to its
    /// standard output, subject to `timeout` (`None` waits indefinitely).
    /// `envp` of `None` inherits this process's environment; otherwise the
    /// child's environment is exactly the given `KEY=VALUE` pairs.
    ///
    /// At most one invocation may be in flight per session; a concurrent
    /// call returns [`Error::Busy`] rather than corrupting shared state.
    pub fn run(
        &self,
        input: &[u8],
        file: &str,
        argv: &[&str],
        envp: Option<&[(&str, &str)]>,
        timeout: Option<std::time::Duration>,
    ) -> Result<Vec<u8>, Error> {
        crate::run::run(self, input, file, argv, envp, timeout)
    }

    /// Sends `SIGTERM` to the currently live invocation, if any. Safe to
    /// call from the host's own signal handler (only async-signal-safe
    /// primitives are used).
    pub fn terminate(&self) -> Result<(), Error> {
        terminate_current()
    }

    /// Installs handlers for `SIGTERM` and `SIGINT` that call
    /// [`Session::terminate`]'s underlying logic.
    pub fn set_default_terminate(&self) -> Result<(), Error> {
        install_default_terminate()
    }

    /// Restores the default disposition for `SIGTERM` and `SIGINT`.
    pub fn reset_default_terminate(&self) -> Result<(), Error> {
        reset_default_terminate()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.notify_read.is_none() && self.notify_write.is_none() {
            return;
        }
        if let Err(e) = self.close_impl() {
            warn!("error tearing down session on drop: {}", e);
        }
    }
}

/// Sends `SIGTERM` to whatever pid is marked as the live invocation, if
/// any. Free function because it's also what the default-termination
/// signal handler calls, and that handler has no `&Session` to work with.
fn terminate_current() -> Result<(), Error> {
    let pid = CURRENT_PID.load(Ordering::SeqCst);
    if pid == NO_PID {
        return Ok(());
    }
    retry_eintr_int(Syscall::Kill, || unsafe { libc::kill(pid, libc::SIGTERM) })?;
    Ok(())
}

fn set_nonblocking(fd: &OwnedFd) -> Result<(), Error> {
    unsafe {
        let flags = check_int(libc::fcntl(fd.raw(), libc::F_GETFL), Syscall::Fcntl)?;
        check_int(
            libc::fcntl(fd.raw(), libc::F_SETFL, flags | libc::O_NONBLOCK),
            Syscall::Fcntl,
        )?;
    }
    Ok(())
}

fn install_handler(mode: ChainMode) -> Result<(), Error> {
    match mode {
        ChainMode::None => {
            CHAIN_ENABLED.store(false, Ordering::SeqCst);
            sigaction_install(None)
        }
        ChainMode::CapturePrior => {
            CHAIN_ENABLED.store(true, Ordering::SeqCst);
            sigaction_install(Some(true))
        }
        ChainMode::Provided(handler) => {
            store_prior_handler(handler);
            CHAIN_ENABLED.store(true, Ordering::SeqCst);
            sigaction_install(Some(false))
        }
    }
}

/// Installs `sigchld_handler` for `SIGCHLD`.
///
/// `capture` controls what happens to whatever was installed before:
/// `None` discards it, `Some(true)` stores the actually-previously-
/// installed handler (the "capturing" variant), `Some(false)` keeps
/// whatever the caller already stored via [`store_prior_handler`].
fn sigaction_install(capture: Option<bool>) -> Result<(), Error> {
    let mut new_action: libc::sigaction = unsafe { std::mem::zeroed() };
    new_action.sa_sigaction = sigchld_handler as usize;
    new_action.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
    unsafe {
        libc::sigemptyset(&mut new_action.sa_mask);
    }

    let mut old_action: libc::sigaction = unsafe { std::mem::zeroed() };
    check_int(
        unsafe { libc::sigaction(libc::SIGCHLD, &new_action, &mut old_action) },
        Syscall::Sigaction,
    )?;

    if capture == Some(true) {
        unsafe {
            (*PRIOR_HANDLER.0.get()).as_mut_ptr().write(old_action);
        }
    }
    Ok(())
}

fn store_prior_handler(handler: PriorHandler) {
    let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
    match handler {
        PriorHandler::Plain(f) => {
            action.sa_sigaction = f as usize;
            action.sa_flags = 0;
        }
        PriorHandler::SigInfo(f) => {
            action.sa_sigaction = f as usize;
            action.sa_flags = libc::SA_SIGINFO;
        }
    }
    unsafe {
        libc::sigemptyset(&mut action.sa_mask);
        (*PRIOR_HANDLER.0.get()).as_mut_ptr().write(action);
    }
}

fn restore_prior_handler() -> Result<(), Error> {
    let restore_to = if CHAIN_ENABLED.load(Ordering::SeqCst) {
        unsafe { (*PRIOR_HANDLER.0.get()).assume_init() }
    } else {
        let mut dfl: libc::sigaction = unsafe { std::mem::zeroed() };
        dfl.sa_sigaction = libc::SIG_DFL;
        dfl
    };
    check_int(
        unsafe { libc::sigaction(libc::SIGCHLD, &restore_to, std::ptr::null_mut()) },
        Syscall::Sigaction,
    )?;
    CHAIN_ENABLED.store(false, Ordering::SeqCst);
    Ok(())
}

/// The installed `SIGCHLD` handler. Async-signal-safe: only `waitpid`,
/// `write`, atomic loads, and (when chaining) a tail-call into another
/// signal handler are performed. `errno` is saved and restored around the
/// body per async-signal-safety rules.
extern "C" fn sigchld_handler(
    signum: libc::c_int,
    info: *mut libc::siginfo_t,
    ctx: *mut libc::c_void,
) {
    let saved_errno = errno::errno();

    loop {
        let mut status: libc::c_int = 0;
        let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
        if pid <= 0 {
            break;
        }

        let terminated = unsafe { libc::WIFEXITED(status) || libc::WIFSIGNALED(status) };
        if !terminated {
            continue;
        }

        if pid == CURRENT_PID.load(Ordering::SeqCst) {
            notify_exit();
        } else if CHAIN_ENABLED.load(Ordering::SeqCst) {
            unsafe { dispatch_to_prior(signum, info, ctx) };
        }
    }

    errno::set_errno(saved_errno);
}

/// Writes one byte into the notify-pipe's write end, retrying on `EINTR`.
fn notify_exit() {
    let fd = NOTIFY_WRITE_FD.load(Ordering::SeqCst);
    if fd < 0 {
        return;
    }
    let byte: u8 = 1;
    loop {
        let ret = unsafe { libc::write(fd, &byte as *const u8 as *const libc::c_void, 1) };
        if ret == -1 && errno::errno().0 == libc::EINTR {
            continue;
        }
        break;
    }
}

/// Tail-dispatches a SIGCHLD delivery for a pid we don't own to whatever
/// handler was installed before ours.
unsafe fn dispatch_to_prior(signum: libc::c_int, info: *mut libc::siginfo_t, ctx: *mut libc::c_void) {
    let prior = (*PRIOR_HANDLER.0.get()).assume_init_ref();
    if prior.sa_sigaction == libc::SIG_DFL || prior.sa_sigaction == libc::SIG_IGN {
        return;
    }
    if prior.sa_flags & libc::SA_SIGINFO != 0 {
        let f: extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void) =
            std::mem::transmute(prior.sa_sigaction);
        f(signum, info, ctx);
    } else {
        let f: extern "C" fn(libc::c_int) = std::mem::transmute(prior.sa_sigaction);
        f(signum);
    }
}

/// The trivial handler installed by [`install_default_terminate`]: calls
/// [`terminate_current`], preserving `errno` across the call.
extern "C" fn default_terminate_handler(_signum: libc::c_int) {
    let saved_errno = errno::errno();
    let _ = terminate_current();
    errno::set_errno(saved_errno);
}

fn install_default_terminate() -> Result<(), Error> {
    for sig in [libc::SIGTERM, libc::SIGINT] {
        let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
        action.sa_sigaction = default_terminate_handler as usize;
        action.sa_flags = 0;
        unsafe {
            libc::sigemptyset(&mut action.sa_mask);
        }
        check_int(
            unsafe { libc::sigaction(sig, &action, std::ptr::null_mut()) },
            Syscall::Sigaction,
        )?;
    }
    Ok(())
}

fn reset_default_terminate() -> Result<(), Error> {
    for sig in [libc::SIGTERM, libc::SIGINT] {
        let mut action: libc::sigaction = unsafe { std::mem::zeroed() };
        action.sa_sigaction = libc::SIG_DFL;
        unsafe {
            libc::sigemptyset(&mut action.sa_mask);
        }
        check_int(
            unsafe { libc::sigaction(sig, &action, std::ptr::null_mut()) },
            Syscall::Sigaction,
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Session state lives in process-wide statics, so tests that touch it
    // must not run concurrently with each other (cargo test's default is
    // parallel threads within one process).
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn init_and_close_roundtrip() {
        let _guard = TEST_LOCK.lock().unwrap();
        let session = Session::init().unwrap();
        session.close().unwrap();
    }

    #[test]
    fn begin_invocation_rejects_second_caller() {
        let _guard = TEST_LOCK.lock().unwrap();
        let session = Session::init().unwrap();
        session.begin_invocation(1234).unwrap();
        let err = session.begin_invocation(5678).unwrap_err();
        assert_eq!(err, Error::Busy);
        session.end_invocation();
        session.begin_invocation(5678).unwrap();
        session.end_invocation();
        session.close().unwrap();
    }
}
