//! Contains all errors that can happen in this library.

use derive_more::Display;
use std::io;

/// Combines all errors that can happen inside this library.
///
/// Every variant that originates from a failed libc call carries the
/// `errno` that produced it, so callers that need platform-standard
/// diagnostics don't lose information to this crate's typed wrapper.
#[derive(Debug, Display, Copy, Clone, PartialEq, Eq)]
pub enum Error {
    #[display(fmt = "pipe() failed with error code {}", errno)]
    PipeFailed { errno: i32 },
    #[display(fmt = "fork() failed with error code {}", errno)]
    ForkFailed { errno: i32 },
    #[display(fmt = "dup2() failed with error code {}", errno)]
    Dup2Failed { errno: i32 },
    #[display(fmt = "close() failed with error code {}", errno)]
    CloseFailed { errno: i32 },
    #[display(fmt = "fcntl() failed with error code {}", errno)]
    FcntlFailed { errno: i32 },
    #[display(fmt = "read() failed with error code {}", errno)]
    ReadFailed { errno: i32 },
    #[display(fmt = "write() failed with error code {}", errno)]
    WriteFailed { errno: i32 },
    #[display(fmt = "select() failed with error code {}", errno)]
    SelectFailed { errno: i32 },
    #[display(fmt = "waitpid() failed with error code {}", errno)]
    WaitpidFailed { errno: i32 },
    #[display(fmt = "sigaction() failed with error code {}", errno)]
    SigactionFailed { errno: i32 },
    #[display(fmt = "sigprocmask() failed with error code {}", errno)]
    SigprocmaskFailed { errno: i32 },
    #[display(fmt = "kill() failed with error code {}", errno)]
    KillFailed { errno: i32 },
    #[display(fmt = "execvp() failed with error code {}", errno)]
    ExecFailed { errno: i32 },
    #[display(fmt = "command timed out")]
    Timeout,
    #[display(fmt = "a command is already running on this session")]
    Busy,
    #[display(fmt = "argument contained a null byte")]
    NulByte,
}

impl Error {
    /// The `errno` behind this error, if it carries one.
    pub fn errno(&self) -> Option<i32> {
        match *self {
            Error::PipeFailed { errno }
            | Error::ForkFailed { errno }
            | Error::Dup2Failed { errno }
            | Error::CloseFailed { errno }
            | Error::FcntlFailed { errno }
            | Error::ReadFailed { errno }
            | Error::WriteFailed { errno }
            | Error::SelectFailed { errno }
            | Error::WaitpidFailed { errno }
            | Error::SigactionFailed { errno }
            | Error::SigprocmaskFailed { errno }
            | Error::KillFailed { errno }
            | Error::ExecFailed { errno } => Some(errno),
            Error::Timeout | Error::Busy | Error::NulByte => None,
        }
    }
}

impl std::error::Error for Error {}

impl From<Error> for io::Error {
    fn from(e: Error) -> Self {
        match e.errno() {
            Some(errno) => io::Error::from_raw_os_error(errno),
            None => io::Error::new(io::ErrorKind::Other, e.to_string()),
        }
    }
}

/// Syscall that produced a libc error, for translation into an [`Error`].
#[derive(Debug, Copy, Clone)]
pub enum Syscall {
    Pipe,
    Fork,
    Dup2,
    Close,
    Fcntl,
    Read,
    Write,
    Select,
    Waitpid,
    Sigaction,
    Sigprocmask,
    Kill,
    Execvp,
}

impl Syscall {
    pub(crate) fn into_error(self, errno: i32) -> Error {
        match self {
            Syscall::Pipe => Error::PipeFailed { errno },
            Syscall::Fork => Error::ForkFailed { errno },
            Syscall::Dup2 => Error::Dup2Failed { errno },
            Syscall::Close => Error::CloseFailed { errno },
            Syscall::Fcntl => Error::FcntlFailed { errno },
            Syscall::Read => Error::ReadFailed { errno },
            Syscall::Write => Error::WriteFailed { errno },
            Syscall::Select => Error::SelectFailed { errno },
            Syscall::Waitpid => Error::WaitpidFailed { errno },
            Syscall::Sigaction => Error::SigactionFailed { errno },
            Syscall::Sigprocmask => Error::SigprocmaskFailed { errno },
            Syscall::Kill => Error::KillFailed { errno },
            Syscall::Execvp => Error::ExecFailed { errno },
        }
    }
}
