//! Runs an external command as a child process, feeds it input on its
//! standard input, and captures what it writes to its standard output into
//! a buffer — subject to a wall-clock timeout, after which the child is
//! sent `SIGTERM`.
//!
//! The heart of the crate is [`Session`]: a process-wide handle that owns
//! the `SIGCHLD` bridge (a self-pipe woken by the signal handler) used to
//! drive a `select(2)`-based event loop without polling. Create one
//! `Session`, then call [`Session::run`] as many times as needed — only one
//! invocation may be in flight at a time.
//!
//! ```no_run
//! use comcom::Session;
//! use std::time::Duration;
//!
//! let session = Session::init().unwrap();
//! let output = session
//!     .run(b"hello\n", "cat", &["cat"], None, Some(Duration::from_secs(5)))
//!     .unwrap();
//! assert_eq!(output, b"hello\n");
//! ```

#[macro_use]
extern crate log;

mod child;
mod error;
mod exec;
mod libc_util;
mod pipe;
mod run;
mod session;

pub use error::Error;
pub use session::{PriorHandler, Session};
