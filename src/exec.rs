//! Utility functions for building argv/envp and invoking `execvp`/`execve`.

use crate::error::Error;
use std::ffi::CString;

/// Builds the null-terminated `argv` the way `execvp` wants it: owning
/// `CString`s kept alive alongside the raw pointer array that references
/// them.
pub(crate) struct Argv {
    _owned: Vec<CString>,
    ptrs: Vec<*const libc::c_char>,
}

impl Argv {
    pub(crate) fn new(args: &[&str]) -> Result<Self, Error> {
        let owned = args
            .iter()
            .map(|s| CString::new(*s).map_err(|_| Error::NulByte))
            .collect::<Result<Vec<CString>, Error>>()?;
        let mut ptrs = owned.iter().map(|cs| cs.as_ptr()).collect::<Vec<_>>();
        ptrs.push(std::ptr::null());
        Ok(Argv { _owned: owned, ptrs })
    }

    pub(crate) fn as_ptr(&self) -> *const *const libc::c_char {
        self.ptrs.as_ptr()
    }
}

/// Builds the null-terminated `envp` array from `KEY=VALUE` pairs, the way
/// `execve` wants it.
pub(crate) struct Envp {
    _owned: Vec<CString>,
    ptrs: Vec<*const libc::c_char>,
}

impl Envp {
    pub(crate) fn new(vars: &[(&str, &str)]) -> Result<Self, Error> {
        let owned = vars
            .iter()
            .map(|(k, v)| CString::new(format!("{}={}", k, v)).map_err(|_| Error::NulByte))
            .collect::<Result<Vec<CString>, Error>>()?;
        let mut ptrs = owned.iter().map(|cs| cs.as_ptr()).collect::<Vec<_>>();
        ptrs.push(std::ptr::null());
        Ok(Envp { _owned: owned, ptrs })
    }

    pub(crate) fn as_ptr(&self) -> *const *const libc::c_char {
        self.ptrs.as_ptr()
    }
}

/// Invokes `execvp(file, argv)` (PATH-searching, inheriting the current
/// environment) or, when `envp` is supplied, `execve` after resolving
/// `file` against `$PATH` by hand (POSIX has no portable `execvpe`).
///
/// Only returns if `exec` failed; never returns on success because the
/// calling process image is replaced.
pub(crate) fn exec(file: &str, argv: &Argv, envp: Option<&Envp>) -> Error {
    let file_c = match CString::new(file) {
        Ok(c) => c,
        Err(_) => return Error::NulByte,
    };

    match envp {
        None => unsafe {
            libc::execvp(file_c.as_ptr(), argv.as_ptr());
        },
        Some(envp) => unsafe {
            if file.contains('/') {
                libc::execve(file_c.as_ptr(), argv.as_ptr(), envp.as_ptr());
            } else {
                exec_with_path_search(&file_c, argv, envp);
            }
        },
    }

    Error::ExecFailed { errno: errno::errno().0 }
}

/// Emulates the PATH-searching part of `execvpe`/`execvp` for the
/// `execve`-with-explicit-envp case, since POSIX doesn't define a portable
/// `execvpe`. Splits `$PATH` on `:`, tries `execve` on each
/// `prefix/file` in turn, and stops early on an error that indicates a
/// definitively unusable binary (`ENOEXEC`, `EACCES`) rather than simply
/// "not here" (`ENOENT`, `ENOTDIR`).
unsafe fn exec_with_path_search(file: &std::ffi::CStr, argv: &Argv, envp: &Envp) {
    let file_str = file.to_string_lossy();
    let path = std::env::var("PATH").unwrap_or_else(|_| "/bin:/usr/bin".to_string());

    for prefix in path.split(':') {
        let candidate = if prefix.is_empty() {
            file_str.to_string()
        } else {
            format!("{}/{}", prefix, file_str)
        };
        let candidate = match CString::new(candidate) {
            Ok(c) => c,
            Err(_) => continue,
        };
        libc::execve(candidate.as_ptr(), argv.as_ptr(), envp.as_ptr());
        let errno = errno::errno().0;
        if errno != libc::ENOENT && errno != libc::ENOTDIR {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argv_is_null_terminated() {
        let argv = Argv::new(&["echo", "hi"]).unwrap();
        let ptr = argv.as_ptr();
        unsafe {
            assert!(!(*ptr).is_null());
            assert!(!(*ptr.offset(1)).is_null());
            assert!((*ptr.offset(2)).is_null());
        }
    }

    #[test]
    fn envp_formats_key_value_pairs() {
        let envp = Envp::new(&[("A", "1"), ("B", "2")]).unwrap();
        let ptr = envp.as_ptr();
        unsafe {
            let a = std::ffi::CStr::from_ptr(*ptr).to_str().unwrap();
            assert_eq!(a, "A=1");
        }
    }

    #[test]
    fn nul_byte_in_arg_is_rejected() {
        let err = Argv::new(&["a\0b"]).unwrap_err();
        assert_eq!(err, Error::NulByte);
    }
}
