//! This module contains facilities that relate to the seccomp feature of
//! Linux systems. This module is based on the `seccomp_sys` crate which
//! further depends on the `libseccomp` native library.
//!
//! Use `apply_allowlist` to install a default-deny filter that kills the
//! calling process on any syscall outside the given allow-list.
//!

use std::error::Error;
use std::ffi::CString;
use std::fmt::{Display, Formatter};

use seccomp_sys::*;

/// The error type used in `seccomp` module.
#[derive(Clone, Debug)]
pub struct SeccompError {
    message: String,
}

impl SeccompError {
    /// Create a new `SeccompError` from the error number returned by the
    /// underlying `libseccomp` library.
    pub fn from_errno(errno: i32) -> Self {
        SeccompError { message: format!("libseccomp error: {}", errno) }
    }

    /// Create a new `SeccompError` carrying the given message.
    pub fn new<T>(message: T) -> Self
        where T: Into<String> {
        SeccompError { message: message.into() }
    }
}

impl Display for SeccompError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_fmt(format_args!("seccomp error: {}", self.message))
    }
}

impl Error for SeccompError {
    // Use default trait implementation here.
}

/// The result type used in `seccomp` module.
pub type Result<T> = std::result::Result<T, SeccompError>;

/// Resolve a syscall name into its number on the current architecture.
pub fn resolve_syscall(name: &str) -> Result<i32> {
    let native_name = CString::new(name)
        .map_err(|_| SeccompError::new(format!("invalid syscall name: {:?}", name)))?;
    let number = unsafe { seccomp_syscall_resolve_name(native_name.as_ptr()) };
    if number < 0 {
        Err(SeccompError::new(format!("unknown syscall: {}", name)))
    } else {
        Ok(number)
    }
}

/// Apply a default-deny filter to the calling process. After calling this
/// function, if the calling process calls any syscall not on the given list,
/// the kernel kills the process immediately as though by the delivery of a
/// `SIGSYS` signal.
pub fn apply_allowlist<'a, T>(allowed: T) -> Result<()>
    where T: IntoIterator<Item = &'a str> {
    let ctx = unsafe { seccomp_init(SCMP_ACT_KILL_PROCESS) };
    if ctx.is_null() {
        return Err(SeccompError::new("seccomp_init failed"));
    }

    let result = load_rules(ctx, allowed);
    unsafe { seccomp_release(ctx) };
    result
}

fn load_rules<'a, T>(ctx: *mut scmp_filter_ctx, allowed: T) -> Result<()>
    where T: IntoIterator<Item = &'a str> {
    for name in allowed {
        let syscall = resolve_syscall(name)?;
        let ret = unsafe {
            seccomp_rule_add_array(ctx, SCMP_ACT_ALLOW, syscall, 0, std::ptr::null())
        };
        if ret < 0 {
            return Err(SeccompError::from_errno(ret));
        }
    }

    let ret = unsafe { seccomp_load(ctx) };
    if ret < 0 {
        return Err(SeccompError::from_errno(ret));
    }

    Ok(())
}
