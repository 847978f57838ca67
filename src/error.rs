//! Error types and native status translation.
//!
//! Every fallible call into the module subsystem reports a negative status
//! whose magnitude is an OS errno. [`Error::from_status`] turns that status
//! into a typed failure carrying the operation, the module or alias it was
//! about, and the `strerror` message. The errno itself stays reachable via
//! [`Error::errno`] and the `source()` chain (a [`std::io::Error`]).

use std::ffi::CStr;
use std::io;

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Which stage of the handle layer a native failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Opening the connection or loading its resources.
    Setup,
    /// Enumeration, alias lookup or name resolution.
    Lookup,
    /// Probe-insert or remove of one module.
    Mutation,
    /// Reading info, versions or init state of one module.
    Introspection,
}

/// Errors returned by the handle layer.
#[derive(Error, Debug)]
pub enum Error {
    /// A subsystem call reported a negative status.
    #[error("{}", render(.op, .target, .message))]
    Native {
        kind: FailureKind,
        op: &'static str,
        target: Option<String>,
        message: String,
        #[source]
        source: io::Error,
    },

    /// The module subsystem library could not be loaded.
    #[error("unable to load the module subsystem: {0}")]
    Library(String),

    /// The context was closed before this call.
    #[error("module context is closed")]
    Closed,

    /// A name passed to the subsystem contained an interior NUL byte.
    #[error("invalid module name {name:?}: contains a NUL byte")]
    InvalidName { name: String },
}

fn render(op: &str, target: &Option<String>, message: &str) -> String {
    match target {
        Some(target) => format!("{} {}: {}", op, target, message),
        None => format!("{}: {}", op, message),
    }
}

impl Error {
    /// Translate a native status into a failure.
    ///
    /// `status` is what the subsystem returned; only its magnitude is used,
    /// so callers may pass either `-errno` or `errno`.
    pub fn from_status(
        kind: FailureKind,
        op: &'static str,
        target: Option<&str>,
        status: i32,
    ) -> Self {
        let errno = status.unsigned_abs() as i32;
        Error::Native {
            kind,
            op,
            target: target.map(str::to_owned),
            message: strerror(errno),
            source: io::Error::from_raw_os_error(errno),
        }
    }

    pub(crate) fn setup(op: &'static str, status: i32) -> Self {
        Self::from_status(FailureKind::Setup, op, None, status)
    }

    pub(crate) fn lookup(op: &'static str, target: Option<&str>, status: i32) -> Self {
        Self::from_status(FailureKind::Lookup, op, target, status)
    }

    pub(crate) fn mutation(op: &'static str, target: &str, status: i32) -> Self {
        Self::from_status(FailureKind::Mutation, op, Some(target), status)
    }

    pub(crate) fn introspection(op: &'static str, target: &str, status: i32) -> Self {
        Self::from_status(FailureKind::Introspection, op, Some(target), status)
    }

    /// Stage the failure came from, for native failures.
    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            Error::Native { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Name of the operation that failed, for native failures.
    pub fn op(&self) -> Option<&'static str> {
        match self {
            Error::Native { op, .. } => Some(op),
            _ => None,
        }
    }

    /// Module or alias the failed operation was about.
    pub fn target(&self) -> Option<&str> {
        match self {
            Error::Native { target, .. } => target.as_deref(),
            Error::InvalidName { name } => Some(name),
            _ => None,
        }
    }

    /// Positive OS error number behind a native failure.
    pub fn errno(&self) -> Option<i32> {
        match self {
            Error::Native { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }
}

/// Platform message for an errno, as `strerror(3)` would print it.
pub fn strerror(errno: i32) -> String {
    let mut buf = [0 as libc::c_char; 256];
    // SAFETY: buf is writable for its full length; the XSI variant always
    // NUL-terminates on success.
    let rc = unsafe { libc::strerror_r(errno, buf.as_mut_ptr(), buf.len()) };
    if rc != 0 {
        return format!("Unknown error {}", errno);
    }
    // SAFETY: strerror_r succeeded, so buf holds a NUL-terminated string.
    unsafe { CStr::from_ptr(buf.as_ptr()) }
        .to_string_lossy()
        .into_owned()
}
