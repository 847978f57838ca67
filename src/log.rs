//! Diagnostic logging
//!
//! Library diagnostics go to stderr with a `[kmod:<level>]` prefix. Debug
//! lines (handle lifecycle, native calls) are only shown in verbose mode,
//! which is switched on by [`set_verbose`] or by `KMOD_DEBUG=1` in the
//! environment.

use std::fmt;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};

static VERBOSE: AtomicBool = AtomicBool::new(false);
static ENV_VERBOSE: OnceLock<bool> = OnceLock::new();

/// Log a debug message (only shown in verbose mode)
#[macro_export]
macro_rules! kmod_debug {
    ($($arg:tt)*) => {
        $crate::log::debug(::std::format_args!($($arg)*))
    };
}

/// Log a warning message
#[macro_export]
macro_rules! kmod_warn {
    ($($arg:tt)*) => {
        $crate::log::warn(::std::format_args!($($arg)*))
    };
}

/// Turn debug output on or off for the whole process.
pub fn set_verbose(on: bool) {
    VERBOSE.store(on, Ordering::Relaxed);
}

/// Whether debug output is currently shown.
pub fn verbose() -> bool {
    VERBOSE.load(Ordering::Relaxed) || *ENV_VERBOSE.get_or_init(env_verbose)
}

fn env_verbose() -> bool {
    std::env::var("KMOD_DEBUG")
        .map(|v| matches!(v.trim(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

#[doc(hidden)]
pub fn debug(args: fmt::Arguments<'_>) {
    if verbose() {
        eprintln!("[kmod:debug] {}", args);
    }
}

#[doc(hidden)]
pub fn warn(args: fmt::Arguments<'_>) {
    eprintln!("[kmod:warn] {}", args);
}
