//! Owning handles over libkmod
//!
//! List loaded kernel modules, look them up by alias or name, read their
//! metadata, and insert or remove them together with their dependencies.
//! The actual work is done by libkmod; this crate manages the lifetime of
//! the native objects it hands out.
//!
//! # Example
//!
//! ```no_run
//! use kmod_handles::Context;
//!
//! let ctx = Context::open()?;
//!
//! for module in &ctx.list()? {
//!     println!("{} {}", module.name(), module.size());
//! }
//!
//! let pcspkr = ctx.module_from_name("pcspkr")?;
//! let info = pcspkr.info()?;
//! println!("license: {}", info.get("license").unwrap_or("?"));
//!
//! ctx.insert("rtl2832")?;
//! ctx.remove("rtl2832")?;
//! # Ok::<(), kmod_handles::Error>(())
//! ```
//!
//! # Ownership
//!
//! - [`Context`] owns the connection and releases it once, on
//!   [`Context::close`] or drop.
//! - [`ModuleHandle`] owns one reference on a native module. Cloning takes
//!   another; dropping gives one back.
//! - [`ModuleList`] owns the native list chain. Its handles carry their own
//!   references, so they survive the list and the context.
//!
//! None of these types are `Send`: libkmod connections must not be shared
//! between threads.
//!
//! # Other backends
//!
//! Everything is generic over [`Subsystem`], with [`Libkmod`] as the
//! default. [`Context::with_backend`] plugs in another implementation.

mod context;
mod error;
mod libkmod;
mod list;
mod module;

pub mod config;
pub mod log;
pub mod output;
pub mod subsystem;

pub use config::Config;
pub use context::Context;
pub use error::{Error, FailureKind, Result, strerror};
pub use libkmod::Libkmod;
pub use list::ModuleList;
pub use module::{InitState, ModuleHandle, ModuleInfo, Version};
pub use subsystem::Subsystem;
