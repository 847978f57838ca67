//! The call surface of the module subsystem.
//!
//! [`Subsystem`] is everything the handle layer needs from the library that
//! actually knows how to find, parse, load and unload kernel modules. The
//! raw handle types are plain `Copy` tokens; ownership of what they point
//! at is tracked entirely by [`Context`](crate::Context),
//! [`ModuleHandle`](crate::ModuleHandle) and [`ModuleList`](crate::ModuleList).
//!
//! Fallible calls return the native status (`-errno`) as their error.
//! A list call that succeeds with nothing to report returns `Ok(None)`.
//!
//! Implementations are not required to be thread-safe; the handle layer
//! never calls into one connection from two threads.

use std::ffi::CStr;

use crate::config::Config;

/// Native status code: negative errno on failure.
pub type Status = i32;

/// The narrow interface to the module subsystem.
pub trait Subsystem {
    /// An open connection.
    type Ctx: Copy;
    /// One module object. Carries its own reference count.
    type Module: Copy;
    /// One entry of a native list chain. The head entry stands for the list.
    type List: Copy;

    // connection

    fn open(&self, config: &Config) -> Result<Self::Ctx, Status>;
    fn load_resources(&self, ctx: Self::Ctx) -> Result<(), Status>;
    fn unload_resources(&self, ctx: Self::Ctx);
    /// Drop the caller's reference to the connection.
    fn close(&self, ctx: Self::Ctx);
    fn module_dir(&self, ctx: Self::Ctx) -> Option<String>;

    // lookups

    /// Every loaded module, as a list holding one reference per entry.
    fn new_from_loaded(&self, ctx: Self::Ctx) -> Result<Option<Self::List>, Status>;
    /// Every module matching `alias`, as a list holding one reference per entry.
    fn new_from_lookup(&self, ctx: Self::Ctx, alias: &CStr) -> Result<Option<Self::List>, Status>;
    /// One module by exact name. The returned object is already referenced.
    fn new_from_name(&self, ctx: Self::Ctx, name: &CStr) -> Result<Self::Module, Status>;

    // reference counting

    fn module_ref(&self, module: Self::Module);
    fn module_unref(&self, module: Self::Module);
    /// Free a module list chain. Whatever references the list itself held
    /// go with it; references taken by callers on its elements do not.
    fn unref_list(&self, list: Self::List);

    // list walking

    /// Entry after `current` in the chain starting at `head`.
    fn list_next(&self, head: Self::List, current: Self::List) -> Option<Self::List>;
    /// Module stored in a module-list entry. Borrowed: no reference is taken.
    fn list_module(&self, entry: Self::List) -> Self::Module;

    // accessors

    fn name(&self, module: Self::Module) -> Option<String>;
    fn path(&self, module: Self::Module) -> Option<String>;
    fn options(&self, module: Self::Module) -> Option<String>;
    fn install_commands(&self, module: Self::Module) -> Option<String>;
    fn remove_commands(&self, module: Self::Module) -> Option<String>;
    fn size(&self, module: Self::Module) -> u64;
    fn refcnt(&self, module: Self::Module) -> i32;
    fn initstate(&self, module: Self::Module) -> Result<i32, Status>;
    fn dependencies(&self, module: Self::Module) -> Option<Self::List>;
    fn holders(&self, module: Self::Module) -> Option<Self::List>;

    // transient info/versions lists

    fn get_info(&self, module: Self::Module) -> Result<Option<Self::List>, Status>;
    fn info_key(&self, entry: Self::List) -> Option<String>;
    fn info_value(&self, entry: Self::List) -> Option<String>;
    fn free_info_list(&self, list: Self::List);

    fn get_versions(&self, module: Self::Module) -> Result<Option<Self::List>, Status>;
    fn version_symbol(&self, entry: Self::List) -> Option<String>;
    fn version_crc(&self, entry: Self::List) -> u64;
    fn free_versions_list(&self, list: Self::List);

    // mutation

    /// Insert the module and whatever it depends on. No extra options or flags.
    fn probe_insert(&self, module: Self::Module) -> Result<(), Status>;
    fn remove(&self, module: Self::Module) -> Result<(), Status>;
}

/// Walk a native list chain front to back.
pub(crate) fn entries<S: Subsystem>(
    backend: &S,
    head: Option<S::List>,
) -> impl Iterator<Item = S::List> + '_ {
    let mut current = head;
    std::iter::from_fn(move || {
        let entry = current?;
        current = head.and_then(|h| backend.list_next(h, entry));
        Some(entry)
    })
}

/// A transient native list freed on every exit path.
pub(crate) struct TransientList<'a, S: Subsystem> {
    backend: &'a S,
    head: Option<S::List>,
    free: fn(&S, S::List),
}

impl<'a, S: Subsystem> TransientList<'a, S> {
    pub(crate) fn new(backend: &'a S, head: Option<S::List>, free: fn(&S, S::List)) -> Self {
        Self {
            backend,
            head,
            free,
        }
    }

    pub(crate) fn entries(&self) -> impl Iterator<Item = S::List> + '_ {
        entries(self.backend, self.head)
    }
}

impl<S: Subsystem> Drop for TransientList<'_, S> {
    fn drop(&mut self) {
        if let Some(head) = self.head.take() {
            (self.free)(self.backend, head);
        }
    }
}
