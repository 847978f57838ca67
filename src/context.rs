//! The owning connection to the module subsystem.

use std::ffi::CString;
use std::path::PathBuf;
use std::rc::Rc;

use crate::config::Config;
use crate::error::{Error, Result};
use crate::libkmod::Libkmod;
use crate::list::ModuleList;
use crate::module::ModuleHandle;
use crate::subsystem::Subsystem;
use crate::kmod_debug;

/// A loaded connection to the module subsystem.
///
/// Created by [`Context::open`] with its resources already loaded; there is
/// no partially initialised context. Closing happens exactly once, either
/// through [`close`](Context::close) or when the context is dropped.
///
/// Handles and lists returned from a context hold their own references and
/// outlive it. A context (and everything it hands out) is confined to the
/// thread that created it; open one context per thread to work in parallel.
pub struct Context<S: Subsystem = Libkmod> {
    backend: Rc<S>,
    raw: Option<S::Ctx>,
    loaded: bool,
}

impl Context<Libkmod> {
    /// Open libkmod with its default module directory and configuration.
    pub fn open() -> Result<Self> {
        Self::with_config(&Config::default())
    }

    /// Open libkmod with an explicit module directory and/or config paths.
    pub fn with_config(config: &Config) -> Result<Self> {
        Self::with_backend(Libkmod::load()?, config)
    }
}

impl<S: Subsystem> Context<S> {
    /// Open a connection through `backend` and load its resources.
    pub fn with_backend(backend: S, config: &Config) -> Result<Self> {
        let raw = backend
            .open(config)
            .map_err(|status| Error::setup("create module context", status))?;
        if let Err(status) = backend.load_resources(raw) {
            backend.close(raw);
            return Err(Error::setup("load module context resources", status));
        }
        kmod_debug!("module context opened");

        Ok(Self {
            backend: Rc::new(backend),
            raw: Some(raw),
            loaded: true,
        })
    }

    /// Whether resources are loaded and the context can be queried.
    pub fn is_loaded(&self) -> bool {
        self.loaded && self.raw.is_some()
    }

    /// Unload resources and release the connection. Further calls are no-ops.
    pub fn close(&mut self) {
        let Some(raw) = self.raw.take() else {
            return;
        };
        if self.loaded {
            self.backend.unload_resources(raw);
            self.loaded = false;
        }
        self.backend.close(raw);
        kmod_debug!("module context closed");
    }

    fn raw(&self) -> Result<S::Ctx> {
        match self.raw {
            Some(raw) if self.loaded => Ok(raw),
            _ => Err(Error::Closed),
        }
    }

    /// Directory the subsystem searches for modules.
    pub fn module_dir(&self) -> Result<Option<PathBuf>> {
        let raw = self.raw()?;
        Ok(self.backend.module_dir(raw).map(PathBuf::from))
    }

    /// Every module currently loaded in the kernel.
    pub fn list(&self) -> Result<ModuleList<S>> {
        let raw = self.raw()?;
        let list = self
            .backend
            .new_from_loaded(raw)
            .map_err(|status| Error::lookup("list loaded modules", None, status))?;
        Ok(ModuleList::new(Rc::clone(&self.backend), list))
    }

    /// Every module matching `alias`. No match is an empty list, not an error.
    pub fn lookup(&self, alias: &str) -> Result<ModuleList<S>> {
        let raw = self.raw()?;
        let c_alias = c_name(alias)?;
        let list = self
            .backend
            .new_from_lookup(raw, &c_alias)
            .map_err(|status| Error::lookup("lookup", Some(alias), status))?;
        Ok(ModuleList::new(Rc::clone(&self.backend), list))
    }

    /// A single module by its exact name.
    pub fn module_from_name(&self, name: &str) -> Result<ModuleHandle<S>> {
        let raw = self.raw()?;
        let c_name = c_name(name)?;
        let module = self
            .backend
            .new_from_name(raw, &c_name)
            .map_err(|status| Error::lookup("get module", Some(name), status))?;
        Ok(ModuleHandle::from_owned(Rc::clone(&self.backend), module))
    }

    /// Insert every module matching `name`, with their dependencies.
    ///
    /// Returns how many modules were inserted; zero means nothing matched.
    /// Stops at the first module that fails; modules inserted before it
    /// stay inserted.
    pub fn insert(&self, name: &str) -> Result<usize> {
        let matches = self.lookup(name)?;
        for module in &matches {
            let module_name = module.name();
            kmod_debug!("inserting {}", module_name);
            self.backend
                .probe_insert(module.raw())
                .map_err(|status| Error::mutation("insert", &module_name, status))?;
        }
        Ok(matches.len())
    }

    /// Remove every module matching `name` from the kernel.
    ///
    /// Stops at the first module that cannot be removed (e.g. still in
    /// use); modules removed before it stay removed. Returns how many
    /// modules were removed.
    pub fn remove(&self, name: &str) -> Result<usize> {
        let matches = self.lookup(name)?;
        for module in &matches {
            let module_name = module.name();
            kmod_debug!("removing {}", module_name);
            self.backend
                .remove(module.raw())
                .map_err(|status| Error::mutation("remove", &module_name, status))?;
        }
        Ok(matches.len())
    }
}

impl<S: Subsystem> Drop for Context<S> {
    fn drop(&mut self) {
        self.close();
    }
}

impl<S: Subsystem> std::fmt::Debug for Context<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("loaded", &self.is_loaded())
            .finish_non_exhaustive()
    }
}

fn c_name(name: &str) -> Result<CString> {
    CString::new(name).map_err(|_| Error::InvalidName {
        name: name.to_owned(),
    })
}
