//! Module handles and the values read through them.

use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use serde::Serialize;

use crate::error::{Error, Result};
use crate::libkmod::Libkmod;
use crate::list::ModuleList;
use crate::subsystem::{Subsystem, TransientList};

/// One entry of a module's `__versions` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Version {
    symbol: String,
    crc: u64,
}

impl Version {
    pub fn new(symbol: impl Into<String>, crc: u64) -> Self {
        Self {
            symbol: symbol.into(),
            crc,
        }
    }

    /// Exported symbol name.
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Checksum used for version consistency.
    pub fn crc(&self) -> u64 {
        self.crc
    }
}

/// Where a module is in its in-kernel lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InitState {
    Builtin,
    Live,
    Coming,
    Going,
}

impl InitState {
    fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(InitState::Builtin),
            1 => Some(InitState::Live),
            2 => Some(InitState::Coming),
            3 => Some(InitState::Going),
            _ => None,
        }
    }
}

impl fmt::Display for InitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InitState::Builtin => "builtin",
            InitState::Live => "live",
            InitState::Coming => "coming",
            InitState::Going => "going",
        };
        f.write_str(s)
    }
}

/// Informational key/value pairs of a module (`author`, `license`, `alias`, ...).
///
/// Every pair is kept in the order the subsystem produced it. Keys such as
/// `alias`, `depends` or `parm` commonly appear more than once; [`get`]
/// returns the last value for a key, [`get_all`] returns all of them.
///
/// [`get`]: ModuleInfo::get
/// [`get_all`]: ModuleInfo::get_all
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ModuleInfo {
    entries: Vec<(String, String)>,
}

impl ModuleInfo {
    /// Last value recorded for `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Every value recorded for `key`, in order.
    pub fn get_all<'a>(&'a self, key: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter(move |(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Distinct keys in first-seen order.
    pub fn keys(&self) -> Vec<&str> {
        let mut keys: Vec<&str> = Vec::new();
        for (k, _) in &self.entries {
            if !keys.contains(&k.as_str()) {
                keys.push(k);
            }
        }
        keys
    }

    /// All pairs, in order, duplicates included.
    pub fn entries(&self) -> &[(String, String)] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Collapse to a map, keeping the last value per key.
    pub fn to_map(&self) -> BTreeMap<String, String> {
        self.entries.iter().cloned().collect()
    }
}

impl FromIterator<(String, String)> for ModuleInfo {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// An owning handle on one native module object.
///
/// Each handle holds exactly one reference on the native object: taken when
/// the handle is built (or handed over by the call that produced it) and
/// dropped exactly once, by [`release`](ModuleHandle::release) or on drop.
/// Cloning takes a fresh reference, so every clone is independent.
///
/// A handle does not borrow the [`Context`](crate::Context) it came from
/// and stays usable after the context is gone.
pub struct ModuleHandle<S: Subsystem = Libkmod> {
    backend: Rc<S>,
    raw: S::Module,
    released: bool,
}

impl<S: Subsystem> ModuleHandle<S> {
    /// Wrap an object whose reference was already granted to us.
    pub(crate) fn from_owned(backend: Rc<S>, raw: S::Module) -> Self {
        Self {
            backend,
            raw,
            released: false,
        }
    }

    /// Wrap a borrowed object, taking our own reference on it.
    pub(crate) fn from_borrowed(backend: Rc<S>, raw: S::Module) -> Self {
        backend.module_ref(raw);
        Self::from_owned(backend, raw)
    }

    pub(crate) fn raw(&self) -> S::Module {
        self.raw
    }

    /// Drop this handle's reference now instead of at end of scope.
    pub fn release(mut self) {
        self.unref_once();
    }

    fn unref_once(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.backend.module_unref(self.raw);
    }

    pub fn name(&self) -> String {
        self.backend.name(self.raw).unwrap_or_default()
    }

    /// Size of the module image in bytes.
    pub fn size(&self) -> u64 {
        self.backend.size(self.raw)
    }

    pub fn path(&self) -> String {
        self.backend.path(self.raw).unwrap_or_default()
    }

    pub fn options(&self) -> String {
        self.backend.options(self.raw).unwrap_or_default()
    }

    pub fn install_commands(&self) -> String {
        self.backend.install_commands(self.raw).unwrap_or_default()
    }

    pub fn remove_commands(&self) -> String {
        self.backend.remove_commands(self.raw).unwrap_or_default()
    }

    /// In-kernel usage count (not this handle's native reference count).
    pub fn refcnt(&self) -> i32 {
        self.backend.refcnt(self.raw)
    }

    pub fn init_state(&self) -> Result<InitState> {
        let raw = self
            .backend
            .initstate(self.raw)
            .map_err(|status| Error::introspection("get init state", &self.name(), status))?;
        InitState::from_raw(raw)
            .ok_or_else(|| Error::introspection("get init state", &self.name(), -libc::EINVAL))
    }

    /// Modules this one depends on, in `modules.dep` order.
    pub fn dependencies(&self) -> ModuleList<S> {
        ModuleList::new(Rc::clone(&self.backend), self.backend.dependencies(self.raw))
    }

    /// Loaded modules currently using this one.
    pub fn holders(&self) -> ModuleList<S> {
        ModuleList::new(Rc::clone(&self.backend), self.backend.holders(self.raw))
    }

    /// Informational fields from the module's `.modinfo` section.
    pub fn info(&self) -> Result<ModuleInfo> {
        let backend = &*self.backend;
        let head = backend
            .get_info(self.raw)
            .map_err(|status| Error::introspection("get info", &self.name(), status))?;
        let list = TransientList::new(backend, head, S::free_info_list);
        let info = list
            .entries()
            .map(|entry| {
                (
                    backend.info_key(entry).unwrap_or_default(),
                    backend.info_value(entry).unwrap_or_default(),
                )
            })
            .collect();
        Ok(info)
    }

    /// Symbol versions from the module's `__versions` section.
    pub fn versions(&self) -> Result<Vec<Version>> {
        let backend = &*self.backend;
        let head = backend
            .get_versions(self.raw)
            .map_err(|status| Error::introspection("get versions", &self.name(), status))?;
        let list = TransientList::new(backend, head, S::free_versions_list);
        let versions = list
            .entries()
            .map(|entry| {
                Version::new(
                    backend.version_symbol(entry).unwrap_or_default(),
                    backend.version_crc(entry),
                )
            })
            .collect();
        Ok(versions)
    }
}

impl<S: Subsystem> Clone for ModuleHandle<S> {
    fn clone(&self) -> Self {
        Self::from_borrowed(Rc::clone(&self.backend), self.raw)
    }
}

impl<S: Subsystem> Drop for ModuleHandle<S> {
    fn drop(&mut self) {
        self.unref_once();
    }
}

impl<S: Subsystem> fmt::Debug for ModuleHandle<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleHandle")
            .field("name", &self.name())
            .finish_non_exhaustive()
    }
}
