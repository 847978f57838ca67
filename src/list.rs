//! Ordered collections of module handles.

use std::fmt;
use std::rc::Rc;

use crate::kmod_debug;
use crate::libkmod::Libkmod;
use crate::module::ModuleHandle;
use crate::subsystem::{Subsystem, entries};

/// The modules produced by one enumeration or lookup, in the order the
/// subsystem yielded them.
///
/// The list owns the native chain it was built from, and each
/// [`ModuleHandle`] in it owns a separate reference taken while walking
/// that chain. Dropping the list frees only the chain; handles that were
/// cloned or moved out keep working.
pub struct ModuleList<S: Subsystem = Libkmod> {
    backend: Rc<S>,
    raw: Option<S::List>,
    modules: Vec<ModuleHandle<S>>,
}

impl<S: Subsystem> ModuleList<S> {
    pub(crate) fn new(backend: Rc<S>, raw: Option<S::List>) -> Self {
        let modules: Vec<ModuleHandle<S>> = entries(&*backend, raw)
            .map(|entry| ModuleHandle::from_borrowed(Rc::clone(&backend), backend.list_module(entry)))
            .collect();
        kmod_debug!("module list built with {} entries", modules.len());
        Self {
            backend,
            raw,
            modules,
        }
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&ModuleHandle<S>> {
        self.modules.get(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ModuleHandle<S>> {
        self.modules.iter()
    }

    pub fn as_slice(&self) -> &[ModuleHandle<S>] {
        &self.modules
    }

    /// Take the handles out. The native chain is freed here.
    pub fn into_vec(mut self) -> Vec<ModuleHandle<S>> {
        std::mem::take(&mut self.modules)
    }
}

impl<S: Subsystem> Drop for ModuleList<S> {
    fn drop(&mut self) {
        if let Some(raw) = self.raw.take() {
            kmod_debug!("freeing module list chain");
            self.backend.unref_list(raw);
        }
    }
}

impl<'a, S: Subsystem> IntoIterator for &'a ModuleList<S> {
    type Item = &'a ModuleHandle<S>;
    type IntoIter = std::slice::Iter<'a, ModuleHandle<S>>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<S: Subsystem> IntoIterator for ModuleList<S> {
    type Item = ModuleHandle<S>;
    type IntoIter = std::vec::IntoIter<ModuleHandle<S>>;

    fn into_iter(self) -> Self::IntoIter {
        self.into_vec().into_iter()
    }
}

impl<S: Subsystem> fmt::Debug for ModuleList<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.modules.iter()).finish()
    }
}
