//! Instrumented in-memory module subsystem.
//!
//! Behaves like libkmod where ownership is concerned: module lists hold one
//! reference per element and drop them when the list is freed, lookups by
//! name hand back an already-referenced module. Every ref/unref/free is
//! counted, and any double release or use of a freed list panics.

use std::cell::RefCell;
use std::collections::HashMap;
use std::ffi::CStr;
use std::rc::Rc;

use kmod_handles::Config;
use kmod_handles::subsystem::{Status, Subsystem};

pub type ModuleId = usize;

/// One module as the fake subsystem knows it.
#[derive(Debug, Clone, Default)]
pub struct FakeModule {
    pub name: String,
    pub size: u64,
    pub path: Option<String>,
    pub options: Option<String>,
    pub install_commands: Option<String>,
    pub remove_commands: Option<String>,
    pub usage: i32,
    pub initstate: i32,
    pub info: Vec<(String, String)>,
    pub info_error: Option<Status>,
    pub versions: Vec<(String, u64)>,
    pub versions_error: Option<Status>,
    pub insert_error: Option<Status>,
    pub remove_error: Option<Status>,
    pub dependencies: Vec<ModuleId>,
    pub holders: Vec<ModuleId>,
}

impl FakeModule {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_owned(),
            initstate: 1,
            ..Default::default()
        }
    }

    pub fn size(mut self, size: u64) -> Self {
        self.size = size;
        self
    }

    pub fn path(mut self, path: &str) -> Self {
        self.path = Some(path.to_owned());
        self
    }

    pub fn usage(mut self, usage: i32) -> Self {
        self.usage = usage;
        self
    }

    pub fn initstate(mut self, state: i32) -> Self {
        self.initstate = state;
        self
    }

    pub fn info(mut self, pairs: &[(&str, &str)]) -> Self {
        self.info = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        self
    }

    pub fn info_error(mut self, status: Status) -> Self {
        self.info_error = Some(status);
        self
    }

    pub fn versions(mut self, entries: &[(&str, u64)]) -> Self {
        self.versions = entries.iter().map(|(s, c)| (s.to_string(), *c)).collect();
        self
    }

    pub fn versions_error(mut self, status: Status) -> Self {
        self.versions_error = Some(status);
        self
    }

    pub fn insert_error(mut self, status: Status) -> Self {
        self.insert_error = Some(status);
        self
    }

    pub fn remove_error(mut self, status: Status) -> Self {
        self.remove_error = Some(status);
        self
    }

    pub fn dependencies(mut self, deps: &[ModuleId]) -> Self {
        self.dependencies = deps.to_vec();
        self
    }

    pub fn holders(mut self, holders: &[ModuleId]) -> Self {
        self.holders = holders.to_vec();
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ListKind {
    Modules,
    Info,
    Versions,
}

#[derive(Debug)]
enum Payload {
    Module(ModuleId),
    Info(String, String),
    Version(String, u64),
}

#[derive(Debug)]
struct FakeList {
    kind: ListKind,
    entries: Vec<Payload>,
    freed: bool,
}

/// A position in one fake list chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
    list: usize,
    index: usize,
}

#[derive(Debug, Default)]
struct Counters {
    refs: i64,
    ref_calls: usize,
    unref_calls: usize,
}

#[derive(Debug, Default)]
struct State {
    modules: Vec<FakeModule>,
    counters: Vec<Counters>,
    loaded: Vec<ModuleId>,
    aliases: HashMap<String, Vec<ModuleId>>,
    lists: Vec<FakeList>,

    open_error: Option<Status>,
    load_error: Option<Status>,
    list_error: Option<Status>,
    lookup_error: Option<Status>,
    module_dir: Option<String>,

    opened: usize,
    closed: usize,
    unloaded: usize,
    live_ctx: bool,

    mutations: Vec<(String, String)>,
}

impl State {
    fn new_module_list(&mut self, ids: &[ModuleId]) -> Option<Entry> {
        if ids.is_empty() {
            return None;
        }
        for &id in ids {
            self.counters[id].refs += 1;
        }
        Some(self.push_list(ListKind::Modules, ids.iter().map(|&id| Payload::Module(id)).collect()))
    }

    fn push_list(&mut self, kind: ListKind, entries: Vec<Payload>) -> Entry {
        self.lists.push(FakeList {
            kind,
            entries,
            freed: false,
        });
        Entry {
            list: self.lists.len() - 1,
            index: 0,
        }
    }

    fn live_list(&self, entry: Entry) -> &FakeList {
        let list = &self.lists[entry.list];
        assert!(!list.freed, "use of freed list {}", entry.list);
        list
    }

    fn free(&mut self, head: Entry, kind: ListKind) {
        assert_eq!(head.index, 0, "list freed through a non-head entry");
        let list = &mut self.lists[head.list];
        assert!(!list.freed, "list {} freed twice", head.list);
        assert_eq!(list.kind, kind, "list freed with the wrong call");
        list.freed = true;
        let held: Vec<ModuleId> = list
            .entries
            .iter()
            .filter_map(|p| match p {
                Payload::Module(id) => Some(*id),
                _ => None,
            })
            .collect();
        for id in held {
            self.release(id);
        }
    }

    fn release(&mut self, id: ModuleId) {
        let counters = &mut self.counters[id];
        assert!(
            counters.refs > 0,
            "module {} released with no reference left",
            self.modules[id].name
        );
        counters.refs -= 1;
    }

    fn module(&self, id: ModuleId) -> &FakeModule {
        assert!(self.counters[id].refs > 0, "use of unreferenced module {}", self.modules[id].name);
        &self.modules[id]
    }
}

/// Handle on the shared fake state. Clones observe the same subsystem.
#[derive(Debug, Clone, Default)]
pub struct FakeSubsystem {
    state: Rc<RefCell<State>>,
}

impl FakeSubsystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_module(&self, module: FakeModule) -> ModuleId {
        let mut state = self.state.borrow_mut();
        state.modules.push(module);
        state.counters.push(Counters::default());
        state.modules.len() - 1
    }

    /// Add a module and mark it loaded.
    pub fn add_loaded(&self, module: FakeModule) -> ModuleId {
        let id = self.add_module(module);
        self.state.borrow_mut().loaded.push(id);
        id
    }

    pub fn alias(&self, alias: &str, ids: &[ModuleId]) {
        self.state
            .borrow_mut()
            .aliases
            .insert(alias.to_owned(), ids.to_vec());
    }

    pub fn fail_open(&self, status: Status) {
        self.state.borrow_mut().open_error = Some(status);
    }

    pub fn fail_load(&self, status: Status) {
        self.state.borrow_mut().load_error = Some(status);
    }

    pub fn fail_list(&self, status: Status) {
        self.state.borrow_mut().list_error = Some(status);
    }

    pub fn fail_lookup(&self, status: Status) {
        self.state.borrow_mut().lookup_error = Some(status);
    }

    pub fn set_module_dir(&self, dir: &str) {
        self.state.borrow_mut().module_dir = Some(dir.to_owned());
    }

    /// Current native reference count of a module.
    pub fn refs(&self, id: ModuleId) -> i64 {
        self.state.borrow().counters[id].refs
    }

    pub fn ref_calls(&self, id: ModuleId) -> usize {
        self.state.borrow().counters[id].ref_calls
    }

    pub fn unref_calls(&self, id: ModuleId) -> usize {
        self.state.borrow().counters[id].unref_calls
    }

    /// Lists handed out and not freed yet.
    pub fn live_lists(&self) -> usize {
        self.state.borrow().lists.iter().filter(|l| !l.freed).count()
    }

    pub fn lists_created(&self) -> usize {
        self.state.borrow().lists.len()
    }

    /// `(operation, module)` for every insert/remove attempted, in order.
    pub fn mutations(&self) -> Vec<(String, String)> {
        self.state.borrow().mutations.clone()
    }

    pub fn opened(&self) -> usize {
        self.state.borrow().opened
    }

    pub fn closed(&self) -> usize {
        self.state.borrow().closed
    }

    pub fn unloaded(&self) -> usize {
        self.state.borrow().unloaded
    }

    /// Nothing referenced, no list alive, no connection open.
    pub fn assert_quiescent(&self) {
        let state = self.state.borrow();
        for (id, c) in state.counters.iter().enumerate() {
            assert_eq!(c.refs, 0, "module {} still referenced", state.modules[id].name);
        }
        assert!(state.lists.iter().all(|l| l.freed), "a list was leaked");
        assert!(!state.live_ctx, "context connection was leaked");
    }
}

fn module_payload(list: &FakeList, index: usize) -> ModuleId {
    match list.entries[index] {
        Payload::Module(id) => id,
        _ => panic!("not a module list"),
    }
}

impl Subsystem for FakeSubsystem {
    type Ctx = usize;
    type Module = ModuleId;
    type List = Entry;

    fn open(&self, _config: &Config) -> Result<usize, Status> {
        let mut state = self.state.borrow_mut();
        if let Some(status) = state.open_error {
            return Err(status);
        }
        assert!(!state.live_ctx, "fake supports one connection at a time");
        state.opened += 1;
        state.live_ctx = true;
        Ok(state.opened)
    }

    fn load_resources(&self, _ctx: usize) -> Result<(), Status> {
        match self.state.borrow().load_error {
            Some(status) => Err(status),
            None => Ok(()),
        }
    }

    fn unload_resources(&self, _ctx: usize) {
        self.state.borrow_mut().unloaded += 1;
    }

    fn close(&self, _ctx: usize) {
        let mut state = self.state.borrow_mut();
        assert!(state.live_ctx, "connection closed twice");
        state.live_ctx = false;
        state.closed += 1;
    }

    fn module_dir(&self, _ctx: usize) -> Option<String> {
        self.state.borrow().module_dir.clone()
    }

    fn new_from_loaded(&self, _ctx: usize) -> Result<Option<Entry>, Status> {
        let mut state = self.state.borrow_mut();
        if let Some(status) = state.list_error {
            return Err(status);
        }
        let loaded = state.loaded.clone();
        Ok(state.new_module_list(&loaded))
    }

    fn new_from_lookup(&self, _ctx: usize, alias: &CStr) -> Result<Option<Entry>, Status> {
        let mut state = self.state.borrow_mut();
        if let Some(status) = state.lookup_error {
            return Err(status);
        }
        let alias = alias.to_str().expect("test aliases are UTF-8");
        let ids = state.aliases.get(alias).cloned().unwrap_or_default();
        Ok(state.new_module_list(&ids))
    }

    fn new_from_name(&self, _ctx: usize, name: &CStr) -> Result<ModuleId, Status> {
        let mut state = self.state.borrow_mut();
        let name = name.to_str().expect("test names are UTF-8");
        let id = state
            .modules
            .iter()
            .position(|m| m.name == name)
            .ok_or(-libc::ENOENT)?;
        state.counters[id].refs += 1;
        Ok(id)
    }

    fn module_ref(&self, module: ModuleId) {
        let mut state = self.state.borrow_mut();
        assert!(state.counters[module].refs > 0, "ref on a dead module");
        state.counters[module].refs += 1;
        state.counters[module].ref_calls += 1;
    }

    fn module_unref(&self, module: ModuleId) {
        let mut state = self.state.borrow_mut();
        state.release(module);
        state.counters[module].unref_calls += 1;
    }

    fn unref_list(&self, list: Entry) {
        self.state.borrow_mut().free(list, ListKind::Modules);
    }

    fn list_next(&self, head: Entry, current: Entry) -> Option<Entry> {
        let state = self.state.borrow();
        assert_eq!(head.list, current.list, "entry from another list");
        let list = state.live_list(current);
        let next = current.index + 1;
        (next < list.entries.len()).then_some(Entry {
            list: current.list,
            index: next,
        })
    }

    fn list_module(&self, entry: Entry) -> ModuleId {
        let state = self.state.borrow();
        module_payload(state.live_list(entry), entry.index)
    }

    fn name(&self, module: ModuleId) -> Option<String> {
        Some(self.state.borrow().module(module).name.clone())
    }

    fn path(&self, module: ModuleId) -> Option<String> {
        self.state.borrow().module(module).path.clone()
    }

    fn options(&self, module: ModuleId) -> Option<String> {
        self.state.borrow().module(module).options.clone()
    }

    fn install_commands(&self, module: ModuleId) -> Option<String> {
        self.state.borrow().module(module).install_commands.clone()
    }

    fn remove_commands(&self, module: ModuleId) -> Option<String> {
        self.state.borrow().module(module).remove_commands.clone()
    }

    fn size(&self, module: ModuleId) -> u64 {
        self.state.borrow().module(module).size
    }

    fn refcnt(&self, module: ModuleId) -> i32 {
        self.state.borrow().module(module).usage
    }

    fn initstate(&self, module: ModuleId) -> Result<i32, Status> {
        let state = self.state.borrow();
        let m = state.module(module);
        if m.initstate < 0 { Err(m.initstate) } else { Ok(m.initstate) }
    }

    fn dependencies(&self, module: ModuleId) -> Option<Entry> {
        let mut state = self.state.borrow_mut();
        let deps = state.module(module).dependencies.clone();
        state.new_module_list(&deps)
    }

    fn holders(&self, module: ModuleId) -> Option<Entry> {
        let mut state = self.state.borrow_mut();
        let holders = state.module(module).holders.clone();
        state.new_module_list(&holders)
    }

    fn get_info(&self, module: ModuleId) -> Result<Option<Entry>, Status> {
        let mut state = self.state.borrow_mut();
        let m = state.module(module);
        if let Some(status) = m.info_error {
            return Err(status);
        }
        let entries: Vec<Payload> = m
            .info
            .iter()
            .map(|(k, v)| Payload::Info(k.clone(), v.clone()))
            .collect();
        if entries.is_empty() {
            return Ok(None);
        }
        Ok(Some(state.push_list(ListKind::Info, entries)))
    }

    fn info_key(&self, entry: Entry) -> Option<String> {
        let state = self.state.borrow();
        match &state.live_list(entry).entries[entry.index] {
            Payload::Info(k, _) => Some(k.clone()),
            _ => panic!("not an info list"),
        }
    }

    fn info_value(&self, entry: Entry) -> Option<String> {
        let state = self.state.borrow();
        match &state.live_list(entry).entries[entry.index] {
            Payload::Info(_, v) => Some(v.clone()),
            _ => panic!("not an info list"),
        }
    }

    fn free_info_list(&self, list: Entry) {
        self.state.borrow_mut().free(list, ListKind::Info);
    }

    fn get_versions(&self, module: ModuleId) -> Result<Option<Entry>, Status> {
        let mut state = self.state.borrow_mut();
        let m = state.module(module);
        if let Some(status) = m.versions_error {
            return Err(status);
        }
        let entries: Vec<Payload> = m
            .versions
            .iter()
            .map(|(s, c)| Payload::Version(s.clone(), *c))
            .collect();
        if entries.is_empty() {
            return Ok(None);
        }
        Ok(Some(state.push_list(ListKind::Versions, entries)))
    }

    fn version_symbol(&self, entry: Entry) -> Option<String> {
        let state = self.state.borrow();
        match &state.live_list(entry).entries[entry.index] {
            Payload::Version(s, _) => Some(s.clone()),
            _ => panic!("not a versions list"),
        }
    }

    fn version_crc(&self, entry: Entry) -> u64 {
        let state = self.state.borrow();
        match &state.live_list(entry).entries[entry.index] {
            Payload::Version(_, crc) => *crc,
            _ => panic!("not a versions list"),
        }
    }

    fn free_versions_list(&self, list: Entry) {
        self.state.borrow_mut().free(list, ListKind::Versions);
    }

    fn probe_insert(&self, module: ModuleId) -> Result<(), Status> {
        let mut state = self.state.borrow_mut();
        let m = state.module(module);
        let (name, error) = (m.name.clone(), m.insert_error);
        state.mutations.push(("insert".to_owned(), name));
        error.map_or(Ok(()), Err)
    }

    fn remove(&self, module: ModuleId) -> Result<(), Status> {
        let mut state = self.state.borrow_mut();
        let m = state.module(module);
        let (name, error) = (m.name.clone(), m.remove_error);
        state.mutations.push(("remove".to_owned(), name));
        error.map_or(Ok(()), Err)
    }
}
