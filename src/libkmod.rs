//! libkmod backend
//!
//! `libkmod.so.2` is opened with `dlopen` the first time a context is
//! created and every entry point is resolved once into a function table
//! shared by the whole process. Nothing links against libkmod at build
//! time; a host without it fails at [`Context::open`](crate::Context::open).

use std::ffi::{CStr, CString, c_char, c_int, c_long, c_uint, c_void};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::ptr::{self, NonNull};
use std::sync::OnceLock;

use crate::config::Config;
use crate::error::{Error, Result, strerror};
use crate::{kmod_debug, kmod_warn};
use crate::subsystem::{Status, Subsystem};

/// Opaque `struct kmod_ctx`.
#[repr(C)]
pub struct KmodCtx {
    _private: [u8; 0],
}

/// Opaque `struct kmod_module`.
#[repr(C)]
pub struct KmodModule {
    _private: [u8; 0],
}

/// Opaque `struct kmod_list`.
#[repr(C)]
pub struct KmodList {
    _private: [u8; 0],
}

const LIBRARY_NAMES: [&CStr; 2] = [c"libkmod.so.2", c"libkmod.so"];

type RunInstall = Option<unsafe extern "C" fn(*mut KmodModule, *const c_char, *mut c_void) -> c_int>;
type PrintAction = Option<unsafe extern "C" fn(*mut KmodModule, bool, *const c_char)>;

/// Entry points resolved from the loaded library. It is never `dlclose`d.
struct Api {
    kmod_new: unsafe extern "C" fn(*const c_char, *const *const c_char) -> *mut KmodCtx,
    kmod_unref: unsafe extern "C" fn(*mut KmodCtx) -> *mut KmodCtx,
    kmod_load_resources: unsafe extern "C" fn(*mut KmodCtx) -> c_int,
    kmod_unload_resources: unsafe extern "C" fn(*mut KmodCtx),
    kmod_get_dirname: unsafe extern "C" fn(*const KmodCtx) -> *const c_char,
    kmod_list_next: unsafe extern "C" fn(*const KmodList, *const KmodList) -> *mut KmodList,
    kmod_module_new_from_loaded: unsafe extern "C" fn(*mut KmodCtx, *mut *mut KmodList) -> c_int,
    kmod_module_new_from_lookup:
        unsafe extern "C" fn(*mut KmodCtx, *const c_char, *mut *mut KmodList) -> c_int,
    kmod_module_new_from_name:
        unsafe extern "C" fn(*mut KmodCtx, *const c_char, *mut *mut KmodModule) -> c_int,
    kmod_module_ref: unsafe extern "C" fn(*mut KmodModule) -> *mut KmodModule,
    kmod_module_unref: unsafe extern "C" fn(*mut KmodModule) -> *mut KmodModule,
    kmod_module_unref_list: unsafe extern "C" fn(*mut KmodList) -> c_int,
    kmod_module_get_module: unsafe extern "C" fn(*const KmodList) -> *mut KmodModule,
    kmod_module_get_name: unsafe extern "C" fn(*const KmodModule) -> *const c_char,
    kmod_module_get_path: unsafe extern "C" fn(*const KmodModule) -> *const c_char,
    kmod_module_get_options: unsafe extern "C" fn(*const KmodModule) -> *const c_char,
    kmod_module_get_install_commands: unsafe extern "C" fn(*const KmodModule) -> *const c_char,
    kmod_module_get_remove_commands: unsafe extern "C" fn(*const KmodModule) -> *const c_char,
    kmod_module_get_size: unsafe extern "C" fn(*const KmodModule) -> c_long,
    kmod_module_get_refcnt: unsafe extern "C" fn(*const KmodModule) -> c_int,
    kmod_module_get_initstate: unsafe extern "C" fn(*const KmodModule) -> c_int,
    kmod_module_get_dependencies: unsafe extern "C" fn(*const KmodModule) -> *mut KmodList,
    kmod_module_get_holders: unsafe extern "C" fn(*const KmodModule) -> *mut KmodList,
    kmod_module_get_info: unsafe extern "C" fn(*const KmodModule, *mut *mut KmodList) -> c_int,
    kmod_module_info_get_key: unsafe extern "C" fn(*const KmodList) -> *const c_char,
    kmod_module_info_get_value: unsafe extern "C" fn(*const KmodList) -> *const c_char,
    kmod_module_info_free_list: unsafe extern "C" fn(*mut KmodList),
    kmod_module_get_versions: unsafe extern "C" fn(*const KmodModule, *mut *mut KmodList) -> c_int,
    kmod_module_version_get_symbol: unsafe extern "C" fn(*const KmodList) -> *const c_char,
    kmod_module_version_get_crc: unsafe extern "C" fn(*const KmodList) -> u64,
    kmod_module_versions_free_list: unsafe extern "C" fn(*mut KmodList),
    kmod_module_probe_insert_module: unsafe extern "C" fn(
        *mut KmodModule,
        c_uint,
        *const c_char,
        RunInstall,
        *const c_void,
        PrintAction,
    ) -> c_int,
    kmod_module_remove_module: unsafe extern "C" fn(*mut KmodModule, c_uint) -> c_int,
}

static API: OnceLock<std::result::Result<Api, String>> = OnceLock::new();

macro_rules! resolve {
    ($handle:expr, $name:ident) => {{
        let name = concat!(stringify!($name), "\0");
        // SAFETY: handle came from a successful dlopen; name is NUL-terminated.
        let sym = unsafe { libc::dlsym($handle, name.as_ptr().cast()) };
        if sym.is_null() {
            return Err(format!("missing symbol {}", stringify!($name)));
        }
        // SAFETY: the field type is the C prototype of this libkmod symbol.
        unsafe { std::mem::transmute::<*mut c_void, _>(sym) }
    }};
}

fn dlerror() -> String {
    // SAFETY: dlerror returns either null or a NUL-terminated string.
    let msg = unsafe { libc::dlerror() };
    if msg.is_null() {
        "unknown dlopen error".to_owned()
    } else {
        // SAFETY: checked non-null above.
        unsafe { CStr::from_ptr(msg) }.to_string_lossy().into_owned()
    }
}

fn open_library() -> std::result::Result<*mut c_void, String> {
    let mut last_error = String::new();
    for name in LIBRARY_NAMES {
        // SAFETY: name is a valid C string.
        let handle = unsafe { libc::dlopen(name.as_ptr(), libc::RTLD_NOW | libc::RTLD_LOCAL) };
        if !handle.is_null() {
            kmod_debug!("loaded {}", name.to_string_lossy());
            return Ok(handle);
        }
        last_error = dlerror();
    }
    Err(last_error)
}

fn load_api() -> std::result::Result<Api, String> {
    let h = open_library()?;
    Ok(Api {
        kmod_new: resolve!(h, kmod_new),
        kmod_unref: resolve!(h, kmod_unref),
        kmod_load_resources: resolve!(h, kmod_load_resources),
        kmod_unload_resources: resolve!(h, kmod_unload_resources),
        kmod_get_dirname: resolve!(h, kmod_get_dirname),
        kmod_list_next: resolve!(h, kmod_list_next),
        kmod_module_new_from_loaded: resolve!(h, kmod_module_new_from_loaded),
        kmod_module_new_from_lookup: resolve!(h, kmod_module_new_from_lookup),
        kmod_module_new_from_name: resolve!(h, kmod_module_new_from_name),
        kmod_module_ref: resolve!(h, kmod_module_ref),
        kmod_module_unref: resolve!(h, kmod_module_unref),
        kmod_module_unref_list: resolve!(h, kmod_module_unref_list),
        kmod_module_get_module: resolve!(h, kmod_module_get_module),
        kmod_module_get_name: resolve!(h, kmod_module_get_name),
        kmod_module_get_path: resolve!(h, kmod_module_get_path),
        kmod_module_get_options: resolve!(h, kmod_module_get_options),
        kmod_module_get_install_commands: resolve!(h, kmod_module_get_install_commands),
        kmod_module_get_remove_commands: resolve!(h, kmod_module_get_remove_commands),
        kmod_module_get_size: resolve!(h, kmod_module_get_size),
        kmod_module_get_refcnt: resolve!(h, kmod_module_get_refcnt),
        kmod_module_get_initstate: resolve!(h, kmod_module_get_initstate),
        kmod_module_get_dependencies: resolve!(h, kmod_module_get_dependencies),
        kmod_module_get_holders: resolve!(h, kmod_module_get_holders),
        kmod_module_get_info: resolve!(h, kmod_module_get_info),
        kmod_module_info_get_key: resolve!(h, kmod_module_info_get_key),
        kmod_module_info_get_value: resolve!(h, kmod_module_info_get_value),
        kmod_module_info_free_list: resolve!(h, kmod_module_info_free_list),
        kmod_module_get_versions: resolve!(h, kmod_module_get_versions),
        kmod_module_version_get_symbol: resolve!(h, kmod_module_version_get_symbol),
        kmod_module_version_get_crc: resolve!(h, kmod_module_version_get_crc),
        kmod_module_versions_free_list: resolve!(h, kmod_module_versions_free_list),
        kmod_module_probe_insert_module: resolve!(h, kmod_module_probe_insert_module),
        kmod_module_remove_module: resolve!(h, kmod_module_remove_module),
    })
}

/// Copy a C string owned by libkmod. Null maps to `None`.
///
/// # Safety
///
/// `ptr` must be null or point to a NUL-terminated string.
unsafe fn owned_string(ptr: *const c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    // SAFETY: non-null and NUL-terminated per the caller's contract.
    Some(unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned())
}

fn path_cstring(path: &Path) -> std::result::Result<CString, Status> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| -libc::EINVAL)
}

fn status(rc: c_int) -> std::result::Result<(), Status> {
    if rc < 0 { Err(rc) } else { Ok(()) }
}

/// The libkmod implementation of [`Subsystem`].
///
/// Only a [`Context`](crate::Context) can load one, so raw libkmod objects
/// never reach code outside the owning handle types:
///
/// ```compile_fail
/// let lib = kmod_handles::Libkmod::load();
/// ```
#[derive(Clone, Copy)]
pub struct Libkmod {
    api: &'static Api,
}

impl Libkmod {
    /// Load libkmod, or reuse the copy loaded earlier in this process.
    pub(crate) fn load() -> Result<Self> {
        match API.get_or_init(load_api) {
            Ok(api) => Ok(Self { api }),
            Err(msg) => Err(Error::Library(msg.clone())),
        }
    }
}

impl std::fmt::Debug for Libkmod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Libkmod")
    }
}

impl Subsystem for Libkmod {
    type Ctx = NonNull<KmodCtx>;
    type Module = NonNull<KmodModule>;
    type List = NonNull<KmodList>;

    fn open(&self, config: &Config) -> std::result::Result<Self::Ctx, Status> {
        let dirname = config.module_dir.as_deref().map(path_cstring).transpose()?;
        let paths: Vec<CString> = config
            .config_paths
            .iter()
            .map(|p| path_cstring(p))
            .collect::<std::result::Result<_, _>>()?;
        let mut path_ptrs: Vec<*const c_char> = paths.iter().map(|p| p.as_ptr()).collect();
        path_ptrs.push(ptr::null());

        let dirname_ptr = dirname.as_ref().map_or(ptr::null(), |d| d.as_ptr());
        let config_ptr = if paths.is_empty() {
            ptr::null()
        } else {
            path_ptrs.as_ptr()
        };
        // SAFETY: both arguments are null or valid for the duration of the call;
        // libkmod copies what it keeps.
        let ctx = unsafe { (self.api.kmod_new)(dirname_ptr, config_ptr) };
        NonNull::new(ctx).ok_or(-libc::ENOMEM)
    }

    fn load_resources(&self, ctx: Self::Ctx) -> std::result::Result<(), Status> {
        // SAFETY: ctx is a live context owned by the caller.
        status(unsafe { (self.api.kmod_load_resources)(ctx.as_ptr()) })
    }

    fn unload_resources(&self, ctx: Self::Ctx) {
        // SAFETY: ctx is a live context owned by the caller.
        unsafe { (self.api.kmod_unload_resources)(ctx.as_ptr()) }
    }

    fn close(&self, ctx: Self::Ctx) {
        // SAFETY: the caller gives up its reference here.
        unsafe { (self.api.kmod_unref)(ctx.as_ptr()) };
    }

    fn module_dir(&self, ctx: Self::Ctx) -> Option<String> {
        // SAFETY: ctx is live; the returned string is owned by ctx.
        unsafe { owned_string((self.api.kmod_get_dirname)(ctx.as_ptr())) }
    }

    fn new_from_loaded(&self, ctx: Self::Ctx) -> std::result::Result<Option<Self::List>, Status> {
        let mut list = ptr::null_mut();
        // SAFETY: ctx is live and list is a valid out pointer.
        status(unsafe { (self.api.kmod_module_new_from_loaded)(ctx.as_ptr(), &mut list) })?;
        Ok(NonNull::new(list))
    }

    fn new_from_lookup(
        &self,
        ctx: Self::Ctx,
        alias: &CStr,
    ) -> std::result::Result<Option<Self::List>, Status> {
        let mut list = ptr::null_mut();
        // SAFETY: ctx is live, alias is NUL-terminated, list is a valid out pointer.
        status(unsafe {
            (self.api.kmod_module_new_from_lookup)(ctx.as_ptr(), alias.as_ptr(), &mut list)
        })?;
        Ok(NonNull::new(list))
    }

    fn new_from_name(&self, ctx: Self::Ctx, name: &CStr) -> std::result::Result<Self::Module, Status> {
        let mut module = ptr::null_mut();
        // SAFETY: ctx is live, name is NUL-terminated, module is a valid out pointer.
        status(unsafe {
            (self.api.kmod_module_new_from_name)(ctx.as_ptr(), name.as_ptr(), &mut module)
        })?;
        NonNull::new(module).ok_or(-libc::ENOENT)
    }

    fn module_ref(&self, module: Self::Module) {
        // SAFETY: module is live.
        unsafe { (self.api.kmod_module_ref)(module.as_ptr()) };
    }

    fn module_unref(&self, module: Self::Module) {
        // SAFETY: the caller gives up exactly one reference.
        unsafe { (self.api.kmod_module_unref)(module.as_ptr()) };
    }

    fn unref_list(&self, list: Self::List) {
        // SAFETY: list is the head of a module list owned by the caller.
        unsafe { (self.api.kmod_module_unref_list)(list.as_ptr()) };
    }

    fn list_next(&self, head: Self::List, current: Self::List) -> Option<Self::List> {
        // SAFETY: both entries belong to the same live chain.
        NonNull::new(unsafe { (self.api.kmod_list_next)(head.as_ptr(), current.as_ptr()) })
    }

    fn list_module(&self, entry: Self::List) -> Self::Module {
        // kmod_module_get_module hands out a new reference. The list still
        // holds its own, so give ours back and treat the entry as borrowed.
        // SAFETY: entry is a live module-list entry.
        let module = unsafe { (self.api.kmod_module_get_module)(entry.as_ptr()) };
        // SAFETY: libkmod never stores null modules in a list.
        let module = unsafe { NonNull::new_unchecked(module) };
        self.module_unref(module);
        module
    }

    fn name(&self, module: Self::Module) -> Option<String> {
        // SAFETY: module is live; the string is owned by it.
        unsafe { owned_string((self.api.kmod_module_get_name)(module.as_ptr())) }
    }

    fn path(&self, module: Self::Module) -> Option<String> {
        // SAFETY: module is live; the string is owned by it.
        unsafe { owned_string((self.api.kmod_module_get_path)(module.as_ptr())) }
    }

    fn options(&self, module: Self::Module) -> Option<String> {
        // SAFETY: module is live; the string is owned by it.
        unsafe { owned_string((self.api.kmod_module_get_options)(module.as_ptr())) }
    }

    fn install_commands(&self, module: Self::Module) -> Option<String> {
        // SAFETY: module is live; the string is owned by it.
        unsafe { owned_string((self.api.kmod_module_get_install_commands)(module.as_ptr())) }
    }

    fn remove_commands(&self, module: Self::Module) -> Option<String> {
        // SAFETY: module is live; the string is owned by it.
        unsafe { owned_string((self.api.kmod_module_get_remove_commands)(module.as_ptr())) }
    }

    fn size(&self, module: Self::Module) -> u64 {
        // SAFETY: module is live.
        let size = unsafe { (self.api.kmod_module_get_size)(module.as_ptr()) };
        u64::try_from(size).unwrap_or_else(|_| {
            kmod_warn!("module size unavailable: {}", strerror(size.unsigned_abs() as i32));
            0
        })
    }

    fn refcnt(&self, module: Self::Module) -> i32 {
        // SAFETY: module is live.
        unsafe { (self.api.kmod_module_get_refcnt)(module.as_ptr()) }
    }

    fn initstate(&self, module: Self::Module) -> std::result::Result<i32, Status> {
        // SAFETY: module is live.
        let state = unsafe { (self.api.kmod_module_get_initstate)(module.as_ptr()) };
        if state < 0 { Err(state) } else { Ok(state) }
    }

    fn dependencies(&self, module: Self::Module) -> Option<Self::List> {
        // SAFETY: module is live.
        NonNull::new(unsafe { (self.api.kmod_module_get_dependencies)(module.as_ptr()) })
    }

    fn holders(&self, module: Self::Module) -> Option<Self::List> {
        // SAFETY: module is live.
        NonNull::new(unsafe { (self.api.kmod_module_get_holders)(module.as_ptr()) })
    }

    fn get_info(&self, module: Self::Module) -> std::result::Result<Option<Self::List>, Status> {
        let mut list = ptr::null_mut();
        // SAFETY: module is live and list is a valid out pointer.
        status(unsafe { (self.api.kmod_module_get_info)(module.as_ptr(), &mut list) })?;
        Ok(NonNull::new(list))
    }

    fn info_key(&self, entry: Self::List) -> Option<String> {
        // SAFETY: entry belongs to a live info list.
        unsafe { owned_string((self.api.kmod_module_info_get_key)(entry.as_ptr())) }
    }

    fn info_value(&self, entry: Self::List) -> Option<String> {
        // SAFETY: entry belongs to a live info list.
        unsafe { owned_string((self.api.kmod_module_info_get_value)(entry.as_ptr())) }
    }

    fn free_info_list(&self, list: Self::List) {
        // SAFETY: list is the head of an info list owned by the caller.
        unsafe { (self.api.kmod_module_info_free_list)(list.as_ptr()) }
    }

    fn get_versions(&self, module: Self::Module) -> std::result::Result<Option<Self::List>, Status> {
        let mut list = ptr::null_mut();
        // SAFETY: module is live and list is a valid out pointer.
        status(unsafe { (self.api.kmod_module_get_versions)(module.as_ptr(), &mut list) })?;
        Ok(NonNull::new(list))
    }

    fn version_symbol(&self, entry: Self::List) -> Option<String> {
        // SAFETY: entry belongs to a live versions list.
        unsafe { owned_string((self.api.kmod_module_version_get_symbol)(entry.as_ptr())) }
    }

    fn version_crc(&self, entry: Self::List) -> u64 {
        // SAFETY: entry belongs to a live versions list.
        unsafe { (self.api.kmod_module_version_get_crc)(entry.as_ptr()) }
    }

    fn free_versions_list(&self, list: Self::List) {
        // SAFETY: list is the head of a versions list owned by the caller.
        unsafe { (self.api.kmod_module_versions_free_list)(list.as_ptr()) }
    }

    fn probe_insert(&self, module: Self::Module) -> std::result::Result<(), Status> {
        // SAFETY: module is live; no callbacks, options or flags are passed.
        status(unsafe {
            (self.api.kmod_module_probe_insert_module)(
                module.as_ptr(),
                0,
                ptr::null(),
                None,
                ptr::null(),
                None,
            )
        })
    }

    fn remove(&self, module: Self::Module) -> std::result::Result<(), Status> {
        // SAFETY: module is live.
        status(unsafe { (self.api.kmod_module_remove_module)(module.as_ptr(), 0) })
    }
}
