//! Engines shipped as shared libraries.
//!
//! The library exports `viewer_engine_entry`, returning a static [`EngineVTable`]. Every
//! callback in [`HostCallbacks`] is invoked on the calling thread, from inside a vtable call;
//! readiness must be signalled before `instantiate` returns.

use super::{LoadCompletion, NativeAddr, NativeEngine, NativeError, NodeStateProvider, PropertyRecord};
use crate::bootstrap::{DiagnosticSinks, EngineModule, InstantiateError, InstantiateRequest, Instantiated};
use crate::vfs::{VfsError, VirtualFileSystem};
use anyhow::{bail, Context, Result};
use libloading::Library;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::ffi::{c_char, c_void, CStr, CString};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::ptr;
use std::rc::{Rc, Weak};
use tokio::sync::oneshot;
use tracing::{debug, error, info};

pub const ENGINE_ABI_VERSION: u32 = 1;
pub const ENGINE_ENTRY_SYMBOL: &[u8] = b"viewer_engine_entry\0";

/// Output stream selector passed to [`HostCallbacks::print`].
pub const STREAM_STDOUT: i32 = 1;
pub const STREAM_STDERR: i32 = 2;

pub type RuntimePtr = *mut c_void;

#[repr(C)]
pub struct HostCallbacks {
    pub user_data: *mut c_void,
    pub print: unsafe extern "C" fn(*mut c_void, i32, *const c_char),
    pub ready: unsafe extern "C" fn(*mut c_void),
    pub get_node_state: unsafe extern "C" fn(*mut c_void, u64, u64, *mut PropertyRecord),
    pub set_node_state: unsafe extern "C" fn(*mut c_void, u64, u64, *const PropertyRecord),
    pub scene_loaded: unsafe extern "C" fn(*mut c_void, u64, i64),
}

/// C entry points of an engine library. Optional handles are passed as `0`, booleans as
/// `0`/`1`, optional strings as null.
#[repr(C)]
pub struct EngineVTable {
    pub abi_version: u32,
    /// Returns null on failure with the result code in `status`; `-4` means the budget could
    /// not be reserved.
    pub instantiate: unsafe extern "C" fn(u64, *const c_char, *const HostCallbacks, *mut i64) -> RuntimePtr,
    pub destroy_runtime: unsafe extern "C" fn(RuntimePtr),

    pub create_instance: unsafe extern "C" fn(RuntimePtr, *const c_char) -> i64,
    pub destroy_instance: unsafe extern "C" fn(RuntimePtr, u64) -> i64,
    pub create_scene: unsafe extern "C" fn(RuntimePtr, u64) -> i64,
    pub load_scene: unsafe extern "C" fn(RuntimePtr, u64, *const c_char, *const c_char) -> i64,
    /// The last argument is a ticket echoed back through `scene_loaded`.
    pub begin_scene_load: unsafe extern "C" fn(RuntimePtr, u64, *const c_char, *const c_char, u64) -> i64,
    pub retain_scene: unsafe extern "C" fn(RuntimePtr, u64) -> i64,
    pub release_scene: unsafe extern "C" fn(RuntimePtr, u64) -> i64,
    pub create_renderer: unsafe extern "C" fn(RuntimePtr, u64) -> i64,
    pub delete_renderer: unsafe extern "C" fn(RuntimePtr, u64) -> i64,
    pub attach_scene: unsafe extern "C" fn(RuntimePtr, u64, u64) -> i64,
    pub should_render_frame: unsafe extern "C" fn(RuntimePtr, u64) -> i64,
    pub render_frame: unsafe extern "C" fn(RuntimePtr, u64) -> i64,
    pub create_camera: unsafe extern "C" fn(RuntimePtr, u64) -> i64,
    pub delete_camera: unsafe extern "C" fn(RuntimePtr, u64) -> i64,
    pub activate_camera: unsafe extern "C" fn(RuntimePtr, u64, u64) -> i64,
    pub create_material: unsafe extern "C" fn(RuntimePtr, u64) -> i64,
    pub delete_material: unsafe extern "C" fn(RuntimePtr, u64) -> i64,

    pub create_view_state_manager: unsafe extern "C" fn(RuntimePtr) -> i64,
    pub destroy_view_state_manager: unsafe extern "C" fn(RuntimePtr, u64) -> i64,
    pub bind_view_state_manager: unsafe extern "C" fn(RuntimePtr, u64, u64) -> i64,
    pub fire_visibility_changed: unsafe extern "C" fn(RuntimePtr, u64, u64, i32) -> i64,
    pub fire_selection_changed: unsafe extern "C" fn(RuntimePtr, u64, u64, i32) -> i64,
    pub fire_opacity_changed: unsafe extern "C" fn(RuntimePtr, u64, u64, f32) -> i64,
    pub fire_highlight_color_changed: unsafe extern "C" fn(RuntimePtr, u64, u64, u32) -> i64,

    pub malloc: unsafe extern "C" fn(RuntimePtr, usize) -> u64,
    pub free: unsafe extern "C" fn(RuntimePtr, u64),
    pub write_memory: unsafe extern "C" fn(RuntimePtr, u64, *const u8, usize) -> i64,
    pub read_memory: unsafe extern "C" fn(RuntimePtr, u64, *mut u8, usize) -> i64,

    pub create_texture: unsafe extern "C" fn(RuntimePtr, u64, u32, u32) -> i64,
    pub update_texture: unsafe extern "C" fn(RuntimePtr, u64, u64, u32, u32) -> i64,
    pub delete_texture: unsafe extern "C" fn(RuntimePtr, u64) -> i64,

    pub fs_write: unsafe extern "C" fn(RuntimePtr, *const c_char, *const u8, usize) -> i64,
    /// Returns the file length, or a negative code.
    pub fs_size: unsafe extern "C" fn(RuntimePtr, *const c_char) -> i64,
    pub fs_read: unsafe extern "C" fn(RuntimePtr, *const c_char, *mut u8, usize) -> i64,
    /// Returns `1` when a file was removed and `0` when there was none.
    pub fs_delete: unsafe extern "C" fn(RuntimePtr, *const c_char) -> i64,
}

pub type EngineEntryFn = unsafe extern "C" fn() -> *const EngineVTable;

const BAD_ARGUMENT: i64 = -3;

struct LoadedLibrary {
    vtable: *const EngineVTable,
    // Keeps `vtable` mapped.
    _library: Library,
}

impl LoadedLibrary {
    fn vtable(&self) -> &EngineVTable {
        // SAFETY: checked non-null at load time and valid while `_library` is loaded.
        unsafe { &*self.vtable }
    }
}

/// Host side of the callbacks, reached through `HostCallbacks::user_data`.
struct HostState {
    sinks: DiagnosticSinks,
    ready: RefCell<Option<oneshot::Sender<()>>>,
    provider: RefCell<Option<Weak<dyn NodeStateProvider>>>,
    loads: RefCell<HashMap<u64, LoadCompletion>>,
    next_ticket: Cell<u64>,
}

impl HostState {
    fn new(sinks: DiagnosticSinks, ready: oneshot::Sender<()>) -> Self {
        Self {
            sinks,
            ready: RefCell::new(Some(ready)),
            provider: RefCell::new(None),
            loads: RefCell::new(HashMap::new()),
            next_ticket: Cell::new(1),
        }
    }

    fn provider(&self) -> Option<Rc<dyn NodeStateProvider>> {
        self.provider.borrow().as_ref().and_then(Weak::upgrade)
    }
}

unsafe fn host<'a>(user_data: *mut c_void) -> Option<&'a HostState> {
    (user_data as *const HostState).as_ref()
}

fn guarded(name: &str, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        error!(callback = name, "host callback panicked");
    }
}

unsafe extern "C" fn host_print(user_data: *mut c_void, stream: i32, line: *const c_char) {
    let (Some(host), false) = (host(user_data), line.is_null()) else {
        return;
    };
    let text = CStr::from_ptr(line).to_string_lossy().into_owned();
    guarded("print", || {
        if stream == STREAM_STDERR {
            host.sinks.print_err(&text);
        } else {
            host.sinks.print(&text);
        }
    });
}

unsafe extern "C" fn host_ready(user_data: *mut c_void) {
    if let Some(host) = host(user_data) {
        if let Some(sender) = host.ready.borrow_mut().take() {
            let _ = sender.send(());
        }
    }
}

unsafe extern "C" fn host_get_node_state(user_data: *mut c_void, view_state: u64, node: u64, record: *mut PropertyRecord) {
    let (Some(host), Some(record)) = (host(user_data), record.as_mut()) else {
        return;
    };
    match host.provider() {
        Some(provider) => guarded("get_node_state", || provider.get_node_state(view_state, node, record)),
        None => record.mask = 0,
    }
}

unsafe extern "C" fn host_set_node_state(
    user_data: *mut c_void,
    view_state: u64,
    node: u64,
    record: *const PropertyRecord,
) {
    let (Some(host), Some(record)) = (host(user_data), record.as_ref()) else {
        return;
    };
    if let Some(provider) = host.provider() {
        guarded("set_node_state", || provider.set_node_state(view_state, node, record));
    }
}

unsafe extern "C" fn host_scene_loaded(user_data: *mut c_void, ticket: u64, result: i64) {
    let Some(host) = host(user_data) else {
        return;
    };
    let completion = host.loads.borrow_mut().remove(&ticket);
    match completion {
        Some(completion) => guarded("scene_loaded", || completion(result)),
        None => debug!(ticket, "completion for an unknown scene load ticket"),
    }
}

/// One instantiated engine runtime. Dropping it destroys the runtime before the host state
/// and library go away.
struct DynamicRuntime {
    runtime: RuntimePtr,
    root: String,
    _callbacks: Box<HostCallbacks>,
    host: Box<HostState>,
    library: Rc<LoadedLibrary>,
}

impl DynamicRuntime {
    fn vtable(&self) -> &EngineVTable {
        self.library.vtable()
    }
}

impl Drop for DynamicRuntime {
    fn drop(&mut self) {
        // SAFETY: `runtime` came from this library's `instantiate` and is destroyed once.
        unsafe { (self.vtable().destroy_runtime)(self.runtime) };
        debug!(root = %self.root, "engine runtime destroyed");
    }
}

fn c_string(value: &str) -> Option<CString> {
    CString::new(value).ok()
}

fn optional(addr: Option<NativeAddr>) -> u64 {
    addr.unwrap_or(0)
}

/// [`NativeEngine`] backed by a shared library runtime.
pub struct DynamicEngine {
    inner: Rc<DynamicRuntime>,
}

macro_rules! call {
    ($self:ident, $entry:ident $(, $arg:expr)*) => {
        // SAFETY: the runtime pointer stays valid for the lifetime of `inner`.
        unsafe { ($self.inner.vtable().$entry)($self.inner.runtime $(, $arg)*) }
    };
}

impl NativeEngine for DynamicEngine {
    fn create_instance(&self, client_id: &str) -> i64 {
        match c_string(client_id) {
            Some(client_id) => call!(self, create_instance, client_id.as_ptr()),
            None => BAD_ARGUMENT,
        }
    }

    fn destroy_instance(&self, instance: NativeAddr) -> i64 {
        call!(self, destroy_instance, instance)
    }

    fn create_scene(&self, instance: NativeAddr) -> i64 {
        call!(self, create_scene, instance)
    }

    fn load_scene(&self, instance: NativeAddr, path: &str, password: Option<&str>) -> i64 {
        let Some(path) = c_string(path) else {
            return BAD_ARGUMENT;
        };
        let password = match password.map(c_string) {
            Some(None) => return BAD_ARGUMENT,
            Some(Some(password)) => Some(password),
            None => None,
        };
        let password_ptr = password.as_ref().map_or(ptr::null(), |p| p.as_ptr());
        call!(self, load_scene, instance, path.as_ptr(), password_ptr)
    }

    fn begin_scene_load(
        &self,
        instance: NativeAddr,
        path: &str,
        password: Option<&str>,
        on_complete: LoadCompletion,
    ) -> i64 {
        let Some(path) = c_string(path) else {
            return BAD_ARGUMENT;
        };
        let password = match password.map(c_string) {
            Some(None) => return BAD_ARGUMENT,
            Some(Some(password)) => Some(password),
            None => None,
        };
        let password_ptr = password.as_ref().map_or(ptr::null(), |p| p.as_ptr());
        let host = &self.inner.host;
        let ticket = host.next_ticket.get();
        host.next_ticket.set(ticket + 1);
        host.loads.borrow_mut().insert(ticket, on_complete);
        let status = call!(self, begin_scene_load, instance, path.as_ptr(), password_ptr, ticket);
        if status < 0 {
            host.loads.borrow_mut().remove(&ticket);
        }
        status
    }

    fn retain_scene(&self, scene: NativeAddr) -> i64 {
        call!(self, retain_scene, scene)
    }

    fn release_scene(&self, scene: NativeAddr) -> i64 {
        call!(self, release_scene, scene)
    }

    fn create_renderer(&self, instance: NativeAddr) -> i64 {
        call!(self, create_renderer, instance)
    }

    fn delete_renderer(&self, renderer: NativeAddr) -> i64 {
        call!(self, delete_renderer, renderer)
    }

    fn attach_scene(&self, renderer: NativeAddr, scene: Option<NativeAddr>) -> i64 {
        call!(self, attach_scene, renderer, optional(scene))
    }

    fn should_render_frame(&self, renderer: NativeAddr) -> i64 {
        call!(self, should_render_frame, renderer)
    }

    fn render_frame(&self, renderer: NativeAddr) -> i64 {
        call!(self, render_frame, renderer)
    }

    fn create_camera(&self, scene: NativeAddr) -> i64 {
        call!(self, create_camera, scene)
    }

    fn delete_camera(&self, camera: NativeAddr) -> i64 {
        call!(self, delete_camera, camera)
    }

    fn activate_camera(&self, renderer: NativeAddr, camera: Option<NativeAddr>) -> i64 {
        call!(self, activate_camera, renderer, optional(camera))
    }

    fn create_material(&self, instance: NativeAddr) -> i64 {
        call!(self, create_material, instance)
    }

    fn delete_material(&self, material: NativeAddr) -> i64 {
        call!(self, delete_material, material)
    }

    fn create_view_state_manager(&self) -> i64 {
        call!(self, create_view_state_manager)
    }

    fn destroy_view_state_manager(&self, view_state: NativeAddr) -> i64 {
        call!(self, destroy_view_state_manager, view_state)
    }

    fn bind_view_state_manager(&self, renderer: NativeAddr, view_state: Option<NativeAddr>) -> i64 {
        call!(self, bind_view_state_manager, renderer, optional(view_state))
    }

    fn set_node_state_provider(&self, provider: Weak<dyn NodeStateProvider>) {
        *self.inner.host.provider.borrow_mut() = Some(provider);
    }

    fn fire_node_visibility_changed(&self, view_state: NativeAddr, node: NativeAddr, visible: bool) -> i64 {
        call!(self, fire_visibility_changed, view_state, node, i32::from(visible))
    }

    fn fire_node_selection_changed(&self, view_state: NativeAddr, node: NativeAddr, selected: bool) -> i64 {
        call!(self, fire_selection_changed, view_state, node, i32::from(selected))
    }

    fn fire_node_opacity_changed(&self, view_state: NativeAddr, node: NativeAddr, opacity: f32) -> i64 {
        call!(self, fire_opacity_changed, view_state, node, opacity)
    }

    fn fire_node_highlight_color_changed(&self, view_state: NativeAddr, node: NativeAddr, color: u32) -> i64 {
        call!(self, fire_highlight_color_changed, view_state, node, color)
    }

    fn malloc(&self, size: usize) -> NativeAddr {
        call!(self, malloc, size)
    }

    fn free(&self, addr: NativeAddr) {
        call!(self, free, addr)
    }

    fn write_memory(&self, addr: NativeAddr, bytes: &[u8]) -> i64 {
        call!(self, write_memory, addr, bytes.as_ptr(), bytes.len())
    }

    fn read_memory(&self, addr: NativeAddr, out: &mut [u8]) -> i64 {
        call!(self, read_memory, addr, out.as_mut_ptr(), out.len())
    }

    fn create_texture(&self, pixels: NativeAddr, width: u32, height: u32) -> i64 {
        call!(self, create_texture, pixels, width, height)
    }

    fn update_texture(&self, texture: NativeAddr, pixels: NativeAddr, width: u32, height: u32) -> i64 {
        call!(self, update_texture, texture, pixels, width, height)
    }

    fn delete_texture(&self, texture: NativeAddr) -> i64 {
        call!(self, delete_texture, texture)
    }
}

/// The runtime's sandboxed file system.
pub struct DynamicFileSystem {
    inner: Rc<DynamicRuntime>,
}

impl DynamicFileSystem {
    fn path(&self, path: &str) -> Result<CString, VfsError> {
        CString::new(path).map_err(|_| VfsError::Backend(format!("path '{}' contains a NUL byte", path.escape_debug())))
    }
}

fn fs_status(path: &str, code: i64) -> Result<i64, VfsError> {
    match NativeError::from_code(code) {
        _ if code >= 0 => Ok(code),
        NativeError::FileNotFound | NativeError::NotFound => Err(VfsError::NotFound(path.to_string())),
        NativeError::BadArgument => Err(VfsError::OutsideRoot(path.to_string())),
        other => Err(VfsError::Backend(other.to_string())),
    }
}

impl VirtualFileSystem for DynamicFileSystem {
    fn root(&self) -> &str {
        &self.inner.root
    }

    fn write(&self, path: &str, bytes: &[u8]) -> Result<(), VfsError> {
        let c_path = self.path(path)?;
        fs_status(path, call!(self, fs_write, c_path.as_ptr(), bytes.as_ptr(), bytes.len()))?;
        Ok(())
    }

    fn read(&self, path: &str) -> Result<Vec<u8>, VfsError> {
        let c_path = self.path(path)?;
        let len = fs_status(path, call!(self, fs_size, c_path.as_ptr()))? as usize;
        let mut bytes = vec![0u8; len];
        fs_status(path, call!(self, fs_read, c_path.as_ptr(), bytes.as_mut_ptr(), len))?;
        Ok(bytes)
    }

    fn delete(&self, path: &str) -> Result<bool, VfsError> {
        let c_path = self.path(path)?;
        Ok(fs_status(path, call!(self, fs_delete, c_path.as_ptr()))? > 0)
    }

    fn exists(&self, path: &str) -> bool {
        match self.path(path) {
            Ok(c_path) => call!(self, fs_size, c_path.as_ptr()) >= 0,
            Err(_) => false,
        }
    }
}

/// An engine library loaded from disk.
pub struct DynamicEngineModule {
    name: String,
    path: PathBuf,
    library: Rc<LoadedLibrary>,
}

impl DynamicEngineModule {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let library = unsafe {
            Library::new(&path).with_context(|| format!("loading engine library '{}'", path.display()))?
        };
        let entry_fn = unsafe {
            library.get::<EngineEntryFn>(ENGINE_ENTRY_SYMBOL).with_context(|| {
                format!("resolving 'viewer_engine_entry' in engine library '{}'", path.display())
            })?
        };
        let vtable = unsafe { entry_fn() };
        drop(entry_fn);
        if vtable.is_null() {
            bail!("engine library '{}' returned a null vtable", path.display());
        }
        let abi_version = unsafe { (*vtable).abi_version };
        if abi_version != ENGINE_ABI_VERSION {
            bail!("abi mismatch: engine library targets v{abi_version}, host expects v{ENGINE_ABI_VERSION}");
        }
        let name = path.file_stem().map(|stem| stem.to_string_lossy().into_owned()).unwrap_or_else(|| "engine".into());
        info!(path = %path.display(), abi_version, "engine library loaded");
        Ok(Self { name, path, library: Rc::new(LoadedLibrary { vtable, _library: library }) })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl EngineModule for DynamicEngineModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn instantiate(&self, request: &InstantiateRequest<'_>) -> Result<Instantiated, InstantiateError> {
        let root = CString::new(request.file_root)
            .map_err(|_| InstantiateError::Fatal("file root contains a NUL byte".to_string()))?;
        let (sender, ready) = oneshot::channel();
        let host = Box::new(HostState::new(request.sinks.clone(), sender));
        let callbacks = Box::new(HostCallbacks {
            user_data: &*host as *const HostState as *mut c_void,
            print: host_print,
            ready: host_ready,
            get_node_state: host_get_node_state,
            set_node_state: host_set_node_state,
            scene_loaded: host_scene_loaded,
        });

        let mut status = 0i64;
        let vtable = self.library.vtable();
        // SAFETY: `callbacks` and `host` are boxed and outlive the runtime, see `DynamicRuntime`.
        let runtime = unsafe { (vtable.instantiate)(request.memory_budget, root.as_ptr(), &*callbacks, &mut status) };
        // Readiness arrives during `instantiate` or not at all.
        host.ready.borrow_mut().take();
        if runtime.is_null() {
            return Err(match NativeError::from_code(status) {
                NativeError::OutOfMemory => InstantiateError::OutOfMemory { budget: request.memory_budget },
                other => InstantiateError::Fatal(format!("engine instantiate failed: {other}")),
            });
        }

        let inner = Rc::new(DynamicRuntime {
            runtime,
            root: request.file_root.to_string(),
            _callbacks: callbacks,
            host,
            library: self.library.clone(),
        });
        Ok(Instantiated {
            engine: Rc::new(DynamicEngine { inner: inner.clone() }),
            files: Rc::new(DynamicFileSystem { inner }),
            ready,
        })
    }
}
