//! Deterministic in-process engine for headless runs and tests.
//!
//! `MockEngine` keeps every native object in ordered maps, records the calls that matter to
//! the bridge (fired node changes, frames, texture uploads, frees) and exposes knobs to force
//! failures. It implements the boundary contract, not any rendering.

use super::{
    check_status, LoadCompletion, NativeAddr, NativeEngine, NodeStateProvider, PropertyMask, PropertyRecord,
    NodeFlags, STATUS_LOAD_STARTED, STATUS_OK,
};
use crate::bootstrap::{EngineModule, InstantiateError, InstantiateRequest, Instantiated};
use crate::vfs::{MemoryFileSystem, VirtualFileSystem};
use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};
use tokio::sync::oneshot;

const FIRST_ADDRESS: NativeAddr = 0x1000;
const ADDRESS_STRIDE: NativeAddr = 0x20;
const ERR_BAD_ARGUMENT: i64 = -3;
const ERR_FILE_NOT_FOUND: i64 = -5;
const ERR_WRONG_PASSWORD: i64 = -6;
const ERR_BAD_FORMAT: i64 = -7;
const ERR_NOT_FOUND: i64 = -8;

/// Scene files starting with this marker require the password on the rest of the first line.
pub const LOCKED_SCENE_MARKER: &[u8] = b"locked:";

#[derive(Debug, Clone, PartialEq)]
pub enum MockObject {
    Instance { client_id: String },
    Scene { ref_count: i64, source: Option<String> },
    Renderer { instance: NativeAddr, scene: Option<NativeAddr>, camera: Option<NativeAddr>, view_state: Option<NativeAddr> },
    Camera { scene: NativeAddr },
    Material { instance: NativeAddr },
    ViewState,
    Texture { width: u32, height: u32, pixels: Vec<u8>, updates: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FiredValue {
    Visibility(bool),
    Selection(bool),
    Opacity(f32),
    HighlightColor(u32),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FiredChange {
    pub view_state: NativeAddr,
    pub node: NativeAddr,
    pub value: FiredValue,
}

struct PendingLoad {
    instance: NativeAddr,
    path: String,
    password: Option<String>,
    completion: LoadCompletion,
}

#[derive(Default)]
struct MockState {
    next_addr: NativeAddr,
    objects: BTreeMap<NativeAddr, MockObject>,
    memory: BTreeMap<NativeAddr, Vec<u8>>,
    fired: Vec<FiredChange>,
    frames: BTreeMap<NativeAddr, u32>,
    destroyed_view_states: Vec<NativeAddr>,
    deleted_with_bound_view_state: u32,
    invalid_frees: u32,
    allocations: u32,
    fail_next_create: Option<i64>,
    fail_next_retain: Option<i64>,
    fail_allocations: bool,
    fail_textures: Option<i64>,
    reused_address: Option<NativeAddr>,
}

pub struct MockEngine {
    state: RefCell<MockState>,
    files: Rc<MemoryFileSystem>,
    provider: RefCell<Option<Weak<dyn NodeStateProvider>>>,
    pending_loads: RefCell<Vec<PendingLoad>>,
    should_render: Cell<bool>,
    auto_complete_loads: Cell<bool>,
    memory_budget: u64,
}

impl MockEngine {
    pub fn new(files: Rc<MemoryFileSystem>) -> Self {
        Self::with_budget(files, crate::bootstrap::DEFAULT_MEMORY_BUDGET)
    }

    pub fn with_budget(files: Rc<MemoryFileSystem>, memory_budget: u64) -> Self {
        Self {
            state: RefCell::new(MockState { next_addr: FIRST_ADDRESS, ..Default::default() }),
            files,
            provider: RefCell::new(None),
            pending_loads: RefCell::new(Vec::new()),
            should_render: Cell::new(true),
            auto_complete_loads: Cell::new(false),
            memory_budget,
        }
    }

    pub fn files(&self) -> Rc<MemoryFileSystem> {
        self.files.clone()
    }

    pub fn memory_budget(&self) -> u64 {
        self.memory_budget
    }

    pub fn set_should_render(&self, value: bool) {
        self.should_render.set(value);
    }

    /// When enabled, asynchronous loads complete inside `begin_scene_load`.
    pub fn set_auto_complete_loads(&self, value: bool) {
        self.auto_complete_loads.set(value);
    }

    /// The next `create_*`/`load_scene` call returns `code` instead of a handle.
    pub fn fail_next_create(&self, code: i64) {
        self.state.borrow_mut().fail_next_create = Some(code);
    }

    /// The next `retain_scene` call returns `code` and leaves the count alone.
    pub fn fail_next_retain(&self, code: i64) {
        self.state.borrow_mut().fail_next_retain = Some(code);
    }

    pub fn fail_allocations(&self, value: bool) {
        self.state.borrow_mut().fail_allocations = value;
    }

    pub fn fail_textures(&self, code: Option<i64>) {
        self.state.borrow_mut().fail_textures = code;
    }

    /// The next created object reuses `addr`, imitating an allocator handing out a live address.
    pub fn reuse_address_once(&self, addr: NativeAddr) {
        self.state.borrow_mut().reused_address = Some(addr);
    }

    pub fn object(&self, addr: NativeAddr) -> Option<MockObject> {
        self.state.borrow().objects.get(&addr).cloned()
    }

    pub fn is_live(&self, addr: NativeAddr) -> bool {
        self.state.borrow().objects.contains_key(&addr)
    }

    pub fn live_view_states(&self) -> usize {
        self.count_objects(|object| matches!(object, MockObject::ViewState))
    }

    pub fn live_scenes(&self) -> usize {
        self.count_objects(|object| matches!(object, MockObject::Scene { .. }))
    }

    pub fn live_cameras(&self) -> usize {
        self.count_objects(|object| matches!(object, MockObject::Camera { .. }))
    }

    pub fn live_textures(&self) -> usize {
        self.count_objects(|object| matches!(object, MockObject::Texture { .. }))
    }

    fn count_objects(&self, predicate: impl Fn(&MockObject) -> bool) -> usize {
        self.state.borrow().objects.values().filter(|object| predicate(object)).count()
    }

    pub fn scene_ref_count(&self, scene: NativeAddr) -> Option<i64> {
        match self.object(scene) {
            Some(MockObject::Scene { ref_count, .. }) => Some(ref_count),
            _ => None,
        }
    }

    pub fn bound_view_state(&self, renderer: NativeAddr) -> Option<NativeAddr> {
        match self.object(renderer) {
            Some(MockObject::Renderer { view_state, .. }) => view_state,
            _ => None,
        }
    }

    pub fn texture_pixels(&self, texture: NativeAddr) -> Option<(u32, u32, Vec<u8>)> {
        match self.object(texture) {
            Some(MockObject::Texture { width, height, pixels, .. }) => Some((width, height, pixels)),
            _ => None,
        }
    }

    pub fn fired(&self) -> Vec<FiredChange> {
        self.state.borrow().fired.clone()
    }

    pub fn clear_fired(&self) {
        self.state.borrow_mut().fired.clear();
    }

    pub fn frames_rendered(&self, renderer: NativeAddr) -> u32 {
        self.state.borrow().frames.get(&renderer).copied().unwrap_or(0)
    }

    pub fn destroyed_view_states(&self) -> Vec<NativeAddr> {
        self.state.borrow().destroyed_view_states.clone()
    }

    /// Renderers deleted while a view-state manager was still bound to them.
    pub fn deleted_with_bound_view_state(&self) -> u32 {
        self.state.borrow().deleted_with_bound_view_state
    }

    pub fn live_allocations(&self) -> usize {
        self.state.borrow().memory.len()
    }

    pub fn total_allocations(&self) -> u32 {
        self.state.borrow().allocations
    }

    pub fn invalid_frees(&self) -> u32 {
        self.state.borrow().invalid_frees
    }

    pub fn pending_load_count(&self) -> usize {
        self.pending_loads.borrow().len()
    }

    /// Completes every pending asynchronous load in submission order.
    pub fn complete_pending_loads(&self) {
        let pending: Vec<PendingLoad> = self.pending_loads.borrow_mut().drain(..).collect();
        for load in pending {
            let result = self.load_scene(load.instance, &load.path, load.password.as_deref());
            (load.completion)(result);
        }
    }

    /// Asks the host for node state the way the engine does while rendering.
    pub fn query_node_state(
        &self,
        view_state: NativeAddr,
        node: NativeAddr,
        mask: PropertyMask,
        flags_mask: NodeFlags,
    ) -> PropertyRecord {
        let mut record = PropertyRecord::request(mask, flags_mask);
        if let Some(provider) = self.provider() {
            provider.get_node_state(view_state, node, &mut record);
        } else {
            record.mask = 0;
        }
        record
    }

    /// Pushes node state to the host the way the engine does after picking.
    pub fn push_node_state(&self, view_state: NativeAddr, node: NativeAddr, record: &PropertyRecord) {
        if let Some(provider) = self.provider() {
            provider.set_node_state(view_state, node, record);
        }
    }

    fn provider(&self) -> Option<Rc<dyn NodeStateProvider>> {
        self.provider.borrow().as_ref().and_then(Weak::upgrade)
    }

    fn insert(&self, object: MockObject) -> i64 {
        let mut state = self.state.borrow_mut();
        if let Some(code) = state.fail_next_create.take() {
            return code;
        }
        let addr = match state.reused_address.take() {
            Some(addr) => addr,
            None => {
                let addr = state.next_addr;
                state.next_addr += ADDRESS_STRIDE;
                addr
            }
        };
        state.objects.insert(addr, object);
        addr as i64
    }

    fn remove_if(&self, addr: NativeAddr, predicate: impl Fn(&MockObject) -> bool) -> i64 {
        let mut state = self.state.borrow_mut();
        match state.objects.get(&addr) {
            Some(object) if predicate(object) => {
                state.objects.remove(&addr);
                STATUS_OK
            }
            Some(_) => ERR_BAD_ARGUMENT,
            None => ERR_NOT_FOUND,
        }
    }

    fn has(&self, addr: NativeAddr, predicate: impl Fn(&MockObject) -> bool) -> bool {
        self.state.borrow().objects.get(&addr).map(predicate).unwrap_or(false)
    }

    fn is_instance(&self, addr: NativeAddr) -> bool {
        self.has(addr, |object| matches!(object, MockObject::Instance { .. }))
    }

    fn is_scene(&self, addr: NativeAddr) -> bool {
        self.has(addr, |object| matches!(object, MockObject::Scene { .. }))
    }

    fn is_view_state(&self, addr: NativeAddr) -> bool {
        self.has(addr, |object| matches!(object, MockObject::ViewState))
    }

    fn with_renderer<R>(
        &self,
        renderer: NativeAddr,
        f: impl FnOnce(&mut Option<NativeAddr>, &mut Option<NativeAddr>, &mut Option<NativeAddr>) -> R,
    ) -> Option<R> {
        let mut state = self.state.borrow_mut();
        match state.objects.get_mut(&renderer) {
            Some(MockObject::Renderer { scene, camera, view_state, .. }) => Some(f(scene, camera, view_state)),
            _ => None,
        }
    }

    fn fire(&self, view_state: NativeAddr, node: NativeAddr, value: FiredValue) -> i64 {
        if !self.is_view_state(view_state) {
            return ERR_NOT_FOUND;
        }
        self.state.borrow_mut().fired.push(FiredChange { view_state, node, value });
        STATUS_OK
    }

    fn texture_from_memory(&self, pixels: NativeAddr, width: u32, height: u32) -> Result<Vec<u8>, i64> {
        let state = self.state.borrow();
        if let Some(code) = state.fail_textures {
            return Err(code);
        }
        let len = width as usize * height as usize * 4;
        match state.memory.get(&pixels) {
            Some(bytes) if bytes.len() >= len => Ok(bytes[..len].to_vec()),
            Some(_) => Err(ERR_BAD_ARGUMENT),
            None => Err(ERR_NOT_FOUND),
        }
    }
}

impl NativeEngine for MockEngine {
    fn create_instance(&self, client_id: &str) -> i64 {
        if client_id.is_empty() {
            return ERR_BAD_ARGUMENT;
        }
        self.insert(MockObject::Instance { client_id: client_id.to_string() })
    }

    fn destroy_instance(&self, instance: NativeAddr) -> i64 {
        self.remove_if(instance, |object| matches!(object, MockObject::Instance { .. }))
    }

    fn create_scene(&self, instance: NativeAddr) -> i64 {
        if !self.is_instance(instance) {
            return ERR_NOT_FOUND;
        }
        self.insert(MockObject::Scene { ref_count: 1, source: None })
    }

    fn load_scene(&self, instance: NativeAddr, path: &str, password: Option<&str>) -> i64 {
        if !self.is_instance(instance) {
            return ERR_NOT_FOUND;
        }
        let bytes = match self.files.read(path) {
            Ok(bytes) => bytes,
            Err(_) => return ERR_FILE_NOT_FOUND,
        };
        if bytes.is_empty() {
            return ERR_BAD_FORMAT;
        }
        if let Some(rest) = bytes.strip_prefix(LOCKED_SCENE_MARKER) {
            let expected = rest.split(|b| *b == b'\n').next().unwrap_or_default();
            if password.map(str::as_bytes) != Some(expected) {
                return ERR_WRONG_PASSWORD;
            }
        }
        self.insert(MockObject::Scene { ref_count: 1, source: Some(path.to_string()) })
    }

    fn begin_scene_load(
        &self,
        instance: NativeAddr,
        path: &str,
        password: Option<&str>,
        on_complete: LoadCompletion,
    ) -> i64 {
        if !self.is_instance(instance) {
            return ERR_NOT_FOUND;
        }
        if path.is_empty() {
            return ERR_BAD_ARGUMENT;
        }
        if self.auto_complete_loads.get() {
            let result = self.load_scene(instance, path, password);
            on_complete(result);
        } else {
            self.pending_loads.borrow_mut().push(PendingLoad {
                instance,
                path: path.to_string(),
                password: password.map(str::to_string),
                completion: on_complete,
            });
        }
        STATUS_LOAD_STARTED
    }

    fn retain_scene(&self, scene: NativeAddr) -> i64 {
        let mut state = self.state.borrow_mut();
        if let Some(code) = state.fail_next_retain.take() {
            return code;
        }
        match state.objects.get_mut(&scene) {
            Some(MockObject::Scene { ref_count, .. }) => {
                *ref_count += 1;
                *ref_count
            }
            _ => ERR_NOT_FOUND,
        }
    }

    fn release_scene(&self, scene: NativeAddr) -> i64 {
        let mut state = self.state.borrow_mut();
        let remaining = match state.objects.get_mut(&scene) {
            Some(MockObject::Scene { ref_count, .. }) => {
                *ref_count -= 1;
                *ref_count
            }
            _ => return ERR_NOT_FOUND,
        };
        if remaining <= 0 {
            state.objects.remove(&scene);
        }
        remaining.max(0)
    }

    fn create_renderer(&self, instance: NativeAddr) -> i64 {
        if !self.is_instance(instance) {
            return ERR_NOT_FOUND;
        }
        self.insert(MockObject::Renderer { instance, scene: None, camera: None, view_state: None })
    }

    fn delete_renderer(&self, renderer: NativeAddr) -> i64 {
        let bound = self.with_renderer(renderer, |_, _, view_state| view_state.is_some());
        match bound {
            Some(true) => self.state.borrow_mut().deleted_with_bound_view_state += 1,
            Some(false) => {}
            None => return ERR_NOT_FOUND,
        }
        self.state.borrow_mut().frames.remove(&renderer);
        self.remove_if(renderer, |object| matches!(object, MockObject::Renderer { .. }))
    }

    fn attach_scene(&self, renderer: NativeAddr, scene: Option<NativeAddr>) -> i64 {
        if let Some(scene) = scene {
            if !self.is_scene(scene) {
                return ERR_NOT_FOUND;
            }
        }
        self.with_renderer(renderer, |attached, camera, _| {
            *attached = scene;
            *camera = None;
            STATUS_OK
        })
        .unwrap_or(ERR_NOT_FOUND)
    }

    fn should_render_frame(&self, renderer: NativeAddr) -> i64 {
        if self.with_renderer(renderer, |_, _, _| ()).is_none() {
            return ERR_NOT_FOUND;
        }
        i64::from(self.should_render.get())
    }

    fn render_frame(&self, renderer: NativeAddr) -> i64 {
        if self.with_renderer(renderer, |_, _, _| ()).is_none() {
            return ERR_NOT_FOUND;
        }
        *self.state.borrow_mut().frames.entry(renderer).or_insert(0) += 1;
        STATUS_OK
    }

    fn create_camera(&self, scene: NativeAddr) -> i64 {
        if !self.is_scene(scene) {
            return ERR_NOT_FOUND;
        }
        self.insert(MockObject::Camera { scene })
    }

    fn delete_camera(&self, camera: NativeAddr) -> i64 {
        self.remove_if(camera, |object| matches!(object, MockObject::Camera { .. }))
    }

    fn activate_camera(&self, renderer: NativeAddr, camera: Option<NativeAddr>) -> i64 {
        if let Some(camera) = camera {
            if !self.has(camera, |object| matches!(object, MockObject::Camera { .. })) {
                return ERR_NOT_FOUND;
            }
        }
        self.with_renderer(renderer, |_, active, _| {
            *active = camera;
            STATUS_OK
        })
        .unwrap_or(ERR_NOT_FOUND)
    }

    fn create_material(&self, instance: NativeAddr) -> i64 {
        if !self.is_instance(instance) {
            return ERR_NOT_FOUND;
        }
        self.insert(MockObject::Material { instance })
    }

    fn delete_material(&self, material: NativeAddr) -> i64 {
        self.remove_if(material, |object| matches!(object, MockObject::Material { .. }))
    }

    fn create_view_state_manager(&self) -> i64 {
        self.insert(MockObject::ViewState)
    }

    fn destroy_view_state_manager(&self, view_state: NativeAddr) -> i64 {
        let status = self.remove_if(view_state, |object| matches!(object, MockObject::ViewState));
        if status == STATUS_OK {
            self.state.borrow_mut().destroyed_view_states.push(view_state);
        }
        status
    }

    fn bind_view_state_manager(&self, renderer: NativeAddr, view_state: Option<NativeAddr>) -> i64 {
        if let Some(view_state) = view_state {
            if !self.is_view_state(view_state) {
                return ERR_NOT_FOUND;
            }
        }
        self.with_renderer(renderer, |_, _, bound| {
            *bound = view_state;
            STATUS_OK
        })
        .unwrap_or(ERR_NOT_FOUND)
    }

    fn set_node_state_provider(&self, provider: Weak<dyn NodeStateProvider>) {
        *self.provider.borrow_mut() = Some(provider);
    }

    fn fire_node_visibility_changed(&self, view_state: NativeAddr, node: NativeAddr, visible: bool) -> i64 {
        self.fire(view_state, node, FiredValue::Visibility(visible))
    }

    fn fire_node_selection_changed(&self, view_state: NativeAddr, node: NativeAddr, selected: bool) -> i64 {
        self.fire(view_state, node, FiredValue::Selection(selected))
    }

    fn fire_node_opacity_changed(&self, view_state: NativeAddr, node: NativeAddr, opacity: f32) -> i64 {
        self.fire(view_state, node, FiredValue::Opacity(opacity))
    }

    fn fire_node_highlight_color_changed(&self, view_state: NativeAddr, node: NativeAddr, color: u32) -> i64 {
        self.fire(view_state, node, FiredValue::HighlightColor(color))
    }

    fn malloc(&self, size: usize) -> NativeAddr {
        let mut state = self.state.borrow_mut();
        if state.fail_allocations || size == 0 {
            return 0;
        }
        let addr = state.next_addr;
        let stride = (size as NativeAddr).div_ceil(ADDRESS_STRIDE) * ADDRESS_STRIDE;
        state.next_addr += stride.max(ADDRESS_STRIDE);
        state.memory.insert(addr, vec![0; size]);
        state.allocations += 1;
        addr
    }

    fn free(&self, addr: NativeAddr) {
        let mut state = self.state.borrow_mut();
        if state.memory.remove(&addr).is_none() {
            state.invalid_frees += 1;
        }
    }

    fn write_memory(&self, addr: NativeAddr, bytes: &[u8]) -> i64 {
        let mut state = self.state.borrow_mut();
        match state.memory.get_mut(&addr) {
            Some(block) if block.len() >= bytes.len() => {
                block[..bytes.len()].copy_from_slice(bytes);
                STATUS_OK
            }
            Some(_) => ERR_BAD_ARGUMENT,
            None => ERR_NOT_FOUND,
        }
    }

    fn read_memory(&self, addr: NativeAddr, out: &mut [u8]) -> i64 {
        let state = self.state.borrow();
        match state.memory.get(&addr) {
            Some(block) if block.len() >= out.len() => {
                out.copy_from_slice(&block[..out.len()]);
                STATUS_OK
            }
            Some(_) => ERR_BAD_ARGUMENT,
            None => ERR_NOT_FOUND,
        }
    }

    fn create_texture(&self, pixels: NativeAddr, width: u32, height: u32) -> i64 {
        if width == 0 || height == 0 {
            return ERR_BAD_ARGUMENT;
        }
        match self.texture_from_memory(pixels, width, height) {
            Ok(pixels) => self.insert(MockObject::Texture { width, height, pixels, updates: 0 }),
            Err(code) => code,
        }
    }

    fn update_texture(&self, texture: NativeAddr, pixels: NativeAddr, width: u32, height: u32) -> i64 {
        let data = match self.texture_from_memory(pixels, width, height) {
            Ok(data) => data,
            Err(code) => return code,
        };
        let mut state = self.state.borrow_mut();
        match state.objects.get_mut(&texture) {
            Some(MockObject::Texture { width: w, height: h, pixels, updates }) => {
                *w = width;
                *h = height;
                *pixels = data;
                *updates += 1;
                STATUS_OK
            }
            _ => ERR_NOT_FOUND,
        }
    }

    fn delete_texture(&self, texture: NativeAddr) -> i64 {
        self.remove_if(texture, |object| matches!(object, MockObject::Texture { .. }))
    }
}

/// Engine module producing [`MockEngine`] runtimes, with a configurable allocation ceiling.
pub struct MockEngineModule {
    memory_limit: Option<u64>,
    fatal: Option<String>,
    ready: bool,
    attempts: RefCell<Vec<u64>>,
    last_engine: RefCell<Option<Rc<MockEngine>>>,
}

impl Default for MockEngineModule {
    fn default() -> Self {
        Self::new()
    }
}

impl MockEngineModule {
    pub fn new() -> Self {
        Self { memory_limit: None, fatal: None, ready: true, attempts: RefCell::new(Vec::new()), last_engine: RefCell::new(None) }
    }

    /// Budgets above `limit` fail with an allocation error.
    pub fn with_memory_limit(mut self, limit: u64) -> Self {
        self.memory_limit = Some(limit);
        self
    }

    pub fn with_fatal_error(mut self, message: impl Into<String>) -> Self {
        self.fatal = Some(message.into());
        self
    }

    /// The runtime never signals readiness; its signal is dropped instead.
    pub fn never_ready(mut self) -> Self {
        self.ready = false;
        self
    }

    pub fn attempted_budgets(&self) -> Vec<u64> {
        self.attempts.borrow().clone()
    }

    pub fn last_engine(&self) -> Option<Rc<MockEngine>> {
        self.last_engine.borrow().clone()
    }
}

impl EngineModule for MockEngineModule {
    fn name(&self) -> &str {
        "mock"
    }

    fn instantiate(&self, request: &InstantiateRequest<'_>) -> Result<Instantiated, InstantiateError> {
        self.attempts.borrow_mut().push(request.memory_budget);
        if let Some(message) = &self.fatal {
            return Err(InstantiateError::Fatal(message.clone()));
        }
        if self.memory_limit.is_some_and(|limit| request.memory_budget > limit) {
            return Err(InstantiateError::OutOfMemory { budget: request.memory_budget });
        }
        let files = Rc::new(MemoryFileSystem::new(request.file_root));
        let engine = Rc::new(MockEngine::with_budget(files.clone(), request.memory_budget));
        request.sinks.print(&format!("mock runtime instantiated with {} bytes", request.memory_budget));
        *self.last_engine.borrow_mut() = Some(engine.clone());

        let (sender, ready) = oneshot::channel();
        if self.ready {
            let _ = sender.send(());
        } else {
            drop(sender);
        }
        Ok(Instantiated { engine, files, ready })
    }
}

/// Checks a status code from a mock call in tests.
pub fn expect_ok(code: i64) {
    assert!(check_status(code).is_ok(), "native call failed with {code}");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> MockEngine {
        MockEngine::new(Rc::new(MemoryFileSystem::new("/vfs")))
    }

    #[test]
    fn scenes_are_destroyed_when_released_to_zero() {
        let engine = engine();
        let instance = engine.create_instance("client") as NativeAddr;
        let scene = engine.create_scene(instance) as NativeAddr;
        assert_eq!(engine.retain_scene(scene), 2);
        assert_eq!(engine.release_scene(scene), 1);
        assert_eq!(engine.release_scene(scene), 0);
        assert!(!engine.is_live(scene));
        assert_eq!(engine.release_scene(scene), ERR_NOT_FOUND);
    }

    #[test]
    fn locked_scenes_need_the_password() {
        let engine = engine();
        let instance = engine.create_instance("client") as NativeAddr;
        engine.files().write("/vfs/locked.vds", b"locked:secret\nbody").expect("stage");
        assert_eq!(engine.load_scene(instance, "/vfs/locked.vds", None), ERR_WRONG_PASSWORD);
        assert_eq!(engine.load_scene(instance, "/vfs/locked.vds", Some("nope")), ERR_WRONG_PASSWORD);
        assert!(engine.load_scene(instance, "/vfs/locked.vds", Some("secret")) > 0);
        assert_eq!(engine.load_scene(instance, "/vfs/missing.vds", None), ERR_FILE_NOT_FOUND);
    }

    #[test]
    fn memory_round_trips_and_counts_invalid_frees() {
        let engine = engine();
        let addr = engine.malloc(8);
        expect_ok(engine.write_memory(addr, &[1, 2, 3]));
        let mut out = [0u8; 4];
        expect_ok(engine.read_memory(addr, &mut out));
        assert_eq!(out, [1, 2, 3, 0]);
        engine.free(addr);
        engine.free(addr);
        assert_eq!(engine.invalid_frees(), 1);
        assert_eq!(engine.live_allocations(), 0);
        assert_eq!(engine.malloc(0), 0);
    }
}
