//! Token registry: the single owner of native handle validity.
//!
//! Every native object the host creates is tracked here from its create call to its release
//! call. Scenes are reference counted; cameras and renderers hold a reference on the scene
//! they use. Releasing a token twice or using it after release is refused before anything
//! reaches the engine, which has no protection of its own.

use crate::native::{check_handle, check_status, NativeEngine, NativeError, STATUS_LOAD_STARTED};
use crate::sync_bridge::ViewStateSyncBridge;
use crate::token::{CameraToken, EngineToken, MaterialToken, RendererToken, SceneToken, Token, TokenKind};
use crate::vfs::{sandboxed_path, VfsError, VirtualFileSystem};
use std::collections::BTreeMap;
use std::rc::Rc;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("{0} was released or never issued")]
    StaleToken(Token),
    #[error("engine returned address {0} which is already live")]
    DuplicateHandle(Token),
    #[error("{token} is still used by {users} object(s)")]
    InUse { token: Token, users: usize },
    #[error("{0}")]
    Native(#[from] NativeError),
    #[error("staging scene file failed: {0}")]
    Vfs(#[from] VfsError),
    #[error("asynchronous scene load was abandoned by the engine")]
    LoadAbandoned,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Entry {
    Engine { client_id: String },
    Scene { engine: EngineToken, ref_count: usize, source: Option<String> },
    Renderer { engine: EngineToken, scene: Option<SceneToken>, camera: Option<CameraToken> },
    Camera { scene: SceneToken },
    Material { engine: EngineToken },
}

impl Entry {
    fn kind(&self) -> TokenKind {
        match self {
            Entry::Engine { .. } => TokenKind::Engine,
            Entry::Scene { .. } => TokenKind::Scene,
            Entry::Renderer { .. } => TokenKind::Renderer,
            Entry::Camera { .. } => TokenKind::Camera,
            Entry::Material { .. } => TokenKind::Material,
        }
    }
}

/// An asynchronous scene load that the engine accepted and has not finished yet.
#[must_use = "a started scene load must be completed to obtain its token"]
#[derive(Debug)]
pub struct PendingSceneLoad {
    engine: EngineToken,
    path: String,
    receiver: oneshot::Receiver<i64>,
}

impl PendingSceneLoad {
    pub fn path(&self) -> &str {
        &self.path
    }
}

pub struct ResourceRegistry {
    engine: Rc<dyn NativeEngine>,
    files: Rc<dyn VirtualFileSystem>,
    entries: BTreeMap<Token, Entry>,
}

impl ResourceRegistry {
    pub fn new(engine: Rc<dyn NativeEngine>, files: Rc<dyn VirtualFileSystem>) -> Self {
        Self { engine, files, entries: BTreeMap::new() }
    }

    pub fn engine(&self) -> &dyn NativeEngine {
        self.engine.as_ref()
    }

    pub fn is_live(&self, token: Token) -> bool {
        self.entries.contains_key(&token)
    }

    pub fn live_count(&self, kind: TokenKind) -> usize {
        self.entries.keys().filter(|token| token.kind() == kind).count()
    }

    pub fn live_tokens(&self) -> Vec<Token> {
        self.entries.keys().copied().collect()
    }

    pub fn scene_ref_count(&self, scene: SceneToken) -> Option<usize> {
        match self.entries.get(&scene.token()) {
            Some(Entry::Scene { ref_count, .. }) => Some(*ref_count),
            _ => None,
        }
    }

    pub fn scene_source(&self, scene: SceneToken) -> Option<&str> {
        match self.entries.get(&scene.token()) {
            Some(Entry::Scene { source, .. }) => source.as_deref(),
            _ => None,
        }
    }

    pub fn attached_scene(&self, renderer: RendererToken) -> Option<SceneToken> {
        match self.entries.get(&renderer.token()) {
            Some(Entry::Renderer { scene, .. }) => *scene,
            _ => None,
        }
    }

    pub fn renderers(&self) -> Vec<RendererToken> {
        self.tokens_of(TokenKind::Renderer).map(|token| RendererToken::from_address(token.address())).collect()
    }

    pub fn engine_instances(&self) -> Vec<EngineToken> {
        self.tokens_of(TokenKind::Engine).map(|token| EngineToken::from_address(token.address())).collect()
    }

    pub fn scenes(&self) -> Vec<SceneToken> {
        self.tokens_of(TokenKind::Scene).map(|token| SceneToken::from_address(token.address())).collect()
    }

    pub fn cameras(&self) -> Vec<CameraToken> {
        self.tokens_of(TokenKind::Camera).map(|token| CameraToken::from_address(token.address())).collect()
    }

    pub fn materials(&self) -> Vec<MaterialToken> {
        self.tokens_of(TokenKind::Material).map(|token| MaterialToken::from_address(token.address())).collect()
    }

    fn tokens_of(&self, kind: TokenKind) -> impl Iterator<Item = Token> + '_ {
        self.entries.keys().copied().filter(move |token| token.kind() == kind)
    }

    fn ensure_live(&self, token: Token) -> Result<&Entry, RegistryError> {
        match self.entries.get(&token) {
            Some(entry) if entry.kind() == token.kind() => Ok(entry),
            _ => {
                error!(token = %token, "use of a stale token refused");
                Err(RegistryError::StaleToken(token))
            }
        }
    }

    /// Records a freshly created native object. An address that is already live means the
    /// engine handed out the same object twice; the registry refuses to issue it again.
    fn issue(&mut self, kind: TokenKind, code: i64, entry: Entry) -> Result<Token, RegistryError> {
        let address = check_handle(code)?;
        let token = Token::new(kind, address);
        if self.entries.keys().any(|live| live.address() == address) {
            error!(token = %token, "engine returned an address that is already live");
            return Err(RegistryError::DuplicateHandle(token));
        }
        self.entries.insert(token, entry);
        debug!(token = %token, "issued token");
        Ok(token)
    }

    pub fn create_engine_instance(&mut self, client_id: &str) -> Result<EngineToken, RegistryError> {
        let code = self.engine.create_instance(client_id);
        let token = self.issue(TokenKind::Engine, code, Entry::Engine { client_id: client_id.to_string() })?;
        info!(token = %token, client_id, "engine instance created");
        Ok(EngineToken::from_address(token.address()))
    }

    /// Destroys an engine instance; refused while objects created from it are alive.
    pub fn destroy_engine_instance(&mut self, engine: EngineToken) -> Result<(), RegistryError> {
        self.ensure_live(engine.token())?;
        let users = self
            .entries
            .values()
            .filter(|entry| match entry {
                Entry::Scene { engine: owner, .. }
                | Entry::Renderer { engine: owner, .. }
                | Entry::Material { engine: owner } => *owner == engine,
                _ => false,
            })
            .count();
        if users > 0 {
            return Err(RegistryError::InUse { token: engine.token(), users });
        }
        check_status(self.engine.destroy_instance(engine.address()))?;
        self.entries.remove(&engine.token());
        info!(token = %engine, "engine instance destroyed");
        Ok(())
    }

    pub fn create_scene(&mut self, engine: EngineToken) -> Result<SceneToken, RegistryError> {
        self.ensure_live(engine.token())?;
        let code = self.engine.create_scene(engine.address());
        let token = self.issue(TokenKind::Scene, code, Entry::Scene { engine, ref_count: 1, source: None })?;
        Ok(SceneToken::from_address(token.address()))
    }

    /// Loads a scene from a path inside the engine's file system.
    pub fn load_scene(
        &mut self,
        engine: EngineToken,
        path: &str,
        password: Option<&str>,
    ) -> Result<SceneToken, RegistryError> {
        self.ensure_live(engine.token())?;
        let code = self.engine.load_scene(engine.address(), path, password);
        if code < 0 {
            warn!(path, code, "scene load failed");
        }
        let entry = Entry::Scene { engine, ref_count: 1, source: Some(path.to_string()) };
        let token = self.issue(TokenKind::Scene, code, entry)?;
        info!(token = %token, path, "scene loaded");
        Ok(SceneToken::from_address(token.address()))
    }

    /// Stages `bytes` under `name` in the sandbox, loads the scene by path and removes the
    /// staged copy again, whatever the outcome.
    pub fn load_scene_bytes(
        &mut self,
        engine: EngineToken,
        name: &str,
        bytes: &[u8],
        password: Option<&str>,
    ) -> Result<SceneToken, RegistryError> {
        self.ensure_live(engine.token())?;
        let path = sandboxed_path(self.files.root(), name)?;
        self.files.delete(&path)?;
        self.files.write(&path, bytes)?;
        let result = self.load_scene(engine, &path, password);
        if let Err(err) = self.files.delete(&path) {
            warn!(path, %err, "failed to remove staged scene file");
        }
        result
    }

    /// Starts an asynchronous load. Refusals are reported right away; otherwise the result
    /// arrives through [`ResourceRegistry::complete_scene_load`].
    pub fn load_scene_async(
        &mut self,
        engine: EngineToken,
        path: &str,
        password: Option<&str>,
    ) -> Result<PendingSceneLoad, RegistryError> {
        self.ensure_live(engine.token())?;
        let (sender, receiver) = oneshot::channel();
        let completion = Box::new(move |code: i64| {
            let _ = sender.send(code);
        });
        let status = self.engine.begin_scene_load(engine.address(), path, password, completion);
        match check_status(status)? {
            STATUS_LOAD_STARTED => {
                debug!(path, "asynchronous scene load started");
                Ok(PendingSceneLoad { engine, path: path.to_string(), receiver })
            }
            other => {
                warn!(path, status = other, "engine did not start the asynchronous load");
                Err(RegistryError::Native(NativeError::Unknown(other)))
            }
        }
    }

    pub async fn complete_scene_load(&mut self, pending: PendingSceneLoad) -> Result<SceneToken, RegistryError> {
        let PendingSceneLoad { engine, path, receiver } = pending;
        let code = receiver.await.map_err(|_| RegistryError::LoadAbandoned)?;
        self.ensure_live(engine.token())?;
        let entry = Entry::Scene { engine, ref_count: 1, source: Some(path.clone()) };
        let token = self.issue(TokenKind::Scene, code, entry)?;
        info!(token = %token, path, "scene loaded asynchronously");
        Ok(SceneToken::from_address(token.address()))
    }

    pub fn retain_scene(&mut self, scene: SceneToken) -> Result<usize, RegistryError> {
        self.ensure_live(scene.token())?;
        check_status(self.engine.retain_scene(scene.address()))?;
        match self.entries.get_mut(&scene.token()) {
            Some(Entry::Scene { ref_count, .. }) => {
                *ref_count += 1;
                Ok(*ref_count)
            }
            _ => Err(RegistryError::StaleToken(scene.token())),
        }
    }

    /// Drops one reference. At zero the engine destroys the scene and the token dies.
    pub fn release_scene(&mut self, scene: SceneToken) -> Result<usize, RegistryError> {
        self.ensure_live(scene.token())?;
        let native_remaining = check_status(self.engine.release_scene(scene.address()))?;
        let remaining = match self.entries.get_mut(&scene.token()) {
            Some(Entry::Scene { ref_count, .. }) => {
                *ref_count -= 1;
                *ref_count
            }
            _ => return Err(RegistryError::StaleToken(scene.token())),
        };
        if native_remaining as usize != remaining {
            warn!(token = %scene, native_remaining, remaining, "scene reference counts disagree");
        }
        if remaining == 0 {
            self.entries.remove(&scene.token());
            debug!(token = %scene, "scene destroyed");
        }
        Ok(remaining)
    }

    pub fn create_renderer(&mut self, engine: EngineToken) -> Result<RendererToken, RegistryError> {
        self.ensure_live(engine.token())?;
        let code = self.engine.create_renderer(engine.address());
        let entry = Entry::Renderer { engine, scene: None, camera: None };
        let token = self.issue(TokenKind::Renderer, code, entry)?;
        info!(token = %token, "renderer created");
        Ok(RendererToken::from_address(token.address()))
    }

    /// Attaches `scene` (or nothing) to `renderer`. The renderer holds one reference on its
    /// scene; the previous scene is released.
    pub fn attach_scene(&mut self, renderer: RendererToken, scene: Option<SceneToken>) -> Result<(), RegistryError> {
        let previous = match self.ensure_live(renderer.token())? {
            Entry::Renderer { scene, .. } => *scene,
            _ => return Err(RegistryError::StaleToken(renderer.token())),
        };
        if previous == scene {
            return Ok(());
        }
        if let Some(scene) = scene {
            self.retain_scene(scene)?;
        }
        if let Err(err) = check_status(self.engine.attach_scene(renderer.address(), scene.map(|s| s.address()))) {
            if let Some(scene) = scene {
                if let Err(rollback) = self.release_scene(scene) {
                    warn!(token = %scene, %rollback, "failed to release scene after attach failure");
                }
            }
            return Err(err.into());
        }
        if let Some(Entry::Renderer { scene: attached, camera, .. }) = self.entries.get_mut(&renderer.token()) {
            *attached = scene;
            *camera = None;
        }
        if let Some(previous) = previous {
            self.release_scene(previous)?;
        }
        Ok(())
    }

    /// Deletes a renderer. View-state sync is detached first, then the attached scene is
    /// released and the native renderer destroyed.
    pub fn delete_renderer(
        &mut self,
        renderer: RendererToken,
        bridge: &ViewStateSyncBridge,
    ) -> Result<(), RegistryError> {
        self.ensure_live(renderer.token())?;
        if bridge.detach_renderer(renderer) {
            debug!(token = %renderer, "detached view-state sync before deleting renderer");
        }
        if self.attached_scene(renderer).is_some() {
            self.attach_scene(renderer, None)?;
        }
        check_status(self.engine.delete_renderer(renderer.address()))?;
        self.entries.remove(&renderer.token());
        info!(token = %renderer, "renderer deleted");
        Ok(())
    }

    /// Creates a camera in `scene`; the camera keeps the scene alive until it is deleted.
    pub fn create_camera(&mut self, scene: SceneToken) -> Result<CameraToken, RegistryError> {
        self.ensure_live(scene.token())?;
        let code = self.engine.create_camera(scene.address());
        let token = self.issue(TokenKind::Camera, code, Entry::Camera { scene })?;
        if let Err(err) = self.retain_scene(scene) {
            self.entries.remove(&token);
            if let Err(rollback) = check_status(self.engine.delete_camera(token.address())) {
                warn!(token = %token, %rollback, "failed to delete camera after retain failure");
            }
            return Err(err);
        }
        Ok(CameraToken::from_address(token.address()))
    }

    pub fn delete_camera(&mut self, camera: CameraToken) -> Result<(), RegistryError> {
        let scene = match self.ensure_live(camera.token())? {
            Entry::Camera { scene } => *scene,
            _ => return Err(RegistryError::StaleToken(camera.token())),
        };
        for entry in self.entries.values_mut() {
            if let Entry::Renderer { camera: active, .. } = entry {
                if *active == Some(camera) {
                    *active = None;
                }
            }
        }
        check_status(self.engine.delete_camera(camera.address()))?;
        self.entries.remove(&camera.token());
        self.release_scene(scene)?;
        Ok(())
    }

    pub fn activate_camera(&mut self, renderer: RendererToken, camera: Option<CameraToken>) -> Result<(), RegistryError> {
        self.ensure_live(renderer.token())?;
        if let Some(camera) = camera {
            self.ensure_live(camera.token())?;
        }
        check_status(self.engine.activate_camera(renderer.address(), camera.map(|c| c.address())))?;
        if let Some(Entry::Renderer { camera: active, .. }) = self.entries.get_mut(&renderer.token()) {
            *active = camera;
        }
        Ok(())
    }

    pub fn active_camera(&self, renderer: RendererToken) -> Option<CameraToken> {
        match self.entries.get(&renderer.token()) {
            Some(Entry::Renderer { camera, .. }) => *camera,
            _ => None,
        }
    }

    pub fn create_material(&mut self, engine: EngineToken) -> Result<MaterialToken, RegistryError> {
        self.ensure_live(engine.token())?;
        let code = self.engine.create_material(engine.address());
        let token = self.issue(TokenKind::Material, code, Entry::Material { engine })?;
        Ok(MaterialToken::from_address(token.address()))
    }

    pub fn delete_material(&mut self, material: MaterialToken) -> Result<(), RegistryError> {
        self.ensure_live(material.token())?;
        check_status(self.engine.delete_material(material.address()))?;
        self.entries.remove(&material.token());
        Ok(())
    }

    pub fn client_id(&self, engine: EngineToken) -> Option<&str> {
        match self.entries.get(&engine.token()) {
            Some(Entry::Engine { client_id }) => Some(client_id.as_str()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::mock::{expect_ok, MockEngine, MockObject};
    use crate::vfs::MemoryFileSystem;

    fn fixture() -> (Rc<MockEngine>, ResourceRegistry, Rc<ViewStateSyncBridge>) {
        let files = Rc::new(MemoryFileSystem::new("/vfs"));
        let engine = Rc::new(MockEngine::new(files.clone()));
        let registry = ResourceRegistry::new(engine.clone(), files);
        let bridge = ViewStateSyncBridge::new(engine.clone());
        (engine, registry, bridge)
    }

    #[test]
    fn released_scene_tokens_are_refused() {
        let (engine, mut registry, _) = fixture();
        let instance = registry.create_engine_instance("client").expect("instance");
        let scene = registry.create_scene(instance).expect("scene");
        assert_eq!(registry.release_scene(scene).expect("release"), 0);
        assert!(!engine.is_live(scene.address()));
        assert_eq!(registry.release_scene(scene), Err(RegistryError::StaleToken(scene.token())));
        assert_eq!(registry.retain_scene(scene), Err(RegistryError::StaleToken(scene.token())));
    }

    #[test]
    fn negative_codes_win_over_handles() {
        let (engine, mut registry, _) = fixture();
        let instance = registry.create_engine_instance("client").expect("instance");
        engine.fail_next_create(-4);
        assert_eq!(registry.create_scene(instance), Err(RegistryError::Native(NativeError::OutOfMemory)));
        assert_eq!(registry.live_count(TokenKind::Scene), 0);
    }

    #[test]
    fn live_addresses_are_never_issued_twice() {
        let (engine, mut registry, _) = fixture();
        let instance = registry.create_engine_instance("client").expect("instance");
        let scene = registry.create_scene(instance).expect("scene");
        engine.reuse_address_once(scene.address());
        let err = registry.create_renderer(instance).unwrap_err();
        assert_eq!(err, RegistryError::DuplicateHandle(Token::new(TokenKind::Renderer, scene.address())));
        assert_eq!(registry.live_count(TokenKind::Renderer), 0);
    }

    #[test]
    fn renderer_and_camera_hold_scene_references() {
        let (engine, mut registry, bridge) = fixture();
        let instance = registry.create_engine_instance("client").expect("instance");
        let renderer = registry.create_renderer(instance).expect("renderer");
        let scene = registry.create_scene(instance).expect("scene");
        registry.attach_scene(renderer, Some(scene)).expect("attach");
        let camera = registry.create_camera(scene).expect("camera");
        registry.activate_camera(renderer, Some(camera)).expect("activate");
        assert_eq!(registry.scene_ref_count(scene), Some(3));
        assert_eq!(engine.scene_ref_count(scene.address()), Some(3));

        registry.release_scene(scene).expect("drop creator reference");
        registry.delete_camera(camera).expect("delete camera");
        assert_eq!(registry.active_camera(renderer), None);
        assert_eq!(registry.scene_ref_count(scene), Some(1));
        registry.delete_renderer(renderer, &bridge).expect("delete renderer");
        assert!(!registry.is_live(scene.token()));
        assert_eq!(engine.live_scenes(), 0);
    }

    #[test]
    fn failed_attach_gives_the_scene_reference_back() {
        let (engine, mut registry, _) = fixture();
        let instance = registry.create_engine_instance("client").expect("instance");
        let renderer = registry.create_renderer(instance).expect("renderer");
        let scene = registry.create_scene(instance).expect("scene");
        expect_ok(engine.delete_renderer(renderer.address()));

        let err = registry.attach_scene(renderer, Some(scene)).unwrap_err();
        assert_eq!(err, RegistryError::Native(NativeError::NotFound));
        assert_eq!(registry.scene_ref_count(scene), Some(1));
        assert_eq!(engine.scene_ref_count(scene.address()), Some(1));
        assert_eq!(registry.attached_scene(renderer), None);
    }

    #[test]
    fn attach_retains_before_the_engine_sees_the_scene() {
        let (engine, mut registry, _) = fixture();
        let instance = registry.create_engine_instance("client").expect("instance");
        let renderer = registry.create_renderer(instance).expect("renderer");
        let scene = registry.create_scene(instance).expect("scene");
        engine.fail_next_retain(-4);

        let err = registry.attach_scene(renderer, Some(scene)).unwrap_err();
        assert_eq!(err, RegistryError::Native(NativeError::OutOfMemory));
        assert!(matches!(engine.object(renderer.address()), Some(MockObject::Renderer { scene: None, .. })));
        assert_eq!(registry.scene_ref_count(scene), Some(1));
    }

    #[test]
    fn camera_is_deleted_when_its_scene_cannot_be_retained() {
        let (engine, mut registry, _) = fixture();
        let instance = registry.create_engine_instance("client").expect("instance");
        let scene = registry.create_scene(instance).expect("scene");
        engine.fail_next_retain(-4);

        let err = registry.create_camera(scene).unwrap_err();
        assert_eq!(err, RegistryError::Native(NativeError::OutOfMemory));
        assert_eq!(registry.live_count(TokenKind::Camera), 0);
        assert_eq!(engine.live_cameras(), 0);
        assert_eq!(engine.scene_ref_count(scene.address()), Some(1));
    }

    #[test]
    fn engine_instance_outlives_its_objects() {
        let (_, mut registry, bridge) = fixture();
        let instance = registry.create_engine_instance("client").expect("instance");
        let renderer = registry.create_renderer(instance).expect("renderer");
        let err = registry.destroy_engine_instance(instance).unwrap_err();
        assert!(matches!(err, RegistryError::InUse { users: 1, .. }));
        registry.delete_renderer(renderer, &bridge).expect("delete renderer");
        registry.destroy_engine_instance(instance).expect("destroy");
        assert!(registry.live_tokens().is_empty());
    }

    #[test]
    fn staged_scene_files_are_cleaned_up() {
        let (engine, mut registry, _) = fixture();
        let instance = registry.create_engine_instance("client").expect("instance");
        let scene = registry.load_scene_bytes(instance, "model.vds", b"scene-bytes", None).expect("load");
        assert_eq!(registry.scene_source(scene), Some("/vfs/model.vds"));
        assert!(engine.files().is_empty());

        let err = registry.load_scene_bytes(instance, "locked.vds", b"locked:pw\n", Some("bad")).unwrap_err();
        assert_eq!(err, RegistryError::Native(NativeError::WrongPassword));
        assert!(engine.files().is_empty());
    }
}
