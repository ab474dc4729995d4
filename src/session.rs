//! One engine instance together with the components that manage its objects.

use crate::bootstrap::EngineHandle;
use crate::registry::{RegistryError, ResourceRegistry};
use crate::render_queue::RenderCommandQueue;
use crate::sync_bridge::{SyncError, ViewStateSyncBridge};
use crate::texture::canvas::GraphicsContext;
use crate::texture::{TextureConfig, TextureUploadPipeline};
use crate::token::{EngineToken, RendererToken};
use crate::view_state::SharedViewStateManager;
use std::rc::Rc;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub client_id: String,
    pub textures: TextureConfig,
    /// Schedule the render loop of every renderer as soon as it is created.
    pub start_loops: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self { client_id: "viewer".to_string(), textures: TextureConfig::default(), start_loops: true }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub renderers: usize,
    pub cameras: usize,
    pub materials: usize,
    pub scenes: usize,
    pub textures: usize,
    pub discarded_commands: usize,
}

pub struct EngineSession {
    handle: EngineHandle,
    registry: ResourceRegistry,
    bridge: Rc<ViewStateSyncBridge>,
    textures: TextureUploadPipeline,
    queue: Rc<RenderCommandQueue>,
    instance: EngineToken,
    start_loops: bool,
}

impl EngineSession {
    pub fn open(
        handle: EngineHandle,
        context: Box<dyn GraphicsContext>,
        options: SessionOptions,
    ) -> Result<Self, RegistryError> {
        let mut registry = ResourceRegistry::new(handle.engine(), handle.files());
        let instance = registry.create_engine_instance(&options.client_id)?;
        let bridge = ViewStateSyncBridge::new(handle.engine());
        let textures = TextureUploadPipeline::new(handle.engine(), context, options.textures);
        info!(module = handle.module(), instance = %instance, "engine session opened");
        Ok(Self {
            handle,
            registry,
            bridge,
            textures,
            queue: Rc::new(RenderCommandQueue::new()),
            instance,
            start_loops: options.start_loops,
        })
    }

    pub fn handle(&self) -> &EngineHandle {
        &self.handle
    }

    pub fn instance(&self) -> EngineToken {
        self.instance
    }

    pub fn registry(&self) -> &ResourceRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut ResourceRegistry {
        &mut self.registry
    }

    pub fn bridge(&self) -> &Rc<ViewStateSyncBridge> {
        &self.bridge
    }

    pub fn textures(&self) -> &TextureUploadPipeline {
        &self.textures
    }

    pub fn textures_mut(&mut self) -> &mut TextureUploadPipeline {
        &mut self.textures
    }

    pub fn queue(&self) -> &Rc<RenderCommandQueue> {
        &self.queue
    }

    pub fn create_renderer(&mut self) -> Result<RendererToken, RegistryError> {
        let renderer = self.registry.create_renderer(self.instance)?;
        if self.start_loops {
            self.queue.start_render_loop(renderer);
        }
        Ok(renderer)
    }

    pub fn set_view_state_manager(
        &self,
        renderer: RendererToken,
        manager: Option<SharedViewStateManager>,
    ) -> Result<(), SyncError> {
        self.bridge.set_view_state_manager(&self.registry, renderer, manager)
    }

    /// Stops the renderer's loop, drops its queued commands and deletes it.
    pub fn delete_renderer(&mut self, renderer: RendererToken) -> Result<usize, RegistryError> {
        self.queue.stop_render_loop(renderer);
        let discarded = self.queue.discard(renderer);
        if discarded > 0 {
            warn!(renderer = %renderer, discarded, "dropping queued commands of deleted renderer");
        }
        self.registry.delete_renderer(renderer, &self.bridge)?;
        Ok(discarded)
    }

    pub fn tick(&self) -> usize {
        self.queue.tick(&self.registry)
    }

    /// Releases everything the session created, renderers first and the engine instance
    /// last.
    pub fn shutdown(mut self) -> Result<ShutdownReport, RegistryError> {
        let mut report = ShutdownReport::default();
        for renderer in self.registry.renderers() {
            report.discarded_commands += self.delete_renderer(renderer)?;
            report.renderers += 1;
        }
        report.textures = self.textures.live_textures().len();
        self.textures.clear();
        for camera in self.registry.cameras() {
            self.registry.delete_camera(camera)?;
            report.cameras += 1;
        }
        for material in self.registry.materials() {
            self.registry.delete_material(material)?;
            report.materials += 1;
        }
        for scene in self.registry.scenes() {
            while self.registry.release_scene(scene)? > 0 {}
            report.scenes += 1;
        }
        self.registry.destroy_engine_instance(self.instance)?;
        info!(?report, "engine session shut down");
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::{create_runtime, RuntimeOptions};
    use crate::native::mock::MockEngineModule;
    use crate::texture::{ImageContext, TextureContent, TextureTarget};
    use crate::token::TokenKind;
    use crate::view_state::BasicViewStateManager;
    use pollster::block_on;

    #[test]
    fn shutdown_releases_everything_in_order() {
        let module = MockEngineModule::new();
        let handle = block_on(create_runtime(&module, RuntimeOptions::default())).expect("runtime");
        let engine = module.last_engine().expect("engine");
        let mut session =
            EngineSession::open(handle, Box::new(ImageContext::new(512)), SessionOptions::default()).expect("session");

        let renderer = session.create_renderer().expect("renderer");
        let instance = session.instance();
        let scene = session.registry_mut().create_scene(instance).expect("scene");
        session.registry_mut().attach_scene(renderer, Some(scene)).expect("attach");
        let camera = session.registry_mut().create_camera(scene).expect("camera");
        session.registry_mut().activate_camera(renderer, Some(camera)).expect("activate");
        session.registry_mut().create_material(instance).expect("material");
        let manager: SharedViewStateManager = BasicViewStateManager::new().shared();
        session.set_view_state_manager(renderer, Some(manager)).expect("attach manager");
        session
            .textures_mut()
            .upload(TextureTarget::New, &TextureContent::Markup("<b>ok</b>".to_string()))
            .expect("texture");
        session.queue().queue_command(renderer, || {});
        session.queue().stop_render_loop(renderer);

        let report = session.shutdown().expect("shutdown");
        assert_eq!(
            report,
            ShutdownReport { renderers: 1, cameras: 1, materials: 1, scenes: 1, textures: 1, discarded_commands: 1 }
        );
        assert_eq!(engine.deleted_with_bound_view_state(), 0);
        assert_eq!(engine.live_view_states(), 0);
        assert_eq!(engine.live_scenes(), 0);
        assert_eq!(engine.live_textures(), 0);
        assert_eq!(engine.live_allocations(), 0);
    }

    #[test]
    fn renderers_start_rendering_when_loops_auto_start() {
        let module = MockEngineModule::new();
        let handle = block_on(create_runtime(&module, RuntimeOptions::default())).expect("runtime");
        let mut session =
            EngineSession::open(handle, Box::new(ImageContext::new(512)), SessionOptions::default()).expect("session");
        let renderer = session.create_renderer().expect("renderer");
        assert_eq!(session.tick(), 1);
        assert_eq!(session.queue().stats(renderer).frames_rendered, 1);
        session.delete_renderer(renderer).expect("delete");
        assert_eq!(session.tick(), 0);
        assert_eq!(session.registry().live_count(TokenKind::Renderer), 0);
    }
}
