//! The `viewer_bridge` demo run: bootstrap an engine, load a scene, attach host view state,
//! upload a status label, render a few frames and tear everything down.

use crate::bootstrap::{create_runtime, DiagnosticSinks, EngineModule};
use crate::config::{BridgeConfig, BridgeConfigOverrides};
use crate::native::dynamic::DynamicEngineModule;
use crate::native::mock::MockEngineModule;
use crate::session::{EngineSession, SessionOptions, ShutdownReport};
use crate::texture::{ImageContext, TextureContent, TextureInfo, TextureTarget};
use crate::token::{EngineToken, SceneToken};
use crate::view_state::{BasicViewStateManager, SharedViewStateManager};
use anyhow::{bail, Context, Result};
use std::fs;
use std::path::Path;
use tracing::info;

pub const DEFAULT_CONFIG_PATH: &str = "config/bridge.json";

#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub module: String,
    pub memory_budget: u64,
    pub bootstrap_attempts: u32,
    pub scene_source: Option<String>,
    pub label: TextureInfo,
    pub frames_ticked: u32,
    pub frames_rendered: usize,
    pub shutdown: ShutdownReport,
}

pub async fn run() -> Result<RunSummary> {
    run_with_overrides(BridgeConfigOverrides::default()).await
}

pub async fn run_with_overrides(overrides: BridgeConfigOverrides) -> Result<RunSummary> {
    let mut config = BridgeConfig::load_or_default(DEFAULT_CONFIG_PATH);
    if !overrides.is_empty() {
        info!(fields = ?overrides.applied_fields(), "applying command line overrides");
    }
    config.apply_overrides(&overrides);
    run_with_config(&config).await
}

pub async fn run_with_config(config: &BridgeConfig) -> Result<RunSummary> {
    let module: Box<dyn EngineModule> = match &config.runtime.engine_library {
        Some(path) => Box::new(DynamicEngineModule::load(path)?),
        None => Box::new(MockEngineModule::new()),
    };
    let options = config.runtime.runtime_options(DiagnosticSinks::default());
    let handle = create_runtime(module.as_ref(), options)
        .await
        .with_context(|| format!("bootstrapping engine module '{}'", module.name()))?;
    let bootstrap_attempts = handle.report().attempt_count();
    let memory_budget = handle.memory_budget();

    let context = graphics_context(config)?;
    let session_options = SessionOptions {
        client_id: config.runtime.client_id.clone(),
        textures: config.textures.pipeline_config(),
        start_loops: config.render.start_loops,
    };
    let mut session = EngineSession::open(handle, Box::new(context), session_options)?;
    let instance = session.instance();

    let renderer = session.create_renderer()?;
    let scene = open_scene(&mut session, instance, config)?;
    let scene_source = session.registry().scene_source(scene).map(str::to_string);
    session.registry_mut().attach_scene(renderer, Some(scene))?;
    // The renderer holds its own reference now.
    session.registry_mut().release_scene(scene)?;
    let camera = session.registry_mut().create_camera(scene)?;
    session.registry_mut().activate_camera(renderer, Some(camera))?;

    let manager: SharedViewStateManager = BasicViewStateManager::new().shared();
    session.set_view_state_manager(renderer, Some(manager))?;

    let mut style = config.textures.label.clone();
    style.text = format!("{}\n{} MiB", session.handle().module(), memory_budget / (1024 * 1024));
    let label = session.textures_mut().upload(TextureTarget::New, &TextureContent::Label(style))?;
    session.queue().queue_command(renderer, move || {
        info!(texture = %label.texture, width = label.width, height = label.height, "status label ready");
    });
    session.queue().start_render_loop(renderer);

    let mut frames_rendered = 0;
    for _ in 0..config.render.frames {
        frames_rendered += session.tick();
    }

    let module = session.handle().module().to_string();
    let shutdown = session.shutdown()?;
    Ok(RunSummary {
        module,
        memory_budget,
        bootstrap_attempts,
        scene_source,
        label,
        frames_ticked: config.render.frames,
        frames_rendered,
        shutdown,
    })
}

fn graphics_context(config: &BridgeConfig) -> Result<ImageContext> {
    let max = config.textures.max_texture_size;
    match &config.textures.font_path {
        Some(path) => {
            let bytes = fs::read(path).with_context(|| format!("Failed to read font {}", path.display()))?;
            match ImageContext::with_font_bytes(max, bytes) {
                Some(context) => Ok(context),
                None => bail!("Font {} is not a usable TrueType/OpenType file", path.display()),
            }
        }
        None => Ok(ImageContext::new(max)),
    }
}

fn open_scene(session: &mut EngineSession, instance: EngineToken, config: &BridgeConfig) -> Result<SceneToken> {
    let Some(path) = &config.scene.path else {
        return Ok(session.registry_mut().create_scene(instance)?);
    };
    let bytes = fs::read(path).with_context(|| format!("Failed to read scene file {}", path.display()))?;
    let name = staged_name(path);
    let scene = session
        .registry_mut()
        .load_scene_bytes(instance, &name, &bytes, config.scene.password.as_deref())
        .with_context(|| format!("loading scene {}", path.display()))?;
    Ok(scene)
}

fn staged_name(path: &Path) -> String {
    path.file_name().map(|name| name.to_string_lossy().into_owned()).unwrap_or_else(|| "scene.bin".to_string())
}
