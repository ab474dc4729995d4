use crate::bootstrap::{DiagnosticSinks, RuntimeOptions, DEFAULT_FILE_ROOT};
use crate::texture::label::LabelStyle;
use crate::texture::markup::MarkupStyle;
use crate::texture::TextureConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;
use uuid::Uuid;

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "RuntimeConfig::default_memory_budget_mb")]
    pub memory_budget_mb: u64,
    #[serde(default = "RuntimeConfig::default_memory_step_mb")]
    pub memory_step_mb: u64,
    #[serde(default = "RuntimeConfig::default_file_root")]
    pub file_root: String,
    /// Client id handed to the engine instance; a fresh one per run when unset.
    #[serde(default = "RuntimeConfig::default_client_id")]
    pub client_id: String,
    /// Shared engine library; the built-in mock engine is used when unset.
    #[serde(default)]
    pub engine_library: Option<PathBuf>,
}

impl RuntimeConfig {
    const fn default_memory_budget_mb() -> u64 {
        128
    }

    const fn default_memory_step_mb() -> u64 {
        16
    }

    fn default_file_root() -> String {
        DEFAULT_FILE_ROOT.to_string()
    }

    fn default_client_id() -> String {
        format!("viewer-{}", Uuid::new_v4())
    }

    pub fn runtime_options(&self, sinks: DiagnosticSinks) -> RuntimeOptions {
        RuntimeOptions {
            memory_budget: self.memory_budget_mb.saturating_mul(MIB),
            memory_step: self.memory_step_mb.saturating_mul(MIB),
            file_root: self.file_root.clone(),
            sinks,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            memory_budget_mb: Self::default_memory_budget_mb(),
            memory_step_mb: Self::default_memory_step_mb(),
            file_root: Self::default_file_root(),
            client_id: Self::default_client_id(),
            engine_library: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TexturesConfig {
    #[serde(default = "TexturesConfig::default_max_texture_size")]
    pub max_texture_size: u32,
    /// TrueType font used to draw label text; labels are sized but not drawn without one.
    #[serde(default)]
    pub font_path: Option<PathBuf>,
    #[serde(default)]
    pub label: LabelStyle,
    #[serde(default)]
    pub markup: MarkupStyle,
}

impl TexturesConfig {
    const fn default_max_texture_size() -> u32 {
        2048
    }

    pub fn pipeline_config(&self) -> TextureConfig {
        TextureConfig { max_texture_size: self.max_texture_size, markup: self.markup.clone() }
    }
}

impl Default for TexturesConfig {
    fn default() -> Self {
        Self {
            max_texture_size: Self::default_max_texture_size(),
            font_path: None,
            label: LabelStyle::default(),
            markup: MarkupStyle::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderConfig {
    #[serde(default = "RenderConfig::default_start_loops")]
    pub start_loops: bool,
    #[serde(default = "RenderConfig::default_frames")]
    pub frames: u32,
}

impl RenderConfig {
    const fn default_start_loops() -> bool {
        true
    }

    const fn default_frames() -> u32 {
        3
    }
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self { start_loops: Self::default_start_loops(), frames: Self::default_frames() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SceneConfig {
    #[serde(default)]
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub password: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub textures: TexturesConfig,
    #[serde(default)]
    pub render: RenderConfig,
    #[serde(default)]
    pub scene: SceneConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BridgeConfigOverrides {
    pub memory_mb: Option<u64>,
    pub max_texture: Option<u32>,
    pub engine: Option<PathBuf>,
    pub frames: Option<u32>,
    pub scene: Option<PathBuf>,
}

impl BridgeConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path).with_context(|| format!("Failed to read config file {}", path.display()))?;
        let cfg = serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(cfg)
    }

    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        match Self::load(path) {
            Ok(cfg) => cfg,
            Err(err) => {
                warn!("Config load error: {err:#}. Falling back to defaults.");
                Self::default()
            }
        }
    }

    pub fn apply_overrides(&mut self, overrides: &BridgeConfigOverrides) {
        if let Some(memory_mb) = overrides.memory_mb {
            self.runtime.memory_budget_mb = memory_mb;
        }
        if let Some(max_texture) = overrides.max_texture {
            self.textures.max_texture_size = max_texture;
        }
        if let Some(engine) = &overrides.engine {
            self.runtime.engine_library = Some(engine.clone());
        }
        if let Some(frames) = overrides.frames {
            self.render.frames = frames;
        }
        if let Some(scene) = &overrides.scene {
            self.scene.path = Some(scene.clone());
        }
    }
}

impl BridgeConfigOverrides {
    pub fn is_empty(&self) -> bool {
        self.applied_fields().is_empty()
    }

    pub fn applied_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.memory_mb.is_some() {
            fields.push("memory_mb");
        }
        if self.max_texture.is_some() {
            fields.push("max_texture");
        }
        if self.engine.is_some() {
            fields.push("engine");
        }
        if self.frames.is_some() {
            fields.push("frames");
        }
        if self.scene.is_some() {
            fields.push("scene");
        }
        fields
    }
}
