//! Host content rasterized into engine textures.
//!
//! Every upload follows the same path: rasterize into a transparent power-of-two surface,
//! copy the pixels into a transient engine allocation, then create or update the native
//! texture. The allocation is an RAII guard, so it is released on every exit path, and a
//! failed upload never touches the target texture.

pub mod canvas;
pub mod label;
pub mod markup;
pub mod sizing;

use crate::native::{check_handle, check_status, NativeAllocation, NativeEngine, NativeError};
use crate::token::TextureToken;
use canvas::GraphicsContext;
use glam::Vec2;
use image::{imageops, ImageFormat};
use label::LabelStyle;
use markup::{MarkupDocument, MarkupStyle};
use serde::{Deserialize, Serialize};
use sizing::{fit_content, floor_pow2, TextureLayout};
use std::collections::BTreeMap;
use std::rc::Rc;
use thiserror::Error;
use tracing::{debug, warn};

pub use canvas::{FontSpec, ImageContext, Surface, TextMetrics};
pub use label::TextAlign;

#[derive(Debug, Error)]
pub enum TextureError {
    #[error("unsupported image mime type '{0}'")]
    UnsupportedMime(String),
    #[error("image decode failed: {0}")]
    Decode(#[from] image::ImageError),
    #[error("content has nothing to draw")]
    EmptyContent,
    #[error("texture {0} is not owned by this pipeline")]
    UnknownTexture(TextureToken),
    #[error("{0}")]
    Native(#[from] NativeError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum TextureContent {
    Image { bytes: Vec<u8>, mime: String },
    Label(LabelStyle),
    /// Annotation markup, see [`markup`].
    Markup(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextureTarget {
    New,
    Update(TextureToken),
}

/// Normalized texture coordinates of the content rectangle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UvRect {
    pub min: Vec2,
    pub max: Vec2,
}

impl UvRect {
    pub fn area(&self) -> f32 {
        let extent = self.max - self.min;
        extent.x * extent.y
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TextureInfo {
    pub texture: TextureToken,
    pub width: u32,
    pub height: u32,
    pub content_width: u32,
    pub content_height: u32,
    pub uv: UvRect,
    /// Downscale applied to fit the size limit; `1.0` when none was needed.
    pub scale: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TextureConfig {
    /// Upper bound on texture edges, further limited by the graphics context.
    pub max_texture_size: u32,
    pub markup: MarkupStyle,
}

impl Default for TextureConfig {
    fn default() -> Self {
        Self { max_texture_size: 2048, markup: MarkupStyle::default() }
    }
}

struct Raster {
    layout: TextureLayout,
    pixels: Vec<u8>,
}

pub struct TextureUploadPipeline {
    engine: Rc<dyn NativeEngine>,
    context: Box<dyn GraphicsContext>,
    config: TextureConfig,
    textures: BTreeMap<TextureToken, TextureInfo>,
}

impl TextureUploadPipeline {
    pub fn new(engine: Rc<dyn NativeEngine>, context: Box<dyn GraphicsContext>, config: TextureConfig) -> Self {
        Self { engine, context, config, textures: BTreeMap::new() }
    }

    /// Effective edge limit: the smaller of the device and configured limits, floored to a
    /// power of two.
    pub fn max_texture_size(&self) -> u32 {
        floor_pow2(self.context.max_texture_size().min(self.config.max_texture_size)).max(1)
    }

    pub fn info(&self, texture: TextureToken) -> Option<&TextureInfo> {
        self.textures.get(&texture)
    }

    pub fn live_textures(&self) -> Vec<TextureToken> {
        self.textures.keys().copied().collect()
    }

    pub fn upload(&mut self, target: TextureTarget, content: &TextureContent) -> Result<TextureInfo, TextureError> {
        if let TextureTarget::Update(texture) = target {
            if !self.textures.contains_key(&texture) {
                return Err(TextureError::UnknownTexture(texture));
            }
        }
        let raster = self.rasterize(content)?;
        let TextureLayout { content: size, texture: dims, scale } = raster.layout;

        let allocation = NativeAllocation::new(self.engine.as_ref(), raster.pixels.len())?;
        allocation.write(&raster.pixels)?;
        let texture = match target {
            TextureTarget::New => {
                let code = self.engine.create_texture(allocation.addr(), dims.x, dims.y);
                TextureToken::from_address(check_handle(code)?)
            }
            TextureTarget::Update(texture) => {
                let code = self.engine.update_texture(texture.address(), allocation.addr(), dims.x, dims.y);
                check_status(code)?;
                texture
            }
        };
        drop(allocation);

        let info = TextureInfo {
            texture,
            width: dims.x,
            height: dims.y,
            content_width: size.x,
            content_height: size.y,
            uv: UvRect { min: Vec2::ZERO, max: raster.layout.uv_max() },
            scale,
        };
        self.textures.insert(texture, info);
        debug!(token = %texture, width = dims.x, height = dims.y, scale, "texture uploaded");
        Ok(info)
    }

    pub fn delete_texture(&mut self, texture: TextureToken) -> Result<(), TextureError> {
        if self.textures.remove(&texture).is_none() {
            return Err(TextureError::UnknownTexture(texture));
        }
        check_status(self.engine.delete_texture(texture.address()))?;
        Ok(())
    }

    /// Deletes every texture this pipeline created, logging native failures.
    pub fn clear(&mut self) {
        for texture in std::mem::take(&mut self.textures).into_keys() {
            if let Err(err) = check_status(self.engine.delete_texture(texture.address())) {
                warn!(token = %texture, %err, "failed to delete texture");
            }
        }
    }

    fn rasterize(&self, content: &TextureContent) -> Result<Raster, TextureError> {
        let max = self.max_texture_size();
        let context = self.context.as_ref();
        match content {
            TextureContent::Image { bytes, mime } => {
                let format =
                    ImageFormat::from_mime_type(mime).ok_or_else(|| TextureError::UnsupportedMime(mime.clone()))?;
                let decoded = image::load_from_memory_with_format(bytes, format)?.to_rgba8();
                let layout = fit_content(Vec2::new(decoded.width() as f32, decoded.height() as f32), max);
                let image = if layout.scale < 1.0 {
                    imageops::resize(&decoded, layout.content.x, layout.content.y, imageops::FilterType::Triangle)
                } else {
                    decoded
                };
                let mut surface = context.create_surface(layout.texture.x, layout.texture.y);
                surface.draw_image(&image, 0, 0);
                Ok(Raster { layout, pixels: surface.read_rgba() })
            }
            TextureContent::Label(style) => {
                let measured = label::measure_label(context, style);
                let layout = fit_content(measured.size, max);
                let style = if layout.scale < 1.0 { style.scaled(layout.scale) } else { style.clone() };
                let measured = label::measure_label(context, &style);
                let mut surface = context.create_surface(layout.texture.x, layout.texture.y);
                label::draw_label(surface.as_mut(), &style, &measured, layout.content.as_vec2());
                Ok(Raster { layout, pixels: surface.read_rgba() })
            }
            TextureContent::Markup(source) => {
                let document = MarkupDocument::parse(source);
                if document.is_empty() {
                    return Err(TextureError::EmptyContent);
                }
                let measured = markup::measure_markup(context, &document, &self.config.markup);
                let layout = fit_content(measured.size, max);
                let style = self.config.markup.scaled(layout.scale.min(1.0));
                let measured = markup::measure_markup(context, &document, &style);
                let mut surface = context.create_surface(layout.texture.x, layout.texture.y);
                markup::draw_markup(surface.as_mut(), context, &document, &style, &measured, layout.content.as_vec2());
                Ok(Raster { layout, pixels: surface.read_rgba() })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::mock::{MockEngine, MockObject};
    use crate::vfs::MemoryFileSystem;
    use image::{Rgba, RgbaImage};
    use std::cell::Cell;
    use std::io::Cursor;

    /// Counts surfaces that are still alive.
    struct CountingContext {
        inner: ImageContext,
        live: Rc<Cell<usize>>,
    }

    struct CountedSurface {
        inner: Box<dyn Surface>,
        live: Rc<Cell<usize>>,
    }

    impl Drop for CountedSurface {
        fn drop(&mut self) {
            self.live.set(self.live.get() - 1);
        }
    }

    impl Surface for CountedSurface {
        fn width(&self) -> u32 {
            self.inner.width()
        }
        fn height(&self) -> u32 {
            self.inner.height()
        }
        fn fill_rect(&mut self, x: f32, y: f32, w: f32, h: f32, color: Rgba<u8>) {
            self.inner.fill_rect(x, y, w, h, color)
        }
        fn stroke_rect(&mut self, x: f32, y: f32, w: f32, h: f32, line: f32, color: Rgba<u8>) {
            self.inner.stroke_rect(x, y, w, h, line, color)
        }
        fn draw_text(&mut self, text: &str, x: f32, baseline: f32, font: &FontSpec, color: Rgba<u8>) {
            self.inner.draw_text(text, x, baseline, font, color)
        }
        fn draw_image(&mut self, image: &RgbaImage, x: u32, y: u32) {
            self.inner.draw_image(image, x, y)
        }
        fn read_rgba(&self) -> Vec<u8> {
            self.inner.read_rgba()
        }
    }

    impl GraphicsContext for CountingContext {
        fn max_texture_size(&self) -> u32 {
            self.inner.max_texture_size()
        }
        fn measure_text(&self, text: &str, font: &FontSpec) -> TextMetrics {
            self.inner.measure_text(text, font)
        }
        fn create_surface(&self, width: u32, height: u32) -> Box<dyn Surface> {
            self.live.set(self.live.get() + 1);
            Box::new(CountedSurface { inner: self.inner.create_surface(width, height), live: self.live.clone() })
        }
    }

    fn pipeline(max: u32) -> (Rc<MockEngine>, TextureUploadPipeline, Rc<Cell<usize>>) {
        let engine = Rc::new(MockEngine::new(Rc::new(MemoryFileSystem::new("/vfs"))));
        let live = Rc::new(Cell::new(0));
        let context = CountingContext { inner: ImageContext::new(max), live: live.clone() };
        let pipeline = TextureUploadPipeline::new(engine.clone(), Box::new(context), TextureConfig::default());
        (engine, pipeline, live)
    }

    fn png(width: u32, height: u32) -> Vec<u8> {
        let image = RgbaImage::from_fn(width, height, |x, y| Rgba([x as u8 * 10, y as u8 * 10, 200, 255]));
        let mut bytes = Cursor::new(Vec::new());
        image.write_to(&mut bytes, ImageFormat::Png).expect("encode png");
        bytes.into_inner()
    }

    fn image_content(width: u32, height: u32) -> TextureContent {
        TextureContent::Image { bytes: png(width, height), mime: "image/png".to_string() }
    }

    #[test]
    fn images_land_top_left_in_a_power_of_two_texture() {
        let (engine, mut pipeline, live) = pipeline(1024);
        let info = pipeline.upload(TextureTarget::New, &image_content(3, 5)).expect("upload");
        assert_eq!((info.width, info.height), (4, 8));
        assert_eq!((info.content_width, info.content_height), (3, 5));
        assert!((info.uv.area() - 15.0 / 32.0).abs() < 1e-6);

        let (width, height, pixels) = engine.texture_pixels(info.texture.address()).expect("texture");
        assert_eq!((width, height), (4, 8));
        assert_eq!(&pixels[4..8], &[10, 0, 200, 255]);
        assert_eq!(&pixels[12..16], &[0, 0, 0, 0]);
        assert_eq!(engine.live_allocations(), 0);
        assert_eq!(live.get(), 0);
    }

    #[test]
    fn oversized_images_are_downscaled_to_the_limit() {
        let (_, mut pipeline, _) = pipeline(100);
        assert_eq!(pipeline.max_texture_size(), 64);
        let info = pipeline.upload(TextureTarget::New, &image_content(100, 40)).expect("upload");
        assert_eq!((info.width, info.height), (64, 32));
        assert_eq!(info.content_width, 64);
        assert!(info.scale < 1.0);
    }

    #[test]
    fn labels_are_sized_from_their_metrics() {
        let (_, mut pipeline, _) = pipeline(1024);
        let style = LabelStyle { font_size: 10.0, padding: 4.0, border_width: 1.0, line_spacing: 2.0, ..LabelStyle::new("abcd\nxy") };
        let info = pipeline.upload(TextureTarget::New, &TextureContent::Label(style)).expect("upload");
        assert_eq!((info.content_width, info.content_height), (30, 32));
        assert_eq!((info.width, info.height), (32, 32));
    }

    #[test]
    fn failed_update_leaves_texture_untouched_and_frees_memory() {
        let (engine, mut pipeline, live) = pipeline(1024);
        let info = pipeline.upload(TextureTarget::New, &image_content(2, 2)).expect("upload");
        let before = engine.object(info.texture.address());

        engine.fail_textures(Some(-4));
        let err = pipeline.upload(TextureTarget::Update(info.texture), &image_content(8, 8)).unwrap_err();
        assert!(matches!(err, TextureError::Native(NativeError::OutOfMemory)));
        assert_eq!(engine.object(info.texture.address()), before);
        assert_eq!(pipeline.info(info.texture), Some(&info));
        assert_eq!(engine.live_allocations(), 0);
        assert_eq!(live.get(), 0);

        engine.fail_textures(None);
        let updated = pipeline.upload(TextureTarget::Update(info.texture), &image_content(8, 8)).expect("update");
        assert_eq!(updated.texture, info.texture);
        assert!(matches!(engine.object(info.texture.address()), Some(MockObject::Texture { updates: 1, .. })));
    }

    #[test]
    fn rejected_content_never_allocates() {
        let (engine, mut pipeline, _) = pipeline(1024);
        let bad_mime = TextureContent::Image { bytes: png(2, 2), mime: "text/plain".to_string() };
        assert!(matches!(pipeline.upload(TextureTarget::New, &bad_mime), Err(TextureError::UnsupportedMime(_))));
        let corrupt = TextureContent::Image { bytes: vec![1, 2, 3], mime: "image/png".to_string() };
        assert!(matches!(pipeline.upload(TextureTarget::New, &corrupt), Err(TextureError::Decode(_))));
        let blank = TextureContent::Markup("<p> </p>".to_string());
        assert!(matches!(pipeline.upload(TextureTarget::New, &blank), Err(TextureError::EmptyContent)));
        assert_eq!(engine.total_allocations(), 0);
    }

    #[test]
    fn allocation_failure_is_reported() {
        let (engine, mut pipeline, live) = pipeline(1024);
        engine.fail_allocations(true);
        let err = pipeline.upload(TextureTarget::New, &TextureContent::Markup("<b>hot</b>".to_string())).unwrap_err();
        assert!(matches!(err, TextureError::Native(NativeError::OutOfMemory)));
        assert_eq!(live.get(), 0);
        assert!(pipeline.live_textures().is_empty());
    }

    #[test]
    fn deleting_unknown_textures_is_refused() {
        let (engine, mut pipeline, _) = pipeline(1024);
        let info = pipeline.upload(TextureTarget::New, &image_content(1, 1)).expect("upload");
        pipeline.delete_texture(info.texture).expect("delete");
        assert_eq!(engine.live_textures(), 0);
        assert!(matches!(pipeline.delete_texture(info.texture), Err(TextureError::UnknownTexture(_))));
    }
}
