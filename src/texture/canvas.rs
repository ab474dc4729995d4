//! Off-screen drawing used to rasterize texture content.

use image::{imageops, Rgba, RgbaImage};
use rusttype::{point, Font, Scale};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FontSpec {
    pub size: f32,
    pub bold: bool,
    pub italic: bool,
}

impl FontSpec {
    pub fn regular(size: f32) -> Self {
        Self { size, bold: false, italic: false }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct TextMetrics {
    pub width: f32,
    pub ascent: f32,
    pub descent: f32,
}

impl TextMetrics {
    pub fn line_height(&self) -> f32 {
        self.ascent + self.descent
    }
}

/// A transparent RGBA drawing target. Coordinates are pixels from the top-left corner.
pub trait Surface {
    fn width(&self) -> u32;
    fn height(&self) -> u32;
    fn fill_rect(&mut self, x: f32, y: f32, width: f32, height: f32, color: Rgba<u8>);
    /// Strokes a border of `line_width` pixels lying inside the rectangle.
    fn stroke_rect(&mut self, x: f32, y: f32, width: f32, height: f32, line_width: f32, color: Rgba<u8>);
    fn draw_text(&mut self, text: &str, x: f32, baseline: f32, font: &FontSpec, color: Rgba<u8>);
    /// Copies `image` unblended with its top-left corner at `(x, y)`.
    fn draw_image(&mut self, image: &RgbaImage, x: u32, y: u32);
    fn read_rgba(&self) -> Vec<u8>;
}

pub trait GraphicsContext {
    /// Largest texture edge the device accepts.
    fn max_texture_size(&self) -> u32;
    fn measure_text(&self, text: &str, font: &FontSpec) -> TextMetrics;
    fn create_surface(&self, width: u32, height: u32) -> Box<dyn Surface>;
}

const FALLBACK_ADVANCE: f32 = 0.5;
const FALLBACK_ASCENT: f32 = 0.8;
const FALLBACK_DESCENT: f32 = 0.2;

/// Software graphics context backed by `image` buffers.
///
/// Without a font, text is measured with fixed per-character advances and not drawn; sizing
/// stays deterministic either way.
pub struct ImageContext {
    max_texture_size: u32,
    font: Option<Font<'static>>,
}

impl ImageContext {
    pub fn new(max_texture_size: u32) -> Self {
        Self { max_texture_size, font: None }
    }

    /// Returns `None` when `bytes` is not a usable TrueType/OpenType font.
    pub fn with_font_bytes(max_texture_size: u32, bytes: Vec<u8>) -> Option<Self> {
        let font = Font::try_from_vec(bytes)?;
        Some(Self { max_texture_size, font: Some(font) })
    }

    pub fn has_font(&self) -> bool {
        self.font.is_some()
    }
}

impl GraphicsContext for ImageContext {
    fn max_texture_size(&self) -> u32 {
        self.max_texture_size
    }

    fn measure_text(&self, text: &str, font: &FontSpec) -> TextMetrics {
        match &self.font {
            Some(face) => {
                let scale = Scale::uniform(font.size);
                let v_metrics = face.v_metrics(scale);
                let width = face
                    .layout(text, scale, point(0.0, 0.0))
                    .map(|glyph| glyph.position().x + glyph.unpositioned().h_metrics().advance_width)
                    .fold(0.0, f32::max);
                let bold_extra = if font.bold && !text.is_empty() { 1.0 } else { 0.0 };
                TextMetrics { width: width + bold_extra, ascent: v_metrics.ascent, descent: -v_metrics.descent }
            }
            None => TextMetrics {
                width: text.chars().count() as f32 * font.size * FALLBACK_ADVANCE,
                ascent: font.size * FALLBACK_ASCENT,
                descent: font.size * FALLBACK_DESCENT,
            },
        }
    }

    fn create_surface(&self, width: u32, height: u32) -> Box<dyn Surface> {
        Box::new(ImageSurface { image: RgbaImage::new(width, height), font: self.font.clone() })
    }
}

struct ImageSurface {
    image: RgbaImage,
    font: Option<Font<'static>>,
}

impl ImageSurface {
    fn blend(&mut self, x: i32, y: i32, color: Rgba<u8>, coverage: f32) {
        if x < 0 || y < 0 || x as u32 >= self.image.width() || y as u32 >= self.image.height() {
            return;
        }
        let alpha = coverage.clamp(0.0, 1.0) * f32::from(color[3]) / 255.0;
        if alpha <= 0.0 {
            return;
        }
        let dst = self.image.get_pixel_mut(x as u32, y as u32);
        let dst_alpha = f32::from(dst[3]) / 255.0;
        let out_alpha = alpha + dst_alpha * (1.0 - alpha);
        for channel in 0..3 {
            let src = f32::from(color[channel]) * alpha;
            let under = f32::from(dst[channel]) * dst_alpha * (1.0 - alpha);
            dst[channel] = ((src + under) / out_alpha).round().clamp(0.0, 255.0) as u8;
        }
        dst[3] = (out_alpha * 255.0).round() as u8;
    }
}

impl Surface for ImageSurface {
    fn width(&self) -> u32 {
        self.image.width()
    }

    fn height(&self) -> u32 {
        self.image.height()
    }

    fn fill_rect(&mut self, x: f32, y: f32, width: f32, height: f32, color: Rgba<u8>) {
        let (x0, y0) = (x.round() as i32, y.round() as i32);
        let (x1, y1) = ((x + width).round() as i32, (y + height).round() as i32);
        for py in y0..y1 {
            for px in x0..x1 {
                self.blend(px, py, color, 1.0);
            }
        }
    }

    fn stroke_rect(&mut self, x: f32, y: f32, width: f32, height: f32, line_width: f32, color: Rgba<u8>) {
        if line_width <= 0.0 {
            return;
        }
        let line = line_width.min(width / 2.0).min(height / 2.0);
        self.fill_rect(x, y, width, line, color);
        self.fill_rect(x, y + height - line, width, line, color);
        self.fill_rect(x, y + line, line, height - 2.0 * line, color);
        self.fill_rect(x + width - line, y + line, line, height - 2.0 * line, color);
    }

    fn draw_text(&mut self, text: &str, x: f32, baseline: f32, font: &FontSpec, color: Rgba<u8>) {
        let Some(face) = self.font.clone() else {
            return;
        };
        let scale = Scale::uniform(font.size);
        let passes: &[f32] = if font.bold { &[0.0, 1.0] } else { &[0.0] };
        for offset in passes {
            for glyph in face.layout(text, scale, point(x + offset, baseline)) {
                let Some(bounds) = glyph.pixel_bounding_box() else {
                    continue;
                };
                let mut coverage = Vec::new();
                glyph.draw(|gx, gy, value| coverage.push((gx as i32, gy as i32, value)));
                for (gx, gy, value) in coverage {
                    // Shear rows above the baseline for a synthetic italic.
                    let rise = baseline as i32 - (bounds.min.y + gy);
                    let slant = if font.italic { (rise as f32 * 0.2) as i32 } else { 0 };
                    self.blend(bounds.min.x + gx + slant, bounds.min.y + gy, color, value);
                }
            }
        }
    }

    fn draw_image(&mut self, image: &RgbaImage, x: u32, y: u32) {
        imageops::replace(&mut self.image, image, i64::from(x), i64::from(y));
    }

    fn read_rgba(&self) -> Vec<u8> {
        self.image.as_raw().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fallback_metrics_are_proportional_to_font_size() {
        let context = ImageContext::new(1024);
        let metrics = context.measure_text("abcd", &FontSpec::regular(10.0));
        assert_eq!(metrics.width, 20.0);
        assert_eq!(metrics.line_height(), 10.0);
        assert!(!context.has_font());
    }

    #[test]
    fn surfaces_start_transparent_and_blend_fills() {
        let context = ImageContext::new(64);
        let mut surface = context.create_surface(4, 2);
        assert!(surface.read_rgba().iter().all(|byte| *byte == 0));
        surface.fill_rect(0.0, 0.0, 2.0, 2.0, Rgba([255, 0, 0, 255]));
        surface.stroke_rect(0.0, 0.0, 4.0, 2.0, 1.0, Rgba([0, 0, 255, 255]));
        let pixels = surface.read_rgba();
        assert_eq!(&pixels[0..4], &[0, 0, 255, 255]);
        assert_eq!(pixels.len(), 4 * 2 * 4);
    }

    #[test]
    fn invalid_font_bytes_are_rejected() {
        assert!(ImageContext::with_font_bytes(64, vec![0, 1, 2, 3]).is_none());
    }
}
