use super::canvas::{FontSpec, GraphicsContext, Surface, TextMetrics};
use glam::Vec2;
use image::Rgba;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TextAlign {
    #[default]
    Left,
    Center,
    Right,
}

/// A dynamic text label. Lengths are pixels; `line_spacing` is the gap between lines.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LabelStyle {
    pub text: String,
    pub font_size: f32,
    pub bold: bool,
    pub padding: f32,
    pub border_width: f32,
    pub line_spacing: f32,
    pub text_color: [u8; 4],
    pub background: [u8; 4],
    pub border_color: [u8; 4],
    pub align: TextAlign,
}

impl Default for LabelStyle {
    fn default() -> Self {
        Self {
            text: String::new(),
            font_size: 14.0,
            bold: false,
            padding: 4.0,
            border_width: 1.0,
            line_spacing: 2.0,
            text_color: [0, 0, 0, 255],
            background: [255, 255, 255, 230],
            border_color: [96, 96, 96, 255],
            align: TextAlign::Left,
        }
    }
}

impl LabelStyle {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into(), ..Self::default() }
    }

    /// The same label with every metric multiplied by `factor`.
    pub fn scaled(&self, factor: f32) -> Self {
        Self {
            font_size: self.font_size * factor,
            padding: self.padding * factor,
            border_width: self.border_width * factor,
            line_spacing: self.line_spacing * factor,
            ..self.clone()
        }
    }

    fn font(&self) -> FontSpec {
        FontSpec { size: self.font_size, bold: self.bold, italic: false }
    }

    fn inset(&self) -> f32 {
        self.padding + self.border_width
    }
}

pub(crate) struct LabelLayout {
    lines: Vec<(String, f32)>,
    metrics: TextMetrics,
    pub(crate) size: Vec2,
}

pub(crate) fn measure_label(context: &dyn GraphicsContext, style: &LabelStyle) -> LabelLayout {
    let font = style.font();
    let base = context.measure_text("", &font);
    let lines: Vec<(String, f32)> = style
        .text
        .split('\n')
        .map(|line| (line.to_string(), context.measure_text(line, &font).width))
        .collect();
    let widest = lines.iter().map(|(_, width)| *width).fold(0.0, f32::max);
    let count = lines.len() as f32;
    let text_height = count * base.line_height() + (count - 1.0).max(0.0) * style.line_spacing;
    let size = Vec2::new(widest, text_height) + Vec2::splat(2.0 * style.inset());
    LabelLayout { lines, metrics: base, size }
}

pub(crate) fn draw_label(surface: &mut dyn Surface, style: &LabelStyle, layout: &LabelLayout, content: Vec2) {
    surface.fill_rect(0.0, 0.0, content.x, content.y, Rgba(style.background));
    surface.stroke_rect(0.0, 0.0, content.x, content.y, style.border_width, Rgba(style.border_color));

    let inner_width = content.x - 2.0 * style.inset();
    let font = style.font();
    let mut top = style.inset();
    for (line, width) in &layout.lines {
        let x = match style.align {
            TextAlign::Left => style.inset(),
            TextAlign::Center => style.inset() + (inner_width - width) / 2.0,
            TextAlign::Right => style.inset() + inner_width - width,
        };
        surface.draw_text(line, x, top + layout.metrics.ascent, &font, Rgba(style.text_color));
        top += layout.metrics.line_height() + style.line_spacing;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::texture::canvas::ImageContext;

    #[test]
    fn label_box_includes_padding_border_and_spacing() {
        let context = ImageContext::new(1024);
        let style = LabelStyle { font_size: 10.0, padding: 4.0, border_width: 1.0, line_spacing: 2.0, ..LabelStyle::new("abcd\nxy") };
        let layout = measure_label(&context, &style);
        assert_eq!(layout.size, Vec2::new(30.0, 32.0));
    }

    #[test]
    fn scaling_touches_every_metric() {
        let style = LabelStyle::new("x").scaled(0.5);
        assert_eq!(style.font_size, 7.0);
        assert_eq!(style.padding, 2.0);
        assert_eq!(style.border_width, 0.5);
        assert_eq!(style.line_spacing, 1.0);
        assert_eq!(style.text, "x");
    }
}
