//! Annotation markup: a small HTML subset rendered into label-like textures.
//!
//! Recognised tags are `<p>`, `<br>`, `<b>`/`<strong>`, `<i>`/`<em>` and `<span>`; any
//! other tag is dropped while its text is kept. Runs of ASCII whitespace collapse to one
//! space. The parsed document only lives for a single rasterization.

use super::canvas::{FontSpec, GraphicsContext, Surface, TextMetrics};
use glam::Vec2;
use image::Rgba;
use serde::{Deserialize, Serialize};
use std::mem;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MarkupStyle {
    pub font_size: f32,
    pub padding: f32,
    pub line_spacing: f32,
    pub paragraph_spacing: f32,
    pub text_color: [u8; 4],
    pub background: [u8; 4],
}

impl Default for MarkupStyle {
    fn default() -> Self {
        Self {
            font_size: 13.0,
            padding: 6.0,
            line_spacing: 2.0,
            paragraph_spacing: 6.0,
            text_color: [20, 20, 20, 255],
            background: [250, 250, 240, 235],
        }
    }
}

impl MarkupStyle {
    pub fn scaled(&self, factor: f32) -> Self {
        Self {
            font_size: self.font_size * factor,
            padding: self.padding * factor,
            line_spacing: self.line_spacing * factor,
            paragraph_spacing: self.paragraph_spacing * factor,
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Run {
    pub(crate) text: String,
    pub(crate) bold: bool,
    pub(crate) italic: bool,
}

type Line = Vec<Run>;

#[derive(Debug, Default, PartialEq)]
pub(crate) struct MarkupDocument {
    pub(crate) paragraphs: Vec<Vec<Line>>,
}

impl MarkupDocument {
    pub(crate) fn parse(markup: &str) -> Self {
        let mut builder = Builder::default();
        let mut rest = markup;
        while let Some(open) = rest.find('<') {
            builder.push_text(&decode_entities(&rest[..open]));
            let after = &rest[open + 1..];
            let Some(close) = after.find('>') else {
                builder.push_text(&decode_entities(&rest[open..]));
                rest = "";
                break;
            };
            builder.tag(&after[..close]);
            rest = &after[close + 1..];
        }
        builder.push_text(&decode_entities(rest));
        builder.finish()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.paragraphs.iter().flatten().flatten().all(|run| run.text.trim().is_empty())
    }
}

#[derive(Default)]
struct Builder {
    paragraphs: Vec<Vec<Line>>,
    lines: Vec<Line>,
    current: Line,
    bold: u32,
    italic: u32,
}

impl Builder {
    fn tag(&mut self, raw: &str) {
        let raw = raw.trim();
        let (closing, body) = match raw.strip_prefix('/') {
            Some(body) => (true, body),
            None => (false, raw),
        };
        let name = body.split(|c: char| c.is_ascii_whitespace() || c == '/').next().unwrap_or_default();
        match (name.to_ascii_lowercase().as_str(), closing) {
            ("p", _) => self.break_paragraph(),
            ("br", _) => self.break_line(),
            ("b" | "strong", false) => self.bold += 1,
            ("b" | "strong", true) => self.bold = self.bold.saturating_sub(1),
            ("i" | "em", false) => self.italic += 1,
            ("i" | "em", true) => self.italic = self.italic.saturating_sub(1),
            _ => {}
        }
    }

    fn push_text(&mut self, text: &str) {
        for ch in text.chars() {
            self.push_char(ch);
        }
    }

    fn push_char(&mut self, ch: char) {
        let ch = if ch.is_ascii_whitespace() { ' ' } else { ch };
        if ch == ' ' {
            let at_line_start = self.current.iter().all(|run| run.text.is_empty());
            let after_space = self.current.last().is_some_and(|run| run.text.ends_with(' '));
            if at_line_start || after_space {
                return;
            }
        }
        let (bold, italic) = (self.bold > 0, self.italic > 0);
        match self.current.last_mut() {
            Some(run) if run.bold == bold && run.italic == italic => run.text.push(ch),
            _ => self.current.push(Run { text: ch.to_string(), bold, italic }),
        }
    }

    fn break_line(&mut self) {
        if let Some(run) = self.current.last_mut() {
            let trimmed = run.text.trim_end_matches(' ').len();
            run.text.truncate(trimmed);
        }
        self.current.retain(|run| !run.text.is_empty());
        self.lines.push(mem::take(&mut self.current));
    }

    fn break_paragraph(&mut self) {
        if !self.current.is_empty() {
            self.break_line();
        }
        if !self.lines.is_empty() {
            self.paragraphs.push(mem::take(&mut self.lines));
        }
    }

    fn finish(mut self) -> MarkupDocument {
        self.break_paragraph();
        MarkupDocument { paragraphs: self.paragraphs }
    }
}

pub(crate) fn decode_entities(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let tail = &rest[amp + 1..];
        let decoded = tail.find(';').filter(|end| *end <= 10).and_then(|end| {
            let name = &tail[..end];
            let ch = match name {
                "amp" => Some('&'),
                "lt" => Some('<'),
                "gt" => Some('>'),
                "quot" => Some('"'),
                "apos" => Some('\''),
                "nbsp" => Some('\u{a0}'),
                _ => numeric_entity(name),
            };
            ch.map(|ch| (ch, end))
        });
        match decoded {
            Some((ch, end)) => {
                out.push(ch);
                rest = &tail[end + 1..];
            }
            None => {
                out.push('&');
                rest = tail;
            }
        }
    }
    out.push_str(rest);
    out
}

fn numeric_entity(name: &str) -> Option<char> {
    let digits = name.strip_prefix('#')?;
    let code = match digits.strip_prefix(['x', 'X']) {
        Some(hex) => u32::from_str_radix(hex, 16).ok()?,
        None => digits.parse().ok()?,
    };
    char::from_u32(code)
}

fn run_font(style: &MarkupStyle, run: &Run) -> FontSpec {
    FontSpec { size: style.font_size, bold: run.bold, italic: run.italic }
}

pub(crate) struct MarkupLayout {
    metrics: TextMetrics,
    pub(crate) size: Vec2,
}

pub(crate) fn measure_markup(context: &dyn GraphicsContext, document: &MarkupDocument, style: &MarkupStyle) -> MarkupLayout {
    let metrics = context.measure_text("", &FontSpec::regular(style.font_size));
    let mut widest = 0.0f32;
    let mut height = 0.0f32;
    for (index, paragraph) in document.paragraphs.iter().enumerate() {
        if index > 0 {
            height += style.paragraph_spacing;
        }
        for (line_index, line) in paragraph.iter().enumerate() {
            if line_index > 0 {
                height += style.line_spacing;
            }
            let width: f32 = line.iter().map(|run| context.measure_text(&run.text, &run_font(style, run)).width).sum();
            widest = widest.max(width);
            height += metrics.line_height();
        }
    }
    MarkupLayout { metrics, size: Vec2::new(widest, height) + Vec2::splat(2.0 * style.padding) }
}

pub(crate) fn draw_markup(
    surface: &mut dyn Surface,
    context: &dyn GraphicsContext,
    document: &MarkupDocument,
    style: &MarkupStyle,
    layout: &MarkupLayout,
    content: Vec2,
) {
    surface.fill_rect(0.0, 0.0, content.x, content.y, Rgba(style.background));
    let mut top = style.padding;
    for (index, paragraph) in document.paragraphs.iter().enumerate() {
        if index > 0 {
            top += style.paragraph_spacing;
        }
        for (line_index, line) in paragraph.iter().enumerate() {
            if line_index > 0 {
                top += style.line_spacing;
            }
            let mut x = style.padding;
            for run in line {
                let font = run_font(style, run);
                surface.draw_text(&run.text, x, top + layout.metrics.ascent, &font, Rgba(style.text_color));
                x += context.measure_text(&run.text, &font).width;
            }
            top += layout.metrics.line_height();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::texture::canvas::ImageContext;

    fn texts(document: &MarkupDocument) -> Vec<Vec<String>> {
        document
            .paragraphs
            .iter()
            .map(|paragraph| {
                paragraph.iter().map(|line| line.iter().map(|run| run.text.as_str()).collect::<String>()).collect()
            })
            .collect()
    }

    #[test]
    fn paragraphs_and_breaks_structure_the_text() {
        let document = MarkupDocument::parse("<p>Pump  <b>P-101</b><br/>running</p><p>Flow &amp; pressure</p>");
        assert_eq!(
            texts(&document),
            vec![vec!["Pump P-101".to_string(), "running".to_string()], vec!["Flow & pressure".to_string()]]
        );
        let first_line = &document.paragraphs[0][0];
        assert_eq!(first_line.len(), 2);
        assert!(first_line[1].bold && !first_line[0].bold);
    }

    #[test]
    fn unknown_tags_are_dropped_but_text_kept() {
        let document = MarkupDocument::parse("<div class=\"x\"><i>tilted</i> <u>under</u></div>");
        assert_eq!(texts(&document), vec![vec!["tilted under".to_string()]]);
        assert!(document.paragraphs[0][0][0].italic);
    }

    #[test]
    fn entities_decode_and_unknown_ones_stay_literal() {
        assert_eq!(decode_entities("a &lt;b&gt; &#65;&#x42; &bogus; &"), "a <b> AB &bogus; &");
    }

    #[test]
    fn blank_markup_is_empty() {
        assert!(MarkupDocument::parse("<p> </p><br>").is_empty());
        assert!(!MarkupDocument::parse("x").is_empty());
    }

    #[test]
    fn layout_stacks_paragraphs() {
        let context = ImageContext::new(1024);
        let style = MarkupStyle { font_size: 10.0, padding: 1.0, line_spacing: 2.0, paragraph_spacing: 4.0, ..MarkupStyle::default() };
        let document = MarkupDocument::parse("<p>ab<br>abcd</p><p>a</p>");
        let layout = measure_markup(&context, &document, &style);
        assert_eq!(layout.size, Vec2::new(22.0, 38.0));
    }
}
