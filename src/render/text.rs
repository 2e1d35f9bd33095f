use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use image::{Rgb, RgbaImage};
use rusttype::{point, Font, Scale};
use serde::{Deserialize, Serialize};

use super::RenderError;

/// Horizontal placement of the name relative to the anchor point.
/// The anchor's y coordinate is always the text baseline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Alignment {
    Left,
    #[default]
    Middle,
    Right,
}

impl Alignment {
    /// Two-letter anchor code: horizontal part then `s` for baseline.
    pub fn anchor(self) -> &'static str {
        match self {
            Alignment::Left => "ls",
            Alignment::Middle => "ms",
            Alignment::Right => "rs",
        }
    }

    /// Left edge of a run of `width` pixels anchored at `x`.
    pub fn origin_x(self, x: f32, width: f32) -> f32 {
        match self {
            Alignment::Left => x,
            Alignment::Middle => x - width / 2.0,
            Alignment::Right => x - width,
        }
    }
}

impl FromStr for Alignment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "left" | "ls" => Ok(Alignment::Left),
            "middle" | "center" | "ms" => Ok(Alignment::Middle),
            "right" | "rs" => Ok(Alignment::Right),
            other => Err(format!(
                "invalid alignment '{other}', expected one of: left, middle, right"
            )),
        }
    }
}

impl fmt::Display for Alignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Alignment::Left => "left",
            Alignment::Middle => "middle",
            Alignment::Right => "right",
        };
        f.write_str(label)
    }
}

/// Where and in which colour the name is drawn.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TextStyle {
    pub x: f32,
    pub y: f32,
    pub alignment: Alignment,
    pub color: Rgb<u8>,
}

impl Default for TextStyle {
    fn default() -> Self {
        Self {
            x: 0.0,
            y: 0.0,
            alignment: Alignment::Middle,
            color: Rgb([0, 0, 0]),
        }
    }
}

/// Rasterizes a single line of text onto an image.
pub trait TextPainter: Send + Sync {
    /// Advance width of `text` in pixels.
    fn text_width(&self, text: &str) -> f32;

    /// Draw `text` with its left edge at `x` and its baseline at `baseline`.
    fn paint(&self, canvas: &mut RgbaImage, x: f32, baseline: f32, text: &str, color: Rgb<u8>);

    fn paint_anchored(&self, canvas: &mut RgbaImage, style: &TextStyle, text: &str) {
        let width = self.text_width(text);
        let x = style.alignment.origin_x(style.x, width);
        self.paint(canvas, x, style.y, text, style.color);
    }
}

/// TrueType/OpenType painter at a fixed pixel size.
pub struct FontPainter {
    font: Font<'static>,
    scale: Scale,
}

impl FontPainter {
    pub fn load(path: &Path, size: f32) -> Result<Self, RenderError> {
        let data = fs::read(path).map_err(|err| RenderError::Font {
            path: path.to_path_buf(),
            reason: err.to_string(),
        })?;
        Self::from_bytes(data, size).map_err(|reason| RenderError::Font {
            path: path.to_path_buf(),
            reason,
        })
    }

    pub fn from_bytes(data: Vec<u8>, size: f32) -> Result<Self, String> {
        if !(size > 0.0) {
            return Err(format!("font size must be positive, got {size}"));
        }
        let font = Font::try_from_vec(data).ok_or_else(|| "not a usable font file".to_string())?;
        Ok(Self {
            font,
            scale: Scale::uniform(size),
        })
    }
}

impl TextPainter for FontPainter {
    fn text_width(&self, text: &str) -> f32 {
        self.font
            .layout(text, self.scale, point(0.0, 0.0))
            .last()
            .map(|glyph| glyph.position().x + glyph.unpositioned().h_metrics().advance_width)
            .unwrap_or(0.0)
    }

    fn paint(&self, canvas: &mut RgbaImage, x: f32, baseline: f32, text: &str, color: Rgb<u8>) {
        let (width, height) = canvas.dimensions();
        for glyph in self.font.layout(text, self.scale, point(x, baseline)) {
            let Some(bb) = glyph.pixel_bounding_box() else {
                continue;
            };
            glyph.draw(|gx, gy, coverage| {
                let px = gx as i32 + bb.min.x;
                let py = gy as i32 + bb.min.y;
                if px < 0 || py < 0 || px as u32 >= width || py as u32 >= height {
                    return;
                }
                blend(canvas.get_pixel_mut(px as u32, py as u32), color, coverage);
            });
        }
    }
}

fn blend(dst: &mut image::Rgba<u8>, color: Rgb<u8>, coverage: f32) {
    let alpha = coverage.clamp(0.0, 1.0);
    if alpha == 0.0 {
        return;
    }
    let inv = 1.0 - alpha;
    for channel in 0..3 {
        dst.0[channel] = (color.0[channel] as f32 * alpha + dst.0[channel] as f32 * inv).round() as u8;
    }
    dst.0[3] = dst.0[3].max((alpha * 255.0).round() as u8);
}

/// Parse `#rrggbb` (the `#` is optional).
pub fn parse_hex_color(s: &str) -> Option<Rgb<u8>> {
    let hex = s.trim().trim_start_matches('#');
    if hex.len() != 6 || !hex.is_ascii() {
        return None;
    }
    let channel = |i: usize| u8::from_str_radix(&hex[i..i + 2], 16).ok();
    Some(Rgb([channel(0)?, channel(2)?, channel(4)?]))
}

pub fn to_hex_color(color: Rgb<u8>) -> String {
    format!("#{:02x}{:02x}{:02x}", color.0[0], color.0[1], color.0[2])
}

/// Find the font file for a family and style inside `fonts_dir`.
///
/// `font` may be an existing path, a file name inside `fonts_dir`, or a family
/// name. Families are looked up as `<family>-<Style>.ttf`/`.otf` where Style
/// is `Regular`, `Bold`, `Italic` or `BoldItalic`.
pub fn resolve_font(fonts_dir: &Path, font: &str, bold: bool, italic: bool) -> Option<PathBuf> {
    let direct = Path::new(font);
    if direct.is_file() {
        return Some(direct.to_path_buf());
    }
    let in_dir = fonts_dir.join(font);
    if in_dir.is_file() {
        return Some(in_dir);
    }

    let style = match (bold, italic) {
        (false, false) => "Regular",
        (true, false) => "Bold",
        (false, true) => "Italic",
        (true, true) => "BoldItalic",
    };
    ["ttf", "otf"]
        .iter()
        .flat_map(|ext| {
            [
                fonts_dir.join(format!("{font}-{style}.{ext}")),
                fonts_dir.join(format!("{font}.{ext}")),
            ]
        })
        .find(|candidate| candidate.is_file())
}
