//! Overlay render targets. Every render call redraws the whole overlay.

use ab_glyph::FontRef;
use facewatch_core::{BoundingBox, MatchResult};
use facewatch_hw::Frame;
use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};
use imageproc::drawing::{
    draw_filled_circle_mut, draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size,
};
use imageproc::rect::Rect;
use serde::Serialize;
use std::io::Write;
use std::path::PathBuf;
use thiserror::Error;

const KNOWN_COLOR: Rgb<u8> = Rgb([0, 220, 0]);
const UNKNOWN_COLOR: Rgb<u8> = Rgb([230, 40, 40]);
const LANDMARK_COLOR: Rgb<u8> = Rgb([0, 160, 255]);
const LABEL_TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);
const LABEL_SCALE: f32 = 14.0;
const LABEL_PAD: u32 = 2;

static LABEL_FONT: &[u8] = include_bytes!("../assets/DejaVuSans.ttf");

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("overlay image: {0}")]
    Image(#[from] image::ImageError),
    #[error("overlay io: {0}")]
    Io(#[from] std::io::Error),
    #[error("overlay json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("overlay font: {0}")]
    Font(#[from] ab_glyph::InvalidFont),
}

/// One face as shown on the overlay, in frame coordinates.
#[derive(Debug, Clone, Serialize)]
pub struct RecognizedFace {
    pub bbox: BoundingBox,
    pub result: MatchResult,
}

/// A surface the recognition loop draws onto once per tick.
pub trait RenderTarget {
    fn render(&mut self, frame: &Frame, faces: &[RecognizedFace]) -> Result<(), RenderError>;
}

/// Fans each render out to several targets.
#[derive(Default)]
pub struct Overlays {
    targets: Vec<Box<dyn RenderTarget>>,
}

impl Overlays {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, target: impl RenderTarget + 'static) {
        self.targets.push(Box::new(target));
    }
}

impl RenderTarget for Overlays {
    fn render(&mut self, frame: &Frame, faces: &[RecognizedFace]) -> Result<(), RenderError> {
        for target in &mut self.targets {
            target.render(frame, faces)?;
        }
        Ok(())
    }
}

/// Scale factors from frame space to a display surface.
fn display_scale(frame: (u32, u32), display: (u32, u32)) -> (f32, f32) {
    (
        display.0 as f32 / frame.0.max(1) as f32,
        display.1 as f32 / frame.1.max(1) as f32,
    )
}

/// Draw each face's box, landmarks and `label (distance)` tag onto
/// `surface`. `scale` maps frame coordinates to surface coordinates.
pub fn draw_faces(surface: &mut RgbImage, font: &FontRef<'_>, faces: &[RecognizedFace], scale: (f32, f32)) {
    for face in faces {
        let bbox = face.bbox.scaled(scale.0, scale.1);
        let color = if face.result.label.is_known() { KNOWN_COLOR } else { UNKNOWN_COLOR };
        let rect = Rect::at(bbox.x.round() as i32, bbox.y.round() as i32)
            .of_size(bbox.width.round().max(1.0) as u32, bbox.height.round().max(1.0) as u32);
        draw_hollow_rect_mut(surface, rect, color);
        // Double stroke so boxes stay visible on busy backgrounds
        if bbox.width > 4.0 && bbox.height > 4.0 {
            let inner = Rect::at(rect.left() + 1, rect.top() + 1).of_size(rect.width() - 2, rect.height() - 2);
            draw_hollow_rect_mut(surface, inner, color);
        }
        if let Some(landmarks) = bbox.landmarks {
            for (x, y) in landmarks {
                draw_filled_circle_mut(surface, (x.round() as i32, y.round() as i32), 2, LANDMARK_COLOR);
            }
        }
        draw_label(surface, font, rect, &face.result.to_string(), color);
    }
}

/// Filled tag above `rect`, or along its top edge when there is no room.
fn draw_label(surface: &mut RgbImage, font: &FontRef<'_>, rect: Rect, text: &str, color: Rgb<u8>) {
    let (text_w, _) = text_size(LABEL_SCALE, font, text);
    let strip_h = LABEL_SCALE.ceil() as u32 + 2 * LABEL_PAD;
    let above = rect.top() - strip_h as i32;
    let top = if above >= 0 { above } else { rect.top().max(0) };

    draw_filled_rect_mut(surface, Rect::at(rect.left(), top).of_size(text_w + 2 * LABEL_PAD, strip_h), color);
    draw_text_mut(
        surface,
        LABEL_TEXT_COLOR,
        rect.left() + LABEL_PAD as i32,
        top + LABEL_PAD as i32,
        LABEL_SCALE,
        font,
        text,
    );
}

/// Writes the frame with boxes drawn on it to a PNG file.
///
/// The file is replaced atomically so viewers never see a partial image.
pub struct PngOverlay {
    path: PathBuf,
    display: Option<(u32, u32)>,
    font: FontRef<'static>,
}

impl PngOverlay {
    pub fn new(path: PathBuf, display: Option<(u32, u32)>) -> Result<Self, RenderError> {
        let font = FontRef::try_from_slice(LABEL_FONT)?;
        Ok(Self { path, display, font })
    }

    /// Build the overlay image without writing it.
    pub fn compose(&self, frame: &Frame, faces: &[RecognizedFace]) -> RgbImage {
        let size = self.display.unwrap_or((frame.width(), frame.height()));
        let mut surface = if size == (frame.width(), frame.height()) {
            frame.image.clone()
        } else {
            imageops::resize(&frame.image, size.0, size.1, FilterType::Triangle)
        };

        let scale = display_scale((frame.width(), frame.height()), size);
        draw_faces(&mut surface, &self.font, faces, scale);
        surface
    }
}

impl RenderTarget for PngOverlay {
    fn render(&mut self, frame: &Frame, faces: &[RecognizedFace]) -> Result<(), RenderError> {
        let surface = self.compose(frame, faces);
        let tmp = self.path.with_extension("tmp.png");
        surface.save(&tmp)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[derive(Serialize)]
struct TickLine<'a> {
    sequence: u32,
    faces: &'a [RecognizedFace],
}

/// Prints match results to a writer (stdout in the CLI).
///
/// Text mode prints only when the set of results changes between ticks;
/// JSON mode prints one line per tick.
pub struct ConsoleOverlay<W: Write> {
    out: W,
    json: bool,
    last: Option<String>,
}

impl<W: Write> ConsoleOverlay<W> {
    pub fn new(out: W, json: bool) -> Self {
        Self { out, json, last: None }
    }
}

pub fn summarize(faces: &[RecognizedFace]) -> String {
    if faces.is_empty() {
        return "no faces".to_string();
    }
    faces
        .iter()
        .map(|f| {
            format!(
                "{} @ [{:.0}, {:.0}, {:.0}x{:.0}]",
                f.result, f.bbox.x, f.bbox.y, f.bbox.width, f.bbox.height
            )
        })
        .collect::<Vec<_>>()
        .join(", ")
}

impl<W: Write> RenderTarget for ConsoleOverlay<W> {
    fn render(&mut self, frame: &Frame, faces: &[RecognizedFace]) -> Result<(), RenderError> {
        if self.json {
            serde_json::to_writer(&mut self.out, &TickLine { sequence: frame.sequence, faces })?;
            writeln!(self.out)?;
            return Ok(());
        }

        // Compare labels only; boxes jitter every frame.
        let key = faces
            .iter()
            .map(|f| f.result.label.as_str())
            .collect::<Vec<_>>()
            .join("|");
        if self.last.as_deref() != Some(key.as_str()) {
            writeln!(self.out, "{}", summarize(faces))?;
            self.last = Some(key);
        }
        Ok(())
    }
}
