use crate::detection::Detection;
use crate::source::{encode_jpeg, Frame};
use ab_glyph::{FontVec, PxScale};
use image::{Rgb, RgbImage};
use imageproc::{
    drawing::{draw_hollow_rect_mut, draw_text_mut},
    rect::Rect,
};
use std::path::{Path, PathBuf};
use thiserror::Error;

const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const BOX_THICKNESS: i32 = 2;
const LABEL_SCALE: f32 = 16.0;
const LABEL_OFFSET: i32 = 18;
const RENDER_JPEG_QUALITY: u8 = 90;

const FALLBACK_FONTS: &[&str] = &[
    "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf",
    "/usr/share/fonts/dejavu-sans-fonts/DejaVuSans.ttf",
    "/usr/share/fonts/TTF/DejaVuSans.ttf",
    "/System/Library/Fonts/Supplemental/Arial.ttf",
    "C:\\Windows\\Fonts\\arial.ttf",
];

#[derive(Error, Debug)]
pub enum RenderError {
    #[error("Failed to encode annotated frame: {0}")]
    Encode(#[from] image::ImageError),
    #[error("Failed to write {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid font file {0}")]
    Font(PathBuf),
}

/// Draws each detection as a box with a `class: confidence` label.
///
/// Boxes are clipped to the image; degenerate boxes are skipped.
pub fn annotate(image: &RgbImage, detections: &[Detection], font: Option<&FontVec>) -> RgbImage {
    let mut annotated = image.clone();
    if image.width() == 0 || image.height() == 0 {
        return annotated;
    }
    let (width, height) = (image.width() as i32, image.height() as i32);

    for det in detections {
        let bbox = det.bounding_box;
        let x1 = bbox.x_min.clamp(0, width - 1);
        let y1 = bbox.y_min.clamp(0, height - 1);
        let x2 = bbox.x_max.clamp(0, width - 1);
        let y2 = bbox.y_max.clamp(0, height - 1);
        if x1 >= x2 || y1 >= y2 {
            continue;
        }

        for t in 0..BOX_THICKNESS {
            let (w, h) = (x2 - x1 + 1 - 2 * t, y2 - y1 + 1 - 2 * t);
            if w <= 0 || h <= 0 {
                break;
            }
            draw_hollow_rect_mut(
                &mut annotated,
                Rect::at(x1 + t, y1 + t).of_size(w as u32, h as u32),
                BOX_COLOR,
            );
        }

        if let Some(font) = font {
            let label = format!("{}: {:.2}", det.class_name, det.confidence);
            let y = if y1 >= LABEL_OFFSET { y1 - LABEL_OFFSET } else { y1 + 2 };
            draw_text_mut(
                &mut annotated,
                BOX_COLOR,
                x1,
                y,
                PxScale::from(LABEL_SCALE),
                font,
                &label,
            );
        }
    }

    annotated
}

/// Presents frames to the user.
pub trait Renderer {
    /// `detections` is `None` when no response has ever been received.
    fn render(
        &mut self,
        frame: &Frame,
        detections: Option<&[Detection]>,
    ) -> Result<(), RenderError>;
}

/// Writes the annotated frame to `<output_dir>/<file_name>`, replacing the
/// previous one, so the file always shows the latest rendered frame.
pub struct AnnotatedImageWriter {
    path: PathBuf,
    font: Option<FontVec>,
}

impl AnnotatedImageWriter {
    pub fn new(
        output_dir: impl AsRef<Path>,
        file_name: &str,
        font_path: Option<&Path>,
    ) -> Result<Self, RenderError> {
        let output_dir = output_dir.as_ref();
        std::fs::create_dir_all(output_dir).map_err(|source| RenderError::Io {
            path: output_dir.to_path_buf(),
            source,
        })?;

        let font = resolve_font(font_path, FALLBACK_FONTS)?;
        if font.is_none() {
            tracing::warn!("No usable font found, labels will not be drawn; set render.font_path");
        }

        Ok(Self {
            path: output_dir.join(file_name),
            font,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Uses the configured font, which must load, or the first system font found.
fn resolve_font(
    configured: Option<&Path>,
    fallbacks: &[&str],
) -> Result<Option<FontVec>, RenderError> {
    if let Some(path) = configured {
        return load_font(path).map(Some);
    }
    let font = fallbacks
        .iter()
        .map(Path::new)
        .filter(|path| path.is_file())
        .find_map(|path| load_font(path).ok());
    Ok(font)
}

fn load_font(path: &Path) -> Result<FontVec, RenderError> {
    let data = std::fs::read(path).map_err(|source| RenderError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    FontVec::try_from_vec(data).map_err(|_| RenderError::Font(path.to_path_buf()))
}

impl Renderer for AnnotatedImageWriter {
    fn render(
        &mut self,
        frame: &Frame,
        detections: Option<&[Detection]>,
    ) -> Result<(), RenderError> {
        let bytes = match detections {
            Some(detections) if !detections.is_empty() => {
                let annotated = annotate(&frame.image, detections, self.font.as_ref());
                encode_jpeg(&annotated, RENDER_JPEG_QUALITY)?
            }
            _ => encode_jpeg(&frame.image, RENDER_JPEG_QUALITY)?,
        };

        // Write then rename so readers never see a half-written frame.
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, &bytes).map_err(|source| RenderError::Io {
            path: tmp.clone(),
            source,
        })?;
        std::fs::rename(&tmp, &self.path).map_err(|source| RenderError::Io {
            path: self.path.clone(),
            source,
        })?;
        Ok(())
    }
}
