use image::{codecs::jpeg::JpegEncoder, RgbImage};
use std::borrow::Cow;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to decode image {path}: {source}")]
    Decode {
        path: PathBuf,
        source: image::ImageError,
    },
    #[error("No images found in {0}")]
    Empty(PathBuf),
    #[error("Unsupported source `{0}`")]
    Unsupported(String),
    #[cfg(feature = "opencv")]
    #[error("Camera error: {0}")]
    Camera(#[from] opencv::Error),
}

/// A captured frame, optionally carrying the bytes it was decoded from.
#[derive(Debug, Clone)]
pub struct Frame {
    pub image: RgbImage,
    encoded: Option<Vec<u8>>,
}

impl Frame {
    pub fn new(image: RgbImage) -> Self {
        Self {
            image,
            encoded: None,
        }
    }

    pub fn with_encoded(image: RgbImage, encoded: Vec<u8>) -> Self {
        Self {
            image,
            encoded: Some(encoded),
        }
    }

    /// Bytes to submit: the original file bytes if any, otherwise a fresh JPEG.
    pub fn payload(&self, jpeg_quality: u8) -> Result<Cow<'_, [u8]>, image::ImageError> {
        match &self.encoded {
            Some(bytes) => Ok(Cow::Borrowed(bytes)),
            None => encode_jpeg(&self.image, jpeg_quality).map(Cow::Owned),
        }
    }
}

pub fn encode_jpeg(image: &RgbImage, quality: u8) -> Result<Vec<u8>, image::ImageError> {
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100)).encode_image(image)?;
    Ok(buf)
}

/// Supplies frames to the streaming loop.
pub trait FrameSource {
    /// `Ok(None)` means the source is exhausted.
    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError>;

    fn release(&mut self);
}

fn read_image(path: &Path) -> Result<Frame, SourceError> {
    let bytes = std::fs::read(path).map_err(|source| SourceError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let image = image::load_from_memory(&bytes)
        .map_err(|source| SourceError::Decode {
            path: path.to_path_buf(),
            source,
        })?
        .to_rgb8();
    Ok(Frame::with_encoded(image, bytes))
}

/// Loads a still image; the original file bytes are kept for submission.
pub fn open_still_image(path: impl AsRef<Path>) -> Result<Frame, SourceError> {
    read_image(path.as_ref())
}

/// Replays the images of a directory in file-name order.
pub struct ImageSequence {
    paths: std::vec::IntoIter<PathBuf>,
    released: bool,
}

const IMAGE_EXTENSIONS: [&str; 4] = ["jpg", "jpeg", "png", "bmp"];

impl ImageSequence {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, SourceError> {
        let dir = dir.as_ref();
        let entries = std::fs::read_dir(dir).map_err(|source| SourceError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.extension()
                    .and_then(|ext| ext.to_str())
                    .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_lowercase().as_str()))
                    .unwrap_or(false)
            })
            .collect();

        if paths.is_empty() {
            return Err(SourceError::Empty(dir.to_path_buf()));
        }
        paths.sort();

        tracing::info!("Replaying {} images from {}", paths.len(), dir.display());
        Ok(Self {
            paths: paths.into_iter(),
            released: false,
        })
    }
}

impl FrameSource for ImageSequence {
    fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        if self.released {
            return Ok(None);
        }
        match self.paths.next() {
            // Sequence frames are re-encoded like camera frames.
            Some(path) => read_image(&path).map(|frame| Some(Frame::new(frame.image))),
            None => Ok(None),
        }
    }

    fn release(&mut self) {
        self.released = true;
        tracing::debug!("Image sequence released");
    }
}

/// Opens the source used by the streaming mode.
///
/// An integer selects a camera device, a directory an image sequence and any
/// other path a video file. Cameras and video files need the `opencv` feature.
pub fn open_stream_source(source: &str) -> Result<Box<dyn FrameSource + Send>, SourceError> {
    let path = Path::new(source);
    if path.is_dir() {
        return Ok(Box::new(ImageSequence::open(path)?));
    }

    open_capture(source)
}

#[cfg(feature = "opencv")]
fn open_capture(source: &str) -> Result<Box<dyn FrameSource + Send>, SourceError> {
    let camera = match source.parse::<i32>() {
        Ok(index) => camera::CameraSource::open_device(index)?,
        Err(_) => camera::CameraSource::open_file(source)?,
    };
    Ok(Box::new(camera))
}

#[cfg(not(feature = "opencv"))]
fn open_capture(source: &str) -> Result<Box<dyn FrameSource + Send>, SourceError> {
    Err(SourceError::Unsupported(format!(
        "{} (camera and video capture require the `opencv` feature)",
        source
    )))
}

#[cfg(feature = "opencv")]
pub mod camera {
    use super::{Frame, FrameSource, SourceError};
    use image::RgbImage;
    use opencv::{core::Mat, imgproc, prelude::*, videoio};

    pub struct CameraSource {
        capture: videoio::VideoCapture,
        released: bool,
    }

    impl CameraSource {
        pub fn open_device(index: i32) -> Result<Self, SourceError> {
            let capture = videoio::VideoCapture::new(index, videoio::CAP_ANY)?;
            Self::checked(capture, &index.to_string())
        }

        pub fn open_file(path: &str) -> Result<Self, SourceError> {
            let capture = videoio::VideoCapture::from_file(path, videoio::CAP_ANY)?;
            Self::checked(capture, path)
        }

        fn checked(capture: videoio::VideoCapture, name: &str) -> Result<Self, SourceError> {
            if !capture.is_opened()? {
                return Err(SourceError::Unsupported(format!(
                    "cannot open video source {}",
                    name
                )));
            }
            tracing::info!("Opened video source {}", name);
            Ok(Self {
                capture,
                released: false,
            })
        }
    }

    impl FrameSource for CameraSource {
        fn next_frame(&mut self) -> Result<Option<Frame>, SourceError> {
            if self.released {
                return Ok(None);
            }
            let mut bgr = Mat::default();
            if !self.capture.read(&mut bgr)? || bgr.empty() {
                return Ok(None);
            }

            let mut rgb = Mat::default();
            imgproc::cvt_color_def(&bgr, &mut rgb, imgproc::COLOR_BGR2RGB)?;
            let (width, height) = (rgb.cols() as u32, rgb.rows() as u32);
            let data = rgb.data_bytes()?.to_vec();

            let image = RgbImage::from_raw(width, height, data).ok_or_else(|| {
                SourceError::Unsupported("camera frame has an unexpected layout".to_string())
            })?;
            Ok(Some(Frame::new(image)))
        }

        fn release(&mut self) {
            self.released = true;
            if let Err(e) = self.capture.release() {
                tracing::warn!("Failed to release camera: {:?}", e);
            }
        }
    }
}
