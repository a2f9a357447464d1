//! Local image work that runs after an artifact is on disk: background
//! removal, the optional JPEG copy and the fixed-size video frame.

use std::collections::VecDeque;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageError, ImageFormat, Rgba, RgbaImage};
use quickimage_contracts::library::{write_file_atomic, StoreError};
use quickimage_contracts::runs::BackgroundMode;
use thiserror::Error;
use tokio::fs;
use tokio::task::{self, JoinError};
use tracing::debug;

use crate::config::BackgroundRemovalConfig;

pub const JPEG_COPY_QUALITY: u8 = 90;
pub const VIDEO_FRAME_WIDTH: u32 = 1024;
pub const VIDEO_FRAME_HEIGHT: u32 = 576;

const BACKGROUND_REMOVED_SUFFIX: &str = "-background-removed";

/// Post-processing failures never fail a generation; the orchestrator turns
/// them into warnings.
#[derive(Debug, Error)]
pub enum PostProcessError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{} is not a decodable image: {source}", path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: ImageError,
    },
    #[error("image encode failed: {0}")]
    Encode(#[source] ImageError),
    #[error("cannot replace {} in place: only PNG sources keep transparency", path.display())]
    UnsupportedFormat { path: PathBuf },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("image worker stopped: {0}")]
    Worker(#[from] JoinError),
}

#[derive(Debug, Clone, Copy)]
pub struct PostProcessor {
    config: BackgroundRemovalConfig,
}

impl PostProcessor {
    pub fn new(config: BackgroundRemovalConfig) -> Self {
        Self { config }
    }

    /// Where `KeepBothVersions` writes its result for `source`.
    pub fn derived_path(source: &Path) -> PathBuf {
        let stem = source
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or("image");
        source.with_file_name(format!("{stem}{BACKGROUND_REMOVED_SUFFIX}.png"))
    }

    /// Removes the background of the image at `source` and returns the path
    /// of the transparent PNG.
    pub async fn remove_background(
        &self,
        source: &Path,
        mode: BackgroundMode,
    ) -> Result<PathBuf, PostProcessError> {
        let destination = match mode {
            BackgroundMode::KeepBothVersions => Self::derived_path(source),
            BackgroundMode::Replace => {
                if !has_png_extension(source) {
                    return Err(PostProcessError::UnsupportedFormat {
                        path: source.to_path_buf(),
                    });
                }
                source.to_path_buf()
            }
        };

        let bytes = read_source(source).await?;
        let tolerance = self.config.tolerance;
        let path = source.to_path_buf();
        let encoded = task::spawn_blocking(move || -> Result<Vec<u8>, PostProcessError> {
            let decoded = decode(&path, &bytes)?;
            let cleared = clear_background(decoded.to_rgba8(), tolerance);
            encode(&DynamicImage::ImageRgba8(cleared), ImageFormat::Png)
        })
        .await??;

        write_file_atomic(&destination, &encoded).await?;
        debug!(source = %source.display(), destination = %destination.display(), "background removed");
        Ok(destination)
    }

    /// Writes a quality-90 JPEG rendition of `source` to `destination`.
    pub async fn save_jpeg_copy(
        &self,
        source: &Path,
        destination: &Path,
    ) -> Result<PathBuf, PostProcessError> {
        let bytes = read_source(source).await?;
        let path = source.to_path_buf();
        let encoded = task::spawn_blocking(move || -> Result<Vec<u8>, PostProcessError> {
            let decoded = decode(&path, &bytes)?;
            let rgb = DynamicImage::ImageRgb8(decoded.to_rgb8());
            let mut out = Cursor::new(Vec::new());
            rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut out, JPEG_COPY_QUALITY))
                .map_err(PostProcessError::Encode)?;
            Ok(out.into_inner())
        })
        .await??;

        write_file_atomic(destination, &encoded).await?;
        Ok(destination.to_path_buf())
    }

    /// Scales the image to 1024 px wide (or up to cover 576 px of height)
    /// and crops the top-left 1024x576 region, encoded as PNG.
    pub async fn prepare_video_frame(&self, source: &Path) -> Result<Vec<u8>, PostProcessError> {
        let bytes = read_source(source).await?;
        let path = source.to_path_buf();
        let frame = task::spawn_blocking(move || -> Result<Vec<u8>, PostProcessError> {
            let decoded = decode(&path, &bytes)?;
            encode(&video_frame(&decoded), ImageFormat::Png)
        })
        .await??;
        Ok(frame)
    }
}

impl Default for PostProcessor {
    fn default() -> Self {
        Self::new(BackgroundRemovalConfig::default())
    }
}

fn has_png_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("png"))
        .unwrap_or(false)
}

async fn read_source(path: &Path) -> Result<Vec<u8>, PostProcessError> {
    fs::read(path).await.map_err(|source| PostProcessError::Read {
        path: path.to_path_buf(),
        source,
    })
}

fn decode(path: &Path, bytes: &[u8]) -> Result<DynamicImage, PostProcessError> {
    image::load_from_memory(bytes).map_err(|source| PostProcessError::Decode {
        path: path.to_path_buf(),
        source,
    })
}

fn encode(image: &DynamicImage, format: ImageFormat) -> Result<Vec<u8>, PostProcessError> {
    let mut out = Cursor::new(Vec::new());
    image
        .write_to(&mut out, format)
        .map_err(PostProcessError::Encode)?;
    Ok(out.into_inner())
}

fn video_frame(image: &DynamicImage) -> DynamicImage {
    let (width, height) = (image.width().max(1), image.height().max(1));
    let scale = f64::max(
        f64::from(VIDEO_FRAME_WIDTH) / f64::from(width),
        f64::from(VIDEO_FRAME_HEIGHT) / f64::from(height),
    );
    let scaled_width = ((f64::from(width) * scale).round() as u32).max(VIDEO_FRAME_WIDTH);
    let scaled_height = ((f64::from(height) * scale).round() as u32).max(VIDEO_FRAME_HEIGHT);
    image
        .resize_exact(scaled_width, scaled_height, FilterType::Lanczos3)
        .crop_imm(0, 0, VIDEO_FRAME_WIDTH, VIDEO_FRAME_HEIGHT)
}

fn color_distance(a: &Rgba<u8>, b: [f32; 3]) -> f32 {
    let dr = f32::from(a[0]) - b[0];
    let dg = f32::from(a[1]) - b[1];
    let db = f32::from(a[2]) - b[2];
    (dr * dr + dg * dg + db * db).sqrt()
}

fn border_average(image: &RgbaImage) -> [f32; 3] {
    let (width, height) = image.dimensions();
    let mut sum = [0f64; 3];
    let mut count = 0f64;
    for (x, y, pixel) in image.enumerate_pixels() {
        if x == 0 || y == 0 || x + 1 == width || y + 1 == height {
            for channel in 0..3 {
                sum[channel] += f64::from(pixel[channel]);
            }
            count += 1.0;
        }
    }
    if count == 0.0 {
        return [0.0; 3];
    }
    [
        (sum[0] / count) as f32,
        (sum[1] / count) as f32,
        (sum[2] / count) as f32,
    ]
}

/// Flood-fills from every border pixel through pixels close to the average
/// border colour and makes them transparent. Pixels next to the cleared
/// region within twice the tolerance fade out proportionally.
fn clear_background(mut image: RgbaImage, tolerance: u8) -> RgbaImage {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return image;
    }
    let background = border_average(&image);
    let hard = f32::from(tolerance);
    let soft = hard * 2.0;
    let index = |x: u32, y: u32| (y as usize) * (width as usize) + x as usize;

    let mut cleared = vec![false; (width as usize) * (height as usize)];
    let mut queue = VecDeque::new();
    for x in 0..width {
        queue.push_back((x, 0));
        queue.push_back((x, height - 1));
    }
    for y in 0..height {
        queue.push_back((0, y));
        queue.push_back((width - 1, y));
    }

    while let Some((x, y)) = queue.pop_front() {
        let slot = index(x, y);
        if cleared[slot] || color_distance(image.get_pixel(x, y), background) > hard {
            continue;
        }
        cleared[slot] = true;
        if x > 0 {
            queue.push_back((x - 1, y));
        }
        if y > 0 {
            queue.push_back((x, y - 1));
        }
        if x + 1 < width {
            queue.push_back((x + 1, y));
        }
        if y + 1 < height {
            queue.push_back((x, y + 1));
        }
    }

    let touches_cleared = |x: u32, y: u32| {
        (x > 0 && cleared[index(x - 1, y)])
            || (y > 0 && cleared[index(x, y - 1)])
            || (x + 1 < width && cleared[index(x + 1, y)])
            || (y + 1 < height && cleared[index(x, y + 1)])
    };

    let mut alpha = Vec::with_capacity(cleared.len());
    for (x, y, pixel) in image.enumerate_pixels() {
        let value = if cleared[index(x, y)] {
            0
        } else if soft > hard && touches_cleared(x, y) {
            let distance = color_distance(pixel, background);
            if distance < soft {
                let fraction = (distance - hard) / (soft - hard);
                (f32::from(pixel[3]) * fraction.clamp(0.0, 1.0)).round() as u8
            } else {
                pixel[3]
            }
        } else {
            pixel[3]
        };
        alpha.push(value);
    }
    for ((_, _, pixel), value) in image.enumerate_pixels_mut().zip(alpha) {
        pixel[3] = value;
    }
    image
}
