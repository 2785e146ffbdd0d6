//! Built-in image operations: `metadata`, `thumbnail` and `solid`.
//!
//! Decoding goes through a per-unit [`ImageEngine`] that carries the decoder
//! limits. It is created on the first request a unit sees and reused for the
//! rest of that unit's life.

use super::{Transform, TransformRegistry};
use anyhow::{Context, Result, bail, ensure};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::codecs::webp::WebPEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, ImageReader, Limits, Rgb, RgbImage};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::io::Cursor;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tracing::debug;

/// Default JPEG quality.
pub const DEFAULT_QUALITY: u8 = 80;

/// Largest accepted input side in pixels.
const MAX_INPUT_SIDE: u32 = 16_384;

/// Largest decoder allocation (512 MiB).
const MAX_DECODE_ALLOC: u64 = 512 * 1024 * 1024;

/// Where an input image comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ImageSource {
    /// File on disk.
    Path { path: PathBuf },
    /// Base64-encoded image bytes.
    Data { data: String },
}

impl ImageSource {
    pub fn path(path: impl Into<PathBuf>) -> Self {
        Self::Path { path: path.into() }
    }

    pub fn bytes(bytes: &[u8]) -> Self {
        Self::Data {
            data: STANDARD.encode(bytes),
        }
    }
}

impl fmt::Display for ImageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path { path } => write!(f, "{}", path.display()),
            Self::Data { data } => write!(f, "<{} base64 bytes>", data.len()),
        }
    }
}

/// Encoded output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Lossless WebP.
    #[default]
    Webp,
    Jpeg,
    Png,
}

impl OutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Webp => "webp",
            Self::Jpeg => "jpg",
            Self::Png => "png",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            Self::Webp => "image/webp",
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
        }
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "webp" => Ok(Self::Webp),
            "jpeg" | "jpg" => Ok(Self::Jpeg),
            "png" => Ok(Self::Png),
            _ => Err(format!(
                "Invalid output format '{}'. Valid options: webp, jpeg, png",
                s
            )),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Webp => write!(f, "webp"),
            Self::Jpeg => write!(f, "jpeg"),
            Self::Png => write!(f, "png"),
        }
    }
}

/// Payload of the `metadata` operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataRequest {
    pub source: ImageSource,
}

/// Result of the `metadata` operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageMetadata {
    pub width: u32,
    pub height: u32,
    /// Detected container format, e.g. "png".
    pub format: String,
    pub content_type: String,
    /// Decoded pixel layout, e.g. "Rgba8".
    pub color: String,
    pub channels: u8,
    pub has_alpha: bool,
}

fn default_crop() -> bool {
    true
}

/// Payload of the `thumbnail` operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThumbnailRequest {
    pub source: ImageSource,
    pub max_side_px: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<u8>,
    /// Leave images already within `max_side_px` at their size.
    #[serde(default)]
    pub without_enlargement: bool,
    /// Center-crop to a square; otherwise keep the aspect ratio.
    #[serde(default = "default_crop")]
    pub crop: bool,
    #[serde(default)]
    pub format: OutputFormat,
    /// Write the result here instead of returning it inline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<PathBuf>,
}

impl ThumbnailRequest {
    pub fn new(source: ImageSource, max_side_px: u32) -> Self {
        Self {
            source,
            max_side_px,
            quality: None,
            without_enlargement: false,
            crop: true,
            format: OutputFormat::default(),
            output: None,
        }
    }
}

/// Background colour of a `solid` image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Background {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Default for Background {
    fn default() -> Self {
        Self {
            r: 255,
            g: 255,
            b: 255,
        }
    }
}

/// Payload of the `solid` operation: a square of one colour.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolidRequest {
    pub max_side_px: u32,
    #[serde(default)]
    pub background: Background,
    #[serde(default)]
    pub format: OutputFormat,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<PathBuf>,
}

/// Result of `thumbnail` and `solid`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EncodedImage {
    pub width: u32,
    pub height: u32,
    /// Encoded size in bytes.
    pub size: usize,
    pub format: OutputFormat,
    pub content_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<PathBuf>,
    /// Base64 image bytes when no `output` path was given.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

/// Decoder state shared by all requests of one unit.
#[derive(Debug, Clone)]
pub struct ImageEngine {
    limits: Limits,
}

impl Default for ImageEngine {
    fn default() -> Self {
        let mut limits = Limits::default();
        limits.max_image_width = Some(MAX_INPUT_SIDE);
        limits.max_image_height = Some(MAX_INPUT_SIDE);
        limits.max_alloc = Some(MAX_DECODE_ALLOC);
        Self::with_limits(limits)
    }
}

impl ImageEngine {
    pub fn with_limits(limits: Limits) -> Self {
        Self { limits }
    }

    /// Decode `source`, returning the image and its detected format.
    pub fn load(&self, source: &ImageSource) -> Result<(DynamicImage, ImageFormat)> {
        let (image, format) = match source {
            ImageSource::Path { path } => {
                let reader = ImageReader::open(path)
                    .with_context(|| format!("Failed to open {}", path.display()))?
                    .with_guessed_format()
                    .with_context(|| format!("Failed to read {}", path.display()))?;
                self.decode(reader)?
            }
            ImageSource::Data { data } => {
                let bytes = STANDARD
                    .decode(data.trim())
                    .context("Image data is not valid base64")?;
                let reader = ImageReader::new(Cursor::new(bytes))
                    .with_guessed_format()
                    .context("Failed to read image data")?;
                self.decode(reader)?
            }
        };
        Ok((image, format))
    }

    fn decode<R>(&self, mut reader: ImageReader<R>) -> Result<(DynamicImage, ImageFormat)>
    where
        R: std::io::BufRead + std::io::Seek,
    {
        let Some(format) = reader.format() else {
            bail!("Unrecognized image format");
        };
        reader.limits(self.limits.clone());
        let image = reader
            .decode()
            .with_context(|| format!("Failed to decode {:?} image", format))?;
        Ok((image, format))
    }
}

/// Lazily created engine, one per registry.
type SharedEngine = Arc<OnceLock<ImageEngine>>;

fn engine(cell: &SharedEngine) -> &ImageEngine {
    cell.get_or_init(|| {
        debug!("Initializing image engine");
        ImageEngine::default()
    })
}

/// Read dimensions and pixel layout.
pub fn metadata(engine: &ImageEngine, request: &MetadataRequest) -> Result<ImageMetadata> {
    let (image, format) = engine.load(&request.source)?;
    let color = image.color();
    Ok(ImageMetadata {
        width: image.width(),
        height: image.height(),
        format: format!("{:?}", format).to_lowercase(),
        content_type: format.to_mime_type().to_string(),
        color: format!("{:?}", color),
        channels: color.channel_count(),
        has_alpha: color.has_alpha(),
    })
}

/// Output sides share the decoder's bound; an oversized buffer aborts rather than panics.
fn check_side(side: u32) -> Result<()> {
    ensure!(side > 0, "max_side_px must be positive");
    ensure!(
        side <= MAX_INPUT_SIDE,
        "max_side_px {} exceeds the limit of {}",
        side,
        MAX_INPUT_SIDE
    );
    Ok(())
}

/// Resize to fit `max_side_px` and re-encode.
pub fn thumbnail(engine: &ImageEngine, request: &ThumbnailRequest) -> Result<EncodedImage> {
    check_side(request.max_side_px)?;
    let quality = quality(request.quality)?;
    let started = Instant::now();

    let (image, _) = engine.load(&request.source)?;
    let side = request.max_side_px;
    let within_bounds = image.width() <= side && image.height() <= side;

    let resized = if request.without_enlargement && within_bounds {
        image
    } else if request.crop {
        image.resize_to_fill(side, side, FilterType::Lanczos3)
    } else {
        image.resize(side, side, FilterType::Lanczos3)
    };

    let bytes = encode(&resized, request.format, quality)?;
    debug!(
        source = %request.source,
        width = resized.width(),
        height = resized.height(),
        size = bytes.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Thumbnail encoded"
    );
    finish(bytes, &resized, request.format, request.output.clone())
}

/// Square image of a single colour.
pub fn solid(request: &SolidRequest) -> Result<EncodedImage> {
    check_side(request.max_side_px)?;
    let Background { r, g, b } = request.background;
    let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(
        request.max_side_px,
        request.max_side_px,
        Rgb([r, g, b]),
    ));
    let bytes = encode(&image, request.format, DEFAULT_QUALITY)?;
    finish(bytes, &image, request.format, request.output.clone())
}

fn quality(requested: Option<u8>) -> Result<u8> {
    match requested {
        None => Ok(DEFAULT_QUALITY),
        Some(q) if (1..=100).contains(&q) => Ok(q),
        Some(q) => bail!("quality must be between 1 and 100, got {}", q),
    }
}

fn encode(image: &DynamicImage, format: OutputFormat, quality: u8) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    match format {
        OutputFormat::Webp => DynamicImage::ImageRgba8(image.to_rgba8())
            .write_with_encoder(WebPEncoder::new_lossless(&mut buf)),
        // JPEG has no alpha channel
        OutputFormat::Jpeg => DynamicImage::ImageRgb8(image.to_rgb8())
            .write_with_encoder(JpegEncoder::new_with_quality(&mut buf, quality)),
        OutputFormat::Png if image.color().has_alpha() => {
            DynamicImage::ImageRgba8(image.to_rgba8()).write_with_encoder(PngEncoder::new(&mut buf))
        }
        OutputFormat::Png => {
            DynamicImage::ImageRgb8(image.to_rgb8()).write_with_encoder(PngEncoder::new(&mut buf))
        }
    }
    .with_context(|| format!("Failed to encode {}", format))?;
    Ok(buf)
}

fn finish(
    bytes: Vec<u8>,
    image: &DynamicImage,
    format: OutputFormat,
    output: Option<PathBuf>,
) -> Result<EncodedImage> {
    let size = bytes.len();
    let (output, data) = match output {
        Some(path) => {
            std::fs::write(&path, &bytes)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            (Some(path), None)
        }
        None => (None, Some(STANDARD.encode(&bytes))),
    };
    Ok(EncodedImage {
        width: image.width(),
        height: image.height(),
        size,
        format,
        content_type: format.content_type().to_string(),
        output,
        data,
    })
}

/// `metadata` operation.
#[derive(Debug, Clone, Default)]
pub struct MetadataTransform {
    engine: SharedEngine,
}

impl Transform for MetadataTransform {
    fn apply(&self, payload: Value) -> Result<Value> {
        let request: MetadataRequest =
            serde_json::from_value(payload).context("Invalid metadata request")?;
        Ok(serde_json::to_value(metadata(engine(&self.engine), &request)?)?)
    }
}

/// `thumbnail` operation.
#[derive(Debug, Clone, Default)]
pub struct ThumbnailTransform {
    engine: SharedEngine,
}

impl Transform for ThumbnailTransform {
    fn apply(&self, payload: Value) -> Result<Value> {
        let request: ThumbnailRequest =
            serde_json::from_value(payload).context("Invalid thumbnail request")?;
        Ok(serde_json::to_value(thumbnail(engine(&self.engine), &request)?)?)
    }
}

/// `solid` operation.
#[derive(Debug, Clone, Copy, Default)]
pub struct SolidTransform;

impl Transform for SolidTransform {
    fn apply(&self, payload: Value) -> Result<Value> {
        let request: SolidRequest =
            serde_json::from_value(payload).context("Invalid solid request")?;
        Ok(serde_json::to_value(solid(&request)?)?)
    }
}

/// Register the built-in operations, sharing one lazily created engine.
pub fn register(registry: &mut TransformRegistry) {
    let engine = SharedEngine::default();
    registry
        .register(
            "metadata",
            MetadataTransform {
                engine: Arc::clone(&engine),
            },
        )
        .register("thumbnail", ThumbnailTransform { engine })
        .register("solid", SolidTransform);
}
