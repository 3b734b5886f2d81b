//! Image container handling: sniffing, decoding to [`Image`], encoding results.

use std::fmt;
use std::io::Cursor;
use std::str::FromStr;

use ::image::codecs::jpeg::JpegEncoder;
use ::image::codecs::png::PngEncoder;
use ::image::codecs::webp::WebPEncoder;
use ::image::{ExtendedColorType, ImageEncoder, ImageFormat};
use serde::{Deserialize, Serialize};

use crate::image::{Image, PixelFormat};

/// Containers accepted for upload.
pub const ACCEPTED_FORMATS: &[ImageFormat] = &[
    ImageFormat::Jpeg,
    ImageFormat::Png,
    ImageFormat::WebP,
    ImageFormat::Tiff,
    ImageFormat::Bmp,
];

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("unsupported image format: {0}")]
    UnsupportedFormat(String),

    #[error("failed to decode {format:?} image: {source}")]
    Decode {
        format: ImageFormat,
        #[source]
        source: ::image::ImageError,
    },

    #[error("failed to encode {format} image: {message}")]
    Encode {
        format: OutputFormat,
        message: String,
    },
}

/// Encoding used for upscaled results.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Jpeg,
    Png,
    Webp,
}

impl OutputFormat {
    pub fn mime(&self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::Webp => "image/webp",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::Png => "png",
            Self::Webp => "webp",
        }
    }

    /// Output format matching a file extension, if any.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Some(Self::Jpeg),
            "png" => Some(Self::Png),
            "webp" => Some(Self::Webp),
            _ => None,
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Jpeg => write!(f, "jpeg"),
            Self::Png => write!(f, "png"),
            Self::Webp => write!(f, "webp"),
        }
    }
}

impl FromStr for OutputFormat {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_extension(s).ok_or_else(|| CodecError::UnsupportedFormat(s.to_string()))
    }
}

/// Identifies the container from its magic bytes; only [`ACCEPTED_FORMATS`] pass.
pub fn sniff_format(bytes: &[u8]) -> Result<ImageFormat, CodecError> {
    let format = ::image::guess_format(bytes)
        .map_err(|_| CodecError::UnsupportedFormat("unrecognized container".to_string()))?;
    if ACCEPTED_FORMATS.contains(&format) {
        Ok(format)
    } else {
        Err(CodecError::UnsupportedFormat(format!("{format:?}")))
    }
}

/// Declared upload content types that may carry an accepted container.
pub fn is_accepted_content_type(content_type: &str) -> bool {
    let mime = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    matches!(
        mime.as_str(),
        "image/jpeg"
            | "image/jpg"
            | "image/png"
            | "image/webp"
            | "image/tiff"
            | "image/bmp"
            | "image/x-ms-bmp"
            | "application/octet-stream"
    )
}

/// Decodes an accepted container into an RGB image. Alpha is discarded.
pub fn decode(bytes: &[u8]) -> Result<Image, CodecError> {
    let format = sniff_format(bytes)?;
    let decoded = ::image::load_from_memory_with_format(bytes, format)
        .map_err(|source| CodecError::Decode { format, source })?
        .to_rgb8();
    let (width, height) = decoded.dimensions();
    Image::new(decoded.into_raw(), width, height, PixelFormat::Rgb8)
        .map_err(|e| CodecError::UnsupportedFormat(e.to_string()))
}

/// Encodes `image`; `quality` (1-100) only affects JPEG.
pub fn encode(image: &Image, format: OutputFormat, quality: u8) -> Result<Vec<u8>, CodecError> {
    let color = match image.format() {
        PixelFormat::Luma8 => ExtendedColorType::L8,
        PixelFormat::Rgb8 => ExtendedColorType::Rgb8,
        PixelFormat::Rgba8 => ExtendedColorType::Rgba8,
    };
    let mut out = Cursor::new(Vec::new());
    let (w, h) = (image.width(), image.height());
    let written = match format {
        OutputFormat::Jpeg => JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100))
            .write_image(image.as_bytes(), w, h, color),
        OutputFormat::Png => PngEncoder::new(&mut out).write_image(image.as_bytes(), w, h, color),
        OutputFormat::Webp => {
            WebPEncoder::new_lossless(&mut out).write_image(image.as_bytes(), w, h, color)
        }
    };
    written.map_err(|e| CodecError::Encode {
        format,
        message: e.to_string(),
    })?;
    Ok(out.into_inner())
}
