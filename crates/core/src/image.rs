use serde::{Deserialize, Serialize};

use crate::error::UpscaleError;

/// Channel layout of an 8-bit interleaved pixel buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelFormat {
    Luma8,
    Rgb8,
    Rgba8,
}

impl PixelFormat {
    pub fn channels(&self) -> usize {
        match self {
            Self::Luma8 => 1,
            Self::Rgb8 => 3,
            Self::Rgba8 => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// `None` when either side overflows `u32`.
    pub fn scaled(&self, factor: u32) -> Option<Self> {
        Some(Self {
            width: self.width.checked_mul(factor)?,
            height: self.height.checked_mul(factor)?,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

/// Row-major interleaved 8-bit image. Never mutated once handed to the next stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Image {
    data: Vec<u8>,
    width: u32,
    height: u32,
    format: PixelFormat,
}

impl Image {
    pub fn new(
        data: Vec<u8>,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Result<Self, UpscaleError> {
        let expected = width as usize * height as usize * format.channels();
        if data.len() != expected {
            return Err(UpscaleError::InvalidInput(format!(
                "buffer holds {} bytes, {width}x{height} {format:?} needs {expected}",
                data.len()
            )));
        }
        Ok(Self {
            data,
            width,
            height,
            format,
        })
    }

    /// Zero-filled image of the given size.
    pub fn blank(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            data: vec![0; width as usize * height as usize * format.channels()],
            width,
            height,
            format,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dimensions(&self) -> Dimensions {
        Dimensions::new(self.width, self.height)
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn channels(&self) -> usize {
        self.format.channels()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    /// Bytes per row.
    pub fn stride(&self) -> usize {
        self.width as usize * self.channels()
    }

    /// Interleaved bytes of row `y` from column `x` spanning `len` pixels.
    pub fn row_span(&self, x: u32, y: u32, len: u32) -> &[u8] {
        let c = self.channels();
        let start = y as usize * self.stride() + x as usize * c;
        &self.data[start..start + len as usize * c]
    }

    pub(crate) fn row_span_mut(&mut self, x: u32, y: u32, len: u32) -> &mut [u8] {
        let c = self.channels();
        let start = y as usize * self.stride() + x as usize * c;
        &mut self.data[start..start + len as usize * c]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_rejects_mismatched_buffer() {
        let err = Image::new(vec![0; 10], 2, 2, PixelFormat::Rgb8).unwrap_err();
        assert!(matches!(err, UpscaleError::InvalidInput(_)));
    }

    #[test]
    fn row_span_addresses_interleaved_pixels() {
        let data: Vec<u8> = (0..24).collect();
        let image = Image::new(data, 4, 2, PixelFormat::Rgb8).unwrap();
        assert_eq!(image.stride(), 12);
        assert_eq!(image.row_span(1, 1, 2), &[15, 16, 17, 18, 19, 20]);
    }

    #[test]
    fn dimensions_scale_and_emptiness() {
        let dims = Dimensions::new(3, 5);
        assert_eq!(dims.scaled(4), Some(Dimensions::new(12, 20)));
        assert_eq!(Dimensions::new(70_000, 5).scaled(70_000), None);
        assert!(!dims.is_empty());
        assert!(Dimensions::new(0, 5).is_empty());
    }
}
