use image::{DynamicImage, GrayImage, RgbaImage};

use crate::error::{Result, ScanError};

/// A decoded image of a voted ballot, behind the two capabilities the
/// pipeline needs: brightness at a pixel and the RGBA neighborhood around
/// one. Grayscale decodes keep their single channel as a fast path;
/// everything else is widened to RGBA once at construction.
#[derive(Debug)]
pub enum ScanFrame {
    Gray(GrayImage),
    Rgba(RgbaImage),
}

impl ScanFrame {
    pub fn from_dynamic(image: DynamicImage) -> Self {
        match image {
            DynamicImage::ImageLuma8(gray) => Self::Gray(gray),
            other => Self::Rgba(other.to_rgba8()),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let image = image::load_from_memory(bytes)
            .map_err(|err| ScanError::InputDecode(format!("scan image: {err}")))?;
        Ok(Self::from_dynamic(image))
    }

    pub fn width(&self) -> u32 {
        match self {
            Self::Gray(im) => im.width(),
            Self::Rgba(im) => im.width(),
        }
    }

    pub fn height(&self) -> u32 {
        match self {
            Self::Gray(im) => im.height(),
            Self::Rgba(im) => im.height(),
        }
    }

    /// Brightness at `(x, y)` in [0, 255].
    #[inline]
    pub fn luma(&self, x: u32, y: u32) -> u8 {
        match self {
            Self::Gray(im) => im.get_pixel(x, y).0[0],
            Self::Rgba(im) => {
                let [r, g, b, _] = im.get_pixel(x, y).0;
                luma_from_rgb(r, g, b)
            }
        }
    }

    #[inline]
    pub fn rgba(&self, x: u32, y: u32) -> [u8; 4] {
        match self {
            Self::Gray(im) => {
                let v = im.get_pixel(x, y).0[0];
                [v, v, v, 255]
            }
            Self::Rgba(im) => im.get_pixel(x, y).0,
        }
    }
}

/// Standard luma conversion: `0.299 R + 0.587 G + 0.114 B`.
#[inline]
pub fn luma_from_rgb(r: u8, g: u8, b: u8) -> u8 {
    ((299 * u32::from(r) + 587 * u32::from(g) + 114 * u32::from(b) + 500) / 1000) as u8
}
