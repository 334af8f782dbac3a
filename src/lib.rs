//! SAD block-matching stereo correspondence.
//!
//! Computes a dense disparity map between a rectified grayscale stereo pair
//! using sliding-window Sum-of-Absolute-Differences block matching: both
//! images are run through a normalized-response pre-filter, then a
//! cache-friendly incrementally-updated 2D correlation search selects the
//! minimum-cost disparity per pixel, rejects low-texture and ambiguous
//! matches, and refines the winner with parabolic sub-pixel interpolation.
//!
//! Disparities are reported in signed 16-bit fixed point with 4 fractional
//! bits (stored value = true disparity * 16). Pixels with no reliable match
//! hold the sentinel `(min_disparity - 1) << 4`.

use image::GrayImage;

pub mod block_matching;
pub mod prefilter;

mod buffers;
mod simd;

pub use block_matching::*;
pub use prefilter::prefilter_normalized;

pub type Result<T> = std::result::Result<T, StereoBmError>;

#[derive(Debug, thiserror::Error)]
pub enum StereoBmError {
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Dimension mismatch: {0}")]
    DimensionMismatch(String),
}

/// Fixed-point shift of stored disparities: value = true disparity * 16.
pub const DISPARITY_SHIFT: u32 = 4;

/// Disparity map in signed 16-bit fixed point (4 fractional bits).
#[derive(Debug, Clone)]
pub struct DisparityMap {
    pub data: Vec<i16>,
    pub width: u32,
    pub height: u32,
    pub min_disparity: i32,
    pub num_disparities: i32,
}

impl DisparityMap {
    /// Allocate a map of the given geometry, filled with the sentinel.
    pub fn new(width: u32, height: u32, min_disparity: i32, num_disparities: i32) -> Self {
        let filtered = ((min_disparity - 1) << DISPARITY_SHIFT) as i16;
        Self {
            data: vec![filtered; (width * height) as usize],
            width,
            height,
            min_disparity,
            num_disparities,
        }
    }

    /// The reserved "no valid match" value for this map's disparity range.
    pub fn filtered_value(&self) -> i16 {
        ((self.min_disparity - 1) << DISPARITY_SHIFT) as i16
    }

    /// Raw fixed-point value at (x, y). Out-of-range coordinates read as the
    /// sentinel; the row bound is checked on `x` so a wide `x` cannot alias a
    /// pixel of the following row.
    pub fn get(&self, x: u32, y: u32) -> i16 {
        if x >= self.width || y >= self.height {
            return self.filtered_value();
        }
        self.data[(y * self.width + x) as usize]
    }

    pub fn set(&mut self, x: u32, y: u32, value: i16) {
        if x < self.width && y < self.height {
            self.data[(y * self.width + x) as usize] = value;
        }
    }

    /// Whether the pixel holds a real match rather than the sentinel.
    pub fn is_valid(&self, x: u32, y: u32) -> bool {
        x < self.width && y < self.height && self.get(x, y) != self.filtered_value()
    }

    /// Disparity in pixels at (x, y), or `None` for rejected pixels.
    pub fn disparity_at(&self, x: u32, y: u32) -> Option<f32> {
        if self.is_valid(x, y) {
            Some(self.get(x, y) as f32 / (1 << DISPARITY_SHIFT) as f32)
        } else {
            None
        }
    }

    /// Convert to a grayscale image for visualization.
    ///
    /// Valid disparities are normalized to 0..=255; rejected pixels map to 0.
    pub fn to_image(&self) -> GrayImage {
        let filtered = self.filtered_value();
        let mut min_val = i16::MAX;
        let mut max_val = i16::MIN;
        for &v in &self.data {
            if v != filtered {
                min_val = min_val.min(v);
                max_val = max_val.max(v);
            }
        }
        let range = (max_val as f32 - min_val as f32).max(1.0);

        let mut img = GrayImage::new(self.width, self.height);
        for y in 0..self.height {
            for x in 0..self.width {
                let v = self.get(x, y);
                let normalized = if v == filtered {
                    0
                } else {
                    ((v - min_val) as f32 / range * 255.0) as u8
                };
                img.put_pixel(x, y, image::Luma([normalized]));
            }
        }

        img
    }
}
