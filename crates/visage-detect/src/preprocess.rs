//! Frame preprocessing: luma conversion and contrast normalization.
//!
//! Detection runs on a single-channel intensity plane with its histogram
//! equalized, which stabilizes the downstream classifiers under variable
//! lighting.

use crate::frame::Frame;
use crate::region::Region;

/// A single-channel 8-bit intensity plane.
#[derive(Clone, Debug)]
pub struct LumaPlane {
    data: Vec<u8>,
    width: u32,
    height: u32,
}

impl LumaPlane {
    /// Convert a frame to luma and equalize its histogram.
    pub fn equalized(frame: &Frame) -> Self {
        let mut plane = Self::from_frame(frame);
        equalize_histogram(&mut plane.data);
        plane
    }

    /// BT.601 luma conversion, integer weighted.
    pub fn from_frame(frame: &Frame) -> Self {
        let width = frame.width();
        let height = frame.height();
        let rgb = frame.data();
        let mut data = Vec::with_capacity(width as usize * height as usize);
        for px in rgb.chunks_exact(3) {
            let y = (299 * px[0] as u32 + 587 * px[1] as u32 + 114 * px[2] as u32) / 1000;
            data.push(y as u8);
        }
        Self {
            data,
            width,
            height,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn value(&self, x: u32, y: u32) -> u8 {
        self.data[y as usize * self.width as usize + x as usize]
    }

    /// Full-frame search window.
    pub fn bounds(&self) -> Region {
        Region::full(self.width, self.height)
    }
}

/// In-place histogram equalization over an 8-bit plane.
///
/// Standard CDF remap: `v' = round(255 * (cdf(v) - cdf_min) / (n - cdf_min))`.
fn equalize_histogram(data: &mut [u8]) {
    if data.is_empty() {
        return;
    }

    let mut hist = [0u64; 256];
    for &v in data.iter() {
        hist[v as usize] += 1;
    }

    let mut cdf = [0u64; 256];
    let mut running = 0u64;
    for (i, &count) in hist.iter().enumerate() {
        running += count;
        cdf[i] = running;
    }

    let cdf_min = cdf
        .iter()
        .copied()
        .find(|&c| c > 0)
        .unwrap_or(0);
    let total = data.len() as u64;
    if total == cdf_min {
        // Flat image, nothing to stretch.
        return;
    }

    let mut lut = [0u8; 256];
    for i in 0..256 {
        let num = cdf[i].saturating_sub(cdf_min) * 255;
        lut[i] = (num / (total - cdf_min)) as u8;
    }

    for v in data.iter_mut() {
        *v = lut[*v as usize];
    }
}
