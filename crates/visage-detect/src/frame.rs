use crate::error::DetectError;

/// A single video frame: contiguous RGB24 bytes in row-major order.
///
/// Carries the presentation timestamp and time base of the source stream
/// untouched, so downstream consumers keep monotonic timing regardless of
/// what the inspection path does.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    data: Vec<u8>,
    width: u32,
    height: u32,
    pts: i64,
    time_base: (u32, u32),
}

impl Frame {
    /// Wrap an RGB24 buffer. Fails if the buffer length does not match
    /// `width * height * 3`.
    pub fn new(
        data: Vec<u8>,
        width: u32,
        height: u32,
        pts: i64,
        time_base: (u32, u32),
    ) -> Result<Self, DetectError> {
        let expected = width as usize * height as usize * 3;
        if data.len() != expected {
            return Err(DetectError::InvalidFrame(format!(
                "buffer is {} bytes, expected {} for {}x{} RGB24",
                data.len(),
                expected,
                width,
                height
            )));
        }
        if width == 0 || height == 0 {
            return Err(DetectError::InvalidFrame("zero-sized frame".into()));
        }
        Ok(Self {
            data,
            width,
            height,
            pts,
            time_base,
        })
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pts(&self) -> i64 {
        self.pts
    }

    /// Time base as (numerator, denominator), e.g. (1, 90000) for RTP video.
    pub fn time_base(&self) -> (u32, u32) {
        self.time_base
    }

    /// RGB triple at pixel coordinates. Panics if out of bounds; callers
    /// iterate within `width`/`height`.
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
        let i = (y as usize * self.width as usize + x as usize) * 3;
        [self.data[i], self.data[i + 1], self.data[i + 2]]
    }
}
