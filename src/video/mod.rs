//! Video stream buffering

mod buffer;

pub use buffer::{VideoBufferStats, VideoRingBuffer};

/// Video format information
#[derive(Debug, Clone)]
pub struct VideoFormat {
    pub width: u32,
    pub height: u32,
    pub bytes_per_pixel: u32,
    /// Declared frame duration; treated as a hint until the buffer
    /// calibrates against real delivery
    pub nominal_frame_duration_ms: u64,
}

impl VideoFormat {
    /// Negotiated size of one uncompressed frame in bytes
    pub fn frame_size_bytes(&self) -> usize {
        (self.width * self.height * self.bytes_per_pixel) as usize
    }

    /// Declared frames per second, floored at one
    pub fn nominal_fps(&self) -> usize {
        if self.nominal_frame_duration_ms == 0 {
            0
        } else {
            ((1000 / self.nominal_frame_duration_ms) as usize).max(1)
        }
    }
}

impl std::fmt::Display for VideoFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}x{} {}Bpp ~{}fps",
            self.width,
            self.height,
            self.bytes_per_pixel,
            self.nominal_fps()
        )
    }
}
