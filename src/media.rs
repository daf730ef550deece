//! Interface types for the capture and sink collaborators.
//!
//! Capture, rasterization, and playback live outside this crate; the
//! runtime only moves these values between peers.

use serde::{Deserialize, Serialize};

/// Raw captured frame, RGB24 row-major. Produced by the capture layer on
/// the client, consumed by the mixing host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageFrame {
    pub width: u16,
    pub height: u16,
    pub rgb24: Vec<u8>,
}

impl ImageFrame {
    pub fn expected_len(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }

    /// Dimensions must agree with the pixel buffer before the frame is
    /// allowed near the wire.
    pub fn is_well_formed(&self) -> bool {
        self.rgb24.len() == self.expected_len()
    }
}

/// Rendered terminal frame: a complete ANSI escape sequence the sink
/// writes verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AsciiFrame {
    pub width: u16,
    pub height: u16,
    pub ansi_bytes: Vec<u8>,
}

/// A batch of Opus-encoded audio frames from the capture layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioBatch {
    pub sample_rate: u32,
    pub channels: u8,
    pub pcm_frames: Vec<Vec<u8>>,
}
