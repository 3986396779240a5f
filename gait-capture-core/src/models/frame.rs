use serde::{Deserialize, Serialize};

/// Clock domain a hardware timestamp belongs to. Offsets are only
/// meaningful between timestamps from the same domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampDomain {
    HardwareClock,
    SystemTime,
    GlobalTime,
    Unknown,
}

/// Per-frame timestamp as reported by the device, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HwTimestamp {
    pub millis: f64,
    pub domain: TimestampDomain,
}

/// Owned BGR8 color frame, 3 bytes per pixel.
#[derive(Debug, Clone, PartialEq)]
pub struct ColorFrame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

/// Owned Z16 depth frame, one u16 depth value per pixel.
#[derive(Debug, Clone, PartialEq)]
pub struct DepthFrame {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u16>,
}

/// One synchronized multi-stream frameset as delivered by a pipeline poll.
/// Depth may be absent (color-only playback).
#[derive(Debug, Clone)]
pub struct FrameSet {
    pub color: ColorFrame,
    pub depth: Option<DepthFrame>,
    pub timestamp: HwTimestamp,
}
