//! Pixel formats and signal description

use std::fmt;

/// Four-character pixel/stream format code, stored little-endian as V4L2 does.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct FourCc(pub u32);

impl FourCc {
    pub const UYVY: FourCc = FourCc::new(b"UYVY");
    pub const YUYV: FourCc = FourCc::new(b"YUYV");
    pub const H264: FourCc = FourCc::new(b"H264");

    pub const fn new(code: &[u8; 4]) -> Self {
        FourCc(u32::from_le_bytes(*code))
    }

    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0.to_le_bytes() {
            if b.is_ascii_graphic() || b == b' ' {
                write!(f, "{}", b as char)?;
            } else {
                write!(f, ".")?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FourCc({})", self)
    }
}

/// The negotiated input signal, immutable for a session's duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalInfo {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
}

impl fmt::Display for SignalInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}@{}", self.width, self.height, self.fps)
    }
}

/// What the capture driver actually granted after `S_FMT`.
///
/// Drivers may narrow the requested geometry; everything downstream (DMABUF
/// sizing, encoder OUTPUT format) must use these values, not the request.
#[derive(Debug, Clone, Copy)]
pub struct CaptureFormat {
    pub fourcc: FourCc,
    pub width: u32,
    pub height: u32,
    pub sizeimage: u32,
    pub bytesperline: u32,
}
