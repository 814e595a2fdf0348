//! Live capture relay: receives frames from a window or monitor capture
//! session and re-presents each one through a double-buffered swap chain.
//!
//! The relay itself ([`FrameRelay`]) is platform neutral and talks to the
//! capture service through the traits in [`backend`]. Two backends ship
//! with the crate:
//!
//! - [`wgc`] (Windows only): Windows.Graphics.Capture frame pool and session,
//!   DXGI swap chain created for composition.
//! - [`software`]: an in-memory backend with CPU pixel buffers and an
//!   explicit drop-oldest frame pool.

pub mod backend;
pub mod config;
pub mod error;
pub mod relay;
pub mod software;

#[cfg(windows)]
pub mod wgc;

pub use config::RelayOptions;
pub use error::RelayError;
pub use relay::{FrameRelay, RelayStats};

/// Number of buffers in both the frame pool and the swap chain.
pub const BUFFER_COUNT: u32 = 2;

/// Present waits for one vertical blank.
pub const PRESENT_SYNC_INTERVAL: u32 = 1;

/// Pixel dimensions of a capture source, frame or buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Size {
    pub width: u32,
    pub height: u32,
}

impl Size {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// True when either side is zero.
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Component-wise minimum, the region two surfaces have in common.
    pub fn intersect(&self, other: Size) -> Size {
        Size::new(self.width.min(other.width), self.height.min(other.height))
    }
}

impl std::fmt::Display for Size {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Presentation pixel format. Chosen once per relay and never renegotiated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// 32-bit BGRA, 8 bits per channel, normalized.
    #[default]
    Bgra8,
    /// 64-bit RGBA, 16-bit float per channel.
    Rgba16F,
}

impl PixelFormat {
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Bgra8 => 4,
            PixelFormat::Rgba16F => 8,
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "bgra8" | "b8g8r8a8" | "b8g8r8a8uintnormalized" => Some(PixelFormat::Bgra8),
            "rgba16f" | "r16g16b16a16float" => Some(PixelFormat::Rgba16F),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_size() {
        assert!(Size::new(0, 600).is_empty());
        assert!(Size::new(800, 0).is_empty());
        assert!(!Size::new(800, 600).is_empty());
    }

    #[test]
    fn intersect_takes_smaller_extent() {
        let a = Size::new(1024, 600);
        let b = Size::new(800, 768);
        assert_eq!(a.intersect(b), Size::new(800, 600));
    }

    #[test]
    fn parse_pixel_format() {
        assert_eq!(PixelFormat::parse("BGRA8"), Some(PixelFormat::Bgra8));
        assert_eq!(
            PixelFormat::parse("R16G16B16A16Float"),
            Some(PixelFormat::Rgba16F)
        );
        assert_eq!(PixelFormat::parse("nv12"), None);
        assert_eq!(PixelFormat::Rgba16F.bytes_per_pixel(), 8);
    }
}
