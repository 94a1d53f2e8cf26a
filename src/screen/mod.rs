pub mod capture;
pub mod codec;

use bytes::Bytes;

use crate::error::StreamResult;

/// Index of a capturable display (0 = primary).
pub type DisplayId = usize;

/// Width every preview frame is scaled to, regardless of source size.
pub const PREVIEW_WIDTH: u32 = 1280;
/// Full frames wider than this are downscaled, preserving aspect ratio.
pub const MAX_CAPTURE_WIDTH: u32 = 2400;
/// Default JPEG quality (0-100).
pub const DEFAULT_QUALITY: u8 = 80;
/// Default target frames per second.
pub const DEFAULT_FPS: u32 = 10;
/// Highest frame rate a subscriber may ask for.
pub const MAX_FPS: u32 = 60;

/// Raw BGRA pixels as handed over by the capture device.
///
/// `data` holds `height` rows of `stride` bytes; `stride` may include
/// row padding.
#[derive(Debug, Clone)]
pub struct RawFrame {
    pub width: u32,
    pub height: u32,
    pub stride: usize,
    pub data: Vec<u8>,
}

#[cfg(test)]
impl RawFrame {
    /// A frame filled with a single BGRA colour.
    pub fn solid(width: u32, height: u32, bgra: [u8; 4]) -> Self {
        let stride = width as usize * 4;
        let mut data = Vec::with_capacity(stride * height as usize);
        for _ in 0..(width as usize * height as usize) {
            data.extend_from_slice(&bgra);
        }
        Self {
            width,
            height,
            stride,
            data,
        }
    }
}

/// One encoded capture for one display at one instant.
#[derive(Debug, Clone)]
pub struct Frame {
    pub display: DisplayId,
    /// Per-display capture sequence number. Gaps mean dropped ticks.
    pub seq: u64,
    pub preview: bool,
    /// Whether the diff/blur hook ran before encoding.
    pub diff: bool,
    /// JPEG bytes, zstd-compressed when the subscriber asked for it.
    pub data: Bytes,
}

/// The screen-capture primitive. Implementations block, so callers run
/// them on the blocking pool.
pub trait ScreenSource: Send + Sync + 'static {
    /// Number of displays that can currently be captured.
    fn display_count(&self) -> usize;

    /// Grab the current contents of `display`.
    fn capture(&self, display: DisplayId) -> StreamResult<RawFrame>;
}

#[cfg(test)]
pub mod testing {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use super::*;
    use crate::error::StreamError;

    /// Deterministic in-memory screen: counts captures, can be told to fail.
    pub struct FakeScreen {
        pub displays: usize,
        pub width: u32,
        pub height: u32,
        pub captures: AtomicUsize,
        pub failing: AtomicBool,
    }

    impl FakeScreen {
        pub fn new(displays: usize) -> Self {
            Self {
                displays,
                width: 64,
                height: 48,
                captures: AtomicUsize::new(0),
                failing: AtomicBool::new(false),
            }
        }

        pub fn capture_count(&self) -> usize {
            self.captures.load(Ordering::SeqCst)
        }

        pub fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }
    }

    /// Busy enough that JPEG quality visibly changes the encoded size.
    fn checkerboard(width: u32, height: u32, seed: u8) -> RawFrame {
        let mut frame = RawFrame::solid(width, height, [0, 0, 0, 0xFF]);
        for (i, px) in frame.data.chunks_exact_mut(4).enumerate() {
            let (x, y) = (i as u32 % width, i as u32 / width);
            let on = ((x / 2 + y / 2) % 2 == 0) as u8;
            let noise = (x.wrapping_mul(31) ^ y.wrapping_mul(17)) as u8;
            px[0] = on.wrapping_mul(200).wrapping_add(seed.wrapping_mul(40));
            px[1] = noise;
            px[2] = noise.wrapping_mul(3) ^ on.wrapping_mul(90);
        }
        frame
    }

    impl ScreenSource for FakeScreen {
        fn display_count(&self) -> usize {
            self.displays
        }

        fn capture(&self, display: DisplayId) -> StreamResult<RawFrame> {
            self.captures.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(StreamError::Capture("fake device unplugged".into()));
            }
            if display >= self.displays {
                return Err(StreamError::Capture(format!("no display {}", display)));
            }
            Ok(checkerboard(self.width, self.height, display as u8))
        }
    }
}
