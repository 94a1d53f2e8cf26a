//! Screen capture via `scrap`.
//!
//! A `scrap::Capturer` is not `Send` on X11, so nothing scrap-owned is kept
//! between calls: each capture enumerates the displays, opens a capturer on
//! the requested one and waits for the first ready frame. Callers run this
//! on the blocking pool.

use std::io::ErrorKind;
use std::time::{Duration, Instant};

use scrap::{Capturer, Display};
use tracing::debug;

use super::{DisplayId, RawFrame, ScreenSource};
use crate::error::{StreamError, StreamResult};

/// How long to wait for the compositor to hand over a frame.
const FRAME_READY_TIMEOUT: Duration = Duration::from_millis(500);

pub struct ScrapSource;

impl ScrapSource {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ScrapSource {
    fn default() -> Self {
        Self::new()
    }
}

impl ScreenSource for ScrapSource {
    fn display_count(&self) -> usize {
        Display::all().map(|d| d.len()).unwrap_or(0)
    }

    fn capture(&self, display: DisplayId) -> StreamResult<RawFrame> {
        let display = Display::all()
            .map_err(|e| StreamError::Capture(format!("cannot enumerate displays: {}", e)))?
            .into_iter()
            .nth(display)
            .ok_or_else(|| StreamError::Capture(format!("no display {}", display)))?;

        let width = display.width();
        let height = display.height();
        if width == 0 || height == 0 {
            return Err(StreamError::Capture("display reports zero size".into()));
        }

        let mut capturer = Capturer::new(display)
            .map_err(|e| StreamError::Capture(format!("failed to start capturer: {}", e)))?;

        let started = Instant::now();
        loop {
            match capturer.frame() {
                Ok(frame) => {
                    // scrap gives BGRA rows; the stride may include padding
                    let stride = frame.len() / height;
                    return Ok(RawFrame {
                        width: width as u32,
                        height: height as u32,
                        stride,
                        data: frame.to_vec(),
                    });
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => {
                    if started.elapsed() > FRAME_READY_TIMEOUT {
                        return Err(StreamError::Capture("timed out waiting for a frame".into()));
                    }
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(e) => {
                    debug!(error = %e, "capturer returned an error");
                    return Err(StreamError::Capture(e.to_string()));
                }
            }
        }
    }
}
