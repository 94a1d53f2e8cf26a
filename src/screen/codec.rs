//! Frame codec: BGRA pixels → (scaled) RGB → JPEG → optional zstd.
//!
//! All intermediate bytes live in pooled buffers borrowed for the duration
//! of one `encode` call. The only allocation that survives a call is the
//! returned `Bytes`.

use std::ops::{Deref, DerefMut};

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use image::RgbImage;
use parking_lot::Mutex;

use super::{RawFrame, PREVIEW_WIDTH};
use crate::error::{StreamError, StreamResult};

/// Gaussian sigma for the diff/blur hook.
const DIFF_BLUR_SIGMA: f32 = 1.5;
/// Idle buffers kept per pool. Three are used per encode call.
const MAX_IDLE_BUFFERS: usize = 16;

/// Per-call encode parameters, taken from a subscriber's stream config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EncodeOptions {
    /// 0-100. Anything else is rejected before encoding starts.
    pub quality: i32,
    pub max_width: u32,
    pub preview: bool,
    pub diff: bool,
    /// Run the JPEG through zstd (duplex mode). Multipart HTTP wants raw JPEG.
    pub compress: bool,
}

/// Free-list of scratch byte buffers.
pub struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self {
            free: Mutex::new(Vec::new()),
        }
    }

    /// Borrow a cleared buffer. It goes back to the pool when the guard drops.
    pub fn get(&self) -> PooledBuffer<'_> {
        let buf = self.free.lock().pop().unwrap_or_default();
        PooledBuffer { pool: self, buf }
    }

    /// Buffers currently waiting in the pool.
    #[cfg(test)]
    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }

    fn put(&self, mut buf: Vec<u8>) {
        buf.clear();
        let mut free = self.free.lock();
        if free.len() < MAX_IDLE_BUFFERS {
            free.push(buf);
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

pub struct PooledBuffer<'a> {
    pool: &'a BufferPool,
    buf: Vec<u8>,
}

impl Deref for PooledBuffer<'_> {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        &self.buf
    }
}

impl DerefMut for PooledBuffer<'_> {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }
}

impl Drop for PooledBuffer<'_> {
    fn drop(&mut self) {
        self.pool.put(std::mem::take(&mut self.buf));
    }
}

pub struct FrameCodec {
    preview_width: u32,
    compression_level: i32,
    pool: BufferPool,
}

impl FrameCodec {
    pub fn new(preview_width: u32, compression_level: i32) -> Self {
        Self {
            preview_width: preview_width.max(1),
            compression_level,
            pool: BufferPool::new(),
        }
    }

    pub fn pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Encode one raw capture.
    pub fn encode(&self, raw: &RawFrame, opts: &EncodeOptions) -> StreamResult<Bytes> {
        if !(0..=100).contains(&opts.quality) {
            return Err(StreamError::Config(format!(
                "quality {} outside 0-100",
                opts.quality
            )));
        }
        if opts.max_width == 0 {
            return Err(StreamError::Config("max width must be positive".into()));
        }

        let mut rgb = self.pool.get();
        bgra_to_rgb(raw, &mut rgb)?;
        let source = RgbImage::from_raw(raw.width, raw.height, std::mem::take(&mut *rgb))
            .ok_or_else(|| StreamError::Encode("pixel buffer does not match dimensions".into()))?;

        let mut img = match self.target_size(raw.width, raw.height, opts) {
            Some((w, h)) => {
                let scaled = imageops::resize(&source, w, h, FilterType::Lanczos3);
                *rgb = source.into_raw();
                scaled
            }
            None => source,
        };

        if opts.diff {
            img = imageops::blur(&img, DIFF_BLUR_SIGMA);
        }

        let mut jpeg = self.pool.get();
        let encoder = JpegEncoder::new_with_quality(&mut *jpeg, opts.quality.clamp(1, 100) as u8);
        let written = img.write_with_encoder(encoder);

        if rgb.capacity() == 0 {
            *rgb = img.into_raw();
        }
        written?;

        if !opts.compress {
            return Ok(Bytes::copy_from_slice(&jpeg));
        }

        let mut packed = self.pool.get();
        zstd::stream::copy_encode(&jpeg[..], &mut *packed, self.compression_level)
            .map_err(|e| StreamError::Encode(format!("zstd: {}", e)))?;
        Ok(Bytes::copy_from_slice(&packed))
    }

    /// Output dimensions, or `None` to keep the native size.
    fn target_size(&self, width: u32, height: u32, opts: &EncodeOptions) -> Option<(u32, u32)> {
        let target_w = if opts.preview {
            self.preview_width
        } else if width > opts.max_width {
            opts.max_width
        } else {
            return None;
        };
        if target_w == width {
            return None;
        }
        let target_h = (height as u64 * target_w as u64 / width.max(1) as u64).max(1) as u32;
        Some((target_w, target_h))
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(PREVIEW_WIDTH, 1)
    }
}

/// Pack BGRA rows (with stride padding) into tight RGB.
fn bgra_to_rgb(raw: &RawFrame, out: &mut Vec<u8>) -> StreamResult<()> {
    let width = raw.width as usize;
    let height = raw.height as usize;
    if width == 0 || height == 0 {
        return Err(StreamError::Encode("empty frame".into()));
    }
    if raw.stride < width * 4 || raw.data.len() < raw.stride * (height - 1) + width * 4 {
        return Err(StreamError::Encode(format!(
            "pixel buffer too short: {} bytes for {}x{} stride {}",
            raw.data.len(),
            width,
            height,
            raw.stride
        )));
    }

    out.clear();
    out.reserve(width * height * 3);
    for row in raw.data.chunks(raw.stride).take(height) {
        for px in row[..width * 4].chunks_exact(4) {
            out.extend_from_slice(&[px[2], px[1], px[0]]);
        }
    }
    Ok(())
}
