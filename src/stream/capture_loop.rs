//! Per-display capture loop.
//!
//! One loop per display that has ever been watched. While the display has
//! no subscribers the loop parks on its wake signal and performs no
//! captures; a registration wakes it immediately.
//!
//! Each tick:
//! 1. pick the subscribers whose own frame interval has elapsed,
//! 2. take a throttle permit (rate limited → skip the tick),
//! 3. capture once (failure → error notice, skip),
//! 4. encode once per distinct encode profile,
//! 5. fan out, then drop the permit.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::registry::{StreamConfig, StreamItem, SubscriberId, SubscriberRegistry, Target};
use super::throttle::{frame_interval, CaptureThrottle};
use crate::error::{StreamError, StreamResult};
use crate::screen::codec::{EncodeOptions, FrameCodec};
use crate::screen::{DisplayId, Frame, RawFrame, ScreenSource};

/// Everything a capture needs, cheap to clone into tasks.
#[derive(Clone)]
pub struct Pipeline {
    pub source: Arc<dyn ScreenSource>,
    pub codec: Arc<FrameCodec>,
    pub throttle: Arc<CaptureThrottle>,
    pub registry: Arc<SubscriberRegistry>,
    pub max_width: u32,
}

impl Pipeline {
    /// Run the blocking capture primitive off the async workers.
    pub async fn capture(&self, display: DisplayId) -> StreamResult<RawFrame> {
        let source = self.source.clone();
        tokio::task::spawn_blocking(move || source.capture(display))
            .await
            .map_err(|e| StreamError::Capture(format!("capture task failed: {}", e)))?
    }

    pub async fn encode(&self, raw: Arc<RawFrame>, opts: EncodeOptions) -> StreamResult<Bytes> {
        let codec = self.codec.clone();
        tokio::task::spawn_blocking(move || codec.encode(&raw, &opts))
            .await
            .map_err(|e| StreamError::Encode(format!("encode task failed: {}", e)))?
    }

    /// Throttled single-shot capture + encode.
    pub async fn capture_once(
        &self,
        display: DisplayId,
        config: &StreamConfig,
        cancel: &CancellationToken,
    ) -> StreamResult<Frame> {
        let opts = config.encode_options(self.max_width);
        // Reject bad settings before spending a throttle token.
        if !(0..=100).contains(&opts.quality) {
            return Err(StreamError::Config(format!("quality {} outside 0-100", opts.quality)));
        }
        let _permit = self.throttle.acquire(cancel).await?;
        let raw = Arc::new(self.capture(display).await?);
        let data = self.encode(raw, opts).await?;
        Ok(Frame {
            display,
            seq: 0,
            preview: opts.preview,
            diff: opts.diff,
            data,
        })
    }
}

pub struct CaptureLoop {
    wake: Arc<Notify>,
    task: JoinHandle<()>,
}

impl CaptureLoop {
    pub fn spawn(display: DisplayId, pipeline: Pipeline, cancel: CancellationToken) -> Self {
        let wake = Arc::new(Notify::new());
        let task = tokio::spawn(run(display, pipeline, wake.clone(), cancel));
        Self { wake, task }
    }

    /// Re-evaluate subscribers and pacing now (registration or config change).
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for CaptureLoop {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(display_id: DisplayId, pipeline: Pipeline, wake: Arc<Notify>, cancel: CancellationToken) {
    debug!(display_id, "capture loop started");
    let mut state = LoopState::default();

    loop {
        let targets = pipeline.registry.snapshot(display_id);
        if targets.is_empty() {
            state.last_sent.clear();
            trace!(display_id, "no subscribers, idling");
            tokio::select! {
                _ = wake.notified() => continue,
                _ = cancel.cancelled() => break,
            }
        }

        let tick = targets
            .iter()
            .map(|t| frame_interval(t.config.fps))
            .min()
            .unwrap_or(Duration::from_secs(1));
        let started = Instant::now();

        let due = state.take_due(&targets, started, tick);
        if !due.is_empty() {
            state.tick(display_id, &pipeline, &due, &cancel).await;
        }

        tokio::select! {
            _ = tokio::time::sleep_until(started + tick) => {}
            _ = wake.notified() => {}
            _ = cancel.cancelled() => break,
        }
    }
    debug!(display_id, "capture loop stopped");
}

#[derive(Default)]
struct LoopState {
    seq: u64,
    last_sent: HashMap<SubscriberId, Instant>,
    failing: bool,
}

impl LoopState {
    /// Subscribers whose own interval has elapsed, marked as served.
    /// Half a tick of slack absorbs timer jitter.
    fn take_due(&mut self, targets: &[Target], now: Instant, tick: Duration) -> Vec<Target> {
        self.last_sent
            .retain(|id, _| targets.iter().any(|t| &t.id == id));

        let mut due = Vec::new();
        for target in targets {
            let ready = match self.last_sent.get(&target.id) {
                None => true,
                Some(last) => now + tick / 2 >= *last + frame_interval(target.config.fps),
            };
            if ready {
                self.last_sent.insert(target.id.clone(), now);
                due.push(target.clone());
            }
        }
        due
    }

    async fn tick(
        &mut self,
        display_id: DisplayId,
        pipeline: &Pipeline,
        due: &[Target],
        cancel: &CancellationToken,
    ) {
        let _permit = match pipeline.throttle.acquire(cancel).await {
            Ok(permit) => permit,
            Err(StreamError::RateLimited) => {
                debug!(display_id, "tick skipped: rate limited");
                return;
            }
            Err(_) => return,
        };

        let raw = match pipeline.capture(display_id).await {
            Ok(raw) => Arc::new(raw),
            Err(e) => {
                // Notify once per failure streak.
                if !self.failing {
                    warn!(display_id, error = %e, "capture failed");
                    pipeline
                        .registry
                        .deliver(display_id, due, &StreamItem::Error(e.to_string()));
                } else {
                    debug!(display_id, error = %e, "capture still failing");
                }
                self.failing = true;
                return;
            }
        };
        if self.failing {
            debug!(display_id, "capture recovered");
            self.failing = false;
        }
        self.seq += 1;

        for (opts, group) in group_by_profile(due, pipeline.max_width) {
            let data = match pipeline.encode(raw.clone(), opts).await {
                Ok(data) => data,
                Err(e) => {
                    warn!(display_id, error = %e, "encode failed, frame skipped");
                    continue;
                }
            };
            let frame = Frame {
                display: display_id,
                seq: self.seq,
                preview: opts.preview,
                diff: opts.diff,
                data,
            };
            let report = pipeline
                .registry
                .deliver(display_id, &group, &StreamItem::Frame(frame));
            trace!(
                display_id,
                seq = self.seq,
                delivered = report.delivered,
                dropped = report.dropped,
                evicted = report.evicted.len(),
                "frame fanned out"
            );
        }
    }
}

/// Subscribers sharing identical encode options get one shared encode.
fn group_by_profile(due: &[Target], max_width: u32) -> Vec<(EncodeOptions, Vec<Target>)> {
    let mut groups: Vec<(EncodeOptions, Vec<Target>)> = Vec::new();
    for target in due {
        let opts = target.config.encode_options(max_width);
        match groups.iter_mut().find(|(o, _)| *o == opts) {
            Some((_, members)) => members.push(target.clone()),
            None => groups.push((opts, vec![target.clone()])),
        }
    }
    groups
}
