//! The transport-agnostic capture core.
//!
//! A `CaptureHub` owns the subscriber registry, the throttle, the codec and
//! one capture loop per watched display. Any number of connections (relay
//! session, direct peer links, HTTP streams) attach to the same hub.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::capture_loop::{CaptureLoop, Pipeline};
use super::registry::{
    ConfigHandle, Eviction, StreamConfig, StreamItem, Subscriber, SubscriberId, SubscriberRegistry,
    Ticket, MAX_CHANNEL_CAPACITY, MIN_CHANNEL_CAPACITY,
};
use super::throttle::CaptureThrottle;
use crate::error::{StreamError, StreamResult};
use crate::screen::codec::FrameCodec;
use crate::screen::{DisplayId, Frame, ScreenSource, MAX_CAPTURE_WIDTH, PREVIEW_WIDTH};

/// Tunables for a [`CaptureHub`].
#[derive(Debug, Clone)]
pub struct HubSettings {
    pub max_width: u32,
    pub preview_width: u32,
    /// Per-subscriber channel capacity, clamped to 1..=10.
    pub channel_capacity: usize,
    pub max_concurrent: usize,
    pub rate_per_sec: u32,
    pub compression_level: i32,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            max_width: MAX_CAPTURE_WIDTH,
            preview_width: PREVIEW_WIDTH,
            channel_capacity: 2,
            max_concurrent: super::throttle::DEFAULT_MAX_CONCURRENT,
            rate_per_sec: super::throttle::DEFAULT_RATE_PER_SEC,
            compression_level: 1,
        }
    }
}

/// A single-shot capture submitted in request/response mode. The result
/// goes back to exactly this requester through `reply`.
#[derive(Debug)]
pub struct FrameRequest {
    pub display: DisplayId,
    pub requester: SubscriberId,
    pub preview: bool,
    pub config: StreamConfig,
    pub reply: oneshot::Sender<StreamResult<Frame>>,
}

pub struct CaptureHub {
    pipeline: Pipeline,
    loops: Mutex<HashMap<DisplayId, CaptureLoop>>,
    channel_capacity: usize,
    cancel: CancellationToken,
}

impl CaptureHub {
    pub fn new(
        source: Arc<dyn ScreenSource>,
        settings: HubSettings,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let pipeline = Pipeline {
            source,
            codec: Arc::new(FrameCodec::new(settings.preview_width, settings.compression_level)),
            throttle: Arc::new(CaptureThrottle::new(
                settings.max_concurrent,
                settings.rate_per_sec,
            )),
            registry: Arc::new(SubscriberRegistry::new()),
            max_width: settings.max_width,
        };
        Arc::new(Self {
            pipeline,
            loops: Mutex::new(HashMap::new()),
            channel_capacity: settings
                .channel_capacity
                .clamp(MIN_CHANNEL_CAPACITY, MAX_CHANNEL_CAPACITY),
            cancel,
        })
    }

    pub fn registry(&self) -> &Arc<SubscriberRegistry> {
        &self.pipeline.registry
    }

    pub fn throttle(&self) -> &Arc<CaptureThrottle> {
        &self.pipeline.throttle
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub async fn display_count(&self) -> usize {
        let source = self.pipeline.source.clone();
        tokio::task::spawn_blocking(move || source.display_count())
            .await
            .unwrap_or(0)
    }

    /// Start (or replace) a subscription. The ticket is what the caller
    /// later hands to [`unwatch`](Self::unwatch).
    pub fn watch(
        &self,
        display: DisplayId,
        id: SubscriberId,
        config: ConfigHandle,
        owner: Option<mpsc::UnboundedSender<Eviction>>,
    ) -> (Ticket, mpsc::Receiver<StreamItem>) {
        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let ticket = self.pipeline.registry.register(Subscriber {
            id,
            display,
            tx,
            config,
            owner,
        });
        self.ensure_loop(display);
        (ticket, rx)
    }

    /// Stop a subscription. Effective before the display's next tick. A
    /// ticket that has since been superseded by another registration of the
    /// same pair removes nothing.
    pub fn unwatch(&self, display_id: DisplayId, id: &str, ticket: Ticket) -> bool {
        let removed = self.pipeline.registry.unregister(display_id, id, ticket);
        if removed && self.pipeline.registry.subscriber_count(display_id) == 0 {
            debug!(display_id, "last subscriber gone, capture loop will idle");
        }
        removed
    }

    /// Ask a display's loop to re-read subscriber configs now.
    pub fn wake(&self, display: DisplayId) {
        if let Some(lp) = self.loops.lock().get(&display) {
            lp.wake();
        }
    }

    fn ensure_loop(&self, display_id: DisplayId) {
        let mut loops = self.loops.lock();
        if loops.get(&display_id).is_some_and(|lp| lp.is_finished()) {
            loops.remove(&display_id);
        }
        let lp = loops.entry(display_id).or_insert_with(|| {
            info!(display_id, "starting capture loop");
            CaptureLoop::spawn(display_id, self.pipeline.clone(), self.cancel.child_token())
        });
        lp.wake();
    }

    /// Throttled capture + encode of one frame, outside any loop.
    pub async fn capture_once(
        &self,
        display: DisplayId,
        config: &StreamConfig,
        cancel: &CancellationToken,
    ) -> StreamResult<Frame> {
        self.pipeline.capture_once(display, config, cancel).await
    }

    /// One preview-sized frame per display.
    pub async fn previews(
        &self,
        config: &StreamConfig,
        cancel: &CancellationToken,
    ) -> StreamResult<BTreeMap<DisplayId, Bytes>> {
        let config = StreamConfig {
            preview: true,
            ..*config
        };
        let mut previews = BTreeMap::new();
        for display in 0..self.display_count().await {
            let frame = self.capture_once(display, &config, cancel).await?;
            previews.insert(display, frame.data);
        }
        Ok(previews)
    }

    /// Spawn a worker that serves [`FrameRequest`]s one at a time until
    /// `cancel` fires. Requests still queued at that point are dropped and
    /// their requesters see a closed reply channel.
    pub fn spawn_request_worker(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> mpsc::Sender<FrameRequest> {
        let (tx, mut rx) = mpsc::channel::<FrameRequest>(8);
        let hub = self.clone();
        tokio::spawn(async move {
            loop {
                let req = tokio::select! {
                    req = rx.recv() => match req {
                        Some(req) => req,
                        None => break,
                    },
                    _ = cancel.cancelled() => break,
                };
                let config = StreamConfig {
                    preview: req.preview,
                    ..req.config
                };
                debug!(display_id = req.display, requester = %req.requester, "serving frame request");
                let result = hub.capture_once(req.display, &config, &cancel).await;
                let _ = req.reply.send(result);
            }
            debug!("frame request worker stopped");
        });
        tx
    }
}

/// Submit a request to a worker and wait for its reply.
pub async fn request_frame(
    worker: &mpsc::Sender<FrameRequest>,
    display: DisplayId,
    requester: SubscriberId,
    preview: bool,
    config: StreamConfig,
) -> StreamResult<Frame> {
    let (reply, rx) = oneshot::channel();
    worker
        .send(FrameRequest {
            display,
            requester,
            preview,
            config,
            reply,
        })
        .await
        .map_err(|_| StreamError::Cancelled)?;
    rx.await.map_err(|_| StreamError::Cancelled)?
}
