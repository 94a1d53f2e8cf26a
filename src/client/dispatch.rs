//! Per-connection command handling.
//!
//! One `Dispatcher` per session. Commands are handled strictly in arrival
//! order; replies and frames go out through the session's outbound queue.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::session::{self, SessionContext};
use crate::error::{StreamError, StreamResult};
use crate::protocol::{integer_setting, Command, Event};
use crate::screen::DisplayId;
use crate::stream::{
    config_handle, request_frame, ConfigHandle, Eviction, FrameRequest, StreamItem, SubscriberId,
    Ticket,
};

/// A subscription this connection opened, and the task moving its frames.
struct Watching {
    ticket: Ticket,
    forwarder: JoinHandle<()>,
}

pub struct Dispatcher {
    ctx: SessionContext,
    out: mpsc::Sender<WsMessage>,
    /// Shared by every subscription this connection opens.
    config: ConfigHandle,
    watching: HashMap<(DisplayId, SubscriberId), Watching>,
    requests: mpsc::Sender<FrameRequest>,
    evictions: mpsc::UnboundedSender<Eviction>,
    cancel: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        ctx: SessionContext,
        out: mpsc::Sender<WsMessage>,
        evictions: mpsc::UnboundedSender<Eviction>,
        cancel: CancellationToken,
    ) -> Self {
        let requests = ctx.hub.spawn_request_worker(cancel.clone());
        Self {
            config: config_handle(ctx.defaults),
            ctx,
            out,
            watching: HashMap::new(),
            requests,
            evictions,
            cancel,
        }
    }

    /// Handle one command. Only transport failures are returned; everything
    /// else is answered on the wire or logged.
    pub async fn handle(&mut self, cmd: Command) -> StreamResult<()> {
        let result = match cmd {
            Command::Identify { role } => {
                debug!(?role, "peer identified");
                Ok(())
            }
            Command::RequestDisplayCount => {
                let count = self.ctx.hub.display_count().await;
                self.send(&Event::DisplayCount { count }).await
            }
            Command::RequestFrame {
                display,
                user_id,
                is_preview,
            } => self.request_frame(display, user_id, is_preview).await,
            Command::RequestPreview => self.request_preview().await,
            Command::StartWatching { display, user_id } => {
                self.start_watching(display, user_id);
                Ok(())
            }
            Command::StopWatching { display, user_id } => {
                self.stop_watching(display, &user_id);
                Ok(())
            }
            Command::SetQuality { quality } => {
                let applied = integer_setting("quality", &quality)
                    .and_then(|q| self.config.write().set_quality(q));
                applied.map(|()| self.wake_all())
            }
            Command::SetFps { fps } => {
                let applied =
                    integer_setting("fps", &fps).and_then(|f| self.config.write().set_fps(f));
                applied.map(|()| self.wake_all())
            }
            Command::SetDiff { enabled } => {
                self.config.write().diff = enabled;
                self.wake_all();
                Ok(())
            }
            Command::DirectConnect { browser_endpoint } => {
                self.direct_connect(browser_endpoint);
                Ok(())
            }
        };

        match result {
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!(error = %e, "command failed");
                self.send(&Event::error(e.to_string())).await
            }
            Ok(()) => Ok(()),
        }
    }

    /// A subscriber was dropped by fan-out because its channel closed.
    pub fn evicted(&mut self, eviction: Eviction) {
        let key = (eviction.display, eviction.id);
        if self.watching.get(&key).is_some_and(|w| w.ticket == eviction.ticket) {
            if let Some(w) = self.watching.remove(&key) {
                w.forwarder.abort();
            }
        }
    }

    /// Unregister everything this connection opened. Registrations another
    /// connection has since taken over are left alone.
    pub fn teardown(&mut self) {
        for ((display, id), w) in self.watching.drain() {
            self.ctx.hub.unwatch(display, &id, w.ticket);
            w.forwarder.abort();
        }
        self.cancel.cancel();
        debug!(
            remaining = self.ctx.hub.registry().total_subscribers(),
            "connection subscriptions released"
        );
    }

    /// Queue one event for the socket. Gives up with `Cancelled` once the
    /// session is shutting down, even if the queue is full.
    async fn send(&self, event: &Event) -> StreamResult<()> {
        let msg = WsMessage::Text(event.to_json()?);
        tokio::select! {
            sent = self.out.send(msg) => Ok(sent?),
            _ = self.cancel.cancelled() => Err(StreamError::Cancelled),
        }
    }

    async fn request_frame(
        &self,
        display: DisplayId,
        user_id: Option<String>,
        preview: bool,
    ) -> StreamResult<()> {
        let config = *self.config.read();
        let requester = user_id.clone().unwrap_or_default();
        let frame = request_frame(&self.requests, display, requester, preview, config).await?;
        self.send(&Event::frame(&frame, user_id)).await
    }

    async fn request_preview(&self) -> StreamResult<()> {
        let config = *self.config.read();
        let previews = self.ctx.hub.previews(&config, &self.cancel).await?;
        self.send(&Event::previews(&previews)).await
    }

    /// Displays are not pre-validated: a watch on a missing display
    /// registers and receives the capture loop's error notice.
    fn start_watching(&mut self, display_id: DisplayId, user_id: SubscriberId) {
        let (ticket, rx) = self.ctx.hub.watch(
            display_id,
            user_id.clone(),
            self.config.clone(),
            Some(self.evictions.clone()),
        );
        let forwarder = tokio::spawn(forward(display_id, user_id.clone(), rx, self.out.clone()));
        let entry = Watching { ticket, forwarder };
        if let Some(previous) = self.watching.insert((display_id, user_id.clone()), entry) {
            previous.forwarder.abort();
        }
        info!(display_id, subscriber = %user_id, ticket, "watching");
    }

    fn stop_watching(&mut self, display_id: DisplayId, user_id: &str) {
        if let Some(w) = self.watching.remove(&(display_id, user_id.to_string())) {
            self.ctx.hub.unwatch(display_id, user_id, w.ticket);
            w.forwarder.abort();
            info!(display_id, subscriber = %user_id, "stopped watching");
        }
    }

    fn wake_all(&self) {
        let mut displays: Vec<DisplayId> = self.watching.keys().map(|(d, _)| *d).collect();
        displays.sort_unstable();
        displays.dedup();
        for display in displays {
            self.ctx.hub.wake(display);
        }
    }

    fn direct_connect(&self, endpoint: String) {
        if self.ctx.direct {
            warn!(%endpoint, "nested directConnect ignored");
            return;
        }
        let ctx = SessionContext {
            direct: true,
            ..self.ctx.clone()
        };
        let cancel = self.ctx.hub.shutdown_token().child_token();
        tokio::spawn(async move {
            let ws = match ctx.dialer.dial(&endpoint).await {
                Ok(ws) => ws,
                Err(e) => {
                    warn!(%endpoint, error = %e, "direct connection failed");
                    return;
                }
            };
            info!(%endpoint, "direct connection established");
            if let Err(e) = session::run(ws, ctx, cancel).await {
                debug!(%endpoint, error = %e, "direct connection ended");
            }
        });
    }
}

/// Move one subscription's frames onto the connection's outbound queue.
async fn forward(
    display_id: DisplayId,
    user_id: SubscriberId,
    mut rx: mpsc::Receiver<StreamItem>,
    out: mpsc::Sender<WsMessage>,
) {
    while let Some(item) = rx.recv().await {
        let event = match item {
            StreamItem::Frame(frame) => Event::frame(&frame, Some(user_id.clone())),
            StreamItem::Error(error) => Event::error(format!("display {}: {}", display_id, error)),
        };
        let text = match event.to_json() {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "failed to serialize frame");
                continue;
            }
        };
        if out.send(WsMessage::Text(text)).await.is_err() {
            break;
        }
    }
    debug!(display_id, subscriber = %user_id, "forwarder stopped");
}
