//! One live duplex connection: reader loop, writer task, teardown.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::dispatch::Dispatcher;
use super::{Dialer, WsStream};
use crate::error::{StreamError, StreamResult};
use crate::protocol::Command;
use crate::stream::{CaptureHub, StreamConfig};

/// Frames and replies queued for the socket before forwarders start waiting.
const OUTBOUND_QUEUE: usize = 32;

/// What a session needs besides its socket.
#[derive(Clone)]
pub struct SessionContext {
    pub hub: Arc<CaptureHub>,
    pub dialer: Arc<dyn Dialer>,
    /// Starting stream settings for the connection.
    pub defaults: StreamConfig,
    /// Direct peer links serve frames but never open further links.
    pub direct: bool,
}

/// Serve commands from `ws` until it closes, fails or `cancel` fires.
/// Every subscription the peer opened is gone when this returns.
pub async fn run(ws: WsStream, ctx: SessionContext, cancel: CancellationToken) -> StreamResult<()> {
    let session_cancel = cancel.child_token();
    let (mut sink, mut stream) = ws.split();

    let (out_tx, mut out_rx) = mpsc::channel::<WsMessage>(OUTBOUND_QUEUE);
    let writer_cancel = session_cancel.clone();
    let mut writer = tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if let Err(e) = sink.send(msg).await {
                warn!(error = %e, "write failed");
                writer_cancel.cancel();
                return;
            }
        }
        let _ = sink.close().await;
    });

    let (evict_tx, mut evict_rx) = mpsc::unbounded_channel();
    let mut dispatcher = Dispatcher::new(ctx, out_tx, evict_tx, session_cancel.clone());

    let result = loop {
        let msg = tokio::select! {
            msg = stream.next() => msg,
            Some(eviction) = evict_rx.recv() => {
                dispatcher.evicted(eviction);
                continue;
            }
            _ = session_cancel.cancelled() => break Err(stop_reason(&cancel)),
        };

        match msg {
            Some(Ok(WsMessage::Text(text))) => {
                let cmd = match Command::parse(&text) {
                    Ok(cmd) => cmd,
                    Err(e) => {
                        warn!(error = %e, "ignoring message");
                        continue;
                    }
                };
                match dispatcher.handle(cmd).await {
                    Ok(()) => {}
                    Err(StreamError::Cancelled) => break Err(stop_reason(&cancel)),
                    Err(e) => break Err(e),
                }
            }
            Some(Ok(WsMessage::Close(_))) | None => break Ok(()),
            Some(Ok(_)) => {}
            Some(Err(e)) => break Err(e.into()),
        }
    };

    dispatcher.teardown();
    drop(dispatcher);
    // The writer drains what is already queued, then closes the socket.
    if tokio::time::timeout(std::time::Duration::from_secs(1), &mut writer)
        .await
        .is_err()
    {
        writer.abort();
        debug!("writer did not finish in time, aborted");
    }
    debug!(?result, "session ended");
    result
}

/// Why the session token fired: shutdown from above, or the writer gave up.
fn stop_reason(parent: &CancellationToken) -> StreamError {
    if parent.is_cancelled() {
        StreamError::Cancelled
    } else {
        StreamError::Transport("connection write failed".into())
    }
}
