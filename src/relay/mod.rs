use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::{accept_async, tungstenite::Message as WsMessage};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::protocol::{Command, Event, AGENT_ROLE};
use crate::screen::DisplayId;

type Outbox = mpsc::Sender<WsMessage>;
type ConnId = u64;

/// Messages queued per connection. A viewer that falls this far behind
/// misses frames instead of growing the queue.
const OUTBOX_CAPACITY: usize = 16;

struct Viewer {
    tx: Outbox,
    /// userIDs this connection has used, for routing targeted frames back.
    user_ids: HashSet<String>,
    watching: HashSet<(DisplayId, String)>,
}

impl Viewer {
    fn new(tx: Outbox) -> Self {
        Self {
            tx,
            user_ids: HashSet::new(),
            watching: HashSet::new(),
        }
    }
}

#[derive(Default)]
struct Peers {
    agent: Option<(ConnId, Outbox)>,
    viewers: HashMap<ConnId, Viewer>,
}

type PeerMap = Arc<RwLock<Peers>>;

/// Relay between one capture agent and any number of viewers.
/// - The connection that sends `identify` with the agent role becomes the agent
/// - Viewer commands go to the agent; agent frames with a `userID` go back to
///   the viewer that used it, everything else is broadcast to viewers
/// - Nothing is stored beyond the live connections
pub struct RelayServer {
    listener: TcpListener,
    peers: PeerMap,
    next_id: AtomicU64,
}

impl RelayServer {
    pub async fn bind(addr: &str) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("binding relay on {}", addr))?;
        Ok(Self {
            listener,
            peers: Arc::new(RwLock::new(Peers::default())),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        println!("📺 framecast relay");
        println!("📡 Listening on: {}", self.local_addr()?);
        println!();

        loop {
            let (stream, remote) = tokio::select! {
                accepted = self.listener.accept() => accepted?,
                _ = cancel.cancelled() => break,
            };

            let peers = self.peers.clone();
            let id = self.next_id.fetch_add(1, Ordering::Relaxed);
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, id, peers).await {
                    let err_str = e.to_string();
                    // Plain HTTP hits on the relay port are not worth a warning.
                    if !err_str.contains("Connection: upgrade") && !err_str.contains("protocol error") {
                        warn!(%remote, error = %e, "connection error");
                    }
                }
            });
        }
        info!("relay stopped");
        Ok(())
    }
}

async fn handle_connection(stream: TcpStream, id: ConnId, peers: PeerMap) -> Result<()> {
    let ws_stream = accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let (tx, mut rx) = mpsc::channel::<WsMessage>(OUTBOX_CAPACITY);

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_sender.send(msg).await.is_err() {
                break;
            }
        }
    });

    peers.write().await.viewers.insert(id, Viewer::new(tx.clone()));
    debug!(conn = id, "viewer connected");

    while let Some(msg) = ws_receiver.next().await {
        let is_agent = peers
            .read()
            .await
            .agent
            .as_ref()
            .is_some_and(|(agent_id, _)| *agent_id == id);

        match msg {
            Ok(WsMessage::Text(text)) if is_agent => route_from_agent(&peers, text).await,
            Ok(WsMessage::Text(text)) => route_from_viewer(&peers, id, &tx, text).await,
            Ok(WsMessage::Binary(data)) if is_agent => {
                broadcast(&peers, WsMessage::Binary(data)).await;
            }
            Ok(WsMessage::Close(_)) | Err(_) => break,
            _ => {}
        }
    }

    // Cleanup on disconnect
    let mut peers_write = peers.write().await;
    let mut stops = None;
    if peers_write.agent.as_ref().is_some_and(|(agent_id, _)| *agent_id == id) {
        peers_write.agent = None;
        info!(conn = id, "agent disconnected");
    } else if let Some(viewer) = peers_write.viewers.remove(&id) {
        if let Some((_, agent_tx)) = &peers_write.agent {
            stops = Some((agent_tx.clone(), viewer.watching));
        }
        debug!(conn = id, "viewer disconnected");
    }
    drop(peers_write);

    if let Some((agent_tx, watching)) = stops {
        for (display, user_id) in watching {
            let stop = Command::StopWatching { display, user_id };
            if let Ok(text) = serde_json::to_string(&stop) {
                let _ = agent_tx.send(WsMessage::Text(text)).await;
            }
        }
    }

    send_task.abort();
    Ok(())
}

async fn route_from_viewer(peers: &PeerMap, id: ConnId, tx: &Outbox, text: String) {
    let cmd = match Command::parse(&text) {
        Ok(cmd) => cmd,
        Err(e) => {
            debug!(conn = id, error = %e, "dropping unparseable message");
            return;
        }
    };

    let mut peers_write = peers.write().await;
    if let Command::Identify { role: Some(role) } = &cmd {
        if role == AGENT_ROLE {
            peers_write.viewers.remove(&id);
            if peers_write.agent.replace((id, tx.clone())).is_some() {
                warn!(conn = id, "replacing previously connected agent");
            }
            info!(conn = id, "agent identified");
            return;
        }
    }

    if let Some(viewer) = peers_write.viewers.get_mut(&id) {
        if let Some(user_id) = cmd.user_id() {
            viewer.user_ids.insert(user_id.to_string());
        }
        match &cmd {
            Command::StartWatching { display, user_id } => {
                viewer.watching.insert((*display, user_id.clone()));
            }
            Command::StopWatching { display, user_id } => {
                viewer.watching.remove(&(*display, user_id.clone()));
            }
            _ => {}
        }
    }

    let agent_tx = peers_write.agent.as_ref().map(|(_, agent_tx)| agent_tx.clone());
    drop(peers_write);

    match agent_tx {
        // Commands wait for room; the agent drains its queue continuously.
        Some(agent_tx) => {
            let _ = agent_tx.send(WsMessage::Text(text)).await;
        }
        None => {
            if let Ok(reply) = Event::error("capture agent is not connected").to_json() {
                deliver(id, tx, WsMessage::Text(reply));
            }
        }
    }
}

async fn route_from_agent(peers: &PeerMap, text: String) {
    let target = match Event::parse(&text) {
        Ok(Event::Frame {
            user_id: Some(user_id),
            ..
        }) => Some(user_id),
        _ => None,
    };

    let Some(user_id) = target else {
        broadcast(peers, WsMessage::Text(text)).await;
        return;
    };

    let peers_read = peers.read().await;
    let owner = peers_read
        .viewers
        .iter()
        .find(|(_, v)| v.user_ids.contains(&user_id));
    match owner {
        Some((id, viewer)) => {
            deliver(*id, &viewer.tx, WsMessage::Text(text));
        }
        None => debug!(subscriber = %user_id, "no viewer for frame, dropped"),
    }
}

async fn broadcast(peers: &PeerMap, msg: WsMessage) {
    let peers_read = peers.read().await;
    for (id, viewer) in &peers_read.viewers {
        deliver(*id, &viewer.tx, msg.clone());
    }
}

/// Queue `msg` for a viewer without waiting. Returns `false` when the
/// viewer's queue is full (the message is dropped) or its connection is gone.
fn deliver(id: ConnId, tx: &Outbox, msg: WsMessage) -> bool {
    match tx.try_send(msg) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            trace!(conn = id, "viewer queue full, message dropped");
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}

pub async fn start_relay(addr: String, cancel: CancellationToken) -> Result<()> {
    let server = RelayServer::bind(&addr).await?;
    server.run(cancel).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

    type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

    async fn relay() -> (Arc<RelayServer>, String, CancellationToken) {
        let server = Arc::new(RelayServer::bind("127.0.0.1:0").await.unwrap());
        let url = format!("ws://{}", server.local_addr().unwrap());
        let cancel = CancellationToken::new();
        tokio::spawn({
            let server = server.clone();
            let cancel = cancel.clone();
            async move { server.run(cancel).await }
        });
        (server, url, cancel)
    }

    async fn connect(url: &str) -> Client {
        connect_async(url).await.unwrap().0
    }

    async fn send_json(ws: &mut Client, value: serde_json::Value) {
        ws.send(WsMessage::Text(value.to_string())).await.unwrap();
    }

    async fn recv_json(ws: &mut Client) -> serde_json::Value {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
                .await
                .expect("message in time")
                .unwrap()
                .unwrap();
            if let WsMessage::Text(text) = msg {
                return serde_json::from_str(&text).unwrap();
            }
        }
    }

    async fn nothing_within(ws: &mut Client, ms: u64) -> bool {
        tokio::time::timeout(Duration::from_millis(ms), ws.next())
            .await
            .is_err()
    }

    async fn until(mut check: impl FnMut() -> futures_util::future::BoxFuture<'static, bool>) {
        for _ in 0..100 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    async fn with_agent() -> (Arc<RelayServer>, String, Client, CancellationToken) {
        let (server, url, cancel) = relay().await;
        let mut agent = connect(&url).await;
        send_json(&mut agent, serde_json::json!({"type":"identify","role":"agent"})).await;
        until(|| {
            let server = server.clone();
            Box::pin(async move { server.peers.read().await.agent.is_some() })
        })
        .await;
        (server, url, agent, cancel)
    }

    #[tokio::test]
    async fn viewer_commands_without_agent_get_an_error() {
        let (_server, url, cancel) = relay().await;
        let mut viewer = connect(&url).await;
        send_json(&mut viewer, serde_json::json!({"type":"requestDisplayCount"})).await;
        assert_eq!(recv_json(&mut viewer).await["type"], "error");
        cancel.cancel();
    }

    #[tokio::test]
    async fn commands_reach_agent_and_targeted_frames_reach_only_their_viewer() {
        let (_server, url, mut agent, cancel) = with_agent().await;
        let mut alice = connect(&url).await;
        let mut bob = connect(&url).await;

        let watch = serde_json::json!({"type":"startWatching","display":0,"userID":"alice"});
        send_json(&mut alice, watch.clone()).await;
        assert_eq!(recv_json(&mut agent).await, watch);

        send_json(
            &mut agent,
            serde_json::json!({"type":"frame","display":0,"userID":"alice","data":"AA=="}),
        )
        .await;
        assert_eq!(recv_json(&mut alice).await["userID"], "alice");
        assert!(nothing_within(&mut bob, 100).await);

        send_json(&mut agent, serde_json::json!({"type":"displayCount","count":2})).await;
        assert_eq!(recv_json(&mut alice).await["count"], 2);
        assert_eq!(recv_json(&mut bob).await["count"], 2);
        cancel.cancel();
    }

    #[tokio::test]
    async fn departing_viewer_stops_its_streams() {
        let (server, url, mut agent, cancel) = with_agent().await;
        let mut viewer = connect(&url).await;
        send_json(
            &mut viewer,
            serde_json::json!({"type":"startWatching","display":1,"userID":"v"}),
        )
        .await;
        recv_json(&mut agent).await;

        drop(viewer);
        let stop = recv_json(&mut agent).await;
        assert_eq!(
            stop,
            serde_json::json!({"type":"stopWatching","display":1,"userID":"v"})
        );
        until(|| {
            let server = server.clone();
            Box::pin(async move { server.peers.read().await.viewers.is_empty() })
        })
        .await;
        cancel.cancel();
    }

    #[tokio::test]
    async fn agent_disconnect_clears_the_slot() {
        let (server, url, agent, cancel) = with_agent().await;
        drop(agent);
        until(|| {
            let server = server.clone();
            Box::pin(async move { server.peers.read().await.agent.is_none() })
        })
        .await;

        let mut viewer = connect(&url).await;
        send_json(&mut viewer, serde_json::json!({"type":"requestPreview"})).await;
        assert_eq!(recv_json(&mut viewer).await["type"], "error");
        cancel.cancel();
    }

    #[tokio::test]
    async fn stalled_viewer_queue_is_bounded_and_others_keep_receiving() {
        let peers: PeerMap = Arc::new(RwLock::new(Peers::default()));
        let (stalled_tx, mut stalled_rx) = mpsc::channel(OUTBOX_CAPACITY);
        let (live_tx, mut live_rx) = mpsc::channel(OUTBOX_CAPACITY);
        {
            let mut peers = peers.write().await;
            peers.viewers.insert(1, Viewer::new(stalled_tx));
            peers.viewers.insert(2, Viewer::new(live_tx));
        }

        for n in 0..OUTBOX_CAPACITY * 4 {
            broadcast(&peers, WsMessage::Text(n.to_string())).await;
            // The live viewer keeps up.
            assert_eq!(live_rx.try_recv().unwrap(), WsMessage::Text(n.to_string()));
        }

        let mut queued = 0;
        while stalled_rx.try_recv().is_ok() {
            queued += 1;
        }
        assert_eq!(queued, OUTBOX_CAPACITY);
    }
}
