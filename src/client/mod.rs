//! Capture agent: keeps exactly one connection to the relay alive and
//! serves viewer commands over it.

pub mod dispatch;
pub mod session;
pub mod state;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::SinkExt;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{StreamError, StreamResult};
use crate::protocol::Event;
use crate::stream::{CaptureHub, StreamConfig};
pub use session::SessionContext;
pub use state::ConnectionState;

pub type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Opens WebSocket connections. Swapped out in tests.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    async fn dial(&self, url: &str) -> StreamResult<WsStream>;
}

pub struct WsDialer;

#[async_trait]
impl Dialer for WsDialer {
    async fn dial(&self, url: &str) -> StreamResult<WsStream> {
        let (ws, _) = connect_async(url).await?;
        Ok(ws)
    }
}

pub struct RelayAgent {
    url: String,
    backoff: Duration,
    ctx: SessionContext,
    state: watch::Sender<ConnectionState>,
    attempts: AtomicU64,
}

impl RelayAgent {
    pub fn new(
        url: impl Into<String>,
        hub: Arc<CaptureHub>,
        dialer: Arc<dyn Dialer>,
        defaults: StreamConfig,
        backoff: Duration,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            url: url.into(),
            backoff,
            ctx: SessionContext {
                hub,
                dialer,
                defaults,
                direct: false,
            },
            state,
            attempts: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state.borrow().clone()
    }

    /// Connection attempts made so far.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }

    /// Atomically move `Disconnected → Connecting`. `false` means another
    /// attempt or a live connection already owns the state.
    fn try_begin_connect(&self) -> bool {
        self.state.send_if_modified(|s| s.begin_connect().is_ok())
    }

    fn set_disconnected(&self) {
        self.state.send_if_modified(|s| {
            if let Some(uptime) = s.connected_for() {
                debug!(?uptime, "connection was up");
            }
            let changed = !s.is_disconnected();
            s.disconnect();
            changed
        });
    }

    /// Reconnect loop with a fixed delay. Returns once `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        info!(url = %self.url, "agent starting");
        while !cancel.is_cancelled() {
            match self.connect_once(&cancel).await {
                Ok(()) => info!("relay connection closed"),
                Err(StreamError::Cancelled) => break,
                Err(e) => warn!(attempt = self.attempts(), error = %e, "relay connection failed"),
            }
            tokio::select! {
                _ = tokio::time::sleep(self.backoff) => {}
                _ = cancel.cancelled() => break,
            }
            debug!(delay = ?self.backoff, "reconnecting");
        }
        self.set_disconnected();
        info!("agent stopped");
    }

    /// One connection lifetime: dial, identify, serve, tear down. A call
    /// while another attempt is under way is a no-op.
    pub async fn connect_once(&self, cancel: &CancellationToken) -> StreamResult<()> {
        if !self.try_begin_connect() {
            debug!(state = %self.state(), "connect already in progress");
            return Ok(());
        }
        self.attempts.fetch_add(1, Ordering::Relaxed);

        let result = self.connect_and_serve(cancel).await;
        self.set_disconnected();
        result
    }

    async fn connect_and_serve(&self, cancel: &CancellationToken) -> StreamResult<()> {
        let mut ws = tokio::select! {
            ws = self.ctx.dialer.dial(&self.url) => ws?,
            _ = cancel.cancelled() => return Err(StreamError::Cancelled),
        };

        let handshake = async {
            ws.send(WsMessage::Text(Event::identify().to_json()?)).await?;
            let count = self.ctx.hub.display_count().await;
            ws.send(WsMessage::Text(Event::DisplayCount { count }.to_json()?))
                .await?;
            Ok::<_, StreamError>(count)
        };
        let count = tokio::select! {
            count = handshake => count?,
            _ = cancel.cancelled() => return Err(StreamError::Cancelled),
        };

        self.state.send_if_modified(|s| s.complete_connect().is_ok());
        info!(url = %self.url, displays = count, "connected to relay");

        session::run(ws, self.ctx.clone(), cancel.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Command;
    use crate::screen::testing::FakeScreen;
    use crate::screen::{DisplayId, RawFrame, ScreenSource};
    use crate::stream::HubSettings;
    use futures_util::StreamExt;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    struct FailingDialer;

    #[async_trait]
    impl Dialer for FailingDialer {
        async fn dial(&self, _url: &str) -> StreamResult<WsStream> {
            Err(StreamError::Transport("connection refused".into()))
        }
    }

    fn hub(displays: usize) -> Arc<CaptureHub> {
        CaptureHub::new(
            Arc::new(FakeScreen::new(displays)),
            HubSettings {
                preview_width: 32,
                rate_per_sec: 1000,
                ..HubSettings::default()
            },
            CancellationToken::new(),
        )
    }

    fn agent(url: &str, hub: Arc<CaptureHub>, dialer: Arc<dyn Dialer>) -> Arc<RelayAgent> {
        Arc::new(RelayAgent::new(
            url,
            hub,
            dialer,
            StreamConfig::default(),
            Duration::from_millis(50),
        ))
    }

    type ServerWs = WebSocketStream<TcpStream>;

    async fn next_event(ws: &mut ServerWs) -> Event {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(2), ws.next())
                .await
                .expect("event in time")
                .expect("stream open")
                .expect("read ok");
            if let WsMessage::Text(text) = msg {
                return Event::parse(&text).unwrap();
            }
        }
    }

    async fn wait_for(ws: &mut ServerWs, pred: impl Fn(&Event) -> bool) -> Event {
        loop {
            let event = next_event(ws).await;
            if pred(&event) {
                return event;
            }
        }
    }

    async fn send(ws: &mut ServerWs, cmd: Command) {
        let text = serde_json::to_string(&cmd).unwrap();
        ws.send(WsMessage::Text(text)).await.unwrap();
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn failed_dials_retry_with_backoff_until_cancelled() {
        let agent = agent("ws://unused", hub(1), Arc::new(FailingDialer));
        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let agent = agent.clone();
            let cancel = cancel.clone();
            async move { agent.run(cancel).await }
        });

        tokio::time::sleep(Duration::from_millis(180)).await;
        assert!((3..=5).contains(&agent.attempts()), "{}", agent.attempts());
        assert!(agent.state().is_disconnected());

        cancel.cancel();
        tokio::time::timeout(Duration::from_millis(200), task)
            .await
            .expect("run observes cancellation")
            .unwrap();
    }

    #[tokio::test]
    async fn connect_while_connecting_is_a_no_op() {
        let agent = agent("ws://unused", hub(1), Arc::new(FailingDialer));
        assert!(agent.try_begin_connect());
        assert!(!agent.try_begin_connect());

        agent.connect_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(agent.attempts(), 0);
        assert_eq!(agent.state(), ConnectionState::Connecting);
    }

    /// A screen whose display enumeration hangs, stalling the handshake.
    struct StalledScreen;

    impl ScreenSource for StalledScreen {
        fn display_count(&self) -> usize {
            std::thread::sleep(Duration::from_millis(800));
            1
        }

        fn capture(&self, display: DisplayId) -> StreamResult<RawFrame> {
            Err(StreamError::Capture(format!("no display {}", display)))
        }
    }

    #[tokio::test]
    async fn cancellation_interrupts_the_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let (tcp, _) = listener.accept().await.unwrap();
            let mut relay = accept_async(tcp).await.unwrap();
            while relay.next().await.is_some() {}
        });

        let hub = CaptureHub::new(
            Arc::new(StalledScreen),
            HubSettings::default(),
            CancellationToken::new(),
        );
        let agent = agent(&url, hub, Arc::new(WsDialer));
        let cancel = CancellationToken::new();
        tokio::spawn({
            let cancel = cancel.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(150)).await;
                cancel.cancel();
            }
        });

        let result = tokio::time::timeout(Duration::from_millis(500), agent.connect_once(&cancel))
            .await
            .expect("handshake observes cancellation");
        assert!(matches!(result, Err(StreamError::Cancelled)));
        assert!(agent.state().is_disconnected());
    }

    #[tokio::test]
    async fn serves_relay_and_reconnects_after_drop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let hub = hub(2);
        let agent = agent(&url, hub.clone(), Arc::new(WsDialer));
        let cancel = CancellationToken::new();
        tokio::spawn({
            let agent = agent.clone();
            let cancel = cancel.clone();
            async move { agent.run(cancel).await }
        });

        let (tcp, _) = listener.accept().await.unwrap();
        let mut relay = accept_async(tcp).await.unwrap();

        // Handshake.
        assert_eq!(next_event(&mut relay).await, Event::identify());
        assert_eq!(next_event(&mut relay).await, Event::DisplayCount { count: 2 });
        eventually(|| agent.state().is_connected()).await;

        // Streaming.
        send(
            &mut relay,
            Command::StartWatching {
                display: 1,
                user_id: "u1".into(),
            },
        )
        .await;
        let frame = wait_for(&mut relay, |e| matches!(e, Event::Frame { .. })).await;
        assert!(matches!(frame, Event::Frame { display: 1, user_id: Some(ref u), .. } if u == "u1"));
        assert_eq!(hub.registry().subscriber_count(1), 1);

        // Out-of-range settings are answered, not applied.
        send(
            &mut relay,
            Command::SetQuality {
                quality: (-1).into(),
            },
        )
        .await;
        wait_for(&mut relay, |e| matches!(e, Event::Error { .. })).await;

        // Request/response goes back to the requester only.
        send(
            &mut relay,
            Command::RequestFrame {
                display: 0,
                user_id: Some("u2".into()),
                is_preview: true,
            },
        )
        .await;
        let reply = wait_for(&mut relay, |e| {
            matches!(e, Event::Frame { user_id: Some(u), .. } if u == "u2")
        })
        .await;
        assert!(matches!(reply, Event::Frame { display: 0, is_preview: true, .. }));

        send(&mut relay, Command::RequestPreview).await;
        let previews = wait_for(&mut relay, |e| matches!(e, Event::Previews { .. })).await;
        assert!(matches!(previews, Event::Previews { data } if data.len() == 2));

        // Unknown display.
        send(
            &mut relay,
            Command::StartWatching {
                display: 9,
                user_id: "u3".into(),
            },
        )
        .await;
        wait_for(&mut relay, |e| matches!(e, Event::Error { .. })).await;
        // Unknown displays are not rejected up front.
        assert_eq!(hub.registry().subscriber_count(9), 1);

        // Relay goes away: subscriptions are torn down, then a new attempt.
        drop(relay);
        eventually(|| hub.registry().total_subscribers() == 0).await;

        let (tcp, _) = tokio::time::timeout(Duration::from_secs(2), listener.accept())
            .await
            .unwrap()
            .unwrap();
        let mut relay = accept_async(tcp).await.unwrap();
        assert_eq!(next_event(&mut relay).await, Event::identify());
        assert!(agent.attempts() >= 2);

        cancel.cancel();
    }

    #[tokio::test]
    async fn stop_watching_ends_the_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let hub = hub(1);
        let agent = agent(&url, hub.clone(), Arc::new(WsDialer));
        let cancel = CancellationToken::new();
        tokio::spawn({
            let agent = agent.clone();
            let cancel = cancel.clone();
            async move { agent.run(cancel).await }
        });

        let (tcp, _) = listener.accept().await.unwrap();
        let mut relay = accept_async(tcp).await.unwrap();
        next_event(&mut relay).await;
        next_event(&mut relay).await;

        let watch = |user: &str| Command::StartWatching {
            display: 0,
            user_id: user.into(),
        };
        send(&mut relay, watch("a")).await;
        send(&mut relay, watch("a")).await;
        wait_for(&mut relay, |e| matches!(e, Event::Frame { .. })).await;
        assert_eq!(hub.registry().subscriber_count(0), 1);

        send(
            &mut relay,
            Command::StopWatching {
                display: 0,
                user_id: "a".into(),
            },
        )
        .await;
        eventually(|| hub.registry().subscriber_count(0) == 0).await;
        cancel.cancel();
    }
}
