//! Multipart HTTP mode: `GET /stream` serves an MJPEG stream of one
//! display, `POST /` adjusts the shared quality.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::{Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Form, Router,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::{BufMut, Bytes, BytesMut};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio_stream::{wrappers::ReceiverStream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::screen::DisplayId;
use crate::stream::{CaptureHub, ConfigHandle, StreamItem, Ticket};

pub struct WebState {
    pub hub: Arc<CaptureHub>,
    pub display: DisplayId,
    /// Shared by every HTTP stream. Compression is off in this mode.
    pub config: ConfigHandle,
    pub auth: Option<Credentials>,
}

/// Basic-auth credentials, stored as digests so checks take the same time
/// however much of the input matches.
pub struct Credentials {
    user: blake3::Hash,
    password: blake3::Hash,
}

impl Credentials {
    pub fn new(user: &str, password: &str) -> Self {
        Self {
            user: blake3::hash(user.as_bytes()),
            password: blake3::hash(password.as_bytes()),
        }
    }

    pub fn verify(&self, user: &str, password: &str) -> bool {
        // Both comparisons always run.
        let user_ok = self.user == blake3::hash(user.as_bytes());
        let password_ok = self.password == blake3::hash(password.as_bytes());
        user_ok & password_ok
    }

    /// Check an `Authorization: Basic ...` header.
    fn verify_header(&self, headers: &HeaderMap) -> bool {
        let Some(encoded) = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Basic "))
        else {
            return false;
        };
        let Ok(decoded) = STANDARD.decode(encoded.trim()) else {
            return false;
        };
        let Ok(pair) = String::from_utf8(decoded) else {
            return false;
        };
        match pair.split_once(':') {
            Some((user, password)) => self.verify(user, password),
            None => false,
        }
    }
}

pub fn router(state: Arc<WebState>) -> Router {
    let mut router = Router::new()
        .route("/stream", get(stream))
        .route("/", axum::routing::post(set_quality));
    if state.auth.is_some() {
        router = router.layer(middleware::from_fn_with_state(state.clone(), require_auth));
    }
    router.with_state(state)
}

/// Bind and serve until `cancel` fires.
pub async fn serve(addr: &str, state: Arc<WebState>, cancel: CancellationToken) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    println!("📺 framecast HTTP stream");
    println!("📡 Listening on: http://{}/stream", listener.local_addr()?);
    if state.auth.is_some() {
        println!("🔒 Basic auth enabled");
    }
    println!();

    axum::serve(listener, router(state))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await?;
    info!("http server stopped");
    Ok(())
}

async fn require_auth(State(state): State<Arc<WebState>>, req: Request, next: Next) -> Response {
    let authorized = state
        .auth
        .as_ref()
        .map_or(true, |creds| creds.verify_header(req.headers()));
    if !authorized {
        return (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Basic realm=\"framecast\"")],
            "Unauthorized",
        )
            .into_response();
    }
    next.run(req).await
}

/// Unregisters the HTTP subscriber when its response body is dropped.
struct StreamGuard {
    hub: Arc<CaptureHub>,
    display: DisplayId,
    id: String,
    ticket: Ticket,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.hub.unwatch(self.display, &self.id, self.ticket);
        debug!(display_id = self.display, subscriber = %self.id, "http stream closed");
    }
}

async fn stream(State(state): State<Arc<WebState>>) -> Response {
    if state.hub.throttle().admit().is_err() {
        return (StatusCode::TOO_MANY_REQUESTS, "Too many requests").into_response();
    }

    let id = uuid::Uuid::new_v4().to_string();
    let (ticket, rx) = state
        .hub
        .watch(state.display, id.clone(), state.config.clone(), None);
    info!(display_id = state.display, subscriber = %id, "http stream opened");
    let guard = StreamGuard {
        hub: state.hub.clone(),
        display: state.display,
        id,
        ticket,
    };

    let body = ReceiverStream::new(rx).filter_map(move |item| {
        let _alive = &guard;
        match item {
            StreamItem::Frame(frame) => Some(Ok::<Bytes, std::io::Error>(mjpeg_part(&frame.data))),
            StreamItem::Error(_) => None,
        }
    });

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "multipart/x-mixed-replace; boundary=frame")
        .header(header::CACHE_CONTROL, "no-cache, no-store, must-revalidate")
        .header(header::CONNECTION, "keep-alive")
        .body(Body::from_stream(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

#[derive(Debug, Deserialize)]
struct QualityForm {
    #[serde(default)]
    quality: String,
}

async fn set_quality(State(state): State<Arc<WebState>>, Form(form): Form<QualityForm>) -> Response {
    let Ok(quality) = form.quality.trim().parse::<i64>() else {
        return (StatusCode::BAD_REQUEST, "Invalid quality value").into_response();
    };
    let applied = state.config.write().set_quality(quality);
    match applied {
        Ok(()) => {
            state.hub.wake(state.display);
            info!(quality, "quality updated");
            (StatusCode::OK, format!("Quality set to {}", quality)).into_response()
        }
        Err(e) => (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    }
}

/// One multipart section carrying a JPEG.
fn mjpeg_part(jpeg: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(64 + jpeg.len());
    buf.put_slice(b"--frame\r\n");
    buf.put_slice(b"Content-Type: image/jpeg\r\n\r\n");
    buf.put_slice(jpeg);
    buf.put_slice(b"\r\n");
    buf.freeze()
}
