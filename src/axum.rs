//! Serving juggler over an [`axum`] WebSocket route.
//!
//! `axum` performs the HTTP upgrade itself, so the server cannot run its
//! own handshake; instead [`juggler_websocket`] is mounted as a route
//! handler with an [`AxumWsCfg`] state. Subprotocol negotiation goes
//! through [`WebSocketUpgrade::protocols`], and the allow-list header is
//! read from the request before the upgrade completes.
//!
//! ```no_run
//! # use juggler::{AxumWsCfg, juggler_websocket, Server};
//! # use std::sync::Arc;
//! # fn _main(server: Arc<Server>) -> axum::Router<()> {
//! axum::Router::new()
//!     .route("/ws", axum::routing::any(juggler_websocket))
//!     .with_state(AxumWsCfg::new(server))
//! # }
//! ```

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::Response;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, Stream, StreamExt};
use tracing::debug;

use crate::msg;
use crate::server::{FrameSink, Server, ALLOWED_MESSAGES_HEADER};

/// Route state for [`juggler_websocket`].
#[derive(Clone)]
pub struct AxumWsCfg {
    server: Arc<Server>,
}

impl std::fmt::Debug for AxumWsCfg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AxumWsCfg").finish_non_exhaustive()
    }
}

impl AxumWsCfg {
    /// Wrap a configured server for use as axum route state.
    pub fn new(server: Arc<Server>) -> Self {
        Self { server }
    }
}

impl From<Arc<Server>> for AxumWsCfg {
    fn from(server: Arc<Server>) -> Self {
        Self::new(server)
    }
}

/// Axum handler upgrading to a juggler connection.
///
/// The upgrade advertises the server's subprotocol list; a client that
/// negotiates none of them is disconnected without any juggler framing.
pub async fn juggler_websocket(
    ws: WebSocketUpgrade,
    headers: HeaderMap,
    State(cfg): State<AxumWsCfg>,
) -> Response {
    let allowed = headers
        .get(ALLOWED_MESSAGES_HEADER)
        .and_then(|v| v.to_str().ok())
        .and_then(msg::parse_allowed_messages);
    let protocols = cfg.server.subprotocols.clone();

    ws.protocols(protocols).on_upgrade(move |socket: WebSocket| async move {
        if socket.protocol().is_none() {
            debug!("no supported subprotocol, closing");
            return;
        }
        let (sink, stream) = socket.split();
        match cfg
            .server
            .serve_connection(sink, AxumFrames::from(stream), allowed)
            .await
        {
            Ok(conn) => conn.closed().await,
            Err(err) => debug!(%err, "connection setup failed"),
        }
    })
}

impl FrameSink for SplitSink<WebSocket, Message> {
    type Error = axum::Error;

    async fn send_text(&mut self, text: String) -> Result<(), Self::Error> {
        self.send(Message::text(text)).await
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        self.send(Message::Close(None)).await
    }
}

/// Adapter turning an axum WebSocket read half into a frame stream.
#[derive(Debug)]
struct AxumFrames {
    inner: SplitStream<WebSocket>,
    done: bool,
}

impl From<SplitStream<WebSocket>> for AxumFrames {
    fn from(inner: SplitStream<WebSocket>) -> Self {
        Self { inner, done: false }
    }
}

impl Stream for AxumFrames {
    type Item = Bytes;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        use std::task::{ready, Poll};
        loop {
            if self.done {
                return Poll::Ready(None);
            }
            let Some(Ok(frame)) = ready!(self.inner.poll_next_unpin(cx)) else {
                self.done = true;
                return Poll::Ready(None);
            };
            match frame {
                Message::Text(text) => return Poll::Ready(Some(text.into())),
                Message::Binary(bytes) => return Poll::Ready(Some(bytes)),
                Message::Close(frame) => {
                    debug!(?frame, "peer sent close frame");
                    self.done = true;
                }
                _ => continue,
            }
        }
    }
}
