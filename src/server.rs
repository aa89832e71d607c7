//! Server configuration and the WebSocket serve path.
//!
//! A [`Server`] owns the brokers and the per-connection limits. It can
//! accept raw TCP connections itself ([`Server::serve`], performing the
//! subprotocol negotiation during the WebSocket upgrade), or be handed
//! pre-upgraded sockets ([`Server::serve_connection`]) by an outer HTTP
//! stack such as the `axum` integration.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error};

use crate::broker::{CallerBroker, PubSubBroker};
use crate::conn::{Conn, ConnStateFn};
use crate::error::Error;
use crate::msg::{self, Kind, Msg};
use crate::TaskSet;

/// Protocol versions this server speaks, in preference order.
pub const SUBPROTOCOLS: &[&str] = &["juggler.0"];

/// Handshake header naming the client's intended message kinds.
pub const ALLOWED_MESSAGES_HEADER: &str = "Juggler-Allowed-Messages";

/// Default capacity of the bounded hand-off feeding a connection's
/// write flow.
pub const DEFAULT_WRITE_BUFFER: usize = 16;

/// Sink half of a connection's transport.
pub trait FrameSink: Send + 'static {
    /// Transport error type.
    type Error: std::error::Error + Send + 'static;

    /// Write one text frame.
    fn send_text(&mut self, text: String) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Close the transport.
    fn close(&mut self) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

/// Stream half of a connection's transport: one data frame's bytes per
/// item, ending when the peer goes away.
pub trait FrameStream: Stream<Item = Bytes> + Send + Unpin + 'static {}

impl<T> FrameStream for T where T: Stream<Item = Bytes> + Send + Unpin + 'static {}

/// A message handler in the read chain.
///
/// The chain's default terminal handler is [`process_msg`]; a custom
/// read handler is expected to call it once its own processing is done,
/// or to fully process the message itself.
///
/// [`process_msg`]: crate::conn::process_msg
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Process one message for `conn`.
    async fn handle(&self, conn: &Conn, msg: Msg);
}

/// A message handler in the write chain.
///
/// When set, it is the terminal processing step for every outgoing
/// message: whatever it returns goes through the size/deadline checks
/// and onto the socket, and returning `None` consumes the message
/// without writing anything. The default (no handler) writes messages
/// as-is.
#[async_trait]
pub trait WriteHandler: Send + Sync + 'static {
    /// Process one outgoing message for `conn`, returning what should
    /// actually be written.
    async fn handle(&self, conn: &Conn, msg: Msg) -> Option<Msg>;
}

/// A juggler server: brokers, limits, and handler chains.
///
/// Fields are set through the builder methods and must not change once
/// connections are being served.
pub struct Server {
    pub(crate) caller_broker: Arc<dyn CallerBroker>,
    pub(crate) pubsub_broker: Arc<dyn PubSubBroker>,

    /// Max bytes of an incoming message; overflow closes the connection.
    /// 0 means unlimited.
    pub(crate) read_limit: usize,
    /// Max bytes of an outgoing message; overflow substitutes an ERR.
    /// 0 means unlimited.
    pub(crate) write_limit: usize,
    /// Per-message read deadline. Zero means none.
    pub(crate) read_timeout: Duration,
    /// Per-message write deadline. Zero means none.
    pub(crate) write_timeout: Duration,
    /// Bound on the wait for a write-path slot. Zero means unbounded.
    pub(crate) acquire_write_lock_timeout: Duration,
    pub(crate) write_buffer: usize,
    pub(crate) subprotocols: Vec<String>,

    pub(crate) conn_state: Option<ConnStateFn>,
    pub(crate) read_handler: Option<Arc<dyn Handler>>,
    pub(crate) write_handler: Option<Arc<dyn WriteHandler>>,

    pub(crate) root_tasks: TaskSet,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("read_limit", &self.read_limit)
            .field("write_limit", &self.write_limit)
            .field("read_timeout", &self.read_timeout)
            .field("write_timeout", &self.write_timeout)
            .field("subprotocols", &self.subprotocols)
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Create a server over the given brokers, with no limits and the
    /// default subprotocol list.
    pub fn new(caller_broker: Arc<dyn CallerBroker>, pubsub_broker: Arc<dyn PubSubBroker>) -> Self {
        Self {
            caller_broker,
            pubsub_broker,
            read_limit: 0,
            write_limit: 0,
            read_timeout: Duration::ZERO,
            write_timeout: Duration::ZERO,
            acquire_write_lock_timeout: Duration::ZERO,
            write_buffer: DEFAULT_WRITE_BUFFER,
            subprotocols: SUBPROTOCOLS.iter().map(|s| s.to_string()).collect(),
            conn_state: None,
            read_handler: None,
            write_handler: None,
            root_tasks: TaskSet::new(),
        }
    }

    /// Cap incoming message size; overflow closes the connection.
    pub fn with_read_limit(mut self, limit: usize) -> Self {
        self.read_limit = limit;
        self
    }

    /// Cap outgoing message size; an oversize message is replaced by an
    /// ERR naming it.
    pub fn with_write_limit(mut self, limit: usize) -> Self {
        self.write_limit = limit;
        self
    }

    /// Per-message read deadline.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Per-message write deadline.
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Bound the wait for a write-path slot; timing out abandons the
    /// message and closes the connection.
    pub fn with_acquire_write_lock_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_write_lock_timeout = timeout;
        self
    }

    /// Capacity of the bounded hand-off feeding the write flow.
    pub fn with_write_buffer(mut self, capacity: usize) -> Self {
        self.write_buffer = capacity.max(1);
        self
    }

    /// Replace the advertised subprotocol list.
    pub fn with_subprotocols(mut self, subprotocols: Vec<String>) -> Self {
        self.subprotocols = subprotocols;
        self
    }

    /// Observe connection state transitions.
    pub fn with_conn_state(mut self, conn_state: ConnStateFn) -> Self {
        self.conn_state = Some(conn_state);
        self
    }

    /// Replace the terminal read handler.
    pub fn with_read_handler(mut self, handler: Arc<dyn Handler>) -> Self {
        self.read_handler = Some(handler);
        self
    }

    /// Replace the terminal write handler: it receives every outgoing
    /// message and decides what, if anything, is written in its place.
    pub fn with_write_handler(mut self, handler: Arc<dyn WriteHandler>) -> Self {
        self.write_handler = Some(handler);
        self
    }

    /// Serve one pre-negotiated connection. `allowed` is the decoded
    /// allow-list header, when the handshake carried one.
    pub async fn serve_connection<S, R>(
        self: &Arc<Self>,
        sink: S,
        stream: R,
        allowed: Option<Vec<Kind>>,
    ) -> Result<Conn, Error>
    where
        S: FrameSink,
        R: FrameStream,
    {
        Conn::spawn(self.clone(), sink, stream, allowed).await
    }

    /// Accept and serve WebSocket connections from `listener` until the
    /// returned [`ServerShutdown`] is dropped or shut down.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> ServerShutdown {
        let tasks = self.root_tasks.clone();
        let server = self.clone();
        tasks.clone().spawn_cancellable(async move {
            loop {
                let (stream, remote) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        error!(%err, "accept failed");
                        continue;
                    }
                };
                debug!(%remote, "inbound connection");
                let server = server.clone();
                server
                    .root_tasks
                    .clone()
                    .spawn_graceful(move |cancel| async move {
                        tokio::pin!(cancel);
                        let upgraded = tokio::select! {
                            biased;
                            _ = &mut cancel => return,
                            upgraded = server.upgrade(stream) => upgraded,
                        };
                        let (ws, allowed) = match upgraded {
                            Ok(upgraded) => upgraded,
                            Err(err) => {
                                debug!(%remote, %err, "connection rejected");
                                return;
                            }
                        };
                        let (sink, stream) = ws.split();
                        match server
                            .serve_connection(sink, WsFrames::from(stream), allowed)
                            .await
                        {
                            // the flows observe shutdown through their own
                            // cancellation; wait for them to wind down
                            Ok(conn) => conn.closed().await,
                            Err(err) => debug!(%remote, %err, "connection setup failed"),
                        }
                    });
            }
        });
        ServerShutdown { tasks }
    }

    /// Upgrade a raw TCP stream, negotiating the subprotocol and decoding
    /// the allow-list header. A handshake that agrees on no supported
    /// subprotocol is rejected; the dropped socket closes without any
    /// further framing.
    async fn upgrade(
        &self,
        stream: TcpStream,
    ) -> Result<(WebSocketStream<TcpStream>, Option<Vec<Kind>>), Error> {
        let mut allowed: Option<Vec<Kind>> = None;
        let mut negotiated = false;

        let callback = |req: &Request, mut resp: Response| -> Result<Response, ErrorResponse> {
            if let Some(value) = req
                .headers()
                .get(ALLOWED_MESSAGES_HEADER)
                .and_then(|v| v.to_str().ok())
            {
                allowed = msg::parse_allowed_messages(value);
            }
            let offered = req
                .headers()
                .get("Sec-WebSocket-Protocol")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            if let Some(proto) = select_subprotocol(offered, &self.subprotocols) {
                if let Ok(value) = HeaderValue::from_str(&proto) {
                    resp.headers_mut().insert("Sec-WebSocket-Protocol", value);
                    negotiated = true;
                }
            }
            Ok(resp)
        };

        let ws = tokio_tungstenite::accept_hdr_async(stream, callback)
            .await
            .map_err(|e| Error::Handshake(e.to_string()))?;

        if !negotiated {
            return Err(Error::Handshake("no supported subprotocol".into()));
        }
        Ok((ws, allowed))
    }
}

/// Pick the first client-offered subprotocol the server supports.
fn select_subprotocol(offered: &str, supported: &[String]) -> Option<String> {
    offered
        .split(',')
        .map(str::trim)
        .find(|o| supported.iter().any(|s| s == o))
        .map(str::to_owned)
}

/// Running server handle. Dropping it cancels the accept loop and every
/// served connection.
#[derive(Debug)]
pub struct ServerShutdown {
    tasks: TaskSet,
}

impl ServerShutdown {
    /// Signal all server tasks to stop.
    pub fn cancel(&self) {
        self.tasks.cancel();
    }

    /// Whether a stop was signalled.
    pub fn is_cancelled(&self) -> bool {
        self.tasks.is_cancelled()
    }

    /// Stop the server and wait for every connection to wind down.
    pub async fn shutdown(self) {
        self.tasks.shutdown().await;
    }
}

impl Drop for ServerShutdown {
    fn drop(&mut self) {
        self.tasks.cancel();
    }
}

impl<T> FrameSink for SplitSink<WebSocketStream<T>, Message>
where
    T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    type Error = tokio_tungstenite::tungstenite::Error;

    async fn send_text(&mut self, text: String) -> Result<(), Self::Error> {
        self.send(Message::text(text)).await
    }

    async fn close(&mut self) -> Result<(), Self::Error> {
        self.send(Message::Close(None)).await
    }
}

/// Adapter turning a WebSocket read half into a [`FrameStream`]: text and
/// binary frames pass through, control frames are skipped, and a close
/// frame (or transport error) ends the stream.
#[derive(Debug)]
pub struct WsFrames<T> {
    inner: SplitStream<WebSocketStream<T>>,
    done: bool,
}

impl<T> From<SplitStream<WebSocketStream<T>>> for WsFrames<T> {
    fn from(inner: SplitStream<WebSocketStream<T>>) -> Self {
        Self { inner, done: false }
    }
}

impl<T> Stream for WsFrames<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
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
