//! A bare WebSocket client for crafting arbitrary frames, including ones
//! the [`juggler::Client`] would refuse to send.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use juggler::Msg;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub struct RawClient {
    socket: WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
}

impl RawClient {
    /// Connect with the juggler subprotocol and an optional
    /// `Juggler-Allowed-Messages` header value.
    pub async fn connect(url: &str, allowed: Option<&str>) -> RawClient {
        let mut request = url.into_client_request().unwrap();
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_static("juggler.0"),
        );
        if let Some(allowed) = allowed {
            request.headers_mut().insert(
                "Juggler-Allowed-Messages",
                HeaderValue::from_str(allowed).unwrap(),
            );
        }
        let (socket, response) = tokio_tungstenite::connect_async(request).await.unwrap();
        assert_eq!(
            response
                .headers()
                .get("Sec-WebSocket-Protocol")
                .and_then(|v| v.to_str().ok()),
            Some("juggler.0"),
            "server did not negotiate the juggler subprotocol"
        );
        RawClient { socket }
    }

    /// Connect without offering any subprotocol.
    pub async fn connect_bare(url: &str) -> RawClient {
        let request = url.into_client_request().unwrap();
        let (socket, _) = tokio_tungstenite::connect_async(request).await.unwrap();
        RawClient { socket }
    }

    pub async fn send(&mut self, msg: &Msg) {
        self.send_text(serde_json::to_string(msg).unwrap()).await;
    }

    pub async fn send_text(&mut self, text: String) {
        self.socket.send(Message::text(text)).await.unwrap();
    }

    /// The next juggler message, or `None` once the server closes the
    /// connection. Panics after 5s of silence.
    pub async fn recv(&mut self) -> Option<Msg> {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), self.socket.next())
                .await
                .expect("timed out waiting for a frame")?;
            match frame {
                Ok(Message::Text(text)) => {
                    return Some(Msg::from_slice(text.as_bytes()).expect("valid juggler message"))
                }
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => continue,
            }
        }
    }
}
