//! WebSocket transport for the relay channel.
//!
//! Thin wrapper around `tokio-tungstenite` providing type-isolated
//! reader/writer halves, so the relay loop never touches tungstenite types
//! directly. [`connect`] resolves the relay's `/rpc` endpoint, bounds the
//! handshake with a timeout, and returns a ([`WsWriter`], [`WsReader`])
//! pair ready for a `tokio::select!` loop.

// Rust guideline compliant 2026-02

use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite;

/// Path of the relay's WebSocket endpoint.
pub const RPC_PATH: &str = "rpc";

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Received WebSocket message.
#[derive(Debug, PartialEq, Eq)]
pub enum WsMessage {
    /// UTF-8 text frame.
    Text(String),
    /// Binary frame.
    Binary(Vec<u8>),
    /// Close frame with status code and reason.
    Close {
        /// WebSocket close code (1000 = normal, 1005 = no code).
        code: u16,
        /// Human-readable close reason.
        reason: String,
    },
}

/// Write half of a WebSocket connection.
#[derive(Debug)]
pub struct WsWriter {
    sink: futures_util::stream::SplitSink<WsStream, tungstenite::Message>,
}

impl WsWriter {
    /// Send a UTF-8 text frame.
    pub async fn send_text(&mut self, text: &str) -> Result<()> {
        self.sink
            .send(tungstenite::Message::Text(text.to_string()))
            .await
            .context("WebSocket send_text failed")
    }

    /// Send a close frame and flush.
    pub async fn close(&mut self) -> Result<()> {
        self.sink
            .send(tungstenite::Message::Close(None))
            .await
            .context("WebSocket send_close failed")?;
        self.sink.close().await.context("WebSocket close failed")
    }
}

/// Read half of a WebSocket connection.
#[derive(Debug)]
pub struct WsReader {
    stream: futures_util::stream::SplitStream<WsStream>,
}

impl WsReader {
    /// Receive the next message, returning `None` when the stream ends.
    ///
    /// Ping/pong and raw frames are handled by tungstenite and skipped here.
    pub async fn recv(&mut self) -> Option<Result<WsMessage>> {
        loop {
            match self.stream.next().await? {
                Ok(tungstenite::Message::Text(text)) => {
                    return Some(Ok(WsMessage::Text(text.to_string())));
                }
                Ok(tungstenite::Message::Binary(data)) => {
                    return Some(Ok(WsMessage::Binary(data.to_vec())));
                }
                Ok(tungstenite::Message::Close(close_frame)) => {
                    let (code, reason) = close_frame
                        .map(|cf| (cf.code.into(), cf.reason.to_string()))
                        .unwrap_or((1005, String::new()));
                    return Some(Ok(WsMessage::Close { code, reason }));
                }
                Ok(
                    tungstenite::Message::Ping(_)
                    | tungstenite::Message::Pong(_)
                    | tungstenite::Message::Frame(_),
                ) => continue,
                Err(e) => return Some(Err(anyhow::anyhow!("WebSocket read error: {e}"))),
            }
        }
    }
}

/// Open a WebSocket to `url`, failing if the handshake exceeds `timeout`.
pub async fn connect(url: &str, timeout: Duration) -> Result<(WsWriter, WsReader)> {
    use tungstenite::client::IntoClientRequest;

    let request = url
        .into_client_request()
        .with_context(|| format!("invalid WebSocket URL: {url}"))?;

    let (ws_stream, _response) = tokio::time::timeout(timeout, tokio_tungstenite::connect_async(request))
        .await
        .with_context(|| format!("WebSocket connect timed out after {timeout:?}"))?
        .context("WebSocket connect failed")?;

    let (sink, stream) = ws_stream.split();

    Ok((WsWriter { sink }, WsReader { stream }))
}

/// Convert an HTTP(S) URL to WS(S) scheme.
///
/// Passes `ws://` and `wss://` through unchanged.
#[must_use]
pub fn http_to_ws_scheme(url: &str) -> String {
    if url.starts_with("wss://") || url.starts_with("ws://") {
        url.to_string()
    } else {
        url.replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1)
    }
}

/// WebSocket endpoint of a relay server: `{relay}/rpc` on the ws scheme.
#[must_use]
pub fn relay_socket_url(relay: &url::Url) -> String {
    let base = relay.as_str().trim_end_matches('/');
    http_to_ws_scheme(&format!("{base}/{RPC_PATH}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_to_ws_scheme() {
        assert_eq!(http_to_ws_scheme("https://example.com"), "wss://example.com");
        assert_eq!(http_to_ws_scheme("http://localhost:3000"), "ws://localhost:3000");
        assert_eq!(http_to_ws_scheme("ws://localhost:3000/rpc"), "ws://localhost:3000/rpc");
    }

    #[test]
    fn test_relay_socket_url() {
        let relay = url::Url::parse("https://www.walletlink.org").unwrap();
        assert_eq!(relay_socket_url(&relay), "wss://www.walletlink.org/rpc");

        let local = url::Url::parse("http://127.0.0.1:8080/").unwrap();
        assert_eq!(relay_socket_url(&local), "ws://127.0.0.1:8080/rpc");
    }

    #[tokio::test]
    async fn test_connect_invalid_url_returns_error() {
        assert!(connect("not-a-url", Duration::from_secs(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_connect_unreachable_host_returns_error() {
        let result = connect("ws://127.0.0.1:1/rpc", Duration::from_secs(5)).await;
        assert!(result.is_err());
    }
}
