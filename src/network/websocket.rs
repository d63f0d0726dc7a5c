//! tungstenite-backed transport and message conversion

use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;

use crate::recording::MessageType;
use crate::session::{OutboundMessage, Transport, CLOSE_NORMAL};
use crate::{MockError, Result};

/// Write half of an accepted WebSocket
///
/// The sink sits behind an async mutex so replay output and close frames
/// issued from different tasks never interleave mid-frame.
pub struct WsTransport<S> {
    sink: Mutex<SplitSink<WebSocketStream<S>, Message>>,
    remote_addr: Option<SocketAddr>,
}

impl<S> WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap the write half of a split WebSocket stream
    #[must_use]
    pub fn new(
        sink: SplitSink<WebSocketStream<S>, Message>,
        remote_addr: Option<SocketAddr>,
    ) -> Self {
        Self {
            sink: Mutex::new(sink),
            remote_addr,
        }
    }
}

#[async_trait]
impl<S> Transport for WsTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&self, message: OutboundMessage) -> Result<()> {
        let mut sink = self.sink.lock().await;
        sink.send(to_message(message))
            .await
            .map_err(|e| MockError::Transport(format!("WebSocket send failed: {e}")))
    }

    async fn close(&self, code: u16, reason: &str) -> Result<()> {
        let frame = CloseFrame {
            code: CloseCode::from(code),
            reason: close_reason(reason).to_string().into(),
        };

        let mut sink = self.sink.lock().await;
        match sink.send(Message::Close(Some(frame))).await {
            Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(MockError::Transport(format!("WebSocket close failed: {e}"))),
        }
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }
}

/// Longest close reason a control frame can carry
const MAX_CLOSE_REASON: usize = 123;

fn close_reason(reason: &str) -> &str {
    if reason.len() <= MAX_CLOSE_REASON {
        return reason;
    }
    let mut end = MAX_CLOSE_REASON;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}

/// Payload of a recordable data message; `None` for control frames
#[must_use]
pub fn message_data(msg: &Message) -> Option<(MessageType, Bytes)> {
    match msg {
        Message::Text(text) => Some((MessageType::Text, Bytes::copy_from_slice(text.as_bytes()))),
        Message::Binary(data) => Some((MessageType::Binary, Bytes::copy_from_slice(data))),
        Message::Ping(_) | Message::Pong(_) | Message::Close(_) | Message::Frame(_) => None,
    }
}

/// Build a wire message from an outbound payload
///
/// Text payloads that are not valid UTF-8 are sent lossily.
#[must_use]
pub fn to_message(message: OutboundMessage) -> Message {
    match message.message_type {
        MessageType::Text => match String::from_utf8(message.payload.to_vec()) {
            Ok(text) => Message::Text(text),
            Err(e) => Message::Text(String::from_utf8_lossy(e.as_bytes()).into_owned()),
        },
        MessageType::Binary => Message::Binary(message.payload.to_vec()),
    }
}

/// Close code and reason carried by a close frame, defaulting to normal closure
#[must_use]
pub fn close_parts(frame: Option<&CloseFrame<'_>>) -> (u16, String) {
    frame.map_or_else(
        || (CLOSE_NORMAL, String::new()),
        |frame| (u16::from(frame.code), frame.reason.to_string()),
    )
}
