//! Transport primitives wrapped by `Connection`

use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::recording::MessageType;
use crate::{MockError, Result};

/// A data message headed for the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    /// Text or binary
    pub message_type: MessageType,
    /// Raw payload
    pub payload: Bytes,
}

impl OutboundMessage {
    /// Text message
    #[must_use]
    pub fn text(payload: impl Into<Bytes>) -> Self {
        Self {
            message_type: MessageType::Text,
            payload: payload.into(),
        }
    }

    /// Binary message
    #[must_use]
    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self {
            message_type: MessageType::Binary,
            payload: payload.into(),
        }
    }
}

/// Write side of an already-negotiated WebSocket
#[async_trait]
pub trait Transport: Send + Sync {
    /// Write one data message
    async fn send(&self, message: OutboundMessage) -> Result<()>;

    /// Start the close handshake
    async fn close(&self, code: u16, reason: &str) -> Result<()>;

    /// Peer address, when the transport has one
    fn remote_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// What a `ChannelTransport` delivered
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Data message
    Message(OutboundMessage),
    /// Close handshake
    Close {
        /// Close code
        code: u16,
        /// Close reason
        reason: String,
    },
}

/// In-process transport backed by an mpsc channel
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<TransportEvent>,
    remote_addr: Option<SocketAddr>,
}

impl ChannelTransport {
    /// Create a transport and the receiver observing everything it writes
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                tx,
                remote_addr: None,
            },
            rx,
        )
    }

    /// Report `addr` as the peer address
    #[must_use]
    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, message: OutboundMessage) -> Result<()> {
        self.tx
            .send(TransportEvent::Message(message))
            .map_err(|_| MockError::Transport("channel receiver dropped".to_string()))
    }

    async fn close(&self, code: u16, reason: &str) -> Result<()> {
        self.tx
            .send(TransportEvent::Close {
                code,
                reason: reason.to_string(),
            })
            .map_err(|_| MockError::Transport("channel receiver dropped".to_string()))
    }

    fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_channel_transport_delivers() {
        let (transport, mut rx) = ChannelTransport::new();

        transport.send(OutboundMessage::text("hello")).await.unwrap();
        transport.close(1000, "done").await.unwrap();

        assert_eq!(
            rx.recv().await,
            Some(TransportEvent::Message(OutboundMessage::text("hello")))
        );
        assert_eq!(
            rx.recv().await,
            Some(TransportEvent::Close {
                code: 1000,
                reason: "done".to_string()
            })
        );
    }

    #[tokio::test]
    async fn test_channel_transport_dropped_receiver() {
        let (transport, rx) = ChannelTransport::new();
        drop(rx);

        let result = transport.send(OutboundMessage::binary(vec![1, 2])).await;
        assert!(matches!(result, Err(MockError::Transport(_))));
    }
}
