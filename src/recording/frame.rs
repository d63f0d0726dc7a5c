//! Recorded WebSocket conversation model

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::Result;

/// Which peer produced a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Sent by the client, received by the mock server
    ClientToServer,
    /// Sent by the mock server to the client
    ServerToClient,
}

/// WebSocket data message kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// UTF-8 text message
    Text,
    /// Binary message
    Binary,
}

/// How `RecordedFrame::data` is encoded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadEncoding {
    /// Stored verbatim
    Utf8,
    /// Base64 of the raw bytes
    Base64,
}

/// Protocol a recording was captured from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Plain HTTP request/response exchange
    Http,
    /// WebSocket conversation
    WebSocket,
}

/// One captured WebSocket message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedFrame {
    /// 1-based, shared across both directions
    pub sequence: u64,
    /// Milliseconds since the session started
    pub relative_ms: u64,
    /// Producer of the frame
    pub direction: Direction,
    /// Text or binary
    pub message_type: MessageType,
    /// Payload, encoded per `encoding`
    pub data: String,
    /// Payload encoding
    pub encoding: PayloadEncoding,
    /// Raw payload length in bytes
    pub data_size: usize,
}

impl RecordedFrame {
    /// Build a frame from a raw payload
    ///
    /// Binary payloads are base64-encoded; text payloads are kept as UTF-8.
    #[must_use]
    pub fn new(
        sequence: u64,
        relative_time: Duration,
        direction: Direction,
        message_type: MessageType,
        payload: &[u8],
    ) -> Self {
        let (data, encoding) = match message_type {
            MessageType::Text => (
                String::from_utf8_lossy(payload).into_owned(),
                PayloadEncoding::Utf8,
            ),
            MessageType::Binary => (BASE64.encode(payload), PayloadEncoding::Base64),
        };

        Self {
            sequence,
            relative_ms: relative_time.as_millis() as u64,
            direction,
            message_type,
            data,
            encoding,
            data_size: payload.len(),
        }
    }

    /// Offset from session start
    #[must_use]
    pub fn relative_time(&self) -> Duration {
        Duration::from_millis(self.relative_ms)
    }

    /// Whether the client produced this frame
    #[must_use]
    pub fn is_client_frame(&self) -> bool {
        self.direction == Direction::ClientToServer
    }

    /// Decode the payload back to raw bytes
    ///
    /// # Errors
    ///
    /// Returns error if a base64 payload is malformed
    pub fn payload_bytes(&self) -> Result<Bytes> {
        match self.encoding {
            PayloadEncoding::Utf8 => Ok(Bytes::from(self.data.clone())),
            PayloadEncoding::Base64 => BASE64
                .decode(self.data.as_bytes())
                .map(Bytes::from)
                .map_err(|e| crate::MockError::InvalidPayload {
                    sequence: self.sequence,
                    reason: e.to_string(),
                }),
        }
    }
}

/// Close handshake observed at the end of a recording
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseRecord {
    /// WebSocket close code
    pub code: u16,
    /// Close reason
    pub reason: String,
}

/// A captured conversation, as handed to the replayer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recording {
    /// Recording identifier
    pub id: String,
    /// Source protocol
    pub protocol: Protocol,
    /// Negotiated subprotocol, if any
    #[serde(default)]
    pub subprotocol: Option<String>,
    /// Endpoint path the client connected to
    #[serde(default)]
    pub endpoint_path: Option<String>,
    /// Frames in sequence order
    #[serde(default)]
    pub frames: Vec<RecordedFrame>,
    /// Close handshake, if one was seen
    #[serde(default)]
    pub close: Option<CloseRecord>,
}

impl Recording {
    /// Empty WebSocket recording
    #[must_use]
    pub fn websocket(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            protocol: Protocol::WebSocket,
            subprotocol: None,
            endpoint_path: None,
            frames: Vec::new(),
            close: None,
        }
    }

    /// Number of server-to-client frames
    #[must_use]
    pub fn server_frame_count(&self) -> usize {
        self.frames.iter().filter(|f| !f.is_client_frame()).count()
    }

    /// Relative time of the last frame
    #[must_use]
    pub fn duration(&self) -> Duration {
        self.frames
            .iter()
            .map(RecordedFrame::relative_time)
            .max()
            .unwrap_or_default()
    }

    /// Load a recording from a JSON file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }

    /// Write the recording to a JSON file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be written
    pub fn write_json_file(&self, path: &Path) -> Result<()> {
        let mut writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.flush()?;
        Ok(())
    }
}
