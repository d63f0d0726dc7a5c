//! Per-client session handling

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures_util::stream::SplitStream;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async, connect_async, WebSocketStream};
use tracing::{debug, info};

use crate::config::{Config, Mode};
use crate::recording::{ConnectionRecorder, JsonFileHook, Recording};
use crate::replay::{ReplayConfig, ReplayStatus, Replayer};
use crate::session::{
    Connection, ConnectionInfo, ConnectionManager, Transport, CLOSE_GOING_AWAY,
    CLOSE_INTERNAL_ERROR, CLOSE_NORMAL,
};
use crate::{MockError, Result};

use super::admission::ConnectionLimit;
use super::websocket::{close_parts, message_data, WsTransport};
use super::{CONNECT_TIMEOUT_MS, HANDSHAKE_TIMEOUT_MS};

type ClientSource = SplitStream<WebSocketStream<TcpStream>>;

/// Close code and reason a session ended with
type CloseOutcome = (u16, String);

/// State shared by every session of one server
pub(super) struct SessionHandler {
    pub(super) config: Arc<Config>,
    pub(super) manager: Arc<ConnectionManager>,
    pub(super) limit: ConnectionLimit,
    pub(super) recording: Option<Arc<Recording>>,
    pub(super) replay_config: ReplayConfig,
    pub(super) replays: DashMap<String, Arc<Replayer>>,
}

impl SessionHandler {
    /// Serve one accepted TCP stream until either side closes
    pub(super) async fn handle(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        let preferred = self
            .recording
            .as_deref()
            .and_then(|recording| recording.subprotocol.clone());

        let mut path = String::from("/");
        let mut subprotocol = None;
        let callback = |request: &Request,
                        mut response: Response|
         -> std::result::Result<Response, ErrorResponse> {
            path = request.uri().path().to_string();
            let offered = request
                .headers()
                .get(SEC_WEBSOCKET_PROTOCOL)
                .and_then(|value| value.to_str().ok());
            if let Some(protocol) = negotiate(offered, preferred.as_deref()) {
                if let Ok(value) = HeaderValue::from_str(&protocol) {
                    response.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, value);
                    subprotocol = Some(protocol);
                }
            }
            Ok(response)
        };

        let ws = tokio::time::timeout(
            Duration::from_millis(HANDSHAKE_TIMEOUT_MS),
            accept_hdr_async(stream, callback),
        )
        .await
        .map_err(|_| MockError::Transport(format!("Handshake with {peer} timed out")))?
        .map_err(|e| MockError::Transport(format!("WebSocket accept failed: {e}")))?;

        let mut info = ConnectionInfo::new(path);
        if let Some(protocol) = subprotocol {
            info = info.with_subprotocol(protocol);
        }

        let (sink, mut source) = ws.split();
        let transport: Arc<dyn Transport> = Arc::new(WsTransport::new(sink, Some(peer)));
        let conn = self.manager.open(info, transport);
        conn.set_metadata("remote_addr", Value::String(peer.to_string()));

        let result = match self.config.mode {
            Mode::Replay => self.replay(&conn, &mut source).await,
            Mode::Record => self.record(&conn, &mut source).await,
        };

        let (code, reason) = match &result {
            Ok(outcome) => outcome.clone(),
            Err(e) => (CLOSE_INTERNAL_ERROR, e.to_string()),
        };
        if let Err(e) = conn.close(code, &reason).await {
            debug!("Close handshake with {} failed: {}", conn.id(), e);
        }

        result.map(|_| ())
    }

    async fn replay(
        &self,
        conn: &Arc<Connection>,
        source: &mut ClientSource,
    ) -> Result<CloseOutcome> {
        let replayer =
            Replayer::new(self.recording.as_deref(), Arc::clone(conn), self.replay_config)?;
        self.replays
            .insert(conn.id().to_string(), Arc::clone(&replayer));

        let outcome = drive_replay(conn, &replayer, source).await;

        self.replays.remove(conn.id());
        replayer.stop().ok();
        outcome
    }

    async fn record(
        &self,
        conn: &Arc<Connection>,
        source: &mut ClientSource,
    ) -> Result<CloseOutcome> {
        let base = self.config.server.upstream_url.as_deref().ok_or_else(|| {
            MockError::ConfigError("Record mode requires server.upstream_url".to_string())
        })?;
        let url = upstream_url(base, conn.endpoint_path());

        let (mut upstream, _) = tokio::time::timeout(
            Duration::from_millis(CONNECT_TIMEOUT_MS),
            connect_async(url.as_str()),
        )
        .await
        .map_err(|_| MockError::Transport(format!("Timed out connecting to {url}")))?
        .map_err(|e| MockError::Transport(format!("WebSocket connect failed: {e}")))?;

        let hook = JsonFileHook::new(&self.config.recording.dir, conn.id())
            .with_endpoint_path(conn.endpoint_path());
        let recorder = ConnectionRecorder::start(Arc::new(hook), conn.subprotocol());
        conn.attach_recorder(Arc::new(recorder));
        info!("Recording {} via {}", conn.id(), url);

        let cancel = conn.context();
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    upstream.close(None).await.ok();
                    return Ok((CLOSE_GOING_AWAY, "server shutting down".to_string()));
                }
                // Client -> Upstream
                message = source.next() => match message {
                    Some(Ok(Message::Close(frame))) => {
                        debug!("Client {} closed connection", conn.id());
                        let outcome = close_parts(frame.as_ref());
                        upstream.send(Message::Close(frame)).await.ok();
                        return Ok(outcome);
                    }
                    Some(Ok(msg)) => {
                        if let Some((kind, data)) = message_data(&msg) {
                            conn.note_received(kind, &data)?;
                            upstream.send(msg).await.map_err(|e| {
                                MockError::Transport(format!("Failed to forward to upstream: {e}"))
                            })?;
                        }
                    }
                    Some(Err(e)) => {
                        return Err(MockError::Transport(format!("Client read failed: {e}")));
                    }
                    None => {
                        upstream.close(None).await.ok();
                        return Ok((CLOSE_NORMAL, String::new()));
                    }
                },
                // Upstream -> Client
                message = upstream.next() => match message {
                    Some(Ok(Message::Close(frame))) => {
                        debug!("Upstream closed connection for {}", conn.id());
                        return Ok(close_parts(frame.as_ref()));
                    }
                    Some(Ok(msg)) => {
                        if let Some((kind, data)) = message_data(&msg) {
                            conn.send(kind, data).await?;
                        }
                    }
                    Some(Err(e)) => {
                        return Err(MockError::Transport(format!("Upstream read failed: {e}")));
                    }
                    None => return Ok((CLOSE_GOING_AWAY, "upstream went away".to_string())),
                },
            }
        }
    }
}

async fn drive_replay(
    conn: &Arc<Connection>,
    replayer: &Arc<Replayer>,
    source: &mut ClientSource,
) -> Result<CloseOutcome> {
    replayer.start()?;

    let cancel = conn.context();
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                return Ok((CLOSE_GOING_AWAY, "server shutting down".to_string()));
            }
            status = replayer.wait() => {
                debug!("Replay on {} ended: {}", conn.id(), status);
                return Ok(match status {
                    ReplayStatus::Error => (
                        CLOSE_INTERNAL_ERROR,
                        replayer.last_error().unwrap_or_default(),
                    ),
                    other => (CLOSE_NORMAL, format!("replay {other}")),
                });
            }
            message = source.next() => match message {
                Some(Ok(Message::Close(frame))) => return Ok(close_parts(frame.as_ref())),
                Some(Ok(msg)) => {
                    if let Some((kind, data)) = message_data(&msg) {
                        conn.note_received(kind, &data)?;
                        replayer.on_client_message(data).await;
                    }
                }
                Some(Err(e)) => {
                    return Err(MockError::Transport(format!("Client read failed: {e}")));
                }
                None => return Ok((CLOSE_NORMAL, String::new())),
            },
        }
    }
}

/// Pick the subprotocol to answer with
///
/// With a preferred protocol only that one is accepted; otherwise the
/// client's first offer wins.
fn negotiate(offered: Option<&str>, preferred: Option<&str>) -> Option<String> {
    let mut offers = offered?.split(',').map(str::trim).filter(|p| !p.is_empty());
    match preferred {
        Some(preferred) => offers.find(|p| *p == preferred).map(str::to_string),
        None => offers.next().map(str::to_string),
    }
}

/// Upstream URL for a client that connected on `path`
fn upstream_url(base: &str, path: &str) -> String {
    if path.is_empty() || path == "/" {
        base.to_string()
    } else {
        format!("{}{}", base.trim_end_matches('/'), path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negotiate() {
        assert_eq!(negotiate(None, None), None);
        assert_eq!(
            negotiate(Some("chat, superchat"), None),
            Some("chat".to_string())
        );
        assert_eq!(
            negotiate(Some("chat, superchat"), Some("superchat")),
            Some("superchat".to_string())
        );
        assert_eq!(negotiate(Some("chat"), Some("graphql-ws")), None);
    }

    #[test]
    fn test_upstream_url() {
        assert_eq!(upstream_url("ws://up:9000", "/"), "ws://up:9000");
        assert_eq!(upstream_url("ws://up:9000/", "/feed"), "ws://up:9000/feed");
        assert_eq!(upstream_url("ws://up:9000", "/a/b"), "ws://up:9000/a/b");
    }
}
