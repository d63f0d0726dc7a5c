//! Record a conversation, then replay it onto a fresh connection

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tempfile::TempDir;
use tokio::sync::mpsc;

use mockwire::recording::{
    ConnectionRecorder, Direction, JsonFileHook, MemoryHook, MessageType, RecordedFrame, Recording,
    WebSocketRecordingHook,
};
use mockwire::replay::{ReplayConfig, ReplayMode, ReplayStatus, Replayer};
use mockwire::session::{
    ChannelTransport, Connection, ConnectionInfo, ConnectionManager, TransportEvent,
};

type OutboundPayload = (MessageType, Bytes);

fn open(manager: &ConnectionManager) -> (Arc<Connection>, mpsc::UnboundedReceiver<TransportEvent>) {
    let (transport, rx) = ChannelTransport::new();
    let conn = manager.open(ConnectionInfo::new("/chat"), Arc::new(transport));
    (conn, rx)
}

fn drain(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> Vec<TransportEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Drive a short chat through a recorded connection
async fn record_chat(manager: &ConnectionManager, hook: Arc<dyn WebSocketRecordingHook>) {
    let (conn, _rx) = open(manager);
    conn.attach_recorder(Arc::new(ConnectionRecorder::start(hook, Some("chat.v1"))));

    conn.note_received(MessageType::Text, b"{\"op\":\"join\"}").unwrap();
    conn.send_text("{\"op\":\"welcome\"}").await.unwrap();
    conn.note_received(MessageType::Text, b"{\"op\":\"ping\"}").unwrap();
    conn.send(MessageType::Binary, Bytes::from_static(&[0x00, 0xff, 0x10]))
        .await
        .unwrap();

    assert!(conn.close(1000, "done").await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_recorded_session_replays_server_frames() {
    let manager = ConnectionManager::default();
    let hook = Arc::new(MemoryHook::new("chat-session").with_endpoint_path("/chat"));
    record_chat(&manager, hook.clone()).await;

    assert!(hook.is_complete());
    let recording = hook.snapshot();
    assert_eq!(recording.subprotocol.as_deref(), Some("chat.v1"));
    assert_eq!(recording.frames.len(), 4);
    assert_eq!(recording.server_frame_count(), 2);
    assert_eq!(
        recording.frames.iter().map(|f| f.direction).collect::<Vec<_>>(),
        vec![
            Direction::ClientToServer,
            Direction::ServerToClient,
            Direction::ClientToServer,
            Direction::ServerToClient,
        ]
    );
    assert_eq!(recording.close.as_ref().map(|c| c.code), Some(1000));

    let (conn, mut rx) = open(&manager);
    let replayer = Replayer::new(&recording, conn, ReplayConfig::default()).unwrap();
    replayer.start().unwrap();
    assert_eq!(replayer.wait().await, ReplayStatus::Completed);

    let payloads: Vec<OutboundPayload> = drain(&mut rx)
        .into_iter()
        .filter_map(|event| match event {
            TransportEvent::Message(message) => Some((message.message_type, message.payload)),
            TransportEvent::Close { .. } => None,
        })
        .collect();
    assert_eq!(
        payloads,
        vec![
            (MessageType::Text, Bytes::from_static(b"{\"op\":\"welcome\"}")),
            (MessageType::Binary, Bytes::from_static(&[0x00, 0xff, 0x10])),
        ]
    );
}

#[tokio::test]
async fn test_json_recording_replays_synchronized() {
    let temp_dir = TempDir::new().unwrap();
    let manager = ConnectionManager::default();

    let hook = Arc::new(JsonFileHook::new(temp_dir.path(), "sync-chat"));
    let path = hook.path().to_path_buf();
    record_chat(&manager, hook).await;

    let recording = Recording::from_json_file(&path).unwrap();
    assert_eq!(recording.id, "sync-chat");

    let (conn, mut rx) = open(&manager);
    let config = ReplayConfig::new(ReplayMode::synchronized(Duration::from_secs(5)));
    let replayer = Replayer::new(&recording, Arc::clone(&conn), config).unwrap();
    replayer.start().unwrap();

    // Nothing is emitted until the first client frame arrives
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(drain(&mut rx).is_empty());

    assert!(
        replayer
            .on_client_message(Bytes::from_static(b"{\"op\":\"join\"}"))
            .await
    );
    assert!(
        replayer
            .on_client_message(Bytes::from_static(b"{\"op\":\"ping\"}"))
            .await
    );

    let status = tokio::time::timeout(Duration::from_secs(5), replayer.wait())
        .await
        .unwrap();
    assert_eq!(status, ReplayStatus::Completed);
    assert_eq!(replayer.progress(), (4, 4, 2));
    assert_eq!(drain(&mut rx).len(), 2);
}

#[tokio::test]
async fn test_manager_stop_aborts_replays() {
    let manager = ConnectionManager::default();
    let mut recording = Recording::websocket("slow");
    recording.frames.push(RecordedFrame::new(
        1,
        Duration::from_secs(3600),
        Direction::ServerToClient,
        MessageType::Text,
        b"never",
    ));

    let (conn, _rx) = open(&manager);
    let replayer = Replayer::new(&recording, conn, ReplayConfig::default()).unwrap();
    replayer.start().unwrap();

    assert_eq!(manager.stop().await, 1);

    let status = tokio::time::timeout(Duration::from_secs(1), replayer.wait())
        .await
        .unwrap();
    assert_eq!(status, ReplayStatus::Aborted);
    assert_eq!(replayer.progress().2, 0);
}
