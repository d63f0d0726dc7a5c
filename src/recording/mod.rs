//! Frame recording for WebSocket sessions

mod frame;
mod hook;
mod recorder;

pub use frame::{
    CloseRecord, Direction, MessageType, PayloadEncoding, Protocol, RecordedFrame, Recording,
};
pub use hook::{JsonFileHook, MemoryHook, WebSocketRecordingHook};
pub use recorder::ConnectionRecorder;
