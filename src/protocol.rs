//! Wire format of the control channel.
//!
//! Every frame is a 4-byte big-endian length followed by a UTF-8 JSON document:
//!
//! ```text
//! [u32 BE: len][JSON bytes of len]
//! ```
//!
//! Either side of a session may send `Call` (expects a `Reply` with the same
//! id) or `Notify` (fire-and-forget).

use std::io::{self, Read, Write};

use serde::{Deserialize, Serialize};

use crate::action::{Action, Delivery, ExecMode};
use crate::error::{CoordError, Result};
use crate::types::WindowHandle;

pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Call {
    /// Client -> server: register this session as a callback target.
    Subscribe { pid: u32 },
    PushInstance { handle: WindowHandle },
    DeleteInstance { handle: WindowHandle },
    IsMainProcess,
    GetTotalInstanceCount,
    /// Reply is `Flag { value: true }` when the caller should run it itself.
    ExecuteOnMainProcess { action: Action, mode: ExecMode },
    Broadcast { action: Action },
    /// Server -> client: run a previously routed action.
    Execute { action: Action, delivery: Delivery },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Reply {
    Ack,
    Flag { value: bool },
    Count { value: usize },
    Failed { message: String },
}

impl Reply {
    pub fn failed(message: impl ToString) -> Reply {
        Reply::Failed { message: message.to_string() }
    }

    pub fn into_ack(self) -> Result<()> {
        match self {
            Reply::Ack => Ok(()),
            other => Err(other.unexpected()),
        }
    }

    pub fn into_flag(self) -> Result<bool> {
        match self {
            Reply::Flag { value } => Ok(value),
            other => Err(other.unexpected()),
        }
    }

    pub fn into_count(self) -> Result<usize> {
        match self {
            Reply::Count { value } => Ok(value),
            other => Err(other.unexpected()),
        }
    }

    fn unexpected(self) -> CoordError {
        match self {
            Reply::Failed { message } => CoordError::Rejected(message),
            other => CoordError::UnexpectedReply(format!("{other:?}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    Call { id: u64, call: Call },
    Notify { call: Call },
    Reply { id: u64, reply: Reply },
}

/// Write one frame. The length prefix and payload go out in a single write so
/// a frame is never interleaved with another writer's bytes at this level.
pub fn write_frame<W: Write>(writer: &mut W, frame: &Frame) -> Result<()> {
    let payload = serde_json::to_vec(frame)?;
    if payload.len() > MAX_FRAME_BYTES {
        return Err(CoordError::FrameTooLarge {
            size: payload.len(),
            limit: MAX_FRAME_BYTES,
        });
    }
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    buf.extend_from_slice(&payload);
    writer.write_all(&buf)?;
    writer.flush()?;
    Ok(())
}

/// Read one frame. `Ok(None)` on clean EOF (peer closed the session).
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Option<Frame>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_BYTES {
        return Err(CoordError::FrameTooLarge { size: len, limit: MAX_FRAME_BYTES });
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(Some(serde_json::from_slice(&payload)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn frame_read_write_roundtrip() {
        let frame = Frame::Call {
            id: 7,
            call: Call::ExecuteOnMainProcess {
                action: Action::OpenTab { path: "D:\\src".into(), activate: false },
                mode: ExecMode::Sync,
            },
        };
        let mut buf = Vec::new();
        write_frame(&mut buf, &frame).unwrap();
        write_frame(&mut buf, &Frame::Reply { id: 7, reply: Reply::Flag { value: true } }).unwrap();

        let mut cursor = Cursor::new(buf);
        assert_eq!(read_frame(&mut cursor).unwrap(), Some(frame));
        assert_eq!(
            read_frame(&mut cursor).unwrap(),
            Some(Frame::Reply { id: 7, reply: Reply::Flag { value: true } })
        );
        assert_eq!(read_frame(&mut cursor).unwrap(), None);
    }

    #[test]
    fn oversized_header_is_rejected() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&((MAX_FRAME_BYTES + 1) as u32).to_be_bytes());
        buf.extend_from_slice(&[0u8; 8]);
        let err = read_frame(&mut Cursor::new(buf)).unwrap_err();
        assert!(matches!(err, CoordError::FrameTooLarge { .. }));
    }

    #[test]
    fn truncated_payload_is_an_error_not_eof() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&10u32.to_be_bytes());
        buf.extend_from_slice(b"{\"ty");
        assert!(read_frame(&mut Cursor::new(buf)).is_err());
    }

    #[test]
    fn wire_shape_is_stable() {
        let frame = Frame::Notify { call: Call::PushInstance { handle: WindowHandle(0x1a2b) } };
        let json = serde_json::to_string(&frame).unwrap();
        assert_eq!(json, r#"{"type":"notify","call":{"op":"push_instance","handle":6699}}"#);
    }

    #[test]
    fn failed_reply_maps_to_rejected() {
        let err = Reply::failed("not subscribed").into_ack().unwrap_err();
        assert!(matches!(err, CoordError::Rejected(m) if m == "not subscribed"));
        assert!(matches!(Reply::Ack.into_count(), Err(CoordError::UnexpectedReply(_))));
        assert_eq!(Reply::Count { value: 3 }.into_count().unwrap(), 3);
    }
}
