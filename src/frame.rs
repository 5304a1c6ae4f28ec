//! Typed frame wire format written to the store's append-only byte log.
//!
//! Every frame is a 9-byte header followed by its payload:
//! `type:u8 | responseId:u32 BE | payloadLength:u32 BE | payload`.
//! A response emits exactly one `Start`, zero or more `Data`, and exactly
//! one terminal (`Complete` | `Abort` | `Error`).

use bytes::{BufMut, Bytes, BytesMut};

pub const HEADER_LEN: usize = 9;

const TYPE_START: u8 = 0x53; // 'S'
const TYPE_DATA: u8 = 0x44; // 'D'
const TYPE_COMPLETE: u8 = 0x43; // 'C'
const TYPE_ABORT: u8 = 0x41; // 'A'
const TYPE_ERROR: u8 = 0x45; // 'E'

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameType {
    Start,
    Data,
    Complete,
    Abort,
    Error,
}

impl FrameType {
    fn byte(&self) -> u8 {
        match self {
            FrameType::Start => TYPE_START,
            FrameType::Data => TYPE_DATA,
            FrameType::Complete => TYPE_COMPLETE,
            FrameType::Abort => TYPE_ABORT,
            FrameType::Error => TYPE_ERROR,
        }
    }

    fn from_byte(b: u8) -> Option<FrameType> {
        match b {
            TYPE_START => Some(FrameType::Start),
            TYPE_DATA => Some(FrameType::Data),
            TYPE_COMPLETE => Some(FrameType::Complete),
            TYPE_ABORT => Some(FrameType::Abort),
            TYPE_ERROR => Some(FrameType::Error),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, FrameType::Complete | FrameType::Abort | FrameType::Error)
    }
}

#[derive(Debug, Clone)]
pub struct Frame {
    pub frame_type: FrameType,
    pub response_id: u32,
    pub payload: Bytes,
}

impl Frame {
    pub fn start(response_id: u32, status: u16, headers: &[(String, String)]) -> Frame {
        let body = serde_json::json!({
            "status": status,
            "headers": headers.iter().map(|(k, v)| (k.to_lowercase(), v.clone())).collect::<std::collections::HashMap<_, _>>(),
        });
        Frame {
            frame_type: FrameType::Start,
            response_id,
            payload: Bytes::from(serde_json::to_vec(&body).expect("json encode never fails here")),
        }
    }

    pub fn data(response_id: u32, bytes: Bytes) -> Frame {
        Frame {
            frame_type: FrameType::Data,
            response_id,
            payload: bytes,
        }
    }

    pub fn complete(response_id: u32) -> Frame {
        Frame {
            frame_type: FrameType::Complete,
            response_id,
            payload: Bytes::new(),
        }
    }

    pub fn abort(response_id: u32) -> Frame {
        Frame {
            frame_type: FrameType::Abort,
            response_id,
            payload: Bytes::new(),
        }
    }

    pub fn error(response_id: u32, code: &str, message: &str) -> Frame {
        let body = serde_json::json!({ "code": code, "message": message });
        Frame {
            frame_type: FrameType::Error,
            response_id,
            payload: Bytes::from(serde_json::to_vec(&body).expect("json encode never fails here")),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_LEN + self.payload.len());
        buf.put_u8(self.frame_type.byte());
        buf.put_u32(self.response_id);
        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}

/// Decode frames from a byte buffer, returning the decoded frames and the
/// number of leading bytes consumed. A trailing partial frame (fewer than
/// `HEADER_LEN + payloadLength` bytes available) is left undecoded — the
/// caller re-reads it once more bytes arrive.
pub fn decode_all(buf: &[u8]) -> (Vec<Frame>, usize) {
    let mut frames = Vec::new();
    let mut offset = 0;
    loop {
        match decode_one(&buf[offset..]) {
            Some((frame, consumed)) => {
                frames.push(frame);
                offset += consumed;
            }
            None => break,
        }
    }
    (frames, offset)
}

/// Decode a single frame from the front of `buf`. Returns `None` if `buf`
/// does not yet contain a complete frame.
pub fn decode_one(buf: &[u8]) -> Option<(Frame, usize)> {
    if buf.len() < HEADER_LEN {
        return None;
    }
    let frame_type = FrameType::from_byte(buf[0])?;
    let response_id = u32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
    let payload_len = u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]]) as usize;
    let total = HEADER_LEN + payload_len;
    if buf.len() < total {
        return None;
    }
    let payload = Bytes::copy_from_slice(&buf[HEADER_LEN..total]);
    Some((
        Frame {
            frame_type,
            response_id,
            payload,
        },
        total,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_round_trip() {
        let frame = Frame::data(7, Bytes::from_static(b"hello world"));
        let encoded = frame.encode();
        let (decoded, consumed) = decode_one(&encoded).unwrap();
        assert_eq!(consumed, encoded.len());
        assert_eq!(decoded.frame_type, FrameType::Data);
        assert_eq!(decoded.response_id, 7);
        assert_eq!(decoded.payload, Bytes::from_static(b"hello world"));
    }

    #[test]
    fn test_decode_all_multiple_frames() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&Frame::start(1, 200, &[]).encode());
        buf.extend_from_slice(&Frame::data(1, Bytes::from_static(b"abc")).encode());
        buf.extend_from_slice(&Frame::complete(1).encode());

        let (frames, consumed) = decode_all(&buf);
        assert_eq!(consumed, buf.len());
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].frame_type, FrameType::Start);
        assert_eq!(frames[1].frame_type, FrameType::Data);
        assert_eq!(frames[2].frame_type, FrameType::Complete);
        assert!(frames[2].frame_type.is_terminal());
    }

    #[test]
    fn test_decode_leaves_partial_trailing_frame() {
        let full = Frame::data(3, Bytes::from_static(b"0123456789")).encode();
        let truncated = &full[..full.len() - 2];
        let (frames, consumed) = decode_all(truncated);
        assert!(frames.is_empty());
        assert_eq!(consumed, 0);
    }

    #[test]
    fn test_unknown_type_byte_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u8(0xFF);
        buf.put_u32(0);
        buf.put_u32(0);
        assert!(decode_one(&buf).is_none());
    }

    #[test]
    fn test_error_frame_payload_shape() {
        let frame = Frame::error(2, "INACTIVITY_TIMEOUT", "no bytes for 600s");
        let v: serde_json::Value = serde_json::from_slice(&frame.payload).unwrap();
        assert_eq!(v["code"], "INACTIVITY_TIMEOUT");
        assert_eq!(v["message"], "no bytes for 600s");
    }
}
