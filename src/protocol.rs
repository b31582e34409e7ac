//! Binary framing codec for the relay wire protocol.
//!
//! Every frame is a sequence of unsigned LEB128 varints and length-prefixed
//! byte strings:
//!
//! ```text
//! ┌───────────────┬──────────────────────────────────────────────┐
//! │ kind (varint) │ body (kind-specific varints / payloads)      │
//! └───────────────┴──────────────────────────────────────────────┘
//!
//! Sync (0)                    conf  room  payload
//! Awareness (1)               conf  count  {room offset rsid}*  state
//! Confirmation (2)            conf
//! SubConf (3)                 reserved
//! HostUnconfirmedByClient (4) clientConf  offset
//! ConfirmedByHost (5)         offset
//! ```
//!
//! A payload is a varint length followed by that many raw bytes; a string is
//! a payload holding UTF-8. Several messages may be concatenated in one
//! websocket frame; callers decode in a loop until the buffer is empty.

use std::fmt;

/// Maximum size of a single websocket frame accepted from a peer.
pub const MAX_FRAME_SIZE: usize = 10_000_000;

/// Name of a collaborative room. Opaque to the relay; doubles as the log
/// file name inside the storage directory, so callers must keep path
/// separators out of it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoomName(String);

impl RoomName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RoomName {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<String> for RoomName {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl fmt::Display for RoomName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Wire-level message kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    /// Opaque update chunk, bidirectional.
    Sync = 0,
    /// Subscription request / subscription echo.
    Awareness = 1,
    /// Receipt + durability acknowledgement, either direction.
    Confirmation = 2,
    /// Reserved, never emitted.
    SubConf = 3,
    /// Server re-surfaces an accepted but not yet durable client update.
    HostUnconfirmedByClient = 4,
    /// Server announces a room's durable offset.
    ConfirmedByHost = 5,
}

impl MessageKind {
    fn from_u64(kind: u64) -> Option<Self> {
        match kind {
            0 => Some(Self::Sync),
            1 => Some(Self::Awareness),
            2 => Some(Self::Confirmation),
            3 => Some(Self::SubConf),
            4 => Some(Self::HostUnconfirmedByClient),
            5 => Some(Self::ConfirmedByHost),
            _ => None,
        }
    }
}

/// Decoding errors. All of them are local to a single frame: the dispatcher
/// logs, drops the rest of the frame and keeps the connection open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A varint or payload ran past the end of the buffer.
    UnexpectedEof,
    /// A varint encodes more than 64 bits.
    VarintOverflow,
    /// A declared payload length exceeds the remaining bytes.
    PayloadOverrun { len: u64, remaining: usize },
    /// A string payload is not valid UTF-8.
    InvalidUtf8,
    /// Unrecognized or reserved message kind.
    UnknownKind(u64),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnexpectedEof => write!(f, "frame ended inside a field"),
            Self::VarintOverflow => write!(f, "varint exceeds 64 bits"),
            Self::PayloadOverrun { len, remaining } => {
                write!(f, "payload length {len} exceeds {remaining} remaining bytes")
            }
            Self::InvalidUtf8 => write!(f, "string field is not valid UTF-8"),
            Self::UnknownKind(kind) => write!(f, "unknown message kind {kind}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Cursor over a received frame.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.pos == self.buf.len()
    }

    /// Read an unsigned LEB128 varint.
    pub fn read_uvar(&mut self) -> Result<u64, ProtocolError> {
        let mut value = 0u64;
        let mut shift = 0u32;
        loop {
            if shift >= 64 {
                return Err(ProtocolError::VarintOverflow);
            }
            let byte = *self.buf.get(self.pos).ok_or(ProtocolError::UnexpectedEof)?;
            self.pos += 1;
            let bits = u64::from(byte & 0x7f);
            if shift == 63 && bits > 1 {
                return Err(ProtocolError::VarintOverflow);
            }
            value |= bits << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    /// Read a length-prefixed byte string, borrowing from the frame.
    pub fn read_payload(&mut self) -> Result<&'a [u8], ProtocolError> {
        let len = self.read_uvar()?;
        let remaining = self.remaining();
        if len > remaining as u64 {
            return Err(ProtocolError::PayloadOverrun { len, remaining });
        }
        let start = self.pos;
        self.pos += len as usize;
        Ok(&self.buf[start..self.pos])
    }

    /// Read a length-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> Result<String, ProtocolError> {
        let bytes = self.read_payload()?;
        String::from_utf8(bytes.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)
    }
}

/// Append an unsigned LEB128 varint.
pub fn write_uvar(buf: &mut Vec<u8>, mut n: u64) {
    loop {
        let byte = (n & 0x7f) as u8;
        n >>= 7;
        if n == 0 {
            buf.push(byte);
            return;
        }
        buf.push(byte | 0x80);
    }
}

/// Append a length-prefixed byte string.
pub fn write_payload(buf: &mut Vec<u8>, payload: &[u8]) {
    write_uvar(buf, payload.len() as u64);
    buf.extend_from_slice(payload);
}

/// Append a length-prefixed UTF-8 string.
pub fn write_string(buf: &mut Vec<u8>, s: &str) {
    write_payload(buf, s.as_bytes());
}

/// One room a subscriber wants to resume, with its resume offset and the
/// client's room-scoped session identifier.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubEntry {
    pub room: RoomName,
    pub offset: u64,
    pub room_session_id: u64,
}

/// A decoded wire message.
///
/// `SubConf` is reserved and intentionally absent: decoding it yields
/// [`ProtocolError::UnknownKind`], same as any unassigned kind.
#[derive(Clone, Debug, PartialEq)]
pub enum Message {
    Sync {
        /// Client→server: the client's confirmation number for this update.
        /// Server→client: the room's offset after applying the update.
        confirmation: u64,
        room: RoomName,
        payload: Vec<u8>,
    },
    Awareness {
        confirmation: u64,
        subs: Vec<SubEntry>,
        /// Opaque client-state JSON. Clients with no state send `""`; the
        /// server echo carries the received state back verbatim.
        client_state: String,
    },
    Confirmation {
        confirmation: u64,
    },
    HostUnconfirmedByClient {
        client_confirmation: u64,
        offset: u64,
    },
    ConfirmedByHost {
        offset: u64,
    },
}

impl Message {
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::Sync { .. } => MessageKind::Sync,
            Self::Awareness { .. } => MessageKind::Awareness,
            Self::Confirmation { .. } => MessageKind::Confirmation,
            Self::HostUnconfirmedByClient { .. } => MessageKind::HostUnconfirmedByClient,
            Self::ConfirmedByHost { .. } => MessageKind::ConfirmedByHost,
        }
    }

    /// Serialize to wire bytes.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(16);
        write_uvar(&mut buf, self.kind() as u64);
        match self {
            Self::Sync {
                confirmation,
                room,
                payload,
            } => {
                write_uvar(&mut buf, *confirmation);
                write_string(&mut buf, room.as_str());
                write_payload(&mut buf, payload);
            }
            Self::Awareness {
                confirmation,
                subs,
                client_state,
            } => {
                write_uvar(&mut buf, *confirmation);
                write_uvar(&mut buf, subs.len() as u64);
                for sub in subs {
                    write_string(&mut buf, sub.room.as_str());
                    write_uvar(&mut buf, sub.offset);
                    write_uvar(&mut buf, sub.room_session_id);
                }
                write_string(&mut buf, client_state);
            }
            Self::Confirmation { confirmation } => {
                write_uvar(&mut buf, *confirmation);
            }
            Self::HostUnconfirmedByClient {
                client_confirmation,
                offset,
            } => {
                write_uvar(&mut buf, *client_confirmation);
                write_uvar(&mut buf, *offset);
            }
            Self::ConfirmedByHost { offset } => {
                write_uvar(&mut buf, *offset);
            }
        }
        buf
    }

    /// Decode one message, leaving the reader positioned at the next one.
    pub fn decode(r: &mut Reader<'_>) -> Result<Self, ProtocolError> {
        let kind = r.read_uvar()?;
        match MessageKind::from_u64(kind) {
            Some(MessageKind::Sync) => {
                let confirmation = r.read_uvar()?;
                let room = RoomName::new(r.read_string()?);
                let payload = r.read_payload()?.to_vec();
                Ok(Self::Sync {
                    confirmation,
                    room,
                    payload,
                })
            }
            Some(MessageKind::Awareness) => {
                let confirmation = r.read_uvar()?;
                let count = r.read_uvar()?;
                // Each entry is at least three bytes; anything larger than
                // the remaining buffer is a framing error, not an allocation
                // request.
                if count > (r.remaining() / 3) as u64 {
                    return Err(ProtocolError::PayloadOverrun {
                        len: count,
                        remaining: r.remaining(),
                    });
                }
                let mut subs = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let room = RoomName::new(r.read_string()?);
                    let offset = r.read_uvar()?;
                    let room_session_id = r.read_uvar()?;
                    subs.push(SubEntry {
                        room,
                        offset,
                        room_session_id,
                    });
                }
                let client_state = r.read_string()?;
                Ok(Self::Awareness {
                    confirmation,
                    subs,
                    client_state,
                })
            }
            Some(MessageKind::Confirmation) => Ok(Self::Confirmation {
                confirmation: r.read_uvar()?,
            }),
            Some(MessageKind::HostUnconfirmedByClient) => Ok(Self::HostUnconfirmedByClient {
                client_confirmation: r.read_uvar()?,
                offset: r.read_uvar()?,
            }),
            Some(MessageKind::ConfirmedByHost) => Ok(Self::ConfirmedByHost {
                offset: r.read_uvar()?,
            }),
            Some(MessageKind::SubConf) | None => Err(ProtocolError::UnknownKind(kind)),
        }
    }
}
