//! Wire protocol shared by the coin chase server and its clients.
//!
//! Every session uses two TCP connections. Clients stream inbound frames to
//! the worker port they were handed at login, and the server dials back to
//! the client's declared port to push compressed snapshots.
//!
//! An inbound frame is `[type: 1 byte][stuffed payload][b'$']`, where the
//! payload is the bincode encoding of a [`Status`] or an [`Attack`]. An
//! outbound frame is the stuffed bincode encoding of a [`RelatedPositions`]
//! followed by `b'$'`, compressed as one zlib stream.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

mod codec;

pub use codec::{
    compress, decode_snapshot_frame, encode_snapshot, stuff_into, unstuff, FrameDecoder,
    SnapshotStream,
};

/// Size of a single socket read and the upper bound of one inbound frame
pub const BUFFER_SIZE: usize = 4096;
/// Terminates every frame on the wire
pub const DELIMITER: u8 = b'$';
/// Introduces a stuffed byte inside a payload
pub const ESCAPE: u8 = 0x7D;
/// Stuffed bytes are sent as `ESCAPE, byte ^ ESCAPE_MASK`
pub const ESCAPE_MASK: u8 = 0x20;

pub const PACKET_TYPE_STATUS: u8 = 0;
pub const PACKET_TYPE_ATTACK: u8 = 1;

/// Errors raised while framing, decoding or compressing protocol messages
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame of {len} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { len: usize, limit: usize },

    #[error("empty frame")]
    EmptyFrame,

    #[error("unknown packet type: {0}")]
    UnknownPacketType(u8),

    #[error("invalid escape sequence at byte {0}")]
    InvalidEscape(usize),

    #[error("frame is missing its delimiter")]
    MissingDelimiter,

    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("compression error: {0}")]
    Compression(String),

    #[error("decompression error: {0}")]
    Decompression(String),
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Position {
    pub x: i32,
    pub y: i32,
}

impl Position {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }

    /// Number of king moves between two positions
    pub fn chebyshev_distance(&self, other: &Position) -> u32 {
        self.x.abs_diff(other.x).max(self.y.abs_diff(other.y))
    }
}

/// Latest position reported by a client
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Status {
    pub id: String,
    pub current_position: Position,
}

/// Attack issued by a client against a nearby cell
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Attack {
    pub user_id: String,
    pub user_position: Position,
    pub attack_position: Position,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CellKind {
    #[default]
    Ground,
    Coin,
    Item,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct Cell {
    pub occupied: bool,
    pub owner: String,
    pub kind: CellKind,
}

impl Cell {
    /// True when the cell carries nothing worth sending to a client
    pub fn is_empty(&self) -> bool {
        !self.occupied && self.kind == CellKind::Ground
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct RelatedPosition {
    pub cell: Cell,
    pub position: Position,
}

/// Snapshot pushed to one client on every broadcast tick
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct RelatedPositions {
    pub user_position: Position,
    pub related_positions: Vec<RelatedPosition>,
    pub scoreboard: HashMap<String, i32>,
}

/// A decoded inbound frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundMessage {
    Status(Status),
    Attack(Attack),
}

impl InboundMessage {
    pub fn packet_type(&self) -> u8 {
        match self {
            InboundMessage::Status(_) => PACKET_TYPE_STATUS,
            InboundMessage::Attack(_) => PACKET_TYPE_ATTACK,
        }
    }

    /// Id of the user the message was sent on behalf of
    pub fn user_id(&self) -> &str {
        match self {
            InboundMessage::Status(status) => &status.id,
            InboundMessage::Attack(attack) => &attack.user_id,
        }
    }

    /// Encodes a complete frame, delimiter included
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let payload = match self {
            InboundMessage::Status(status) => bincode::serialize(status)?,
            InboundMessage::Attack(attack) => bincode::serialize(attack)?,
        };

        let mut frame = Vec::with_capacity(payload.len() + 2);
        frame.push(self.packet_type());
        stuff_into(&payload, &mut frame);
        frame.push(DELIMITER);
        Ok(frame)
    }

    /// Decodes a frame as returned by [`FrameDecoder::next_frame`],
    /// i.e. with the delimiter already stripped
    pub fn decode(frame: &[u8]) -> Result<Self, ProtocolError> {
        let (&packet_type, stuffed) = frame.split_first().ok_or(ProtocolError::EmptyFrame)?;
        let payload = unstuff(stuffed)?;

        match packet_type {
            PACKET_TYPE_STATUS => Ok(InboundMessage::Status(bincode::deserialize(&payload)?)),
            PACKET_TYPE_ATTACK => Ok(InboundMessage::Attack(bincode::deserialize(&payload)?)),
            other => Err(ProtocolError::UnknownPacketType(other)),
        }
    }
}
