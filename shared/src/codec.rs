//! Frame codec: byte stuffing, delimiter framing and snapshot compression.

use bytes::{Buf, Bytes, BytesMut};
use flate2::write::ZlibEncoder;
use flate2::{Compression, Decompress, FlushDecompress, Status as InflateStatus};
use std::io::Write;

use crate::{ProtocolError, RelatedPositions, BUFFER_SIZE, DELIMITER, ESCAPE, ESCAPE_MASK};

/// Appends `payload` to `out`, replacing every delimiter and escape byte with
/// a two byte escape sequence so the result never contains [`DELIMITER`]
pub fn stuff_into(payload: &[u8], out: &mut Vec<u8>) {
    out.reserve(payload.len());
    for &byte in payload {
        if byte == DELIMITER || byte == ESCAPE {
            out.push(ESCAPE);
            out.push(byte ^ ESCAPE_MASK);
        } else {
            out.push(byte);
        }
    }
}

/// Reverses [`stuff_into`]
pub fn unstuff(data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let mut payload = Vec::with_capacity(data.len());
    let mut bytes = data.iter().copied().enumerate();

    while let Some((index, byte)) = bytes.next() {
        if byte != ESCAPE {
            payload.push(byte);
            continue;
        }

        match bytes.next() {
            Some((_, escaped)) if escaped ^ ESCAPE_MASK == DELIMITER => payload.push(DELIMITER),
            Some((_, escaped)) if escaped ^ ESCAPE_MASK == ESCAPE => payload.push(ESCAPE),
            _ => return Err(ProtocolError::InvalidEscape(index)),
        }
    }

    Ok(payload)
}

/// Accumulates raw socket bytes and splits them into delimited frames.
///
/// Partial frames stay buffered across reads. A frame that reaches the size
/// limit, with or without its delimiter, is a protocol violation.
#[derive(Debug)]
pub struct FrameDecoder {
    buffer: BytesMut,
    max_frame_len: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::with_limit(BUFFER_SIZE)
    }

    pub fn with_limit(max_frame_len: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(max_frame_len),
            max_frame_len,
        }
    }

    pub fn extend_from_slice(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Returns the next complete frame without its delimiter, or `None` when
    /// more bytes are needed
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, ProtocolError> {
        match self.buffer.iter().position(|&b| b == DELIMITER) {
            Some(end) if end >= self.max_frame_len => Err(ProtocolError::FrameTooLarge {
                len: end,
                limit: self.max_frame_len,
            }),
            Some(end) => {
                let mut frame = self.buffer.split_to(end + 1);
                frame.truncate(end);
                Ok(Some(frame.freeze()))
            }
            None if self.buffer.len() >= self.max_frame_len => Err(ProtocolError::FrameTooLarge {
                len: self.buffer.len(),
                limit: self.max_frame_len,
            }),
            None => Ok(None),
        }
    }

    /// Bytes of an incomplete frame still waiting for their delimiter
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Compresses data as a single zlib stream
pub fn compress(data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| ProtocolError::Compression(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| ProtocolError::Compression(e.to_string()))
}

/// Serializes, stuffs, delimits and compresses one snapshot
pub fn encode_snapshot(snapshot: &RelatedPositions) -> Result<Vec<u8>, ProtocolError> {
    let payload = bincode::serialize(snapshot)?;

    let mut frame = Vec::with_capacity(payload.len() + 1);
    stuff_into(&payload, &mut frame);
    frame.push(DELIMITER);

    compress(&frame)
}

/// Decodes an inflated snapshot frame, delimiter included
pub fn decode_snapshot_frame(frame: &[u8]) -> Result<RelatedPositions, ProtocolError> {
    let stuffed = match frame.split_last() {
        Some((&DELIMITER, stuffed)) => stuffed,
        _ => return Err(ProtocolError::MissingDelimiter),
    };

    Ok(bincode::deserialize(&unstuff(stuffed)?)?)
}

/// Incremental decoder for a byte stream of back to back zlib snapshots.
///
/// Bytes may be pushed in arbitrary chunks; each completed zlib stream yields
/// one snapshot and the inflater is reset for the next one.
pub struct SnapshotStream {
    inflater: Decompress,
    pending: BytesMut,
    output: Vec<u8>,
}

impl SnapshotStream {
    pub fn new() -> Self {
        Self {
            inflater: Decompress::new(true),
            pending: BytesMut::with_capacity(BUFFER_SIZE),
            output: Vec::with_capacity(BUFFER_SIZE),
        }
    }

    pub fn push(&mut self, data: &[u8]) {
        self.pending.extend_from_slice(data);
    }

    pub fn next_snapshot(&mut self) -> Result<Option<RelatedPositions>, ProtocolError> {
        loop {
            if self.output.capacity() - self.output.len() < BUFFER_SIZE {
                self.output.reserve(BUFFER_SIZE);
            }

            let in_before = self.inflater.total_in();
            let out_before = self.inflater.total_out();

            let status = self
                .inflater
                .decompress_vec(&self.pending, &mut self.output, FlushDecompress::None)
                .map_err(|e| ProtocolError::Decompression(e.to_string()))?;

            let consumed = (self.inflater.total_in() - in_before) as usize;
            let produced = self.inflater.total_out() - out_before;
            self.pending.advance(consumed);

            match status {
                InflateStatus::StreamEnd => {
                    self.inflater.reset(true);
                    let frame = std::mem::take(&mut self.output);
                    return decode_snapshot_frame(&frame).map(Some);
                }
                InflateStatus::Ok | InflateStatus::BufError => {
                    if consumed == 0 && produced == 0 {
                        return Ok(None);
                    }
                }
            }
        }
    }
}

impl Default for SnapshotStream {
    fn default() -> Self {
        Self::new()
    }
}
