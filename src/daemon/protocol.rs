//! Frame codec shared by the inter-process queues
//!
//! Every work item crossing a process boundary travels as one frame:
//!
//! ```text
//! ┌────────────┬──────────────┬──────────────────────┐
//! │   Length   │   Frame ID   │  Payload (bincode)   │
//! │  (4 bytes) │  (4 bytes)   │  (variable length)   │
//! └────────────┴──────────────┴──────────────────────┘
//! ```
//!
//! The length covers the frame id plus the payload. Queues use the frame id
//! as a sequence number so the consumer can detect a desynchronised stream.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{self, Write};

/// Maximum payload size (10MB to prevent memory exhaustion)
pub const MAX_FRAME_SIZE: u32 = 10 * 1024 * 1024;

/// Size of the length prefix plus the frame id
pub const HEADER_LEN: usize = 8;

/// Frame id type (sequence number for queue frames)
pub type FrameId = u32;

/// Encode a value into the wire format
///
/// Format: [4-byte length][4-byte frame ID][bincode payload]
pub fn encode_frame<T: Serialize>(value: &T, frame_id: FrameId) -> io::Result<Vec<u8>> {
    let payload = bincode::serialize(value)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    let payload_len = payload.len() as u32;
    if payload_len > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Frame too large: {} bytes", payload_len),
        ));
    }

    let mut buffer = Vec::with_capacity(HEADER_LEN + payload.len());
    // Length prefix includes the frame id
    buffer.extend_from_slice(&(payload_len + 4).to_le_bytes());
    buffer.extend_from_slice(&frame_id.to_le_bytes());
    buffer.extend_from_slice(&payload);

    Ok(buffer)
}

/// Check a length prefix read off the wire
fn validate_len(len: u32) -> io::Result<()> {
    if len < 4 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "Frame length too small",
        ));
    }
    if len > MAX_FRAME_SIZE + 4 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Frame too large: {} bytes", len),
        ));
    }
    Ok(())
}

fn decode_payload<T: DeserializeOwned>(payload: &[u8]) -> io::Result<T> {
    bincode::deserialize(payload).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Take one complete frame off the front of `buf`, if there is one
///
/// Used by readers that accumulate bytes across timed-out reads, so a read
/// that stops mid-frame never loses data.
pub fn split_frame<T: DeserializeOwned>(buf: &mut Vec<u8>) -> io::Result<Option<(T, FrameId)>> {
    if buf.len() < HEADER_LEN {
        return Ok(None);
    }

    let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    validate_len(len)?;

    let total = 4 + len as usize;
    if buf.len() < total {
        return Ok(None);
    }

    let frame_id = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
    let value = decode_payload(&buf[HEADER_LEN..total])?;
    buf.drain(..total);

    Ok(Some((value, frame_id)))
}

/// Write one frame to a stream
pub fn write_frame<T: Serialize, W: Write>(
    writer: &mut W,
    value: &T,
    frame_id: FrameId,
) -> io::Result<()> {
    let bytes = encode_frame(value, frame_id)?;
    writer.write_all(&bytes)?;
    writer.flush()?;
    Ok(())
}
