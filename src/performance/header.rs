//! Frame header wire format.
//!
//! Every forwarded frame is laid out as
//!
//! ```text
//! +----------------+----------------------+------------------+
//! | u32 BE length  | JSON header (length) | raw frame bytes  |
//! +----------------+----------------------+------------------+
//! ```
//!
//! A downstream observer correlates its own timings with these fields, so
//! fields may only ever be added (as optional) and never renamed or removed.

use crate::error::{PagecastError, Result};
use serde::{Deserialize, Serialize};

/// Size of the big-endian length prefix
pub const LENGTH_PREFIX_SIZE: usize = 4;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameHeader {
    pub frame_id: u64,
    pub capture_ms: f64,
    pub compare_ms: f64,
    /// Send duration of the previous frame on this session
    pub ws_send_ms: f64,
    pub frame_bytes: usize,
}

/// Serialize the length-prefixed header record
pub fn build_frame_header(header: &FrameHeader) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(header)?;
    let length = u32::try_from(payload.len())
        .map_err(|_| PagecastError::system("frame header exceeds u32 length"))?;

    let mut buf = Vec::with_capacity(LENGTH_PREFIX_SIZE + payload.len());
    buf.extend_from_slice(&length.to_be_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Header followed immediately by the compressed frame
pub fn encode_frame(header: &FrameHeader, frame: &[u8]) -> Result<Vec<u8>> {
    let mut buf = build_frame_header(header)?;
    buf.reserve(frame.len());
    buf.extend_from_slice(frame);
    Ok(buf)
}

/// Split a wire message into its header and frame bytes
pub fn parse_frame_header(buf: &[u8]) -> Result<(FrameHeader, &[u8])> {
    if buf.len() < LENGTH_PREFIX_SIZE {
        return Err(PagecastError::system("frame message shorter than length prefix"));
    }
    let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
    prefix.copy_from_slice(&buf[..LENGTH_PREFIX_SIZE]);
    let length = u32::from_be_bytes(prefix) as usize;

    let end = LENGTH_PREFIX_SIZE + length;
    if buf.len() < end {
        return Err(PagecastError::system(format!(
            "frame header declares {} bytes but only {} remain",
            length,
            buf.len() - LENGTH_PREFIX_SIZE
        )));
    }

    let header = serde_json::from_slice(&buf[LENGTH_PREFIX_SIZE..end])?;
    Ok((header, &buf[end..]))
}
