//! Wire frames and their codec.
//!
//! Frame format: `[length:4][sequence:8][json:N][crc32:4]`, little endian.
//! Sequence numbers start at 1 in each direction and must be consecutive.
//! Any deviation (bad length, checksum, sequence or JSON) is a corrupt frame.

use std::io::{ErrorKind, Read, Write};

use agr_types::{AgentAddress, KernelId, Message, OrgSnapshot};
use serde::{Deserialize, Serialize};

use crate::error::{NetError, NetResult};

/// Largest accepted JSON body.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;
/// length(4) + sequence(8)
const HEADER_LEN: usize = 12;
/// header + crc32(4)
const FRAME_OVERHEAD: usize = HEADER_LEN + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeltaKind {
    Join,
    Leave,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Control {
    Shutdown,
}

/// One unit of the link protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Frame {
    Handshake { kernel: KernelId },
    Snapshot { snapshot: OrgSnapshot },
    Delta { delta: DeltaKind, address: AgentAddress },
    Message { message: Message },
    Control { control: Control },
}

impl Frame {
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Handshake { .. } => "handshake",
            Frame::Snapshot { .. } => "snapshot",
            Frame::Delta { .. } => "delta",
            Frame::Message { .. } => "message",
            Frame::Control { .. } => "control",
        }
    }
}

/// Encode one frame with the given sequence number.
pub fn encode(sequence: u64, frame: &Frame) -> NetResult<Vec<u8>> {
    let body = serde_json::to_vec(frame)?;
    if body.len() > MAX_FRAME_LEN {
        return Err(NetError::Serialization(format!(
            "{} frame of {} bytes exceeds limit",
            frame.kind(),
            body.len()
        )));
    }
    let crc = crc32fast::hash(&body);
    let length = body.len() as u32;

    let mut entry = Vec::with_capacity(FRAME_OVERHEAD + body.len());
    entry.extend_from_slice(&length.to_le_bytes());
    entry.extend_from_slice(&sequence.to_le_bytes());
    entry.extend_from_slice(&body);
    entry.extend_from_slice(&crc.to_le_bytes());
    Ok(entry)
}

/// Writes frames with consecutive sequence numbers.
pub struct FrameWriter<W: Write> {
    inner: W,
    next_sequence: u64,
}

impl<W: Write> FrameWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            next_sequence: 1,
        }
    }

    /// Write and flush one frame. Returns its sequence number.
    pub fn write_frame(&mut self, frame: &Frame) -> NetResult<u64> {
        let sequence = self.next_sequence;
        let entry = encode(sequence, frame)?;
        self.inner.write_all(&entry)?;
        self.inner.flush()?;
        self.next_sequence += 1;
        Ok(sequence)
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }
}

/// Reads frames, checking length, sequence and checksum.
pub struct FrameReader<R: Read> {
    inner: R,
    expected_sequence: u64,
}

impl<R: Read> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            expected_sequence: 1,
        }
    }

    /// Fill `buf`, returning false on EOF before the first byte.
    fn fill(&mut self, buf: &mut [u8]) -> NetResult<bool> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.inner.read(&mut buf[filled..]) {
                Ok(0) if filled == 0 => return Ok(false),
                Ok(0) => {
                    return Err(NetError::CorruptFrame(format!(
                        "stream ended after {} of {} bytes",
                        filled,
                        buf.len()
                    )))
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(true)
    }

    /// Read the next frame. `Ok(None)` on a clean end of stream.
    pub fn read_frame(&mut self) -> NetResult<Option<Frame>> {
        let mut header = [0u8; HEADER_LEN];
        if !self.fill(&mut header)? {
            return Ok(None);
        }
        let mut length_bytes = [0u8; 4];
        length_bytes.copy_from_slice(&header[..4]);
        let mut sequence_bytes = [0u8; 8];
        sequence_bytes.copy_from_slice(&header[4..]);
        let length = u32::from_le_bytes(length_bytes) as usize;
        let sequence = u64::from_le_bytes(sequence_bytes);

        if length == 0 || length > MAX_FRAME_LEN {
            return Err(NetError::CorruptFrame(format!("bad length {}", length)));
        }
        if sequence != self.expected_sequence {
            return Err(NetError::CorruptFrame(format!(
                "sequence {} where {} was expected",
                sequence, self.expected_sequence
            )));
        }

        let mut body = vec![0u8; length];
        let mut crc_bytes = [0u8; 4];
        if !self.fill(&mut body)? || !self.fill(&mut crc_bytes)? {
            return Err(NetError::CorruptFrame("truncated frame".into()));
        }
        let stored = u32::from_le_bytes(crc_bytes);
        let computed = crc32fast::hash(&body);
        if stored != computed {
            return Err(NetError::CorruptFrame(format!(
                "checksum mismatch at sequence {} (stored {:08x}, computed {:08x})",
                sequence, stored, computed
            )));
        }

        let frame = serde_json::from_slice(&body)
            .map_err(|e| NetError::CorruptFrame(format!("undecodable body: {}", e)))?;
        self.expected_sequence += 1;
        Ok(Some(frame))
    }
}
