//! Data-plane framing for fabric channels.
//!
//! Every frame is a fixed header (magic:4 + version:1 + payload_length:4,
//! little-endian) followed by a bincode-encoded [`FabricFrame`]. The decoder
//! is incremental: feed it raw socket bytes and drain complete frames.

use bytes::BytesMut;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TransportError};

/// Frame header size in bytes (magic:4 + version:1 + payload_length:4).
pub const FRAME_HEADER_SIZE: usize = 9;

/// Magic number identifying a fabric channel frame.
pub const FRAME_MAGIC: u32 = 0x4D46_0001;

/// Fabric channel protocol version.
pub const FRAME_VERSION: u8 = 1;

/// Messages exchanged on a data-plane channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FabricFrame {
    /// First frame on an inbound channel; proves the sender holds the
    /// worker's exported address blob.
    Hello {
        /// Cookie copied from the exported address blob.
        cookie: u64,
    },
    /// Two-sided tagged message.
    Tagged {
        /// Sender-chosen tag the receiver matches on.
        tag: u64,
        /// Message payload.
        data: Vec<u8>,
    },
    /// One-sided write into a remote registered region.
    Put {
        /// Remote access key naming the target region.
        key: u64,
        /// Absolute remote address of the first byte written.
        raddr: u64,
        /// Bytes to write.
        data: Vec<u8>,
    },
    /// One-sided read from a remote registered region.
    Get {
        /// Remote access key naming the source region.
        key: u64,
        /// Absolute remote address of the first byte read.
        raddr: u64,
        /// Number of bytes to read.
        len: u64,
        /// Originator-assigned operation id echoed in the reply.
        op: u64,
    },
    /// Successful reply to a [`FabricFrame::Get`].
    GetReply {
        /// Operation id from the originating get.
        op: u64,
        /// Bytes read from the region.
        data: Vec<u8>,
    },
    /// Failed reply to a [`FabricFrame::Get`].
    GetFault {
        /// Operation id from the originating get.
        op: u64,
        /// Human-readable fault description, logged by the originator.
        reason: String,
    },
    /// Remote-visibility fence for prior one-sided operations.
    Flush {
        /// Originator-assigned operation id echoed in the ack.
        op: u64,
    },
    /// Reply to a [`FabricFrame::Flush`]; all prior one-sided operations on
    /// the channel have been applied.
    FlushAck {
        /// Operation id from the originating flush.
        op: u64,
    },
}

/// Encodes a frame as header plus bincode payload.
pub fn encode_frame(frame: &FabricFrame, max_payload: u32) -> Result<Vec<u8>> {
    let payload =
        bincode::serialize(frame).map_err(|e| TransportError::SerializationError(e.to_string()))?;
    if payload.len() > max_payload as usize {
        return Err(TransportError::PayloadTooLarge {
            size: u32::try_from(payload.len()).unwrap_or(u32::MAX),
            max_size: max_payload,
        });
    }
    let mut out = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    out.extend_from_slice(&FRAME_MAGIC.to_le_bytes());
    out.push(FRAME_VERSION);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Incremental frame decoder over a byte-stream channel.
#[derive(Debug)]
pub struct FrameDecoder {
    buf: BytesMut,
    max_payload: u32,
}

impl FrameDecoder {
    /// Creates a decoder enforcing the given payload cap.
    pub fn new(max_payload: u32) -> Self {
        Self {
            buf: BytesMut::new(),
            max_payload,
        }
    }

    /// Appends raw bytes read from the channel.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes currently buffered but not yet decoded.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Drains one complete frame, or returns `None` if more bytes are
    /// needed. A decode error poisons the channel; the caller closes it.
    pub fn next_frame(&mut self) -> Result<Option<FabricFrame>> {
        if self.buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        let mut word = [0u8; 4];
        word.copy_from_slice(&self.buf[0..4]);
        let magic = u32::from_le_bytes(word);
        if magic != FRAME_MAGIC {
            return Err(TransportError::InvalidMagic {
                expected: FRAME_MAGIC,
                got: magic,
            });
        }

        let version = self.buf[4];
        if version != FRAME_VERSION {
            return Err(TransportError::VersionMismatch {
                expected: FRAME_VERSION,
                got: version,
            });
        }

        word.copy_from_slice(&self.buf[5..9]);
        let payload_len = u32::from_le_bytes(word);
        if payload_len > self.max_payload {
            return Err(TransportError::PayloadTooLarge {
                size: payload_len,
                max_size: self.max_payload,
            });
        }

        let total = FRAME_HEADER_SIZE + payload_len as usize;
        if self.buf.len() < total {
            return Ok(None);
        }

        let raw = self.buf.split_to(total);
        let frame = bincode::deserialize(&raw[FRAME_HEADER_SIZE..])
            .map_err(|e| TransportError::SerializationError(e.to_string()))?;
        Ok(Some(frame))
    }
}
