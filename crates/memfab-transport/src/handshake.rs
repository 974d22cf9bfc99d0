//! Out-of-band handshake record codec.
//!
//! The record travels exactly once per rendezvous connection, producer to
//! consumer, framed as length-prefixed blobs followed by two fixed words:
//!
//! ```text
//! [u32 addr_len][addr bytes][u32 rkey_len][rkey bytes][u64 remote_ptr][u64 size]
//! ```
//!
//! All integers are host byte order, matching the established wire format
//! between same-architecture peers. Cross-endian rendezvous is out of scope
//! and this is the one layer where that gap lives; data-plane frames are
//! explicitly little-endian.

use std::io::{self, Read, Write};

use crate::error::{Result, TransportError};

/// Sanity cap on either variable-length blob in a handshake record.
pub const MAX_HANDSHAKE_BLOB: u32 = 64 * 1024;

/// Peer-discovery record exchanged over the rendezvous stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRecord {
    /// Exported worker address blob of the producer.
    pub worker_addr: Vec<u8>,
    /// Packed remote access key; empty for tag-only flows.
    pub rkey: Vec<u8>,
    /// Base address of the advertised remote region; zero when unused.
    pub remote_ptr: u64,
    /// Producer's intended payload size in bytes.
    pub size: u64,
}

impl HandshakeRecord {
    /// Serializes the record onto a stream.
    pub fn write_to<W: Write>(&self, w: &mut W) -> Result<()> {
        check_blob_len(self.worker_addr.len(), "worker address")?;
        check_blob_len(self.rkey.len(), "rkey")?;

        w.write_all(&(self.worker_addr.len() as u32).to_ne_bytes())?;
        w.write_all(&self.worker_addr)?;
        w.write_all(&(self.rkey.len() as u32).to_ne_bytes())?;
        w.write_all(&self.rkey)?;
        w.write_all(&self.remote_ptr.to_ne_bytes())?;
        w.write_all(&self.size.to_ne_bytes())?;
        Ok(())
    }

    /// Decodes one record from a stream, reading exactly the declared
    /// lengths. A short read or an over-cap declared length is a framing
    /// error; the stream is left mid-record and must be discarded.
    pub fn read_from<R: Read>(r: &mut R) -> Result<Self> {
        let addr_len = read_len(r, "worker address length")?;
        let mut worker_addr = vec![0u8; addr_len as usize];
        read_exact_framed(r, &mut worker_addr, "worker address")?;

        let rkey_len = read_len(r, "rkey length")?;
        let mut rkey = vec![0u8; rkey_len as usize];
        read_exact_framed(r, &mut rkey, "rkey")?;

        let mut word = [0u8; 8];
        read_exact_framed(r, &mut word, "remote pointer")?;
        let remote_ptr = u64::from_ne_bytes(word);
        read_exact_framed(r, &mut word, "size")?;
        let size = u64::from_ne_bytes(word);

        Ok(Self {
            worker_addr,
            rkey,
            remote_ptr,
            size,
        })
    }
}

fn check_blob_len(len: usize, what: &str) -> Result<()> {
    if len > MAX_HANDSHAKE_BLOB as usize {
        return Err(TransportError::Framing {
            reason: format!("{what} is {len} bytes, cap is {MAX_HANDSHAKE_BLOB}"),
        });
    }
    Ok(())
}

fn read_len<R: Read>(r: &mut R, what: &str) -> Result<u32> {
    let mut word = [0u8; 4];
    read_exact_framed(r, &mut word, what)?;
    let len = u32::from_ne_bytes(word);
    if len > MAX_HANDSHAKE_BLOB {
        return Err(TransportError::Framing {
            reason: format!("declared {what} {len} exceeds cap {MAX_HANDSHAKE_BLOB}"),
        });
    }
    Ok(len)
}

fn read_exact_framed<R: Read>(r: &mut R, buf: &mut [u8], what: &str) -> Result<()> {
    match r.read_exact(buf) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(TransportError::Framing {
            reason: format!("stream truncated while reading {what}"),
        }),
        Err(e) => Err(e.into()),
    }
}
