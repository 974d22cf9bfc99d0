//! Memory registration and remote access keys.
//!
//! A registration takes ownership of its buffer and advertises it to remote
//! peers through a packed key blob plus the buffer's base address. The
//! serving worker resolves incoming one-sided operations against the
//! registration table and applies them to the backing storage.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::{Result, TransportError};
use crate::stats::FabricStats;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct RkeyBlob {
    key: u64,
}

pub(crate) struct RegionEntry {
    pub(crate) backing: Arc<Mutex<Vec<u8>>>,
    pub(crate) base: u64,
    pub(crate) len: usize,
}

/// Table of live registrations, shared between a context and its worker.
pub(crate) struct RegionRegistry {
    regions: Mutex<HashMap<u64, RegionEntry>>,
}

impl RegionRegistry {
    pub(crate) fn new() -> Self {
        Self {
            regions: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn insert(&self, key: u64, entry: RegionEntry) {
        self.regions.lock().unwrap().insert(key, entry);
    }

    pub(crate) fn remove(&self, key: u64) {
        self.regions.lock().unwrap().remove(&key);
    }

    /// Applies a remote put. The fault reason feeds the serving side's log.
    pub(crate) fn apply_put(
        &self,
        key: u64,
        raddr: u64,
        data: &[u8],
    ) -> std::result::Result<(), String> {
        let regions = self.regions.lock().unwrap();
        let entry = regions.get(&key).ok_or("unknown remote key")?;
        let off = raddr
            .checked_sub(entry.base)
            .ok_or("address below region base")? as usize;
        let end = off.checked_add(data.len()).ok_or("address overflow")?;
        if end > entry.len {
            return Err(format!(
                "write of {} bytes at offset {off} exceeds region of {} bytes",
                data.len(),
                entry.len
            ));
        }
        let mut buf = entry.backing.lock().unwrap();
        buf[off..end].copy_from_slice(data);
        Ok(())
    }

    /// Serves a remote get. The fault reason travels back to the originator.
    pub(crate) fn read_get(
        &self,
        key: u64,
        raddr: u64,
        len: u64,
    ) -> std::result::Result<Vec<u8>, String> {
        let regions = self.regions.lock().unwrap();
        let entry = regions.get(&key).ok_or("unknown remote key")?;
        let off = raddr
            .checked_sub(entry.base)
            .ok_or("address below region base")? as usize;
        let len = len as usize;
        let end = off.checked_add(len).ok_or("address overflow")?;
        if end > entry.len {
            return Err(format!(
                "read of {len} bytes at offset {off} exceeds region of {} bytes",
                entry.len
            ));
        }
        let buf = entry.backing.lock().unwrap();
        Ok(buf[off..end].to_vec())
    }
}

/// A registered memory region. Owns its buffer; unregisters on drop.
///
/// The registration must outlive every remote operation that references its
/// packed key. That is a usage contract, not something the fabric checks;
/// a get against a dropped registration faults at the serving side.
pub struct Registration {
    backing: Arc<Mutex<Vec<u8>>>,
    base: u64,
    len: usize,
    key: u64,
    registry: Arc<RegionRegistry>,
    stats: Arc<FabricStats>,
}

impl Registration {
    pub(crate) fn register(
        buf: Vec<u8>,
        registry: Arc<RegionRegistry>,
        stats: Arc<FabricStats>,
    ) -> Result<Self> {
        if buf.is_empty() {
            return Err(TransportError::Registration {
                reason: "cannot register an empty buffer".to_string(),
            });
        }
        let len = buf.len();
        let backing = Arc::new(Mutex::new(buf));
        let base = backing.lock().unwrap().as_ptr() as u64;
        let key = loop {
            let k = rand::random::<u64>();
            if k != 0 {
                break k;
            }
        };
        registry.insert(
            key,
            RegionEntry {
                backing: backing.clone(),
                base,
                len,
            },
        );
        stats.inc_regions_registered();
        tracing::debug!(key, base, len, "memory region registered");
        Ok(Self {
            backing,
            base,
            len,
            key,
            registry,
            stats,
        })
    }

    /// Base address advertised to remote peers.
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Region length in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if the region is empty. Registration rejects empty buffers, so
    /// this is always false for a live registration.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Packs the remote access key for this region. The blob is only valid
    /// while the registration lives.
    pub fn pack_rkey(&self) -> Result<Vec<u8>> {
        bincode::serialize(&RkeyBlob { key: self.key })
            .map_err(|e| TransportError::SerializationError(e.to_string()))
    }

    /// Reads a bounded range of the owned buffer.
    pub fn read_at(&self, offset: usize, len: usize) -> Option<Vec<u8>> {
        let buf = self.backing.lock().ok()?;
        let end = offset.checked_add(len)?;
        if end > buf.len() {
            return None;
        }
        Some(buf[offset..end].to_vec())
    }

    /// Overwrites a bounded range of the owned buffer.
    pub fn write_at(&self, offset: usize, data: &[u8]) -> bool {
        let mut buf = match self.backing.lock() {
            Ok(b) => b,
            Err(_) => return false,
        };
        let end = match offset.checked_add(data.len()) {
            Some(e) => e,
            None => return false,
        };
        if end > buf.len() {
            return false;
        }
        buf[offset..end].copy_from_slice(data);
        true
    }

    /// Copies out the whole buffer.
    pub fn contents(&self) -> Vec<u8> {
        self.backing.lock().unwrap().clone()
    }

    pub(crate) fn backing(&self) -> Arc<Mutex<Vec<u8>>> {
        self.backing.clone()
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.remove(self.key);
        self.stats.inc_regions_unregistered();
        tracing::debug!(key = self.key, "memory region unregistered");
    }
}

/// An imported remote access key, bound to the endpoint that imported it.
/// Destroyed on drop.
pub struct RemoteKey {
    key: u64,
    stats: Arc<FabricStats>,
}

impl RemoteKey {
    pub(crate) fn unpack(blob: &[u8], stats: Arc<FabricStats>) -> Result<Self> {
        let decoded: RkeyBlob = bincode::deserialize(blob).map_err(|e| {
            TransportError::Endpoint {
                reason: format!("malformed rkey blob: {e}"),
            }
        })?;
        stats.inc_rkeys_imported();
        Ok(Self {
            key: decoded.key,
            stats,
        })
    }

    pub(crate) fn key(&self) -> u64 {
        self.key
    }
}

impl Drop for RemoteKey {
    fn drop(&mut self) {
        self.stats.inc_rkeys_destroyed();
    }
}
