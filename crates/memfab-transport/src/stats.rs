//! Fabric-level counters.
//!
//! Counters are also how tests observe engine behavior that has no other
//! side effect, e.g. that waiting on an already-completed submission never
//! invoked progress.

use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Snapshot of fabric counters at a point in time.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FabricStatsSnapshot {
    /// Number of progress invocations.
    pub progress_calls: u64,
    /// Data-plane channels opened (accepted plus connected).
    pub connections_opened: u64,
    /// Data-plane channels closed.
    pub connections_closed: u64,
    /// Currently open data-plane channels.
    pub active_connections: u32,
    /// Total bytes written to data-plane sockets.
    pub bytes_sent: u64,
    /// Total bytes read from data-plane sockets.
    pub bytes_received: u64,
    /// Tagged messages queued before any receive was posted.
    pub messages_unexpected: u64,
    /// Tagged messages claimed by a probe.
    pub messages_matched: u64,
    /// Put operations submitted.
    pub puts_submitted: u64,
    /// Get operations submitted.
    pub gets_submitted: u64,
    /// Flush operations submitted.
    pub flushes_submitted: u64,
    /// Requests that reached success.
    pub requests_completed: u64,
    /// Requests that reached a terminal error status.
    pub requests_failed: u64,
    /// One-sided operations faulted by the serving side.
    pub remote_faults: u64,
    /// Frames or channels rejected for protocol violations.
    pub protocol_errors: u64,
    /// Memory regions registered.
    pub regions_registered: u64,
    /// Memory regions unregistered.
    pub regions_unregistered: u64,
    /// Remote keys imported.
    pub rkeys_imported: u64,
    /// Remote keys destroyed.
    pub rkeys_destroyed: u64,
}

/// Thread-safe fabric counters.
pub struct FabricStats {
    progress_calls: AtomicU64,
    connections_opened: AtomicU64,
    connections_closed: AtomicU64,
    active_connections: AtomicU32,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    messages_unexpected: AtomicU64,
    messages_matched: AtomicU64,
    puts_submitted: AtomicU64,
    gets_submitted: AtomicU64,
    flushes_submitted: AtomicU64,
    requests_completed: AtomicU64,
    requests_failed: AtomicU64,
    remote_faults: AtomicU64,
    protocol_errors: AtomicU64,
    regions_registered: AtomicU64,
    regions_unregistered: AtomicU64,
    rkeys_imported: AtomicU64,
    rkeys_destroyed: AtomicU64,
}

impl Default for FabricStats {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FabricStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FabricStats")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl FabricStats {
    /// Creates a collector with all counters at zero.
    #[must_use]
    pub fn new() -> Self {
        Self {
            progress_calls: AtomicU64::new(0),
            connections_opened: AtomicU64::new(0),
            connections_closed: AtomicU64::new(0),
            active_connections: AtomicU32::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            messages_unexpected: AtomicU64::new(0),
            messages_matched: AtomicU64::new(0),
            puts_submitted: AtomicU64::new(0),
            gets_submitted: AtomicU64::new(0),
            flushes_submitted: AtomicU64::new(0),
            requests_completed: AtomicU64::new(0),
            requests_failed: AtomicU64::new(0),
            remote_faults: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            regions_registered: AtomicU64::new(0),
            regions_unregistered: AtomicU64::new(0),
            rkeys_imported: AtomicU64::new(0),
            rkeys_destroyed: AtomicU64::new(0),
        }
    }

    /// Increments the progress invocation counter.
    pub fn inc_progress_calls(&self) {
        self.progress_calls.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a channel opened, tracking the active gauge as well.
    pub fn connection_opened(&self) {
        self.connections_opened.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a channel closed, tracking the active gauge as well.
    pub fn connection_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
        let _ = self
            .active_connections
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            });
    }

    /// Adds to the bytes sent counter.
    pub fn add_bytes_sent(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Adds to the bytes received counter.
    pub fn add_bytes_received(&self, bytes: u64) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Increments the unexpected-message counter.
    pub fn inc_messages_unexpected(&self) {
        self.messages_unexpected.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the matched-message counter.
    pub fn inc_messages_matched(&self) {
        self.messages_matched.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the put submission counter.
    pub fn inc_puts_submitted(&self) {
        self.puts_submitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the get submission counter.
    pub fn inc_gets_submitted(&self) {
        self.gets_submitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the flush submission counter.
    pub fn inc_flushes_submitted(&self) {
        self.flushes_submitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the completed-request counter.
    pub fn inc_requests_completed(&self) {
        self.requests_completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the failed-request counter.
    pub fn inc_requests_failed(&self) {
        self.requests_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the remote-fault counter.
    pub fn inc_remote_faults(&self) {
        self.remote_faults.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the protocol-error counter.
    pub fn inc_protocol_errors(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the regions-registered counter.
    pub fn inc_regions_registered(&self) {
        self.regions_registered.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the regions-unregistered counter.
    pub fn inc_regions_unregistered(&self) {
        self.regions_unregistered.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the rkeys-imported counter.
    pub fn inc_rkeys_imported(&self) {
        self.rkeys_imported.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the rkeys-destroyed counter.
    pub fn inc_rkeys_destroyed(&self) {
        self.rkeys_destroyed.fetch_add(1, Ordering::Relaxed);
    }

    /// Takes a snapshot of all current counter values.
    #[must_use]
    pub fn snapshot(&self) -> FabricStatsSnapshot {
        FabricStatsSnapshot {
            progress_calls: self.progress_calls.load(Ordering::Relaxed),
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            messages_unexpected: self.messages_unexpected.load(Ordering::Relaxed),
            messages_matched: self.messages_matched.load(Ordering::Relaxed),
            puts_submitted: self.puts_submitted.load(Ordering::Relaxed),
            gets_submitted: self.gets_submitted.load(Ordering::Relaxed),
            flushes_submitted: self.flushes_submitted.load(Ordering::Relaxed),
            requests_completed: self.requests_completed.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            remote_faults: self.remote_faults.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            regions_registered: self.regions_registered.load(Ordering::Relaxed),
            regions_unregistered: self.regions_unregistered.load(Ordering::Relaxed),
            rkeys_imported: self.rkeys_imported.load(Ordering::Relaxed),
            rkeys_destroyed: self.rkeys_destroyed.load(Ordering::Relaxed),
        }
    }
}
