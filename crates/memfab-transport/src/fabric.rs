//! Fabric context: feature selection, configuration, and the registration
//! table shared between a context and its worker.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;

use crate::error::{Result, TransportError};
use crate::memory::{RegionRegistry, Registration};
use crate::stats::{FabricStats, FabricStatsSnapshot};

/// Capabilities requested when creating a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSet(u32);

impl FeatureSet {
    /// Two-sided tagged messaging.
    pub const TAG: Self = Self(1);
    /// One-sided put/get against registered memory.
    pub const RMA: Self = Self(2);
    /// Both capabilities.
    pub const ALL: Self = Self(3);

    /// True if every feature in `other` is enabled here.
    pub fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    /// No capabilities.
    pub fn empty() -> Self {
        Self(0)
    }

    /// True if no capability is enabled.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for FeatureSet {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl Default for FeatureSet {
    fn default() -> Self {
        Self::empty()
    }
}

/// Declared threading contract for a worker.
///
/// The engine is internally locked either way; the mode records the
/// caller's promise about who drives progress, matching how the capability
/// is requested on real fabrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThreadMode {
    /// Exactly one thread progresses the worker at any time.
    Single,
    /// Multiple threads may call into the worker.
    Multi,
}

impl Default for ThreadMode {
    fn default() -> Self {
        Self::Single
    }
}

/// Fabric configuration.
#[derive(Debug, Clone)]
pub struct FabricConfig {
    /// Address the worker's data-plane listener binds to.
    pub bind_addr: SocketAddr,
    /// Per-frame payload cap on data-plane channels.
    pub max_frame_payload: u32,
    /// Declared threading contract.
    pub thread_mode: ThreadMode,
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            max_frame_payload: 16 * 1024 * 1024,
            thread_mode: ThreadMode::Single,
        }
    }
}

pub(crate) struct ContextShared {
    pub(crate) features: FeatureSet,
    pub(crate) config: FabricConfig,
    pub(crate) registry: Arc<RegionRegistry>,
    pub(crate) stats: Arc<FabricStats>,
}

/// Fabric context: owns the feature set and the memory registration table.
pub struct Context {
    shared: Arc<ContextShared>,
}

impl Context {
    /// Creates a context with the requested capabilities.
    pub fn new(config: FabricConfig, features: FeatureSet) -> Result<Self> {
        if features.is_empty() {
            return Err(TransportError::Init {
                reason: "feature set is empty".to_string(),
            });
        }
        Ok(Self {
            shared: Arc::new(ContextShared {
                features,
                config,
                registry: Arc::new(RegionRegistry::new()),
                stats: Arc::new(FabricStats::new()),
            }),
        })
    }

    /// Capabilities this context was created with.
    pub fn features(&self) -> FeatureSet {
        self.shared.features
    }

    /// Registers a buffer for remote access, taking ownership of it.
    /// Requires the RMA feature and a non-empty buffer.
    pub fn register(&self, buf: Vec<u8>) -> Result<Registration> {
        if !self.shared.features.contains(FeatureSet::RMA) {
            return Err(TransportError::Registration {
                reason: "context lacks the RMA feature".to_string(),
            });
        }
        Registration::register(
            buf,
            self.shared.registry.clone(),
            self.shared.stats.clone(),
        )
    }

    /// Snapshot of the fabric counters.
    pub fn stats(&self) -> FabricStatsSnapshot {
        self.shared.stats.snapshot()
    }

    pub(crate) fn shared(&self) -> &Arc<ContextShared> {
        &self.shared
    }
}
