//! Transport environment: one context and its worker behind a single
//! handle, with busy-spin completion waiting.

use crate::error::{Result, TransportError};
use crate::fabric::{Context, FabricConfig, FeatureSet};
use crate::memory::Registration;
use crate::request::{OpStatus, Submitted};
use crate::stats::FabricStatsSnapshot;
use crate::worker::Worker;

/// Owns a context and the worker progressing it.
///
/// Field order pins teardown: the worker's channels and listener go down
/// before the context releases the region registry.
pub struct TransportEnv {
    worker: Worker,
    context: Context,
}

impl TransportEnv {
    /// Creates a context with the requested features and binds its worker.
    pub fn create(config: FabricConfig, features: FeatureSet) -> Result<Self> {
        let context = Context::new(config, features)?;
        let worker = Worker::new(&context)?;
        Ok(Self { worker, context })
    }

    /// The owned context.
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// The owned worker.
    pub fn worker(&self) -> &Worker {
        &self.worker
    }

    /// Serializes the worker address for out-of-band exchange.
    pub fn export_address(&self) -> Result<Vec<u8>> {
        self.worker.export_address()
    }

    /// Runs one progress sweep. Returns the amount of work done.
    pub fn progress(&self) -> usize {
        self.worker.progress()
    }

    /// Registers a buffer for one-sided access.
    pub fn register(&self, buf: Vec<u8>) -> Result<Registration> {
        self.context.register(buf)
    }

    /// Snapshot of fabric counters.
    pub fn stats(&self) -> FabricStatsSnapshot {
        self.context.stats()
    }

    /// Busy-spins progress until the submission reaches a terminal status.
    ///
    /// An already-completed submission returns immediately without touching
    /// progress. Only this environment's worker is progressed; a completion
    /// that needs the peer's progress must have the peer spinning too.
    pub fn wait(&self, submitted: Submitted) -> Result<()> {
        let req = match submitted {
            Submitted::Completed => return Ok(()),
            Submitted::Pending(req) => req,
        };
        loop {
            match req.status() {
                OpStatus::InProgress => {
                    self.worker.progress();
                }
                OpStatus::Success => return Ok(()),
                status => return Err(TransportError::Operation { status }),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::Endpoint;

    #[test]
    fn test_create_rejects_empty_features() {
        assert!(matches!(
            TransportEnv::create(FabricConfig::default(), FeatureSet::empty()),
            Err(TransportError::Init { .. })
        ));
    }

    #[test]
    fn test_wait_on_completed_skips_progress() {
        let env = TransportEnv::create(FabricConfig::default(), FeatureSet::TAG).unwrap();
        env.wait(Submitted::Completed).unwrap();
        assert_eq!(env.stats().progress_calls, 0);
    }

    #[test]
    fn test_wait_surfaces_disconnect() {
        let env = TransportEnv::create(FabricConfig::default(), FeatureSet::ALL).unwrap();
        let peer = TransportEnv::create(FabricConfig::default(), FeatureSet::ALL).unwrap();

        let src = env.register(vec![1u8; 8]).unwrap();
        let dst = peer.register(vec![0u8; 8]).unwrap();

        let ep = Endpoint::create(env.worker(), &peer.export_address().unwrap()).unwrap();
        let rkey = ep.import_rkey(&dst.pack_rkey().unwrap()).unwrap();
        let _ = ep.put(&src, 0, 8, dst.base(), &rkey).unwrap();

        // The peer never progresses, so the fence is still in flight when
        // the endpoint goes away.
        let fence = ep.flush().unwrap();
        drop(ep);

        match env.wait(fence) {
            Err(TransportError::Operation { status }) => {
                assert_eq!(status, OpStatus::Disconnected);
            }
            other => panic!("expected a failed operation, got {other:?}"),
        }
    }
}
