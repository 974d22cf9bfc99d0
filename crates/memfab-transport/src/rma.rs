//! One-sided RMA demo flows.
//!
//! The server registers one buffer and hands its address, remote key,
//! pointer, and size to every client that completes the out-of-band
//! handshake, then keeps progressing the fabric forever. A client performs
//! exactly one put (fenced by a flush) or one get and exits.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::endpoint::Endpoint;
use crate::env::TransportEnv;
use crate::error::{Result, TransportError};
use crate::fabric::{FabricConfig, FeatureSet};
use crate::handshake::HandshakeRecord;
use crate::memory::Registration;
use crate::oob::{OobListener, OobStream};

/// Operation a client performs against the server buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RmaOp {
    /// Write the client pattern into the server buffer.
    Put,
    /// Read the server buffer into a local one.
    Get,
}

/// Settings for the serving side.
#[derive(Debug, Clone)]
pub struct RmaServerConfig {
    /// Size of the exposed buffer in bytes.
    pub buf_len: usize,
    /// How often the buffer head is logged while serving.
    pub head_log_every: Duration,
    /// Fabric settings.
    pub fabric: FabricConfig,
}

impl Default for RmaServerConfig {
    fn default() -> Self {
        Self {
            buf_len: 4096,
            head_log_every: Duration::from_secs(1),
            fabric: FabricConfig::default(),
        }
    }
}

/// Settings for the client side.
#[derive(Debug, Clone)]
pub struct RmaClientConfig {
    /// Requested transfer length; capped to the server's advertised size.
    pub len: usize,
    /// Fabric settings.
    pub fabric: FabricConfig,
}

impl Default for RmaClientConfig {
    fn default() -> Self {
        Self {
            len: 64,
            fabric: FabricConfig::default(),
        }
    }
}

/// Fills the demo server buffer: `buf[i] = i & 0xFF`.
pub fn server_pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i & 0xFF) as u8).collect()
}

/// Fills the client put pattern: `(i * 3) & 0xFF`.
pub fn client_pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 3) & 0xFF) as u8).collect()
}

/// Renders the first `n` bytes as space-separated hex.
pub fn hex_head(bytes: &[u8], n: usize) -> String {
    bytes
        .iter()
        .take(n)
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(" ")
}

/// RMA demo server: one registered buffer exposed to every handshaking
/// client.
pub struct RmaServer {
    env: TransportEnv,
    oob: OobListener,
    region: Registration,
    head_log_every: Duration,
}

impl RmaServer {
    /// Binds the server and registers a buffer initialized to the demo
    /// pattern.
    pub fn bind(oob_addr: &str, config: RmaServerConfig) -> Result<Self> {
        let env = TransportEnv::create(config.fabric, FeatureSet::RMA)?;
        let region = env.register(server_pattern(config.buf_len))?;
        let oob = OobListener::bind(oob_addr)?;
        tracing::info!(
            oob = %oob.local_addr(),
            len = region.len(),
            base = region.base(),
            "rma server ready"
        );
        Ok(Self {
            env,
            oob,
            region,
            head_log_every: config.head_log_every,
        })
    }

    /// Port of the out-of-band listener.
    pub fn oob_port(&self) -> u16 {
        self.oob.port()
    }

    /// First `n` bytes of the served buffer.
    pub fn local_head(&self, n: usize) -> Vec<u8> {
        let contents = self.region.contents();
        contents[..n.min(contents.len())].to_vec()
    }

    /// Alternates non-blocking out-of-band accepts with fabric progress
    /// until `stop` is raised. A failed per-client handshake is logged and
    /// served past; it never brings the loop down.
    pub fn serve(&self, stop: &AtomicBool) -> Result<()> {
        let mut last_head = Instant::now();
        while !stop.load(Ordering::Relaxed) {
            self.env.progress();
            match self.oob.accept_nonblocking() {
                Ok(Some(mut stream)) => {
                    if let Err(e) = self.handshake(&mut stream) {
                        tracing::warn!(error = %e, "client handshake failed");
                    }
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "out-of-band accept failed"),
            }
            if last_head.elapsed() >= self.head_log_every {
                tracing::info!(head = %hex_head(&self.region.contents(), 16), "buffer head");
                last_head = Instant::now();
            }
        }
        Ok(())
    }

    fn handshake(&self, stream: &mut OobStream) -> Result<()> {
        let record = HandshakeRecord {
            worker_addr: self.env.export_address()?,
            rkey: self.region.pack_rkey()?,
            remote_ptr: self.region.base(),
            size: self.region.len() as u64,
        };
        record.write_to(stream)?;
        tracing::debug!(peer = %stream.peer_addr()?, "client handshake sent");
        Ok(())
    }
}

/// Runs one client operation against a server. Returns the client's local
/// buffer after the transfer: the written pattern for a put, the fetched
/// bytes for a get.
pub fn run_client(host: &str, port: u16, op: RmaOp, config: RmaClientConfig) -> Result<Vec<u8>> {
    let mut stream = OobStream::connect(host, port)?;
    let record = HandshakeRecord::read_from(&mut stream)?;
    if record.rkey.is_empty() {
        return Err(TransportError::Setup {
            reason: "server advertised no remote key".to_string(),
        });
    }
    let len = config.len.min(record.size as usize);
    tracing::debug!(
        len,
        remote_ptr = record.remote_ptr,
        size = record.size,
        ?op,
        "server handshake received"
    );

    let env = TransportEnv::create(config.fabric, FeatureSet::RMA)?;
    let ep = Endpoint::create(env.worker(), &record.worker_addr)?;
    let rkey = ep.import_rkey(&record.rkey)?;

    let region = match op {
        RmaOp::Put => {
            let region = env.register(client_pattern(len))?;
            let sub = ep.put(&region, 0, len, record.remote_ptr, &rkey)?;
            env.wait(sub)?;
            let sub = ep.flush()?;
            env.wait(sub)?;
            region
        }
        RmaOp::Get => {
            let region = env.register(vec![0u8; len])?;
            let sub = ep.get(&region, 0, len, record.remote_ptr, &rkey)?;
            env.wait(sub)?;
            region
        }
    };
    tracing::info!(head = %hex_head(&region.contents(), 16), ?op, "transfer complete");
    Ok(region.contents())
}
