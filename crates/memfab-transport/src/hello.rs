//! Tag-matching hello-world flow.
//!
//! The listener serves exactly one connector: it hands over its worker
//! address out of band, waits for the connector's own address as the first
//! tagged message, connects back, and sends the greeting pattern. The two
//! sides synchronize once over the out-of-band stream before teardown.

use crate::endpoint::Endpoint;
use crate::env::TransportEnv;
use crate::error::{Result, TransportError};
use crate::fabric::{FabricConfig, FeatureSet};
use crate::handshake::HandshakeRecord;
use crate::oob::{OobListener, OobStream};

/// Tag used by both directions of the hello exchange.
pub const HELLO_TAG: u64 = 0x1337_a880;

/// Every tag bit participates in matching.
pub const HELLO_TAG_MASK: u64 = u64::MAX;

/// Out-of-band port the demo binaries default to.
pub const DEFAULT_OOB_PORT: u16 = 13337;

/// Settings for the hello flow.
#[derive(Debug, Clone)]
pub struct HelloConfig {
    /// Greeting length in bytes. Only the listener side generates the
    /// greeting; the connector learns the length from the message itself.
    pub msg_len: usize,
    /// Fabric settings for the underlying environment.
    pub fabric: FabricConfig,
}

impl Default for HelloConfig {
    fn default() -> Self {
        Self {
            msg_len: 16,
            fabric: FabricConfig::default(),
        }
    }
}

/// Generates the greeting pattern: `'A' + (i mod 26)`.
pub fn test_message(len: usize) -> Vec<u8> {
    (0..len).map(|i| b'A' + (i % 26) as u8).collect()
}

fn encode_peer_address(addr: &[u8]) -> Vec<u8> {
    let mut msg = Vec::with_capacity(8 + addr.len());
    msg.extend_from_slice(&(addr.len() as u64).to_ne_bytes());
    msg.extend_from_slice(addr);
    msg
}

fn decode_peer_address(msg: &[u8]) -> Result<Vec<u8>> {
    if msg.len() < 8 {
        return Err(TransportError::Framing {
            reason: format!("address message of {} bytes is too short", msg.len()),
        });
    }
    let mut len_bytes = [0u8; 8];
    len_bytes.copy_from_slice(&msg[..8]);
    let len = u64::from_ne_bytes(len_bytes) as usize;
    if msg.len() < 8 + len {
        return Err(TransportError::Framing {
            reason: format!(
                "address message declares {len} bytes but carries {}",
                msg.len() - 8
            ),
        });
    }
    Ok(msg[8..8 + len].to_vec())
}

/// Listener half of the hello flow.
pub struct HelloListener {
    env: TransportEnv,
    oob: OobListener,
    msg_len: usize,
}

impl HelloListener {
    /// Binds the out-of-band listener and a tag-matching environment.
    pub fn bind(oob_addr: &str, config: HelloConfig) -> Result<Self> {
        let env = TransportEnv::create(config.fabric, FeatureSet::TAG)?;
        let oob = OobListener::bind(oob_addr)?;
        tracing::info!(oob = %oob.local_addr(), "hello listener ready");
        Ok(Self {
            env,
            oob,
            msg_len: config.msg_len,
        })
    }

    /// Port of the out-of-band listener.
    pub fn oob_port(&self) -> u16 {
        self.oob.port()
    }

    /// Serves one connector end to end and returns the greeting it sent.
    pub fn run(self) -> Result<Vec<u8>> {
        let mut stream = loop {
            self.env.progress();
            if let Some(stream) = self.oob.accept_nonblocking()? {
                break stream;
            }
        };
        tracing::debug!(peer = %stream.peer_addr()?, "out-of-band client connected");

        let record = HandshakeRecord {
            worker_addr: self.env.export_address()?,
            rkey: Vec::new(),
            remote_ptr: 0,
            size: self.msg_len as u64,
        };
        record.write_to(&mut stream)?;

        let msg = loop {
            self.env.progress();
            if let Some(msg) = self
                .env
                .worker()
                .probe_tagged(HELLO_TAG, HELLO_TAG_MASK)?
            {
                break msg;
            }
        };
        let mut buf = vec![0u8; msg.len()];
        let sub = self.env.worker().recv_matched(msg, &mut buf)?;
        self.env.wait(sub)?;
        let peer_addr = decode_peer_address(&buf)?;
        tracing::debug!(len = peer_addr.len(), "peer worker address received");

        let ep = Endpoint::create(self.env.worker(), &peer_addr)?;
        let greeting = test_message(self.msg_len);
        let sub = ep.send_tagged(HELLO_TAG, &greeting)?;
        self.env.wait(sub)?;
        let sub = ep.flush()?;
        self.env.wait(sub)?;

        stream.barrier()?;
        tracing::info!(len = greeting.len(), "greeting delivered");
        Ok(greeting)
    }
}

/// Runs the connector half against a listener and returns the greeting it
/// received.
pub fn run_connector(host: &str, port: u16, config: HelloConfig) -> Result<Vec<u8>> {
    let mut stream = OobStream::connect(host, port)?;
    let record = HandshakeRecord::read_from(&mut stream)?;
    tracing::debug!(
        addr_len = record.worker_addr.len(),
        size = record.size,
        "listener handshake received"
    );

    let env = TransportEnv::create(config.fabric, FeatureSet::TAG)?;
    let ep = Endpoint::create(env.worker(), &record.worker_addr)?;

    let own_addr = env.export_address()?;
    let sub = ep.send_tagged(HELLO_TAG, &encode_peer_address(&own_addr))?;
    env.wait(sub)?;

    let msg = loop {
        env.progress();
        if let Some(msg) = env.worker().probe_tagged(HELLO_TAG, HELLO_TAG_MASK)? {
            break msg;
        }
    };
    let mut greeting = vec![0u8; msg.len()];
    let sub = env.worker().recv_matched(msg, &mut greeting)?;
    env.wait(sub)?;

    stream.barrier()?;
    tracing::info!(len = greeting.len(), "greeting received");
    Ok(greeting)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_pattern_wraps_alphabet() {
        let msg = test_message(30);
        assert_eq!(msg[0], b'A');
        assert_eq!(msg[25], b'Z');
        assert_eq!(msg[26], b'A');
        assert_eq!(&msg[..16], b"ABCDEFGHIJKLMNOP");
    }

    #[test]
    fn test_peer_address_roundtrip() {
        let addr = vec![9u8, 8, 7, 6, 5];
        let msg = encode_peer_address(&addr);
        assert_eq!(msg.len(), 8 + addr.len());
        assert_eq!(decode_peer_address(&msg).unwrap(), addr);
    }

    #[test]
    fn test_peer_address_short_message() {
        assert!(matches!(
            decode_peer_address(&[0u8; 4]),
            Err(TransportError::Framing { .. })
        ));
    }

    #[test]
    fn test_peer_address_truncated_payload() {
        let mut msg = encode_peer_address(&[1, 2, 3, 4]);
        msg.truncate(msg.len() - 2);
        assert!(matches!(
            decode_peer_address(&msg),
            Err(TransportError::Framing { .. })
        ));
    }

    #[test]
    fn test_hello_flow_end_to_end() {
        let listener = HelloListener::bind("127.0.0.1:0", HelloConfig::default()).unwrap();
        let port = listener.oob_port();
        let server = std::thread::spawn(move || listener.run().unwrap());

        let greeting = run_connector("127.0.0.1", port, HelloConfig::default()).unwrap();
        assert_eq!(greeting, b"ABCDEFGHIJKLMNOP".to_vec());
        assert_eq!(server.join().unwrap(), greeting);
    }

    #[test]
    fn test_hello_flow_longer_greeting() {
        let config = HelloConfig {
            msg_len: 64,
            ..HelloConfig::default()
        };
        let listener = HelloListener::bind("127.0.0.1:0", config.clone()).unwrap();
        let port = listener.oob_port();
        let server = std::thread::spawn(move || listener.run().unwrap());

        let greeting = run_connector("127.0.0.1", port, config).unwrap();
        assert_eq!(greeting.len(), 64);
        assert_eq!(greeting, test_message(64));
        server.join().unwrap();
    }
}
