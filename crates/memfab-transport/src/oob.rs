//! Out-of-band rendezvous channel.
//!
//! A plain blocking TCP stream used only to bootstrap the fabric: carry the
//! handshake record and, in the hello flow, a final teardown barrier. The
//! listener polls for connections without blocking so a serving loop can
//! interleave accepts with fabric progress.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};

use crate::error::{Result, TransportError};

fn setup_err(context: &str, e: io::Error) -> TransportError {
    TransportError::Setup {
        reason: format!("{context}: {e}"),
    }
}

/// Listening side of the rendezvous channel.
#[derive(Debug)]
pub struct OobListener {
    inner: TcpListener,
    local_addr: SocketAddr,
}

impl OobListener {
    /// Binds a rendezvous listener. The listener itself is non-blocking;
    /// accepted streams are switched back to blocking mode.
    pub fn bind(addr: &str) -> Result<Self> {
        let inner = TcpListener::bind(addr).map_err(|e| setup_err("oob bind", e))?;
        inner
            .set_nonblocking(true)
            .map_err(|e| setup_err("oob listener mode", e))?;
        let local_addr = inner
            .local_addr()
            .map_err(|e| setup_err("oob local addr", e))?;
        tracing::debug!(addr = %local_addr, "OOB listener bound");
        Ok(Self { inner, local_addr })
    }

    /// Local address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Local port the listener is bound to.
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Polls for one pending connection with zero timeout. Returns `None`
    /// when no peer is waiting instead of blocking.
    pub fn accept_nonblocking(&self) -> Result<Option<OobStream>> {
        match self.inner.accept() {
            Ok((stream, peer)) => {
                stream
                    .set_nonblocking(false)
                    .map_err(|e| setup_err("oob accepted stream mode", e))?;
                stream
                    .set_nodelay(true)
                    .map_err(|e| setup_err("oob nodelay", e))?;
                tracing::debug!(peer = %peer, "OOB connection accepted");
                Ok(Some(OobStream { inner: stream }))
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(setup_err("oob accept", e)),
        }
    }
}

/// One rendezvous connection. Transfers are all-or-nothing: a partial
/// transfer surfaces as an error, never as a short read or write.
#[derive(Debug)]
pub struct OobStream {
    inner: TcpStream,
}

impl OobStream {
    /// Connects to a rendezvous listener.
    pub fn connect(host: &str, port: u16) -> Result<Self> {
        let target = (host, port);
        let addr = target
            .to_socket_addrs()
            .map_err(|e| setup_err("oob resolve", e))?
            .next()
            .ok_or_else(|| TransportError::Setup {
                reason: format!("oob resolve: no address for {host}:{port}"),
            })?;
        let inner = TcpStream::connect(addr).map_err(|e| setup_err("oob connect", e))?;
        inner
            .set_nodelay(true)
            .map_err(|e| setup_err("oob nodelay", e))?;
        tracing::debug!(addr = %addr, "OOB connected");
        Ok(Self { inner })
    }

    /// Sends the entire buffer.
    pub fn send_all(&mut self, buf: &[u8]) -> Result<()> {
        self.inner
            .write_all(buf)
            .map_err(|e| setup_err("oob send", e))?;
        self.inner
            .flush()
            .map_err(|e| setup_err("oob flush", e))
    }

    /// Receives exactly `buf.len()` bytes.
    pub fn recv_all(&mut self, buf: &mut [u8]) -> Result<()> {
        self.inner
            .read_exact(buf)
            .map_err(|e| setup_err("oob recv", e))
    }

    /// One-byte-each-way synchronization point. Both sides call this;
    /// neither returns until the other has arrived.
    pub fn barrier(&mut self) -> Result<()> {
        self.send_all(&[0u8])?;
        let mut ack = [0u8; 1];
        self.recv_all(&mut ack)
    }

    /// Remote peer address.
    pub fn peer_addr(&self) -> Result<SocketAddr> {
        self.inner
            .peer_addr()
            .map_err(|e| setup_err("oob peer addr", e))
    }
}

impl Read for OobStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Write for OobStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_accept_nonblocking_returns_none_when_idle() {
        let listener = OobListener::bind("127.0.0.1:0").unwrap();
        assert!(listener.accept_nonblocking().unwrap().is_none());
        assert!(listener.accept_nonblocking().unwrap().is_none());
    }

    #[test]
    fn test_send_recv_full_transfer() {
        let listener = OobListener::bind("127.0.0.1:0").unwrap();
        let port = listener.port();

        let client = thread::spawn(move || {
            let mut stream = OobStream::connect("127.0.0.1", port).unwrap();
            stream.send_all(b"rendezvous payload").unwrap();
            let mut reply = [0u8; 2];
            stream.recv_all(&mut reply).unwrap();
            assert_eq!(&reply, b"ok");
        });

        let mut accepted = loop {
            if let Some(s) = listener.accept_nonblocking().unwrap() {
                break s;
            }
        };
        let mut buf = [0u8; 18];
        accepted.recv_all(&mut buf).unwrap();
        assert_eq!(&buf, b"rendezvous payload");
        accepted.send_all(b"ok").unwrap();

        client.join().unwrap();
    }

    #[test]
    fn test_recv_all_short_stream_is_setup_error() {
        let listener = OobListener::bind("127.0.0.1:0").unwrap();
        let port = listener.port();

        let client = thread::spawn(move || {
            let mut stream = OobStream::connect("127.0.0.1", port).unwrap();
            stream.send_all(&[1, 2, 3]).unwrap();
            // Dropping here closes the stream mid-transfer.
        });

        let mut accepted = loop {
            if let Some(s) = listener.accept_nonblocking().unwrap() {
                break s;
            }
        };
        client.join().unwrap();

        let mut buf = [0u8; 8];
        assert!(matches!(
            accepted.recv_all(&mut buf),
            Err(TransportError::Setup { .. })
        ));
    }

    #[test]
    fn test_barrier_meets_in_the_middle() {
        let listener = OobListener::bind("127.0.0.1:0").unwrap();
        let port = listener.port();

        let client = thread::spawn(move || {
            let mut stream = OobStream::connect("127.0.0.1", port).unwrap();
            stream.barrier().unwrap();
        });

        let mut accepted = loop {
            if let Some(s) = listener.accept_nonblocking().unwrap() {
                break s;
            }
        };
        accepted.barrier().unwrap();
        client.join().unwrap();
    }

    #[test]
    fn test_connect_to_dead_port_is_setup_error() {
        let listener = OobListener::bind("127.0.0.1:0").unwrap();
        let port = listener.port();
        drop(listener);

        assert!(matches!(
            OobStream::connect("127.0.0.1", port),
            Err(TransportError::Setup { .. })
        ));
    }
}
