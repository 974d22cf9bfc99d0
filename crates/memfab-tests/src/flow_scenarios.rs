//! End-to-end runs of the demo flows inside one process. Serving sides go
//! onto their own threads; clients run on the test thread.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread::JoinHandle;

use memfab_transport::hello::{HelloConfig, HelloListener};
use memfab_transport::rma::{RmaServer, RmaServerConfig};
use memfab_transport::Result;

/// Binds a hello listener and runs it on its own thread. Returns the
/// out-of-band port and the handle yielding the greeting it sent.
pub fn spawn_hello_listener(config: HelloConfig) -> (u16, JoinHandle<Result<Vec<u8>>>) {
    let listener = HelloListener::bind("127.0.0.1:0", config).expect("hello listener bind");
    let port = listener.oob_port();
    (port, std::thread::spawn(move || listener.run()))
}

/// Binds an RMA server and serves it on its own thread until the stop flag
/// is raised.
pub fn spawn_rma_server(
    config: RmaServerConfig,
) -> (Arc<RmaServer>, Arc<AtomicBool>, JoinHandle<Result<()>>) {
    let server = Arc::new(RmaServer::bind("127.0.0.1:0", config).expect("rma server bind"));
    let stop = Arc::new(AtomicBool::new(false));
    let handle = {
        let server = server.clone();
        let stop = stop.clone();
        std::thread::spawn(move || server.serve(&stop))
    };
    (server, stop, handle)
}
