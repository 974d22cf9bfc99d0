#![warn(missing_docs)]

//! memfab transport: RDMA-style tag messaging and one-sided RMA over a
//! software fabric, with out-of-band TCP rendezvous and cooperative progress

pub mod endpoint;
pub mod env;
pub mod error;
pub mod fabric;
pub mod frame;
pub mod handshake;
pub mod hello;
pub mod memory;
pub mod oob;
pub mod request;
pub mod rma;
pub mod stats;
pub mod worker;

pub use endpoint::Endpoint;
pub use env::TransportEnv;
pub use error::{Result, TransportError};
pub use fabric::{Context, FabricConfig, FeatureSet, ThreadMode};
pub use frame::{FabricFrame, FrameDecoder, FRAME_HEADER_SIZE, FRAME_MAGIC, FRAME_VERSION};
pub use handshake::HandshakeRecord;
pub use hello::DEFAULT_OOB_PORT;
pub use memory::{Registration, RemoteKey};
pub use oob::{OobListener, OobStream};
pub use request::{OpStatus, Request, Submitted};
pub use stats::{FabricStats, FabricStatsSnapshot};
pub use worker::{TaggedMessage, Worker};
