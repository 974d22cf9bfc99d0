//! Property tests for the wire codecs: rendezvous handshake records and
//! data-plane frames.

use memfab_transport::{FabricFrame, HandshakeRecord};
use proptest::prelude::*;

/// Strategy over handshake records with demo-sized blobs.
pub fn arb_handshake_record() -> impl Strategy<Value = HandshakeRecord> {
    (
        proptest::collection::vec(any::<u8>(), 0..512),
        proptest::collection::vec(any::<u8>(), 0..128),
        any::<u64>(),
        any::<u64>(),
    )
        .prop_map(|(worker_addr, rkey, remote_ptr, size)| HandshakeRecord {
            worker_addr,
            rkey,
            remote_ptr,
            size,
        })
}

/// Strategy over tagged frames with bounded payloads.
pub fn arb_tagged_frame() -> impl Strategy<Value = FabricFrame> {
    (any::<u64>(), proptest::collection::vec(any::<u8>(), 0..2048))
        .prop_map(|(tag, data)| FabricFrame::Tagged { tag, data })
}
