//! Cross-environment fabric scenarios: two workers in one process, wired
//! over loopback, driven from the test thread.

use memfab_transport::{Endpoint, FabricConfig, FeatureSet, TransportEnv};

/// Two fresh environments with the same feature set.
pub fn env_pair(features: FeatureSet) -> (TransportEnv, TransportEnv) {
    let a = TransportEnv::create(FabricConfig::default(), features).unwrap();
    let b = TransportEnv::create(FabricConfig::default(), features).unwrap();
    (a, b)
}

/// Endpoint from one environment's worker to the other's.
pub fn connect(from: &TransportEnv, to: &TransportEnv) -> Endpoint {
    Endpoint::create(from.worker(), &to.export_address().unwrap()).unwrap()
}

/// Random payload for exchange scenarios.
pub fn random_payload(len: usize) -> Vec<u8> {
    (0..len).map(|_| rand::random()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::harness::{drive_to_completion, init_test_logging, progress_until, SPIN_BOUND};
    use memfab_transport::{OpStatus, Submitted, TransportError};
    use std::io::Write;

    #[test]
    fn test_tagged_exchange_roundtrip() {
        init_test_logging();
        let (a, b) = env_pair(FeatureSet::TAG);
        let ep = connect(&a, &b);

        let payload = random_payload(200);
        let sub = ep.send_tagged(0x51, &payload).unwrap();
        assert_eq!(drive_to_completion(&a, &b, sub), OpStatus::Success);

        let mut msg = None;
        progress_until(&a, &b, || {
            msg = b.worker().probe_tagged(0x51, u64::MAX).unwrap();
            msg.is_some()
        });
        let msg = msg.unwrap();
        assert_eq!(msg.len(), payload.len());

        let mut buf = vec![0u8; payload.len()];
        assert!(b.worker().recv_matched(msg, &mut buf).unwrap().is_completed());
        assert_eq!(buf, payload);
    }

    #[test]
    fn test_equal_tags_keep_arrival_order() {
        init_test_logging();
        let (a, b) = env_pair(FeatureSet::TAG);
        let ep = connect(&a, &b);

        for body in [vec![1u8], vec![2], vec![3]] {
            let sub = ep.send_tagged(7, &body).unwrap();
            assert_eq!(drive_to_completion(&a, &b, sub), OpStatus::Success);
        }

        let mut seen = Vec::new();
        progress_until(&a, &b, || {
            while let Some(msg) = b.worker().probe_tagged(7, u64::MAX).unwrap() {
                let mut buf = vec![0u8; msg.len()];
                b.worker().recv_matched(msg, &mut buf).unwrap();
                seen.push(buf[0]);
            }
            seen.len() == 3
        });
        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[test]
    fn test_mask_selects_tag_family() {
        init_test_logging();
        let (a, b) = env_pair(FeatureSet::TAG);
        let ep = connect(&a, &b);

        for tag in [0xAB01u64, 0x1102, 0xAB03] {
            let sub = ep.send_tagged(tag, &[tag as u8]).unwrap();
            assert_eq!(drive_to_completion(&a, &b, sub), OpStatus::Success);
        }

        // Only the high byte participates; the 0x11xx message stays queued.
        let mut family = Vec::new();
        progress_until(&a, &b, || {
            while let Some(msg) = b.worker().probe_tagged(0xAB00, 0xFF00).unwrap() {
                family.push(msg.tag());
            }
            family.len() == 2
        });
        assert_eq!(family, vec![0xAB01, 0xAB03]);

        let other = b.worker().probe_tagged(0x1102, u64::MAX).unwrap();
        assert!(other.is_some());
    }

    #[test]
    fn test_put_then_get_cycle() {
        init_test_logging();
        let (a, b) = env_pair(FeatureSet::ALL);
        let ep = connect(&a, &b);

        let pattern: Vec<u8> = (0..256).map(|i| ((i * 7) & 0xFF) as u8).collect();
        let src = a.register(pattern.clone()).unwrap();
        let dst = b.register(vec![0u8; 256]).unwrap();
        let rkey = ep.import_rkey(&dst.pack_rkey().unwrap()).unwrap();

        let put = ep.put(&src, 0, 256, dst.base(), &rkey).unwrap();
        assert_eq!(drive_to_completion(&a, &b, put), OpStatus::Success);
        let flush = ep.flush().unwrap();
        assert_eq!(drive_to_completion(&a, &b, flush), OpStatus::Success);
        assert_eq!(dst.contents(), pattern);

        let readback = a.register(vec![0u8; 256]).unwrap();
        let get = ep.get(&readback, 0, 256, dst.base(), &rkey).unwrap();
        assert_eq!(drive_to_completion(&a, &b, get), OpStatus::Success);
        assert_eq!(readback.contents(), pattern);
    }

    #[test]
    fn test_offsets_land_where_aimed() {
        init_test_logging();
        let (a, b) = env_pair(FeatureSet::ALL);
        let ep = connect(&a, &b);

        let src = a.register((0u8..=63).collect()).unwrap();
        let dst = b.register(vec![0u8; 256]).unwrap();
        let rkey = ep.import_rkey(&dst.pack_rkey().unwrap()).unwrap();

        let put = ep.put(&src, 16, 32, dst.base() + 100, &rkey).unwrap();
        assert_eq!(drive_to_completion(&a, &b, put), OpStatus::Success);
        let flush = ep.flush().unwrap();
        assert_eq!(drive_to_completion(&a, &b, flush), OpStatus::Success);

        let remote = dst.contents();
        assert!(remote[..100].iter().all(|&x| x == 0));
        assert_eq!(&remote[100..132], &(16u8..48).collect::<Vec<u8>>()[..]);
        assert!(remote[132..].iter().all(|&x| x == 0));

        let readback = a.register(vec![0u8; 64]).unwrap();
        let get = ep.get(&readback, 8, 32, dst.base() + 100, &rkey).unwrap();
        assert_eq!(drive_to_completion(&a, &b, get), OpStatus::Success);
        let local = readback.contents();
        assert!(local[..8].iter().all(|&x| x == 0));
        assert_eq!(&local[8..40], &(16u8..48).collect::<Vec<u8>>()[..]);
        assert!(local[40..].iter().all(|&x| x == 0));
    }

    #[test]
    fn test_get_from_dangling_key_faults() {
        init_test_logging();
        let (a, b) = env_pair(FeatureSet::ALL);
        let ep = connect(&a, &b);

        let remote = b.register(vec![9u8; 64]).unwrap();
        let raddr = remote.base();
        let blob = remote.pack_rkey().unwrap();
        drop(remote);

        let rkey = ep.import_rkey(&blob).unwrap();
        let dst = a.register(vec![0u8; 64]).unwrap();
        let get = ep.get(&dst, 0, 64, raddr, &rkey).unwrap();
        assert_eq!(drive_to_completion(&a, &b, get), OpStatus::RemoteFault);

        assert!(a.stats().remote_faults >= 1);
        assert!(b.stats().remote_faults >= 1);
        assert!(a.stats().requests_failed >= 1);
    }

    #[test]
    fn test_put_to_dangling_key_is_counted_remotely() {
        init_test_logging();
        let (a, b) = env_pair(FeatureSet::ALL);
        let ep = connect(&a, &b);

        let remote = b.register(vec![0u8; 64]).unwrap();
        let raddr = remote.base();
        let blob = remote.pack_rkey().unwrap();
        drop(remote);

        let rkey = ep.import_rkey(&blob).unwrap();
        let src = a.register(vec![1u8; 64]).unwrap();
        let put = ep.put(&src, 0, 64, raddr, &rkey).unwrap();
        assert_eq!(drive_to_completion(&a, &b, put), OpStatus::Success);
        let flush = ep.flush().unwrap();
        assert_eq!(drive_to_completion(&a, &b, flush), OpStatus::Success);

        assert!(b.stats().remote_faults >= 1);
    }

    #[test]
    fn test_peer_death_fails_pending_request() {
        init_test_logging();
        let (a, b) = env_pair(FeatureSet::ALL);
        let ep = connect(&a, &b);

        let remote = b.register(vec![3u8; 32]).unwrap();
        let rkey = ep.import_rkey(&remote.pack_rkey().unwrap()).unwrap();
        let dst = a.register(vec![0u8; 32]).unwrap();

        let get = ep.get(&dst, 0, 32, remote.base(), &rkey).unwrap();
        let req = match get {
            Submitted::Pending(req) => req,
            Submitted::Completed => panic!("a get cannot complete at submission"),
        };

        drop(b);
        for _ in 0..SPIN_BOUND {
            a.progress();
            if req.status().is_terminal() {
                break;
            }
            std::thread::yield_now();
        }
        assert_eq!(req.status(), OpStatus::Disconnected);
        assert!(a.stats().requests_failed >= 1);
    }

    #[test]
    fn test_garbage_data_plane_peer_is_dropped() {
        init_test_logging();
        let b = TransportEnv::create(FabricConfig::default(), FeatureSet::TAG).unwrap();
        let mut rogue = std::net::TcpStream::connect(b.worker().listen_addr()).unwrap();
        rogue.write_all(&[0xFF; 64]).unwrap();
        rogue.flush().unwrap();

        for _ in 0..SPIN_BOUND {
            b.progress();
            if b.stats().protocol_errors > 0 {
                break;
            }
            std::thread::yield_now();
        }

        let stats = b.stats();
        assert!(stats.protocol_errors >= 1);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.connections_opened, stats.connections_closed);
    }

    #[test]
    fn test_unknown_rkey_blob_rejected_at_import() {
        init_test_logging();
        let (a, b) = env_pair(FeatureSet::ALL);
        let ep = connect(&a, &b);
        assert!(matches!(
            ep.import_rkey(&[0xDE, 0xAD]),
            Err(TransportError::Endpoint { .. })
        ));
    }

    #[test]
    fn test_stats_track_fabric_activity() {
        init_test_logging();
        let (a, b) = env_pair(FeatureSet::TAG);
        let ep = connect(&a, &b);

        let sub = ep.send_tagged(1, b"ping").unwrap();
        assert_eq!(drive_to_completion(&a, &b, sub), OpStatus::Success);
        progress_until(&a, &b, || b.stats().messages_unexpected >= 1);

        let a_stats = a.stats();
        assert!(a_stats.connections_opened >= 1);
        assert!(a_stats.bytes_sent > 0);
        assert!(a_stats.progress_calls > 0);

        let b_stats = b.stats();
        assert!(b_stats.bytes_received > 0);
        assert_eq!(b_stats.messages_matched, 0);

        let msg = b.worker().probe_tagged(1, u64::MAX).unwrap().unwrap();
        let mut buf = vec![0u8; msg.len()];
        b.worker().recv_matched(msg, &mut buf).unwrap();
        assert_eq!(b.stats().messages_matched, 1);
    }
}
