use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use rshuffle::common::config::{ClusterConfig, TransportConfig};
use rshuffle::common::membership::{StaticAddressTable, StaticMembership};
use rshuffle::common::region::RemoteRegionToken;
use rshuffle::rdma::connection::Role;
use rshuffle::rdma::control::ConnectionCollection;
use rshuffle::rdma::loopback::{run_local_cluster, LoopbackFabric};
use rshuffle::TransError;

fn transport() -> TransportConfig {
    TransportConfig {
        retry_count: 500,
        retry_backoff_ms: 10,
        op_timeout_ms: Some(30_000),
        ..Default::default()
    }
}

#[test]
fn lower_rank_accepts() {
    assert_eq!(Role::for_pair(0, 1), Role::Acceptor);
    assert_eq!(Role::for_pair(3, 1), Role::Connector);

    let roles = run_local_cluster(4, transport(), |c| {
        Ok(c.peers()
            .map(|p| (c.rank(), p, c.connection(p).unwrap().role()))
            .collect::<Vec<_>>())
    })
    .unwrap();
    for (rank, peer, role) in roles.into_iter().flatten() {
        let expected = if rank < peer { Role::Acceptor } else { Role::Connector };
        assert_eq!(role, expected, "rank {} towards {}", rank, peer);
    }
}

#[test]
fn barrier_waits_for_the_peer() {
    let arrivals = AtomicUsize::new(0);
    run_local_cluster(2, transport(), |c| {
        let conn = c.connection(1 - c.rank())?;
        if c.rank() == 1 {
            thread::sleep(Duration::from_millis(100));
        }
        arrivals.fetch_add(1, Ordering::SeqCst);
        conn.barrier()?;
        assert_eq!(arrivals.load(Ordering::SeqCst), 2);
        Ok(())
    })
    .unwrap();
}

#[test]
fn barrier_survives_many_rounds() {
    // more rounds than an 8-bit counter holds
    let arrivals = AtomicUsize::new(0);
    run_local_cluster(2, transport(), |c| {
        let conn = c.connection(1 - c.rank())?;
        for round in 0..300 {
            arrivals.fetch_add(1, Ordering::SeqCst);
            conn.barrier()?;
            assert!(arrivals.load(Ordering::SeqCst) >= 2 * (round + 1));
        }
        Ok(())
    })
    .unwrap();
}

#[test]
fn buffered_transfer_drains_its_receives() {
    let config = TransportConfig {
        bulk_pool: 3,
        bulk_chunk_bytes: 16 + 8 * 100,
        ..transport()
    };
    run_local_cluster(2, config, |c| {
        let conn = c.connection(1 - c.rank())?;
        let data: Vec<u64> = (0..10_000).map(|i| i * 3).collect();
        if c.rank() == 0 {
            conn.send_buffered(&data)?;
            let msg = conn.allocate_buffer(8)?;
            msg.store_u64(0, 99);
            conn.send_blocking(&msg)?;
        } else {
            let mut out = vec![0u64; data.len()];
            assert_eq!(conn.recv_buffered(&mut out)?, data.len());
            assert_eq!(out, data);

            // no bulk receive is left posted to swallow this
            let msg = conn.allocate_buffer(8)?;
            assert_eq!(conn.post_and_receive_blocking(&msg)?, 8);
            assert_eq!(msg.load_u64(0), 99);
        }
        Ok(())
    })
    .unwrap();
}

#[test]
fn one_sided_access_through_a_token() {
    run_local_cluster(2, transport(), |c| {
        let conn = c.connection(1 - c.rank())?;
        if c.rank() == 0 {
            let target = conn.allocate_buffer(16)?;
            let blob = conn.allocate_buffer(RemoteRegionToken::WIRE_LEN)?;
            let mut raw = vec![0u8; RemoteRegionToken::WIRE_LEN];
            target.export_token().encode(&mut raw);
            blob.write(0, &raw);
            conn.send_blocking(&blob)?;

            conn.barrier()?;
            assert_eq!(target.load_u64(0), 0xfeed);
            assert_eq!(target.load_u64(8), 5);

            drop(target);
            conn.barrier()?;
            conn.barrier()?;
        } else {
            let blob = conn.allocate_buffer(RemoteRegionToken::WIRE_LEN)?;
            conn.post_and_receive_blocking(&blob)?;
            let raw = blob.to_vec(0, RemoteRegionToken::WIRE_LEN);
            let token = RemoteRegionToken::decode(&raw).unwrap();
            assert_eq!(token.size(), 16);

            let local = conn.allocate_buffer(8)?;
            local.store_u64(0, 0xfeed);
            conn.write_range_blocking(&local, 0, &token, 0, 8)?;
            assert_eq!(conn.compare_swap_blocking(&token, 8, 0, 5)?, 0);
            assert_eq!(conn.compare_swap_blocking(&token, 8, 0, 6)?, 5);

            let back = conn.allocate_buffer(16)?;
            conn.read_blocking(&back, &token)?;
            assert_eq!(back.load_u64(0), 0xfeed);
            conn.barrier()?;

            // the owner revoked the region
            conn.barrier()?;
            let err = conn.write_range_blocking(&local, 0, &token, 0, 8).unwrap_err();
            assert!(matches!(err, TransError::Completion { peer: 0, .. }), "{}", err);
            conn.barrier()?;
        }
        Ok(())
    })
    .unwrap();
}

#[test]
fn missing_peer_is_a_setup_failure() {
    let config = TransportConfig {
        retry_count: 3,
        retry_backoff_ms: 5,
        ..Default::default()
    };
    let fabric = LoopbackFabric::new();
    let table = StaticAddressTable::from(&ClusterConfig::local(2, 9100, 2).unwrap());
    let membership = StaticMembership::new(0, 2).unwrap();
    let err = ConnectionCollection::connect(&membership, &table, &fabric, config)
        .err()
        .unwrap();
    assert!(matches!(err, TransError::Setup { peer: 1, op: "accept", .. }), "{}", err);
}

#[test]
fn silent_peer_times_out() {
    let config = TransportConfig {
        op_timeout_ms: Some(200),
        ..transport()
    };
    let result = run_local_cluster(2, config, |c| {
        if c.rank() == 0 {
            c.connection(1)?.barrier()?;
        } else {
            thread::sleep(Duration::from_secs(1));
        }
        Ok(())
    });
    assert!(matches!(result, Err(TransError::Timeout { peer: 1, op: "barrier" })));
}

#[test]
fn departed_peer_fails_the_barrier() {
    let config = TransportConfig {
        op_timeout_ms: Some(10_000),
        ..transport()
    };
    let result = run_local_cluster(2, config, |c| {
        if c.rank() == 0 {
            let started = Instant::now();
            let err = c.connection(1)?.barrier().unwrap_err();
            assert!(started.elapsed() < Duration::from_secs(5), "took {:?}", started.elapsed());
            return Err(err);
        }
        // leave without ever notifying rank 0
        thread::sleep(Duration::from_millis(100));
        Ok(())
    });
    assert!(
        matches!(result, Err(TransError::Completion { peer: 1, op: "barrier", .. })),
        "{:?}",
        result
    );
}

#[test]
fn notification_before_leaving_still_counts() {
    run_local_cluster(2, transport(), |c| {
        let conn = c.connection(1 - c.rank())?;
        if c.rank() == 1 {
            conn.send_notification()?;
            return Ok(());
        }
        thread::sleep(Duration::from_millis(200));
        assert!(!conn.is_connected());
        conn.wait_for_notification()
    })
    .unwrap();
}
