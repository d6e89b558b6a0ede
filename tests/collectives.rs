use std::sync::atomic::{AtomicUsize, Ordering};

use rshuffle::common::config::TransportConfig;
use rshuffle::common::payload::TuplePayload;
use rshuffle::rdma::loopback::run_local_cluster;

fn transport() -> TransportConfig {
    TransportConfig {
        retry_count: 500,
        retry_backoff_ms: 10,
        op_timeout_ms: Some(30_000),
        bulk_pool: 2,
        bulk_chunk_bytes: 16 + 8 * 64,
        ..Default::default()
    }
}

#[test]
fn gather_lands_in_rank_order() {
    let results = run_local_cluster(4, transport(), |c| {
        let r = c.rank() as u64;
        c.gather(&[r * 10, r * 10 + 1], 2)
    })
    .unwrap();
    for (rank, result) in results.into_iter().enumerate() {
        if rank == 2 {
            assert_eq!(result, Some(vec![0, 1, 10, 11, 20, 21, 30, 31]));
        } else {
            assert_eq!(result, None);
        }
    }
}

#[test]
fn gather_of_many_chunks() {
    // far more elements than one bulk buffer carries
    let results = run_local_cluster(3, transport(), |c| {
        let base = c.rank() as u64 * 1_000;
        let local: Vec<u64> = (base..base + 1_000).collect();
        c.gather(&local, 0)
    })
    .unwrap();
    let expected: Vec<u64> = (0..3_000).collect();
    assert_eq!(results[0].as_ref(), Some(&expected));
}

#[test]
fn gather_dif_keeps_each_length() {
    let results = run_local_cluster(4, transport(), |c| {
        let local = vec![c.rank() as u64; c.rank() * 100];
        c.gather_dif(&local, 0)
    })
    .unwrap();
    let parts = results[0].as_ref().unwrap();
    assert_eq!(parts.len(), 4);
    for (rank, part) in parts.iter().enumerate() {
        assert_eq!(part.len(), rank * 100);
        assert!(part.iter().all(|&v| v == rank as u64));
    }
    assert!(results[1..].iter().all(Option::is_none));
}

#[test]
fn all_gather_reaches_everyone() {
    let results = run_local_cluster(3, transport(), |c| {
        c.all_gather(&[TuplePayload {
            tuple_id: c.rank() as u64,
            timestamp: 7,
        }])
    })
    .unwrap();
    for all in results {
        let ids: Vec<u64> = all.iter().map(|t| t.tuple_id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert!(all.iter().all(|t| t.timestamp == 7));
    }
}

#[test]
fn bcast_from_a_middle_rank() {
    let results = run_local_cluster(4, transport(), |c| {
        let mut data = if c.rank() == 1 {
            (0..1_000u64).map(|i| i * i).collect()
        } else {
            vec![0u64; 1_000]
        };
        c.bcast(&mut data, 1)?;
        Ok(data)
    })
    .unwrap();
    let expected: Vec<u64> = (0..1_000u64).map(|i| i * i).collect();
    for data in results {
        assert_eq!(data, expected);
    }
}

#[test]
fn barrier_all_holds_every_rank() {
    for size in 1..=4 {
        let arrivals = AtomicUsize::new(0);
        run_local_cluster(size, transport(), |c| {
            for round in 1..=20 {
                arrivals.fetch_add(1, Ordering::SeqCst);
                c.barrier_all()?;
                assert!(arrivals.load(Ordering::SeqCst) >= round * size);
            }
            Ok(())
        })
        .unwrap();
    }
}

#[test]
fn sum_at_target() {
    let results = run_local_cluster(4, transport(), |c| c.sum(c.rank() as u64 + 1, 3)).unwrap();
    assert_eq!(results, vec![None, None, None, Some(10)]);
}

#[test]
fn collectives_interleave() {
    let results = run_local_cluster(3, transport(), |c| {
        let total = c.sum(5u32, 0)?;
        c.barrier_all()?;
        let all = c.all_gather(&[c.rank() as u32])?;
        c.barrier_all()?;
        Ok((total, all))
    })
    .unwrap();
    assert_eq!(results[0].0, Some(15));
    for (_, all) in results {
        assert_eq!(all, vec![0, 1, 2]);
    }
}
