use std::collections::HashSet;
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use rshuffle::common::config::{ExchangeConfig, StrategyKind, TransportConfig};
use rshuffle::common::payload::TuplePayload;
use rshuffle::exchange::{
    ExchangeContext, ExchangeSession, ExchangeStrategy, SendExchange, SessionReport, SourceTable,
    StructuredRecordBuffer, WriteExchange,
};
use rshuffle::rdma::control::ConnectionCollection;
use rshuffle::rdma::loopback::run_local_cluster;
use rshuffle::{TransError, TransResult};

type Arrival = (usize, u64, TuplePayload);

fn transport() -> TransportConfig {
    TransportConfig {
        retry_count: 500,
        retry_backoff_ms: 10,
        op_timeout_ms: Some(30_000),
        ..Default::default()
    }
}

fn exchange(strategy: StrategyKind) -> ExchangeConfig {
    ExchangeConfig {
        strategy,
        ..Default::default()
    }
}

fn row(rank: usize, key: u64) -> TuplePayload {
    TuplePayload {
        tuple_id: key * 7 + 1,
        timestamp: rank as u64,
    }
}

fn table(rank: usize, keys: impl Iterator<Item = u64>) -> SourceTable<TuplePayload> {
    let keys: Vec<u64> = keys.collect();
    let payloads = keys.iter().map(|&k| row(rank, k)).collect();
    SourceTable::new(keys, payloads).unwrap()
}

/// One session on an already connected rank; returns its report and every
/// record the processor saw.
fn session<M>(
    c: &ConnectionCollection,
    config: &ExchangeConfig,
    source: &SourceTable<TuplePayload>,
    matcher: M,
    slow: Option<Duration>,
) -> TransResult<(SessionReport, Vec<Arrival>)>
where
    M: Fn(usize, u64) -> bool + Sync,
{
    let arrived = Mutex::new(Vec::new());
    let processor = |src: usize, batch: &StructuredRecordBuffer<TuplePayload>| {
        if let Some(pause) = slow {
            thread::sleep(pause);
        }
        let mut arrived = arrived.lock().unwrap();
        arrived.extend(batch.records().into_iter().map(|(k, p)| (src, k, p)));
    };
    let range = 0..source.len();
    let report = match config.strategy {
        StrategyKind::Write => ExchangeSession::new(c, WriteExchange::setup(c, config)?)
            .run(source, range, &matcher, &processor)?,
        StrategyKind::Send => ExchangeSession::new(c, SendExchange::setup(c, config)?)
            .run(source, range, &matcher, &processor)?,
    };
    Ok((report, arrived.into_inner().unwrap()))
}

fn assert_rows(arrivals: &[Arrival]) {
    for (src, key, payload) in arrivals {
        assert_eq!(*payload, row(*src, *key), "record {} from {}", key, src);
    }
}

#[test]
fn even_keys_reach_the_peer() {
    for strategy in [StrategyKind::Write, StrategyKind::Send] {
        let config = exchange(strategy);
        let results = run_local_cluster(2, transport(), |c| {
            let source = match c.rank() {
                0 => table(0, 0..10_000),
                _ => table(1, 0..0),
            };
            session(&c, &config, &source, |peer, key| peer == 1 && key % 2 == 0, None)
        })
        .unwrap();

        let (sender, _) = &results[0];
        let (receiver, arrivals) = &results[1];
        assert_eq!(sender.records_sent, 5_000);
        assert_eq!(receiver.records_received, 5_000);
        assert!(results[0].1.is_empty());

        let mut keys: Vec<u64> = arrivals.iter().map(|(_, k, _)| *k).collect();
        keys.sort_unstable();
        assert_eq!(keys, (0..10_000).step_by(2).collect::<Vec<_>>(), "{:?}", strategy);
        assert!(arrivals.iter().all(|(src, _, _)| *src == 0));
        assert_rows(arrivals);
    }
}

#[test]
fn small_ring_wraps_many_times() {
    // 10 records per slot, 4 slots, 100 chunks
    let config = ExchangeConfig {
        slots: 4,
        buffer_bytes: 8 + 10 * 24,
        ..exchange(StrategyKind::Write)
    };
    let results = run_local_cluster(2, transport(), |c| {
        let source = table(c.rank(), 0..1_000);
        let slow = (c.rank() == 1).then(|| Duration::from_micros(200));
        session(&c, &config, &source, |_, _| true, slow)
    })
    .unwrap();

    for (rank, (report, arrivals)) in results.iter().enumerate() {
        assert_eq!(report.records_sent, 1_000);
        assert_eq!(report.records_received, 1_000);
        let unique: HashSet<u64> = arrivals.iter().map(|(_, k, _)| *k).collect();
        assert_eq!(unique.len(), 1_000, "rank {} saw duplicates", rank);
        assert_eq!(arrivals.len(), 1_000);
        assert_rows(arrivals);
    }
}

#[test]
fn hash_partition_all_to_all() {
    for strategy in [StrategyKind::Write, StrategyKind::Send] {
        let config = ExchangeConfig {
            buffer_bytes: 8 + 50 * 24,
            recv_pool: 2,
            ..exchange(strategy)
        };
        let results = run_local_cluster(4, transport(), |c| {
            let base = c.rank() as u64 * 1_000;
            let source = table(c.rank(), base..base + 1_000);
            session(&c, &config, &source, |peer, key| key % 4 == peer as u64, None)
        })
        .unwrap();

        for (rank, (report, arrivals)) in results.iter().enumerate() {
            // a quarter of every other rank's table
            assert_eq!(report.records_sent, 750, "{:?}", strategy);
            assert_eq!(report.records_received, 750);
            let keys: HashSet<u64> = arrivals.iter().map(|(_, k, _)| *k).collect();
            assert_eq!(keys.len(), 750);
            assert!(keys.iter().all(|k| k % 4 == rank as u64));
            assert!(arrivals.iter().all(|(src, k, _)| *src != rank && *k / 1_000 == *src as u64));
            assert_rows(arrivals);
            assert_eq!(report.timings().len(), 8);
        }
    }
}

#[test]
fn several_producers_per_peer() {
    let config = ExchangeConfig {
        slots: 4,
        buffer_bytes: 8 + 10 * 24,
        producers_per_peer: 3,
        ..exchange(StrategyKind::Write)
    };
    let results = run_local_cluster(3, transport(), |c| {
        let base = c.rank() as u64 * 10_000;
        let source = table(c.rank(), base..base + 2_000);
        session(&c, &config, &source, |peer, key| key % 3 == peer as u64, None)
    })
    .unwrap();

    for (rank, (report, arrivals)) in results.iter().enumerate() {
        let expected: HashSet<u64> = (0..3u64)
            .filter(|&src| src != rank as u64)
            .flat_map(|src| src * 10_000..src * 10_000 + 2_000)
            .filter(|k| k % 3 == rank as u64)
            .collect();
        let keys: Vec<u64> = arrivals.iter().map(|(_, k, _)| *k).collect();
        assert_eq!(keys.len(), expected.len(), "rank {}", rank);
        assert_eq!(keys.into_iter().collect::<HashSet<_>>(), expected);
        assert_eq!(report.records_received, expected.len());
        assert_rows(arrivals);
    }
}

#[test]
fn empty_tables_still_terminate() {
    for strategy in [StrategyKind::Write, StrategyKind::Send] {
        let config = exchange(strategy);
        let results = run_local_cluster(3, transport(), |c| {
            session(&c, &config, &table(c.rank(), 0..0), |_, _| true, None)
        })
        .unwrap();
        for (report, arrivals) in results {
            assert_eq!(report.records_sent, 0);
            assert_eq!(report.records_received, 0);
            assert!(arrivals.is_empty());
        }
    }
}

#[test]
fn sessions_leave_connections_clean() {
    let results = run_local_cluster(3, transport(), |c| {
        let source = table(c.rank(), 0..300);
        let mut moved = 0;
        for strategy in [StrategyKind::Send, StrategyKind::Write, StrategyKind::Send] {
            let (report, _) = session(&c, &exchange(strategy), &source, |peer, key| {
                key % 3 == peer as u64
            }, None)?;
            moved += report.records_received as u64;
        }
        // plain traffic still lines up afterwards
        let total = c.sum(moved, 0)?;
        c.barrier_all()?;
        Ok(total)
    })
    .unwrap();
    // each rank receives 2 x 100 records per session
    assert_eq!(results[0], Some(3 * 3 * 200));
}

#[test]
fn sub_range_only() {
    let config = exchange(StrategyKind::Send);
    let results = run_local_cluster(2, transport(), |c| {
        let source = table(c.rank(), 0..100);
        let arrived = Mutex::new(0usize);
        let processor = |_: usize, batch: &StructuredRecordBuffer<TuplePayload>| {
            assert!(batch.keys().iter().all(|k| (10..20).contains(k)));
            *arrived.lock().unwrap() += batch.count();
        };
        let report = ExchangeSession::new(&c, SendExchange::setup(&c, &config)?).run(
            &source,
            10..20,
            &|_, _| true,
            &processor,
        )?;
        assert_eq!(*arrived.lock().unwrap(), 10);
        Ok(report.records_sent)
    })
    .unwrap();
    assert_eq!(results, vec![10, 10]);
}

/// On rank 0 the stream to peer 2 breaks at once while the stream from
/// peer 1 never makes progress; every other direction closes empty.
struct BrokenOnRankZero {
    rank: usize,
}

impl ExchangeStrategy<TuplePayload> for BrokenOnRankZero {
    fn name(&self) -> &'static str {
        "broken"
    }

    fn producers(&self) -> usize {
        1
    }

    fn send_to(&self, peer: usize, _: usize, ctx: &ExchangeContext<'_, TuplePayload>) -> TransResult<usize> {
        if self.rank == 0 && peer == 2 {
            return Err(TransError::Protocol {
                peer,
                reason: "bad batch".into(),
            });
        }
        ctx.state.mark_done_sending(peer)?;
        Ok(0)
    }

    fn receive_from(&self, peer: usize, ctx: &ExchangeContext<'_, TuplePayload>) -> TransResult<usize> {
        if self.rank == 0 && peer == 1 {
            return ctx.waiter.wait_until(peer, "stalled receive", || Ok(None));
        }
        ctx.state.mark_done_receiving(peer)?;
        Ok(0)
    }
}

#[test]
fn first_failure_stops_the_session_at_once() {
    let config = TransportConfig {
        op_timeout_ms: Some(10_000),
        ..transport()
    };
    let results = run_local_cluster(3, config, |c| {
        let source = table(c.rank(), 0..0);
        let strategy = BrokenOnRankZero { rank: c.rank() };
        let started = Instant::now();
        let outcome = ExchangeSession::new(&c, strategy).run(&source, 0..0, &|_, _| true, &|_, _| {});
        Ok((outcome, started.elapsed()))
    })
    .unwrap();

    let (outcome, elapsed) = &results[0];
    assert!(
        matches!(outcome, Err(TransError::Protocol { peer: 2, .. })),
        "{:?}",
        outcome.as_ref().err()
    );
    assert!(*elapsed < Duration::from_secs(2), "took {:?}", elapsed);
    assert!(results[1..].iter().all(|(outcome, _)| outcome.is_ok()));
}

#[test]
fn departed_peer_fails_the_flag_poll() {
    let config = exchange(StrategyKind::Write);
    let transport = TransportConfig {
        op_timeout_ms: Some(10_000),
        ..transport()
    };
    let result = run_local_cluster(2, transport, |c| {
        if c.rank() == 1 {
            // set up, meet the session's opening barrier, then vanish
            let _rings = WriteExchange::<TuplePayload>::setup(&c, &config)?;
            c.barrier_all()?;
            thread::sleep(Duration::from_millis(300));
            return Ok(());
        }
        let started = Instant::now();
        let err = session(&c, &config, &table(0, 0..0), |_, _| true, None).unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(5), "took {:?}", started.elapsed());
        Err(err)
    });
    assert!(
        matches!(result, Err(TransError::Completion { peer: 1, .. })),
        "{:?}",
        result
    );
}
