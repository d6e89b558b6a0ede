pub mod record_buffer;
pub mod send_exchange;
pub mod write_exchange;

use std::marker::PhantomData;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, error, info};
use serde_derive::Serialize;

use crate::common::payload::Payload;
use crate::common::poller::{CancelToken, Waiter};
use crate::rdma::control::{first_root_cause, ConnectionCollection};
use crate::{TransError, TransResult};

pub use record_buffer::StructuredRecordBuffer;
pub use send_exchange::SendExchange;
pub use write_exchange::WriteExchange;

/// Selects the records peer `peer` should receive.
pub type Matcher<'m> = dyn Fn(usize, u64) -> bool + Sync + 'm;

/// Consumes a batch that arrived from `source_peer`. May borrow the
/// caller's sink.
pub type Processor<'m, P> = dyn Fn(usize, &StructuredRecordBuffer<P>) + Sync + 'm;

/// Records on the sending side. Only ever read by a session.
pub struct SourceTable<P> {
    keys: Vec<u64>,
    payloads: Vec<P>,
}

impl<P: Payload> SourceTable<P> {
    pub fn new(keys: Vec<u64>, payloads: Vec<P>) -> TransResult<Self> {
        if keys.len() != payloads.len() {
            return Err(TransError::Config(format!(
                "{} keys for {} payloads",
                keys.len(),
                payloads.len()
            )));
        }
        Ok(Self { keys, payloads })
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    #[inline]
    pub fn keys(&self) -> &[u64] {
        &self.keys
    }

    #[inline]
    pub fn payloads(&self) -> &[P] {
        &self.payloads
    }

    /// Pack matching records from `*cursor` on until `batch` is full or
    /// `end` is reached. Returns how many were packed.
    pub fn pack_into<F>(
        &self,
        batch: &mut StructuredRecordBuffer<P>,
        cursor: &mut usize,
        end: usize,
        matches: F,
    ) -> usize
    where
        F: Fn(u64) -> bool,
    {
        let before = batch.filled();
        while *cursor < end && !batch.is_full() {
            let i = *cursor;
            *cursor += 1;
            if matches(self.keys[i]) {
                batch.push(self.keys[i], &self.payloads[i]);
            }
        }
        batch.filled() - before
    }
}

/// A failing worker cancels the collection on the spot; workers blocked on
/// other peers then unwind with `Cancelled`.
fn cancel_on_error<T>(cancel: &CancelToken, outcome: TransResult<T>) -> TransResult<T> {
    if outcome.is_err() {
        cancel.cancel();
    }
    outcome
}

/// Shared state of one session run: the start gate, per-direction
/// termination flags and timings.
pub struct SessionState {
    size: usize,
    start_gate: AtomicBool,
    done_sending: Vec<AtomicBool>,
    done_receiving: Vec<AtomicBool>,
    producers_finished: Vec<AtomicUsize>,
    timings: Mutex<Vec<Duration>>,
}

impl SessionState {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            start_gate: AtomicBool::new(false),
            done_sending: (0..size).map(|_| AtomicBool::new(false)).collect(),
            done_receiving: (0..size).map(|_| AtomicBool::new(false)).collect(),
            producers_finished: (0..size).map(|_| AtomicUsize::new(0)).collect(),
            timings: Mutex::new(vec![Duration::ZERO; 2 * size]),
        }
    }

    pub fn open_gate(&self) {
        self.start_gate.store(true, Ordering::Release);
    }

    pub fn wait_gate(&self, waiter: &Waiter, peer: usize) -> TransResult<()> {
        waiter.wait_until(peer, "start gate", || {
            Ok(self.start_gate.load(Ordering::Acquire).then_some(()))
        })
    }

    fn transition(flags: &[AtomicBool], peer: usize, what: &str) -> TransResult<()> {
        if flags[peer].swap(true, Ordering::AcqRel) {
            return Err(TransError::Protocol {
                peer,
                reason: format!("{} terminated twice", what),
            });
        }
        Ok(())
    }

    pub fn mark_done_sending(&self, peer: usize) -> TransResult<()> {
        Self::transition(&self.done_sending, peer, "stream to peer")
    }

    pub fn mark_done_receiving(&self, peer: usize) -> TransResult<()> {
        Self::transition(&self.done_receiving, peer, "stream from peer")
    }

    #[inline]
    pub fn is_done_sending(&self, peer: usize) -> bool {
        self.done_sending[peer].load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_done_receiving(&self, peer: usize) -> bool {
        self.done_receiving[peer].load(Ordering::Acquire)
    }

    /// Counts a producer of `peer`'s stream as finished; returns how many
    /// have finished including this one.
    pub fn finish_producer(&self, peer: usize) -> usize {
        self.producers_finished[peer].fetch_add(1, Ordering::AcqRel) + 1
    }

    fn record_send(&self, peer: usize, elapsed: Duration) {
        let mut timings = self.timings.lock().unwrap();
        timings[peer] = timings[peer].max(elapsed);
    }

    fn record_recv(&self, peer: usize, elapsed: Duration) {
        self.timings.lock().unwrap()[self.size + peer] = elapsed;
    }
}

/// What a strategy needs from the session for one worker.
pub struct ExchangeContext<'a, P> {
    pub table: &'a SourceTable<P>,
    pub range: Range<usize>,
    pub matcher: &'a Matcher<'a>,
    pub processor: &'a Processor<'a, P>,
    pub state: &'a SessionState,
    pub waiter: Waiter,
}

impl<'a, P> ExchangeContext<'a, P> {
    /// The part of the range producer `producer` of `producers` owns.
    pub fn producer_range(&self, producer: usize, producers: usize) -> Range<usize> {
        let len = self.range.end - self.range.start;
        let start = self.range.start + len * producer / producers;
        let end = self.range.start + len * (producer + 1) / producers;
        start..end
    }
}

/// A wire protocol that moves records between every ordered pair.
pub trait ExchangeStrategy<P: Payload>: Sync {
    fn name(&self) -> &'static str;

    /// Sender tasks per destination peer.
    fn producers(&self) -> usize;

    /// Stream this producer's share of the range to `peer`. Returns the
    /// number of records sent.
    fn send_to(&self, peer: usize, producer: usize, ctx: &ExchangeContext<'_, P>) -> TransResult<usize>;

    /// Drain everything `peer` sends. Returns the number of records
    /// handed to the processor.
    fn receive_from(&self, peer: usize, ctx: &ExchangeContext<'_, P>) -> TransResult<usize>;
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct SessionReport {
    pub strategy: String,
    pub send_time: Duration,
    pub recv_time: Duration,
    pub records_sent: usize,
    pub records_received: usize,
    timings: Vec<Duration>,
}

impl SessionReport {
    /// Send time per destination, then receive time per source; the own
    /// rank's entries stay zero.
    pub fn timings(&self) -> &[Duration] {
        &self.timings
    }
}

pub struct ExchangeSession<'c, P, S> {
    collection: &'c ConnectionCollection,
    strategy: S,
    _payload: PhantomData<P>,
}

impl<'c, P, S> ExchangeSession<'c, P, S>
where
    P: Payload,
    S: ExchangeStrategy<P>,
{
    pub fn new(collection: &'c ConnectionCollection, strategy: S) -> Self {
        Self {
            collection,
            strategy,
            _payload: PhantomData,
        }
    }

    #[inline]
    pub fn strategy(&self) -> &S {
        &self.strategy
    }

    /// Shuffle `table[range]` to every peer and feed what arrives to
    /// `processor`. One sender task per (peer, producer) and one receiver
    /// task per peer; the first failure cancels the collection.
    pub fn run(
        &self,
        table: &SourceTable<P>,
        range: Range<usize>,
        matcher: &Matcher<'_>,
        processor: &Processor<'_, P>,
    ) -> TransResult<SessionReport> {
        if range.start > range.end || range.end > table.len() {
            return Err(TransError::Config(format!(
                "range {:?} outside a table of {}",
                range,
                table.len()
            )));
        }
        let collection = self.collection;
        let state = SessionState::new(collection.size());
        collection.barrier_all()?;

        let sent = AtomicUsize::new(0);
        let received = AtomicUsize::new(0);
        let cancel = collection.cancel_token();
        let ctx = |waiter: Waiter| ExchangeContext {
            table,
            range: range.clone(),
            matcher,
            processor,
            state: &state,
            waiter,
        };

        let errors: Vec<TransError> = thread::scope(|s| {
            let mut workers = Vec::new();
            for peer in collection.peers() {
                for producer in 0..self.strategy.producers() {
                    let ctx = ctx(collection.waiter());
                    let (sent, strategy) = (&sent, &self.strategy);
                    workers.push(s.spawn(move || -> TransResult<()> {
                        let outcome = ctx.state.wait_gate(&ctx.waiter, peer).and_then(|()| {
                            let start = Instant::now();
                            strategy
                                .send_to(peer, producer, &ctx)
                                .map(|n| (n, start.elapsed()))
                        });
                        let (n, elapsed) = cancel_on_error(cancel, outcome)?;
                        ctx.state.record_send(peer, elapsed);
                        sent.fetch_add(n, Ordering::Relaxed);
                        debug!("producer {} finished {} records to peer {}", producer, n, peer);
                        Ok(())
                    }));
                }

                let ctx = ctx(collection.waiter());
                let (received, strategy) = (&received, &self.strategy);
                workers.push(s.spawn(move || -> TransResult<()> {
                    let outcome = ctx.state.wait_gate(&ctx.waiter, peer).and_then(|()| {
                        let start = Instant::now();
                        strategy
                            .receive_from(peer, &ctx)
                            .map(|n| (n, start.elapsed()))
                    });
                    let (n, elapsed) = cancel_on_error(cancel, outcome)?;
                    ctx.state.record_recv(peer, elapsed);
                    received.fetch_add(n, Ordering::Relaxed);
                    debug!("drained {} records from peer {}", n, peer);
                    Ok(())
                }));
            }
            state.open_gate();

            workers
                .into_iter()
                .filter_map(|w| {
                    let result: TransResult<()> = match w.join() {
                        Ok(result) => result,
                        Err(panic) => {
                            cancel.cancel();
                            std::panic::resume_unwind(panic)
                        }
                    };
                    result
                        .map_err(|e| {
                            if !e.is_cancelled() {
                                error!("exchange worker failed: {}", e);
                            }
                            e
                        })
                        .err()
                })
                .collect()
        });
        if let Some(e) = first_root_cause(errors) {
            return Err(e);
        }

        for peer in collection.peers() {
            if !state.is_done_sending(peer) || !state.is_done_receiving(peer) {
                return Err(TransError::Protocol {
                    peer,
                    reason: "session ended with an open direction".into(),
                });
            }
        }

        let timings = state.timings.into_inner().unwrap();
        let size = collection.size();
        let report = SessionReport {
            strategy: self.strategy.name().to_string(),
            send_time: timings[..size].iter().copied().max().unwrap_or_default(),
            recv_time: timings[size..].iter().copied().max().unwrap_or_default(),
            records_sent: sent.into_inner(),
            records_received: received.into_inner(),
            timings,
        };
        info!(
            "{} exchange on rank {}: sent {} records in {:?}, received {} in {:?}",
            report.strategy,
            collection.rank(),
            report.records_sent,
            report.send_time,
            report.records_received,
            report.recv_time
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rdma::loopback::LoopbackFabric;
    use crate::rdma::Transport;

    #[test]
    fn table_lengths_must_agree() {
        assert!(SourceTable::<u64>::new(vec![1, 2], vec![1]).is_err());
    }

    #[test]
    fn pack_stops_when_full() {
        let domain = LoopbackFabric::new().open_domain("lo").unwrap();
        let table = SourceTable::new((0..10).collect(), (100..110u64).collect()).unwrap();
        let mut batch = StructuredRecordBuffer::<u64>::allocate(&domain, 2).unwrap();
        batch.clear();
        let mut cursor = 0;
        assert_eq!(table.pack_into(&mut batch, &mut cursor, 10, |k| k % 2 == 1), 2);
        // stopped right after key 3
        assert_eq!(cursor, 4);
        batch.seal();
        assert_eq!(batch.records(), vec![(1, 101), (3, 103)]);
    }

    #[test]
    fn termination_transitions_once() {
        let state = SessionState::new(3);
        state.mark_done_sending(1).unwrap();
        assert!(state.is_done_sending(1));
        assert!(matches!(
            state.mark_done_sending(1),
            Err(TransError::Protocol { peer: 1, .. })
        ));
        assert!(!state.is_done_receiving(1));
    }

    #[test]
    fn producer_ranges_cover_the_range() {
        let state = SessionState::new(1);
        let table = SourceTable::<u64>::new(vec![], vec![]).unwrap();
        let matcher = |_: usize, _: u64| true;
        let processor = |_: usize, _: &StructuredRecordBuffer<u64>| {};
        let ctx = ExchangeContext {
            table: &table,
            range: 10..21,
            matcher: &matcher,
            processor: &processor,
            state: &state,
            waiter: Waiter::new(&Default::default(), Default::default()),
        };
        let parts: Vec<_> = (0..3).map(|p| ctx.producer_range(p, 3)).collect();
        assert_eq!(parts, vec![10..13, 13..17, 17..21]);
    }
}
