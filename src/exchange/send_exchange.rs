//! Shuffle over two-sided sends only.
//!
//! The receiver keeps `K` batches posted per peer. The sender streams full
//! (or final partial) batches and closes with exactly `K` zero-count
//! messages, one for every receive that may still be posted. A receive that
//! delivered a terminal is not reposted, so after `K` terminals the link
//! has no receive left outstanding.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use log::debug;

use super::record_buffer::{byte_size_for, capacity_for, StructuredRecordBuffer, RECORD_HEADER_SIZE};
use super::{ExchangeContext, ExchangeStrategy};
use crate::common::config::ExchangeConfig;
use crate::common::payload::Payload;
use crate::rdma::connection::Connection;
use crate::rdma::control::ConnectionCollection;
use crate::rdma::request::RequestToken;
use crate::{TransError, TransResult};

struct SendSlot<P> {
    records: StructuredRecordBuffer<P>,
    token: Arc<RequestToken>,
}

struct PeerPools<P> {
    conn: Arc<Connection>,
    outgoing: Mutex<Vec<SendSlot<P>>>,
    incoming: Mutex<Vec<StructuredRecordBuffer<P>>>,
}

pub struct SendExchange<P> {
    pool: usize,
    capacity: usize,
    peers: Vec<Option<PeerPools<P>>>,
}

impl<P: Payload> SendExchange<P> {
    pub fn setup(collection: &ConnectionCollection, config: &ExchangeConfig) -> TransResult<Self> {
        config.validate(P::WIRE_LEN)?;
        let pool = config.recv_pool;
        let capacity = capacity_for(config.buffer_bytes, P::WIRE_LEN);
        let domain = collection.domain();

        let mut peers: Vec<Option<PeerPools<P>>> = (0..collection.size()).map(|_| None).collect();
        for peer in collection.peers() {
            let outgoing = (0..pool)
                .map(|_| {
                    Ok(SendSlot {
                        records: StructuredRecordBuffer::allocate(domain, capacity)?,
                        token: RequestToken::new(),
                    })
                })
                .collect::<TransResult<Vec<_>>>()?;
            let incoming = (0..pool)
                .map(|_| StructuredRecordBuffer::allocate(domain, capacity))
                .collect::<TransResult<Vec<_>>>()?;
            peers[peer] = Some(PeerPools {
                conn: collection.connection(peer)?.clone(),
                outgoing: Mutex::new(outgoing),
                incoming: Mutex::new(incoming),
            });
        }
        debug!(
            "send exchange ready on rank {}: {} buffers of {} records per peer",
            collection.rank(),
            pool,
            capacity
        );
        Ok(Self {
            pool,
            capacity,
            peers,
        })
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn pools(&self, peer: usize) -> TransResult<&PeerPools<P>> {
        self.peers
            .get(peer)
            .and_then(|p| p.as_ref())
            .ok_or_else(|| TransError::Config(format!("no buffer pool set up with peer {}", peer)))
    }
}

impl<P: Payload> ExchangeStrategy<P> for SendExchange<P> {
    fn name(&self) -> &'static str {
        "send"
    }

    fn producers(&self) -> usize {
        1
    }

    fn send_to(&self, peer: usize, _producer: usize, ctx: &ExchangeContext<'_, P>) -> TransResult<usize> {
        let pools = self.pools(peer)?;
        let conn = &pools.conn;
        let mut outgoing = pools.outgoing.lock().unwrap();
        let mut cursor = ctx.range.start;
        let mut sent = 0;
        let mut next = 0;

        while cursor < ctx.range.end {
            let slot = &mut outgoing[next];
            next = (next + 1) % self.pool;
            conn.wait(&slot.token, "send")?;

            slot.records.clear();
            let packed = ctx
                .table
                .pack_into(&mut slot.records, &mut cursor, ctx.range.end, |key| {
                    (ctx.matcher)(peer, key)
                });
            if packed == 0 {
                // a zero count means end of stream
                continue;
            }
            let wire = slot.records.seal();
            conn.send_range(slot.records.buffer(), 0, wire, &slot.token)?;
            sent += packed;
        }

        for slot in outgoing.iter() {
            conn.wait(&slot.token, "send")?;
        }
        let terminal = &mut outgoing[0];
        terminal.records.clear();
        terminal.records.seal();
        for _ in 0..self.pool {
            conn.send_range_blocking(terminal.records.buffer(), 0, RECORD_HEADER_SIZE)?;
        }
        ctx.state.mark_done_sending(peer)?;
        Ok(sent)
    }

    fn receive_from(&self, peer: usize, ctx: &ExchangeContext<'_, P>) -> TransResult<usize> {
        let pools = self.pools(peer)?;
        let conn = &pools.conn;
        let incoming = pools.incoming.lock().unwrap();

        let mut posted = VecDeque::with_capacity(self.pool);
        for batch in incoming.iter() {
            let token = RequestToken::new();
            conn.post_receive(batch.buffer(), &token)?;
            posted.push_back((batch, token));
        }

        let mut terminals = 0;
        let mut received = 0;
        while terminals < self.pool {
            let (batch, token) = match posted.pop_front() {
                Some(entry) => entry,
                None => break,
            };
            let len = conn.wait(&token, "batch receive")?;
            if len < RECORD_HEADER_SIZE {
                return Err(TransError::Protocol {
                    peer,
                    reason: format!("batch of {} bytes has no header", len),
                });
            }
            let count = batch.checked_count(peer)?;
            if len < byte_size_for(count, P::WIRE_LEN) {
                return Err(TransError::Protocol {
                    peer,
                    reason: format!("batch of {} bytes is shorter than its header says", len),
                });
            }
            if count == 0 {
                terminals += 1;
                continue;
            }
            (ctx.processor)(peer, batch);
            received += count;

            conn.post_receive(batch.buffer(), &token)?;
            posted.push_back((batch, token));
        }
        ctx.state.mark_done_receiving(peer)?;
        Ok(received)
    }
}
