//! Shuffle over one-sided writes into a ring of remotely-writable slots.
//!
//! Per directed pair the receiver owns `M` record slots and one buffer with
//! the `M` flag cells. The sender refreshes its view of all flags with a
//! single read whenever its cursor wraps to slot 0, packs a READY slot,
//! writes it, then writes the slot's flag: USED while more follows, DONE for
//! the last chunk. The receiver polls its flags, hands USED/DONE slots to
//! the processor and resets them to READY locally.

use std::iter;
use std::sync::{Arc, Mutex};

use log::debug;

use super::record_buffer::{byte_size_for, capacity_for, StructuredRecordBuffer};
use super::{ExchangeContext, ExchangeStrategy};
use crate::common::config::ExchangeConfig;
use crate::common::payload::Payload;
use crate::common::region::{RegisteredBuffer, RemoteRegionToken};
use crate::rdma::connection::Connection;
use crate::rdma::control::ConnectionCollection;
use crate::rdma::request::RequestToken;
use crate::{
    TransError, TransResult, BUFFER_BEING_PROCESSED_FLAG, BUFFER_READY_FLAG,
    BUFFER_USED_FLAG, BUFFER_USED_SENDER_DONE, FLAG_CELL_SIZE,
};

// what a peer writes into
struct Inbound<P> {
    slots: Vec<StructuredRecordBuffer<P>>,
    flags: RegisteredBuffer,
}

struct SlotStage<P> {
    records: StructuredRecordBuffer<P>,
    write_token: Arc<RequestToken>,
    flag_token: Arc<RequestToken>,
    flag_scratch: RegisteredBuffer,
}

// what we write into at a peer
struct Outbound<P> {
    slot_tokens: Vec<RemoteRegionToken>,
    flag_token: RemoteRegionToken,
    stages: Vec<Mutex<SlotStage<P>>>,
}

/// Local copy of a peer's flag array plus the flag writes not yet
/// known to have landed. One per producer task.
struct ProducerView {
    flags: RegisteredBuffer,
    next: usize,
    pending: Vec<Arc<RequestToken>>,
}

impl ProducerView {
    fn refresh(&mut self, conn: &Connection, flag_token: &RemoteRegionToken) -> TransResult<()> {
        for token in self.pending.drain(..) {
            conn.wait(&token, "flag write")?;
        }
        conn.read_blocking(&self.flags, flag_token)
    }
}

pub struct WriteExchange<P> {
    slots: usize,
    producers: usize,
    capacity: usize,
    connections: Vec<Option<Arc<Connection>>>,
    inbound: Vec<Option<Inbound<P>>>,
    outbound: Vec<Option<Outbound<P>>>,
}

impl<P: Payload> WriteExchange<P> {
    /// Allocate every ring and swap region tokens with every peer. All
    /// ranks call this together.
    pub fn setup(collection: &ConnectionCollection, config: &ExchangeConfig) -> TransResult<Self> {
        config.validate(P::WIRE_LEN)?;
        let (size, slots) = (collection.size(), config.slots);
        let capacity = capacity_for(config.buffer_bytes, P::WIRE_LEN);
        let blob_len = (slots + 1) * RemoteRegionToken::WIRE_LEN;
        let domain = collection.domain();

        let mut connections: Vec<Option<Arc<Connection>>> = vec![None; size];
        let mut inbound: Vec<Option<Inbound<P>>> = (0..size).map(|_| None).collect();
        let mut outbound: Vec<Option<Outbound<P>>> = (0..size).map(|_| None).collect();

        // receives for every peer go up before any blob is sent
        let mut pending = Vec::new();
        for peer in collection.peers() {
            let conn = collection.connection(peer)?.clone();
            let ring = (0..slots)
                .map(|_| StructuredRecordBuffer::allocate(domain, capacity))
                .collect::<TransResult<Vec<_>>>()?;
            let flags = RegisteredBuffer::allocate(domain, slots * FLAG_CELL_SIZE)?;
            let inbox = conn.allocate_buffer(blob_len)?;
            let token = RequestToken::new();
            conn.post_receive(&inbox, &token)?;

            pending.push((peer, inbox, token));
            inbound[peer] = Some(Inbound { slots: ring, flags });
            connections[peer] = Some(conn);
        }

        for peer in collection.peers() {
            let (conn, ring) = match (&connections[peer], &inbound[peer]) {
                (Some(conn), Some(ring)) => (conn, ring),
                _ => continue,
            };
            let tokens: Vec<_> = ring
                .slots
                .iter()
                .map(|slot| slot.export_token())
                .chain(iter::once(ring.flags.export_token()))
                .collect();
            let outbox = conn.allocate_buffer(blob_len)?;
            outbox.write(0, &RemoteRegionToken::encode_all(&tokens));
            conn.send_blocking(&outbox)?;
        }

        for (peer, inbox, token) in pending {
            let conn = collection.connection(peer)?;
            let len = conn.wait(&token, "token exchange")?;
            let mut tokens = RemoteRegionToken::decode_all(&inbox.to_vec(0, len), slots + 1)
                .ok_or_else(|| TransError::Protocol {
                    peer,
                    reason: format!("token blob of {} bytes for {} slots", len, slots),
                })?;
            let flag_token = tokens.pop().ok_or_else(|| TransError::Protocol {
                peer,
                reason: "token blob without a flag buffer".into(),
            })?;
            let needed = byte_size_for(capacity, P::WIRE_LEN);
            if flag_token.size() < slots * FLAG_CELL_SIZE || tokens.iter().any(|t| t.size() < needed) {
                return Err(TransError::Protocol {
                    peer,
                    reason: "peer rings are smaller than ours".into(),
                });
            }

            let stages = (0..slots)
                .map(|_| {
                    Ok(Mutex::new(SlotStage {
                        records: StructuredRecordBuffer::allocate(domain, capacity)?,
                        write_token: RequestToken::new(),
                        flag_token: RequestToken::new(),
                        flag_scratch: RegisteredBuffer::allocate(domain, FLAG_CELL_SIZE)?,
                    }))
                })
                .collect::<TransResult<Vec<_>>>()?;
            outbound[peer] = Some(Outbound {
                slot_tokens: tokens,
                flag_token,
                stages,
            });
        }

        debug!(
            "write exchange ready on rank {}: {} slots of {} records per peer",
            collection.rank(),
            slots,
            capacity
        );
        Ok(Self {
            slots,
            producers: config.producers_per_peer,
            capacity,
            connections,
            inbound,
            outbound,
        })
    }

    /// Records per slot.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn connection(&self, peer: usize) -> TransResult<&Arc<Connection>> {
        self.connections
            .get(peer)
            .and_then(|c| c.as_ref())
            .ok_or_else(|| TransError::Config(format!("no ring set up with peer {}", peer)))
    }

    fn outbound(&self, peer: usize) -> TransResult<&Outbound<P>> {
        self.outbound
            .get(peer)
            .and_then(|o| o.as_ref())
            .ok_or_else(|| TransError::Config(format!("no ring set up with peer {}", peer)))
    }

    fn inbound(&self, peer: usize) -> TransResult<&Inbound<P>> {
        self.inbound
            .get(peer)
            .and_then(|i| i.as_ref())
            .ok_or_else(|| TransError::Config(format!("no ring set up with peer {}", peer)))
    }

    /// Round-robin over the local flag view for a READY slot. With several
    /// producers the slot is claimed remotely with READY -> PROCESSING.
    fn claim_slot(
        &self,
        peer: usize,
        conn: &Connection,
        out: &Outbound<P>,
        view: &mut ProducerView,
        ctx: &ExchangeContext<'_, P>,
    ) -> TransResult<usize> {
        let mut backoff = ctx.waiter.backoff();
        let deadline = ctx.waiter.deadline();
        loop {
            if view.next == 0 {
                view.refresh(conn, &out.flag_token)?;
            }
            let slot = view.next;
            view.next = (slot + 1) % self.slots;

            let cell = slot * FLAG_CELL_SIZE;
            if view.flags.load_u64(cell) == BUFFER_READY_FLAG {
                let claimed = self.producers == 1
                    || conn.compare_swap_blocking(
                        &out.flag_token,
                        cell,
                        BUFFER_READY_FLAG,
                        BUFFER_BEING_PROCESSED_FLAG,
                    )? == BUFFER_READY_FLAG;
                if claimed {
                    view.flags.store_u64(cell, BUFFER_BEING_PROCESSED_FLAG);
                    return Ok(slot);
                }
            }

            if view.next == 0 {
                ctx.waiter.check(peer, "slot claim")?;
                deadline.check(peer, "slot claim")?;
                backoff.snooze();
            }
        }
    }

    /// Write the packed slot, then its flag once the data has landed.
    fn ship(
        &self,
        conn: &Connection,
        out: &Outbound<P>,
        stage: &mut SlotStage<P>,
        slot: usize,
        flag: u64,
        blocking: bool,
        view: &mut ProducerView,
    ) -> TransResult<()> {
        let wire = stage.records.seal();
        conn.write_range(
            stage.records.buffer(),
            0,
            &out.slot_tokens[slot],
            0,
            wire,
            &stage.write_token,
        )?;
        conn.wait(&stage.write_token, "slot write")?;

        stage.flag_scratch.store_u64(0, flag);
        conn.write_range(
            &stage.flag_scratch,
            0,
            &out.flag_token,
            slot * FLAG_CELL_SIZE,
            FLAG_CELL_SIZE,
            &stage.flag_token,
        )?;
        if blocking {
            conn.wait(&stage.flag_token, "flag write")?;
        } else {
            view.pending.push(stage.flag_token.clone());
        }
        view.flags.store_u64(slot * FLAG_CELL_SIZE, flag);
        Ok(())
    }

    /// Claim a slot, pack it from `cursor` and ship it with the flag
    /// `pick_flag` chooses once packing is done.
    fn send_chunk<F>(
        &self,
        peer: usize,
        conn: &Connection,
        out: &Outbound<P>,
        view: &mut ProducerView,
        ctx: &ExchangeContext<'_, P>,
        cursor: &mut usize,
        end: usize,
        pick_flag: F,
    ) -> TransResult<usize>
    where
        F: FnOnce(bool) -> (u64, bool),
    {
        let slot = self.claim_slot(peer, conn, out, view, ctx)?;
        let mut stage = out.stages[slot].lock().unwrap();
        conn.wait(&stage.write_token, "slot write")?;
        conn.wait(&stage.flag_token, "flag write")?;

        stage.records.clear();
        let packed = ctx
            .table
            .pack_into(&mut stage.records, cursor, end, |key| (ctx.matcher)(peer, key));
        let (flag, blocking) = pick_flag(*cursor >= end);
        self.ship(conn, out, &mut stage, slot, flag, blocking, view)?;
        Ok(packed)
    }

    fn consume(
        &self,
        peer: usize,
        ring: &Inbound<P>,
        slot: usize,
        ctx: &ExchangeContext<'_, P>,
    ) -> TransResult<usize> {
        let batch = &ring.slots[slot];
        let count = batch.checked_count(peer)?;
        if count > 0 {
            (ctx.processor)(peer, batch);
        }
        ring.flags.store_u64(slot * FLAG_CELL_SIZE, BUFFER_READY_FLAG);
        Ok(count)
    }
}

impl<P: Payload> ExchangeStrategy<P> for WriteExchange<P> {
    fn name(&self) -> &'static str {
        "write"
    }

    fn producers(&self) -> usize {
        self.producers
    }

    fn send_to(&self, peer: usize, producer: usize, ctx: &ExchangeContext<'_, P>) -> TransResult<usize> {
        let conn = self.connection(peer)?;
        let out = self.outbound(peer)?;
        let range = ctx.producer_range(producer, self.producers);
        let mut view = ProducerView {
            flags: conn.allocate_buffer(self.slots * FLAG_CELL_SIZE)?,
            next: 0,
            pending: Vec::new(),
        };
        let mut cursor = range.start;
        let mut sent = 0;

        if self.producers == 1 {
            loop {
                sent += self.send_chunk(peer, conn, out, &mut view, ctx, &mut cursor, range.end, |last| {
                    if last {
                        (BUFFER_USED_SENDER_DONE, true)
                    } else {
                        (BUFFER_USED_FLAG, false)
                    }
                })?;
                if cursor >= range.end {
                    ctx.state.mark_done_sending(peer)?;
                    return Ok(sent);
                }
            }
        }

        while cursor < range.end {
            sent += self.send_chunk(peer, conn, out, &mut view, ctx, &mut cursor, range.end, |last| {
                (BUFFER_USED_FLAG, last)
            })?;
        }
        for token in view.pending.drain(..) {
            conn.wait(&token, "flag write")?;
        }
        // every other producer's final flag has landed once the count is full
        if ctx.state.finish_producer(peer) == self.producers {
            let mut done = range.end;
            self.send_chunk(peer, conn, out, &mut view, ctx, &mut done, range.end, |_| {
                (BUFFER_USED_SENDER_DONE, true)
            })?;
            ctx.state.mark_done_sending(peer)?;
        }
        Ok(sent)
    }

    fn receive_from(&self, peer: usize, ctx: &ExchangeContext<'_, P>) -> TransResult<usize> {
        let ring = self.inbound(peer)?;
        let conn = self.connection(peer)?;
        let filled = |slot: usize| {
            let flag = ring.flags.load_u64(slot * FLAG_CELL_SIZE);
            flag == BUFFER_USED_FLAG || flag == BUFFER_USED_SENDER_DONE
        };
        let mut backoff = ctx.waiter.backoff();
        let mut deadline = ctx.waiter.deadline();
        let mut received = 0;
        let mut idle = 0;
        let mut slot = 0;

        loop {
            let flag = ring.flags.load_u64(slot * FLAG_CELL_SIZE);
            if flag == BUFFER_USED_FLAG || flag == BUFFER_USED_SENDER_DONE {
                received += self.consume(peer, ring, slot, ctx)?;
                if flag == BUFFER_USED_SENDER_DONE {
                    // a USED slot may still sit behind the cursor
                    for late in 0..self.slots {
                        if ring.flags.load_u64(late * FLAG_CELL_SIZE) == BUFFER_USED_FLAG {
                            received += self.consume(peer, ring, late, ctx)?;
                        }
                    }
                    ctx.state.mark_done_receiving(peer)?;
                    return Ok(received);
                }
                idle = 0;
                backoff.reset();
                deadline = ctx.waiter.deadline();
            } else {
                idle += 1;
            }

            slot = (slot + 1) % self.slots;
            if idle >= self.slots {
                idle = 0;
                ctx.waiter.check(peer, "flag poll")?;
                deadline.check(peer, "flag poll")?;
                // flags the peer wrote before it left still get drained
                if !conn.is_connected() && !(0..self.slots).any(filled) {
                    conn.check_link("flag poll")?;
                }
                backoff.snooze();
            }
        }
    }
}
