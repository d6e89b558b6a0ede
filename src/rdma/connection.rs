use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use log::{debug, info};

use super::request::RequestToken;
use super::{Domain, Endpoint, Link, LocalSlice, QueuePair, RemoteSlice, Transport};
use crate::common::config::TransportConfig;
use crate::common::membership::AddressResolver;
use crate::common::payload::Payload;
use crate::common::poller::Waiter;
use crate::common::region::{RegisteredBuffer, RemoteRegionToken};
use crate::{TransError, TransResult, BULK_HEADER_SIZE, FLAG_CELL_SIZE, TEST_MSG_SIZE};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// binds and waits for the peer
    Acceptor,
    /// dials the peer
    Connector,
}

impl Role {
    /// The lower id accepts, the higher id dials.
    #[inline]
    pub fn for_pair(own_id: usize, peer_id: usize) -> Self {
        if own_id < peer_id {
            Role::Acceptor
        } else {
            Role::Connector
        }
    }
}

// connection private data: sender id, then the token of its barrier cell
const HANDSHAKE_LEN: usize = 8 + RemoteRegionToken::WIRE_LEN;

fn encode_handshake(own_id: usize, barrier: &RemoteRegionToken) -> Vec<u8> {
    let mut meta = vec![0u8; HANDSHAKE_LEN];
    (own_id as u64).encode(&mut meta[..8]);
    barrier.encode(&mut meta[8..]);
    meta
}

fn decode_handshake(meta: &[u8]) -> Option<(u64, RemoteRegionToken)> {
    if meta.len() < HANDSHAKE_LEN {
        return None;
    }
    let id = u64::decode(&meta[..8]);
    RemoteRegionToken::decode(&meta[8..]).map(|token| (id, token))
}

/// One reliable link to one peer.
///
/// Created once per peer while the collection connects and shared by every
/// task that talks to that peer afterwards.
pub struct Connection {
    own_id: usize,
    peer_id: usize,
    role: Role,
    qp: Arc<dyn QueuePair>,
    domain: Arc<dyn Domain>,
    config: Arc<TransportConfig>,
    waiter: Waiter,
    send_counter: AtomicU64,
    recv_counter: AtomicU64,
    barrier_buffer: RegisteredBuffer,
    peer_barrier_token: RemoteRegionToken,
    notify_scratch: Mutex<RegisteredBuffer>,
    atomic_scratch: Mutex<RegisteredBuffer>,
}

impl Connection {
    /// Idle -> Binding | Dialing -> Handshaking -> TestExchange -> Ready.
    pub fn establish(
        own_id: usize,
        peer_id: usize,
        transport: &dyn Transport,
        domain: &Arc<dyn Domain>,
        resolver: &dyn AddressResolver,
        config: Arc<TransportConfig>,
        waiter: Waiter,
    ) -> TransResult<Self> {
        let role = Role::for_pair(own_id, peer_id);
        let barrier_buffer = RegisteredBuffer::allocate(domain, FLAG_CELL_SIZE)?;
        let meta = encode_handshake(own_id, &barrier_buffer.export_token());

        let link = match role {
            Role::Acceptor => {
                let endpoint = Endpoint::for_pair(&resolver.resolve(own_id)?, peer_id)?;
                Self::accept_with_retry(peer_id, &endpoint, transport, domain, &meta, &config, &waiter)?
            }
            Role::Connector => {
                let endpoint = Endpoint::for_pair(&resolver.resolve(peer_id)?, own_id)?;
                Self::dial_with_retry(peer_id, &endpoint, transport, domain, &meta, &config, &waiter)?
            }
        };

        let (announced, peer_barrier_token) =
            decode_handshake(&link.peer_private).ok_or_else(|| TransError::Protocol {
                peer: peer_id,
                reason: format!(
                    "handshake metadata is {} bytes, expected {}",
                    link.peer_private.len(),
                    HANDSHAKE_LEN
                ),
            })?;
        if announced != peer_id as u64 {
            return Err(TransError::Protocol {
                peer: peer_id,
                reason: format!("handshake came from process {}", announced),
            });
        }

        let conn = Self {
            own_id,
            peer_id,
            role,
            qp: link.qp,
            domain: domain.clone(),
            notify_scratch: Mutex::new(RegisteredBuffer::allocate(domain, FLAG_CELL_SIZE)?),
            atomic_scratch: Mutex::new(RegisteredBuffer::allocate(domain, FLAG_CELL_SIZE)?),
            config,
            waiter,
            send_counter: AtomicU64::new(1),
            recv_counter: AtomicU64::new(1),
            barrier_buffer,
            peer_barrier_token,
        };
        conn.test_exchange()?;
        info!(
            "connected to peer {} as {:?} over {}",
            peer_id,
            role,
            transport.name()
        );
        Ok(conn)
    }

    fn accept_with_retry(
        peer_id: usize,
        endpoint: &Endpoint,
        transport: &dyn Transport,
        domain: &Arc<dyn Domain>,
        meta: &[u8],
        config: &TransportConfig,
        waiter: &Waiter,
    ) -> TransResult<Link> {
        let mut listener = None;
        let mut last_error = String::new();
        for attempt in 0..config.retry_count {
            waiter.check(peer_id, "accept")?;
            if listener.is_none() {
                match transport.bind(endpoint, domain) {
                    Ok(l) => listener = Some(l),
                    Err(e) => {
                        debug!("bind {} for peer {} attempt {}: {}", endpoint, peer_id, attempt, e);
                        last_error = e.to_string();
                        thread::sleep(config.retry_backoff());
                        continue;
                    }
                }
            }
            if let Some(l) = listener.as_mut() {
                match l.accept(meta, config.retry_backoff()) {
                    Ok(link) => return Ok(link),
                    Err(e) => {
                        debug!("accept {} for peer {} attempt {}: {}", endpoint, peer_id, attempt, e);
                        last_error = e.to_string();
                    }
                }
            }
        }
        Err(TransError::Setup {
            peer: peer_id,
            op: "accept",
            reason: format!(
                "no connection on {} after {} attempts: {}",
                endpoint, config.retry_count, last_error
            ),
        })
    }

    fn dial_with_retry(
        peer_id: usize,
        endpoint: &Endpoint,
        transport: &dyn Transport,
        domain: &Arc<dyn Domain>,
        meta: &[u8],
        config: &TransportConfig,
        waiter: &Waiter,
    ) -> TransResult<Link> {
        let mut last_error = String::new();
        for attempt in 0..config.retry_count {
            waiter.check(peer_id, "dial")?;
            match transport.dial(endpoint, domain, meta, config.retry_backoff()) {
                Ok(link) => return Ok(link),
                Err(e) => {
                    debug!("dial {} for peer {} attempt {}: {}", endpoint, peer_id, attempt, e);
                    last_error = e.to_string();
                    thread::sleep(config.retry_backoff());
                }
            }
        }
        Err(TransError::Setup {
            peer: peer_id,
            op: "dial",
            reason: format!(
                "{} unreachable after {} attempts: {}",
                endpoint, config.retry_count, last_error
            ),
        })
    }

    // one send/receive round carrying the sender's id
    fn test_exchange(&self) -> TransResult<()> {
        let inbox = self.allocate_buffer(TEST_MSG_SIZE)?;
        let outbox = self.allocate_buffer(TEST_MSG_SIZE)?;
        let recv = RequestToken::new();
        self.post_receive(&inbox, &recv)?;

        outbox.store_u64(0, self.own_id as u64);
        self.send_blocking(&outbox)?;
        self.wait(&recv, "test exchange")?;

        let got = inbox.load_u64(0);
        if got != self.peer_id as u64 {
            return Err(TransError::Protocol {
                peer: self.peer_id,
                reason: format!("test message carried {} instead of {}", got, self.peer_id),
            });
        }
        Ok(())
    }

    #[inline]
    pub fn peer_id(&self) -> usize {
        self.peer_id
    }

    #[inline]
    pub fn own_id(&self) -> usize {
        self.own_id
    }

    #[inline]
    pub fn role(&self) -> Role {
        self.role
    }

    #[inline]
    pub fn domain(&self) -> &Arc<dyn Domain> {
        &self.domain
    }

    #[inline]
    pub fn waiter(&self) -> &Waiter {
        &self.waiter
    }

    #[inline]
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Registered memory usable with this connection and every other one
    /// opened on the same domain.
    pub fn allocate_buffer(&self, len: usize) -> TransResult<RegisteredBuffer> {
        RegisteredBuffer::allocate(&self.domain, len)
    }

    /// Block until `token` completes. A failed request turns into
    /// `Completion`.
    pub fn wait(&self, token: &Arc<RequestToken>, op: &'static str) -> TransResult<usize> {
        self.waiter.wait_until(self.peer_id, op, || {
            if let Some(done) = token.poll() {
                return done
                    .map(Some)
                    .map_err(|status| self.completion_error(op, status));
            }
            self.qp.progress()?;
            match token.poll() {
                None => Ok(None),
                Some(done) => done
                    .map(Some)
                    .map_err(|status| self.completion_error(op, status)),
            }
        })
    }

    /// Non-blocking look at `token`, driving the completion queue once.
    pub fn test(&self, token: &Arc<RequestToken>, op: &'static str) -> TransResult<Option<usize>> {
        self.qp.progress()?;
        match token.poll() {
            None => Ok(None),
            Some(done) => done
                .map(Some)
                .map_err(|status| self.completion_error(op, status)),
        }
    }

    #[inline]
    pub fn is_connected(&self) -> bool {
        self.qp.is_connected()
    }

    /// Fails with `Completion` once the link to the peer is gone.
    pub fn check_link(&self, op: &'static str) -> TransResult<()> {
        if self.is_connected() {
            return Ok(());
        }
        Err(self.completion_error(op, "link is down".to_string()))
    }

    fn completion_error(&self, op: &'static str, status: String) -> TransError {
        TransError::Completion {
            peer: self.peer_id,
            op,
            status,
        }
    }

    /* two-sided primitives */

    pub fn send(&self, buffer: &RegisteredBuffer, token: &Arc<RequestToken>) -> TransResult<()> {
        self.qp.post_send(LocalSlice::whole(buffer), token)
    }

    pub fn send_range(
        &self,
        buffer: &RegisteredBuffer,
        offset: usize,
        len: usize,
        token: &Arc<RequestToken>,
    ) -> TransResult<()> {
        self.qp.post_send(LocalSlice { buffer, offset, len }, token)
    }

    pub fn send_blocking(&self, buffer: &RegisteredBuffer) -> TransResult<()> {
        self.send_range_blocking(buffer, 0, buffer.len())
    }

    pub fn send_range_blocking(&self, buffer: &RegisteredBuffer, offset: usize, len: usize) -> TransResult<()> {
        let token = RequestToken::new();
        self.send_range(buffer, offset, len, &token)?;
        self.wait(&token, "send").map(|_| ())
    }

    /// Post a receive for the whole buffer without waiting for it.
    pub fn post_receive(&self, buffer: &RegisteredBuffer, token: &Arc<RequestToken>) -> TransResult<()> {
        self.qp.post_recv(LocalSlice::whole(buffer), token)
    }

    /// Post a receive and wait for it; returns the received length.
    pub fn post_and_receive_blocking(&self, buffer: &RegisteredBuffer) -> TransResult<usize> {
        let token = RequestToken::new();
        self.post_receive(buffer, &token)?;
        self.wait(&token, "receive")
    }

    /* one-sided primitives */

    pub fn read(
        &self,
        buffer: &RegisteredBuffer,
        remote: &RemoteRegionToken,
        token: &Arc<RequestToken>,
    ) -> TransResult<()> {
        self.qp
            .post_read(LocalSlice::whole(buffer), RemoteSlice::whole(remote), token)
    }

    pub fn read_range(
        &self,
        buffer: &RegisteredBuffer,
        offset: usize,
        remote: &RemoteRegionToken,
        remote_offset: usize,
        len: usize,
        token: &Arc<RequestToken>,
    ) -> TransResult<()> {
        self.qp.post_read(
            LocalSlice { buffer, offset, len },
            RemoteSlice {
                token: remote,
                offset: remote_offset,
                len,
            },
            token,
        )
    }

    pub fn read_blocking(&self, buffer: &RegisteredBuffer, remote: &RemoteRegionToken) -> TransResult<()> {
        let token = RequestToken::new();
        self.read(buffer, remote, &token)?;
        self.wait(&token, "read").map(|_| ())
    }

    pub fn write(
        &self,
        buffer: &RegisteredBuffer,
        remote: &RemoteRegionToken,
        token: &Arc<RequestToken>,
    ) -> TransResult<()> {
        self.qp
            .post_write(LocalSlice::whole(buffer), RemoteSlice::whole(remote), token)
    }

    pub fn write_range(
        &self,
        buffer: &RegisteredBuffer,
        offset: usize,
        remote: &RemoteRegionToken,
        remote_offset: usize,
        len: usize,
        token: &Arc<RequestToken>,
    ) -> TransResult<()> {
        self.qp.post_write(
            LocalSlice { buffer, offset, len },
            RemoteSlice {
                token: remote,
                offset: remote_offset,
                len,
            },
            token,
        )
    }

    pub fn write_blocking(&self, buffer: &RegisteredBuffer, remote: &RemoteRegionToken) -> TransResult<()> {
        let token = RequestToken::new();
        self.write(buffer, remote, &token)?;
        self.wait(&token, "write").map(|_| ())
    }

    pub fn write_range_blocking(
        &self,
        buffer: &RegisteredBuffer,
        offset: usize,
        remote: &RemoteRegionToken,
        remote_offset: usize,
        len: usize,
    ) -> TransResult<()> {
        let token = RequestToken::new();
        self.write_range(buffer, offset, remote, remote_offset, len, &token)?;
        self.wait(&token, "write").map(|_| ())
    }

    /// Remote compare-and-swap on the 8-byte cell at `remote_offset`.
    /// Returns the value the cell held before.
    pub fn compare_swap_blocking(
        &self,
        remote: &RemoteRegionToken,
        remote_offset: usize,
        compare: u64,
        swap: u64,
    ) -> TransResult<u64> {
        let scratch = self.atomic_scratch.lock().unwrap();
        let token = RequestToken::new();
        self.qp.post_compare_swap(
            LocalSlice::whole(&scratch),
            RemoteSlice {
                token: remote,
                offset: remote_offset,
                len: FLAG_CELL_SIZE,
            },
            compare,
            swap,
            &token,
        )?;
        self.wait(&token, "compare and swap")?;
        Ok(scratch.load_u64(0))
    }

    /* barrier */

    /// Write the next send counter into the peer's barrier cell and wait
    /// until the write completed.
    pub fn send_notification(&self) -> TransResult<()> {
        let scratch = self.notify_scratch.lock().unwrap();
        let value = self.send_counter.load(Ordering::Acquire);
        scratch.store_u64(0, value);
        self.write_blocking(&scratch, &self.peer_barrier_token)?;
        self.send_counter.store(value + 1, Ordering::Release);
        Ok(())
    }

    /// Wait until the peer's counter in our barrier cell caught up with
    /// our receive counter.
    pub fn wait_for_notification(&self) -> TransResult<()> {
        let expected = self.recv_counter.load(Ordering::Acquire);
        let arrived = || self.barrier_buffer.load_u64(0) >= expected;
        self.waiter.wait_until(self.peer_id, "barrier", || {
            if arrived() {
                return Ok(Some(()));
            }
            // the peer may have written its last notification and left
            if !self.is_connected() && !arrived() {
                return Err(self.completion_error("barrier", "link is down".to_string()));
            }
            Ok(None)
        })?;
        self.recv_counter.store(expected + 1, Ordering::Release);
        Ok(())
    }

    pub fn barrier(&self) -> TransResult<()> {
        self.send_notification()?;
        self.wait_for_notification()
    }

    /* chunked bulk transfer */

    fn bulk_capacity<P: Payload>(&self) -> TransResult<usize> {
        let capacity = self.config.bulk_chunk_bytes.saturating_sub(BULK_HEADER_SIZE) / P::WIRE_LEN.max(1);
        if capacity == 0 {
            return Err(TransError::Config(format!(
                "bulk_chunk_bytes {} cannot carry a {} byte element",
                self.config.bulk_chunk_bytes,
                P::WIRE_LEN
            )));
        }
        Ok(capacity)
    }

    /// Stream `data` through `bulk_pool` buffers, then one zero-count
    /// message per buffer the receiver may have posted.
    pub fn send_buffered<P: Payload>(&self, data: &[P]) -> TransResult<()> {
        let capacity = self.bulk_capacity::<P>()?;
        let pool = (0..self.config.bulk_pool)
            .map(|_| self.allocate_buffer(self.config.bulk_chunk_bytes))
            .collect::<TransResult<Vec<_>>>()?;

        let mut header = [0u8; BULK_HEADER_SIZE];
        let mut chunk_bytes = vec![0u8; capacity * P::WIRE_LEN];
        for (i, chunk) in data.chunks(capacity).enumerate() {
            let buffer = &pool[i % pool.len()];
            (chunk.len() as u64).encode(&mut header[..8]);
            ((i * capacity) as u64).encode(&mut header[8..]);
            for (value, out) in chunk.iter().zip(chunk_bytes.chunks_mut(P::WIRE_LEN)) {
                value.encode(out);
            }
            let body = chunk.len() * P::WIRE_LEN;
            buffer.write(0, &header);
            buffer.write(BULK_HEADER_SIZE, &chunk_bytes[..body]);
            self.send_range_blocking(buffer, 0, BULK_HEADER_SIZE + body)?;
        }

        let terminal = &pool[0];
        terminal.write(0, &[0u8; BULK_HEADER_SIZE]);
        for _ in 0..pool.len() {
            self.send_range_blocking(terminal, 0, BULK_HEADER_SIZE)?;
        }
        Ok(())
    }

    /// Counterpart of `send_buffered`: places every chunk at its offset in
    /// `out` and returns the number of elements received.
    pub fn recv_buffered<P: Payload>(&self, out: &mut [P]) -> TransResult<usize> {
        let capacity = self.bulk_capacity::<P>()?;
        let mut posted = VecDeque::with_capacity(self.config.bulk_pool);
        for _ in 0..self.config.bulk_pool {
            let buffer = self.allocate_buffer(self.config.bulk_chunk_bytes)?;
            let token = RequestToken::new();
            self.post_receive(&buffer, &token)?;
            posted.push_back((buffer, token));
        }

        let mut terminals = 0;
        let mut received = 0;
        let mut header = [0u8; BULK_HEADER_SIZE];
        while terminals < self.config.bulk_pool {
            let (buffer, token) = match posted.pop_front() {
                Some(entry) => entry,
                None => break,
            };
            let len = self.wait(&token, "bulk receive")?;
            if len < BULK_HEADER_SIZE {
                return Err(TransError::Protocol {
                    peer: self.peer_id,
                    reason: format!("bulk message of {} bytes has no header", len),
                });
            }
            buffer.read(0, &mut header);
            let count = u64::decode(&header[..8]) as usize;
            let offset = u64::decode(&header[8..]) as usize;
            if count == 0 {
                // a terminal slot stays unposted
                terminals += 1;
                continue;
            }
            if count > capacity
                || len < BULK_HEADER_SIZE + count * P::WIRE_LEN
                || offset.checked_add(count).map_or(true, |end| end > out.len())
            {
                return Err(TransError::Protocol {
                    peer: self.peer_id,
                    reason: format!(
                        "bulk chunk of {} at {} does not fit {} elements",
                        count,
                        offset,
                        out.len()
                    ),
                });
            }
            let body = buffer.to_vec(BULK_HEADER_SIZE, count * P::WIRE_LEN);
            for (slot, raw) in out[offset..offset + count]
                .iter_mut()
                .zip(body.chunks(P::WIRE_LEN))
            {
                *slot = P::decode(raw);
            }
            received += count;

            self.post_receive(&buffer, &token)?;
            posted.push_back((buffer, token));
        }
        Ok(received)
    }
}
