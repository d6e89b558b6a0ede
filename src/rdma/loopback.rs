//! In-process fabric with reliable-connected semantics.
//!
//! Every rank of a group runs as a thread of one process. Queue pairs come
//! in linked pairs: sends land in the oldest receive the peer has posted
//! (or wait for one, like an RC receiver-not-ready retry), one-sided
//! operations resolve the remote key in the peer's domain and copy
//! directly. Requests complete while they are posted, so program order on
//! a queue pair is also arrival order.

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{mpsc, Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::debug;

use super::request::RequestToken;
use super::{
    Domain, Endpoint, Link, Listener, LocalSlice, MemoryRegistration, OneSideComm, QueuePair,
    RemoteSlice, Transport, TwoSidesComm,
};
use crate::common::config::{ClusterConfig, TransportConfig};
use crate::common::membership::{StaticAddressTable, StaticMembership};
use crate::common::region::RegionMemory;
use crate::rdma::control::ConnectionCollection;
use crate::{TransError, TransResult};

type Registry = Arc<Mutex<HashMap<u32, Arc<RegionMemory>>>>;

pub struct LoopbackFabric {
    listeners: Arc<Mutex<HashMap<Endpoint, mpsc::Sender<Arc<PendingDial>>>>>,
    next_key: Arc<AtomicU32>,
}

impl Default for LoopbackFabric {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackFabric {
    pub fn new() -> Self {
        Self {
            listeners: Arc::new(Mutex::new(HashMap::new())),
            next_key: Arc::new(AtomicU32::new(1)),
        }
    }

    fn registry_of(domain: &Arc<dyn Domain>) -> TransResult<Registry> {
        domain
            .as_any()
            .downcast_ref::<LoopbackDomain>()
            .map(|d| d.regions.clone())
            .ok_or_else(|| TransError::Config("domain was not opened by the loopback fabric".into()))
    }
}

pub struct LoopbackDomain {
    regions: Registry,
    next_key: Arc<AtomicU32>,
}

struct RegistrationGuard {
    key: u32,
    regions: Registry,
}

impl Drop for RegistrationGuard {
    fn drop(&mut self) {
        self.regions.lock().unwrap().remove(&self.key);
    }
}

impl Domain for LoopbackDomain {
    fn register(&self, memory: &Arc<RegionMemory>) -> TransResult<MemoryRegistration> {
        let key = self.next_key.fetch_add(1, Ordering::Relaxed);
        self.regions.lock().unwrap().insert(key, memory.clone());
        let guard = RegistrationGuard {
            key,
            regions: self.regions.clone(),
        };
        Ok(MemoryRegistration::new(key, key, Box::new(guard)))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

enum DialState {
    Waiting,
    Accepted(Arc<Wire>, Registry, Vec<u8>),
    Abandoned,
}

struct PendingDial {
    private: Vec<u8>,
    registry: Registry,
    state: Mutex<DialState>,
    ready: Condvar,
}

pub struct LoopbackListener {
    endpoint: Endpoint,
    incoming: mpsc::Receiver<Arc<PendingDial>>,
    registry: Registry,
    listeners: Arc<Mutex<HashMap<Endpoint, mpsc::Sender<Arc<PendingDial>>>>>,
}

impl Listener for LoopbackListener {
    fn accept(&mut self, private: &[u8], timeout: Duration) -> TransResult<Link> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let dial = self.incoming.recv_timeout(remaining).map_err(|_| {
                io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("no connection request on {}", self.endpoint),
                )
            })?;

            let wire = Arc::new(Wire::new());
            let mut state = dial.state.lock().unwrap();
            if let DialState::Abandoned = *state {
                debug!("skip an abandoned dial on {}", self.endpoint);
                continue;
            }
            *state = DialState::Accepted(wire.clone(), self.registry.clone(), private.to_vec());
            dial.ready.notify_all();
            drop(state);

            let qp = LoopbackQp {
                wire,
                side: 0,
                remote: dial.registry.clone(),
            };
            return Ok(Link {
                qp: Arc::new(qp),
                peer_private: dial.private.clone(),
            });
        }
    }
}

impl Drop for LoopbackListener {
    fn drop(&mut self) {
        self.listeners.lock().unwrap().remove(&self.endpoint);
    }
}

impl Transport for LoopbackFabric {
    fn name(&self) -> &'static str {
        "loopback"
    }

    fn open_domain(&self, _device: &str) -> TransResult<Arc<dyn Domain>> {
        Ok(Arc::new(LoopbackDomain {
            regions: Arc::new(Mutex::new(HashMap::new())),
            next_key: self.next_key.clone(),
        }))
    }

    fn bind(&self, endpoint: &Endpoint, domain: &Arc<dyn Domain>) -> TransResult<Box<dyn Listener>> {
        let registry = Self::registry_of(domain)?;
        let mut listeners = self.listeners.lock().unwrap();
        if listeners.contains_key(endpoint) {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("{} is already bound", endpoint),
            )
            .into());
        }
        let (tx, rx) = mpsc::channel();
        listeners.insert(endpoint.clone(), tx);
        Ok(Box::new(LoopbackListener {
            endpoint: endpoint.clone(),
            incoming: rx,
            registry,
            listeners: self.listeners.clone(),
        }))
    }

    fn dial(
        &self,
        endpoint: &Endpoint,
        domain: &Arc<dyn Domain>,
        private: &[u8],
        timeout: Duration,
    ) -> TransResult<Link> {
        let registry = Self::registry_of(domain)?;
        let refused = || {
            TransError::from(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("nobody listens on {}", endpoint),
            ))
        };
        let sender = self
            .listeners
            .lock()
            .unwrap()
            .get(endpoint)
            .cloned()
            .ok_or_else(refused)?;

        let dial = Arc::new(PendingDial {
            private: private.to_vec(),
            registry,
            state: Mutex::new(DialState::Waiting),
            ready: Condvar::new(),
        });
        sender.send(dial.clone()).map_err(|_| refused())?;

        let state = dial.state.lock().unwrap();
        let (mut state, _) = dial
            .ready
            .wait_timeout_while(state, timeout, |s| matches!(s, DialState::Waiting))
            .unwrap();
        match std::mem::replace(&mut *state, DialState::Abandoned) {
            DialState::Accepted(wire, acceptor, reply) => {
                let qp = LoopbackQp {
                    wire,
                    side: 1,
                    remote: acceptor,
                };
                Ok(Link {
                    qp: Arc::new(qp),
                    peer_private: reply,
                })
            }
            _ => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("{} did not accept in time", endpoint),
            )
            .into()),
        }
    }
}

struct PostedRecv {
    memory: Arc<RegionMemory>,
    offset: usize,
    len: usize,
    token: Arc<RequestToken>,
}

impl PostedRecv {
    fn deliver(self, msg: &[u8]) {
        if msg.len() > self.len {
            self.token.fail(format!(
                "local length error: {} byte message into a {} byte receive",
                msg.len(),
                self.len
            ));
            return;
        }
        self.memory.write(self.offset, msg);
        self.token.complete(msg.len());
    }
}

#[derive(Default)]
struct RecvQueue {
    posted: VecDeque<PostedRecv>,
    unexpected: VecDeque<Vec<u8>>,
}

struct Wire {
    alive: AtomicBool,
    queues: [Mutex<RecvQueue>; 2],
}

impl Wire {
    fn new() -> Self {
        Self {
            alive: AtomicBool::new(true),
            queues: [Mutex::new(RecvQueue::default()), Mutex::new(RecvQueue::default())],
        }
    }
}

pub struct LoopbackQp {
    wire: Arc<Wire>,
    side: usize,
    remote: Registry,
}

const LINK_DOWN: &str = "remote operation error: link is down";

impl LoopbackQp {
    #[inline]
    fn alive(&self) -> bool {
        self.wire.alive.load(Ordering::Acquire)
    }

    /// Region behind `remote` and the offset of the slice inside it.
    fn resolve(&self, remote: &RemoteSlice<'_>) -> Result<(Arc<RegionMemory>, usize), String> {
        if !remote.in_bounds() {
            return Err(format!(
                "remote access error: {}+{} outside a {} byte token",
                remote.offset,
                remote.len,
                remote.token.size()
            ));
        }
        let region = self
            .remote
            .lock()
            .unwrap()
            .get(&remote.token.remote_key())
            .cloned()
            .ok_or_else(|| {
                format!(
                    "remote access error: key {} is not registered",
                    remote.token.remote_key()
                )
            })?;
        let base = remote
            .token
            .address()
            .checked_sub(region.address())
            .ok_or_else(|| "remote access error: token below region".to_string())?
            as usize;
        let offset = base + remote.offset;
        if !region.contains(offset, remote.len) {
            return Err("remote access error: token outside region".to_string());
        }
        Ok((region, offset))
    }

    fn one_sided<F>(&self, local: &LocalSlice<'_>, remote: &RemoteSlice<'_>, token: &Arc<RequestToken>, op: F)
    where
        F: FnOnce(&RegionMemory, usize),
    {
        token.arm(local.buffer.memory());
        if !self.alive() {
            token.fail(LINK_DOWN.to_string());
            return;
        }
        if !local.in_bounds() || local.len < remote.len {
            token.fail("local length error".to_string());
            return;
        }
        match self.resolve(remote) {
            Ok((region, offset)) => {
                op(&region, offset);
                token.complete(remote.len);
            }
            Err(status) => token.fail(status),
        }
    }
}

impl OneSideComm for LoopbackQp {
    fn post_write(&self, local: LocalSlice<'_>, remote: RemoteSlice<'_>, token: &Arc<RequestToken>) -> TransResult<()> {
        let src = local.buffer.memory().clone();
        self.one_sided(&local, &remote, token, |region, offset| {
            region.copy_from(offset, &src, local.offset, remote.len);
        });
        Ok(())
    }

    fn post_read(&self, local: LocalSlice<'_>, remote: RemoteSlice<'_>, token: &Arc<RequestToken>) -> TransResult<()> {
        let dst = local.buffer.memory().clone();
        self.one_sided(&local, &remote, token, |region, offset| {
            dst.copy_from(local.offset, region, offset, remote.len);
        });
        Ok(())
    }

    fn post_compare_swap(
        &self,
        local: LocalSlice<'_>,
        remote: RemoteSlice<'_>,
        compare: u64,
        swap: u64,
        token: &Arc<RequestToken>,
    ) -> TransResult<()> {
        if remote.len != 8 || remote.offset % 8 != 0 || local.offset % 8 != 0 {
            token.arm(local.buffer.memory());
            token.fail("invalid atomic: needs an aligned 8-byte target".to_string());
            return Ok(());
        }
        let dst = local.buffer.memory().clone();
        self.one_sided(&local, &remote, token, |region, offset| {
            let prev = region.compare_swap_u64(offset, compare, swap);
            dst.store_u64(local.offset, prev);
        });
        Ok(())
    }
}

impl TwoSidesComm for LoopbackQp {
    fn post_send(&self, local: LocalSlice<'_>, token: &Arc<RequestToken>) -> TransResult<()> {
        token.arm(local.buffer.memory());
        if !self.alive() {
            token.fail(LINK_DOWN.to_string());
            return Ok(());
        }
        if !local.in_bounds() {
            token.fail("local length error".to_string());
            return Ok(());
        }
        let msg = local.buffer.to_vec(local.offset, local.len);
        let mut peer = self.wire.queues[1 - self.side].lock().unwrap();
        match peer.posted.pop_front() {
            Some(posted) => posted.deliver(&msg),
            None => peer.unexpected.push_back(msg),
        }
        drop(peer);
        token.complete(local.len);
        Ok(())
    }

    fn post_recv(&self, local: LocalSlice<'_>, token: &Arc<RequestToken>) -> TransResult<()> {
        token.arm(local.buffer.memory());
        if !local.in_bounds() {
            token.fail("local length error".to_string());
            return Ok(());
        }
        let posted = PostedRecv {
            memory: local.buffer.memory().clone(),
            offset: local.offset,
            len: local.len,
            token: token.clone(),
        };
        let mut queue = self.wire.queues[self.side].lock().unwrap();
        match queue.unexpected.pop_front() {
            Some(msg) => posted.deliver(&msg),
            None if !self.alive() => posted.token.fail(LINK_DOWN.to_string()),
            None => queue.posted.push_back(posted),
        }
        Ok(())
    }
}

impl QueuePair for LoopbackQp {
    fn progress(&self) -> TransResult<usize> {
        if self.alive() {
            return Ok(0);
        }
        // flush posted receives that can never be matched
        let mut queue = self.wire.queues[self.side].lock().unwrap();
        let flushed = queue.posted.len();
        for posted in queue.posted.drain(..) {
            posted.token.fail(LINK_DOWN.to_string());
        }
        Ok(flushed)
    }

    fn is_connected(&self) -> bool {
        self.alive()
    }
}

impl Drop for LoopbackQp {
    fn drop(&mut self) {
        self.wire.alive.store(false, Ordering::Release);
    }
}

/// Runs `size` ranks as threads on a private loopback fabric. Each rank
/// connects its own `ConnectionCollection` and hands it to `f`; results
/// come back in rank order.
pub fn run_local_cluster<T, F>(size: usize, transport: TransportConfig, f: F) -> TransResult<Vec<T>>
where
    T: Send,
    F: Fn(ConnectionCollection) -> TransResult<T> + Sync,
{
    let fabric = LoopbackFabric::new();
    run_cluster_on(&fabric, size, transport, f)
}

pub fn run_cluster_on<T, F>(
    fabric: &LoopbackFabric,
    size: usize,
    transport: TransportConfig,
    f: F,
) -> TransResult<Vec<T>>
where
    T: Send,
    F: Fn(ConnectionCollection) -> TransResult<T> + Sync,
{
    let table = StaticAddressTable::from(&ClusterConfig::local(size, 7471, size)?);
    thread::scope(|s| {
        let handles: Vec<_> = (0..size)
            .map(|rank| {
                let (table, transport, f) = (&table, transport.clone(), &f);
                thread::Builder::new()
                    .name(format!("rank-{}", rank))
                    .spawn_scoped(s, move || {
                        let membership = StaticMembership::new(rank, size)?;
                        let collection =
                            ConnectionCollection::connect(&membership, table, fabric, transport)?;
                        f(collection)
                    })
                    .map_err(TransError::Io)
            })
            .collect();

        handles
            .into_iter()
            .map(|h| match h?.join() {
                Ok(result) => result,
                Err(panic) => std::panic::resume_unwind(panic),
            })
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::region::RegisteredBuffer;

    fn linked_pair(fabric: &LoopbackFabric) -> (Arc<dyn Domain>, Link, Arc<dyn Domain>, Link) {
        let endpoint = Endpoint {
            host: "local".into(),
            port: 1,
        };
        let a_dom = fabric.open_domain("lo").unwrap();
        let b_dom = fabric.open_domain("lo").unwrap();
        let mut listener = fabric.bind(&endpoint, &a_dom).unwrap();
        thread::scope(|s| {
            let dialer = s.spawn(|| {
                fabric
                    .dial(&endpoint, &b_dom, b"hello", Duration::from_secs(5))
                    .unwrap()
            });
            let a = listener.accept(b"world", Duration::from_secs(5)).unwrap();
            let b = dialer.join().unwrap();
            assert_eq!(a.peer_private, b"hello");
            assert_eq!(b.peer_private, b"world");
            (a_dom.clone(), a, b_dom.clone(), b)
        })
    }

    #[test]
    fn dial_without_listener_is_refused() {
        let fabric = LoopbackFabric::new();
        let dom = fabric.open_domain("lo").unwrap();
        let endpoint = Endpoint {
            host: "nowhere".into(),
            port: 9,
        };
        let err = fabric
            .dial(&endpoint, &dom, b"", Duration::from_millis(10))
            .err()
            .unwrap();
        assert!(matches!(err, TransError::Io(ref e) if e.kind() == io::ErrorKind::ConnectionRefused));
    }

    #[test]
    fn double_bind_is_rejected() {
        let fabric = LoopbackFabric::new();
        let dom = fabric.open_domain("lo").unwrap();
        let endpoint = Endpoint {
            host: "local".into(),
            port: 2,
        };
        let _first = fabric.bind(&endpoint, &dom).unwrap();
        assert!(fabric.bind(&endpoint, &dom).is_err());
    }

    #[test]
    fn send_before_recv_is_held() {
        let fabric = LoopbackFabric::new();
        let (a_dom, a, b_dom, b) = linked_pair(&fabric);
        let src = RegisteredBuffer::allocate(&a_dom, 8).unwrap();
        src.store_u64(0, 42);
        let send = RequestToken::new();
        a.qp.post_send(LocalSlice::whole(&src), &send).unwrap();
        assert_eq!(send.poll(), Some(Ok(8)));

        let dst = RegisteredBuffer::allocate(&b_dom, 16).unwrap();
        let recv = RequestToken::new();
        b.qp.post_recv(LocalSlice::whole(&dst), &recv).unwrap();
        assert_eq!(recv.poll(), Some(Ok(8)));
        assert_eq!(dst.load_u64(0), 42);
    }

    #[test]
    fn write_to_dropped_buffer_fails() {
        let fabric = LoopbackFabric::new();
        let (a_dom, a, b_dom, _b) = linked_pair(&fabric);
        let target = RegisteredBuffer::allocate(&b_dom, 8).unwrap();
        let token = target.export_token();
        let src = RegisteredBuffer::allocate(&a_dom, 8).unwrap();

        let req = RequestToken::new();
        a.qp
            .post_write(LocalSlice::whole(&src), RemoteSlice::whole(&token), &req)
            .unwrap();
        assert_eq!(req.poll(), Some(Ok(8)));

        drop(target);
        a.qp
            .post_write(LocalSlice::whole(&src), RemoteSlice::whole(&token), &req)
            .unwrap();
        assert!(matches!(req.poll(), Some(Err(_))));
    }

    #[test]
    fn dropped_peer_flushes_receives() {
        let fabric = LoopbackFabric::new();
        let (a_dom, a, _b_dom, b) = linked_pair(&fabric);
        let dst = RegisteredBuffer::allocate(&a_dom, 8).unwrap();
        let recv = RequestToken::new();
        a.qp.post_recv(LocalSlice::whole(&dst), &recv).unwrap();
        drop(b);
        assert_eq!(a.qp.progress().unwrap(), 1);
        assert!(matches!(recv.poll(), Some(Err(_))));
    }
}
