pub mod connection;
pub mod control;
pub mod loopback;
pub mod one_side;
pub mod request;
pub mod two_sides;
#[cfg(feature = "verbs")]
pub mod verbs;

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::common::config::PeerAddress;
use crate::common::region::{RegionMemory, RegisteredBuffer, RemoteRegionToken};
use crate::{TransError, TransResult};

pub use one_side::OneSideComm;
pub use request::RequestToken;
pub use two_sides::TwoSidesComm;

/// Keys handed out by a domain for one region. Dropping it deregisters.
pub struct MemoryRegistration {
    pub local_key: u32,
    pub remote_key: u32,
    _guard: Box<dyn Any + Send + Sync>,
}

impl MemoryRegistration {
    pub fn new(local_key: u32, remote_key: u32, guard: Box<dyn Any + Send + Sync>) -> Self {
        Self {
            local_key,
            remote_key,
            _guard: guard,
        }
    }
}

/// Protection domain: the scope in which memory is registered.
pub trait Domain: Send + Sync {
    fn register(&self, memory: &Arc<RegionMemory>) -> TransResult<MemoryRegistration>;
    fn as_any(&self) -> &dyn Any;
}

#[derive(Clone, Copy)]
pub struct LocalSlice<'a> {
    pub buffer: &'a RegisteredBuffer,
    pub offset: usize,
    pub len: usize,
}

impl<'a> LocalSlice<'a> {
    #[inline]
    pub fn whole(buffer: &'a RegisteredBuffer) -> Self {
        Self {
            buffer,
            offset: 0,
            len: buffer.len(),
        }
    }

    #[inline]
    pub fn in_bounds(&self) -> bool {
        self.buffer.memory().contains(self.offset, self.len)
    }
}

#[derive(Clone, Copy)]
pub struct RemoteSlice<'a> {
    pub token: &'a RemoteRegionToken,
    pub offset: usize,
    pub len: usize,
}

impl<'a> RemoteSlice<'a> {
    #[inline]
    pub fn whole(token: &'a RemoteRegionToken) -> Self {
        Self {
            token,
            offset: 0,
            len: token.size(),
        }
    }

    #[inline]
    pub fn in_bounds(&self) -> bool {
        self.token.contains(self.offset, self.len)
    }
}

/// One reliable-connected queue pair.
pub trait QueuePair: OneSideComm + TwoSidesComm + Send + Sync {
    /// Drain completion queues into their request tokens. Returns the
    /// number of completions seen.
    fn progress(&self) -> TransResult<usize>;

    /// `false` once the fabric knows the peer side is gone.
    fn is_connected(&self) -> bool;
}

/// An established queue pair plus the peer's connection private data.
pub struct Link {
    pub qp: Arc<dyn QueuePair>,
    pub peer_private: Vec<u8>,
}

pub trait Listener: Send {
    /// Wait up to `timeout` for one connection request and accept it,
    /// answering with `private`.
    fn accept(&mut self, private: &[u8], timeout: Duration) -> TransResult<Link>;
}

pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;
    fn open_domain(&self, device: &str) -> TransResult<Arc<dyn Domain>>;
    fn bind(&self, endpoint: &Endpoint, domain: &Arc<dyn Domain>) -> TransResult<Box<dyn Listener>>;
    fn dial(
        &self,
        endpoint: &Endpoint,
        domain: &Arc<dyn Domain>,
        private: &[u8],
        timeout: Duration,
    ) -> TransResult<Link>;
}

/// Rendezvous point of one pair of processes.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    /// The acceptor (`a`) listens on its own host, on a port offset by the
    /// dialer's id (`b`), so every pair has its own listener.
    pub fn for_pair(acceptor: &PeerAddress, dialer: usize) -> TransResult<Self> {
        let port = u16::try_from(dialer)
            .ok()
            .and_then(|offset| acceptor.port.checked_add(offset))
            .ok_or_else(|| {
                TransError::Config(format!(
                    "no pair port for process {} above {}:{}",
                    dialer, acceptor.host, acceptor.port
                ))
            })?;
        Ok(Self {
            host: acceptor.host.clone(),
            port,
        })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn acceptor(port: u16) -> PeerAddress {
        PeerAddress {
            host: "10.0.0.1".into(),
            device: "mlx5_0".into(),
            port,
        }
    }

    #[test]
    fn pair_port_is_offset_by_the_dialer() {
        let endpoint = Endpoint::for_pair(&acceptor(7471), 3).unwrap();
        assert_eq!(endpoint.to_string(), "10.0.0.1:7474");
    }

    #[test]
    fn pair_port_never_wraps() {
        assert_eq!(Endpoint::for_pair(&acceptor(65535), 0).unwrap().port, 65535);
        assert!(matches!(Endpoint::for_pair(&acceptor(65535), 1), Err(TransError::Config(_))));
        assert!(Endpoint::for_pair(&acceptor(7471), 70_000).is_err());
    }
}
