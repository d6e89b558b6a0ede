use std::ops::Add;
use std::sync::Arc;
use std::thread;

use log::{error, info};

use super::connection::Connection;
use super::{Domain, Transport};
use crate::common::config::TransportConfig;
use crate::common::membership::{AddressResolver, Membership};
use crate::common::payload::Payload;
use crate::common::poller::{CancelToken, Waiter};
use crate::{TransError, TransResult};

/// Keep the first failure that is not a consequence of cancelling.
pub(crate) fn first_root_cause(errors: impl IntoIterator<Item = TransError>) -> Option<TransError> {
    let mut cancelled = None;
    for e in errors {
        if !e.is_cancelled() {
            return Some(e);
        }
        cancelled.get_or_insert(e);
    }
    cancelled
}

#[inline]
fn zeroed<P: Payload>() -> P {
    P::decode(&vec![0u8; P::WIRE_LEN])
}

/// Links to every other process of the group, plus the group operations
/// built from them. There is no N-way fabric underneath: every collective
/// is a pattern of pairwise barriers and bulk transfers.
pub struct ConnectionCollection {
    rank: usize,
    size: usize,
    connections: Vec<Option<Arc<Connection>>>,
    domain: Arc<dyn Domain>,
    config: Arc<TransportConfig>,
    cancel: CancelToken,
}

impl ConnectionCollection {
    /// Connect to all `size - 1` peers in parallel.
    pub fn connect(
        membership: &dyn Membership,
        resolver: &dyn AddressResolver,
        transport: &dyn Transport,
        config: TransportConfig,
    ) -> TransResult<Self> {
        config.validate()?;
        let (rank, size) = (membership.rank(), membership.size());
        let device = resolver.resolve(rank)?.device;
        let domain = transport.open_domain(&device)?;
        let config = Arc::new(config);
        let cancel = CancelToken::new();

        let results: Vec<TransResult<Option<Arc<Connection>>>> = thread::scope(|s| {
            let handles: Vec<_> = (0..size)
                .map(|peer| {
                    let (domain, config, cancel) = (&domain, config.clone(), cancel.clone());
                    s.spawn(move || {
                        if peer == rank {
                            return Ok(None);
                        }
                        let waiter = Waiter::new(&config, cancel.clone());
                        Connection::establish(rank, peer, transport, domain, resolver, config, waiter)
                            .map(|c| Some(Arc::new(c)))
                            .map_err(|e| {
                                error!("rank {} cannot reach peer {}: {}", rank, peer, e);
                                cancel.cancel();
                                e
                            })
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|h| match h.join() {
                    Ok(result) => result,
                    Err(panic) => std::panic::resume_unwind(panic),
                })
                .collect()
        });

        let mut connections = Vec::with_capacity(size);
        let mut errors = Vec::new();
        for result in results {
            match result {
                Ok(conn) => connections.push(conn),
                Err(e) => errors.push(e),
            }
        }
        if let Some(e) = first_root_cause(errors) {
            return Err(e);
        }

        info!("rank {} of {} connected over {}", rank, size, transport.name());
        Ok(Self {
            rank,
            size,
            connections,
            domain,
            config,
            cancel,
        })
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.rank
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn domain(&self) -> &Arc<dyn Domain> {
        &self.domain
    }

    #[inline]
    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Firing it aborts every wait of every connection in the collection.
    #[inline]
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn waiter(&self) -> Waiter {
        Waiter::new(&self.config, self.cancel.clone())
    }

    pub fn connection(&self, peer: usize) -> TransResult<&Arc<Connection>> {
        self.connections
            .get(peer)
            .and_then(|c| c.as_ref())
            .ok_or_else(|| {
                TransError::Config(format!(
                    "rank {} has no connection to {} in a group of {}",
                    self.rank, peer, self.size
                ))
            })
    }

    /// Every rank but our own, ascending.
    pub fn peers(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.size).filter(move |p| *p != self.rank)
    }

    /// Collect equally long slices at `target`, in rank order.
    pub fn gather<P: Payload>(&self, local: &[P], target: usize) -> TransResult<Option<Vec<P>>> {
        let lengths = vec![local.len(); self.size];
        self.gather_with_lengths(local, &lengths, target)
    }

    fn gather_with_lengths<P: Payload>(
        &self,
        local: &[P],
        lengths: &[usize],
        target: usize,
    ) -> TransResult<Option<Vec<P>>> {
        if self.rank != target {
            let conn = self.connection(target)?;
            conn.barrier()?;
            conn.send_buffered(local)?;
            return Ok(None);
        }

        let mut out = Vec::with_capacity(lengths.iter().sum());
        for (peer, &len) in lengths.iter().enumerate() {
            if peer == self.rank {
                out.extend_from_slice(local);
                continue;
            }
            let conn = self.connection(peer)?;
            let mut part = vec![zeroed::<P>(); len];
            conn.barrier()?;
            let got = conn.recv_buffered(&mut part)?;
            if got != len {
                return Err(TransError::Protocol {
                    peer,
                    reason: format!("gather expected {} elements, got {}", len, got),
                });
            }
            out.extend_from_slice(&part);
        }
        Ok(Some(out))
    }

    /// Gather slices of differing length: lengths are all-gathered first.
    pub fn gather_dif<P: Payload>(&self, local: &[P], target: usize) -> TransResult<Option<Vec<Vec<P>>>> {
        let lengths: Vec<usize> = self
            .all_gather(&[local.len() as u64])?
            .into_iter()
            .map(|l| l as usize)
            .collect();
        let flat = match self.gather_with_lengths(local, &lengths, target)? {
            Some(flat) => flat,
            None => return Ok(None),
        };
        let mut rest = flat.as_slice();
        let mut parts = Vec::with_capacity(self.size);
        for len in lengths {
            let (head, tail) = rest.split_at(len);
            parts.push(head.to_vec());
            rest = tail;
        }
        Ok(Some(parts))
    }

    /// `gather` to rank 0, then `bcast` from rank 0.
    pub fn all_gather<P: Payload>(&self, local: &[P]) -> TransResult<Vec<P>> {
        let mut all = match self.gather(local, 0)? {
            Some(all) => all,
            None => vec![zeroed::<P>(); local.len() * self.size],
        };
        self.bcast(&mut all, 0)?;
        Ok(all)
    }

    /// `sender` streams `data` to every other rank; everyone else receives
    /// into `data`, which must already have the sender's length.
    pub fn bcast<P: Payload>(&self, data: &mut [P], sender: usize) -> TransResult<()> {
        if self.rank == sender {
            for peer in self.peers() {
                self.connection(peer)?.send_buffered(data)?;
            }
            return Ok(());
        }
        let got = self.connection(sender)?.recv_buffered(data)?;
        if got != data.len() {
            return Err(TransError::Protocol {
                peer: sender,
                reason: format!("broadcast of {} elements, expected {}", got, data.len()),
            });
        }
        Ok(())
    }

    /// Group rendezvous from pairwise barriers: rank 0 meets every rank in
    /// turn, then releases them all.
    pub fn barrier_all(&self) -> TransResult<()> {
        match self.size {
            1 => Ok(()),
            2 => self.connection(1 - self.rank)?.barrier(),
            _ if self.rank == 0 => {
                for peer in self.peers() {
                    self.connection(peer)?.barrier()?;
                }
                for peer in self.peers() {
                    self.connection(peer)?.send_notification()?;
                }
                Ok(())
            }
            _ => {
                let root = self.connection(0)?;
                root.barrier()?;
                root.wait_for_notification()
            }
        }
    }

    /// `gather` then a local reduction at `target`.
    pub fn sum<T>(&self, local: T, target: usize) -> TransResult<Option<T>>
    where
        T: Payload + Add<Output = T> + Default,
    {
        Ok(self
            .gather(&[local], target)?
            .map(|all| all.into_iter().fold(T::default(), |acc, v| acc + v)))
    }
}
