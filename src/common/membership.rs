use std::env;

use super::config::{ClusterConfig, PeerAddress};
use crate::{TransError, TransResult};

/// Who we are and how many of us there are. Read once while connecting.
pub trait Membership {
    fn rank(&self) -> usize;
    fn size(&self) -> usize;
}

/// `peer_id -> (address, device, port)`
pub trait AddressResolver: Sync {
    fn resolve(&self, peer: usize) -> TransResult<PeerAddress>;
}

#[derive(Clone, Copy, Debug)]
pub struct StaticMembership {
    rank: usize,
    size: usize,
}

impl StaticMembership {
    pub fn new(rank: usize, size: usize) -> TransResult<Self> {
        if rank >= size {
            return Err(TransError::Config(format!(
                "rank {} is outside a group of {}",
                rank, size
            )));
        }
        Ok(Self { rank, size })
    }
}

impl Membership for StaticMembership {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }
}

const RANK_VARS: [&str; 3] = ["RSHUFFLE_RANK", "OMPI_COMM_WORLD_RANK", "PMI_RANK"];
const SIZE_VARS: [&str; 3] = ["RSHUFFLE_SIZE", "OMPI_COMM_WORLD_SIZE", "PMI_SIZE"];

/// Membership handed down by the launcher through the environment.
#[derive(Clone, Copy, Debug)]
pub struct EnvMembership(StaticMembership);

impl EnvMembership {
    pub fn from_env() -> TransResult<Self> {
        let rank = Self::first_of(&RANK_VARS)?;
        let size = Self::first_of(&SIZE_VARS)?;
        Ok(Self(StaticMembership::new(rank, size)?))
    }

    fn first_of(vars: &[&str]) -> TransResult<usize> {
        for var in vars {
            if let Ok(value) = env::var(var) {
                return value
                    .trim()
                    .parse()
                    .map_err(|_| TransError::Config(format!("{}={:?} is not a number", var, value)));
            }
        }
        Err(TransError::Config(format!("none of {:?} is set", vars)))
    }
}

impl Membership for EnvMembership {
    fn rank(&self) -> usize {
        self.0.rank()
    }

    fn size(&self) -> usize {
        self.0.size()
    }
}

#[derive(Clone, Debug)]
pub struct StaticAddressTable {
    peers: Vec<PeerAddress>,
}

impl StaticAddressTable {
    pub fn new(peers: Vec<PeerAddress>) -> Self {
        Self { peers }
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

impl From<&ClusterConfig> for StaticAddressTable {
    fn from(config: &ClusterConfig) -> Self {
        Self::new(config.peers.clone())
    }
}

impl AddressResolver for StaticAddressTable {
    fn resolve(&self, peer: usize) -> TransResult<PeerAddress> {
        self.peers.get(peer).cloned().ok_or_else(|| {
            TransError::Config(format!(
                "no address for peer {} in a table of {}",
                peer,
                self.peers.len()
            ))
        })
    }
}
