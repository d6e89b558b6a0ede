use std::fs;
use std::path::Path;
use std::time::Duration;

use serde_derive::{Deserialize, Serialize};

use crate::{TransError, TransResult};

pub const DEFAULT_DEVICE: &str = "mlx5_0";

pub trait ConfigSerialize: Sized {
    fn serialize(&self) -> TransResult<Vec<u8>>;
    fn deserialize(data: &[u8]) -> TransResult<Self>;
}

impl<T> ConfigSerialize for T
where
    T: serde::Serialize + serde::de::DeserializeOwned,
{
    fn serialize(&self) -> TransResult<Vec<u8>> {
        serde_json::to_vec_pretty(self).map_err(|e| TransError::Config(e.to_string()))
    }

    fn deserialize(data: &[u8]) -> TransResult<Self> {
        serde_json::from_slice(data).map_err(|e| TransError::Config(e.to_string()))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub retry_count: u32,
    pub retry_backoff_ms: u64,
    pub spin_limit: u32,
    pub yield_limit: u32,
    pub park_micros: u64,
    /// `None` keeps every wait unbounded.
    pub op_timeout_ms: Option<u64>,
    pub bulk_pool: usize,
    pub bulk_chunk_bytes: usize,
    pub device: String,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            retry_count: 64,
            retry_backoff_ms: 50,
            spin_limit: 2048,
            yield_limit: 256,
            park_micros: 50,
            op_timeout_ms: None,
            bulk_pool: 4,
            bulk_chunk_bytes: 64 * 1024,
            device: DEFAULT_DEVICE.to_string(),
        }
    }
}

impl TransportConfig {
    #[inline]
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    #[inline]
    pub fn op_timeout(&self) -> Option<Duration> {
        self.op_timeout_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> TransResult<()> {
        if self.retry_count == 0 {
            return Err(TransError::Config("retry_count must be at least 1".into()));
        }
        if self.bulk_pool == 0 {
            return Err(TransError::Config("bulk_pool must be at least 1".into()));
        }
        if self.bulk_chunk_bytes <= crate::BULK_HEADER_SIZE {
            return Err(TransError::Config(format!(
                "bulk_chunk_bytes must exceed the {} byte header",
                crate::BULK_HEADER_SIZE
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    Write,
    Send,
}

impl std::str::FromStr for StrategyKind {
    type Err = TransError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "write" => Ok(StrategyKind::Write),
            "send" => Ok(StrategyKind::Send),
            other => Err(TransError::Config(format!("unknown strategy {:?}", other))),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    pub strategy: StrategyKind,
    /// ring slots per directed pair (Write-Strategy)
    pub slots: usize,
    /// posted receive buffers per directed pair (Send-Strategy)
    pub recv_pool: usize,
    pub buffer_bytes: usize,
    pub producers_per_peer: usize,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::Write,
            slots: 4,
            recv_pool: 4,
            buffer_bytes: 64 * 1024,
            producers_per_peer: 1,
        }
    }
}

impl ExchangeConfig {
    pub fn validate(&self, payload_len: usize) -> TransResult<()> {
        if self.slots == 0 || self.recv_pool == 0 {
            return Err(TransError::Config("slots and recv_pool must be at least 1".into()));
        }
        if self.producers_per_peer == 0 {
            return Err(TransError::Config("producers_per_peer must be at least 1".into()));
        }
        if self.strategy == StrategyKind::Send && self.producers_per_peer > 1 {
            return Err(TransError::Config(
                "the send strategy drives one producer per peer".into(),
            ));
        }
        let capacity =
            crate::exchange::record_buffer::capacity_for(self.buffer_bytes, payload_len);
        if capacity == 0 {
            return Err(TransError::Config(format!(
                "buffer_bytes {} cannot hold a single record",
                self.buffer_bytes
            )));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerAddress {
    pub host: String,
    #[serde(default = "default_device")]
    pub device: String,
    pub port: u16,
}

fn default_device() -> String {
    DEFAULT_DEVICE.to_string()
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub peers: Vec<PeerAddress>,
    pub transport: TransportConfig,
    pub exchange: ExchangeConfig,
}

impl ClusterConfig {
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> TransResult<Self> {
        let data = fs::read(path.as_ref())?;
        let config = <Self as ConfigSerialize>::deserialize(&data)?;
        config.transport.validate()?;
        Ok(config)
    }

    /// Address table for `n` ranks sharing one host, `stride` ports apart.
    /// Every pair port (`port + dialer`) must stay below 65536.
    pub fn local(n: usize, base_port: u16, stride: usize) -> TransResult<Self> {
        let peers = (0..n)
            .map(|rank| {
                let port = stride
                    .checked_mul(rank)
                    .and_then(|offset| offset.checked_add(base_port as usize))
                    .filter(|port| port.saturating_add(n.saturating_sub(1)) <= u16::MAX as usize)
                    .ok_or_else(|| {
                        TransError::Config(format!(
                            "{} ranks from port {} with stride {} run past port {}",
                            n,
                            base_port,
                            stride,
                            u16::MAX
                        ))
                    })?;
                Ok(PeerAddress {
                    host: "127.0.0.1".to_string(),
                    device: DEFAULT_DEVICE.to_string(),
                    port: port as u16,
                })
            })
            .collect::<TransResult<Vec<_>>>()?;
        Ok(Self {
            peers,
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_ports_stay_in_range() {
        let config = ClusterConfig::local(4, 7471, 4).unwrap();
        let ports: Vec<u16> = config.peers.iter().map(|p| p.port).collect();
        assert_eq!(ports, vec![7471, 7475, 7479, 7483]);

        // rank 1 would listen up to port 65536
        assert!(matches!(ClusterConfig::local(2, 65533, 2), Err(TransError::Config(_))));
        assert!(ClusterConfig::local(2, 65532, 2).is_ok());
        assert!(ClusterConfig::local(300, 7471, 300).is_err());
    }

    #[test]
    fn partial_json_uses_defaults() {
        let raw = br#"{
            "peers": [{ "host": "10.10.10.6", "port": 7471 }],
            "exchange": { "strategy": "send", "recv_pool": 8 }
        }"#;
        let config = <ClusterConfig as ConfigSerialize>::deserialize(raw).unwrap();
        assert_eq!(config.peers[0].device, DEFAULT_DEVICE);
        assert_eq!(config.exchange.strategy, StrategyKind::Send);
        assert_eq!(config.exchange.recv_pool, 8);
        assert_eq!(config.exchange.slots, 4);
        assert_eq!(config.transport.retry_count, 64);
        assert!(config.transport.op_timeout().is_none());
    }

    #[test]
    fn send_strategy_rejects_multiple_producers() {
        let config = ExchangeConfig {
            strategy: StrategyKind::Send,
            producers_per_peer: 2,
            ..Default::default()
        };
        assert!(config.validate(8).is_err());
    }

    #[test]
    fn tiny_buffers_are_rejected() {
        let config = ExchangeConfig {
            buffer_bytes: 16,
            ..Default::default()
        };
        assert!(config.validate(16).is_err());
    }
}
