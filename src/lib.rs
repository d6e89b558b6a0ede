pub mod common;
pub mod exchange;
pub mod rdma;

use std::fmt;

#[derive(Debug)]
pub enum TransError {
    /// bind / dial / handshake did not succeed within the retry budget
    Setup {
        peer: usize,
        op: &'static str,
        reason: String,
    },
    /// the peer broke a rule the protocol enforces
    Protocol { peer: usize, reason: String },
    /// a buffer could not be allocated or registered
    Resource { bytes: usize, reason: String },
    /// a work request finished with an error, or the link is gone
    Completion {
        peer: usize,
        op: &'static str,
        status: String,
    },
    /// the configured deadline elapsed while waiting on the peer
    Timeout { peer: usize, op: &'static str },
    Cancelled { peer: usize, op: &'static str },
    Config(String),
    Io(std::io::Error),
}

impl fmt::Display for TransError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransError::Setup { peer, op, reason } => {
                write!(f, "setup failed with peer {} during {}: {}", peer, op, reason)
            }
            TransError::Protocol { peer, reason } => {
                write!(f, "protocol violation by peer {}: {}", peer, reason)
            }
            TransError::Resource { bytes, reason } => {
                write!(f, "cannot provide {} bytes of registered memory: {}", bytes, reason)
            }
            TransError::Completion { peer, op, status } => {
                write!(f, "{} with peer {} failed: {}", op, peer, status)
            }
            TransError::Timeout { peer, op } => write!(f, "{} with peer {} timed out", op, peer),
            TransError::Cancelled { peer, op } => {
                write!(f, "{} with peer {} was cancelled", op, peer)
            }
            TransError::Config(msg) => write!(f, "invalid configuration: {}", msg),
            TransError::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for TransError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TransError {
    fn from(e: std::io::Error) -> Self {
        TransError::Io(e)
    }
}

impl TransError {
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TransError::Cancelled { .. })
    }
}

pub type TransResult<T> = Result<T, TransError>;

// flow control flags of a ring slot
pub const BUFFER_READY_FLAG: u64 = 0;
pub const BUFFER_USED_FLAG: u64 = 1;
pub const BUFFER_BEING_PROCESSED_FLAG: u64 = 2;
pub const BUFFER_USED_SENDER_DONE: u64 = 127;

/// One flag (or barrier counter) per 8-byte cell, the width of a remote atomic.
pub const FLAG_CELL_SIZE: usize = 8;

/// Bytes of `peer_id` carried by the test exchange after the handshake.
pub const TEST_MSG_SIZE: usize = 8;

/// Header of a chunked bulk transfer message: element count, element offset.
pub const BULK_HEADER_SIZE: usize = 16;

pub const REGION_ALIGNMENT: usize = 4096;
