use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::common::region::RegionMemory;

const TOKEN_IDLE: u8 = 0;
const TOKEN_PENDING: u8 = 1;
const TOKEN_FAILED: u8 = 2;

/// Completion handle of one work request.
///
/// While a request is in flight the token pins the local memory it reads
/// from or writes into, so a buffer cannot be freed under the fabric.
pub struct RequestToken {
    state: AtomicU8,
    bytes: AtomicUsize,
    status: Mutex<Option<String>>,
    pinned: Mutex<Option<Arc<RegionMemory>>>,
}

impl RequestToken {
    /// A token with nothing outstanding.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: AtomicU8::new(TOKEN_IDLE),
            bytes: AtomicUsize::new(0),
            status: Mutex::new(None),
            pinned: Mutex::new(None),
        })
    }

    /// Mark the token in flight for a request touching `memory`.
    pub fn arm(&self, memory: &Arc<RegionMemory>) {
        *self.pinned.lock().unwrap() = Some(memory.clone());
        *self.status.lock().unwrap() = None;
        self.bytes.store(0, Ordering::Relaxed);
        self.state.store(TOKEN_PENDING, Ordering::Release);
    }

    pub fn complete(&self, bytes: usize) {
        self.bytes.store(bytes, Ordering::Relaxed);
        self.pinned.lock().unwrap().take();
        self.state.store(TOKEN_IDLE, Ordering::Release);
    }

    pub fn fail(&self, status: String) {
        *self.status.lock().unwrap() = Some(status);
        self.pinned.lock().unwrap().take();
        self.state.store(TOKEN_FAILED, Ordering::Release);
    }

    #[inline]
    pub fn is_pending(&self) -> bool {
        self.state.load(Ordering::Acquire) == TOKEN_PENDING
    }

    #[inline]
    pub fn is_completed(&self) -> bool {
        self.state.load(Ordering::Acquire) == TOKEN_IDLE
    }

    /// `None` while in flight, otherwise the byte count or the failure.
    pub fn poll(&self) -> Option<Result<usize, String>> {
        match self.state.load(Ordering::Acquire) {
            TOKEN_PENDING => None,
            TOKEN_IDLE => Some(Ok(self.bytes.load(Ordering::Relaxed))),
            _ => Some(Err(self
                .status
                .lock()
                .unwrap()
                .clone()
                .unwrap_or_else(|| "unknown failure".to_string()))),
        }
    }
}
