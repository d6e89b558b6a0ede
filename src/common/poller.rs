use std::hint;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use super::config::TransportConfig;
use crate::{TransError, TransResult};

/// Shared abort switch; every wait of a collection observes the same one.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Spin, then yield, then park.
pub struct Backoff {
    step: u32,
    spin_limit: u32,
    yield_limit: u32,
    park: Duration,
}

impl Backoff {
    pub fn new(spin_limit: u32, yield_limit: u32, park: Duration) -> Self {
        Self {
            step: 0,
            spin_limit,
            yield_limit,
            park,
        }
    }

    #[inline]
    pub fn reset(&mut self) {
        self.step = 0;
    }

    #[inline]
    pub fn snooze(&mut self) {
        if self.step < self.spin_limit {
            hint::spin_loop();
        } else if self.step < self.spin_limit.saturating_add(self.yield_limit) {
            thread::yield_now();
        } else {
            thread::sleep(self.park);
        }
        self.step = self.step.saturating_add(1);
    }
}

/// Wait policy of one collection: backoff shape, optional deadline, cancel switch.
#[derive(Clone, Debug)]
pub struct Waiter {
    spin_limit: u32,
    yield_limit: u32,
    park: Duration,
    timeout: Option<Duration>,
    cancel: CancelToken,
}

impl Waiter {
    pub fn new(config: &TransportConfig, cancel: CancelToken) -> Self {
        Self {
            spin_limit: config.spin_limit,
            yield_limit: config.yield_limit,
            park: Duration::from_micros(config.park_micros),
            timeout: config.op_timeout(),
            cancel,
        }
    }

    #[inline]
    pub fn backoff(&self) -> Backoff {
        Backoff::new(self.spin_limit, self.yield_limit, self.park)
    }

    #[inline]
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Fails with `Cancelled` once the cancel switch is set.
    #[inline]
    pub fn check(&self, peer: usize, op: &'static str) -> TransResult<()> {
        if self.cancel.is_cancelled() {
            return Err(TransError::Cancelled { peer, op });
        }
        Ok(())
    }

    /// A stopwatch for callers that run their own polling loop.
    pub fn deadline(&self) -> Deadline {
        Deadline {
            expires: self.timeout.map(|t| Instant::now() + t),
        }
    }

    /// Polls `probe` until it yields a value, the deadline passes or the
    /// collection is cancelled.
    pub fn wait_until<T, F>(&self, peer: usize, op: &'static str, mut probe: F) -> TransResult<T>
    where
        F: FnMut() -> TransResult<Option<T>>,
    {
        let deadline = self.deadline();
        let mut backoff = self.backoff();
        loop {
            if let Some(value) = probe()? {
                return Ok(value);
            }
            self.check(peer, op)?;
            deadline.check(peer, op)?;
            backoff.snooze();
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Deadline {
    expires: Option<Instant>,
}

impl Deadline {
    #[inline]
    pub fn check(&self, peer: usize, op: &'static str) -> TransResult<()> {
        match self.expires {
            Some(at) if Instant::now() >= at => Err(TransError::Timeout { peer, op }),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn waiter(timeout_ms: Option<u64>) -> Waiter {
        let config = TransportConfig {
            spin_limit: 4,
            yield_limit: 4,
            park_micros: 100,
            op_timeout_ms: timeout_ms,
            ..Default::default()
        };
        Waiter::new(&config, CancelToken::new())
    }

    #[test]
    fn wait_returns_probe_value() {
        let w = waiter(None);
        let mut calls = 0;
        let v = w
            .wait_until(1, "probe", || {
                calls += 1;
                Ok(if calls == 20 { Some(calls) } else { None })
            })
            .unwrap();
        assert_eq!(v, 20);
    }

    #[test]
    fn wait_times_out() {
        let w = waiter(Some(5));
        let err = w
            .wait_until::<(), _>(3, "never", || Ok(None))
            .unwrap_err();
        assert!(matches!(err, TransError::Timeout { peer: 3, op: "never" }));
    }

    #[test]
    fn cancel_stops_the_wait() {
        let w = waiter(None);
        let cancel = w.cancel_token().clone();
        let handle = thread::spawn(move || w.wait_until::<(), _>(0, "gate", || Ok(None)));
        thread::sleep(Duration::from_millis(10));
        cancel.cancel();
        assert!(handle.join().unwrap().unwrap_err().is_cancelled());
    }
}
