//! Out-of-band interrupt signalling.
//!
//! A reset on the wire must take effect before the messages queued ahead
//! of it, so each one raises a shared counter the moment it is decoded.
//! The state machine and the statement processor poll the counter between
//! records and abandon work early when it is up; processing the reset
//! itself consumes one raise. A separate stop flag covers the terminal
//! cases, server shutdown and operator kill, which no reset balances.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Shared interrupt state of one connection.
///
/// Clones observe the same counter and flag; one clone lives in the
/// connection registry so interrupts can be raised from outside the
/// session thread.
#[derive(Debug, Clone, Default)]
pub struct InterruptSignal {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    pending: AtomicU64,
    stopped: AtomicBool,
}

impl InterruptSignal {
    /// Create a signal with nothing pending.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise one interrupt.
    pub fn raise(&self) {
        self.inner.pending.fetch_add(1, Ordering::SeqCst);
    }

    /// Consume one pending interrupt and return how many remain.
    ///
    /// Consuming with none pending stays at zero.
    pub fn consume(&self) -> u64 {
        let previous = self
            .inner
            .pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match previous {
            Ok(n) => n - 1,
            Err(_) => 0,
        }
    }

    /// Whether at least one interrupt is pending.
    pub fn is_raised(&self) -> bool {
        self.pending() > 0
    }

    /// Number of pending interrupts.
    pub fn pending(&self) -> u64 {
        self.inner.pending.load(Ordering::SeqCst)
    }

    /// Tell the session to stop for good.
    pub fn stop(&self) {
        self.inner.stopped.store(true, Ordering::SeqCst);
    }

    /// Whether the session has been told to stop.
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raise_and_consume() {
        let signal = InterruptSignal::new();
        assert!(!signal.is_raised());

        signal.raise();
        signal.raise();
        assert!(signal.is_raised());
        assert_eq!(signal.pending(), 2);

        assert_eq!(signal.consume(), 1);
        assert!(signal.is_raised());
        assert_eq!(signal.consume(), 0);
        assert!(!signal.is_raised());
    }

    #[test]
    fn test_consume_on_empty_stays_at_zero() {
        let signal = InterruptSignal::new();
        assert_eq!(signal.consume(), 0);
        assert_eq!(signal.pending(), 0);
    }

    #[test]
    fn test_clones_share_state() {
        let signal = InterruptSignal::new();
        let remote = signal.clone();

        remote.raise();
        assert!(signal.is_raised());

        remote.stop();
        assert!(signal.is_stopped());
    }

    #[test]
    fn test_stop_is_independent_of_pending() {
        let signal = InterruptSignal::new();
        signal.stop();
        assert!(signal.is_stopped());
        assert!(!signal.is_raised());
    }
}
