//! Notification objects for backend wakeup
//!
//! A notification carries a small set of sticky signal bits instead of a
//! message. Signalling a bit that is already set is a no-op, so any number of
//! producer-side events collapse into one wakeup (level-triggered). Waiters
//! consume the bits they asked for.

use bitflags::bitflags;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

bitflags! {
    /// Notification signal bits
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct NotifyBits: u32 {
        /// The request queue went from empty to non-empty
        const WORK = 1 << 0;
        /// A blocked waiter should give up and return
        const INTERRUPT = 1 << 1;
        /// The bridge is being torn down
        const FINALIZE = 1 << 2;
    }
}

/// Notification - coalesced, level-triggered signalling
pub struct Notification {
    bits: Mutex<NotifyBits>,
    cond: Condvar,
    /// Number of signal calls that set at least one new bit
    raised: AtomicU64,
}

impl Notification {
    /// Create a new notification
    pub fn new() -> Self {
        Self {
            bits: Mutex::new(NotifyBits::empty()),
            cond: Condvar::new(),
            raised: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, NotifyBits> {
        self.bits.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Signal bits (OR with existing)
    ///
    /// Returns true if any bit was newly set and waiters were woken.
    pub fn signal(&self, bits: NotifyBits) -> bool {
        let mut current = self.lock();
        if current.contains(bits) {
            return false;
        }

        current.insert(bits);
        self.raised.fetch_add(1, Ordering::Relaxed);
        self.cond.notify_all();
        true
    }

    /// Wait for any of the bits in `mask`, consuming and returning them
    pub fn wait(&self, mask: NotifyBits) -> NotifyBits {
        let mut current = self.lock();
        while !current.intersects(mask) {
            current = self
                .cond
                .wait(current)
                .unwrap_or_else(PoisonError::into_inner);
        }

        let result = *current & mask;
        current.remove(result);
        result
    }

    /// Like [`wait`](Self::wait), but gives up after `timeout`
    ///
    /// Returns an empty set on timeout.
    pub fn wait_timeout(&self, mask: NotifyBits, timeout: Duration) -> NotifyBits {
        let current = self.lock();
        let (mut current, _) = self
            .cond
            .wait_timeout_while(current, timeout, |bits| !bits.intersects(mask))
            .unwrap_or_else(PoisonError::into_inner);

        let result = *current & mask;
        current.remove(result);
        result
    }

    /// Poll for bits without blocking
    pub fn poll(&self, mask: NotifyBits) -> NotifyBits {
        let mut current = self.lock();
        let result = *current & mask;
        current.remove(result);
        result
    }

    /// Clear specific bits
    pub fn clear(&self, bits: NotifyBits) {
        self.lock().remove(bits);
    }

    /// Get current bits (without clearing)
    pub fn peek(&self) -> NotifyBits {
        *self.lock()
    }

    /// How many signals actually raised a wakeup
    pub fn raised(&self) -> u64 {
        self.raised.load(Ordering::Relaxed)
    }
}

impl Default for Notification {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_signal_coalescing() {
        let n = Notification::new();
        assert!(n.signal(NotifyBits::WORK));
        assert!(!n.signal(NotifyBits::WORK));
        assert!(!n.signal(NotifyBits::WORK));
        assert_eq!(n.raised(), 1);

        assert_eq!(n.poll(NotifyBits::WORK), NotifyBits::WORK);
        assert_eq!(n.poll(NotifyBits::WORK), NotifyBits::empty());

        assert!(n.signal(NotifyBits::WORK));
        assert_eq!(n.raised(), 2);
    }

    #[test]
    fn test_wait_consumes_only_masked_bits() {
        let n = Notification::new();
        n.signal(NotifyBits::WORK | NotifyBits::FINALIZE);

        assert_eq!(n.wait(NotifyBits::WORK), NotifyBits::WORK);
        assert_eq!(n.peek(), NotifyBits::FINALIZE);

        n.clear(NotifyBits::FINALIZE);
        assert!(n.peek().is_empty());
    }

    #[test]
    fn test_wait_timeout_expires() {
        let n = Notification::new();
        let got = n.wait_timeout(NotifyBits::WORK, Duration::from_millis(10));
        assert!(got.is_empty());
    }

    #[test]
    fn test_wait_wakes_across_threads() {
        let n = Arc::new(Notification::new());
        let waiter = {
            let n = n.clone();
            thread::spawn(move || n.wait(NotifyBits::WORK | NotifyBits::INTERRUPT))
        };

        n.signal(NotifyBits::INTERRUPT);
        assert_eq!(waiter.join().unwrap(), NotifyBits::INTERRUPT);
    }
}
