//! # Kernel bridge
//!
//! Mediates between the hypervisor's trap path and the userspace backend.
//!
//! ## Request lifecycle
//!
//! ```text
//! Enqueued --drain--> Delivered --submit--> Completed --FINISH_REQ--> Acknowledged
//! ```
//!
//! - **Enqueued**: appended by a trapping processor via [`KernelBridge::forward_request`]
//! - **Delivered**: handed to the backend by [`KernelBridge::retrieve_work`]
//! - **Completed**: result placed in the completion slot
//! - **Acknowledged**: slot consumed and the finish hypercall issued
//!
//! ## Lifecycle
//!
//! `Unmapped -> Forwarding -> Finalized`. Initialization is idempotent: a
//! second call returns the existing region address without another
//! `INIT_VIRTIO` hypercall. Every operation after `finalize` fails with
//! [`BridgeError::Finalized`].
//!
//! ## Completions
//!
//! There is one completion slot for the whole system, so completions are
//! serialized: at most one is between `Completed` and `Acknowledged` at a time.

use crate::error::{BridgeError, Result};
use crate::hypercall::{self, nr, HypercallChannel};
use crate::layout::{Completion, Request};
use crate::notify::{Notification, NotifyBits};
use crate::region::SharedRegion;
use serde::Serialize;
use spin::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

enum Lifecycle {
    Unmapped,
    Forwarding(Arc<SharedRegion>),
    Finalized,
}

#[derive(Default)]
struct Counters {
    appended: AtomicU64,
    overflowed: AtomicU64,
    delivered: AtomicU64,
    completed: AtomicU64,
    faults: AtomicU64,
}

/// Point-in-time bridge statistics
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BridgeStats {
    /// Requests accepted into the queue
    pub appended: u64,
    /// Requests rejected because the queue was full
    pub overflowed: u64,
    /// Requests handed to the backend
    pub delivered: u64,
    /// Completions acknowledged by the hypervisor
    pub completed: u64,
    /// Backend wakeups actually raised
    pub notifications: u64,
    /// Hypercalls that returned an error
    pub faults: u64,
    /// Requests currently waiting in the queue
    pub pending: u64,
}

/// The bridge driver: owns the shared region, the notification and the
/// hypercall channel
pub struct KernelBridge<H: HypercallChannel> {
    hypercall: H,
    state: Mutex<Lifecycle>,
    notify: Notification,
    /// Delivered-but-unacknowledged requests per processor
    delivered: Mutex<HashMap<u64, usize>>,
    /// Held for the whole submit/take/finish sequence
    completing: Mutex<()>,
    counters: Counters,
}

impl<H: HypercallChannel> KernelBridge<H> {
    /// Create an unmapped bridge issuing hypercalls through `hypercall`
    pub fn new(hypercall: H) -> Self {
        Self {
            hypercall,
            state: Mutex::new(Lifecycle::Unmapped),
            notify: Notification::new(),
            delivered: Mutex::new(HashMap::new()),
            completing: Mutex::new(()),
            counters: Counters::default(),
        }
    }

    /// The hypercall channel in use
    pub fn hypercall(&self) -> &H {
        &self.hypercall
    }

    /// The shared region, once forwarding is initialized
    pub fn region(&self) -> Result<Arc<SharedRegion>> {
        match &*self.state.lock() {
            Lifecycle::Forwarding(region) => Ok(region.clone()),
            Lifecycle::Unmapped => Err(BridgeError::NotInitialized),
            Lifecycle::Finalized => Err(BridgeError::Finalized),
        }
    }

    pub fn is_forwarding(&self) -> bool {
        matches!(*self.state.lock(), Lifecycle::Forwarding(_))
    }

    /// Allocate the shared region and register it with the hypervisor
    ///
    /// Returns the region address. Idempotent while forwarding.
    pub fn init_forwarding(&self) -> Result<u64> {
        let mut state = self.state.lock();
        match &*state {
            Lifecycle::Forwarding(region) => {
                debug!("Virtio forwarding already initialized at {:#x}", region.address());
                return Ok(region.address());
            }
            Lifecycle::Finalized => return Err(BridgeError::Finalized),
            Lifecycle::Unmapped => {}
        }

        let region = SharedRegion::new()?;
        let address = region.address();

        let raw = self.hypercall.call_with_arg(nr::INIT_VIRTIO, address);
        if let Err(e) = hypercall::check(nr::INIT_VIRTIO, raw) {
            self.counters.faults.fetch_add(1, Ordering::Relaxed);
            error!("Failed to register shared region: {}", e);
            return Err(e.into());
        }

        *state = Lifecycle::Forwarding(Arc::new(region));
        info!("Virtio forwarding initialized, region at {:#x}", address);
        Ok(address)
    }

    /// Producer entry point: queue a trapped access for the backend
    ///
    /// Wakes the backend only when the queue goes from empty to non-empty.
    /// A full queue rejects the request and reports
    /// [`BridgeError::QueueOverflow`] to the producer, which must retry.
    pub fn forward_request(&self, req: Request) -> Result<()> {
        let region = self.region()?;

        match region.append(&req) {
            Ok(pending) => {
                self.counters.appended.fetch_add(1, Ordering::Relaxed);
                trace!(
                    "Queued {:?} cpu={} addr={:#x} pending={}",
                    req.direction,
                    req.cpu,
                    req.address,
                    pending
                );
                if pending == 1 {
                    self.notify.signal(NotifyBits::WORK);
                }
                Ok(())
            }
            Err(e) => {
                self.counters.overflowed.fetch_add(1, Ordering::Relaxed);
                warn!("Rejected request from cpu {}: {}", req.cpu, e);
                Err(e.into())
            }
        }
    }

    /// Block until at least one request is pending, then take them all
    ///
    /// Returns [`BridgeError::Interrupted`] if [`interrupt`](Self::interrupt)
    /// fires while the queue is empty, and [`BridgeError::Finalized`] once the
    /// bridge is torn down.
    pub fn retrieve_work(&self) -> Result<Vec<Request>> {
        loop {
            let region = self.region()?;
            let batch = region.drain()?;
            drop(region);

            if !batch.is_empty() {
                let mut delivered = self.delivered.lock();
                for req in &batch {
                    *delivered.entry(req.cpu).or_default() += 1;
                }
                drop(delivered);

                self.counters
                    .delivered
                    .fetch_add(batch.len() as u64, Ordering::Relaxed);
                trace!("Delivering {} request(s)", batch.len());
                return Ok(batch);
            }

            let woke = self
                .notify
                .wait(NotifyBits::WORK | NotifyBits::INTERRUPT | NotifyBits::FINALIZE);

            if woke.contains(NotifyBits::FINALIZE) {
                // Sticky: pass it on to any other waiter
                self.notify.signal(NotifyBits::FINALIZE);
                return Err(BridgeError::Finalized);
            }
            if woke.contains(NotifyBits::INTERRUPT) {
                debug!("Work retrieval interrupted");
                return Err(BridgeError::Interrupted);
            }
        }
    }

    /// Hand a result back to the hypervisor
    ///
    /// Fails with [`BridgeError::StaleCompletion`] if no request from
    /// `res.cpu` is outstanding and with [`BridgeError::DoubleCompletion`] if
    /// the slot is still occupied; neither changes any state. A hypervisor
    /// fault leaves the request delivered so the completion can be retried.
    pub fn submit_completion(&self, res: Completion) -> Result<()> {
        let region = self.region()?;
        let _serial = self.completing.lock();

        if self.outstanding(res.cpu) == 0 {
            warn!("Stale completion for cpu {}", res.cpu);
            return Err(BridgeError::StaleCompletion { cpu: res.cpu });
        }

        region.submit_result(&res)?;
        let taken = region.take_result();
        debug_assert_eq!(taken, Some(res));

        let raw = self.hypercall.call(nr::FINISH_REQ);
        if let Err(e) = hypercall::check(nr::FINISH_REQ, raw) {
            self.counters.faults.fetch_add(1, Ordering::Relaxed);
            error!("Finish hypercall for cpu {} failed: {}", res.cpu, e);
            return Err(e.into());
        }

        let mut delivered = self.delivered.lock();
        if let Some(count) = delivered.get_mut(&res.cpu) {
            *count -= 1;
            if *count == 0 {
                delivered.remove(&res.cpu);
            }
        }
        drop(delivered);

        self.counters.completed.fetch_add(1, Ordering::Relaxed);
        trace!("Completed cpu={} value={:#x} kind={:?}", res.cpu, res.value, res.kind);
        Ok(())
    }

    /// Number of delivered, unacknowledged requests from `cpu`
    pub fn outstanding(&self, cpu: u64) -> usize {
        self.delivered.lock().get(&cpu).copied().unwrap_or(0)
    }

    /// Make a blocked (or the next) empty-queue [`retrieve_work`](Self::retrieve_work)
    /// return [`BridgeError::Interrupted`]
    pub fn interrupt(&self) {
        self.notify.signal(NotifyBits::INTERRUPT);
    }

    /// Tear the bridge down, failing every blocked retrieval
    pub fn finalize(&self) -> Result<()> {
        let previous = core::mem::replace(&mut *self.state.lock(), Lifecycle::Finalized);
        if let Lifecycle::Finalized = previous {
            return Err(BridgeError::Finalized);
        }

        self.notify.signal(NotifyBits::FINALIZE);
        info!("Virtio forwarding finalized");
        Ok(())
    }

    /// Current statistics
    pub fn stats(&self) -> BridgeStats {
        let pending = self.region().map(|r| r.pending() as u64).unwrap_or(0);

        BridgeStats {
            appended: self.counters.appended.load(Ordering::Relaxed),
            overflowed: self.counters.overflowed.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            notifications: self.notify.raised(),
            faults: self.counters.faults.load(Ordering::Relaxed),
            pending,
        }
    }
}

#[cfg(target_arch = "aarch64")]
impl KernelBridge<crate::hypercall::Hvc> {
    /// Bridge issuing real `hvc` instructions
    ///
    /// # Safety
    /// See [`Hvc::new`](crate::hypercall::Hvc::new).
    pub unsafe fn on_hardware() -> Self {
        Self::new(crate::hypercall::Hvc::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypercall::RecordingHypercall;
    use crate::layout::{Direction, RegionKind};

    fn bridge() -> KernelBridge<RecordingHypercall> {
        let bridge = KernelBridge::new(RecordingHypercall::new());
        bridge.init_forwarding().unwrap();
        bridge
    }

    fn read(cpu: u64) -> Request {
        Request::trapped(cpu, 1, 0xa003c00, 0x70, 4, 0, Direction::Read)
    }

    #[test]
    fn test_operations_require_init() {
        let bridge = KernelBridge::new(RecordingHypercall::new());
        assert!(matches!(
            bridge.forward_request(read(0)),
            Err(BridgeError::NotInitialized)
        ));
        assert!(matches!(bridge.retrieve_work(), Err(BridgeError::NotInitialized)));
        assert!(!bridge.is_forwarding());
    }

    #[test]
    fn test_init_registers_region_address() {
        let bridge = KernelBridge::new(RecordingHypercall::new());
        let address = bridge.init_forwarding().unwrap();

        let calls = bridge.hypercall().calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].number, nr::INIT_VIRTIO);
        assert_eq!(calls[0].arg, Some(address));
        assert_eq!(bridge.region().unwrap().address(), address);
    }

    #[test]
    fn test_init_fault_leaves_bridge_unmapped() {
        let hc = RecordingHypercall::new();
        hc.script_error(nr::INIT_VIRTIO, -12);
        let bridge = KernelBridge::new(hc);

        let err = bridge.init_forwarding().unwrap_err();
        assert!(matches!(err, BridgeError::HypervisorFault(e) if e.code == -12));
        assert!(!bridge.is_forwarding());

        // A later attempt may succeed
        bridge.init_forwarding().unwrap();
        assert!(bridge.is_forwarding());
        assert_eq!(bridge.stats().faults, 1);
    }

    #[test]
    fn test_only_first_append_notifies() {
        let bridge = bridge();
        for cpu in 0..3 {
            bridge.forward_request(read(cpu)).unwrap();
        }
        assert_eq!(bridge.stats().notifications, 1);

        assert_eq!(bridge.retrieve_work().unwrap().len(), 3);
        bridge.forward_request(read(0)).unwrap();
        assert_eq!(bridge.stats().notifications, 1, "WORK bit still set, nothing new raised");
    }

    #[test]
    fn test_delivery_tracks_outstanding() {
        let bridge = bridge();
        bridge.forward_request(read(2)).unwrap();
        bridge.forward_request(read(2)).unwrap();
        bridge.retrieve_work().unwrap();
        assert_eq!(bridge.outstanding(2), 2);

        bridge
            .submit_completion(Completion::new(2, 0, RegionKind::Config))
            .unwrap();
        assert_eq!(bridge.outstanding(2), 1);
    }

    #[test]
    fn test_finish_fault_keeps_request_delivered() {
        let bridge = bridge();
        bridge.forward_request(read(1)).unwrap();
        bridge.retrieve_work().unwrap();

        bridge.hypercall().script_error(nr::FINISH_REQ, -5);
        let done = Completion::new(1, 3, RegionKind::Config);
        assert!(matches!(
            bridge.submit_completion(done),
            Err(BridgeError::HypervisorFault(_))
        ));
        assert_eq!(bridge.outstanding(1), 1);

        bridge.submit_completion(done).unwrap();
        assert_eq!(bridge.outstanding(1), 0);
        assert_eq!(bridge.hypercall().count(nr::FINISH_REQ), 2);
    }

    #[test]
    fn test_pending_interrupt_returns_on_empty_queue() {
        let bridge = bridge();
        bridge.interrupt();
        assert!(matches!(bridge.retrieve_work(), Err(BridgeError::Interrupted)));
    }

    #[test]
    fn test_finalize_twice_is_detected() {
        let bridge = bridge();
        bridge.finalize().unwrap();
        assert!(matches!(bridge.finalize(), Err(BridgeError::Finalized)));
        assert!(matches!(bridge.init_forwarding(), Err(BridgeError::Finalized)));
        assert!(matches!(
            bridge.submit_completion(Completion::new(0, 0, RegionKind::Data)),
            Err(BridgeError::Finalized)
        ));
    }
}
