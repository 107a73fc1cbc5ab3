//! Backend service loop
//!
//! Pulls batches of trapped accesses off the control surface, emulates each
//! one in order and hands every result back before asking for more.

use crate::dispatch::{DeviceTable, DispatchError};
use libhvisor::{BridgeError, Completion, ControlSurface, Request};
use tracing::{debug, error, info, warn};

/// Counters for one run of the loop
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BackendSummary {
    /// Requests answered by a device
    pub handled: u64,
    /// Requests that matched no device and were answered with zero
    pub unmatched: u64,
    /// Results the bridge refused
    pub rejected: u64,
}

pub struct Backend<S: ControlSurface> {
    surface: S,
    table: DeviceTable,
    summary: BackendSummary,
}

impl<S: ControlSurface> Backend<S> {
    pub fn new(surface: S, table: DeviceTable) -> Self {
        Self {
            surface,
            table,
            summary: BackendSummary::default(),
        }
    }

    /// Initialize forwarding and serve requests until interrupted
    pub fn run(&mut self) -> Result<BackendSummary, BridgeError> {
        let region = self.surface.init_forwarding()?;
        info!(
            "Serving {} device(s), shared region at {:#x}",
            self.table.len(),
            region
        );

        loop {
            match self.surface.get_task() {
                Ok(batch) => {
                    for req in batch {
                        self.serve(&req)?;
                    }
                }
                Err(BridgeError::Interrupted) => {
                    info!("Backend interrupted");
                    break;
                }
                Err(BridgeError::Finalized) => {
                    info!("Bridge finalized");
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(self.summary)
    }

    fn serve(&mut self, req: &Request) -> Result<(), BridgeError> {
        let res = match self.table.handle(req) {
            Ok(res) => {
                self.summary.handled += 1;
                res
            }
            Err(DispatchError::NoDevice { cell, address }) => {
                // The trapping processor stays suspended until it gets an answer
                error!("No device at {:#x} for cell {}, answering 0", address, cell);
                self.summary.unmatched += 1;
                Completion::for_request(req, 0)
            }
        };

        match self.surface.finish(res) {
            Ok(()) => {
                debug!("Finished cpu={} value={:#x}", res.cpu, res.value);
                Ok(())
            }
            Err(e) if e.is_recoverable() => {
                warn!("Result for cpu {} rejected: {}", res.cpu, e);
                self.summary.rejected += 1;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VirtiodConfig;
    use libhvisor::hypercall::nr;
    use libhvisor::{Direction, KernelBridge, RecordingHypercall};
    use std::sync::Arc;

    type TestBridge = Arc<KernelBridge<RecordingHypercall>>;

    fn setup() -> (TestBridge, Backend<TestBridge>) {
        let bridge = Arc::new(KernelBridge::new(RecordingHypercall::new()));
        bridge.init_forwarding().unwrap();
        let table = DeviceTable::from_config(&VirtiodConfig::default().devices);
        (bridge.clone(), Backend::new(bridge, table))
    }

    #[test]
    fn test_serves_batch_then_stops_on_interrupt() {
        let (bridge, mut backend) = setup();
        bridge
            .forward_request(Request::trapped(0, 1, 0xa003e00, 0x00, 4, 0, Direction::Read))
            .unwrap();
        bridge
            .forward_request(Request::trapped(1, 1, 0xa003e00, 0x50, 4, 0, Direction::Write))
            .unwrap();
        bridge.interrupt();

        let summary = backend.run().unwrap();
        assert_eq!(summary.handled, 2);
        assert_eq!(summary.unmatched, 0);

        assert_eq!(bridge.hypercall().count(nr::INIT_VIRTIO), 1);
        assert_eq!(bridge.hypercall().count(nr::FINISH_REQ), 2);

        // Last result in the slot is the queue-notify write, answered with the irq
        let res = bridge.region().unwrap().snapshot().res;
        assert_eq!(res.src_cpu, 1);
        assert_eq!(res.value, 67);
    }

    #[test]
    fn test_unmatched_request_answered_with_zero() {
        let (bridge, mut backend) = setup();
        bridge
            .forward_request(Request::trapped(2, 9, 0x1000, 0x00, 4, 0, Direction::Read))
            .unwrap();
        bridge.interrupt();

        let summary = backend.run().unwrap();
        assert_eq!(summary.unmatched, 1);
        assert_eq!(bridge.outstanding(2), 0);
        assert_eq!(bridge.region().unwrap().snapshot().res.value, 0);
    }

    #[test]
    fn test_run_after_finalize_fails() {
        let (bridge, mut backend) = setup();
        bridge.finalize().unwrap();
        assert!(matches!(backend.run(), Err(BridgeError::Finalized)));
    }

    #[test]
    fn test_hypervisor_fault_stops_loop() {
        let (bridge, mut backend) = setup();
        bridge.hypercall().script_error(nr::FINISH_REQ, -5);
        bridge
            .forward_request(Request::trapped(0, 1, 0xa003c00, 0x00, 4, 0, Direction::Read))
            .unwrap();

        assert!(matches!(backend.run(), Err(BridgeError::HypervisorFault(_))));
        assert_eq!(bridge.outstanding(0), 1);
    }
}
