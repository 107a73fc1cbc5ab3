//! # libhvisor - Virtio forwarding bridge for the hvisor root cell
//!
//! Guest cells trap on their virtio MMIO windows. The hypervisor forwards
//! each access into a page shared with the root cell, where a userspace
//! backend emulates the device and hands a result back.
//!
//! ## Features
//!
//! - **Shared region** - fixed-layout request queue and completion slot
//! - **Kernel bridge** - init, forward, retrieve, complete, finalize
//! - **Notification** - coalesced wakeups for the backend
//! - **Hypercalls** - `hvc` wrappers plus a recording channel for tests
//! - **Control surface** - the ioctl command set, in-process or on `/dev/hvisor`
//!
//! ## Quick Start
//!
//! ```no_run
//! use libhvisor::prelude::*;
//!
//! let bridge = KernelBridge::new(RecordingHypercall::new());
//! let _region = bridge.init_forwarding()?;
//!
//! // A guest vcpu traps on a queue-notify write
//! let req = Request::trapped(0, 1, 0xa003e00, 0x50, 4, 0, Direction::Write);
//! bridge.forward_request(req)?;
//!
//! // The backend takes the work and completes it
//! for req in bridge.retrieve_work()? {
//!     bridge.submit_completion(Completion::for_request(&req, 0))?;
//! }
//! # Ok::<(), libhvisor::BridgeError>(())
//! ```
//!
//! ## Error Handling
//!
//! Every operation returns `Result<T, BridgeError>`:
//!
//! ```no_run
//! use libhvisor::prelude::*;
//!
//! # let bridge = KernelBridge::new(RecordingHypercall::new());
//! # let req = Request::trapped(0, 1, 0, 0, 4, 0, Direction::Read);
//! match bridge.forward_request(req) {
//!     Ok(()) => {}
//!     Err(BridgeError::QueueOverflow { .. }) => { /* retry after the backend drains */ }
//!     Err(e) => eprintln!("forward failed: {}", e),
//! }
//! ```

pub mod bridge;
pub mod control;
#[cfg(unix)]
pub mod device;
pub mod error;
pub mod hypercall;
pub mod layout;
pub mod notify;
pub mod region;

pub use bridge::{BridgeStats, KernelBridge};
pub use control::{dispatch, ControlArg, ControlCommand, ControlReply, ControlSurface};
#[cfg(unix)]
pub use device::{block_hvi, hvi_blocked, HvisorDevice, DEFAULT_DEVICE};
pub use error::{BridgeError, HypercallError, RegionError, Result};
pub use hypercall::{HypercallChannel, RecordingHypercall};
pub use layout::{
    Completion, DeviceRegion, DeviceReq, DeviceResult, Direction, RegionKind, Request, MAX_REQ,
    MMAP_SIZE, PAGE_SIZE, SIGHVI,
};
pub use notify::{Notification, NotifyBits};
pub use region::SharedRegion;

/// Prelude for common imports
pub mod prelude {
    pub use crate::bridge::KernelBridge;
    pub use crate::control::ControlSurface;
    pub use crate::error::{BridgeError, Result};
    pub use crate::hypercall::{HypercallChannel, RecordingHypercall};
    pub use crate::layout::{Completion, Direction, RegionKind, Request};
}
