//! Raw hypercall interface
//!
//! hvisor takes the call number in `x0`, at most one argument in `x1`, and
//! writes its result back into `x0`. The trap instruction is `hvc #0x4a48`.
//!
//! The rest of the crate only talks to [`HypercallChannel`], so the bridge can
//! run against [`RecordingHypercall`] on any host.

use crate::error::HypercallError;
use spin::Mutex;
use std::collections::VecDeque;

/// Hypercall numbers
///
/// These MUST match the hypervisor's dispatch table.
pub mod nr {
    /// Register the shared region with the hypervisor
    /// Args: address of the region
    pub const INIT_VIRTIO: u64 = 9;

    /// Tell the hypervisor a result is ready in the completion slot
    pub const FINISH_REQ: u64 = 10;
}

/// Immediate encoded in the trap instruction
pub const HVC_IMM: u16 = 0x4a48;

/// Largest error code in the reserved range (`-MAX_ERRNO..=-1`)
pub const MAX_ERRNO: i64 = 4095;

/// Interpret a raw `x0` value returned by call `number`
pub fn check(number: u64, raw: u64) -> Result<u64, HypercallError> {
    let code = raw as i64;
    if (-MAX_ERRNO..0).contains(&code) {
        Err(HypercallError { number, code })
    } else {
        Ok(raw)
    }
}

/// A synchronous call into the hypervisor
pub trait HypercallChannel: Send + Sync {
    /// Issue call `number` with no argument
    fn call(&self, number: u64) -> u64;

    /// Issue call `number` with one argument
    fn call_with_arg(&self, number: u64, arg: u64) -> u64;
}

/// Hardware hypercall channel
///
/// Only usable from a context the hypervisor accepts `hvc` from; at EL0 the
/// instruction is undefined.
#[cfg(target_arch = "aarch64")]
pub struct Hvc {
    _priv: (),
}

#[cfg(target_arch = "aarch64")]
impl Hvc {
    /// # Safety
    /// The caller must run at EL1 in a cell managed by hvisor.
    pub unsafe fn new() -> Self {
        Self { _priv: () }
    }
}

#[cfg(target_arch = "aarch64")]
impl HypercallChannel for Hvc {
    #[inline]
    fn call(&self, number: u64) -> u64 {
        let ret: u64;
        core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
        // SAFETY: construction of `Hvc` guarantees an hvisor-managed EL1 context
        unsafe {
            core::arch::asm!(
                "hvc #0x4a48",
                inout("x0") number => ret,
                options(nostack),
            );
        }
        core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
        ret
    }

    #[inline]
    fn call_with_arg(&self, number: u64, arg: u64) -> u64 {
        let ret: u64;
        core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
        // SAFETY: see `call`
        unsafe {
            core::arch::asm!(
                "hvc #0x4a48",
                inout("x0") number => ret,
                in("x1") arg,
                options(nostack),
            );
        }
        core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
        ret
    }
}

/// One call observed by [`RecordingHypercall`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HypercallRecord {
    pub number: u64,
    pub arg: Option<u64>,
}

/// Test double that records calls and answers with scripted results
///
/// Unscripted calls return 0.
#[derive(Default)]
pub struct RecordingHypercall {
    calls: Mutex<Vec<HypercallRecord>>,
    script: Mutex<VecDeque<(u64, u64)>>,
}

impl RecordingHypercall {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer the next call to `number` with `result`
    pub fn script_result(&self, number: u64, result: u64) {
        self.script.lock().push_back((number, result));
    }

    /// Answer the next call to `number` with error `code` (a negative errno)
    pub fn script_error(&self, number: u64, code: i64) {
        self.script_result(number, code as u64);
    }

    /// Every call issued so far, in order
    pub fn calls(&self) -> Vec<HypercallRecord> {
        self.calls.lock().clone()
    }

    /// Number of calls issued with `number`
    pub fn count(&self, number: u64) -> usize {
        self.calls.lock().iter().filter(|c| c.number == number).count()
    }

    fn record(&self, number: u64, arg: Option<u64>) -> u64 {
        self.calls.lock().push(HypercallRecord { number, arg });

        let mut script = self.script.lock();
        match script.iter().position(|(n, _)| *n == number) {
            Some(idx) => script.remove(idx).map(|(_, r)| r).unwrap_or(0),
            None => 0,
        }
    }
}

impl HypercallChannel for RecordingHypercall {
    fn call(&self, number: u64) -> u64 {
        self.record(number, None)
    }

    fn call_with_arg(&self, number: u64, arg: u64) -> u64 {
        self.record(number, Some(arg))
    }
}

impl<H: HypercallChannel + ?Sized> HypercallChannel for std::sync::Arc<H> {
    fn call(&self, number: u64) -> u64 {
        (**self).call(number)
    }

    fn call_with_arg(&self, number: u64, arg: u64) -> u64 {
        (**self).call_with_arg(number, arg)
    }
}
