//! Shared region queue manager
//!
//! Owns the page that is mapped into the backend and enforces the queue and
//! completion-slot invariants on top of it:
//!
//! - `0 <= nreq <= MAX_REQ`; entries below `nreq` are valid, unread requests
//! - the completion slot holds at most one unconsumed result
//!
//! Both are guarded by one lock. Producers append from any processor, so every
//! critical section is a handful of stores and never blocks.

use crate::error::{BridgeError, RegionError};
use crate::layout::{Completion, DeviceRegion, Request, MAX_REQ, PAGE_SIZE};
use spin::Mutex;
use std::alloc::{self, Layout};
use std::ptr::NonNull;

#[repr(C, align(4096))]
struct AlignedPage([u8; PAGE_SIZE]);

/// Zeroed, page-aligned backing store for [`DeviceRegion`]
struct RegionPage {
    ptr: NonNull<DeviceRegion>,
}

// SAFETY: the page is owned exclusively and only reached through the region lock
unsafe impl Send for RegionPage {}

impl RegionPage {
    fn alloc() -> Result<Self, BridgeError> {
        let layout = Layout::new::<AlignedPage>();
        // SAFETY: layout has non-zero size; an all-zero DeviceRegion is valid
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        NonNull::new(raw.cast::<DeviceRegion>())
            .map(|ptr| Self { ptr })
            .ok_or_else(|| {
                BridgeError::MappingFailure(format!("cannot allocate {PAGE_SIZE} byte region page"))
            })
    }

    fn region(&self) -> &DeviceRegion {
        // SAFETY: ptr is valid for the lifetime of self
        unsafe { self.ptr.as_ref() }
    }

    fn region_mut(&mut self) -> &mut DeviceRegion {
        // SAFETY: ptr is valid and uniquely borrowed through &mut self
        unsafe { self.ptr.as_mut() }
    }
}

impl Drop for RegionPage {
    fn drop(&mut self) {
        // SAFETY: allocated in `alloc` with the same layout
        unsafe { alloc::dealloc(self.ptr.as_ptr().cast(), Layout::new::<AlignedPage>()) }
    }
}

struct Inner {
    page: RegionPage,
    /// Typed copy of the completion slot; `Some` while a result is unconsumed
    slot: Option<Completion>,
}

/// The request queue and completion slot shared with the backend
pub struct SharedRegion {
    inner: Mutex<Inner>,
    address: u64,
}

impl SharedRegion {
    /// Allocate a zeroed region
    pub fn new() -> Result<Self, BridgeError> {
        let page = RegionPage::alloc()?;
        let address = page.ptr.as_ptr() as u64;

        Ok(Self {
            inner: Mutex::new(Inner { page, slot: None }),
            address,
        })
    }

    /// Address handed to the hypervisor at registration time
    pub fn address(&self) -> u64 {
        self.address
    }

    /// Maximum number of pending requests
    pub const fn capacity(&self) -> usize {
        MAX_REQ
    }

    /// Number of valid, unread requests
    pub fn pending(&self) -> usize {
        self.inner.lock().page.region().nreq as usize
    }

    pub fn is_empty(&self) -> bool {
        self.pending() == 0
    }

    /// Append a request at the tail of the queue
    ///
    /// Returns the pending count after the append. At capacity the request is
    /// rejected and the queue is left untouched.
    pub fn append(&self, req: &Request) -> Result<usize, RegionError> {
        let mut inner = self.inner.lock();
        let region = inner.page.region_mut();

        let idx = region.nreq as usize;
        if idx >= MAX_REQ {
            return Err(RegionError::Overflow { capacity: MAX_REQ });
        }

        region.req_list[idx] = req.to_raw();
        region.nreq += 1;
        Ok(idx + 1)
    }

    /// Take every pending request, oldest first, and reset the count
    ///
    /// A record carrying invalid flags fails the whole batch; the queue is
    /// reset either way so a corrupted entry cannot wedge it.
    pub fn drain(&self) -> Result<Vec<Request>, BridgeError> {
        let mut inner = self.inner.lock();
        let region = inner.page.region_mut();

        let count = (region.nreq as usize).min(MAX_REQ);
        let batch: Result<Vec<_>, _> = region.req_list[..count]
            .iter()
            .map(Request::from_raw)
            .collect();
        region.nreq = 0;
        batch
    }

    /// Place a result in the completion slot
    pub fn submit_result(&self, res: &Completion) -> Result<(), RegionError> {
        let mut inner = self.inner.lock();

        if let Some(pending) = inner.slot {
            return Err(RegionError::AlreadyPending { cpu: pending.cpu });
        }

        inner.page.region_mut().res = res.to_raw();
        inner.slot = Some(*res);
        Ok(())
    }

    /// Consume the result in the completion slot, if any
    ///
    /// Only occupancy is released; the raw record stays in place so the
    /// hypervisor can read it while servicing the finish hypercall.
    pub fn take_result(&self) -> Option<Completion> {
        self.inner.lock().slot.take()
    }

    /// Look at the completion slot without consuming it
    pub fn peek_result(&self) -> Option<Completion> {
        self.inner.lock().slot
    }

    /// Copy of the raw shared memory contents
    pub fn snapshot(&self) -> DeviceRegion {
        *self.inner.lock().page.region()
    }
}
