//! Userspace client for the `/dev/hvisor` device node
//!
//! The driver side of the bridge lives in the root cell's kernel. This client
//! speaks to it through ioctls and the shared mapping:
//!
//! 1. `INIT_VIRTIO`, then map [`MMAP_SIZE`] bytes of the node
//! 2. `GET_TASK` moves pending requests to the front of the mapped list and
//!    returns how many there are; zero means idle
//! 3. while idle, wait for [`SIGHVI`]
//! 4. write the result record into the mapped slot, then `FINISH`
//!
//! Failed ioctls carry the errno from [`BridgeError::errno`], which is mapped
//! back to the same error here.

use crate::control::ControlSurface;
use crate::error::{BridgeError, Result};
use crate::layout::{Completion, DeviceRegion, Request, MAX_REQ, MMAP_SIZE, SIGHVI};
use memmap2::{MmapMut, MmapOptions};
use nix::errno::Errno;
use nix::sys::signal::{SigSet, Signal};
use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::atomic::{fence, AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, trace};

/// Default device node
pub const DEFAULT_DEVICE: &str = "/dev/hvisor";

nix::ioctl_none!(hvisor_init_virtio, 1, 0);
nix::ioctl_none!(hvisor_get_task, 1, 1);
nix::ioctl_none!(hvisor_finish, 1, 2);

fn hvi_set() -> Result<SigSet> {
    let signal = Signal::try_from(SIGHVI).map_err(|e| BridgeError::Io(e.into()))?;
    let mut set = SigSet::empty();
    set.add(signal);
    Ok(set)
}

/// Block [`SIGHVI`] on the calling thread
///
/// The driver signals the whole process, and the default action for the
/// signal terminates it. Call this before spawning any other thread so every
/// thread inherits the mask and the signal stays pending for
/// `sigtimedwait`.
pub fn block_hvi() -> Result<()> {
    hvi_set()?
        .thread_block()
        .map_err(|e| BridgeError::Io(e.into()))
}

/// Whether [`SIGHVI`] is blocked on the calling thread
pub fn hvi_blocked() -> Result<bool> {
    let mask = SigSet::thread_get_mask().map_err(|e| BridgeError::Io(e.into()))?;
    let signal = Signal::try_from(SIGHVI).map_err(|e| BridgeError::Io(e.into()))?;
    Ok(mask.contains(signal))
}

/// Validate a `GET_TASK` count against the mapped list
fn batch_len(count: libc::c_int) -> Result<usize> {
    match usize::try_from(count) {
        Ok(len) if len <= MAX_REQ => Ok(len),
        _ => Err(BridgeError::MalformedRecord("nreq")),
    }
}

/// An open handle on the bridge driver
pub struct HvisorDevice {
    file: File,
    path: PathBuf,
    mapping: Mutex<Option<MmapMut>>,
    interrupted: AtomicBool,
    /// Upper bound on a single SIGHVI wait, so interrupts are noticed
    poll_interval: Duration,
}

impl HvisorDevice {
    /// Open the device node
    pub fn open(path: impl AsRef<Path>, poll_interval: Duration) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        debug!("Opened {}", path.display());

        Ok(Self {
            file,
            path,
            mapping: Mutex::new(None),
            interrupted: AtomicBool::new(false),
            poll_interval,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn mapping(&self) -> MutexGuard<'_, Option<MmapMut>> {
        self.mapping.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Wait for SIGHVI for at most one poll interval
    fn wait_signal(&self) -> Result<()> {
        let set = hvi_set()?;
        let timeout = libc::timespec {
            tv_sec: self.poll_interval.as_secs() as libc::time_t,
            tv_nsec: self.poll_interval.subsec_nanos() as libc::c_long,
        };

        // SAFETY: set and timeout are valid for the duration of the call
        let rc = unsafe { libc::sigtimedwait(set.as_ref(), std::ptr::null_mut(), &timeout) };
        if rc < 0 {
            match Errno::last() {
                Errno::EAGAIN | Errno::EINTR => {}
                errno => return Err(BridgeError::Io(errno.into())),
            }
        }
        Ok(())
    }

    fn read_requests(&self, count: usize) -> Result<Vec<Request>> {
        let mapping = self.mapping();
        let map = mapping.as_ref().ok_or(BridgeError::NotInitialized)?;
        let region = map.as_ptr().cast::<DeviceRegion>();

        fence(Ordering::SeqCst);
        (0..count)
            .map(|idx| {
                // SAFETY: the mapping is MMAP_SIZE bytes, which holds a whole DeviceRegion
                let raw = unsafe { std::ptr::addr_of!((*region).req_list[idx]).read_volatile() };
                Request::from_raw(&raw)
            })
            .collect()
    }
}

/// Map a failed ioctl back to the bridge error the driver reported
fn from_errno(errno: Errno, cpu: u64) -> BridgeError {
    match errno {
        Errno::EAGAIN => BridgeError::QueueOverflow { capacity: MAX_REQ },
        Errno::EBUSY => BridgeError::DoubleCompletion { pending_cpu: cpu },
        Errno::ENOENT => BridgeError::StaleCompletion { cpu },
        Errno::ENODEV => BridgeError::NotInitialized,
        Errno::ESHUTDOWN => BridgeError::Finalized,
        Errno::EINTR => BridgeError::Interrupted,
        other => BridgeError::Io(other.into()),
    }
}

impl ControlSurface for HvisorDevice {
    fn init_forwarding(&self) -> Result<u64> {
        let mut mapping = self.mapping();
        if let Some(map) = mapping.as_ref() {
            return Ok(map.as_ptr() as u64);
        }

        // Normally already blocked process-wide; cover callers that skipped it
        block_hvi()?;

        // SAFETY: fd is a valid, open descriptor for the device node
        unsafe { hvisor_init_virtio(self.file.as_raw_fd()) }.map_err(|e| from_errno(e, 0))?;

        // SAFETY: the driver keeps the region mapped until the node is closed
        let map = unsafe { MmapOptions::new().len(MMAP_SIZE).map_mut(&self.file) }
            .map_err(|e| BridgeError::MappingFailure(e.to_string()))?;

        let address = map.as_ptr() as u64;
        *mapping = Some(map);
        info!("Mapped {} shared region at {:#x}", self.path.display(), address);
        Ok(address)
    }

    fn get_task(&self) -> Result<Vec<Request>> {
        loop {
            if self.interrupted.swap(false, Ordering::SeqCst) {
                return Err(BridgeError::Interrupted);
            }

            // SAFETY: fd is a valid, open descriptor for the device node
            let count = unsafe { hvisor_get_task(self.file.as_raw_fd()) }
                .map_err(|e| from_errno(e, 0))?;
            let count = batch_len(count)?;
            if count > 0 {
                trace!("GET_TASK returned {} request(s)", count);
                return self.read_requests(count);
            }

            self.wait_signal()?;
        }
    }

    fn finish(&self, res: Completion) -> Result<()> {
        {
            let mut mapping = self.mapping();
            let map = mapping.as_mut().ok_or(BridgeError::NotInitialized)?;
            let region = map.as_mut_ptr().cast::<DeviceRegion>();

            // SAFETY: the mapping is MMAP_SIZE bytes, which holds a whole DeviceRegion
            unsafe { std::ptr::addr_of_mut!((*region).res).write_volatile(res.to_raw()) };
            fence(Ordering::SeqCst);
        }

        // SAFETY: fd is a valid, open descriptor for the device node
        unsafe { hvisor_finish(self.file.as_raw_fd()) }.map_err(|e| from_errno(e, res.cpu))?;
        Ok(())
    }

    fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
    }
}
