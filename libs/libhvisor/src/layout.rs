//! Shared memory layout
//!
//! The records in this module are mapped into both the bridge driver and the
//! userspace backend. Their layout MUST match `struct hvisor_device_region`
//! in the driver header; any drift corrupts every forwarded access.
//!
//! The raw `Device*` records are what lives in shared memory. [`Request`] and
//! [`Completion`] are the typed views the rest of the crate works with.

use crate::error::BridgeError;

/// Capacity of the pending request queue
pub const MAX_REQ: usize = 4;

/// Bytes mapped for the shared region
pub const MMAP_SIZE: usize = 1024;

/// Allocation granule for the shared region (one page holds the whole mapping)
pub const PAGE_SIZE: usize = 4096;

/// Signal raised to wake the backend when work arrives
pub const SIGHVI: i32 = 10;

/// Offset of the virtio-mmio QueueNotify register
pub const QUEUE_NOTIFY: u64 = 0x50;

/// One trapped access as stored in the request queue
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeviceReq {
    pub src_cpu: u64,
    /// Guest intermediate physical address
    pub address: u64,
    pub size: u64,
    pub value: u64,
    pub src_cell: u32,
    pub is_write: u8,
    pub is_cfg: u8,
}

/// Emulation result as stored in the completion slot
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeviceResult {
    pub src_cpu: u64,
    pub value: u64,
    pub is_cfg: u8,
}

/// The whole shared region
#[repr(C)]
#[derive(Clone, Copy, Debug, Default)]
pub struct DeviceRegion {
    /// Number of valid entries at the front of `req_list`
    pub nreq: u32,
    pub req_list: [DeviceReq; MAX_REQ],
    pub res: DeviceResult,
}

const _: () = assert!(core::mem::size_of::<DeviceRegion>() <= MMAP_SIZE);
const _: () = assert!(MMAP_SIZE <= PAGE_SIZE);

/// Direction of a trapped access
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Direction {
    Read,
    Write,
}

impl Direction {
    fn from_flag(flag: u8) -> Result<Self, BridgeError> {
        match flag {
            0 => Ok(Self::Read),
            1 => Ok(Self::Write),
            _ => Err(BridgeError::MalformedRecord("is_write")),
        }
    }

    fn as_flag(self) -> u8 {
        match self {
            Self::Read => 0,
            Self::Write => 1,
        }
    }
}

/// Which part of the device window an access targets
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RegionKind {
    /// Register or configuration-space access; the trapping CPU waits for the result
    Config,
    /// Queue notification; the result carries the interrupt to inject
    Data,
}

impl RegionKind {
    /// Classify an access by its offset into the device window
    pub fn for_offset(offset: u64) -> Self {
        if offset == QUEUE_NOTIFY {
            Self::Data
        } else {
            Self::Config
        }
    }

    fn from_flag(flag: u8) -> Result<Self, BridgeError> {
        match flag {
            0 => Ok(Self::Data),
            1 => Ok(Self::Config),
            _ => Err(BridgeError::MalformedRecord("is_cfg")),
        }
    }

    fn as_flag(self) -> u8 {
        match self {
            Self::Data => 0,
            Self::Config => 1,
        }
    }
}

/// A trapped guest device access awaiting emulation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Request {
    /// Processor that trapped
    pub cpu: u64,
    /// Guest intermediate physical address
    pub address: u64,
    /// Access width in bytes
    pub size: u64,
    /// Written value (writes) or zero (reads)
    pub value: u64,
    /// Cell the access came from
    pub cell: u32,
    pub direction: Direction,
    pub kind: RegionKind,
}

impl Request {
    /// Build a request from an access trapped at `offset` inside the device
    /// window starting at `base`.
    pub fn trapped(
        cpu: u64,
        cell: u32,
        base: u64,
        offset: u64,
        size: u64,
        value: u64,
        direction: Direction,
    ) -> Self {
        Self {
            cpu,
            address: base.wrapping_add(offset),
            size,
            value,
            cell,
            direction,
            kind: RegionKind::for_offset(offset),
        }
    }

    pub fn is_write(&self) -> bool {
        self.direction == Direction::Write
    }

    /// Encode into the shared-memory record
    pub fn to_raw(&self) -> DeviceReq {
        DeviceReq {
            src_cpu: self.cpu,
            address: self.address,
            size: self.size,
            value: self.value,
            src_cell: self.cell,
            is_write: self.direction.as_flag(),
            is_cfg: self.kind.as_flag(),
        }
    }

    /// Decode a shared-memory record, rejecting invalid flag bytes
    pub fn from_raw(raw: &DeviceReq) -> Result<Self, BridgeError> {
        Ok(Self {
            cpu: raw.src_cpu,
            address: raw.address,
            size: raw.size,
            value: raw.value,
            cell: raw.src_cell,
            direction: Direction::from_flag(raw.is_write)?,
            kind: RegionKind::from_flag(raw.is_cfg)?,
        })
    }
}

/// The emulation outcome for one request, correlated by processor id
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Completion {
    pub cpu: u64,
    pub value: u64,
    pub kind: RegionKind,
}

impl Completion {
    pub fn new(cpu: u64, value: u64, kind: RegionKind) -> Self {
        Self { cpu, value, kind }
    }

    /// Completion answering `req` with `value`
    pub fn for_request(req: &Request, value: u64) -> Self {
        Self::new(req.cpu, value, req.kind)
    }

    pub fn to_raw(&self) -> DeviceResult {
        DeviceResult {
            src_cpu: self.cpu,
            value: self.value,
            is_cfg: self.kind.as_flag(),
        }
    }

    pub fn from_raw(raw: &DeviceResult) -> Result<Self, BridgeError> {
        Ok(Self {
            cpu: raw.src_cpu,
            value: raw.value,
            kind: RegionKind::from_flag(raw.is_cfg)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notify_offset_is_data_access() {
        assert_eq!(RegionKind::for_offset(QUEUE_NOTIFY), RegionKind::Data);
        assert_eq!(RegionKind::for_offset(0x70), RegionKind::Config);
        assert_eq!(RegionKind::for_offset(0x100), RegionKind::Config);
    }

    #[test]
    fn test_trapped_request_address() {
        let req = Request::trapped(2, 1, 0xa003e00, 0x50, 4, 0, Direction::Write);
        assert_eq!(req.address, 0xa003e50);
        assert_eq!(req.kind, RegionKind::Data);
        assert!(req.is_write());
    }

    #[test]
    fn test_raw_flags() {
        let req = Request::trapped(0, 1, 0x1000, 0x70, 4, 0, Direction::Read);
        let raw = req.to_raw();
        assert_eq!(raw.is_write, 0);
        assert_eq!(raw.is_cfg, 1);
        assert_eq!(Request::from_raw(&raw).unwrap(), req);
    }

    #[test]
    fn test_malformed_flags_rejected() {
        let raw = DeviceReq {
            is_write: 2,
            ..Default::default()
        };
        assert!(matches!(
            Request::from_raw(&raw),
            Err(BridgeError::MalformedRecord("is_write"))
        ));

        let raw = DeviceResult {
            is_cfg: 0xff,
            ..Default::default()
        };
        assert!(matches!(
            Completion::from_raw(&raw),
            Err(BridgeError::MalformedRecord("is_cfg"))
        ));
    }

    #[test]
    fn test_completion_echoes_kind() {
        let req = Request::trapped(3, 1, 0x1000, 0x50, 4, 1, Direction::Write);
        let done = Completion::for_request(&req, 67);
        assert_eq!(done.cpu, 3);
        assert_eq!(done.kind, RegionKind::Data);
    }
}
