//! virtio-mmio transport with no device backend behind it
//!
//! Answers the identification registers so a guest driver can probe the
//! device. Every other register reads as zero and writes are dropped, so the
//! driver sees a transport that never offers features or queues.

use crate::dispatch::DeviceModel;
use tracing::trace;

/// "virt"
pub const VIRTIO_MMIO_MAGIC: u64 = 0x7472_6976;
pub const VIRTIO_MMIO_VERSION_MODERN: u64 = 2;
/// "QEMU"
pub const VIRTIO_VENDOR_ID: u64 = 0x554d_4551;

pub mod reg {
    pub const MAGIC_VALUE: u64 = 0x000;
    pub const VERSION: u64 = 0x004;
    pub const DEVICE_ID: u64 = 0x008;
    pub const VENDOR_ID: u64 = 0x00c;
}

pub struct UnpluggedTransport {
    device_id: u32,
}

impl UnpluggedTransport {
    pub fn new(device_id: u32) -> Self {
        Self { device_id }
    }
}

impl DeviceModel for UnpluggedTransport {
    fn read(&mut self, offset: u64, _size: u64) -> u64 {
        match offset {
            reg::MAGIC_VALUE => VIRTIO_MMIO_MAGIC,
            reg::VERSION => VIRTIO_MMIO_VERSION_MODERN,
            reg::DEVICE_ID => self.device_id as u64,
            reg::VENDOR_ID => VIRTIO_VENDOR_ID,
            _ => 0,
        }
    }

    fn write(&mut self, offset: u64, value: u64, _size: u64) {
        trace!("Dropped write {:#x} to register {:#x}", value, offset);
    }
}
