//! Request dispatch to emulated MMIO devices

use crate::config::DeviceConfig;
use crate::unplugged::UnpluggedTransport;
use libhvisor::{Completion, Request};
use thiserror::Error;
use tracing::{debug, trace};

/// Register-level behavior of an emulated device
pub trait DeviceModel: Send {
    /// Read `size` bytes at `offset` into the window
    fn read(&mut self, offset: u64, size: u64) -> u64;

    /// Write `size` bytes of `value` at `offset` into the window
    fn write(&mut self, offset: u64, value: u64, size: u64);
}

/// Dispatch errors
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no device at {address:#x} for cell {cell}")]
    NoDevice { cell: u32, address: u64 },
}

/// An MMIO window bound to a device model
pub struct MmioDevice {
    pub name: String,
    pub cell_id: u32,
    pub base: u64,
    pub len: u64,
    pub irq: u64,
    model: Box<dyn DeviceModel>,
}

impl MmioDevice {
    pub fn new(config: &DeviceConfig, model: Box<dyn DeviceModel>) -> Self {
        Self {
            name: config.name.clone(),
            cell_id: config.cell_id,
            base: config.base,
            len: config.len,
            irq: config.irq,
            model,
        }
    }

    /// Whether this window serves `address` for `cell`
    pub fn contains(&self, cell: u32, address: u64) -> bool {
        cell == self.cell_id && address >= self.base && address - self.base < self.len
    }

    /// Emulate one access and build its completion
    ///
    /// Writes complete with the device's interrupt number; reads with the
    /// register value.
    pub fn handle(&mut self, req: &Request) -> Completion {
        let offset = req.address - self.base;

        let value = if req.is_write() {
            self.model.write(offset, req.value, req.size);
            self.irq
        } else {
            self.model.read(offset, req.size)
        };

        trace!(
            "{}: {:?} offset={:#x} value={:#x}",
            self.name,
            req.direction,
            offset,
            value
        );
        Completion::for_request(req, value)
    }
}

/// Every emulated device, searched by cell and address
#[derive(Default)]
pub struct DeviceTable {
    devices: Vec<MmioDevice>,
}

impl DeviceTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a table of transports from configuration
    pub fn from_config(devices: &[DeviceConfig]) -> Self {
        let mut table = Self::new();
        for config in devices {
            let model = Box::new(UnpluggedTransport::new(config.model.device_id()));
            table.insert(MmioDevice::new(config, model));
        }
        table
    }

    pub fn insert(&mut self, device: MmioDevice) {
        debug!(
            "Registered {} at {:#x}..{:#x} cell={} irq={}",
            device.name,
            device.base,
            device.base.saturating_add(device.len),
            device.cell_id,
            device.irq
        );
        self.devices.push(device);
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Find the device serving `address` for `cell`
    pub fn find(&mut self, cell: u32, address: u64) -> Result<&mut MmioDevice, DispatchError> {
        self.devices
            .iter_mut()
            .find(|dev| dev.contains(cell, address))
            .ok_or(DispatchError::NoDevice { cell, address })
    }

    /// Route a request to its device
    pub fn handle(&mut self, req: &Request) -> Result<Completion, DispatchError> {
        self.find(req.cell, req.address).map(|dev| dev.handle(req))
    }
}
