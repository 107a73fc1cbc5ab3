//! Shared region ABI tests
//!
//! The driver, the hypervisor and the backend all map the same bytes. These
//! tests pin sizes, field offsets and the command numbers so a change on one
//! side is caught before it corrupts forwarded accesses.

use libhvisor::control::ControlCommand;
use libhvisor::hypercall::{nr, HVC_IMM};
use libhvisor::layout::*;
use std::mem::{align_of, offset_of, size_of};

mod expected {
    pub const REQ_SIZE: usize = 40;
    pub const RES_SIZE: usize = 24;
    pub const REGION_SIZE: usize = 192;

    pub const IOCTL_INIT_VIRTIO: u32 = 0x100;
    pub const IOCTL_GET_TASK: u32 = 0x101;
    pub const IOCTL_FINISH: u32 = 0x102;

    pub const HVC_INIT_VIRTIO: u64 = 9;
    pub const HVC_FINISH_REQ: u64 = 10;
}

#[test]
fn test_record_sizes() {
    assert_eq!(size_of::<DeviceReq>(), expected::REQ_SIZE);
    assert_eq!(size_of::<DeviceResult>(), expected::RES_SIZE);
    assert_eq!(size_of::<DeviceRegion>(), expected::REGION_SIZE);
    assert_eq!(align_of::<DeviceRegion>(), 8);
}

#[test]
fn test_region_fits_mapping() {
    assert!(size_of::<DeviceRegion>() <= MMAP_SIZE);
    assert!(MMAP_SIZE <= PAGE_SIZE);
}

#[test]
fn test_request_field_offsets() {
    assert_eq!(offset_of!(DeviceReq, src_cpu), 0);
    assert_eq!(offset_of!(DeviceReq, address), 8);
    assert_eq!(offset_of!(DeviceReq, size), 16);
    assert_eq!(offset_of!(DeviceReq, value), 24);
    assert_eq!(offset_of!(DeviceReq, src_cell), 32);
    assert_eq!(offset_of!(DeviceReq, is_write), 36);
    assert_eq!(offset_of!(DeviceReq, is_cfg), 37);
}

#[test]
fn test_result_field_offsets() {
    assert_eq!(offset_of!(DeviceResult, src_cpu), 0);
    assert_eq!(offset_of!(DeviceResult, value), 8);
    assert_eq!(offset_of!(DeviceResult, is_cfg), 16);
}

#[test]
fn test_region_field_offsets() {
    assert_eq!(offset_of!(DeviceRegion, nreq), 0);
    assert_eq!(offset_of!(DeviceRegion, req_list), 8);
    assert_eq!(offset_of!(DeviceRegion, res), 8 + MAX_REQ * expected::REQ_SIZE);
}

#[test]
fn test_ioctl_numbers() {
    assert_eq!(ControlCommand::InitVirtio.raw(), expected::IOCTL_INIT_VIRTIO);
    assert_eq!(ControlCommand::GetTask.raw(), expected::IOCTL_GET_TASK);
    assert_eq!(ControlCommand::Finish.raw(), expected::IOCTL_FINISH);
}

#[test]
fn test_hypercall_numbers() {
    assert_eq!(nr::INIT_VIRTIO, expected::HVC_INIT_VIRTIO);
    assert_eq!(nr::FINISH_REQ, expected::HVC_FINISH_REQ);
    assert_eq!(HVC_IMM, 0x4a48);
}

#[test]
fn test_constants() {
    assert_eq!(MAX_REQ, 4);
    assert_eq!(SIGHVI, 10);
    assert_eq!(QUEUE_NOTIFY, 0x50);
}

#[test]
fn test_flag_encoding() {
    let write = Request::trapped(1, 2, 0xa003e00, QUEUE_NOTIFY, 4, 3, Direction::Write);
    let raw = write.to_raw();
    assert_eq!(raw.is_write, 1);
    assert_eq!(raw.is_cfg, 0);
    assert_eq!(raw.address, 0xa003e50);

    let read = Request::trapped(1, 2, 0xa003e00, 0x70, 4, 0, Direction::Read);
    let raw = read.to_raw();
    assert_eq!(raw.is_write, 0);
    assert_eq!(raw.is_cfg, 1);

    let res = Completion::for_request(&read, 0x74726976).to_raw();
    assert_eq!(res.src_cpu, 1);
    assert_eq!(res.is_cfg, 1);
}
