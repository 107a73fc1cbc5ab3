//! ioctl-style control surface
//!
//! The backend drives the bridge through three commands on the device node:
//!
//! | Command       | Number      | Effect                                      |
//! |---------------|-------------|---------------------------------------------|
//! | `INIT_VIRTIO` | `_IO(1, 0)` | map the shared region, issue `INIT_VIRTIO`  |
//! | `GET_TASK`    | `_IO(1, 1)` | block until requests are pending, drain     |
//! | `FINISH`      | `_IO(1, 2)` | submit one result, issue `FINISH_REQ`       |
//!
//! [`ControlSurface`] is implemented by the in-process [`KernelBridge`] and
//! by the `/dev/hvisor` client, so a backend can run against either.

use crate::bridge::KernelBridge;
use crate::error::{BridgeError, Result};
use crate::hypercall::HypercallChannel;
use crate::layout::{Completion, Request};

/// ioctl type byte shared by all bridge commands
pub const HVISOR_IOC_TYPE: u32 = 1;

const IOC_NRSHIFT: u32 = 0;
const IOC_TYPESHIFT: u32 = 8;

/// Encode an argument-less ioctl number (Linux `_IO`)
pub const fn io(ty: u32, nr: u32) -> u32 {
    (ty << IOC_TYPESHIFT) | (nr << IOC_NRSHIFT)
}

/// Control commands understood by the bridge
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlCommand {
    InitVirtio,
    GetTask,
    Finish,
}

impl ControlCommand {
    /// Raw ioctl number
    pub const fn raw(self) -> u32 {
        match self {
            Self::InitVirtio => io(HVISOR_IOC_TYPE, 0),
            Self::GetTask => io(HVISOR_IOC_TYPE, 1),
            Self::Finish => io(HVISOR_IOC_TYPE, 2),
        }
    }

    /// Decode a raw ioctl number
    pub fn from_raw(raw: u32) -> Option<Self> {
        [Self::InitVirtio, Self::GetTask, Self::Finish]
            .into_iter()
            .find(|cmd| cmd.raw() == raw)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::InitVirtio => "INIT_VIRTIO",
            Self::GetTask => "GET_TASK",
            Self::Finish => "FINISH",
        }
    }
}

/// Argument passed alongside a control command
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ControlArg {
    None,
    Completion(Completion),
}

/// Outcome of a control command
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlReply {
    /// Forwarding is active; the region lives at this address
    Initialized { region: u64 },
    /// Requests handed to the backend, oldest first
    Tasks(Vec<Request>),
    /// The result was acknowledged by the hypervisor
    Finished,
}

/// The operations a backend needs from the bridge
pub trait ControlSurface: Send + Sync {
    /// Map the shared region and start forwarding; returns the region address
    fn init_forwarding(&self) -> Result<u64>;

    /// Block until requests are pending and take them
    fn get_task(&self) -> Result<Vec<Request>>;

    /// Submit one result
    fn finish(&self, res: Completion) -> Result<()>;

    /// Make a blocked [`get_task`](Self::get_task) return `Interrupted`
    fn interrupt(&self);
}

impl<H: HypercallChannel> ControlSurface for KernelBridge<H> {
    fn init_forwarding(&self) -> Result<u64> {
        KernelBridge::init_forwarding(self)
    }

    fn get_task(&self) -> Result<Vec<Request>> {
        self.retrieve_work()
    }

    fn finish(&self, res: Completion) -> Result<()> {
        self.submit_completion(res)
    }

    fn interrupt(&self) {
        KernelBridge::interrupt(self)
    }
}

impl<S: ControlSurface + ?Sized> ControlSurface for std::sync::Arc<S> {
    fn init_forwarding(&self) -> Result<u64> {
        (**self).init_forwarding()
    }

    fn get_task(&self) -> Result<Vec<Request>> {
        (**self).get_task()
    }

    fn finish(&self, res: Completion) -> Result<()> {
        (**self).finish(res)
    }

    fn interrupt(&self) {
        (**self).interrupt()
    }
}

/// Route a raw control command to `surface`
pub fn dispatch<S: ControlSurface + ?Sized>(
    surface: &S,
    cmd: u32,
    arg: ControlArg,
) -> Result<ControlReply> {
    let command = ControlCommand::from_raw(cmd).ok_or(BridgeError::InvalidCommand(cmd))?;
    tracing::trace!("Control command {}", command.name());

    match command {
        ControlCommand::InitVirtio => surface
            .init_forwarding()
            .map(|region| ControlReply::Initialized { region }),
        ControlCommand::GetTask => surface.get_task().map(ControlReply::Tasks),
        ControlCommand::Finish => match arg {
            ControlArg::Completion(res) => surface.finish(res).map(|()| ControlReply::Finished),
            ControlArg::None => Err(BridgeError::MissingArgument(command.name())),
        },
    }
}
