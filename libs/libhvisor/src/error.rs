//! Error types for the forwarding bridge

use thiserror::Error;

/// Shared region queue errors
///
/// These are rejected atomically; the region is unchanged when one is returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RegionError {
    /// The request queue already holds its full capacity
    #[error("request queue full ({capacity} pending)")]
    Overflow { capacity: usize },

    /// The completion slot still holds an unconsumed result
    #[error("completion slot already holds a result for cpu {cpu}")]
    AlreadyPending { cpu: u64 },
}

/// The hypervisor answered a hypercall with a value in the reserved error range
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("hypercall {number} failed with code {code}")]
pub struct HypercallError {
    /// Call number that was issued
    pub number: u64,
    /// Signed error code returned in x0
    pub code: i64,
}

/// Bridge error types
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Append attempted at full capacity
    #[error("request queue overflow ({capacity} pending)")]
    QueueOverflow { capacity: usize },

    /// Completion submitted while a previous result is unacknowledged
    #[error("double completion: result for cpu {pending_cpu} not yet acknowledged")]
    DoubleCompletion { pending_cpu: u64 },

    /// Completion submitted with no delivered request for that processor
    #[error("stale completion: no delivered request outstanding for cpu {cpu}")]
    StaleCompletion { cpu: u64 },

    /// The shared region could not be allocated or mapped
    #[error("shared region mapping failed: {0}")]
    MappingFailure(String),

    /// A hypercall returned a reserved error value
    #[error("hypervisor fault: {0}")]
    HypervisorFault(#[from] HypercallError),

    /// Forwarding has not been initialized yet
    #[error("virtio forwarding not initialized")]
    NotInitialized,

    /// The bridge has been finalized
    #[error("bridge finalized")]
    Finalized,

    /// A blocking wait was interrupted
    #[error("interrupted")]
    Interrupted,

    /// A shared-memory record carried an out-of-range field
    #[error("malformed record: invalid {0} field")]
    MalformedRecord(&'static str),

    /// Unknown control command number
    #[error("unknown control command {0:#x}")]
    InvalidCommand(u32),

    /// A control command was issued without its required argument
    #[error("control command {0} requires an argument")]
    MissingArgument(&'static str),

    /// Device node I/O error
    #[error("device I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

impl From<RegionError> for BridgeError {
    fn from(err: RegionError) -> Self {
        match err {
            RegionError::Overflow { capacity } => Self::QueueOverflow { capacity },
            RegionError::AlreadyPending { cpu } => Self::DoubleCompletion { pending_cpu: cpu },
        }
    }
}

impl BridgeError {
    /// Check if the caller may retry or back off
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::QueueOverflow { .. }
                | Self::DoubleCompletion { .. }
                | Self::StaleCompletion { .. }
                | Self::Interrupted
        )
    }

    /// Check if this error ends the bridge's useful life
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finalized | Self::MappingFailure(_))
    }

    /// errno the driver reports for this error on the device node
    #[cfg(unix)]
    pub fn errno(&self) -> i32 {
        match self {
            Self::QueueOverflow { .. } => libc::EAGAIN,
            Self::DoubleCompletion { .. } => libc::EBUSY,
            Self::StaleCompletion { .. } => libc::ENOENT,
            Self::MappingFailure(_) => libc::ENOMEM,
            Self::HypervisorFault(_) => libc::EIO,
            Self::NotInitialized => libc::ENODEV,
            Self::Finalized => libc::ESHUTDOWN,
            Self::Interrupted => libc::EINTR,
            Self::MalformedRecord(_) => libc::EPROTO,
            Self::InvalidCommand(_) => libc::ENOTTY,
            Self::MissingArgument(_) => libc::EINVAL,
            Self::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        }
    }
}
