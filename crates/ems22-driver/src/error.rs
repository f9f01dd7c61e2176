use ems22_transport::{InstanceHandle, TransportError};
use thiserror::Error;

use crate::frame::Frame;
use crate::registry::{MAX_DAISY_CHAIN, MAX_INSTANCES};

pub type Result<T, E = DriverError> = core::result::Result<T, E>;

/// Why a single frame was rejected.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum DecodeFault {
    #[error("wrong parity in frame {0}")]
    WrongParity(Frame),
    #[error("sensor fault flags set in frame {0}")]
    SensorFault(Frame),
}

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("invalid instance handle {0}")]
    InvalidHandle(InstanceHandle),

    #[error(
        "daisy chain index {index} out of range on instance {label} (chain length {chain_length}, max {})",
        MAX_DAISY_CHAIN
    )]
    InvalidChainIndex {
        index: usize,
        chain_length: usize,
        label: String,
    },

    #[error("daisy chain length {0} outside [1, {})", MAX_DAISY_CHAIN)]
    BadChainLength(usize),

    #[error("all {} instance slots are in use", MAX_INSTANCES)]
    Exhausted,

    #[error("transport init failed for instance {handle} (status {})", .source.code())]
    InitFailed {
        handle: InstanceHandle,
        #[source]
        source: TransportError,
    },

    /// An instance invariant no longer holds; nothing was read.
    #[error("instance {handle} ({label}) has inconsistent chain length {chain_length}")]
    Fatal {
        handle: InstanceHandle,
        label: String,
        chain_length: usize,
    },
}

impl DriverError {
    /// Status code returned by the transport's `init`, if this is an init failure.
    pub fn init_status(&self) -> Option<i32> {
        match self {
            DriverError::InitFailed { source, .. } => Some(source.code()),
            _ => None,
        }
    }
}
