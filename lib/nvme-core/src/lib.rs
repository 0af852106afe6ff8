// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Queue management and command lifecycle core of an NVMe host driver.
//!
//! The crate turns admin and I/O requests into fixed-slot NVMe commands,
//! tracks them through submission and completion (or timeout and abort),
//! and recovers the controller through a serialized exception task when
//! things go wrong.

#![allow(clippy::style)]

#[macro_use]
extern crate bitflags;

pub mod aen;
pub mod bits;
pub mod completion;
pub mod ctrlr;
pub mod exception;
pub mod hw;
pub mod paths;
pub mod queue;
pub mod reset;
pub mod slots;
pub mod state;
pub mod status;
pub mod submit;
pub mod timeout;

#[cfg(test)]
mod test;

pub use ctrlr::{Controller, ControllerStats, Hardware};
pub use exception::ExceptionEvent;
pub use queue::{QueueId, QueuePair, QueueStats};
pub use slots::{CmdId, CmdStatus, Command, RequestTag};
pub use state::CtrlrState;

use thiserror::Error;

/// Result of an NVMe command or of a driver operation acting on one.
pub type CmdResult = Result<(), NvmeError>;

/// Errors produced by the driver core.
///
/// Status codes reported by the controller are decoded into these by
/// [`status::decode`]; the remainder are raised by the driver itself.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum NvmeError {
    #[error("submission queue is full")]
    QueueFull,

    #[error("controller is being reset")]
    InReset,

    #[error("controller is quiesced")]
    Quiesced,

    #[error("operation already in progress")]
    Busy,

    #[error("device is missing")]
    DeviceMissing,

    #[error("controller is not ready")]
    NotReady,

    #[error("controller has failed")]
    Failed,

    #[error("command timed out")]
    Timeout,

    #[error("command aborted")]
    Aborted,

    #[error("command flushed by a controller reset")]
    Reset,

    #[error("invalid command opcode")]
    InvalidOpcode,

    #[error("invalid field in command")]
    InvalidField,

    #[error("invalid namespace or format")]
    InvalidNsOrFormat,

    #[error("namespace not ready")]
    NsNotReady,

    #[error("LBA out of range")]
    LbaOutOfRange,

    #[error("capacity exceeded")]
    CapacityExceeded,

    #[error("conflicting attributes")]
    ConflictAttributes,

    #[error("invalid protection information")]
    InvalidProtectionInfo,

    #[error("medium error")]
    MediumError,

    #[error("I/O error")]
    IoError,

    #[error("unrecovered read error")]
    IoReadError,

    #[error("write fault")]
    IoWriteError,

    #[error("end-to-end protection check failed")]
    GuardCheckError,

    #[error("protocol error")]
    ProtocolError,

    #[error("fatal driver error")]
    FatalError,

    #[error("invalid parameter")]
    BadParam,

    #[error("out of resources")]
    NoResources,

    #[error("I/O queue count changed from {expected} to {actual}")]
    QueueCountChanged { expected: u16, actual: u16 },

    #[error("controller configuration is not supported")]
    IncompatibleController,

    #[error("command failed")]
    Failure,

    #[error("failed to create queue: {0}")]
    QueueCreate(#[from] queue::QueueCreateErr),
}

impl NvmeError {
    /// The condition is expected to clear; callers may retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            NvmeError::Busy
                | NvmeError::InReset
                | NvmeError::Quiesced
                | NvmeError::QueueFull
        )
    }

    /// The whole controller is unusable; retrying is pointless.
    pub fn is_terminal(&self) -> bool {
        matches!(self, NvmeError::DeviceMissing | NvmeError::Failed)
    }

    /// Driver integrity violation which should escalate to a controller
    /// reset.
    pub fn requires_reset(&self) -> bool {
        matches!(self, NvmeError::ProtocolError | NvmeError::FatalError)
    }
}
