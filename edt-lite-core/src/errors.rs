use crate::guid::Guid;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Numeric return-detail codes carried in the message envelope. The values
/// are part of the observable contract: remote peers compare them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum ReturnCode {
    Ok = 0,
    /// Labelled creation raced; the caller's guid is the canonical winner.
    GuidExists = 1,
    /// Asynchronous operation in flight; the caller parks and is re-entered.
    Pending = 2,
    /// Data-block contention; retried through the acquire queue.
    Busy = 3,
    NoMem = 4,
    Inval = 5,
    NotSup = 6,
    NoEnt = 7,
    Fault = 8,
    Perm = 9,
}

/// Typed error for every fallible runtime operation. Each variant maps onto
/// exactly one [`ReturnCode`] so the router can fill `return_detail` without
/// losing information.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("labelled creation raced, canonical guid is {0}")]
    GuidExists(Guid),
    #[error("operation pending on {0}")]
    Pending(Guid),
    #[error("data-block {0} busy")]
    Busy(Guid),
    #[error("out of memory ({0} bytes)")]
    NoMem(u64),
    #[error("invalid argument: {0}")]
    Inval(&'static str),
    #[error("operation not supported: {0}")]
    NotSup(&'static str),
    #[error("no such object: {0}")]
    NoEnt(Guid),
    #[error("fault: {0}")]
    Fault(&'static str),
    #[error("not permitted: {0}")]
    Perm(&'static str),
}

impl RuntimeError {
    pub fn code(&self) -> ReturnCode {
        match self {
            RuntimeError::GuidExists(_) => ReturnCode::GuidExists,
            RuntimeError::Pending(_) => ReturnCode::Pending,
            RuntimeError::Busy(_) => ReturnCode::Busy,
            RuntimeError::NoMem(_) => ReturnCode::NoMem,
            RuntimeError::Inval(_) => ReturnCode::Inval,
            RuntimeError::NotSup(_) => ReturnCode::NotSup,
            RuntimeError::NoEnt(_) => ReturnCode::NoEnt,
            RuntimeError::Fault(_) => ReturnCode::Fault,
            RuntimeError::Perm(_) => ReturnCode::Perm,
        }
    }
}

pub type Result<T, E = RuntimeError> = std::result::Result<T, E>;
