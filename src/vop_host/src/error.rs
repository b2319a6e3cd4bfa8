/*
Copyright 2026  The VOP Authors.

Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at

    http://www.apache.org/licenses/LICENSE-2.0

Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use std::convert::Infallible;
use std::sync::PoisonError;
use std::time::Duration;

use thiserror::Error;
use vop_common::kvec::KvecError;

/// The error type for VOP transport operations
#[derive(Error, Debug)]
pub enum VopError {
    /// Anyhow error
    #[error("Anyhow Error was returned: {0}")]
    AnyhowError(#[from] anyhow::Error),

    /// Source descriptor does not have the header and payload segments
    #[error("Descriptor chain has {0} segments, expected 2")]
    BadChain(usize),

    /// No destination kvec could be claimed in time
    #[error("No destination kvec available")]
    Busy,

    /// Both copy paths failed
    #[error("Copy failed: {0}")]
    CopyFailed(String),

    /// A head released that is not owned by the device
    #[error("Descriptor {0} is not owned by the device")]
    DoubleRelease(u16),

    /// A generic error with a message
    #[error("{0}")]
    Error(String),

    /// IO error, mostly from spawning worker threads
    #[error("IO Error: {0}")]
    IOError(#[from] std::io::Error),

    /// Device is not in the state the operation needs
    #[error("Invalid device state: {0}")]
    InvalidState(String),

    /// Kvec ring error
    #[error("Kvec ring error: {0}")]
    Kvec(#[from] KvecError),

    /// A lock was poisoned by a panicking thread
    #[error("Unable to lock resource: {0}")]
    LockAttemptFailed(String),

    /// Every remote mapping slot is taken
    #[error("No mapping slot free for {0:#x}+{1:#x}")]
    MapBusy(u64, u64),

    /// Remote range could not be mapped
    #[error("Mapping {0:#x}+{1:#x} failed")]
    MapFailed(u64, u64),

    /// Destination kvec too small for the payload and its alignment prefix
    #[error("Destination of {0} bytes cannot hold {1} bytes")]
    NoSpace(u64, u64),

    /// Address range outside device memory
    #[error("Range {0:#x}+{1:#x} is outside device memory")]
    OutOfBounds(u64, u64),

    /// No free head in a descriptor queue
    #[error("Descriptor queue is full")]
    QueueFull,

    /// Device stopped while waiting
    #[error("Device is stopped")]
    Stopped,

    /// Bounded wait expired
    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    /// Nothing ready yet
    #[error("Operation would block")]
    WouldBlock,
}

impl From<Infallible> for VopError {
    fn from(_: Infallible) -> Self {
        "Impossible as this is an infallible error".into()
    }
}

impl From<&str> for VopError {
    fn from(s: &str) -> Self {
        VopError::Error(s.to_string())
    }
}

impl<T> From<PoisonError<T>> for VopError {
    // the guard inside is not Send, keep the message only
    fn from(e: PoisonError<T>) -> Self {
        VopError::LockAttemptFailed(e.to_string())
    }
}

impl VopError {
    /// Label used when counting this error.
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            VopError::AnyhowError(_) => "anyhow",
            VopError::BadChain(_) => "bad_chain",
            VopError::Busy => "busy",
            VopError::CopyFailed(_) => "copy_failed",
            VopError::DoubleRelease(_) => "double_release",
            VopError::Error(_) => "error",
            VopError::InvalidState(_) => "invalid_state",
            VopError::IOError(_) => "io",
            VopError::Kvec(_) => "kvec",
            VopError::LockAttemptFailed(_) => "lock",
            VopError::MapBusy(_, _) => "map_busy",
            VopError::MapFailed(_, _) => "map_failed",
            VopError::NoSpace(_, _) => "no_space",
            VopError::OutOfBounds(_, _) => "out_of_bounds",
            VopError::QueueFull => "queue_full",
            VopError::Stopped => "stopped",
            VopError::Timeout(_) => "timeout",
            VopError::WouldBlock => "would_block",
        }
    }

    /// Resource exhaustion that is retried rather than failing the transfer.
    pub(crate) fn is_transient(&self) -> bool {
        // no wildcard: new variants must be classified
        match self {
            VopError::Busy
            | VopError::MapBusy(_, _)
            | VopError::QueueFull
            | VopError::WouldBlock
            | VopError::Kvec(KvecError::WouldBlock)
            | VopError::Kvec(KvecError::RingFull) => true,

            VopError::AnyhowError(_)
            | VopError::BadChain(_)
            | VopError::CopyFailed(_)
            | VopError::DoubleRelease(_)
            | VopError::Error(_)
            | VopError::InvalidState(_)
            | VopError::IOError(_)
            | VopError::Kvec(_)
            | VopError::LockAttemptFailed(_)
            | VopError::MapFailed(_, _)
            | VopError::NoSpace(_, _)
            | VopError::OutOfBounds(_, _)
            | VopError::Stopped
            | VopError::Timeout(_) => false,
        }
    }
}

/// Creates a `VopError::Error` from a string literal or format string
#[macro_export]
macro_rules! new_error {
    ($msg:literal $(,)?) => {{
        let __args = std::format_args!($msg);
        let __err_msg = match __args.as_str() {
            Some(msg) => String::from(msg),
            None => std::format!($msg),
        };
        $crate::VopError::Error(__err_msg)
    }};
    ($fmtstr:expr, $($arg:tt)*) => {{
           let __err_msg = std::format!($fmtstr, $($arg)*);
           $crate::error::VopError::Error(__err_msg)
    }};
}
