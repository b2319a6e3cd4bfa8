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

#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::panic))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::expect_used))]
#![cfg_attr(not(any(test, debug_assertions)), warn(clippy::unwrap_used))]

//! The host side of a VOP link.
//!
//! A [`VopDevice`] moves payloads from its transmit [`DescriptorQueue`] into
//! receive buffers the peer published through the kvec exchange, and publishes
//! its own receive buffers to the peer. Everything platform specific sits
//! behind [`HardwareOps`]; [`hal::sim`] provides an in-process backend.

/// Bulk copy strategies and alignment handling.
pub mod copy;
/// Device lifecycle and the worker loops.
pub mod device;
/// Errors returned by this crate.
pub mod error;
/// Host side of the kvec exchange: publishing, claiming, used records and cancellation.
pub mod exchange;
/// Hardware abstraction and the simulated backend.
pub mod hal;
/// Rate limited signalling between the two sides.
pub mod heads_up;
pub(crate) mod log_once;
/// Metric definitions.
pub(crate) mod metrics;
/// The transfer pipeline.
pub(crate) mod pipeline;
/// Transfer items and their pool.
pub mod pool;
/// Descriptor queues shared with the local driver.
pub mod queue;
/// Transport configuration.
pub mod config;

pub use config::TransportConfiguration;
pub use device::{DeviceState, VopDevice};
pub use error::VopError;
pub use hal::HardwareOps;
pub use queue::{DescriptorQueue, QueuePair};
pub use vop_common::kvec::{CancelStatus, SizeClass};

/// The universal `Result` type used throughout the crate
pub type Result<T> = core::result::Result<T, error::VopError>;
