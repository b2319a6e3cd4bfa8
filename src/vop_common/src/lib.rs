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
// We use Arbitrary during fuzzing, which requires std
#![cfg_attr(not(any(test, feature = "fuzzing", feature = "std")), no_std)]

pub const PAGE_SIZE: usize = 0x1_000; // 4KB

extern crate alloc;

/// Kvec exchange rings, the used-descriptor return ring and the shared
/// header both sides of a link agree on.
///
/// The receiving side publishes writable buffers ("kvecs") into rings that
/// live in the sender's memory, grouped by size class. The sender claims
/// them, writes payload into them across the link and reports what it wrote
/// through the used ring living in the receiver's memory.
pub mod kvec;
