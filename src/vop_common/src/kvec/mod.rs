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

//! Kvec Exchange Rings
//!
//! Each side of a link owns one kvec buffer (see [`KvecBufLayout`]) and maps
//! the peer's buffer. Buffers flow like this for a transfer from `A` to `B`:
//!
//! 1. `B` posts receive descriptors locally and publishes them as kvec pairs
//!    into `A`'s rings with a [`KvecPublisher`] over its mapping of `A`'s buffer.
//! 2. `A` claims a pair of the right size class with [`KvecRings::claim_next`].
//! 3. `A` writes the payload across the link, then appends a used record into
//!    `B`'s used ring with a [`UsedRingWriter`].
//! 4. `B` drains its own used ring with a [`UsedRingReader`] and completes the
//!    receive descriptors.
//!
//! # Counters
//!
//! Producer and consumer counters run modulo `2 * N` so that equal indices can
//! be told apart: equal counters mean empty, counters `N` apart mean full.
//!
//! ```ignore
//! let class = rings.select_ring_for_size(payload_len + overhead)?;
//! match rings.claim_next(class) {
//!     Ok(claim) => copy_into(&claim),
//!     Err(KvecError::WouldBlock) => wait_for_heads_up(),
//!     Err(e) => return Err(e),
//! }
//! ```

mod access;
mod cancel;
mod layout;
mod ring;
mod used;

pub use access::*;
pub use cancel::*;
pub use layout::*;
pub use ring::*;
use thiserror::Error;
pub use used::*;

/// Number of size-class rings in a kvec buffer.
pub const KVEC_RING_COUNT: usize = 3;

/// Publishes between two producer counter flushes.
pub const KVEC_INDEX_UPDATE_PERIOD: u16 = 16;

/// Destination alignment required by asynchronous copy channels.
pub const ASYNC_COPY_ALIGN: usize = 64;

/// Largest offset prefix an aligned asynchronous copy can produce.
pub const ASYNC_COPY_MAX_OFFSET: usize = 127;

/// Extra room a destination buffer needs when an asynchronous channel
/// realigns the payload.
pub const SEND_OVERHEAD_ASYNC: usize = ASYNC_COPY_MAX_OFFSET + ASYNC_COPY_ALIGN;

/// Extra room a destination buffer needs for a synchronous copy.
pub const SEND_OVERHEAD_SYNC: usize = 64;

/// Smallest receive buffer accepted into the small class.
pub const MTU_DEFAULT: usize = 1518 + SEND_OVERHEAD_ASYNC;
/// Smallest receive buffer accepted into the jumbo class.
pub const MTU_JUMBO: usize = 9018 + SEND_OVERHEAD_ASYNC;
/// Smallest receive buffer accepted into the big class.
pub const MTU_MAX: usize = 65540 + SEND_OVERHEAD_ASYNC;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvecError {
    #[error("Operation would block")]
    WouldBlock,
    #[error("Ring is full")]
    RingFull,
    #[error("Invalid size class {0}")]
    InvalidClass(u16),
    #[error("Invalid slot index {0}")]
    InvalidIndex(u32),
    #[error("Buffer of {0} bytes is too small for any size class")]
    TooSmall(u64),
    #[error("Descriptor chain has {0} segments, expected 2")]
    BadChain(usize),
    #[error("Ring state inconsistent")]
    InvalidState,
    #[error("Backend memory error")]
    MemError,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutError {
    #[error("Kvec buffer base {0:#x} is not 8-byte aligned")]
    Unaligned(u64),
    #[error("Unsupported ring entry count {0}")]
    BadEntryCount(u16),
}

/// Size class of a kvec ring.
#[repr(u16)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "fuzzing", derive(arbitrary::Arbitrary))]
pub enum SizeClass {
    Small = 0,
    Jumbo = 1,
    Big = 2,
}

impl SizeClass {
    pub const ALL: [SizeClass; KVEC_RING_COUNT] = [SizeClass::Small, SizeClass::Jumbo, SizeClass::Big];

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// The largest class, used until the peer has advertised any maximum.
    #[inline]
    pub const fn largest() -> Self {
        SizeClass::Big
    }
}

impl TryFrom<u16> for SizeClass {
    type Error = KvecError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(SizeClass::Small),
            1 => Ok(SizeClass::Jumbo),
            2 => Ok(SizeClass::Big),
            other => Err(KvecError::InvalidClass(other)),
        }
    }
}

impl core::fmt::Display for SizeClass {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = match self {
            SizeClass::Small => "small",
            SizeClass::Jumbo => "jumbo",
            SizeClass::Big => "big",
        };
        f.write_str(name)
    }
}

/// Pick the ring a receive buffer of `len` payload bytes is published into.
pub fn write_ring_for_size(len: u64) -> Result<SizeClass, KvecError> {
    match len as usize {
        l if l < MTU_DEFAULT => Err(KvecError::TooSmall(len)),
        l if l < MTU_JUMBO => Ok(SizeClass::Small),
        l if l < MTU_MAX => Ok(SizeClass::Jumbo),
        _ => Ok(SizeClass::Big),
    }
}

/// Pick the smallest class whose advertised maximum covers `len`.
///
/// Classes nobody advertised yet read as 0. Until some class covers `len`
/// the largest class is returned.
pub fn select_ring_for_size(advertised: &[u32; KVEC_RING_COUNT], len: usize) -> SizeClass {
    SizeClass::ALL
        .into_iter()
        .find(|class| len <= advertised[class.index()] as usize)
        .unwrap_or(SizeClass::largest())
}

#[inline]
pub const fn counter_add(cnt: u16, val: u16, entries: u16) -> u16 {
    ((cnt as u32 + val as u32) % (2 * entries as u32)) as u16
}

#[inline]
pub const fn counter_to_idx(cnt: u16, entries: u16) -> u16 {
    cnt % entries
}

#[inline]
pub const fn counter_eq(a: u16, b: u16, entries: u16) -> bool {
    (a as u32 % (2 * entries as u32)) == (b as u32 % (2 * entries as u32))
}

/// Entries between consumer counter `last` and producer counter `cur`.
#[inline]
pub const fn counter_used(last: u16, cur: u16, entries: u16) -> u16 {
    let span = 2 * entries as u32;
    ((cur as u32 % span + span - last as u32 % span) % span) as u16
}

/// Result of a cancellation request, as stored in the header status byte.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CancelStatus {
    Ok = 1,
    InvalidRequest = 2,
    Timeout = 3,
    Error = 4,
}

impl CancelStatus {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(CancelStatus::Ok),
            2 => Some(CancelStatus::InvalidRequest),
            3 => Some(CancelStatus::Timeout),
            4 => Some(CancelStatus::Error),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CancelStatus::Ok => "ok",
            CancelStatus::InvalidRequest => "invalid_request",
            CancelStatus::Timeout => "timeout",
            CancelStatus::Error => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_wrap_at_twice_capacity() {
        assert_eq!(counter_add(7, 1, 4), 0);
        assert_eq!(counter_add(6, 2, 4), 0);
        assert_eq!(counter_add(3, 2, 4), 5);
        assert_eq!(counter_to_idx(5, 4), 1);
        assert!(counter_eq(0, 8, 4));
        assert!(!counter_eq(0, 4, 4));
    }

    #[test]
    fn used_distinguishes_empty_from_full() {
        assert_eq!(counter_used(0, 0, 4), 0);
        assert_eq!(counter_used(0, 4, 4), 4);
        assert_eq!(counter_used(6, 2, 4), 4);
        assert_eq!(counter_used(6, 7, 4), 1);
        assert_eq!(counter_used(7, 1, 4), 2);
    }

    #[test]
    fn write_ring_thresholds() {
        assert_eq!(write_ring_for_size(1500), Err(KvecError::TooSmall(1500)));
        assert_eq!(write_ring_for_size((MTU_DEFAULT - 1) as u64), Err(KvecError::TooSmall(1708)));
        assert_eq!(write_ring_for_size(MTU_DEFAULT as u64), Ok(SizeClass::Small));
        assert_eq!(write_ring_for_size((MTU_JUMBO - 1) as u64), Ok(SizeClass::Small));
        assert_eq!(write_ring_for_size(MTU_JUMBO as u64), Ok(SizeClass::Jumbo));
        assert_eq!(write_ring_for_size(MTU_MAX as u64), Ok(SizeClass::Big));
        assert_eq!(write_ring_for_size(1 << 20), Ok(SizeClass::Big));
    }

    #[test]
    fn select_ring_defaults_to_largest() {
        let none = [0u32; KVEC_RING_COUNT];
        assert_eq!(select_ring_for_size(&none, 1), SizeClass::Big);

        let adv = [2048, 9216, 65536];
        assert_eq!(select_ring_for_size(&adv, 0), SizeClass::Small);
        assert_eq!(select_ring_for_size(&adv, 2048), SizeClass::Small);
        assert_eq!(select_ring_for_size(&adv, 2049), SizeClass::Jumbo);
        assert_eq!(select_ring_for_size(&adv, 65536), SizeClass::Big);
        assert_eq!(select_ring_for_size(&adv, 70000), SizeClass::Big);

        // only the jumbo class has been advertised so far
        let partial = [0, 9216, 0];
        assert_eq!(select_ring_for_size(&partial, 100), SizeClass::Jumbo);
        assert_eq!(select_ring_for_size(&partial, 10_000), SizeClass::Big);
    }

    #[test]
    fn size_class_conversions() {
        for class in SizeClass::ALL {
            assert_eq!(SizeClass::try_from(class as u16), Ok(class));
        }
        assert_eq!(SizeClass::try_from(3), Err(KvecError::InvalidClass(3)));
    }

    #[test]
    fn cancel_status_bytes() {
        for s in [
            CancelStatus::Ok,
            CancelStatus::InvalidRequest,
            CancelStatus::Timeout,
            CancelStatus::Error,
        ] {
            assert_eq!(CancelStatus::from_byte(s as u8), Some(s));
        }
        assert_eq!(CancelStatus::from_byte(0), None);
    }
}

#[cfg(test)]
mod fuzz {
    use quickcheck::{QuickCheck, TestResult};

    use super::*;

    fn prop_select_is_smallest_covering(adv: Vec<u32>, len: u32) -> TestResult {
        if adv.len() < KVEC_RING_COUNT {
            return TestResult::discard();
        }
        let adv = [adv[0], adv[1], adv[2]];
        let len = len as usize;
        let chosen = select_ring_for_size(&adv, len);

        let covering = SizeClass::ALL
            .into_iter()
            .filter(|c| adv[c.index()] as usize >= len)
            .min();

        match covering {
            Some(c) => TestResult::from_bool(chosen == c),
            None => TestResult::from_bool(chosen == SizeClass::largest()),
        }
    }

    fn prop_counter_used_tracks_distance(entries: u16, start: u16, steps: u16) -> TestResult {
        let entries = entries % 512 + 1;
        let steps = steps % (entries + 1);
        let start = start % (2 * entries);

        let cur = counter_add(start, steps, entries);
        let used = counter_used(start, cur, entries);
        let empty = counter_eq(start, cur, entries);
        let full = used == entries;

        TestResult::from_bool(used == steps && (empty == (steps == 0)) && !(empty && full))
    }

    #[test]
    fn prop_select_ring() {
        QuickCheck::new()
            .tests(200)
            .quickcheck(prop_select_is_smallest_covering as fn(Vec<u32>, u32) -> TestResult);
    }

    #[test]
    fn prop_counters() {
        QuickCheck::new()
            .tests(500)
            .quickcheck(prop_counter_used_tracks_distance as fn(u16, u16, u16) -> TestResult);
    }
}
