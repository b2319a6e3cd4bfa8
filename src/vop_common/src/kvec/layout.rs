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

//! Kvec Buffer Shared Layout
//!
//! Every record here is read and written by both sides of the link, so the
//! layouts are fixed with `#[repr(C)]` and checked at compile time.
//!
//! A kvec buffer of `N` entries per size class is laid out as:
//! 1. [`KvecBufHeader`]: 32 bytes
//! 2. `KVEC_RING_COUNT * N` [`PeerKvec`] records, one ring per size class
//! 3. `N` [`PeerUsedKvec`] records forming the used ring
//!
//! The whole buffer is rounded up to a page.

use bitflags::bitflags;
use bytemuck::{Pod, Zeroable};

use super::{KVEC_RING_COUNT, LayoutError, SizeClass};
use crate::PAGE_SIZE;

/// Alignment of every record in the kvec buffer.
pub const KVEC_ELEM_ALIGN: usize = 8;

bitflags! {
    /// Per-slot state bits of a published kvec.
    #[repr(transparent)]
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct KvecFlags: u8 {
        /// A transfer claimed this slot and may still be writing into it.
        const IN_USE    = 1 << 0;
        /// The publisher withdrew this slot before it was claimed.
        const CANCELLED = 1 << 1;
    }
}

/// A writable buffer published by the receiving side.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable, PartialEq, Eq, Hash)]
pub struct PeerKvec {
    /// Physical address of the buffer in the publisher's memory.
    pub addr: u64,
    /// Length of the buffer in bytes.
    pub len: u64,
    /// Receive descriptor head the buffer belongs to. Header and payload
    /// kvecs of one descriptor share it.
    pub head: u16,
    /// [`KvecFlags`] bits.
    pub flags: u8,
    _pad: [u8; 5],
}

const _: () = assert!(core::mem::size_of::<PeerKvec>() == 24);
const _: () = assert!(PeerKvec::ADDR_OFFSET == 0);
const _: () = assert!(PeerKvec::LEN_OFFSET == 8);
const _: () = assert!(PeerKvec::HEAD_OFFSET == 16);
const _: () = assert!(PeerKvec::FLAGS_OFFSET == 18);

impl PeerKvec {
    pub const SIZE: usize = core::mem::size_of::<Self>();
    pub const ALIGN: usize = core::mem::align_of::<Self>();

    pub const ADDR_OFFSET: usize = core::mem::offset_of!(Self, addr);
    pub const LEN_OFFSET: usize = core::mem::offset_of!(Self, len);
    pub const HEAD_OFFSET: usize = core::mem::offset_of!(Self, head);
    pub const FLAGS_OFFSET: usize = core::mem::offset_of!(Self, flags);

    pub fn new(addr: u64, len: u64, head: u16) -> Self {
        Self {
            addr,
            len,
            head,
            flags: 0,
            _pad: [0; 5],
        }
    }

    #[inline]
    pub fn flags(&self) -> KvecFlags {
        KvecFlags::from_bits_truncate(self.flags)
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.flags().contains(KvecFlags::CANCELLED)
    }

    #[inline]
    pub fn is_in_use(&self) -> bool {
        self.flags().contains(KvecFlags::IN_USE)
    }
}

/// A consumed kvec reported back to its publisher.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable, PartialEq, Eq, Hash)]
pub struct PeerUsedKvec {
    /// Bytes written into the descriptor's buffers.
    pub len: u32,
    /// Receive descriptor head.
    pub head: u16,
    _pad: [u8; 2],
}

const _: () = assert!(core::mem::size_of::<PeerUsedKvec>() == 8);
const _: () = assert!(PeerUsedKvec::LEN_OFFSET == 0);
const _: () = assert!(PeerUsedKvec::HEAD_OFFSET == 4);

impl PeerUsedKvec {
    pub const SIZE: usize = core::mem::size_of::<Self>();

    pub const LEN_OFFSET: usize = core::mem::offset_of!(Self, len);
    pub const HEAD_OFFSET: usize = core::mem::offset_of!(Self, head);

    pub fn new(head: u16, len: u32) -> Self {
        Self {
            len,
            head,
            _pad: [0; 2],
        }
    }
}

/// Common header at the start of every kvec buffer.
#[repr(C)]
#[derive(Clone, Copy, Debug, Pod, Zeroable, PartialEq, Eq)]
pub struct KvecBufHeader {
    /// Producer counters of the kvec rings, written by the publisher.
    pub idx: [u16; KVEC_RING_COUNT],
    /// Producer counter of the used ring, written by the claimer.
    pub used_idx: u16,
    /// Advertised maximum payload per size class, written by the publisher.
    pub send_max_size: [u32; KVEC_RING_COUNT],
    /// Slot index of the pending cancellation request.
    pub cancelled_request_idx: u32,
    /// Size class of the pending cancellation request.
    pub cancelled_request_ring_id: u16,
    /// Non-zero while a cancellation request is pending.
    pub request_cancellation: u8,
    /// [`CancelStatus`](super::CancelStatus) written back by the claimer.
    pub cancellation_status: u8,
    _pad: [u8; 4],
}

const _: () = assert!(core::mem::size_of::<KvecBufHeader>() == 32);
const _: () = assert!(KvecBufHeader::IDX_OFFSET == 0);
const _: () = assert!(KvecBufHeader::USED_IDX_OFFSET == 6);
const _: () = assert!(KvecBufHeader::SEND_MAX_SIZE_OFFSET == 8);
const _: () = assert!(KvecBufHeader::CANCEL_IDX_OFFSET == 20);
const _: () = assert!(KvecBufHeader::CANCEL_RING_OFFSET == 24);
const _: () = assert!(KvecBufHeader::CANCEL_REQUEST_OFFSET == 26);
const _: () = assert!(KvecBufHeader::CANCEL_STATUS_OFFSET == 27);

impl KvecBufHeader {
    pub const SIZE: usize = core::mem::size_of::<Self>();

    pub const IDX_OFFSET: usize = core::mem::offset_of!(Self, idx);
    pub const USED_IDX_OFFSET: usize = core::mem::offset_of!(Self, used_idx);
    pub const SEND_MAX_SIZE_OFFSET: usize = core::mem::offset_of!(Self, send_max_size);
    pub const CANCEL_IDX_OFFSET: usize = core::mem::offset_of!(Self, cancelled_request_idx);
    pub const CANCEL_RING_OFFSET: usize = core::mem::offset_of!(Self, cancelled_request_ring_id);
    pub const CANCEL_REQUEST_OFFSET: usize = core::mem::offset_of!(Self, request_cancellation);
    pub const CANCEL_STATUS_OFFSET: usize = core::mem::offset_of!(Self, cancellation_status);
}

#[inline]
const fn align_up(val: usize, align: usize) -> usize {
    (val + align - 1) & !(align - 1)
}

/// Addresses of every structure inside one kvec buffer.
///
/// The same layout is computed independently on both sides of the link from
/// the buffer base (local address or mapped window) and the entry count.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KvecBufLayout {
    base: u64,
    entries: u16,
}

impl KvecBufLayout {
    /// Largest entry count for which counters modulo `2 * N` still fit a u16.
    pub const MAX_ENTRIES: u16 = u16::MAX / 2;

    /// Create a layout from a base address and the number of entries per ring.
    ///
    /// # Safety
    /// - `base` must be valid for `KvecBufLayout::query_size(entries)` bytes.
    /// - Memory must remain valid for the lifetime of any ring built on it.
    pub const unsafe fn from_base(base: u64, entries: u16) -> Result<Self, LayoutError> {
        if !base.is_multiple_of(KVEC_ELEM_ALIGN as u64) {
            return Err(LayoutError::Unaligned(base));
        }
        if entries == 0 || entries > Self::MAX_ENTRIES {
            return Err(LayoutError::BadEntryCount(entries));
        }
        Ok(Self { base, entries })
    }

    /// Bytes needed for a buffer with `entries` slots per ring, page aligned.
    pub const fn query_size(entries: usize) -> usize {
        let raw = KvecBufHeader::SIZE
            + KVEC_RING_COUNT * entries * PeerKvec::SIZE
            + entries * PeerUsedKvec::SIZE;
        align_up(raw, PAGE_SIZE)
    }

    #[inline]
    pub const fn base(&self) -> u64 {
        self.base
    }

    /// Slots per ring.
    #[inline]
    pub const fn entries(&self) -> u16 {
        self.entries
    }

    #[inline]
    pub const fn size(&self) -> usize {
        Self::query_size(self.entries as usize)
    }

    #[inline]
    pub fn ring_idx_addr(&self, class: SizeClass) -> u64 {
        self.base + (KvecBufHeader::IDX_OFFSET + class.index() * 2) as u64
    }

    #[inline]
    pub fn used_idx_addr(&self) -> u64 {
        self.base + KvecBufHeader::USED_IDX_OFFSET as u64
    }

    #[inline]
    pub fn send_max_size_addr(&self, class: SizeClass) -> u64 {
        self.base + (KvecBufHeader::SEND_MAX_SIZE_OFFSET + class.index() * 4) as u64
    }

    #[inline]
    pub fn cancel_idx_addr(&self) -> u64 {
        self.base + KvecBufHeader::CANCEL_IDX_OFFSET as u64
    }

    #[inline]
    pub fn cancel_ring_addr(&self) -> u64 {
        self.base + KvecBufHeader::CANCEL_RING_OFFSET as u64
    }

    #[inline]
    pub fn cancel_request_addr(&self) -> u64 {
        self.base + KvecBufHeader::CANCEL_REQUEST_OFFSET as u64
    }

    #[inline]
    pub fn cancel_status_addr(&self) -> u64 {
        self.base + KvecBufHeader::CANCEL_STATUS_OFFSET as u64
    }

    /// Address of slot `idx` (already reduced modulo `entries`) in `class`'s ring.
    #[inline]
    pub fn slot_addr(&self, class: SizeClass, idx: u16) -> u64 {
        let ring_start = class.index() * self.entries as usize;
        self.base + (KvecBufHeader::SIZE + (ring_start + idx as usize) * PeerKvec::SIZE) as u64
    }

    #[inline]
    pub fn slot_flags_addr(&self, class: SizeClass, idx: u16) -> u64 {
        self.slot_addr(class, idx) + PeerKvec::FLAGS_OFFSET as u64
    }

    #[inline]
    pub fn slot_head_addr(&self, class: SizeClass, idx: u16) -> u64 {
        self.slot_addr(class, idx) + PeerKvec::HEAD_OFFSET as u64
    }

    /// Address of used ring slot `idx` (already reduced modulo `entries`).
    #[inline]
    pub fn used_slot_addr(&self, idx: u16) -> u64 {
        let kvecs = KVEC_RING_COUNT * self.entries as usize * PeerKvec::SIZE;
        self.base + (KvecBufHeader::SIZE + kvecs + idx as usize * PeerUsedKvec::SIZE) as u64
    }
}
