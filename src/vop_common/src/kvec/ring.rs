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

//! Kvec ring producer and consumer.
//!
//! [`KvecPublisher`] is the producer. It runs on the receiving side and writes
//! through its mapping of the peer's buffer. It only ever issues writes
//! (records, counters, advertised sizes) so that crossing the link stays
//! cheap.
//!
//! [`KvecRings`] is the consumer. It runs on the sending side over its own
//! buffer: it claims published pairs, tracks `IN_USE` and honours
//! `CANCELLED` marks. Callers must serialize `claim_next` and
//! `mark_cancelled` (the host keeps it behind a mutex).

use core::sync::atomic::{Ordering, fence};

use smallvec::SmallVec;

#[cfg(feature = "tracing")]
use tracing::{Span, instrument};

use super::{
    KVEC_INDEX_UPDATE_PERIOD, KVEC_RING_COUNT, KvecBufLayout, KvecError, KvecFlags, MemOps,
    PeerKvec, SizeClass, counter_add, counter_eq, counter_to_idx, counter_used,
    select_ring_for_size, write_ring_for_size,
};

/// Kvecs claimed by one transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimedKvecs {
    pub class: SizeClass,
    /// Ring slot of the first kvec. Its `IN_USE` flag marks the claim.
    pub first_slot: u16,
    /// Receive descriptor head shared by every kvec of the claim.
    pub head: u16,
    pub kvecs: SmallVec<[PeerKvec; 2]>,
}

/// Outcome of marking a published slot cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelMark {
    /// Number of slots marked, the requested one included.
    Marked(u16),
    /// A transfer already claimed the slot; the caller has to wait for it.
    InUse,
    /// Nothing is published in the ring.
    EmptyRing,
    /// The slot is not between the consumer and producer counters.
    NotPublished,
}

/// Consumer side of the kvec rings in the local buffer.
pub struct KvecRings<M> {
    mem: M,
    layout: KvecBufLayout,
    last_cnt: [u16; KVEC_RING_COUNT],
}

impl<M: MemOps> KvecRings<M> {
    pub fn new(layout: KvecBufLayout, mem: M) -> Self {
        Self {
            mem,
            layout,
            last_cnt: [0; KVEC_RING_COUNT],
        }
    }

    #[inline]
    pub fn layout(&self) -> KvecBufLayout {
        self.layout
    }

    #[inline]
    pub fn mem(&self) -> &M {
        &self.mem
    }

    #[inline]
    pub fn entries(&self) -> u16 {
        self.layout.entries()
    }

    /// Zero every producer/consumer counter of the buffer.
    pub fn reset(&mut self) -> Result<(), KvecError> {
        for class in SizeClass::ALL {
            self.mem
                .store_release(self.layout.ring_idx_addr(class), 0)
                .map_err(|_| KvecError::MemError)?;
        }
        self.mem
            .store_release(self.layout.used_idx_addr(), 0)
            .map_err(|_| KvecError::MemError)?;
        self.last_cnt = [0; KVEC_RING_COUNT];
        Ok(())
    }

    /// Producer counter of `class` as last flushed by the publisher.
    pub fn producer(&self, class: SizeClass) -> Result<u16, KvecError> {
        self.mem
            .load_acquire(self.layout.ring_idx_addr(class))
            .map_err(|_| KvecError::MemError)
    }

    #[inline]
    pub fn consumer(&self, class: SizeClass) -> u16 {
        self.last_cnt[class.index()]
    }

    /// Number of published, unclaimed slots in `class` (cancelled ones included).
    pub fn available(&self, class: SizeClass) -> Result<u16, KvecError> {
        let prod = self.producer(class)?;
        let used = counter_used(self.consumer(class), prod, self.entries());
        if used > self.entries() {
            return Err(KvecError::InvalidState);
        }
        Ok(used)
    }

    pub fn has_available(&self, class: SizeClass) -> Result<bool, KvecError> {
        Ok(self.available(class)? != 0)
    }

    /// Advertised maximum payload of every class, 0 when not advertised yet.
    pub fn advertised_maxima(&self) -> Result<[u32; KVEC_RING_COUNT], KvecError> {
        let mut out = [0u32; KVEC_RING_COUNT];
        for class in SizeClass::ALL {
            out[class.index()] = self
                .mem
                .read_val(self.layout.send_max_size_addr(class))
                .map_err(|_| KvecError::MemError)?;
        }
        Ok(out)
    }

    /// Smallest advertised class able to hold `len` bytes, the largest class otherwise.
    pub fn select_ring_for_size(&self, len: usize) -> Result<SizeClass, KvecError> {
        Ok(select_ring_for_size(&self.advertised_maxima()?, len))
    }

    fn read_slot(&self, class: SizeClass, idx: u16) -> Result<PeerKvec, KvecError> {
        self.mem
            .read_val(self.layout.slot_addr(class, idx))
            .map_err(|_| KvecError::MemError)
    }

    fn clear_head(&self, class: SizeClass, idx: u16) -> Result<(), KvecError> {
        self.mem
            .write(self.layout.slot_head_addr(class, idx), &0u16.to_le_bytes())
            .map(|_| ())
            .map_err(|_| KvecError::MemError)
    }

    fn store_flags(&self, class: SizeClass, idx: u16, flags: KvecFlags) -> Result<(), KvecError> {
        self.mem
            .store_release_u8(self.layout.slot_flags_addr(class, idx), flags.bits())
            .map_err(|_| KvecError::MemError)
    }

    /// Current flags of a ring slot.
    pub fn slot_flags(&self, class: SizeClass, idx: u16) -> Result<KvecFlags, KvecError> {
        if idx >= self.entries() {
            return Err(KvecError::InvalidIndex(idx as u32));
        }
        self.mem
            .load_acquire_u8(self.layout.slot_flags_addr(class, idx))
            .map(KvecFlags::from_bits_truncate)
            .map_err(|_| KvecError::MemError)
    }

    /// Claim the next published descriptor of `class`.
    ///
    /// Cancelled slots at the consumer position are skipped and cleared.
    /// Consecutive slots sharing the first slot's head are coalesced into one
    /// claim, and the first slot is marked `IN_USE`.
    ///
    /// # Errors
    ///
    /// - [`KvecError::WouldBlock`] - nothing published
    /// - [`KvecError::InvalidState`] - producer counter further ahead than the ring holds
    #[cfg_attr(feature = "tracing", instrument(err(Debug), skip(self), parent = Span::current(), level = "Trace"))]
    pub fn claim_next(&mut self, class: SizeClass) -> Result<ClaimedKvecs, KvecError> {
        let n = self.entries();
        let slot = class.index();

        let avail = self.producer(class)?;
        if counter_used(self.last_cnt[slot], avail, n) > n {
            return Err(KvecError::InvalidState);
        }

        loop {
            if counter_eq(self.last_cnt[slot], avail, n) {
                return Err(KvecError::WouldBlock);
            }

            let idx = counter_to_idx(self.last_cnt[slot], n);
            let kvec = self.read_slot(class, idx)?;
            if !kvec.is_cancelled() {
                break;
            }

            log::debug!("skipping cancelled kvec slot {idx} in {class} ring");
            self.store_flags(class, idx, KvecFlags::empty())?;
            self.clear_head(class, idx)?;
            self.last_cnt[slot] = counter_add(self.last_cnt[slot], 1, n);
        }

        let first = counter_to_idx(self.last_cnt[slot], n);
        let first_kvec = self.read_slot(class, first)?;
        let head = first_kvec.head;
        self.clear_head(class, first)?;

        let mut kvecs: SmallVec<[PeerKvec; 2]> = SmallVec::new();
        kvecs.push(first_kvec);

        let mut num: u16 = 1;
        while num < n && !counter_eq(counter_add(self.last_cnt[slot], num, n), avail, n) {
            let idx = counter_to_idx(counter_add(self.last_cnt[slot], num, n), n);
            let kvec = self.read_slot(class, idx)?;
            if kvec.head != head {
                break;
            }
            self.clear_head(class, idx)?;
            kvecs.push(kvec);
            num += 1;
        }

        self.store_flags(class, first, KvecFlags::IN_USE)?;
        self.last_cnt[slot] = counter_add(self.last_cnt[slot], num, n);

        log::trace!(
            "claimed {num} kvecs head {head} from {class} ring slot {first}, consumer now {}",
            self.last_cnt[slot]
        );

        Ok(ClaimedKvecs {
            class,
            first_slot: first,
            head,
            kvecs,
        })
    }

    /// Clear the `IN_USE` mark left by [`claim_next`](Self::claim_next).
    pub fn release_claim(&self, class: SizeClass, first_slot: u16) -> Result<(), KvecError> {
        if first_slot >= self.entries() {
            return Err(KvecError::InvalidIndex(first_slot as u32));
        }
        self.store_flags(class, first_slot, KvecFlags::empty())
    }

    /// Mark slot `idx` of `class` and the following slots of the same
    /// descriptor as cancelled, unless a transfer already claimed it.
    ///
    /// Only slots between the consumer and producer counters are touched, so
    /// a claimed slot is never marked.
    pub fn mark_cancelled(&mut self, class: SizeClass, idx: u32) -> Result<CancelMark, KvecError> {
        let n = self.entries();
        if idx >= n as u32 {
            return Err(KvecError::InvalidIndex(idx));
        }
        let idx = idx as u16;

        if self.slot_flags(class, idx)?.contains(KvecFlags::IN_USE) {
            return Ok(CancelMark::InUse);
        }

        let live = self.available(class)?;
        if live == 0 {
            return Ok(CancelMark::EmptyRing);
        }

        let start = counter_to_idx(self.consumer(class), n);
        let distance = (idx + n - start) % n;
        if distance >= live {
            return Ok(CancelMark::NotPublished);
        }

        let head = self.read_slot(class, idx)?.head;
        let flags = self.slot_flags(class, idx)?;
        self.store_flags(class, idx, flags | KvecFlags::CANCELLED)?;

        let mut marked: u16 = 1;
        while distance + marked < live {
            let next = (idx + marked) % n;
            if self.read_slot(class, next)?.head != head {
                break;
            }
            let flags = self.slot_flags(class, next)?;
            self.store_flags(class, next, flags | KvecFlags::CANCELLED)?;
            marked += 1;
        }

        log::debug!("cancelled {marked} kvec slots from {idx} in {class} ring");
        Ok(CancelMark::Marked(marked))
    }
}

/// A descriptor pair written by [`KvecPublisher::publish`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishedPair {
    pub class: SizeClass,
    /// Ring slot of the header kvec; the payload kvec follows it.
    pub slot: u16,
    pub head: u16,
}

/// Result of one publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishOutcome {
    pub pair: PublishedPair,
    /// Producer counters were flushed to the peer as part of this publish.
    pub flushed: bool,
}

/// Producer side of the kvec rings, writing into the peer's buffer.
pub struct KvecPublisher<M> {
    mem: M,
    layout: KvecBufLayout,
    last_cnt: [u16; KVEC_RING_COUNT],
    advertised: [u32; KVEC_RING_COUNT],
    outstanding: [u16; KVEC_RING_COUNT],
    pending: [u16; KVEC_RING_COUNT],
    since_flush: u16,
    period: u16,
}

impl<M: MemOps> KvecPublisher<M> {
    /// Attach to a mapped peer buffer, continuing from its current producer counters.
    pub fn new(layout: KvecBufLayout, mem: M) -> Result<Self, KvecError> {
        let mut last_cnt = [0u16; KVEC_RING_COUNT];
        for class in SizeClass::ALL {
            last_cnt[class.index()] = mem
                .load_acquire(layout.ring_idx_addr(class))
                .map_err(|_| KvecError::MemError)?;
        }

        Ok(Self {
            mem,
            layout,
            last_cnt,
            advertised: [0; KVEC_RING_COUNT],
            outstanding: [0; KVEC_RING_COUNT],
            pending: [0; KVEC_RING_COUNT],
            since_flush: 0,
            period: KVEC_INDEX_UPDATE_PERIOD,
        })
    }

    /// Flush producer counters every `period` publishes instead of the default.
    pub fn with_update_period(mut self, period: u16) -> Self {
        self.period = period.max(1);
        self
    }

    #[inline]
    pub fn layout(&self) -> KvecBufLayout {
        self.layout
    }

    #[inline]
    pub fn producer(&self, class: SizeClass) -> u16 {
        self.last_cnt[class.index()]
    }

    /// Advertised maximum of `class` as last written by this publisher.
    #[inline]
    pub fn advertised(&self, class: SizeClass) -> u32 {
        self.advertised[class.index()]
    }

    /// Slots of `class` published and not yet retired.
    #[inline]
    pub fn outstanding(&self, class: SizeClass) -> u16 {
        self.outstanding[class.index()]
    }

    /// Whether a publish would leave counters unflushed.
    #[inline]
    pub fn has_pending(&self) -> bool {
        self.pending.iter().any(|p| *p != 0)
    }

    /// Return `slots` slots of `class` once the consumer is known to be past them.
    pub fn retire(&mut self, class: SizeClass, slots: u16) {
        let o = &mut self.outstanding[class.index()];
        *o = o.saturating_sub(slots);
    }

    /// Forget shadow state. Used when the peer buffer is re-initialized.
    pub fn reset(&mut self) {
        self.last_cnt = [0; KVEC_RING_COUNT];
        self.advertised = [0; KVEC_RING_COUNT];
        self.outstanding = [0; KVEC_RING_COUNT];
        self.pending = [0; KVEC_RING_COUNT];
        self.since_flush = 0;
    }

    fn advertise(&mut self, class: SizeClass, len: u64) -> Result<(), KvecError> {
        let len = u32::try_from(len).unwrap_or(u32::MAX);
        let current = self.advertised[class.index()];
        if current != 0 && current <= len {
            return Ok(());
        }
        if current > len {
            log::warn!("{class} ring: new buffer size {len} is less than advertised size {current}");
        }
        self.advertised[class.index()] = len;
        fence(Ordering::Release);
        self.mem
            .write_val(self.layout.send_max_size_addr(class), len)
            .map_err(|_| KvecError::MemError)
    }

    /// Publish one receive descriptor as a (header, payload) kvec pair.
    ///
    /// `segments` are `(addr, len)` pairs of the descriptor; the second one is
    /// the payload buffer and picks the size class.
    ///
    /// # Errors
    ///
    /// - [`KvecError::BadChain`] - fewer than two segments
    /// - [`KvecError::TooSmall`] - payload buffer below the smallest class
    /// - [`KvecError::RingFull`] - the class has no room for another pair
    #[cfg_attr(feature = "tracing", instrument(err(Debug), skip(self, segments), parent = Span::current(), level = "Trace"))]
    pub fn publish(&mut self, head: u16, segments: &[(u64, u64)]) -> Result<PublishOutcome, KvecError> {
        if segments.len() < 2 {
            return Err(KvecError::BadChain(segments.len()));
        }
        if segments.len() > 2 {
            log::warn!("receive descriptor {head} has {} segments, publishing the first two", segments.len());
        }

        let (hdr_addr, hdr_len) = segments[0];
        let (data_addr, data_len) = segments[1];

        let class = write_ring_for_size(data_len)?;
        let n = self.layout.entries();
        let slot = class.index();
        if self.outstanding[slot] + 2 > n {
            return Err(KvecError::RingFull);
        }

        self.advertise(class, data_len)?;

        let first = counter_to_idx(self.last_cnt[slot], n);
        let second = counter_to_idx(counter_add(self.last_cnt[slot], 1, n), n);
        self.mem
            .write_val(self.layout.slot_addr(class, first), PeerKvec::new(hdr_addr, hdr_len, head))
            .map_err(|_| KvecError::MemError)?;
        self.mem
            .write_val(self.layout.slot_addr(class, second), PeerKvec::new(data_addr, data_len, head))
            .map_err(|_| KvecError::MemError)?;

        self.last_cnt[slot] = counter_add(self.last_cnt[slot], 2, n);
        self.outstanding[slot] += 2;
        self.pending[slot] += 1;
        self.since_flush += 1;

        log::trace!(
            "published head {head} into {class} ring slot {first}, producer now {}",
            self.last_cnt[slot]
        );

        let flushed = if self.since_flush >= self.period {
            self.flush()?
        } else {
            false
        };

        Ok(PublishOutcome {
            pair: PublishedPair { class, slot: first, head },
            flushed,
        })
    }

    /// Write the shadow producer counters of every class with new publishes.
    ///
    /// Returns whether any counter was written.
    pub fn flush(&mut self) -> Result<bool, KvecError> {
        self.since_flush = 0;
        if !self.has_pending() {
            return Ok(false);
        }

        fence(Ordering::Release);
        let mut last_written = None;
        for class in SizeClass::ALL {
            if self.pending[class.index()] == 0 {
                continue;
            }
            let addr = self.layout.ring_idx_addr(class);
            self.mem
                .store_release(addr, self.last_cnt[class.index()])
                .map_err(|_| KvecError::MemError)?;
            self.pending[class.index()] = 0;
            last_written = Some(addr);
        }

        if let Some(addr) = last_written {
            fence(Ordering::SeqCst);
            // read back to push posted writes across the link
            self.mem.load_acquire(addr).map_err(|_| KvecError::MemError)?;
        }
        Ok(true)
    }
}


#[cfg(test)]
mod fuzz {
    use alloc::collections::VecDeque;
    use alloc::vec::Vec;

    use quickcheck::{Arbitrary, Gen, QuickCheck};

    use super::tests::{OwnedBuf, make_publisher, make_rings, pair};
    use super::*;
    use crate::kvec::MTU_DEFAULT;

    const MAX_OPS: usize = 128;

    #[derive(Clone, Debug)]
    enum Op {
        /// publish a small-class descriptor
        Publish,
        Flush,
        Claim,
        /// complete the oldest claim
        Complete,
        /// cancel the n-th published pair still pending
        Cancel(u8),
    }

    impl Arbitrary for Op {
        fn arbitrary(g: &mut Gen) -> Self {
            match u8::arbitrary(g) % 5 {
                0 => Op::Publish,
                1 => Op::Flush,
                2 => Op::Claim,
                3 => Op::Complete,
                4 => Op::Cancel(u8::arbitrary(g)),
                _ => unreachable!(),
            }
        }
    }

    #[derive(Clone, Debug)]
    struct Scenario {
        entries: u16,
        ops: Vec<Op>,
    }

    impl Arbitrary for Scenario {
        fn arbitrary(g: &mut Gen) -> Self {
            let entries = (u16::arbitrary(g) % 16 + 1) * 2;
            let num_ops = usize::arbitrary(g) % MAX_OPS + 1;
            let ops = (0..num_ops).map(|_| Op::arbitrary(g)).collect();
            Scenario { entries, ops }
        }
    }

    #[derive(Clone, Copy, Debug, PartialEq)]
    enum Expect {
        Pending,
        Cancelled,
    }

    fn run_scenario(s: Scenario) -> bool {
        let buf = OwnedBuf::new(s.entries);
        let mut publisher = make_publisher(&buf);
        let mut rings = make_rings(&buf);
        let class = SizeClass::Small;
        let len = MTU_DEFAULT as u64;

        let mut next_head: u16 = 0;
        // published, not claimed: (head, slot, flushed, state)
        let mut pending: VecDeque<(u16, u16, bool, Expect)> = VecDeque::new();
        let mut claimed: VecDeque<ClaimedKvecs> = VecDeque::new();

        for op in &s.ops {
            match op {
                Op::Publish => match publisher.publish(next_head, &pair(next_head, len)) {
                    Ok(out) => {
                        pending.push_back((next_head, out.pair.slot, out.flushed, Expect::Pending));
                        if out.flushed {
                            pending.iter_mut().for_each(|p| p.2 = true);
                        }
                        next_head = next_head.wrapping_add(1) % 1024;
                    }
                    Err(KvecError::RingFull) => {}
                    Err(_) => return false,
                },
                Op::Flush => {
                    if publisher.flush().is_err() {
                        return false;
                    }
                    pending.iter_mut().for_each(|p| p.2 = true);
                }
                Op::Claim => {
                    let expected = pending
                        .iter()
                        .position(|p| p.2 && p.3 == Expect::Pending);
                    match rings.claim_next(class) {
                        Ok(claim) => {
                            let Some(pos) = expected else { return false };
                            let (head, slot, _, _) = pending[pos];
                            if claim.head != head || claim.first_slot != slot || claim.kvecs.len() != 2 {
                                return false;
                            }
                            // everything before it was cancelled and skipped
                            for _ in 0..pos {
                                pending.pop_front();
                                publisher.retire(class, 2);
                            }
                            pending.pop_front();
                            claimed.push_back(claim);
                        }
                        Err(KvecError::WouldBlock) => {
                            if expected.is_some() {
                                return false;
                            }
                            // flushed pairs left are all cancelled and got skipped
                            while pending.front().is_some_and(|p| p.2) {
                                pending.pop_front();
                                publisher.retire(class, 2);
                            }
                        }
                        Err(_) => return false,
                    }
                }
                Op::Complete => {
                    if let Some(claim) = claimed.pop_front() {
                        if rings.release_claim(claim.class, claim.first_slot).is_err() {
                            return false;
                        }
                        publisher.retire(class, 2);
                    }
                }
                Op::Cancel(n) => {
                    let flushed: Vec<usize> = (0..pending.len()).filter(|i| pending[*i].2).collect();
                    if flushed.is_empty() {
                        continue;
                    }
                    let pos = flushed[*n as usize % flushed.len()];
                    let slot = pending[pos].1;
                    match rings.mark_cancelled(class, slot as u32) {
                        // cancelling twice marks the same pair again
                        Ok(CancelMark::Marked(2)) => pending[pos].3 = Expect::Cancelled,
                        Ok(_) | Err(_) => return false,
                    }
                }
            }

            // producer/consumer never further apart than the ring holds
            match rings.available(class) {
                Ok(a) if a <= s.entries => {}
                _ => return false,
            }
        }

        true
    }

    #[test]
    fn prop_publish_claim_cancel() {
        #[cfg(miri)]
        let tests = 1;
        #[cfg(not(miri))]
        let tests = 200;

        QuickCheck::new()
            .tests(tests)
            .quickcheck(run_scenario as fn(Scenario) -> bool);
    }
}
