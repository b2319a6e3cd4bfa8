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

use std::collections::{HashMap, VecDeque};
use std::sync::{Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use smallvec::SmallVec;
use tracing::{Span, debug, instrument, warn};
use vop_common::kvec::{
    CancelMark, CancelStatus, ClaimedKvecs, KVEC_RING_COUNT, KvecBufLayout, KvecError, KvecFlags,
    KvecPublisher, KvecRings, MemOps, PeerUsedKvec, PublishOutcome, SizeClass, UsedRingReader,
    UsedRingWriter, cancel_status, complete_cancel_request, pending_cancel_request,
    post_cancel_request, write_ring_for_size,
};

use crate::error::VopError;
use crate::metrics::{CounterMetric, EmittableMetric};
use crate::queue::Descriptor;
use crate::Result;

/// Extra time a cancellation requester allows on top of the responder's own wait.
const CANCEL_ANSWER_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PairState {
    Live,
    Done,
    Cancelled,
}

#[derive(Debug)]
struct PublishedEntry {
    head: u16,
    state: PairState,
}

/// Publisher plus the bookkeeping of what the peer still holds.
struct PublishState<M> {
    publisher: KvecPublisher<M>,
    /// Publish order per class; pairs are retired from the front once done.
    order: [VecDeque<PublishedEntry>; KVEC_RING_COUNT],
    /// Live pairs by receive head.
    by_head: HashMap<u16, (SizeClass, u16)>,
}

impl<M: MemOps> PublishState<M> {
    fn set_state(&mut self, class: SizeClass, head: u16, state: PairState) {
        if let Some(e) = self.order[class.index()]
            .iter_mut()
            .find(|e| e.head == head && e.state == PairState::Live)
        {
            e.state = state;
        }
    }

    /// A used record for `head` means the consumer is past every earlier pair.
    fn complete(&mut self, head: u16) -> bool {
        let Some((class, _)) = self.by_head.remove(&head) else {
            return false;
        };
        let order = &mut self.order[class.index()];
        for e in order.iter_mut() {
            if e.head == head && e.state == PairState::Live {
                e.state = PairState::Done;
                break;
            }
            if e.state == PairState::Cancelled {
                e.state = PairState::Done;
            }
        }
        let mut retired = 0u16;
        while order.front().is_some_and(|e| e.state == PairState::Done) {
            order.pop_front();
            retired += 2;
        }
        self.publisher.retire(class, retired);
        true
    }
}

/// Host side of the kvec exchange with one peer.
///
/// Claims come from the rings in the local buffer; publishes, used records
/// and cancellation requests go to the peer's buffer.
pub struct KvecExchange<M> {
    mem: M,
    local: KvecBufLayout,
    remote: KvecBufLayout,
    claims: Mutex<KvecRings<M>>,
    claim_cv: Condvar,
    publish: Mutex<PublishState<M>>,
    used_writer: spin::Mutex<UsedRingWriter<M>>,
    used_reader: Mutex<UsedRingReader<M>>,
    cancel: Mutex<()>,
}

impl<M: MemOps<Error = VopError> + Clone> KvecExchange<M> {
    pub fn new(
        mem: M,
        local: KvecBufLayout,
        remote: KvecBufLayout,
        update_period: u16,
    ) -> Result<Self> {
        let publisher = KvecPublisher::new(remote, mem.clone())?.with_update_period(update_period);
        Ok(Self {
            claims: Mutex::new(KvecRings::new(local, mem.clone())),
            claim_cv: Condvar::new(),
            publish: Mutex::new(PublishState {
                publisher,
                order: Default::default(),
                by_head: HashMap::new(),
            }),
            used_writer: spin::Mutex::new(UsedRingWriter::new(remote, mem.clone())?),
            used_reader: Mutex::new(UsedRingReader::new(local, mem.clone())),
            cancel: Mutex::new(()),
            mem,
            local,
            remote,
        })
    }

    pub fn local_layout(&self) -> KvecBufLayout {
        self.local
    }

    pub fn remote_layout(&self) -> KvecBufLayout {
        self.remote
    }

    // Sending side

    /// Size class for a transfer needing `len` bytes, from what the peer advertised.
    pub fn select_class(&self, len: usize) -> Result<SizeClass> {
        Ok(self.claims.lock()?.select_ring_for_size(len)?)
    }

    pub fn claim(&self, class: SizeClass) -> Result<ClaimedKvecs> {
        Ok(self.claims.lock()?.claim_next(class)?)
    }

    pub fn has_available(&self, class: SizeClass) -> Result<bool> {
        Ok(self.claims.lock()?.has_available(class)?)
    }

    /// Clear the claim mark and wake cancellation waiters.
    pub fn release_claim(&self, class: SizeClass, first_slot: u16) -> Result<()> {
        let res = self.claims.lock()?.release_claim(class, first_slot);
        self.claim_cv.notify_all();
        Ok(res?)
    }

    /// Append a used record to the peer's used ring.
    pub fn push_used(&self, head: u16, len: u32) -> Result<()> {
        self.used_writer.lock().push(head, len)?;
        Ok(())
    }

    // Receiving side

    /// Whether `desc` can be taken from the receive queue now.
    ///
    /// Descriptors that will be rejected are always accepted so they leave the queue.
    pub fn can_publish(&self, desc: &Descriptor) -> bool {
        let Some(payload) = desc.segments.get(1) else {
            return true;
        };
        let Ok(class) = write_ring_for_size(payload.len) else {
            return true;
        };
        match self.publish.lock() {
            Ok(state) => {
                state.publisher.outstanding(class) + 2 <= state.publisher.layout().entries()
            }
            Err(_) => false,
        }
    }

    /// Publish a receive descriptor into the peer's rings.
    #[instrument(err(Debug), skip(self, desc), fields(head = desc.head), parent = Span::current(), level = "Trace")]
    pub fn publish(&self, desc: &Descriptor) -> Result<PublishOutcome> {
        let segments: SmallVec<[(u64, u64); 4]> =
            desc.segments.iter().map(|s| (s.addr, s.len)).collect();
        let mut state = self.publish.lock()?;
        let outcome = state.publisher.publish(desc.head, &segments)?;
        let pair = outcome.pair;
        state.order[pair.class.index()].push_back(PublishedEntry {
            head: pair.head,
            state: PairState::Live,
        });
        state.by_head.insert(pair.head, (pair.class, pair.slot));
        Ok(outcome)
    }

    /// Write pending producer counters to the peer. Returns whether any were written.
    pub fn flush(&self) -> Result<bool> {
        Ok(self.publish.lock()?.publisher.flush()?)
    }

    pub fn has_used_pending(&self) -> Result<bool> {
        Ok(self.used_reader.lock()?.has_pending()?)
    }

    /// Consume every used record, handing those of live pairs to `f`.
    ///
    /// Records naming a head that is not published are logged and dropped.
    pub fn drain_used(&self, mut f: impl FnMut(PeerUsedKvec)) -> Result<usize> {
        let mut reader = self.used_reader.lock()?;
        let mut delivered = 0;
        while let Some(rec) = reader.pop()? {
            let known = self.publish.lock()?.complete(rec.head);
            if !known {
                warn!("used record for head {} that is not published, dropping", rec.head);
                continue;
            }
            f(rec);
            delivered += 1;
        }
        Ok(delivered)
    }

    /// Ring position of the live pair published for `head`.
    pub fn published_slot(&self, head: u16) -> Result<Option<(SizeClass, u16)>> {
        Ok(self.publish.lock()?.by_head.get(&head).copied())
    }

    pub fn live_heads(&self) -> Result<Vec<u16>> {
        let mut heads: Vec<u16> = self.publish.lock()?.by_head.keys().copied().collect();
        heads.sort_unstable();
        Ok(heads)
    }

    /// Drop `head` as cancelled if it is still live. Returns whether it was.
    pub fn forget_cancelled(&self, head: u16) -> Result<bool> {
        let mut state = self.publish.lock()?;
        match state.by_head.remove(&head) {
            Some((class, _)) => {
                state.set_state(class, head, PairState::Cancelled);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // Cancellation

    /// Ask the peer to cancel the pair published for `head`.
    ///
    /// `raise` signals the peer once the request is in place. Returns
    /// [`CancelStatus::Timeout`] when no answer arrives in `timeout` plus a grace second.
    #[instrument(err(Debug), skip(self, raise), parent = Span::current(), level = "Trace")]
    pub fn request_cancel(
        &self,
        head: u16,
        timeout: Duration,
        raise: impl FnOnce() -> Result<()>,
    ) -> Result<CancelStatus> {
        let _serial = self.cancel.lock()?;
        let Some((class, slot)) = self.published_slot(head)? else {
            debug!("cancel of head {head} which is not published");
            return Ok(CancelStatus::InvalidRequest);
        };

        post_cancel_request(&self.mem, &self.remote, class, slot)?;
        raise()?;

        let deadline = Instant::now() + timeout + CANCEL_ANSWER_GRACE;
        loop {
            if let Some(status) = cancel_status(&self.mem, &self.remote)? {
                debug!("cancel of head {head} answered {}", status.as_str());
                return Ok(status);
            }
            if Instant::now() >= deadline {
                warn!("cancel of head {head} unanswered after {timeout:?}");
                return Ok(CancelStatus::Timeout);
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Answer a cancellation request waiting in the local header, if any.
    ///
    /// A claimed slot is waited on for up to `timeout` and never marked.
    #[instrument(err(Debug), skip(self), parent = Span::current(), level = "Trace")]
    pub fn service_cancel(&self, timeout: Duration) -> Result<Option<CancelStatus>> {
        let Some(req) = pending_cancel_request(&self.mem, &self.local)? else {
            return Ok(None);
        };

        let status = match req.class() {
            None => CancelStatus::InvalidRequest,
            Some(class) => {
                let mut rings = self.claims.lock()?;
                match rings.mark_cancelled(class, req.index) {
                    Ok(CancelMark::Marked(_)) => CancelStatus::Ok,
                    Ok(CancelMark::EmptyRing | CancelMark::NotPublished)
                    | Err(KvecError::InvalidIndex(_)) => CancelStatus::InvalidRequest,
                    Ok(CancelMark::InUse) => {
                        let slot = req.index as u16;
                        let (_rings, res) = self.claim_cv.wait_timeout_while(rings, timeout, |r| {
                            r.slot_flags(class, slot)
                                .map(|f| f.contains(KvecFlags::IN_USE))
                                .unwrap_or(false)
                        })?;
                        if res.timed_out() {
                            CancelStatus::Timeout
                        } else {
                            CancelStatus::Ok
                        }
                    }
                    Err(e) => {
                        complete_cancel_request(&self.mem, &self.local, CancelStatus::Error)?;
                        return Err(e.into());
                    }
                }
            }
        };

        complete_cancel_request(&self.mem, &self.local, status)?;
        CounterMetric::cancellation(status.as_str()).emit();
        debug!(
            "answered cancel of ring {} index {}: {}",
            req.ring_id,
            req.index,
            status.as_str()
        );
        Ok(Some(status))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use smallvec::smallvec;

    use super::*;
    use crate::hal::HardwareOps;
    use crate::hal::sim::arena::SimMem;
    use crate::hal::sim::{SimEndpoint, SimLink, SimLinkConfig};
    use crate::queue::Segment;

    const ENTRIES: u16 = 8;

    struct Pair {
        _link: SimLink,
        ep: Arc<SimEndpoint>,
        a: Arc<KvecExchange<SimMem>>,
        b: Arc<KvecExchange<SimMem>>,
    }

    fn pair() -> Pair {
        let link = SimLink::new(SimLinkConfig::default()).unwrap();
        let (ep, _) = link.endpoints();
        let size = KvecBufLayout::query_size(ENTRIES as usize) as u64;
        let buf_a = ep.alloc_dma(size, 4096).unwrap();
        let buf_b = ep.alloc_dma(size, 4096).unwrap();
        let la = unsafe { KvecBufLayout::from_base(buf_a, ENTRIES) }.unwrap();
        let lb = unsafe { KvecBufLayout::from_base(buf_b, ENTRIES) }.unwrap();
        let a = Arc::new(KvecExchange::new(ep.mem(), la, lb, 1).unwrap());
        let b = Arc::new(KvecExchange::new(ep.mem(), lb, la, 1).unwrap());
        Pair { _link: link, ep, a, b }
    }

    fn rx_desc(head: u16, addr: u64) -> Descriptor {
        Descriptor {
            head,
            segments: smallvec![Segment::new(addr, 16), Segment::new(addr + 64, 2048)],
        }
    }

    #[test]
    fn publish_claim_used_round_trip() {
        let p = pair();
        let out = p.b.publish(&rx_desc(5, 0x40_0000)).unwrap();
        assert_eq!(out.pair.class, SizeClass::Small);
        assert!(out.flushed);
        assert_eq!(p.b.published_slot(5).unwrap(), Some((SizeClass::Small, 0)));

        assert_eq!(p.a.select_class(1600).unwrap(), SizeClass::Small);
        let claim = p.a.claim(SizeClass::Small).unwrap();
        assert_eq!(claim.head, 5);
        assert_eq!(claim.kvecs.len(), 2);
        assert_eq!(claim.kvecs[1].addr, 0x40_0040);
        assert!(matches!(
            p.a.claim(SizeClass::Small),
            Err(VopError::Kvec(KvecError::WouldBlock))
        ));

        p.a.push_used(5, 1016).unwrap();
        p.a.release_claim(claim.class, claim.first_slot).unwrap();

        assert!(p.b.has_used_pending().unwrap());
        let mut seen = Vec::new();
        assert_eq!(p.b.drain_used(|r| seen.push((r.head, r.len))).unwrap(), 1);
        assert_eq!(seen, [(5, 1016)]);
        assert!(p.b.live_heads().unwrap().is_empty());
    }

    #[test]
    fn ring_capacity_is_respected() {
        let p = pair();
        for head in 0..(ENTRIES / 2) {
            assert!(p.b.can_publish(&rx_desc(head, 0x40_0000)));
            p.b.publish(&rx_desc(head, 0x40_0000)).unwrap();
        }
        assert!(!p.b.can_publish(&rx_desc(9, 0x40_0000)));
        assert!(matches!(
            p.b.publish(&rx_desc(9, 0x40_0000)),
            Err(VopError::Kvec(KvecError::RingFull))
        ));

        // a too small buffer is always taken so it can be rejected
        let mut small = rx_desc(10, 0x40_0000);
        small.segments[1].len = 100;
        assert!(p.b.can_publish(&small));

        // completing the second pair retires nothing until the first is done
        let c0 = p.a.claim(SizeClass::Small).unwrap();
        let c1 = p.a.claim(SizeClass::Small).unwrap();
        p.a.push_used(c1.head, 0).unwrap();
        p.b.drain_used(|_| {}).unwrap();
        assert!(!p.b.can_publish(&rx_desc(9, 0x40_0000)));
        p.a.push_used(c0.head, 0).unwrap();
        p.b.drain_used(|_| {}).unwrap();
        p.b.publish(&rx_desc(9, 0x40_0000)).unwrap();
        p.b.publish(&rx_desc(11, 0x40_0000)).unwrap();
    }

    #[test]
    fn unknown_used_records_are_dropped() {
        let p = pair();
        p.a.push_used(3, 10).unwrap();
        let mut calls = 0;
        assert_eq!(p.b.drain_used(|_| calls += 1).unwrap(), 0);
        assert_eq!(calls, 0);
        assert!(!p.b.has_used_pending().unwrap());
    }

    #[test]
    fn cancel_before_claim() {
        let p = pair();
        p.b.publish(&rx_desc(1, 0x40_0000)).unwrap();
        p.b.publish(&rx_desc(2, 0x50_0000)).unwrap();

        let a = p.a.clone();
        let status = p
            .b
            .request_cancel(1, Duration::from_secs(1), move || {
                assert_eq!(
                    a.service_cancel(Duration::from_secs(1)).unwrap(),
                    Some(CancelStatus::Ok)
                );
                Ok(())
            })
            .unwrap();
        assert_eq!(status, CancelStatus::Ok);
        assert!(p.b.forget_cancelled(1).unwrap());
        assert!(!p.b.forget_cancelled(1).unwrap());

        // the cancelled pair is skipped
        assert_eq!(p.a.claim(SizeClass::Small).unwrap().head, 2);
        assert_eq!(p.a.service_cancel(Duration::ZERO).unwrap(), None);
    }

    #[test]
    fn cancel_after_claim_waits_for_release() {
        let p = pair();
        p.b.publish(&rx_desc(4, 0x40_0000)).unwrap();
        let claim = p.a.claim(SizeClass::Small).unwrap();

        let a = p.a.clone();
        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            a.push_used(claim.head, 100).unwrap();
            a.release_claim(claim.class, claim.first_slot).unwrap();
        });
        let a = p.a.clone();
        let status = p
            .b
            .request_cancel(4, Duration::from_secs(2), move || {
                thread::spawn(move || a.service_cancel(Duration::from_secs(2)));
                Ok(())
            })
            .unwrap();
        releaser.join().unwrap();
        assert_eq!(status, CancelStatus::Ok);

        // consumed: the used record arrives and the pair is no longer live
        let mut used = Vec::new();
        p.b.drain_used(|r| used.push(r.head)).unwrap();
        assert_eq!(used, [4]);
        assert!(!p.b.forget_cancelled(4).unwrap());
    }

    #[test]
    fn cancel_times_out_on_a_stuck_claim() {
        let p = pair();
        p.b.publish(&rx_desc(6, 0x40_0000)).unwrap();
        let _claim = p.a.claim(SizeClass::Small).unwrap();
        let a = p.a.clone();
        let status = p
            .b
            .request_cancel(6, Duration::from_millis(20), move || {
                a.service_cancel(Duration::from_millis(20)).unwrap();
                Ok(())
            })
            .unwrap();
        assert_eq!(status, CancelStatus::Timeout);
    }

    #[test]
    fn invalid_cancel_requests() {
        let p = pair();
        assert_eq!(
            p.b.request_cancel(7, Duration::ZERO, || Ok(())).unwrap(),
            CancelStatus::InvalidRequest
        );

        // a request against an empty ring
        post_cancel_request(&p.ep.mem(), &p.a.local_layout(), SizeClass::Jumbo, 0).unwrap();
        assert_eq!(
            p.a.service_cancel(Duration::ZERO).unwrap(),
            Some(CancelStatus::InvalidRequest)
        );
        post_cancel_request(&p.ep.mem(), &p.a.local_layout(), SizeClass::Small, 99).unwrap();
        assert_eq!(
            p.a.service_cancel(Duration::ZERO).unwrap(),
            Some(CancelStatus::InvalidRequest)
        );
    }
}
