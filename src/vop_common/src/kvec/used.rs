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

//! Used ring: completion records flowing back to the publisher.

use core::sync::atomic::{Ordering, fence};

use super::{KvecBufLayout, KvecError, MemOps, PeerUsedKvec, counter_add, counter_to_idx, counter_used};

/// Writes completion records into the peer's used ring.
///
/// One writer per ring. The host serializes concurrent completions with a lock.
pub struct UsedRingWriter<M> {
    mem: M,
    layout: KvecBufLayout,
    last_cnt: u16,
}

impl<M: MemOps> UsedRingWriter<M> {
    /// Attach to a mapped peer buffer, continuing from its current counter.
    pub fn new(layout: KvecBufLayout, mem: M) -> Result<Self, KvecError> {
        let last_cnt = mem
            .load_acquire(layout.used_idx_addr())
            .map_err(|_| KvecError::MemError)?;
        Ok(Self { mem, layout, last_cnt })
    }

    #[inline]
    pub fn producer(&self) -> u16 {
        self.last_cnt
    }

    pub fn reset(&mut self) {
        self.last_cnt = 0;
    }

    /// Append `(head, len)` and publish the new counter.
    pub fn push(&mut self, head: u16, len: u32) -> Result<u16, KvecError> {
        let n = self.layout.entries();
        let idx = counter_to_idx(self.last_cnt, n);

        self.mem
            .write_val(self.layout.used_slot_addr(idx), PeerUsedKvec::new(head, len))
            .map_err(|_| KvecError::MemError)?;

        self.last_cnt = counter_add(self.last_cnt, 1, n);
        self.mem
            .store_release(self.layout.used_idx_addr(), self.last_cnt)
            .map_err(|_| KvecError::MemError)?;

        fence(Ordering::SeqCst);
        // flush posted writes
        self.mem
            .load_acquire(self.layout.used_idx_addr())
            .map_err(|_| KvecError::MemError)?;

        Ok(idx)
    }
}

/// Reads completion records from the local used ring.
pub struct UsedRingReader<M> {
    mem: M,
    layout: KvecBufLayout,
    last_cnt: u16,
}

impl<M: MemOps> UsedRingReader<M> {
    pub fn new(layout: KvecBufLayout, mem: M) -> Self {
        Self {
            mem,
            layout,
            last_cnt: 0,
        }
    }

    pub fn reset(&mut self) {
        self.last_cnt = 0;
    }

    fn producer(&self) -> Result<u16, KvecError> {
        self.mem
            .load_acquire(self.layout.used_idx_addr())
            .map_err(|_| KvecError::MemError)
    }

    /// Records written and not yet consumed.
    pub fn pending(&self) -> Result<u16, KvecError> {
        let n = self.layout.entries();
        let used = counter_used(self.last_cnt, self.producer()?, n);
        if used > n {
            return Err(KvecError::InvalidState);
        }
        Ok(used)
    }

    pub fn has_pending(&self) -> Result<bool, KvecError> {
        Ok(self.pending()? != 0)
    }

    /// Next record, or `None` once the ring is drained.
    pub fn pop(&mut self) -> Result<Option<PeerUsedKvec>, KvecError> {
        if self.pending()? == 0 {
            return Ok(None);
        }

        let n = self.layout.entries();
        let idx = counter_to_idx(self.last_cnt, n);
        let rec: PeerUsedKvec = self
            .mem
            .read_val(self.layout.used_slot_addr(idx))
            .map_err(|_| KvecError::MemError)?;
        self.last_cnt = counter_add(self.last_cnt, 1, n);
        Ok(Some(rec))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kvec::ring::tests::OwnedBuf;

    #[test]
    fn records_arrive_in_write_order() {
        let buf = OwnedBuf::new(4);
        let mut writer = UsedRingWriter::new(buf.layout(), buf.mem()).unwrap();
        let mut reader = UsedRingReader::new(buf.layout(), buf.mem());

        assert_eq!(reader.pop(), Ok(None));

        writer.push(3, 1500).unwrap();
        writer.push(1, 0).unwrap();
        assert_eq!(reader.pending(), Ok(2));

        let a = reader.pop().unwrap().unwrap();
        let b = reader.pop().unwrap().unwrap();
        assert_eq!((a.head, a.len), (3, 1500));
        assert_eq!((b.head, b.len), (1, 0));
        assert_eq!(reader.pop(), Ok(None));
    }

    #[test]
    fn wraps_and_detects_overrun() {
        let buf = OwnedBuf::new(2);
        let mut writer = UsedRingWriter::new(buf.layout(), buf.mem()).unwrap();
        let mut reader = UsedRingReader::new(buf.layout(), buf.mem());

        for head in 0..7u16 {
            writer.push(head, head as u32 * 10).unwrap();
            let rec = reader.pop().unwrap().unwrap();
            assert_eq!(rec.head, head);
            assert_eq!(rec.len, head as u32 * 10);
        }

        for head in 0..3u16 {
            writer.push(head, 0).unwrap();
        }
        assert_eq!(reader.pending(), Err(KvecError::InvalidState));
    }

    #[test]
    fn writer_resumes_from_existing_counter() {
        let buf = OwnedBuf::new(4);
        let mut first = UsedRingWriter::new(buf.layout(), buf.mem()).unwrap();
        first.push(1, 1).unwrap();
        let second = UsedRingWriter::new(buf.layout(), buf.mem()).unwrap();
        assert_eq!(second.producer(), 1);
    }
}
